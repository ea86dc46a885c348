//! Shared fixtures for integration tests: a recording directory client,
//! a context builder, and an HS256 token mint.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use connectd::config::GatewayConfig;
use connectd::directory::{DeviceStatus, DirectoryClient};
use connectd::presence::ActiveTimeItem;
use connectd::GatewayContext;

pub const TEST_SECRET: &str = "integration-secret";

/// Records every directory call instead of performing RPC.
#[derive(Default)]
pub struct RecordingDirectory {
    pub statuses: Mutex<Vec<(String, String, DeviceStatus)>>,
    pub batches: Mutex<Vec<ActiveTimeItem>>,
}

#[async_trait]
impl DirectoryClient for RecordingDirectory {
    async fn update_device_status(
        &self,
        user_uuid: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> anyhow::Result<()> {
        self.statuses
            .lock()
            .expect("statuses lock")
            .push((user_uuid.to_string(), device_id.to_string(), status));
        Ok(())
    }

    async fn batch_update_active_time(&self, items: &[ActiveTimeItem]) -> anyhow::Result<()> {
        self.batches
            .lock()
            .expect("batches lock")
            .extend_from_slice(items);
        Ok(())
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        token_secret: Some(TEST_SECRET.to_string()),
        ..GatewayConfig::default()
    }
}

pub fn build_context(cfg: GatewayConfig) -> (Arc<GatewayContext>, Arc<RecordingDirectory>) {
    let directory = Arc::new(RecordingDirectory::default());
    let ctx = GatewayContext::build(cfg, directory.clone(), None, None).expect("context");
    (ctx, directory)
}

/// Mint an HS256 token the gateway's verifier accepts.
pub fn mint_token(secret: &str, user_uuid: &str, device_id: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        format!(r#"{{"user_uuid":"{user_uuid}","device_id":"{device_id}"}}"#).as_bytes(),
    );
    let signing_input = format!("{header}.{claims}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(signing_input.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{sig}")
}
