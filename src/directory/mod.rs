//! Clients for the external user directory: device status updates, batch
//! active-time publication, and credential lookups.
//!
//! The directory is consumed through traits so the gateway core stays
//! testable; the production impls speak JSON over HTTP to the directory's
//! internal API (`USER_RPC_ADDR`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::auth::CredentialStore;
use crate::presence::ActiveTimeItem;

/// Wire values for the directory's device-status field. Other values are
/// reserved upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn code(self) -> i32 {
        match self {
            DeviceStatus::Online => 0,
            DeviceStatus::Offline => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn update_device_status(
        &self,
        user_uuid: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<()>;

    async fn batch_update_active_time(&self, items: &[ActiveTimeItem]) -> Result<()>;
}

// ─── HTTP implementation ──────────────────────────────────────────────────────

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct DeviceStatusBody<'a> {
    user_uuid: &'a str,
    device_id: &'a str,
    status: i32,
}

#[derive(Serialize)]
struct ActiveTimeBody<'a> {
    items: &'a [ActiveTimeItem],
}

/// JSON-over-HTTP client for the user directory's internal API.
pub struct HttpDirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDirectoryClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build directory HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn update_device_status(
        &self,
        user_uuid: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<()> {
        let url = format!("{}/internal/v1/device-status", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&DeviceStatusBody {
                user_uuid,
                device_id,
                status: status.code(),
            })
            .send()
            .await
            .context("device-status request failed")?;
        resp.error_for_status()
            .context("device-status request rejected")?;
        Ok(())
    }

    async fn batch_update_active_time(&self, items: &[ActiveTimeItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let url = format!("{}/internal/v1/active-time", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&ActiveTimeBody { items })
            .send()
            .await
            .context("active-time request failed")?;
        resp.error_for_status()
            .context("active-time request rejected")?;
        Ok(())
    }
}

// ─── Routing table ───────────────────────────────────────────────────────────

/// The external routing table push-job consults to find the gateway node
/// holding a device's connection. Connect publishes its own address on
/// register and withdraws it on unregister; the exact key format behind
/// the endpoint is a deployment contract.
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn publish(&self, user_uuid: &str, device_id: &str, node_addr: &str) -> Result<()>;
    async fn withdraw(&self, user_uuid: &str, device_id: &str, node_addr: &str) -> Result<()>;
}

#[derive(Serialize)]
struct RouteBody<'a> {
    user_uuid: &'a str,
    device_id: &'a str,
    node_addr: &'a str,
}

pub struct HttpRouteTable {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRouteTable {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build route table HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RouteTable for HttpRouteTable {
    async fn publish(&self, user_uuid: &str, device_id: &str, node_addr: &str) -> Result<()> {
        let url = format!("{}/internal/v1/routes", self.base_url);
        let resp = self
            .http
            .put(&url)
            .json(&RouteBody {
                user_uuid,
                device_id,
                node_addr,
            })
            .send()
            .await
            .context("route publish failed")?;
        resp.error_for_status().context("route publish rejected")?;
        Ok(())
    }

    async fn withdraw(&self, user_uuid: &str, device_id: &str, node_addr: &str) -> Result<()> {
        let url = format!("{}/internal/v1/routes", self.base_url);
        let resp = self
            .http
            .delete(&url)
            .json(&RouteBody {
                user_uuid,
                device_id,
                node_addr,
            })
            .send()
            .await
            .context("route withdraw failed")?;
        // A route someone else already replaced is not an error worth
        // surfacing; the table keeps last-writer-wins semantics.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status().context("route withdraw rejected")?;
        Ok(())
    }
}

/// Credential lookups through the directory, which fronts the store at
/// `auth:at:{user_uuid}:{device_id}`. 404 means "no credential" — a
/// distinct outcome from a transport failure, which the verifier treats
/// as fail-open.
pub struct HttpCredentialStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCredentialStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build credential HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CredentialStore for HttpCredentialStore {
    async fn stored_token_hash(
        &self,
        user_uuid: &str,
        device_id: &str,
    ) -> Result<Option<String>> {
        let url = format!(
            "{}/internal/v1/credentials/{}/{}",
            self.base_url, user_uuid, device_id
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("credential request failed")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .context("credential request rejected")?;
        #[derive(serde::Deserialize)]
        struct Body {
            hash: String,
        }
        let body: Body = resp.json().await.context("credential response malformed")?;
        Ok(Some(body.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_codes() {
        assert_eq!(DeviceStatus::Online.code(), 0);
        assert_eq!(DeviceStatus::Offline.code(), 1);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = HttpDirectoryClient::new("http://dir:9090/").expect("client");
        assert_eq!(client.base_url, "http://dir:9090");
    }
}
