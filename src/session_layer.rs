//! Contract with the WhatsApp session servers ("sidecars").
//!
//! Each backing server runs the actual WhatsApp multi-device sessions. The
//! gateway only asks it to pair, reconnect, log out, send and look up numbers,
//! and hears about connection changes through the status webhook.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

pub const TOKEN_HEADER: &str = "X-Sidecar-Token";

/// A pairing QR as produced by the session server: the raw pairing string and
/// a rendered image (bare base64 or a `data:` URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrArtifact {
    #[serde(alias = "qr")]
    pub code: String,
    pub base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NumberLookup {
    pub exists: bool,
    pub jid: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage<'a> {
    pub to: &'a str,
    pub text: Option<&'a str>,
    pub attachment_url: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHealth {
    pub ping_ms: i64,
    pub uptime_seconds: Option<i64>,
}

#[async_trait]
pub trait SessionLayer: Send + Sync {
    async fn start_pairing(&self, server_url: &str, device_id: &str) -> Result<QrArtifact>;

    async fn reconnect(&self, server_url: &str, device_id: &str) -> Result<()>;

    async fn logout(&self, server_url: &str, device_id: &str) -> Result<()>;

    /// Returns the provider message id when the session server reports one.
    async fn send(
        &self,
        server_url: &str,
        device_id: &str,
        message: &OutgoingMessage<'_>,
    ) -> Result<Option<String>>;

    async fn check_number(&self, server_url: &str, device_id: &str, phone: &str)
        -> Result<NumberLookup>;

    async fn probe(&self, server_url: &str) -> Result<ServerHealth>;
}

#[derive(Clone)]
pub struct SidecarClient {
    http: Client,
    token: Option<String>,
}

impl SidecarClient {
    pub fn new(token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, token })
    }

    fn session_url(server_url: &str, device_id: &str, action: &str) -> String {
        let id = utf8_percent_encode(device_id, NON_ALPHANUMERIC);
        let base = server_url.trim_end_matches('/');
        if action.is_empty() {
            format!("{}/sessions/{}", base, id)
        } else {
            format!("{}/sessions/{}/{}", base, id, action)
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.as_ref() {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("sidecar {} failed: {} {}", what, status, body))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendReply {
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthReply {
    uptime: Option<f64>,
}

#[async_trait]
impl SessionLayer for SidecarClient {
    async fn start_pairing(&self, server_url: &str, device_id: &str) -> Result<QrArtifact> {
        let url = Self::session_url(server_url, device_id, "pair");
        let resp = self.authorize(self.http.post(url)).send().await?;
        let resp = Self::expect_success(resp, "pair").await?;
        let artifact: QrArtifact = resp.json().await?;
        if artifact.code.is_empty() || artifact.base64.is_empty() {
            return Err(anyhow!("sidecar returned an empty QR artifact"));
        }
        Ok(artifact)
    }

    async fn reconnect(&self, server_url: &str, device_id: &str) -> Result<()> {
        let url = Self::session_url(server_url, device_id, "reconnect");
        let resp = self.authorize(self.http.post(url)).send().await?;
        Self::expect_success(resp, "reconnect").await?;
        Ok(())
    }

    async fn logout(&self, server_url: &str, device_id: &str) -> Result<()> {
        let url = Self::session_url(server_url, device_id, "");
        let resp = self.authorize(self.http.delete(url)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(resp, "logout").await?;
        Ok(())
    }

    async fn send(
        &self,
        server_url: &str,
        device_id: &str,
        message: &OutgoingMessage<'_>,
    ) -> Result<Option<String>> {
        let url = Self::session_url(server_url, device_id, "send");
        let resp = self
            .authorize(self.http.post(url).json(message))
            .send()
            .await?;
        let resp = Self::expect_success(resp, "send").await?;
        let reply = resp
            .json::<SendReply>()
            .await
            .unwrap_or(SendReply { message_id: None });
        Ok(reply.message_id)
    }

    async fn check_number(
        &self,
        server_url: &str,
        device_id: &str,
        phone: &str,
    ) -> Result<NumberLookup> {
        let url = Self::session_url(server_url, device_id, "check");
        let resp = self
            .authorize(self.http.post(url).json(&json!({ "phone": phone })))
            .send()
            .await?;
        let resp = Self::expect_success(resp, "number check").await?;
        Ok(resp.json().await?)
    }

    async fn probe(&self, server_url: &str) -> Result<ServerHealth> {
        let url = format!("{}/health", server_url.trim_end_matches('/'));
        let started = Instant::now();
        let resp = self.authorize(self.http.get(url)).send().await?;
        let ping_ms = started.elapsed().as_millis() as i64;
        let resp = Self::expect_success(resp, "health").await?;
        let reply = resp.json::<HealthReply>().await.unwrap_or(HealthReply { uptime: None });
        Ok(ServerHealth {
            ping_ms,
            uptime_seconds: reply.uptime.map(|u| u as i64),
        })
    }
}
