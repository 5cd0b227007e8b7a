//! Outbound SMS transport.
//!
//! Sends are fire-and-forget per recipient: each result is logged but never
//! fails the overall request. With no transport configured the service runs
//! log-only, which is also what tests use.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;

/// Message transport provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message. The provider may itself suppress delivery for
    /// certain recipients; that surfaces as `Suppressed`.
    async fn send(&self, to: &str, body: &str) -> Result<(), TransportError>;
}

/// Twilio-shaped REST transport.
pub struct SmsTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl SmsTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Transport for SmsTransport {
    async fn send(&self, to: &str, body: &str) -> Result<(), TransportError> {
        let url = format!(
            "{}/Accounts/{}/Messages.json",
            self.config.api_url, self.config.account_id
        );
        let params = [
            ("To", to),
            ("From", self.config.from_number.as_str()),
            ("Body", body),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.account_id,
                Some(self.config.auth_token.expose_secret()),
            )
            .timeout(self.config.timeout)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        recipient: to.to_string(),
                        timeout: self.config.timeout,
                    }
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            info!(recipient = to, "Message sent");
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        // Providers reject instead of delivering for opted-out numbers.
        if status.as_u16() == 400 && detail.contains("not a valid") {
            return Err(TransportError::Suppressed {
                recipient: to.to_string(),
                reason: detail.chars().take(200).collect(),
            });
        }
        warn!(recipient = to, %status, "Message send failed");
        Err(TransportError::SendFailed {
            recipient: to.to_string(),
            reason: format!("status {status}"),
        })
    }
}

/// Log-only transport used when no provider is configured.
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn send(&self, to: &str, body: &str) -> Result<(), TransportError> {
        info!(recipient = to, body, "Transport disabled, logging only");
        Ok(())
    }
}
