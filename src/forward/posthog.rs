//! Product-analytics capture relay
//! Mission: Mirror every ingested tracking event into the product
//! analytics pipeline

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

struct PosthogConfig {
    api_key: String,
    host: String,
}

/// Capture-endpoint relay. Disabled when no API key is configured.
pub struct PosthogForwarder {
    client: Client,
    config: Option<PosthogConfig>,
}

impl PosthogForwarder {
    pub fn new(client: Client, api_key: Option<String>, host: String) -> Self {
        let config = match api_key {
            Some(api_key) => {
                info!("📈 Product-analytics relay active ({})", host);
                Some(PosthogConfig { api_key, host })
            }
            None => {
                info!("Product-analytics relay disabled (no API key configured)");
                None
            }
        };

        Self { client, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Relay one capture call. A disabled relay is a silent no-op.
    pub async fn capture(
        &self,
        event_name: &str,
        distinct_id: &str,
        properties: &Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let Some(config) = &self.config else {
            return Ok(());
        };

        let url = format!("{}/capture/", config.host.trim_end_matches('/'));
        let body = json!({
            "api_key": config.api_key,
            "event": event_name,
            "distinct_id": distinct_id,
            "properties": properties,
            "timestamp": timestamp.to_rfc3339(),
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Capture request failed")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Capture endpoint returned {}", status);
        }

        debug!(event = event_name, distinct_id, "Event relayed to product analytics");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key_disables_relay() {
        let forwarder =
            PosthogForwarder::new(Client::new(), None, "https://app.posthog.com".to_string());
        assert!(!forwarder.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_relay_is_silent_noop() {
        let forwarder =
            PosthogForwarder::new(Client::new(), None, "https://app.posthog.com".to_string());
        let result = forwarder
            .capture("page_view", "anon-1", &json!({"page": "/"}), Utc::now())
            .await;
        assert!(result.is_ok());
    }
}
