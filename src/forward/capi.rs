//! Ad-platform Conversions API relay
//! Mission: Report purchases server-to-server so attribution survives
//! browser pixel loss
//!
//! Policy:
//! - no pixel id or access token configured -> relay disabled, no network
//! - emails are trimmed, lowercased, sha256-hashed before transmission;
//!   raw addresses never leave the process
//! - every payload carries the client-supplied event_id so the platform
//!   dedupes against browser-side pixel events

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

const GRAPH_API_BASE: &str = "https://graph.facebook.com";

/// A purchase-equivalent event ready for server-side attribution
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseEvent {
    /// Dedup key shared with the browser pixel
    pub event_id: String,
    pub event_name: String,
    pub event_time: i64,
    pub value: f64,
    pub currency: String,
    pub email: Option<String>,
    pub content_ids: Vec<String>,
}

struct CapiConfig {
    pixel_id: String,
    access_token: String,
    api_version: String,
    site_url: Option<String>,
}

/// Server-to-server conversions relay. Constructed once at startup and
/// shared through AppState.
pub struct CapiForwarder {
    client: Client,
    config: Option<CapiConfig>,
}

impl CapiForwarder {
    pub fn new(
        client: Client,
        pixel_id: Option<String>,
        access_token: Option<String>,
        api_version: String,
        site_url: Option<String>,
    ) -> Self {
        let config = match (pixel_id, access_token) {
            (Some(pixel_id), Some(access_token)) => {
                info!("🎯 Conversions relay active for pixel {}", pixel_id);
                Some(CapiConfig {
                    pixel_id,
                    access_token,
                    api_version,
                    site_url,
                })
            }
            _ => {
                info!("Conversions relay disabled (pixel id / access token not configured)");
                None
            }
        };

        Self { client, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Relay one purchase event. A disabled relay is a silent no-op.
    pub async fn forward_purchase(&self, event: &PurchaseEvent) -> Result<()> {
        let Some(config) = &self.config else {
            return Ok(());
        };

        let mut user_data = json!({});
        if let Some(email) = &event.email {
            user_data["em"] = json!([hash_email(email)]);
        }

        let mut server_event = json!({
            "event_name": event.event_name,
            "event_time": event.event_time,
            "event_id": event.event_id,
            "action_source": "website",
            "user_data": user_data,
            "custom_data": {
                "value": event.value,
                "currency": event.currency,
                "content_ids": event.content_ids,
            },
        });
        if let Some(site_url) = &config.site_url {
            server_event["event_source_url"] = json!(site_url);
        }

        let url = format!(
            "{}/{}/{}/events",
            GRAPH_API_BASE, config.api_version, config.pixel_id
        );

        let resp = self
            .client
            .post(&url)
            .query(&[("access_token", config.access_token.as_str())])
            .json(&json!({ "data": [server_event] }))
            .send()
            .await
            .context("Conversions API request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Conversions API returned {}: {}", status, body);
        }

        debug!(
            event_id = %event.event_id,
            value = event.value,
            "Purchase relayed to conversions API"
        );
        Ok(())
    }
}

/// One-way digest of an email address: trim, lowercase, sha256, hex.
pub fn hash_email(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}
