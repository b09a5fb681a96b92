//! External Forwarders
//! Mission: Relay qualifying events to ad-attribution and product-analytics
//! services without ever failing the caller's request
//!
//! Forwarding is a best-effort side channel: a stored-but-not-forwarded
//! event is an accepted steady state, the reverse never happens (we store
//! first, then forward).

pub mod capi;
pub mod posthog;

pub use capi::{hash_email, CapiForwarder, PurchaseEvent};
pub use posthog::PosthogForwarder;

use std::future::Future;
use tracing::warn;

/// Await a fallible forwarding future and convert any failure into a
/// logged diagnostic. Nothing escapes the request boundary.
pub async fn best_effort<F>(label: &'static str, fut: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    if let Err(e) = fut.await {
        warn!("{} failed (non-critical): {:#}", label, e);
    }
}
