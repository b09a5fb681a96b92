//! Application Configuration
//! Mission: Collect all environment-driven settings once at startup

use std::env;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    /// Days to keep raw tracking events before pruning.
    pub tracking_retention_days: i64,
    /// Secret used to verify platform-minted session tokens.
    pub session_secret: String,
    /// Ad-platform conversions API. All three must be present for the
    /// relay to be active; absence silently disables it.
    pub capi_pixel_id: Option<String>,
    pub capi_access_token: Option<String>,
    pub capi_api_version: String,
    /// Product-analytics capture endpoint. Absent key disables the relay.
    pub posthog_api_key: Option<String>,
    pub posthog_host: String,
    /// Public site URL, attached to forwarded events as the source URL.
    pub site_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let database_path = resolve_data_path(
            env::var("DATABASE_PATH").or_else(|_| env::var("DB_PATH")).ok(),
            "coursepulse_events.db",
        );

        let tracking_retention_days = env::var("TRACKING_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(365);

        let session_secret = env::var("SESSION_JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string());

        let capi_pixel_id = non_empty(env::var("CAPI_PIXEL_ID").ok());
        let capi_access_token = non_empty(env::var("CAPI_ACCESS_TOKEN").ok());
        let capi_api_version =
            env::var("CAPI_API_VERSION").unwrap_or_else(|_| "v18.0".to_string());

        let posthog_api_key = non_empty(env::var("POSTHOG_API_KEY").ok());
        let posthog_host =
            env::var("POSTHOG_HOST").unwrap_or_else(|_| "https://app.posthog.com".to_string());

        let site_url = non_empty(env::var("SITE_URL").ok());

        Self {
            port,
            database_path,
            tracking_retention_days,
            session_secret,
            capi_pixel_id,
            capi_access_token,
            capi_api_version,
            posthog_api_key,
            posthog_host,
            site_url,
        }
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

fn default_data_path(filename: &str) -> String {
    // Anchor defaults to the crate directory so running from elsewhere
    // doesn't create a new empty DB in a different working directory.
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

/// Resolve a DB path from an env value, treating relative paths as
/// relative to the crate directory rather than the caller's cwd.
pub fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    base.join(p).to_string_lossy().to_string()
}

/// Load .env from the crate directory and its parent in addition to the
/// standard cwd search.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];

    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_path_absolute_passthrough() {
        let resolved = resolve_data_path(Some("/tmp/test.db".to_string()), "default.db");
        assert_eq!(resolved, "/tmp/test.db");
    }

    #[test]
    fn test_resolve_data_path_empty_falls_back() {
        let resolved = resolve_data_path(Some("   ".to_string()), "default.db");
        assert!(resolved.ends_with("default.db"));
    }

    #[test]
    fn test_resolve_data_path_relative_anchored() {
        let resolved = resolve_data_path(Some("data/events.db".to_string()), "default.db");
        assert!(resolved.ends_with("data/events.db"));
        assert!(PathBuf::from(&resolved).is_absolute());
    }
}
