//! Database-backed Event & Experiment Storage
//! Optimized for high-volume append-only telemetry
//!
//! Key points:
//! - WAL mode for concurrent reads during writes
//! - tracking_events and ab_events are append-only ledgers
//! - assignment uniqueness per (test, identity) enforced by partial
//!   UNIQUE indexes; concurrent first-touch races resolve through the
//!   constraint, not in-process locking

use crate::models::{
    AbAssignment, AbEvent, AbEventType, AbTest, AbTestStatus, AbVariant, BillingInterval,
    Identity, Subscription, SubscriptionStatus, TrackingEvent,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Schema with pragmas tuned for a write-heavy telemetry workload
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;  -- 32MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS tracking_events (
    id TEXT PRIMARY KEY,
    event_name TEXT NOT NULL,
    user_id TEXT,
    session_id TEXT,
    properties_json TEXT NOT NULL,
    user_agent TEXT,
    client_ip TEXT,
    referer TEXT,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_tracking_events_name_ts
    ON tracking_events(event_name, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_tracking_events_user_ts
    ON tracking_events(user_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_tracking_events_ts
    ON tracking_events(created_at);

CREATE TABLE IF NOT EXISTS ab_tests (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ab_variants (
    id TEXT PRIMARY KEY,
    test_id TEXT NOT NULL,
    name TEXT NOT NULL,
    FOREIGN KEY (test_id) REFERENCES ab_tests(id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_ab_variants_test ON ab_variants(test_id);

-- user_id XOR anon_id; one assignment per (test, identity)
CREATE TABLE IF NOT EXISTS ab_assignments (
    id TEXT PRIMARY KEY,
    test_id TEXT NOT NULL,
    variant_id TEXT NOT NULL,
    user_id TEXT,
    anon_id TEXT,
    created_at TEXT NOT NULL,
    CHECK ((user_id IS NULL) <> (anon_id IS NULL)),
    FOREIGN KEY (test_id) REFERENCES ab_tests(id),
    FOREIGN KEY (variant_id) REFERENCES ab_variants(id)
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_ab_assignments_test_user
    ON ab_assignments(test_id, user_id) WHERE user_id IS NOT NULL;

CREATE UNIQUE INDEX IF NOT EXISTS idx_ab_assignments_test_anon
    ON ab_assignments(test_id, anon_id) WHERE anon_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS ab_events (
    id TEXT PRIMARY KEY,
    assignment_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_value REAL,
    metadata_json TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (assignment_id) REFERENCES ab_assignments(id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_ab_events_assignment
    ON ab_events(assignment_id, event_type);

CREATE TABLE IF NOT EXISTS subscriptions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    price_cents INTEGER NOT NULL,
    interval TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_subscriptions_status ON subscriptions(status);
CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id);
"#;

/// Per-variant experiment rollup
#[derive(Debug, Clone, Serialize)]
pub struct VariantSummary {
    pub variant_id: Uuid,
    pub name: String,
    pub assignments: i64,
    pub views: i64,
    pub clicks: i64,
    pub conversions: i64,
    pub purchases: i64,
    pub revenue: f64,
    /// conversions / views, 0 when no views
    pub conversion_rate: f64,
}

/// Event and experiment storage
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    /// Open (or create) the database and apply the schema.
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("📊 Event database initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- tracking events -------------------------------------------------

    /// Append one tracking event. Never updates existing rows.
    pub fn insert_tracking_event(&self, event: &TrackingEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tracking_events
                (id, event_name, user_id, session_id, properties_json,
                 user_agent, client_ip, referer, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id.to_string(),
                event.event_name,
                event.user_id,
                event.session_id,
                event.properties.to_string(),
                event.user_agent,
                event.client_ip,
                event.referer,
                event.created_at.timestamp(),
            ],
        )
        .context("Failed to insert tracking event")?;
        Ok(())
    }

    pub fn count_tracking_events(&self) -> i64 {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM tracking_events", [], |row| row.get(0))
            .unwrap_or(0)
    }

    /// Delete tracking events older than the cutoff. Returns rows deleted.
    pub fn prune_tracking_events_before(&self, cutoff_unix: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM tracking_events WHERE created_at < ?1",
                params![cutoff_unix],
            )
            .context("Failed to prune tracking events")?;
        Ok(deleted)
    }

    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize;")
            .context("Failed to optimize database")?;
        Ok(())
    }

    // ---- experiments -----------------------------------------------------

    /// Create a test with its variants in one transaction.
    pub fn create_test(
        &self,
        name: &str,
        variant_names: &[String],
    ) -> Result<(AbTest, Vec<AbVariant>)> {
        if variant_names.is_empty() {
            bail!("A test needs at least one variant");
        }

        let test = AbTest {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: AbTestStatus::Running,
            created_at: Utc::now(),
        };

        let variants: Vec<AbVariant> = variant_names
            .iter()
            .map(|n| AbVariant {
                id: Uuid::new_v4(),
                test_id: test.id,
                name: n.clone(),
            })
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to open transaction")?;

        tx.execute(
            "INSERT INTO ab_tests (id, name, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                test.id.to_string(),
                test.name,
                test.status.as_str(),
                test.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert test")?;

        for v in &variants {
            tx.execute(
                "INSERT INTO ab_variants (id, test_id, name) VALUES (?1, ?2, ?3)",
                params![v.id.to_string(), v.test_id.to_string(), v.name],
            )
            .context("Failed to insert variant")?;
        }

        tx.commit().context("Failed to commit test creation")?;

        info!("🧪 Created test '{}' with {} variants", test.name, variants.len());
        Ok((test, variants))
    }

    pub fn get_test(&self, test_id: &Uuid) -> Result<Option<AbTest>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, status, created_at FROM ab_tests WHERE id = ?1",
        )?;

        let result = stmt.query_row(params![test_id.to_string()], |row| {
            let status_str: String = row.get(2)?;
            let created_at: String = row.get(3)?;
            Ok(AbTest {
                id: parse_uuid(&row.get::<_, String>(0)?),
                name: row.get(1)?,
                status: AbTestStatus::from_str(&status_str).unwrap_or(AbTestStatus::Draft),
                created_at: parse_rfc3339(&created_at),
            })
        });

        match result {
            Ok(test) => Ok(Some(test)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn variants_for_test(&self, test_id: &Uuid) -> Result<Vec<AbVariant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, test_id, name FROM ab_variants WHERE test_id = ?1 ORDER BY name",
        )?;

        let variants = stmt
            .query_map(params![test_id.to_string()], |row| {
                Ok(AbVariant {
                    id: parse_uuid(&row.get::<_, String>(0)?),
                    test_id: parse_uuid(&row.get::<_, String>(1)?),
                    name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(variants)
    }

    // ---- assignments -----------------------------------------------------

    /// Return the existing assignment for (test, identity), or create one
    /// with a deterministically-picked variant. Returns None when the test
    /// is unknown or has no variants.
    ///
    /// Concurrent first-touch requests compute the same variant, so the
    /// UNIQUE index only has to break exact insert ties; on a constraint
    /// hit we re-read and return the winner.
    pub fn get_or_assign(
        &self,
        test_id: &Uuid,
        identity: &Identity,
    ) -> Result<Option<AbAssignment>> {
        if let Some(existing) = self.assignment_for_identity(test_id, identity)? {
            return Ok(Some(existing));
        }

        let variants = self.variants_for_test(test_id)?;
        if variants.is_empty() {
            return Ok(None);
        }

        let idx = variant_index(test_id, identity.key(), variants.len());
        let variant = &variants[idx];

        let assignment = AbAssignment {
            id: Uuid::new_v4(),
            test_id: *test_id,
            variant_id: variant.id,
            user_id: match identity {
                Identity::User(id) => Some(id.clone()),
                Identity::Anon(_) => None,
            },
            anon_id: match identity {
                Identity::User(_) => None,
                Identity::Anon(id) => Some(id.clone()),
            },
            created_at: Utc::now(),
        };

        let inserted = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO ab_assignments
                    (id, test_id, variant_id, user_id, anon_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    assignment.id.to_string(),
                    assignment.test_id.to_string(),
                    assignment.variant_id.to_string(),
                    assignment.user_id,
                    assignment.anon_id,
                    assignment.created_at.to_rfc3339(),
                ],
            )
        };

        match inserted {
            Ok(_) => Ok(Some(assignment)),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                // Lost the insert race; the winning row is equivalent.
                self.assignment_for_identity(test_id, identity)
            }
            Err(e) => Err(e).context("Failed to insert assignment"),
        }
    }

    /// Assignment for (test, identity) regardless of variant.
    pub fn assignment_for_identity(
        &self,
        test_id: &Uuid,
        identity: &Identity,
    ) -> Result<Option<AbAssignment>> {
        let (column, key) = match identity {
            Identity::User(id) => ("user_id", id.as_str()),
            Identity::Anon(id) => ("anon_id", id.as_str()),
        };

        let sql = format!(
            "SELECT id, test_id, variant_id, user_id, anon_id, created_at
             FROM ab_assignments WHERE test_id = ?1 AND {} = ?2",
            column
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt.query_row(params![test_id.to_string(), key], row_to_assignment);

        match result {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Exact (test, variant, identity) triple lookup used by the event
    /// recorder. Events with no matching assignment are rejected upstream.
    pub fn find_assignment(
        &self,
        test_id: &Uuid,
        variant_id: &Uuid,
        identity: &Identity,
    ) -> Result<Option<AbAssignment>> {
        let (column, key) = match identity {
            Identity::User(id) => ("user_id", id.as_str()),
            Identity::Anon(id) => ("anon_id", id.as_str()),
        };

        let sql = format!(
            "SELECT id, test_id, variant_id, user_id, anon_id, created_at
             FROM ab_assignments
             WHERE test_id = ?1 AND variant_id = ?2 AND {} = ?3",
            column
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt.query_row(
            params![test_id.to_string(), variant_id.to_string(), key],
            row_to_assignment,
        );

        match result {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ---- ab events -------------------------------------------------------

    pub fn insert_ab_event(&self, event: &AbEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ab_events
                (id, assignment_id, event_type, event_value, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.assignment_id.to_string(),
                event.event_type.as_str(),
                event.event_value,
                event.metadata.as_ref().map(|m| m.to_string()),
                event.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert ab event")?;
        Ok(())
    }

    pub fn count_ab_events(&self) -> i64 {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM ab_events", [], |row| row.get(0))
            .unwrap_or(0)
    }

    /// Per-variant rollup for a test: assignments, event counts by type,
    /// revenue, and conversion rate (conversions / views).
    pub fn variant_summary(&self, test_id: &Uuid) -> Result<Vec<VariantSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT v.id, v.name,
                    COUNT(DISTINCT a.id),
                    COUNT(CASE WHEN e.event_type = 'view' THEN 1 END),
                    COUNT(CASE WHEN e.event_type = 'click' THEN 1 END),
                    COUNT(CASE WHEN e.event_type = 'conversion' THEN 1 END),
                    COUNT(CASE WHEN e.event_type = 'purchase' THEN 1 END),
                    COALESCE(SUM(CASE WHEN e.event_type IN ('conversion', 'purchase')
                                      THEN COALESCE(e.event_value, 0) ELSE 0 END), 0)
             FROM ab_variants v
             LEFT JOIN ab_assignments a ON a.variant_id = v.id
             LEFT JOIN ab_events e ON e.assignment_id = a.id
             WHERE v.test_id = ?1
             GROUP BY v.id, v.name
             ORDER BY v.name",
        )?;

        let summaries = stmt
            .query_map(params![test_id.to_string()], |row| {
                let views: i64 = row.get(3)?;
                let conversions: i64 = row.get(5)?;
                Ok(VariantSummary {
                    variant_id: parse_uuid(&row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    assignments: row.get(2)?,
                    views,
                    clicks: row.get(4)?,
                    conversions,
                    purchases: row.get(6)?,
                    revenue: row.get(7)?,
                    conversion_rate: if views > 0 {
                        conversions as f64 / views as f64
                    } else {
                        0.0
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summaries)
    }

    // ---- subscriptions ---------------------------------------------------

    /// Mirror a billing-provider subscription row (insert or replace).
    pub fn upsert_subscription(&self, sub: &Subscription) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subscriptions (id, user_id, price_cents, interval, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                price_cents = excluded.price_cents,
                interval = excluded.interval,
                status = excluded.status",
            params![
                sub.id,
                sub.user_id,
                sub.price_cents,
                sub.interval.as_str(),
                sub.status.as_str(),
                sub.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to upsert subscription")?;
        Ok(())
    }

    pub fn active_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.subscriptions_where("WHERE status = 'active'")
    }

    pub fn all_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.subscriptions_where("")
    }

    fn subscriptions_where(&self, filter: &str) -> Result<Vec<Subscription>> {
        let sql = format!(
            "SELECT id, user_id, price_cents, interval, status, created_at
             FROM subscriptions {} ORDER BY created_at",
            filter
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let subs = stmt
            .query_map([], |row| {
                let interval_str: String = row.get(3)?;
                let status_str: String = row.get(4)?;
                let created_at: String = row.get(5)?;
                Ok(Subscription {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    price_cents: row.get(2)?,
                    interval: BillingInterval::from_str(&interval_str)
                        .unwrap_or(BillingInterval::Month),
                    status: SubscriptionStatus::from_str(&status_str)
                        .unwrap_or(SubscriptionStatus::Canceled),
                    created_at: parse_rfc3339(&created_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(subs)
    }
}

fn row_to_assignment(row: &rusqlite::Row<'_>) -> rusqlite::Result<AbAssignment> {
    let created_at: String = row.get(5)?;
    Ok(AbAssignment {
        id: parse_uuid(&row.get::<_, String>(0)?),
        test_id: parse_uuid(&row.get::<_, String>(1)?),
        variant_id: parse_uuid(&row.get::<_, String>(2)?),
        user_id: row.get(3)?,
        anon_id: row.get(4)?,
        created_at: parse_rfc3339(&created_at),
    })
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_default()
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Deterministic variant pick: sha256("{test_id}:{identity}") mod count.
/// Stable across calls and evenly distributed across identities.
fn variant_index(test_id: &Uuid, identity_key: &str, count: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(test_id.as_bytes());
    hasher.update(b":");
    hasher.update(identity_key.as_bytes());
    let digest = hasher.finalize();

    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(buf) % count as u64) as usize
}
