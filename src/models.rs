//! Domain Models
//! Mission: Define the tracking, experiment, and billing data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single emitted user/system event. Append-only: rows are never
/// mutated or deleted outside retention pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub id: Uuid,
    pub event_name: String,
    /// Resolved identity: explicit userId, else verified session subject.
    pub user_id: Option<String>,
    /// Browser session id from the `x-session-id` header.
    pub session_id: Option<String>,
    pub properties: Value,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub referer: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Experiment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbTestStatus {
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
}

impl AbTestStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AbTestStatus::Draft => "draft",
            AbTestStatus::Running => "running",
            AbTestStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Some(AbTestStatus::Draft),
            "running" => Some(AbTestStatus::Running),
            "completed" => Some(AbTestStatus::Completed),
            _ => None,
        }
    }
}

/// An experiment definition. Immutable once events reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub id: Uuid,
    pub name: String,
    pub status: AbTestStatus,
    pub created_at: DateTime<Utc>,
}

/// One arm of an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbVariant {
    pub id: Uuid,
    pub test_id: Uuid,
    pub name: String,
}

/// Binding of one identity to one variant of one test.
/// Carries `user_id` XOR `anon_id`; unique per (test, identity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbAssignment {
    pub id: Uuid,
    pub test_id: Uuid,
    pub variant_id: Uuid,
    pub user_id: Option<String>,
    pub anon_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AbAssignment {
    /// The identity string this assignment is keyed on.
    pub fn identity(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.anon_id.as_deref())
            .unwrap_or("")
    }
}

/// Acting identity behind a tracked event: an authenticated platform
/// user or an anonymous browser-scoped id. Exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    Anon(String),
}

impl Identity {
    pub fn key(&self) -> &str {
        match self {
            Identity::User(id) | Identity::Anon(id) => id,
        }
    }
}

/// Tracked outcome types against an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbEventType {
    #[serde(rename = "view")]
    View,
    #[serde(rename = "click")]
    Click,
    #[serde(rename = "conversion")]
    Conversion,
    #[serde(rename = "purchase")]
    Purchase,
}

impl AbEventType {
    pub fn as_str(&self) -> &str {
        match self {
            AbEventType::View => "view",
            AbEventType::Click => "click",
            AbEventType::Conversion => "conversion",
            AbEventType::Purchase => "purchase",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "view" => Some(AbEventType::View),
            "click" => Some(AbEventType::Click),
            "conversion" => Some(AbEventType::Conversion),
            "purchase" => Some(AbEventType::Purchase),
            _ => None,
        }
    }

    /// Only revenue-type events may carry an event_value.
    pub fn is_revenue(&self) -> bool {
        matches!(self, AbEventType::Conversion | AbEventType::Purchase)
    }
}

/// A tracked outcome tied to an assignment. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbEvent {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub event_type: AbEventType,
    pub event_value: Option<f64>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Subscription billing interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingInterval {
    #[serde(rename = "month")]
    Month,
    #[serde(rename = "year")]
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "month" | "monthly" => Some(BillingInterval::Month),
            "year" | "yearly" | "annual" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

/// Subscription status mirrored from the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "past_due")]
    PastDue,
    #[serde(rename = "canceled")]
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

/// Billing state mirrored from the payment provider. The provider's
/// subscription id is the primary key; MRR is derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Provider-side subscription id (e.g. "sub_...")
    pub id: String,
    pub user_id: String,
    pub price_cents: i64,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for (s, t) in [
            ("view", AbEventType::View),
            ("click", AbEventType::Click),
            ("conversion", AbEventType::Conversion),
            ("purchase", AbEventType::Purchase),
        ] {
            assert_eq!(AbEventType::from_str(s), Some(t));
            assert_eq!(t.as_str(), s);
        }
        assert_eq!(AbEventType::from_str("refund"), None);
    }

    #[test]
    fn test_revenue_event_types() {
        assert!(!AbEventType::View.is_revenue());
        assert!(!AbEventType::Click.is_revenue());
        assert!(AbEventType::Conversion.is_revenue());
        assert!(AbEventType::Purchase.is_revenue());
    }

    #[test]
    fn test_billing_interval_aliases() {
        assert_eq!(BillingInterval::from_str("monthly"), Some(BillingInterval::Month));
        assert_eq!(BillingInterval::from_str("annual"), Some(BillingInterval::Year));
        assert_eq!(BillingInterval::from_str("weekly"), None);
    }

    #[test]
    fn test_assignment_identity_prefers_user_id() {
        let a = AbAssignment {
            id: Uuid::new_v4(),
            test_id: Uuid::new_v4(),
            variant_id: Uuid::new_v4(),
            user_id: Some("user-1".to_string()),
            anon_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(a.identity(), "user-1");
    }
}
