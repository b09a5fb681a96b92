//! MRR computation over mirrored subscriptions.
//!
//! All math stays in fractional cents; rounding to two decimal dollars
//! happens only at display boundaries (API responses, CLI output).

use crate::models::{BillingInterval, Subscription, SubscriptionStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Normalized monthly revenue in cents for one subscription.
/// Monthly plans contribute their price; yearly plans contribute a
/// twelfth of it.
pub fn mrr_cents(price_cents: i64, interval: BillingInterval) -> f64 {
    match interval {
        BillingInterval::Month => price_cents as f64,
        BillingInterval::Year => price_cents as f64 / 12.0,
    }
}

/// Round to two decimal places for display.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Revenue rollup over active subscriptions
#[derive(Debug, Clone, Serialize)]
pub struct MrrSummary {
    /// Monthly recurring revenue in dollars, 2dp
    pub mrr: f64,
    /// Annualized (mrr * 12) in dollars, 2dp
    pub arr: f64,
    pub active_subscriptions: usize,
    pub monthly_count: usize,
    pub yearly_count: usize,
}

/// Compute the MRR summary over the given subscriptions. Only active
/// subscriptions contribute; callers may pass a pre-filtered slice or the
/// full mirror.
pub fn mrr_summary(subscriptions: &[Subscription]) -> MrrSummary {
    let mut total_cents = 0.0;
    let mut monthly_count = 0;
    let mut yearly_count = 0;

    for sub in subscriptions {
        if sub.status != SubscriptionStatus::Active {
            continue;
        }
        total_cents += mrr_cents(sub.price_cents, sub.interval);
        match sub.interval {
            BillingInterval::Month => monthly_count += 1,
            BillingInterval::Year => yearly_count += 1,
        }
    }

    MrrSummary {
        mrr: round2(total_cents / 100.0),
        arr: round2(total_cents * 12.0 / 100.0),
        active_subscriptions: monthly_count + yearly_count,
        monthly_count,
        yearly_count,
    }
}

/// One signup-month cohort of subscribers
#[derive(Debug, Clone, Serialize)]
pub struct LtvCohort {
    /// Signup month, "YYYY-MM"
    pub cohort: String,
    pub subscribers: usize,
    /// Current MRR contributed by the cohort, dollars 2dp
    pub mrr: f64,
    /// mrr / subscribers, dollars 2dp
    pub ltv_per_subscriber: f64,
}

/// Group subscriptions by signup month and roll up the MRR each cohort
/// still contributes. Canceled rows count toward cohort size but not
/// revenue, so decayed cohorts surface naturally.
pub fn ltv_cohorts(subscriptions: &[Subscription]) -> Vec<LtvCohort> {
    let mut by_month: BTreeMap<String, (usize, f64)> = BTreeMap::new();

    for sub in subscriptions {
        let cohort = sub.created_at.format("%Y-%m").to_string();
        let entry = by_month.entry(cohort).or_insert((0, 0.0));
        entry.0 += 1;
        if sub.status == SubscriptionStatus::Active {
            entry.1 += mrr_cents(sub.price_cents, sub.interval);
        }
    }

    by_month
        .into_iter()
        .map(|(cohort, (subscribers, cents))| LtvCohort {
            cohort,
            subscribers,
            mrr: round2(cents / 100.0),
            ltv_per_subscriber: if subscribers > 0 {
                round2(cents / 100.0 / subscribers as f64)
            } else {
                0.0
            },
        })
        .collect()
}
