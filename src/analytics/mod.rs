//! Revenue Analytics
//! Mission: Derive MRR, ARR, and cohort rollups from mirrored billing state

pub mod mrr;

pub use mrr::{ltv_cohorts, mrr_cents, mrr_summary, round2, LtvCohort, MrrSummary};
