//! MRR report CLI
//!
//! Prints the revenue rollup (MRR summary + cohort LTV) straight from a
//! database file, for operators who want numbers without curling the API.

use anyhow::Result;
use clap::Parser;
use coursepulse_backend::{
    analytics::{ltv_cohorts, mrr_summary},
    storage::EventStore,
};

#[derive(Parser, Debug)]
#[command(name = "mrr-report", about = "Print the revenue rollup from a CoursePulse database")]
struct Args {
    /// Path to the events database
    #[arg(long, env = "DATABASE_PATH", default_value = "coursepulse_events.db")]
    db: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let store = EventStore::new(&args.db)?;
    let active = store.active_subscriptions()?;
    let all = store.all_subscriptions()?;

    let summary = mrr_summary(&active);
    println!("MRR:     ${:.2}", summary.mrr);
    println!("ARR:     ${:.2}", summary.arr);
    println!(
        "Active:  {} ({} monthly, {} yearly)",
        summary.active_subscriptions, summary.monthly_count, summary.yearly_count
    );

    let cohorts = ltv_cohorts(&all);
    if cohorts.is_empty() {
        println!("\nNo subscription cohorts yet.");
        return Ok(());
    }

    println!("\n{:<10} {:>12} {:>12} {:>10}", "cohort", "subscribers", "mrr", "ltv/sub");
    for c in cohorts {
        println!(
            "{:<10} {:>12} {:>12.2} {:>10.2}",
            c.cohort, c.subscribers, c.mrr, c.ltv_per_subscriber
        );
    }

    Ok(())
}
