//! Token ledger overview for `parley usage`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;

use crate::budget::{TokenBudgetLedger, UsageSnapshot};
use crate::config::Config;
use crate::services::Services;

pub async fn usage(config: &Config, date: Option<&str>) -> Result<UsageSnapshot> {
    let store = Services::open_store(config).await?;
    let ledger = TokenBudgetLedger::new(Arc::clone(&store), &config.budget);
    let snapshot = match date {
        Some(raw) => {
            let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .with_context(|| format!("invalid --date '{}', expected YYYY-MM-DD", raw))?;
            ledger.usage_for(day).await?
        }
        None => ledger.usage_today().await?,
    };
    Ok(snapshot)
}

pub async fn run_usage(config: &Config, date: Option<&str>, json: bool) -> Result<()> {
    let snapshot = usage(config, date).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let percent = if snapshot.daily_limit > 0 {
        snapshot.tokens_used.saturating_mul(100) / snapshot.daily_limit
    } else {
        0
    };
    println!("Parley token usage");
    println!("==================");
    println!();
    println!("  Day:         {}", snapshot.day);
    println!(
        "  Used:        {} / {} ({}%)",
        snapshot.tokens_used, snapshot.daily_limit, percent
    );
    println!("  Remaining:   {}", snapshot.remaining);
    match snapshot.lock_until {
        Some(until) => println!("  Locked:      until {}", until.to_rfc3339()),
        None => println!("  Locked:      no"),
    }
    Ok(())
}
