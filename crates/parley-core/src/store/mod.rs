//! Storage abstraction for finished analyses and the token ledger.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`save_analysis`](AnalysisStore::save_analysis) | Persist a finished result, returning its id |
//! | [`get_analysis`](AnalysisStore::get_analysis) | Read a stored result back |
//! | [`get_usage_for_day`](AnalysisStore::get_usage_for_day) | Load one ledger row |
//! | [`upsert_usage_for_day`](AnalysisStore::upsert_usage_for_day) | Overwrite one ledger row |
//! | [`apply_usage`](AnalysisStore::apply_usage) | Atomic check-and-increment of one day's row |
//!
//! Implementations must be `Send + Sync`. `apply_usage` is the only ledger
//! write on the charging path and must be atomic with respect to every other
//! writer of the same backing store, including other processes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::models::{AnalysisResult, StoredAnalysis, UsageLedgerEntry};

/// One charge against a day's ledger row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageCharge {
    pub day: NaiveDate,
    pub tokens: u64,
    pub daily_limit: u64,
    pub now: DateTime<Utc>,
    /// Stamped on the row when this charge reaches the limit.
    pub lock_until: DateTime<Utc>,
    /// Days before `day` whose lock can still be active.
    pub lookback_days: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    /// Tokens added, still under the limit.
    Charged(UsageLedgerEntry),
    /// Tokens added and the row is now locked.
    Tripped(UsageLedgerEntry),
    /// A lock was already active; nothing was written.
    Locked(DateTime<Utc>),
}

impl ChargeOutcome {
    /// The row to persist, if any.
    pub fn entry(&self) -> Option<&UsageLedgerEntry> {
        match self {
            ChargeOutcome::Charged(entry) | ChargeOutcome::Tripped(entry) => Some(entry),
            ChargeOutcome::Locked(_) => None,
        }
    }
}

impl UsageCharge {
    /// The days before `day` a lockout can still reach, most recent first.
    pub fn previous_days(&self) -> impl Iterator<Item = NaiveDate> {
        let day = self.day;
        (1..=u64::from(self.lookback_days)).filter_map(move |n| day.checked_sub_days(Days::new(n)))
    }

    /// Decide the charge against the current row and the rows of
    /// [`previous_days`](Self::previous_days). Backends call this while
    /// holding their write lock.
    pub fn evaluate(&self, current: Option<UsageLedgerEntry>, previous: &[UsageLedgerEntry]) -> ChargeOutcome {
        let mut entry = current.unwrap_or_else(|| UsageLedgerEntry::empty(self.day));

        let held = entry
            .active_lock(self.now)
            .or_else(|| previous.iter().find_map(|e| e.active_lock(self.now)));
        if let Some(lock_until) = held {
            return ChargeOutcome::Locked(lock_until);
        }

        entry.tokens_used = entry.tokens_used.saturating_add(self.tokens);
        if entry.tokens_used >= self.daily_limit {
            entry.lock_until = Some(self.lock_until);
            ChargeOutcome::Tripped(entry)
        } else {
            ChargeOutcome::Charged(entry)
        }
    }
}

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Persist a completed analysis. Returns the new analysis id.
    async fn save_analysis(&self, result: &AnalysisResult) -> Result<String>;

    async fn get_analysis(&self, id: &str) -> Result<Option<StoredAnalysis>>;

    /// The ledger row for `day`, or `None` if nothing was charged that day.
    async fn get_usage_for_day(&self, day: NaiveDate) -> Result<Option<UsageLedgerEntry>>;

    /// Overwrite the row for `entry.day` unconditionally.
    async fn upsert_usage_for_day(&self, entry: &UsageLedgerEntry) -> Result<()>;

    /// Read, [`evaluate`](UsageCharge::evaluate) and write back as one
    /// atomic step.
    async fn apply_usage(&self, charge: &UsageCharge) -> Result<ChargeOutcome>;
}
