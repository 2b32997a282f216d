//! Shared daily token budget with a sticky lockout.
//!
//! Every model call is paid for through [`TokenBudgetLedger`]. The ledger
//! keeps one [`UsageLedgerEntry`] per UTC day in the configured
//! [`AnalysisStore`]. Each charge is a single [`AnalysisStore::apply_usage`]
//! call, which the backend performs atomically, so ledgers in different
//! processes sharing one database never lose an increment. Within a process
//! charges for the same day also queue on an async mutex, which keeps them
//! off the database's busy handler.
//!
//! # Charging
//!
//! 1. If any lock stamped on today's row or on a recent previous day's row
//!    is still in the future, fail with [`AnalysisError::BudgetExceeded`]
//!    without touching the counter.
//! 2. Add the tokens. If the new total reaches the daily limit, persist it
//!    with `lock_until = now + lockout_hours` and fail.
//! 3. Otherwise persist the new total.
//!
//! The charge that trips the limit is still recorded: a day can end above
//! its limit, and the lockout outlives midnight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use parley_core::models::UsageLedgerEntry;
use parley_core::store::{AnalysisStore, ChargeOutcome, UsageCharge};
use parley_core::{AnalysisError, Result};

use crate::config::BudgetConfig;

/// Rough characters-per-token ratio used for estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count for `chars` characters of prompt text.
pub fn estimate_tokens(chars: usize) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN) as u64
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Ledger state as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub day: NaiveDate,
    pub tokens_used: u64,
    pub daily_limit: u64,
    pub remaining: u64,
    pub locked: bool,
    pub lock_until: Option<DateTime<Utc>>,
}

pub struct TokenBudgetLedger {
    store: Arc<dyn AnalysisStore>,
    daily_limit: u64,
    lockout: Duration,
    day_locks: Mutex<HashMap<NaiveDate, Arc<tokio::sync::Mutex<()>>>>,
    clock: Clock,
}

impl TokenBudgetLedger {
    pub fn new(store: Arc<dyn AnalysisStore>, config: &BudgetConfig) -> Self {
        Self {
            store,
            daily_limit: config.daily_token_limit,
            lockout: Duration::hours(config.lockout_hours),
            day_locks: Mutex::new(HashMap::new()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, for tests that cross midnight.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    /// Optimistically charge an estimate before a model call.
    pub async fn reserve_or_fail(&self, estimated: u64) -> Result<UsageLedgerEntry> {
        self.apply(estimated).await
    }

    /// Charge tokens reported after a model call. A zero charge is a no-op.
    pub async fn charge(&self, actual: u64) -> Result<Option<UsageLedgerEntry>> {
        if actual == 0 {
            return Ok(None);
        }
        self.apply(actual).await.map(Some)
    }

    pub async fn usage_today(&self) -> Result<UsageSnapshot> {
        let now = (self.clock)();
        self.usage_at(now.date_naive(), now).await
    }

    pub async fn usage_for(&self, day: NaiveDate) -> Result<UsageSnapshot> {
        self.usage_at(day, (self.clock)()).await
    }

    async fn usage_at(&self, day: NaiveDate, now: DateTime<Utc>) -> Result<UsageSnapshot> {
        let entry = self
            .store
            .get_usage_for_day(day)
            .await?
            .unwrap_or_else(|| UsageLedgerEntry::empty(day));
        let lock_until = match entry.active_lock(now) {
            Some(until) => Some(until),
            None if day == now.date_naive() => self.recent_lock(day, now).await?,
            None => None,
        };
        Ok(UsageSnapshot {
            day,
            tokens_used: entry.tokens_used,
            daily_limit: self.daily_limit,
            remaining: self.daily_limit.saturating_sub(entry.tokens_used),
            locked: lock_until.is_some(),
            lock_until,
        })
    }

    async fn apply(&self, tokens: u64) -> Result<UsageLedgerEntry> {
        let now = (self.clock)();
        let day = now.date_naive();
        let day_lock = self.day_lock(day);
        let _guard = day_lock.lock().await;

        let charge = UsageCharge {
            day,
            tokens,
            daily_limit: self.daily_limit,
            now,
            lock_until: now + self.lockout,
            lookback_days: self.lookback_days(),
        };

        match self.store.apply_usage(&charge).await? {
            ChargeOutcome::Charged(entry) => {
                tracing::debug!(day = %day, tokens, tokens_used = entry.tokens_used, "budget charged");
                Ok(entry)
            }
            ChargeOutcome::Tripped(entry) => {
                tracing::warn!(
                    day = %day,
                    tokens_used = entry.tokens_used,
                    limit = self.daily_limit,
                    lock_until = %charge.lock_until,
                    "daily token budget exhausted, locking"
                );
                Err(AnalysisError::BudgetExceeded {
                    lock_until: charge.lock_until,
                })
            }
            ChargeOutcome::Locked(lock_until) => Err(AnalysisError::BudgetExceeded { lock_until }),
        }
    }

    /// Previous days a lockout can still reach.
    fn lookback_days(&self) -> u32 {
        let hours = self.lockout.num_hours().max(1);
        u32::try_from((hours + 23) / 24).unwrap_or(u32::MAX)
    }

    /// An active lock stamped on one of the days before `day`.
    async fn recent_lock(&self, day: NaiveDate, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let mut previous = day;
        for _ in 0..self.lookback_days() {
            previous = match previous.pred_opt() {
                Some(d) => d,
                None => break,
            };
            if let Some(until) = self
                .store
                .get_usage_for_day(previous)
                .await?
                .and_then(|e| e.active_lock(now))
            {
                return Ok(Some(until));
            }
        }
        Ok(None)
    }

    fn day_lock(&self, day: NaiveDate) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.day_locks.lock().unwrap_or_else(|e| e.into_inner());
        if !locks.contains_key(&day) {
            // Days that can no longer be charged.
            locks.retain(|d, _| *d >= day);
        }
        locks.entry(day).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::store::memory::InMemoryStore;

    use crate::config::Config;
    use crate::sqlite_store::SqliteStore;
    use crate::{db, migrate};

    fn config(limit: u64) -> BudgetConfig {
        BudgetConfig {
            daily_token_limit: limit,
            lockout_hours: 24,
        }
    }

    fn ledger(limit: u64) -> (Arc<InMemoryStore>, TokenBudgetLedger) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = TokenBudgetLedger::new(store.clone(), &config(limit));
        (store, ledger)
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
        assert_eq!(estimate_tokens(4000), 1000);
    }

    #[tokio::test]
    async fn test_under_limit_accumulates() {
        let (_, ledger) = ledger(1000);
        ledger.reserve_or_fail(100).await.unwrap();
        ledger.charge(250).await.unwrap();
        let usage = ledger.usage_today().await.unwrap();
        assert_eq!(usage.tokens_used, 350);
        assert_eq!(usage.remaining, 650);
        assert!(!usage.locked);
    }

    #[tokio::test]
    async fn test_crossing_limit_locks_and_records() {
        let (store, ledger) = ledger(1000);
        ledger.reserve_or_fail(950).await.unwrap();

        let before = Utc::now();
        let err = ledger.reserve_or_fail(100).await.unwrap_err();
        let lock_until = match err {
            AnalysisError::BudgetExceeded { lock_until } => lock_until,
            other => panic!("expected BudgetExceeded, got {:?}", other),
        };
        let expected = before + Duration::hours(24);
        assert!((lock_until - expected).num_seconds().abs() <= 5);

        let entry = store
            .get_usage_for_day(Utc::now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.tokens_used, 1050);
        assert_eq!(entry.lock_until, Some(lock_until));
    }

    #[tokio::test]
    async fn test_lock_is_sticky() {
        let (_, ledger) = ledger(1000);
        assert!(ledger.reserve_or_fail(1000).await.is_err());
        let err = ledger.reserve_or_fail(1).await.unwrap_err();
        assert!(matches!(err, AnalysisError::BudgetExceeded { .. }));
        // Rejected charges leave the counter alone.
        assert_eq!(ledger.usage_today().await.unwrap().tokens_used, 1000);
        assert!(ledger.usage_today().await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_zero_charge_is_noop() {
        let (_, ledger) = ledger(1000);
        assert!(ledger.reserve_or_fail(1000).await.is_err());
        assert_eq!(ledger.charge(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_spans_midnight() {
        let store = Arc::new(InMemoryStore::new());
        let evening = DateTime::parse_from_rfc3339("2026-03-10T22:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next_morning = evening + Duration::hours(4);

        let ledger = TokenBudgetLedger::new(store.clone(), &config(1000)).with_clock(move || evening);
        assert!(ledger.reserve_or_fail(1200).await.is_err());

        let ledger = TokenBudgetLedger::new(store.clone(), &config(1000)).with_clock(move || next_morning);
        let err = ledger.reserve_or_fail(1).await.unwrap_err();
        assert_eq!(
            err,
            AnalysisError::BudgetExceeded {
                lock_until: evening + Duration::hours(24)
            }
        );
        let usage = ledger.usage_today().await.unwrap();
        assert_eq!(usage.tokens_used, 0);
        assert!(usage.locked);

        let after_lock = evening + Duration::hours(25);
        let ledger = TokenBudgetLedger::new(store, &config(1000)).with_clock(move || after_lock);
        ledger.reserve_or_fail(1).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_charges_do_not_lose_updates() {
        let (_, ledger) = ledger(1_000_000);
        let ledger = Arc::new(ledger);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.charge(10).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ledger.usage_today().await.unwrap().tokens_used, 500);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ledgers_sharing_a_database_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let app_config = Config::minimal(dir.path().join("parley.sqlite"));

        let mut ledgers = Vec::new();
        for _ in 0..2 {
            let pool = db::connect(&app_config).await.unwrap();
            migrate::apply(&pool).await.unwrap();
            let store = Arc::new(SqliteStore::new(pool));
            ledgers.push(Arc::new(TokenBudgetLedger::new(store, &config(1_000_000))));
        }

        let mut handles = Vec::new();
        for i in 0..100 {
            let ledger = ledgers[i % 2].clone();
            handles.push(tokio::spawn(async move { ledger.charge(10).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for ledger in &ledgers {
            assert_eq!(ledger.usage_today().await.unwrap().tokens_used, 1000);
        }
    }

    #[tokio::test]
    async fn test_lock_tripped_elsewhere_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let app_config = Config::minimal(dir.path().join("parley.sqlite"));
        let pool = db::connect(&app_config).await.unwrap();
        migrate::apply(&pool).await.unwrap();

        let serving = TokenBudgetLedger::new(Arc::new(SqliteStore::new(pool.clone())), &config(1000));
        let cli = TokenBudgetLedger::new(Arc::new(SqliteStore::new(pool)), &config(1000));

        assert!(serving.reserve_or_fail(1000).await.is_err());
        let err = cli.charge(1).await.unwrap_err();
        assert!(matches!(err, AnalysisError::BudgetExceeded { .. }));
        assert_eq!(cli.usage_today().await.unwrap().tokens_used, 1000);
    }

    #[tokio::test]
    async fn test_usage_is_monotonic() {
        let (_, ledger) = ledger(10_000);
        let mut last = 0;
        for tokens in [5, 0, 120, 1, 33] {
            let _ = ledger.charge(tokens).await;
            let used = ledger.usage_today().await.unwrap().tokens_used;
            assert!(used >= last);
            last = used;
        }
        assert_eq!(last, 159);
    }
}
