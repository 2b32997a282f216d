//! In-memory [`AnalysisStore`] for tests and single-shot CLI runs.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Nothing survives the process.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{AnalysisResult, StoredAnalysis, UsageLedgerEntry};

use super::{AnalysisStore, ChargeOutcome, UsageCharge};

pub struct InMemoryStore {
    analyses: RwLock<HashMap<String, AnalysisResult>>,
    usage: RwLock<HashMap<NaiveDate, UsageLedgerEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            analyses: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored analyses.
    pub fn analysis_count(&self) -> usize {
        self.analyses.read().map(|a| a.len()).unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl AnalysisStore for InMemoryStore {
    async fn save_analysis(&self, result: &AnalysisResult) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.analyses
            .write()
            .map_err(poisoned)?
            .insert(id.clone(), result.clone());
        Ok(id)
    }

    async fn get_analysis(&self, id: &str) -> Result<Option<StoredAnalysis>> {
        let analyses = self.analyses.read().map_err(poisoned)?;
        Ok(analyses.get(id).map(|result| StoredAnalysis {
            id: id.to_string(),
            result: result.clone(),
        }))
    }

    async fn get_usage_for_day(&self, day: NaiveDate) -> Result<Option<UsageLedgerEntry>> {
        Ok(self.usage.read().map_err(poisoned)?.get(&day).cloned())
    }

    async fn upsert_usage_for_day(&self, entry: &UsageLedgerEntry) -> Result<()> {
        self.usage
            .write()
            .map_err(poisoned)?
            .insert(entry.day, entry.clone());
        Ok(())
    }

    async fn apply_usage(&self, charge: &UsageCharge) -> Result<ChargeOutcome> {
        let mut usage = self.usage.write().map_err(poisoned)?;
        let previous: Vec<UsageLedgerEntry> = charge
            .previous_days()
            .filter_map(|day| usage.get(&day).cloned())
            .collect();
        let outcome = charge.evaluate(usage.get(&charge.day).cloned(), &previous);
        if let Some(entry) = outcome.entry() {
            usage.insert(entry.day, entry.clone());
        }
        Ok(outcome)
    }
}
