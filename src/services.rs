//! Process-wide wiring shared by the HTTP server and the CLI.
//!
//! One store, one ledger and (when a model is configured) one orchestrator
//! per process. The ledger must be shared so every request charges the same
//! per-day counters.

use std::sync::Arc;

use anyhow::Result;

use parley_core::store::AnalysisStore;

use crate::budget::TokenBudgetLedger;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::orchestrator::{AnalysisSettings, Orchestrator};
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

pub struct Services {
    pub store: Arc<dyn AnalysisStore>,
    pub ledger: Arc<TokenBudgetLedger>,
    /// `None` when the model provider is disabled.
    pub orchestrator: Option<Arc<Orchestrator>>,
}

impl Services {
    pub fn new(
        config: &Config,
        store: Arc<dyn AnalysisStore>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        let ledger = Arc::new(TokenBudgetLedger::new(store.clone(), &config.budget));
        let orchestrator = llm.map(|llm| {
            Arc::new(Orchestrator::new(
                llm,
                ledger.clone(),
                store.clone(),
                AnalysisSettings::from_config(&config.analysis),
            ))
        });
        Self {
            store,
            ledger,
            orchestrator,
        }
    }

    /// Open the configured database, migrating it if needed.
    pub async fn open_store(config: &Config) -> Result<Arc<dyn AnalysisStore>> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Arc::new(SqliteStore::new(pool)))
    }
}
