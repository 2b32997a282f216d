//! Stored analysis retrieval by ID.
//!
//! Used by the `parley get` CLI command. The HTTP API serves the same
//! record from `GET /api/analyses/{id}`.

use anyhow::{bail, Result};

use parley_core::models::StoredAnalysis;

use crate::config::Config;
use crate::services::Services;

pub async fn get_analysis(config: &Config, id: &str) -> Result<StoredAnalysis> {
    let store = Services::open_store(config).await?;
    match store.get_analysis(id).await? {
        Some(analysis) => Ok(analysis),
        None => bail!("analysis not found: {}", id),
    }
}

/// Print a stored analysis as pretty JSON on stdout.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let analysis = get_analysis(config, id).await?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}
