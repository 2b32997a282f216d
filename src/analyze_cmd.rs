//! `parley analyze`: run one analysis locally.
//!
//! Events are rendered on stderr through the selected [`ProgressMode`]; the
//! finished record is printed as JSON on stdout. Ctrl-C cancels the run and
//! nothing is persisted.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use parley_core::models::{AnalysisRequest, AnalysisResult, ProfileContext};

use crate::config::Config;
use crate::extract;
use crate::llm;
use crate::orchestrator::RunOutcome;
use crate::report::ProgressMode;
use crate::services::Services;
use crate::stream;

pub struct AnalyzeArgs<'a> {
    pub file: &'a Path,
    pub client_id: &'a str,
    pub participants: Vec<String>,
    pub profile: Option<&'a Path>,
    pub progress: ProgressMode,
}

#[derive(Serialize)]
struct AnalyzeOutput<'a> {
    id: Option<&'a str>,
    #[serde(flatten)]
    result: &'a AnalysisResult,
}

pub async fn run_analyze(config: &Config, args: AnalyzeArgs<'_>) -> Result<()> {
    if !config.llm.is_enabled() {
        bail!("Analysis requires an llm provider. Set [llm] provider in config.");
    }

    let bytes = std::fs::read(args.file)
        .with_context(|| format!("Failed to read transcript: {}", args.file.display()))?;
    let filename = args.file.file_name().and_then(|n| n.to_str());
    let text = extract::extract_text(&bytes, filename, None)?;

    let profile = match args.profile {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read profile: {}", path.display()))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).with_context(|| "profile must be a JSON object")?;
            Some(ProfileContext::from_json(&value))
        }
        None => None,
    };

    let request = AnalysisRequest {
        client_id: args.client_id.to_string(),
        text,
        participants: (!args.participants.is_empty()).then_some(args.participants),
        profile,
    };

    let store = Services::open_store(config).await?;
    let llm = llm::create_client(&config.llm)?;
    let services = Services::new(config, store, llm);
    let Some(orchestrator) = services.orchestrator.clone() else {
        bail!("Analysis requires an llm provider. Set [llm] provider in config.");
    };

    let (emitter, mut events) = stream::channel(stream::DEFAULT_CAPACITY);
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = tokio::spawn(async move { orchestrator.run(request, emitter, run_cancel).await });

    let reporter = args.progress.reporter();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => reporter.report(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!("Interrupted, cancelling analysis...");
                cancel.cancel();
            }
        }
    }

    match run.await.context("analysis task failed")? {
        RunOutcome::Completed { analysis_id, result } => {
            let output = AnalyzeOutput {
                id: analysis_id.as_deref(),
                result: &result,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        RunOutcome::Failed(err) => Err(anyhow::Error::new(err).context("analysis failed")),
        RunOutcome::Cancelled => bail!("analysis cancelled"),
    }
}
