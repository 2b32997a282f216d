//! End-to-end driver for one analysis run.
//!
//! ```text
//! Validating → BudgetCheck → Chunking → Analyzing → Summarizing → Complete
//!      │            │            │
//!      └────────────┴────────────┴──→ Failed
//! ```
//!
//! - **BudgetCheck** reserves the prompt estimate for the first chunk, so a
//!   locked or exhausted budget fails the run before any event but the
//!   fatal `error`. Chunk 0 then runs as prepaid.
//! - **Analyzing** keeps at most `max_concurrency` chunk tasks in a
//!   [`JoinSet`]. Results are merged in completion order; progress is
//!   `completed × 95 / total`.
//! - A budget rejection after the first chunk stops dispatch but the run
//!   still summarizes whatever finished.
//! - Cancellation, caller disconnect or the run deadline stop dispatch,
//!   detach in-flight tasks so their billing completes, and persist nothing.
//!   They only race analysis and summarizing: once the result is built, the
//!   save and the `complete` event always run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use parley_core::chunk;
use parley_core::merge::HighlightMerger;
use parley_core::models::{
    AnalysisRequest, AnalysisResult, Barometer, Chunk, Highlight, InsightSource, Summary,
};
use parley_core::store::AnalysisStore;
use parley_core::summary::{heuristic_barometer, heuristic_summary};
use parley_core::{AnalysisError, AnalysisEvent, Result};

use crate::analyzer::{ChunkAnalyzer, ChunkContext, ChunkReport};
use crate::budget::TokenBudgetLedger;
use crate::config::AnalysisConfig;
use crate::llm::LlmClient;
use crate::prompt::PromptContext;
use crate::stream::StreamEmitter;

/// Share of the progress bar covered by chunk analysis.
const ANALYSIS_PROGRESS: usize = 95;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    pub max_text_chars: usize,
    pub chunk_chars: usize,
    pub overlap_chars: usize,
    pub max_concurrency: usize,
    pub max_highlights_per_1000_words: u32,
    pub llm_summary: bool,
    pub run_timeout: Option<Duration>,
}

impl AnalysisSettings {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            max_text_chars: config.max_text_chars,
            chunk_chars: config.chunk_chars,
            overlap_chars: config.overlap_chars,
            max_concurrency: config.max_concurrency.max(1),
            max_highlights_per_1000_words: config.max_highlights_per_1000_words,
            llm_summary: config.llm_summary,
            run_timeout: config.run_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Validating,
    BudgetCheck,
    Chunking,
    Analyzing,
    Summarizing,
    Complete,
    Failed,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        analysis_id: Option<String>,
        result: Box<AnalysisResult>,
    },
    Failed(AnalysisError),
    /// Cancelled, disconnected or timed out. Nothing was persisted.
    Cancelled,
}

/// Why the run stopped before `Complete`.
enum Halt {
    Failed(AnalysisError),
    Cancelled(&'static str),
    TimedOut,
}

impl From<AnalysisError> for Halt {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::StreamTransport => Halt::Cancelled("caller disconnected"),
            other => Halt::Failed(other),
        }
    }
}

/// Mutable state of the Analyzing phase.
struct Progress {
    merger: HighlightMerger,
    total: usize,
    completed: usize,
    failed_chunks: Vec<usize>,
    budget_stopped: bool,
}

pub struct Orchestrator {
    analyzer: Arc<ChunkAnalyzer>,
    store: Arc<dyn AnalysisStore>,
    ledger: Arc<TokenBudgetLedger>,
    settings: AnalysisSettings,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        ledger: Arc<TokenBudgetLedger>,
        store: Arc<dyn AnalysisStore>,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            analyzer: Arc::new(ChunkAnalyzer::new(llm, ledger.clone())),
            store,
            ledger,
            settings,
        }
    }

    pub fn ledger(&self) -> &Arc<TokenBudgetLedger> {
        &self.ledger
    }

    /// Run one analysis to completion, streaming events through `emitter`.
    pub async fn run(
        &self,
        request: AnalysisRequest,
        emitter: StreamEmitter,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("analysis", %run_id, client_id = %request.client_id);
        self.run_inner(request, emitter, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: AnalysisRequest,
        emitter: StreamEmitter,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let deadline = self.settings.run_timeout;
        let mut tasks = JoinSet::new();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Halt::Cancelled("cancelled")),
            _ = emitter.closed() => Err(Halt::Cancelled("caller disconnected")),
            _ = sleep_or_forever(deadline) => Err(Halt::TimedOut),
            outcome = self.drive(&request, &emitter, &mut tasks) => outcome,
        };

        let result = match outcome {
            Ok(result) => result,
            Err(halt) => {
                let in_flight = tasks.len();
                // Detached tasks still finish and settle their charges.
                tasks.detach_all();
                return match halt {
                    Halt::Failed(err) => {
                        transition(RunState::Failed);
                        tracing::warn!(error = %err, "analysis failed");
                        let _ = emitter.emit(AnalysisEvent::from_error(&err, true)).await;
                        RunOutcome::Failed(err)
                    }
                    Halt::Cancelled(reason) => {
                        tracing::info!(reason, in_flight, "analysis cancelled, nothing persisted");
                        RunOutcome::Cancelled
                    }
                    Halt::TimedOut => {
                        tracing::warn!(in_flight, "analysis run deadline reached");
                        let seconds = deadline.map(|d| d.as_secs()).unwrap_or_default();
                        let _ = emitter
                            .emit(AnalysisEvent::Error {
                                chunk_number: None,
                                message: format!("analysis timed out after {}s", seconds),
                                fatal: true,
                                lock_until: None,
                            })
                            .await;
                        RunOutcome::Cancelled
                    }
                };
            }
        };

        self.finish(result, &emitter).await
    }

    /// Persist a finished result and send `complete`. Runs outside the
    /// cancellation race: once saved, the run always ends as `Complete`.
    async fn finish(&self, result: AnalysisResult, emitter: &StreamEmitter) -> RunOutcome {
        let analysis_id = match self.store.save_analysis(&result).await {
            Ok(id) => Some(id),
            Err(err) => {
                let err = AnalysisError::from(err);
                tracing::error!(error = %err, "failed to persist analysis");
                let _ = emitter.emit(AnalysisEvent::from_error(&err, false)).await;
                None
            }
        };

        transition(RunState::Complete);
        let delivered = emitter
            .emit(AnalysisEvent::Complete {
                analysis_id: analysis_id.clone(),
                highlight_count: result.highlights.len(),
            })
            .await;
        if let Err(err) = delivered {
            tracing::info!(error = %err, ?analysis_id, "caller left before complete was delivered");
        }

        RunOutcome::Completed {
            analysis_id,
            result: Box::new(result),
        }
    }

    async fn drive(
        &self,
        request: &AnalysisRequest,
        emitter: &StreamEmitter,
        tasks: &mut JoinSet<(usize, Result<ChunkReport>)>,
    ) -> std::result::Result<AnalysisResult, Halt> {
        transition(RunState::Validating);
        self.validate(request)?;
        let text: Arc<str> = Arc::from(request.text.as_str());

        transition(RunState::BudgetCheck);
        let ctx = Arc::new(ChunkContext {
            total_chunks: 1,
            prompt: PromptContext {
                participants: request.participant_filter(),
                profile: request.profile.clone(),
                max_highlights_per_1000_words: self.settings.max_highlights_per_1000_words,
            },
        });
        let prefix = first_chunk_prefix(&text, self.settings.chunk_chars);
        let prepaid = ChunkAnalyzer::estimate_chunk_tokens(&prefix, &ctx);
        self.ledger.reserve_or_fail(prepaid).await?;

        transition(RunState::Chunking);
        let chunks = chunk::split(&text, self.settings.chunk_chars, self.settings.overlap_chars);
        if chunks.is_empty() {
            return Err(Halt::Failed(AnalysisError::Validation(
                "text produced no analyzable chunks".to_string(),
            )));
        }
        let total = chunks.len();
        let ctx = Arc::new(ChunkContext {
            total_chunks: total,
            prompt: ctx.prompt.clone(),
        });
        tracing::info!(chunks = total, prepaid, "transcript chunked");

        emitter
            .emit(AnalysisEvent::AnalysisStarted {
                total_chunks: total,
                progress: 0,
            })
            .await?;

        transition(RunState::Analyzing);
        let mut progress = Progress {
            merger: HighlightMerger::new(text.clone()),
            total,
            completed: 0,
            failed_chunks: Vec::new(),
            budget_stopped: false,
        };
        let mut next = 0;

        loop {
            while !progress.budget_stopped
                && tasks.len() < self.settings.max_concurrency
                && next < total
            {
                let chunk = chunks[next].clone();
                let analyzer = self.analyzer.clone();
                let ctx = ctx.clone();
                let prepaid = (next == 0).then_some(prepaid);
                tasks.spawn(async move {
                    let index = chunk.index;
                    let result = AssertUnwindSafe(analyzer.analyze(&chunk, &ctx, prepaid))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(AnalysisError::ChunkTransport {
                                chunk_number: index + 1,
                                message: "chunk analysis panicked".to_string(),
                            })
                        });
                    (index, result)
                });
                next += 1;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error = %err, "chunk task did not complete");
                    continue;
                }
            };
            self.settle(&chunks[index], result, &mut progress, emitter)
                .await?;
        }

        // Chunks never dispatched after a budget stop.
        for chunk in &chunks[next..] {
            progress.failed_chunks.push(chunk.number());
        }
        progress.failed_chunks.sort_unstable();

        transition(RunState::Summarizing);
        let highlights = progress.merger.finalize();
        let (summary, barometer) = self
            .summarize(&highlights, request, progress.budget_stopped)
            .await;

        emitter.emit(AnalysisEvent::Summary(summary.clone())).await?;
        emitter.emit(AnalysisEvent::Barometer(barometer.clone())).await?;
        emitter
            .emit(AnalysisEvent::Progress {
                progress: 100,
                completed_chunks: progress.completed,
                total_chunks: total,
                message: "Analysis complete".to_string(),
            })
            .await?;

        Ok(AnalysisResult {
            client_id: request.client_id.clone(),
            highlights,
            summary,
            barometer,
            text: request.text.clone(),
            created_at: Utc::now(),
            failed_chunks: progress.failed_chunks,
        })
    }

    fn validate(&self, request: &AnalysisRequest) -> Result<()> {
        if request.client_id.trim().is_empty() {
            return Err(AnalysisError::Validation("client_id must not be blank".to_string()));
        }
        if request.text.trim().is_empty() {
            return Err(AnalysisError::Validation("text must not be blank".to_string()));
        }
        if request.text.len() > self.settings.max_text_chars {
            return Err(AnalysisError::Validation(format!(
                "text is {} characters, limit is {}",
                request.text.len(),
                self.settings.max_text_chars
            )));
        }
        Ok(())
    }

    /// Fold one finished chunk into the run and report it.
    async fn settle(
        &self,
        chunk: &Chunk,
        result: Result<ChunkReport>,
        progress: &mut Progress,
        emitter: &StreamEmitter,
    ) -> Result<()> {
        progress.completed += 1;

        match result {
            Ok(report) => {
                if let Some(err) = report.charge_error {
                    self.chunk_error(chunk, err, progress, emitter).await?;
                }
                let outcome = progress.merger.ingest(&report.findings, chunk);
                for highlight in outcome.fresh {
                    emitter.emit(AnalysisEvent::Highlight(highlight)).await?;
                }
                if outcome.corrected {
                    emitter
                        .emit(AnalysisEvent::MergedHighlights {
                            items: progress.merger.canonical(),
                        })
                        .await?;
                }
            }
            Err(err) => {
                progress.failed_chunks.push(chunk.number());
                self.chunk_error(chunk, err, progress, emitter).await?;
            }
        }

        let percent = progress.completed * ANALYSIS_PROGRESS / progress.total;
        emitter
            .emit(AnalysisEvent::Progress {
                progress: percent as u8,
                completed_chunks: progress.completed,
                total_chunks: progress.total,
                message: format!("Analyzed chunk {} of {}", chunk.number(), progress.total),
            })
            .await
    }

    async fn chunk_error(
        &self,
        chunk: &Chunk,
        err: AnalysisError,
        progress: &mut Progress,
        emitter: &StreamEmitter,
    ) -> Result<()> {
        if let AnalysisError::BudgetExceeded { .. } = err {
            if progress.budget_stopped {
                tracing::debug!(chunk = chunk.number(), "further budget rejection after stop");
                return Ok(());
            }
            progress.budget_stopped = true;
            tracing::warn!(chunk = chunk.number(), error = %err, "budget exhausted mid-run, no further chunks");
        } else {
            tracing::warn!(chunk = chunk.number(), error = %err, "chunk failed");
        }

        emitter
            .emit(AnalysisEvent::Error {
                chunk_number: Some(chunk.number()),
                message: err.to_string(),
                fatal: false,
                lock_until: err.lock_until(),
            })
            .await
    }

    async fn summarize(
        &self,
        highlights: &[Highlight],
        request: &AnalysisRequest,
        budget_stopped: bool,
    ) -> (Summary, Barometer) {
        let fallback = heuristic_summary(highlights);
        if !self.settings.llm_summary || budget_stopped {
            return (fallback, heuristic_barometer(highlights));
        }

        match self.analyzer.summarize(highlights, request.profile.as_ref()).await {
            Ok(insights) => (
                Summary {
                    counts: fallback.counts,
                    overall: insights.overall,
                    strategic: insights.strategic,
                    source: InsightSource::Llm,
                },
                insights.barometer,
            ),
            Err(err) => {
                tracing::warn!(error = %err, "summary call failed, using heuristic summary");
                (fallback, heuristic_barometer(highlights))
            }
        }
    }
}

fn transition(state: RunState) {
    tracing::info!(state = ?state, "analysis state");
}

/// The slice chunk 0 will cover at most, used to estimate its prompt.
fn first_chunk_prefix(text: &str, chunk_chars: usize) -> Chunk {
    let mut end = chunk_chars.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Chunk {
        index: 0,
        start: 0,
        end,
        text: text[..end].to_string(),
        overlap: 0,
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
