//! Streamed analysis events.
//!
//! Every event serializes to a JSON object with a `"type"` discriminator:
//!
//! ```json
//! {"type":"analysis_started","total_chunks":4,"progress":0}
//! {"type":"highlight","id":"hl-0001","category":"manipulation",...}
//! {"type":"error","chunkNumber":2,"message":"...","fatal":false}
//! {"type":"complete","analysis_id":"...","highlight_count":7}
//! ```
//!
//! A stream ends with exactly one `complete` or one fatal `error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::models::{Barometer, Highlight, Summary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisEvent {
    AnalysisStarted {
        total_chunks: usize,
        progress: u8,
    },
    Progress {
        progress: u8,
        completed_chunks: usize,
        total_chunks: usize,
        message: String,
    },
    Highlight(Highlight),
    MergedHighlights {
        items: Vec<Highlight>,
    },
    Summary(Summary),
    Barometer(Barometer),
    Error {
        #[serde(rename = "chunkNumber", default, skip_serializing_if = "Option::is_none")]
        chunk_number: Option<usize>,
        message: String,
        fatal: bool,
        #[serde(rename = "lockUntil", default, skip_serializing_if = "Option::is_none")]
        lock_until: Option<DateTime<Utc>>,
    },
    Complete {
        analysis_id: Option<String>,
        highlight_count: usize,
    },
}

impl AnalysisEvent {
    /// Build an `error` event from an analysis error.
    pub fn from_error(err: &AnalysisError, fatal: bool) -> Self {
        AnalysisEvent::Error {
            chunk_number: err.chunk_number(),
            message: err.to_string(),
            fatal,
            lock_until: err.lock_until(),
        }
    }

    /// `complete` or a fatal `error`.
    pub fn is_terminal(&self) -> bool {
        match self {
            AnalysisEvent::Complete { .. } => true,
            AnalysisEvent::Error { fatal, .. } => *fatal,
            _ => false,
        }
    }

    /// The wire name of this event's `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisEvent::AnalysisStarted { .. } => "analysis_started",
            AnalysisEvent::Progress { .. } => "progress",
            AnalysisEvent::Highlight(_) => "highlight",
            AnalysisEvent::MergedHighlights { .. } => "merged_highlights",
            AnalysisEvent::Summary(_) => "summary",
            AnalysisEvent::Barometer(_) => "barometer",
            AnalysisEvent::Error { .. } => "error",
            AnalysisEvent::Complete { .. } => "complete",
        }
    }
}
