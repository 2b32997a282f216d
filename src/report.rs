//! Analysis progress reporting for `parley analyze`.
//!
//! Events are rendered on **stderr** so stdout stays reserved for the final
//! JSON result.

use std::io::Write;

use parley_core::AnalysisEvent;

/// Renders analysis events as they arrive.
pub trait EventReporter: Send + Sync {
    fn report(&self, event: &AnalysisEvent);
}

/// Human-friendly lines: "analyze  [ 63%]  Analyzed chunk 5 of 8".
pub struct StderrReporter;

impl EventReporter for StderrReporter {
    fn report(&self, event: &AnalysisEvent) {
        let line = match event {
            AnalysisEvent::AnalysisStarted { total_chunks, .. } => {
                format!("analyze  started  {} chunk(s)\n", format_number(*total_chunks as u64))
            }
            AnalysisEvent::Progress { progress, message, .. } => {
                format!("analyze  [{:>3}%]  {}\n", progress, message)
            }
            AnalysisEvent::Highlight(h) => format!(
                "  + {} / {} (severity {}): \"{}\"\n",
                h.category, h.label, h.severity, h.text
            ),
            AnalysisEvent::MergedHighlights { items } => {
                format!("  ~ highlights merged, {} remain\n", items.len())
            }
            AnalysisEvent::Summary(summary) => format!("summary  {}\n", summary.overall),
            AnalysisEvent::Barometer(b) => {
                format!("barometer  {}/100 ({})\n", b.score, b.label)
            }
            AnalysisEvent::Error {
                chunk_number,
                message,
                fatal,
                lock_until,
            } => {
                let mut line = String::from(if *fatal { "error" } else { "warning" });
                if let Some(n) = chunk_number {
                    line.push_str(&format!("  chunk {}", n));
                }
                line.push_str(&format!("  {}", message));
                if let Some(until) = lock_until {
                    line.push_str(&format!("  (locked until {})", until.to_rfc3339()));
                }
                line.push('\n');
                line
            }
            AnalysisEvent::Complete {
                analysis_id,
                highlight_count,
            } => format!(
                "complete  {} highlight(s)  id={}\n",
                format_number(*highlight_count as u64),
                analysis_id.as_deref().unwrap_or("-")
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable events: one JSON object per line on stderr, in the
/// same shape the HTTP stream carries.
pub struct JsonReporter;

impl EventReporter for JsonReporter {
    fn report(&self, event: &AnalysisEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoReporter;

impl EventReporter for NoReporter {
    fn report(&self, _event: &AnalysisEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn EventReporter> {
        match self {
            ProgressMode::Off => Box::new(NoReporter),
            ProgressMode::Human => Box::new(StderrReporter),
            ProgressMode::Json => Box::new(JsonReporter),
        }
    }
}
