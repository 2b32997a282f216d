//! Cross-chunk highlight reconciliation.
//!
//! Overlapping chunks report the same phrase more than once, often with
//! slightly different spans. The merger folds those reports into a single
//! [`Highlight`] so the caller sees one entry per logical finding.
//!
//! Two highlights are the same logical finding when they share a category,
//! their labels are equal ignoring case, and their global spans overlap by
//! more than half of the shorter span. Merging keeps:
//!
//! | Field | Rule |
//! |-------|------|
//! | span | union of both spans |
//! | severity | maximum |
//! | id, explanation | first seen |
//! | source chunks | sorted union |
//!
//! Merges cascade: a widened span may now qualify against another highlight,
//! so merging repeats until no pair qualifies.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AnalysisError;
use crate::models::{Chunk, Finding, Highlight, Span};

/// What changed after one [`HighlightMerger::ingest`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestOutcome {
    /// Highlights that did not exist before this call, in their current form.
    pub fresh: Vec<Highlight>,
    /// `true` when a previously reported highlight changed or disappeared.
    pub corrected: bool,
}

struct Entry {
    seq: usize,
    highlight: Highlight,
}

/// Accumulates findings from all chunks of one analysis.
pub struct HighlightMerger {
    text: Arc<str>,
    entries: Vec<Entry>,
    next_seq: usize,
}

impl HighlightMerger {
    pub fn new(text: Arc<str>) -> Self {
        Self {
            text,
            entries: Vec::new(),
            next_seq: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold one chunk's findings into the highlight set.
    pub fn ingest(&mut self, findings: &[Finding], chunk: &Chunk) -> IngestOutcome {
        let before: HashMap<String, Highlight> = self
            .entries
            .iter()
            .map(|e| (e.highlight.id.clone(), e.highlight.clone()))
            .collect();

        let mut merged_any = false;
        for finding in findings {
            let span = finding.global;
            if span.is_empty() || span.end > self.text.len() {
                tracing::debug!(
                    chunk = chunk.number(),
                    start = span.start,
                    end = span.end,
                    "dropping finding with out-of-range span"
                );
                continue;
            }

            let candidate = self.highlight_from(finding, chunk.number());
            let target = self.entries.iter().position(|e| {
                e.highlight.same_identity(candidate.category, &candidate.label)
                    && same_logical(&e.highlight.span(), &span)
            });

            match target {
                Some(idx) => {
                    self.absorb(idx, candidate);
                    merged_any = true;
                }
                None => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    let mut highlight = candidate;
                    highlight.id = format!("hl-{:04}", seq);
                    self.entries.push(Entry { seq, highlight });
                }
            }
        }

        if merged_any {
            self.cascade(same_logical);
        }

        let mut outcome = IngestOutcome::default();
        for entry in &self.entries {
            if !before.contains_key(&entry.highlight.id) {
                outcome.fresh.push(entry.highlight.clone());
            }
        }
        outcome.corrected = before.iter().any(|(id, old)| {
            match self.entries.iter().find(|e| &e.highlight.id == id) {
                Some(entry) => entry.highlight != *old,
                None => true,
            }
        });
        outcome
    }

    /// The current highlight set, sorted by position.
    pub fn canonical(&self) -> Vec<Highlight> {
        let mut list: Vec<Highlight> = self.entries.iter().map(|e| e.highlight.clone()).collect();
        sort_highlights(&mut list);
        list
    }

    /// Coalesce residual overlaps and return the final sorted list.
    ///
    /// After finalization highlights sharing a category and label never
    /// overlap at all.
    pub fn finalize(&mut self) -> Vec<Highlight> {
        self.cascade(|a: &Span, b: &Span| a.overlap(b) > 0);

        let list = self.canonical();
        if let Err(err) = check_disjoint(&list) {
            tracing::error!(error = %err, "highlight merge invariant violated");
        }
        list
    }

    fn highlight_from(&self, finding: &Finding, chunk_number: usize) -> Highlight {
        let span = finding.global;
        Highlight {
            id: String::new(),
            category: finding.category,
            label: finding.label.trim().to_string(),
            severity: finding.severity,
            explanation: finding.explanation.clone(),
            text: self.slice(span),
            global_start: span.start,
            global_end: span.end,
            source_chunks: vec![chunk_number],
        }
    }

    fn slice(&self, span: Span) -> String {
        self.text
            .get(span.start..span.end)
            .unwrap_or_default()
            .to_string()
    }

    /// Merge `other` into the entry at `idx`, which keeps its id and explanation.
    fn absorb(&mut self, idx: usize, other: Highlight) {
        let span = self.entries[idx].highlight.span().union(&other.span());
        let text = self.slice(span);
        let target = &mut self.entries[idx].highlight;
        target.global_start = span.start;
        target.global_end = span.end;
        target.text = text;
        target.severity = target.severity.max(other.severity);
        for chunk in other.source_chunks {
            if !target.source_chunks.contains(&chunk) {
                target.source_chunks.push(chunk);
            }
        }
        target.source_chunks.sort_unstable();
    }

    /// Repeatedly merge same-identity pairs accepted by `qualifies`.
    fn cascade(&mut self, qualifies: fn(&Span, &Span) -> bool) {
        while let Some((keep, drop)) = self.find_pair(qualifies) {
            let absorbed = self.entries.remove(drop);
            let keep = if drop < keep { keep - 1 } else { keep };
            tracing::trace!(
                keep = %self.entries[keep].highlight.id,
                absorbed = %absorbed.highlight.id,
                "cascading highlight merge"
            );
            self.absorb(keep, absorbed.highlight);
        }
    }

    /// Indices `(keep, drop)` of a mergeable pair; the older entry is kept.
    fn find_pair(&self, qualifies: fn(&Span, &Span) -> bool) -> Option<(usize, usize)> {
        for i in 0..self.entries.len() {
            for j in (i + 1)..self.entries.len() {
                let (a, b) = (&self.entries[i], &self.entries[j]);
                if a.highlight.same_identity(b.highlight.category, &b.highlight.label)
                    && qualifies(&a.highlight.span(), &b.highlight.span())
                {
                    return if a.seq <= b.seq { Some((i, j)) } else { Some((j, i)) };
                }
            }
        }
        None
    }
}

/// Overlap strictly greater than half of the shorter span.
fn same_logical(a: &Span, b: &Span) -> bool {
    let shorter = a.len().min(b.len());
    shorter > 0 && a.overlap(b) * 2 > shorter
}

fn sort_highlights(list: &mut [Highlight]) {
    list.sort_by(|a, b| {
        a.global_start
            .cmp(&b.global_start)
            .then(a.global_end.cmp(&b.global_end))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Same category and label must never overlap in a finalized list.
fn check_disjoint(list: &[Highlight]) -> Result<(), AnalysisError> {
    for (i, a) in list.iter().enumerate() {
        for b in &list[i + 1..] {
            if a.same_identity(b.category, &b.label) && a.span().overlap(&b.span()) > 0 {
                return Err(AnalysisError::MergeInvariant(format!(
                    "{} and {} overlap ({}..{} / {}..{})",
                    a.id, b.id, a.global_start, a.global_end, b.global_start, b.global_end
                )));
            }
        }
    }
    Ok(())
}
