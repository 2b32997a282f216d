//! Core data models shared by the analysis pipeline.
//!
//! Offsets everywhere in this crate are UTF-8 byte offsets into the original
//! transcript and always fall on `char` boundaries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Finding category. The wire names are fixed by the client contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Manipulation,
    CognitiveBias,
    #[serde(alias = "rhetorical_fallacy")]
    RhetologicalFallacy,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Manipulation,
        Category::CognitiveBias,
        Category::RhetologicalFallacy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Manipulation => "manipulation",
            Category::CognitiveBias => "cognitive_bias",
            Category::RhetologicalFallacy => "rhetological_fallacy",
        }
    }

    /// Lenient parse used on model output: accepts spaced, hyphenated and
    /// common alternate spellings.
    pub fn parse(raw: &str) -> Option<Category> {
        let norm: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match norm.as_str() {
            "manipulation" | "manipulative" | "manipulation_tactic" => Some(Category::Manipulation),
            "cognitive_bias" | "bias" | "cognitive_biases" => Some(Category::CognitiveBias),
            "rhetological_fallacy" | "rhetorical_fallacy" | "logical_fallacy" | "fallacy" => {
                Some(Category::RhetologicalFallacy)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-text profile fields passed to the model as context only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileContext(pub BTreeMap<String, String>);

impl ProfileContext {
    /// Flatten a JSON object into string fields. Non-object input yields an
    /// empty profile; nested values are kept as compact JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut fields = BTreeMap::new();
        if let Some(obj) = value.as_object() {
            for (key, v) in obj {
                let text = match v {
                    serde_json::Value::Null => continue,
                    serde_json::Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                };
                if !text.is_empty() {
                    fields.insert(key.clone(), text);
                }
            }
        }
        ProfileContext(fields)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// A caller's request to analyze one transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub client_id: String,
    pub text: String,
    /// Speakers to focus on. `None` or empty means every speaker.
    #[serde(default)]
    pub participants: Option<Vec<String>>,
    #[serde(default)]
    pub profile: Option<ProfileContext>,
}

impl AnalysisRequest {
    pub fn new(client_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            text: text.into(),
            participants: None,
            profile: None,
        }
    }

    /// Participant filter with blanks removed, or `None` when it selects everyone.
    pub fn participant_filter(&self) -> Option<Vec<String>> {
        let names: Vec<String> = self
            .participants
            .as_ref()?
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names)
        }
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes shared with `other`.
    pub fn overlap(&self, other: &Span) -> usize {
        let lo = self.start.max(other.start);
        let hi = self.end.min(other.end);
        hi.saturating_sub(lo)
    }

    pub fn union(&self, other: &Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }

    pub fn shift(&self, by: usize) -> Span {
        Span::new(self.start + by, self.end + by)
    }
}

/// A bounded slice of the original transcript analyzed by one model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based, contiguous.
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Bytes shared with the previous chunk (0 for the first chunk).
    pub overlap: usize,
}

impl Chunk {
    /// 1-based number used in events and logs.
    pub fn number(&self) -> usize {
        self.index + 1
    }
}

/// A validated finding from a single chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub label: String,
    pub quote: String,
    pub severity: u8,
    pub explanation: String,
    pub chunk_index: usize,
    /// Span relative to the chunk text.
    pub local: Span,
    /// Span relative to the original text.
    pub global: Span,
}

/// A merged, de-duplicated finding positioned in the original document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub id: String,
    pub category: Category,
    pub label: String,
    pub severity: u8,
    pub explanation: String,
    /// The original text covered by `[global_start, global_end)`.
    pub text: String,
    pub global_start: usize,
    pub global_end: usize,
    pub source_chunks: Vec<usize>,
}

impl Highlight {
    pub fn span(&self) -> Span {
        Span::new(self.global_start, self.global_end)
    }

    /// Category plus case-insensitive label.
    pub fn same_identity(&self, category: Category, label: &str) -> bool {
        self.category == category && labels_match(&self.label, label)
    }
}

pub fn labels_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Per-category highlight counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub manipulation: usize,
    pub cognitive_bias: usize,
    pub rhetological_fallacy: usize,
    pub total: usize,
}

impl CategoryCounts {
    pub fn from_highlights(highlights: &[Highlight]) -> Self {
        let mut counts = CategoryCounts::default();
        for h in highlights {
            match h.category {
                Category::Manipulation => counts.manipulation += 1,
                Category::CognitiveBias => counts.cognitive_bias += 1,
                Category::RhetologicalFallacy => counts.rhetological_fallacy += 1,
            }
            counts.total += 1;
        }
        counts
    }

    pub fn get(&self, category: Category) -> usize {
        match category {
            Category::Manipulation => self.manipulation,
            Category::CognitiveBias => self.cognitive_bias,
            Category::RhetologicalFallacy => self.rhetological_fallacy,
        }
    }
}

/// Where a narrative or score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightSource {
    Llm,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub counts: CategoryCounts,
    pub overall: String,
    pub strategic: String,
    pub source: InsightSource,
}

/// 0–100 negotiation risk score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Barometer {
    pub score: u8,
    pub label: String,
    pub rationale: String,
    pub source: InsightSource,
}

/// The finished record handed to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub client_id: String,
    pub highlights: Vec<Highlight>,
    pub summary: Summary,
    pub barometer: Barometer,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// 1-based numbers of chunks that failed permanently.
    #[serde(default)]
    pub failed_chunks: Vec<usize>,
}

/// An analysis as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalysis {
    pub id: String,
    #[serde(flatten)]
    pub result: AnalysisResult,
}

/// One row of the daily token ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedgerEntry {
    pub day: NaiveDate,
    pub tokens_used: u64,
    pub lock_until: Option<DateTime<Utc>>,
}

impl UsageLedgerEntry {
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            tokens_used: 0,
            lock_until: None,
        }
    }

    /// The lock timestamp if it is still in the future at `now`.
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lock_until.filter(|until| *until > now)
    }
}
