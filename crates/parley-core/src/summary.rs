//! Deterministic summary and barometer used when no model is available.
//!
//! The barometer is a weighted severity sum squashed into `0..=100`:
//!
//! ```text
//! raw   = Σ severity × weight(category)
//! score = round(100 × raw / (raw + 12))
//! ```
//!
//! Manipulation carries weight 1.5, the other categories 1.0. The curve is
//! steep for the first few findings and saturates slowly, so a long hostile
//! transcript approaches but never reaches 100.

use std::collections::HashMap;

use crate::models::{Barometer, Category, CategoryCounts, Highlight, InsightSource, Summary};

const SATURATION: f64 = 12.0;

pub fn category_weight(category: Category) -> f64 {
    match category {
        Category::Manipulation => 1.5,
        Category::CognitiveBias | Category::RhetologicalFallacy => 1.0,
    }
}

/// Label for a barometer score.
pub fn barometer_label(score: u8) -> &'static str {
    match score {
        0..=24 => "calm",
        25..=49 => "guarded",
        50..=74 => "tense",
        _ => "hostile",
    }
}

pub fn heuristic_score(highlights: &[Highlight]) -> u8 {
    let raw: f64 = highlights
        .iter()
        .map(|h| f64::from(h.severity) * category_weight(h.category))
        .sum();
    if raw <= 0.0 {
        return 0;
    }
    (100.0 * raw / (raw + SATURATION)).round().clamp(0.0, 100.0) as u8
}

pub fn heuristic_barometer(highlights: &[Highlight]) -> Barometer {
    let score = heuristic_score(highlights);
    let high = highlights.iter().filter(|h| h.severity >= 3).count();
    let rationale = if highlights.is_empty() {
        "No risk signals were detected in the transcript.".to_string()
    } else {
        format!(
            "Weighted severity of {} highlight(s), {} of them high severity; manipulation counts 1.5x.",
            highlights.len(),
            high
        )
    };
    Barometer {
        score,
        label: barometer_label(score).to_string(),
        rationale,
        source: InsightSource::Heuristic,
    }
}

pub fn heuristic_summary(highlights: &[Highlight]) -> Summary {
    let counts = CategoryCounts::from_highlights(highlights);
    if counts.total == 0 {
        return Summary {
            counts,
            overall: "No manipulation tactics, cognitive biases or fallacies were detected."
                .to_string(),
            strategic: "The conversation reads as straightforward; proceed on the merits of the offer."
                .to_string(),
            source: InsightSource::Heuristic,
        };
    }

    let mut overall = format!(
        "Detected {} highlight(s): {} manipulation, {} cognitive bias, {} rhetological fallacy.",
        counts.total, counts.manipulation, counts.cognitive_bias, counts.rhetological_fallacy
    );
    if let Some((label, n)) = most_frequent_label(highlights) {
        overall.push_str(&format!(" Most frequent pattern: \"{}\" ({}x).", label, n));
    }

    let dominant = Category::ALL
        .iter()
        .copied()
        .max_by_key(|c| (counts.get(*c), std::cmp::Reverse(*c)))
        .unwrap_or(Category::Manipulation);
    let strategic = match dominant {
        Category::Manipulation => {
            "Slow the pace, restate terms in writing and do not commit under artificial pressure."
        }
        Category::CognitiveBias => {
            "Anchor on independent benchmarks and revisit figures that were framed for you."
        }
        Category::RhetologicalFallacy => {
            "Ask for evidence behind claims and separate the argument from who is making it."
        }
    }
    .to_string();

    Summary {
        counts,
        overall,
        strategic,
        source: InsightSource::Heuristic,
    }
}

/// Most common label (case-insensitive); ties go to the earliest highlight.
fn most_frequent_label(highlights: &[Highlight]) -> Option<(String, usize)> {
    let mut tally: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, h) in highlights.iter().enumerate() {
        let entry = tally.entry(h.label.to_lowercase()).or_insert((0, pos));
        entry.0 += 1;
    }
    tally
        .into_values()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(count, first)| (highlights[first].label.clone(), count))
}
