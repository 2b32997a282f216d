//! Locating model-quoted text inside a chunk.
//!
//! Models rarely quote byte-for-byte: case changes, collapsed whitespace and
//! typographic quotes are common. Matching here is case-insensitive, treats
//! any whitespace run as equal to any other, and folds curly quotes and
//! dashes to their ASCII forms.

use std::collections::HashMap;

use crate::models::Span;

/// Strip surrounding whitespace, quote marks and ellipses from a model quote.
pub fn normalize_quote(quote: &str) -> &str {
    quote
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’' | '…'))
        .trim_end_matches("...")
        .trim_start_matches("...")
        .trim()
}

/// Find `needle` in `haystack` at or after byte offset `from`.
///
/// Returns the matched span in `haystack` coordinates. The span may differ
/// in length from `needle` when whitespace runs or folded characters differ.
pub fn find_case_insensitive(haystack: &str, needle: &str, from: usize) -> Option<Span> {
    let first = needle.chars().next()?;
    let mut from = from.min(haystack.len());
    while !haystack.is_char_boundary(from) {
        from += 1;
    }

    for (offset, c) in haystack[from..].char_indices() {
        if !chars_match(c, first) {
            continue;
        }
        let start = from + offset;
        if let Some(len) = match_len(&haystack[start..], needle) {
            return Some(Span::new(start, start + len));
        }
    }
    None
}

/// Byte length of the prefix of `hay` matching `needle`, if it matches.
fn match_len(hay: &str, needle: &str) -> Option<usize> {
    let mut h = hay.char_indices().peekable();
    let mut n = needle.chars().peekable();

    while let Some(nc) = n.next() {
        if nc.is_whitespace() {
            while n.peek().is_some_and(|c| c.is_whitespace()) {
                n.next();
            }
            match h.next() {
                Some((_, hc)) if hc.is_whitespace() => {}
                _ => return None,
            }
            while h.peek().is_some_and(|(_, c)| c.is_whitespace()) {
                h.next();
            }
        } else {
            match h.next() {
                Some((_, hc)) if chars_match(hc, nc) => {}
                _ => return None,
            }
        }
    }

    Some(h.peek().map(|(i, _)| *i).unwrap_or(hay.len()))
}

fn chars_match(a: char, b: char) -> bool {
    let (a, b) = (fold(a), fold(b));
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

fn fold(c: char) -> char {
    match c {
        '‘' | '’' | '‚' | '′' => '\'',
        '“' | '”' | '„' | '″' => '"',
        '–' | '—' | '‐' => '-',
        '\u{a0}' => ' ',
        other => other,
    }
}

/// Locates successive quotes inside one chunk.
///
/// Each distinct quote keeps its own cursor, so a phrase reported twice maps
/// to its first and then its second occurrence. When no later occurrence
/// exists the first one is reused.
pub struct QuoteLocator<'a> {
    text: &'a str,
    cursors: HashMap<String, usize>,
}

impl<'a> QuoteLocator<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            cursors: HashMap::new(),
        }
    }

    /// Locate `quote`, returning its chunk-local span.
    pub fn locate(&mut self, quote: &str) -> Option<Span> {
        let needle = normalize_quote(quote);
        if needle.is_empty() {
            return None;
        }
        let key = needle.to_lowercase();
        let from = self.cursors.get(&key).copied().unwrap_or(0);

        let span = find_case_insensitive(self.text, needle, from).or_else(|| {
            if from > 0 {
                find_case_insensitive(self.text, needle, 0)
            } else {
                None
            }
        })?;

        self.cursors.insert(key, span.end);
        Some(span)
    }
}
