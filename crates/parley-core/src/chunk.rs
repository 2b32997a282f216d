//! Boundary-aware overlapping text chunker.
//!
//! Splits a transcript into [`Chunk`]s of at most `max_chunk_chars` bytes.
//! Adjacent chunks share roughly `overlap_chars` bytes so that a phrase cut
//! by one boundary is still whole in the neighbouring chunk.
//!
//! # Algorithm
//!
//! 1. Blank text yields no chunks; text that fits yields exactly one chunk.
//! 2. For each chunk, look for a cut inside a tolerance window (`max / 4`
//!    bytes) that ends at `start + max`. Preference order: paragraph break
//!    (`\n\n`), sentence end, any whitespace.
//! 3. With no boundary in the window, hard-cut at the last char boundary.
//! 4. The next chunk starts `overlap` bytes before the cut, nudged forward to
//!    the next word start, and always strictly after the previous start.
//!
//! Offsets are byte offsets on `char` boundaries; `chunk.text` is always
//! `text[chunk.start..chunk.end]`.
//!
//! # Example
//!
//! ```rust
//! use parley_core::chunk::split;
//!
//! let chunks = split("Short transcript.", 1000, 100);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].overlap, 0);
//! ```

use crate::models::Chunk;

/// Split `text` into ordered, overlapping chunks.
///
/// # Guarantees
///
/// - Chunk indices are contiguous: `0, 1, …, N-1`.
/// - Every chunk is at most `max_chunk_chars` bytes long.
/// - Concatenating `chunk.text[chunk.overlap..]` over all chunks yields `text`.
/// - Identical inputs always produce identical output.
pub fn split(text: &str, max_chunk_chars: usize, overlap_chars: usize) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let max = max_chunk_chars.max(1);
    let len = text.len();
    if len <= max {
        return vec![make_chunk(text, 0, 0, len, 0)];
    }

    let overlap = overlap_chars.min(max / 2);
    let tolerance = (max / 4).max(1);

    let mut chunks = Vec::new();
    let mut start: usize = 0;
    let mut prev_end: usize = 0;

    loop {
        let end = if start + max >= len {
            len
        } else {
            find_cut(text, start, start + max, tolerance)
        };
        let shared = if chunks.is_empty() {
            0
        } else {
            prev_end.saturating_sub(start)
        };
        chunks.push(make_chunk(text, chunks.len(), start, end, shared));

        if end >= len {
            break;
        }
        prev_end = end;
        start = next_start(text, start, end, overlap);
    }

    chunks
}

/// Choose the end of a chunk that starts at `start` and may not pass `limit`.
fn find_cut(text: &str, start: usize, limit: usize, tolerance: usize) -> usize {
    let hard = floor_char_boundary(text, limit);
    let lo = ceil_char_boundary(text, limit.saturating_sub(tolerance).max(start + 1));

    if lo < hard {
        let window = &text[lo..hard];
        if let Some(pos) = window.rfind("\n\n") {
            return lo + pos + 2;
        }
        if let Some(pos) = sentence_end(window) {
            return lo + pos;
        }
        if let Some((pos, c)) = window.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
            return lo + pos + c.len_utf8();
        }
    }

    if hard > start {
        hard
    } else {
        // A single char wider than the whole budget.
        ceil_char_boundary(text, start + 1)
    }
}

/// Byte index just past the last sentence terminator in `window`: `.`, `!`
/// or `?` followed by whitespace, or a newline.
fn sentence_end(window: &str) -> Option<usize> {
    let mut following: Option<char> = None;
    for (i, c) in window.char_indices().rev() {
        if c == '\n' {
            return Some(i + 1);
        }
        if matches!(c, '.' | '!' | '?') && following.is_some_and(char::is_whitespace) {
            return Some(i + 1);
        }
        following = Some(c);
    }
    None
}

fn next_start(text: &str, start: usize, end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }

    let mut next = floor_char_boundary(text, end.saturating_sub(overlap));
    let at_word_start = next == 0 || text[..next].ends_with(char::is_whitespace);
    if !at_word_start {
        if let Some((pos, c)) = text[next..end].char_indices().find(|(_, c)| c.is_whitespace()) {
            let mut candidate = next + pos + c.len_utf8();
            while candidate < end {
                match text[candidate..].chars().next() {
                    Some(ws) if ws.is_whitespace() => candidate += ws.len_utf8(),
                    _ => break,
                }
            }
            if candidate < end {
                next = candidate;
            }
        }
    }

    if next <= start {
        end
    } else {
        next
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Snap a byte index forward to the nearest valid UTF-8 char boundary.
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn make_chunk(text: &str, index: usize, start: usize, end: usize, overlap: usize) -> Chunk {
    Chunk {
        index,
        start,
        end,
        text: text[start..end].to_string(),
        overlap,
    }
}
