//! Overlapping text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of at most
//! `max_tokens × CHARS_PER_TOKEN` characters. Each chunk ends on the best
//! boundary found in the back half of its window (paragraph, line,
//! sentence, then word), and the next chunk starts `overlap_ratio` of the
//! previous chunk's length before its end.
//!
//! Offsets are character positions into the input, so the same text always
//! produces the same offsets. Each chunk carries a SHA-256 hash of its text,
//! up to five key phrases and a Flesch reading-ease score.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

const MAX_KEY_PHRASES: usize = 5;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "this", "that", "with", "from", "they", "will", "would",
    "there", "their", "what", "about", "which", "when", "your", "into", "than", "then", "them",
    "these", "those", "been", "were", "also", "more", "some", "such", "only", "other", "its",
    "how", "may", "use", "each", "does", "did", "just", "over", "very", "most", "where", "while",
];

/// Split `text` into overlapping chunks. Empty or whitespace-only text
/// yields no chunks. A run of blank text too long for one window is
/// attached to the chunk after it, or to the last chunk at the end of the
/// text, so no chunk is blank.
pub fn chunk_text(document_id: &str, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.iter().all(|c| c.is_whitespace()) {
        return Vec::new();
    }

    let max_chars = (config.max_tokens * CHARS_PER_TOKEN).max(1);
    let n = chars.len();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut start = 0usize;
    let mut carry_start: Option<usize> = None;

    while start < n {
        let hard_end = (start + max_chars).min(n);
        let end = if hard_end == n {
            n
        } else {
            find_break(&chars, start + max_chars / 2, hard_end)
        };

        if chars[start..end].iter().all(|c| c.is_whitespace()) {
            // A blank window is folded into its neighbours so the chunks
            // still cover the whole text.
            if end >= n {
                if let Some(last) = chunks.pop() {
                    let from = last.start as usize;
                    let text: String = chars[from..n].iter().collect();
                    chunks.push(make_chunk(document_id, last.chunk_index, from, n, text));
                }
                break;
            }
            carry_start.get_or_insert(start);
            start = end;
            continue;
        }

        let from = carry_start.take().unwrap_or(start);
        let piece: String = chars[from..end].iter().collect();
        chunks.push(make_chunk(
            document_id,
            chunks.len() as i64,
            from,
            end,
            piece,
        ));

        if end >= n {
            break;
        }

        let overlap = ((end - start) as f64 * config.overlap_ratio).round() as usize;
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// Pick the end of a chunk within `[min_end, hard_end]`, preferring the
/// strongest boundary closest to `hard_end`.
fn find_break(chars: &[char], min_end: usize, hard_end: usize) -> usize {
    let window = min_end..hard_end;

    // Paragraph break: position after "\n\n".
    for i in window.clone().rev() {
        if i >= 1 && chars[i - 1] == '\n' && chars[i] == '\n' {
            return i + 1;
        }
    }
    for i in window.clone().rev() {
        if chars[i] == '\n' {
            return i + 1;
        }
    }
    for i in window.clone().rev() {
        if matches!(chars[i], '.' | '!' | '?')
            && chars.get(i + 1).map(|c| c.is_whitespace()).unwrap_or(false)
        {
            return i + 1;
        }
    }
    for i in window.rev() {
        if chars[i].is_whitespace() {
            return i + 1;
        }
    }
    hard_end
}

fn make_chunk(document_id: &str, index: i64, start: usize, end: usize, text: String) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        start: start as i64,
        end: end as i64,
        key_phrases: key_phrases(&text),
        readability: readability(&text),
        text,
        hash,
    }
}

/// Most frequent non-stopword terms, ties broken alphabetically.
pub fn key_phrases(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in words(text) {
        let lower = word.to_lowercase();
        if lower.chars().count() < 3
            || STOPWORDS.contains(&lower.as_str())
            || lower.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        *counts.entry(lower).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(MAX_KEY_PHRASES)
        .map(|(w, _)| w)
        .collect()
}

/// Flesch reading ease, clamped to `[0, 100]`. Higher is easier.
pub fn readability(text: &str) -> f32 {
    let words: Vec<&str> = words(text).collect();
    if words.is_empty() {
        return 0.0;
    }
    let sentences = text
        .split(['.', '!', '?'])
        .filter(|s| s.chars().any(|c| c.is_alphanumeric()))
        .count()
        .max(1);
    let syllables: usize = words.iter().map(|w| count_syllables(w)).sum();

    let wps = words.len() as f32 / sentences as f32;
    let spw = syllables as f32 / words.len() as f32;
    (206.835 - 1.015 * wps - 84.6 * spw).clamp(0.0, 100.0)
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
}

fn count_syllables(word: &str) -> usize {
    let mut count = 0;
    let mut prev_vowel = false;
    for c in word.chars().flat_map(|c| c.to_lowercase()) {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    if word.len() > 2 && word.to_lowercase().ends_with('e') && count > 1 {
        count -= 1;
    }
    count.max(1)
}

/// Rebuild a document's text from its chunks, dropping overlapped regions.
///
/// Chunks must belong to one document; they are ordered by index here.
pub fn reconstruct_text(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);

    let mut out = String::new();
    let mut covered: i64 = 0;
    for chunk in ordered {
        if chunk.end <= covered {
            continue;
        }
        let skip = (covered - chunk.start).max(0) as usize;
        out.extend(chunk.text.chars().skip(skip));
        covered = chunk.end;
    }
    out
}
