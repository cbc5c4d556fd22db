//! Sentence-boundary text chunker.
//!
//! The local fallback extractor: splits a document body into chunks of at
//! most `chunk_size` bytes on sentence boundaries, carrying the last
//! `overlap` bytes of each chunk into the next one so context survives the
//! cut.
//!
//! # Algorithm
//!
//! 1. Split text into sentences after `.`, `!` or `?` followed by whitespace.
//! 2. Append sentences to a buffer, separated by a single space.
//! 3. When appending would exceed `chunk_size` and the buffer is non-empty,
//!    flush the trimmed buffer and restart it from its overlap tail.
//! 4. Sentences longer than `max_chunk_size` are hard-split at the nearest
//!    newline or space boundary first.
//! 5. Flush the remainder. When it adds fewer than `min_chunk_size` bytes
//!    beyond the carried overlap and an earlier chunk exists, append those
//!    bytes to the earlier chunk instead.
//! 6. Drop empty chunks.
//!
//! # Example
//!
//! ```rust
//! use ragline_core::chunk::{chunk_sentences, ChunkingOptions};
//!
//! let chunks = chunk_sentences("Hello world. This is a test.", &ChunkingOptions::default());
//! assert_eq!(chunks, vec!["Hello world. This is a test.".to_string()]);
//! ```

use sha2::{Digest, Sha256};

/// Size limits for [`chunk_sentences`], in bytes.
#[derive(Debug, Clone)]
pub struct ChunkingOptions {
    pub chunk_size: usize,
    pub overlap: usize,
    /// Single sentences longer than this are hard-split.
    pub max_chunk_size: usize,
    /// A trailing chunk shorter than this joins the previous chunk.
    pub min_chunk_size: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
            max_chunk_size: 2000,
            min_chunk_size: 100,
        }
    }
}

/// Hex-encoded SHA-256 digest, the content hash used for documents and chunks.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Split `text` into overlapping, sentence-aligned chunks.
///
/// Returns trimmed, non-empty chunk texts in document order. Whitespace-only
/// input yields no chunks.
pub fn chunk_sentences(text: &str, options: &ChunkingOptions) -> Vec<String> {
    let chunk_size = options.chunk_size.max(1);
    let overlap = options.overlap.min(chunk_size.saturating_sub(1));
    let max_piece = options.max_chunk_size.max(chunk_size);

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // Bytes at the start of `current` repeated from the previous chunk.
    let mut carried = 0;

    for sentence in split_sentences(text) {
        for piece in hard_split(sentence, max_piece) {
            let would_be = if current.is_empty() {
                piece.len()
            } else {
                current.len() + 1 + piece.len()
            };

            if would_be > chunk_size && !current.is_empty() {
                chunks.push(current.trim().to_string());
                let tail = overlap_tail(&current, overlap).trim_start().to_string();
                carried = tail.len();
                current = tail;
            }

            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(piece);
        }
    }

    let fresh = current[carried..].trim();
    match chunks.last_mut() {
        Some(last) if !fresh.is_empty() && fresh.len() < options.min_chunk_size => {
            last.push(' ');
            last.push_str(fresh);
        }
        _ if !current.trim().is_empty() => chunks.push(current.trim().to_string()),
        _ => {}
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

/// Split after `.`, `!` or `?` when followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let Some(&(next_i, next_c)) = chars.peek() else {
            continue;
        };
        if !next_c.is_whitespace() {
            continue;
        }
        let end = i + c.len_utf8();
        push_trimmed(&mut sentences, &text[start..end]);
        let mut resume = next_i;
        while let Some(&(j, ws)) = chars.peek() {
            if !ws.is_whitespace() {
                resume = j;
                break;
            }
            chars.next();
            resume = j + ws.len_utf8();
        }
        start = resume;
    }
    if start < text.len() {
        push_trimmed(&mut sentences, &text[start..]);
    }
    sentences
}

fn push_trimmed<'a>(out: &mut Vec<&'a str>, s: &'a str) {
    let s = s.trim();
    if !s.is_empty() {
        out.push(s);
    }
}

/// Last `overlap` bytes of `s`, snapped forward to a char boundary.
fn overlap_tail(s: &str, overlap: usize) -> &str {
    if overlap == 0 {
        return "";
    }
    if s.len() <= overlap {
        return s;
    }
    let mut start = s.len() - overlap;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Break an oversized sentence at newline/space boundaries.
fn hard_split(sentence: &str, max_chars: usize) -> Vec<&str> {
    if sentence.len() <= max_chars {
        return vec![sentence];
    }

    let mut pieces = Vec::new();
    let mut remaining = sentence;
    while !remaining.is_empty() {
        let split_at = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let split_at = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let split_at = if split_at == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            split_at
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = &remaining[split_at..];
    }
    pieces
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
