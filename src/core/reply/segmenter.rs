//! Reply segmentation for streaming synthesis.
//!
//! Generated text arrives as token runs; synthesis wants speakable pieces.
//! Segments break at sentence ends, falling back to clause punctuation and
//! finally a hard word-boundary split when a run exceeds the length cap.
//! The first segment may break early at a clause so the agent starts
//! speaking before the first full sentence is generated.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ReplyConfig;

/// Sentence-terminal punctuation, optionally followed by a closing quote
/// or bracket, then whitespace.
static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[.!?]["')\]]?\s"#).unwrap_or_else(|e| panic!("{e}")));

/// Clause punctuation followed by whitespace.
static CLAUSE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[,;:]\s").unwrap_or_else(|e| panic!("{e}")));

/// One speakable chunk of reply text, ordered by `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplySegment {
    pub index: usize,
    pub text: String,
}

/// Stateful splitter fed by the generation stream.
pub struct Segmenter {
    max_chars: usize,
    first_min_chars: usize,
    buffer: String,
    emitted: usize,
}

impl Segmenter {
    pub fn new(config: &ReplyConfig) -> Self {
        Self {
            max_chars: config.max_segment_chars,
            first_min_chars: config.first_segment_min_chars,
            buffer: String::new(),
            emitted: 0,
        }
    }

    /// Feed streamed text; returns every segment that became complete.
    pub fn push(&mut self, text: &str) -> Vec<ReplySegment> {
        self.buffer.push_str(text);
        let mut out = Vec::new();
        while let Some(end) = self.next_break() {
            out.push(self.take(end));
        }
        out
    }

    /// Drain whatever remains once generation ends.
    pub fn flush(&mut self) -> Option<ReplySegment> {
        if self.buffer.trim().is_empty() {
            self.buffer.clear();
            return None;
        }
        let end = self.buffer.len();
        Some(self.take(end))
    }

    pub fn segments_emitted(&self) -> usize {
        self.emitted
    }

    /// Byte offset one past the break, or None if the buffer should keep
    /// accumulating.
    fn next_break(&self) -> Option<usize> {
        if let Some(m) = SENTENCE_END.find(&self.buffer) {
            return Some(m.end());
        }
        // Early first segment: a clause break past the minimum is enough
        if self.emitted == 0 {
            if let Some(m) = CLAUSE_BREAK
                .find_iter(&self.buffer)
                .find(|m| m.end() >= self.first_min_chars)
            {
                return Some(m.end());
            }
        }
        if self.buffer.len() > self.max_chars {
            return Some(self.hard_split());
        }
        None
    }

    /// Last word boundary within the cap, or the cap itself for one
    /// unbroken run of non-whitespace. The cap is walked back to a char
    /// boundary first; byte `max_chars` may land inside a multi-byte char.
    fn hard_split(&self) -> usize {
        let mut cap = self.max_chars;
        while !self.buffer.is_char_boundary(cap) {
            cap -= 1;
        }
        let window = &self.buffer[..cap];
        window
            .rfind(char::is_whitespace)
            .filter(|&i| i > 0)
            .unwrap_or(cap)
    }

    fn take(&mut self, end: usize) -> ReplySegment {
        let rest = self.buffer.split_off(end);
        let text = std::mem::replace(&mut self.buffer, rest)
            .trim()
            .to_string();
        let segment = ReplySegment {
            index: self.emitted,
            text,
        };
        self.emitted += 1;
        segment
    }
}
