//! Extraction of `<thinking>` spans from streamed model output.
//!
//! Models wrap reasoning in marker tags; the extractor splits each text
//! delta into a (thinking, content) pair, recognizing markers that straddle
//! chunk boundaries. At most one partial marker is carried between calls,
//! so the buffer never exceeds the longest marker.

use serde::Deserialize;

/// How thinking output is handled during a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingMode {
    /// No extraction; text streams through untouched.
    #[default]
    Off,
    /// Accumulate thinking and emit it once at the end of the stream.
    On,
    /// Emit thinking deltas as they arrive, alongside content deltas.
    Stream,
}

/// Marker pairs recognized by the extractor. Order matters only for
/// longest-match checks, handled below.
const MARKERS: &[(&str, &str)] = &[
    ("<thinking>", "</thinking>"),
    ("<thought>", "</thought>"),
    ("<antthinking>", "</antthinking>"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    Inside(usize), // index into MARKERS of the span being read
}

/// Splits streamed text into thinking and content deltas.
pub struct ThinkingExtractor {
    state: State,
    /// Carry-over that might be the start of a marker.
    carry: String,
}

impl Default for ThinkingExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingExtractor {
    pub fn new() -> Self {
        Self {
            state: State::Outside,
            carry: String::new(),
        }
    }

    /// Candidate markers for the current state.
    fn candidates(&self) -> Vec<(usize, &'static str)> {
        match self.state {
            State::Outside => MARKERS.iter().enumerate().map(|(i, (open, _))| (i, *open)).collect(),
            State::Inside(i) => vec![(i, MARKERS[i].1)],
        }
    }

    /// Process one chunk, returning `(thinking_delta, content_delta)`.
    pub fn extract_chunk(&mut self, chunk: &str) -> (String, String) {
        let mut thinking = String::new();
        let mut content = String::new();

        let input = format!("{}{}", std::mem::take(&mut self.carry), chunk);
        let bytes = input.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'<' {
                let ch = input[i..].chars().next().unwrap();
                match self.state {
                    State::Outside => content.push(ch),
                    State::Inside(_) => thinking.push(ch),
                }
                i += ch.len_utf8();
                continue;
            }

            let rest = &input[i..];
            let mut matched = None;
            let mut partial = false;
            for (marker_index, marker) in self.candidates() {
                if rest.starts_with(marker) {
                    matched = Some((marker_index, marker.len()));
                    break;
                }
                if marker.starts_with(rest) {
                    partial = true;
                }
            }

            if let Some((marker_index, len)) = matched {
                self.state = match self.state {
                    State::Outside => State::Inside(marker_index),
                    State::Inside(_) => State::Outside,
                };
                i += len;
            } else if partial {
                // Could be a marker split across chunks; hold the tail.
                self.carry = rest.to_owned();
                break;
            } else {
                match self.state {
                    State::Outside => content.push('<'),
                    State::Inside(_) => thinking.push('<'),
                }
                i += 1;
            }
        }

        (thinking, content)
    }

    /// Flush any held partial marker at end of stream.
    pub fn finish(&mut self) -> (String, String) {
        let tail = std::mem::take(&mut self.carry);
        match self.state {
            State::Outside => (String::new(), tail),
            State::Inside(_) => (tail, String::new()),
        }
    }

    /// Convenience for non-streaming extraction over a complete text.
    pub fn extract_all(text: &str) -> (String, String) {
        let mut extractor = Self::new();
        let (mut thinking, mut content) = extractor.extract_chunk(text);
        let (t, c) = extractor.finish();
        thinking.push_str(&t);
        content.push_str(&c);
        (thinking, content)
    }
}
