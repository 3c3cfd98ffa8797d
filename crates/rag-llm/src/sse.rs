//! Server-sent event line decoding.

/// Marker prefixing payload lines.
const DATA_PREFIX: &str = "data:";

/// Payload that ends a chat-completions stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Splits a byte stream into text lines.
///
/// Bytes are buffered until a newline so multi-byte characters split
/// across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Feed bytes, returning every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Return the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    let line: &str = &line;
    line.strip_suffix('\r').unwrap_or(line).to_string()
}

/// Classification of one event-stream line.
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// A `data:` payload.
    Data(&'a str),
    /// The terminal sentinel.
    Done,
    /// Anything else: comments, `event:` names, blank separators.
    Ignored,
}

pub fn classify(line: &str) -> SseLine<'_> {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return SseLine::Ignored;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        SseLine::Done
    } else if payload.is_empty() {
        SseLine::Ignored
    } else {
        SseLine::Data(payload)
    }
}
