//! Incremental server-sent-events line decoder.
//!
//! Network reads split events at arbitrary byte offsets, so bytes are
//! buffered until a full line is available.

/// One meaningful SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Payload of a `data:` field.
    Data(String),
    /// `data: [DONE]` terminator.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every complete `data` line they finish.
    /// Blank lines, comments and other fields (`event:`, `id:`) are dropped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = parse_line(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        parse_line(&raw)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseLine> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);

    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);

    if data.trim() == "[DONE]" {
        Some(SseLine::Done)
    } else {
        Some(SseLine::Data(data.to_string()))
    }
}
