//! Newline-delimited record framing for agent stdout.
//!
//! Reads arrive in arbitrary chunks. Complete lines are released as soon as
//! their terminator is seen; the unterminated tail stays buffered until the
//! next chunk or until [`LineBuffer::finish`] at process exit.

use bytes::BytesMut;

/// Accumulates stdout bytes and splits them into lines.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Trailing `\r` is stripped, blank lines are dropped, invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line_bytes = self.buffer.split_to(newline_pos + 1);
            line_bytes.truncate(line_bytes.len() - 1);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }
            let line = String::from_utf8_lossy(&line_bytes);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Take the unterminated tail, if any, leaving the buffer empty.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        let line = String::from_utf8_lossy(&rest);
        let trimmed = line.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Bytes currently buffered.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}
