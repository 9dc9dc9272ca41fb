//! Streaming line codec
//!
//! Bytes arrive from the transport in arbitrary chunks. The codec buffers them
//! and hands out complete newline-terminated lines only; a trailing partial
//! line stays buffered until the rest of it arrives.

use tracing::warn;

use crate::Message;

/// Longest line accepted before the buffered partial line is discarded
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Streaming MSG line codec
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: Vec<u8>,
    /// Set while skipping the remainder of an overlong line
    discarding: bool,
}

impl LineCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            discarding: false,
        }
    }

    /// Push raw bytes into the codec buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > MAX_LINE_LEN && !self.buffer.contains(&b'\n') {
            warn!(
                "Discarding {} buffered bytes: line exceeds {} bytes",
                self.buffer.len(),
                MAX_LINE_LEN
            );
            self.buffer.clear();
            self.discarding = true;
        }
    }

    /// Extract the next complete line (without its terminator)
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let term_pos = self.buffer.iter().position(|&b| b == b'\n')?;
            let line_bytes: Vec<u8> = self.buffer.drain(..=term_pos).collect();

            if self.discarding {
                // Tail of an overlong line
                self.discarding = false;
                continue;
            }

            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]);
            return Some(line.trim_end_matches('\r').to_string());
        }
    }

    /// Extract and decode the next complete line
    pub fn next_message(&mut self) -> Option<Message> {
        self.next_line().map(|line| Message::parse(&line))
    }

    /// Whether an incomplete line is buffered
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Clear the internal buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}
