// src/io/serial/framer.rs
//
// Newline framing for the serial monitor. Splits the raw byte stream into
// text lines the way a readline parser would: `\n` terminates a line, the
// trailing whitespace (including `\r`) is trimmed, and blank lines vanish.

/// Longest line kept before a forced split. Guards against a device that
/// never sends a newline (wrong baud rate, binary output).
pub const DEFAULT_MAX_LINE: usize = 4096;

const NEWLINE: u8 = b'\n';

/// Incremental line splitter fed with whatever chunks the port returns
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_length: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        LineFramer::new(DEFAULT_MAX_LINE)
    }
}

impl LineFramer {
    pub fn new(max_length: usize) -> Self {
        LineFramer {
            buffer: Vec::new(),
            max_length: max_length.max(1),
        }
    }

    /// Feed bytes, returning every complete non-empty line they finish
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in data {
            if byte == NEWLINE {
                let raw: Vec<u8> = self.buffer.drain(..).collect();
                push_line(&mut lines, &raw);
                continue;
            }

            self.buffer.push(byte);

            // Force split on max length
            if self.buffer.len() >= self.max_length {
                let raw: Vec<u8> = self.buffer.drain(..).collect();
                push_line(&mut lines, &raw);
            }
        }

        lines
    }

    /// Take whatever partial line is buffered (used when the port closes)
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw: Vec<u8> = self.buffer.drain(..).collect();
        normalise_line(&raw)
    }

    /// Bytes buffered waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    if let Some(line) = normalise_line(raw) {
        lines.push(line);
    }
}

/// Decode lossily and trim; `None` when nothing but whitespace is left.
/// Leading whitespace is trimmed too, matching the browser-side expectations.
fn normalise_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
