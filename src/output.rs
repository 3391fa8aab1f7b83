//! Output capture and forwarding for supervised processes.
//!
//! This module provides the append-only buffers that hold everything a server has
//! printed since launch (`OutputBuffer`), the `OutputSink` trait used to forward
//! output for live display, and text sanitization for classification.

use std::io::Write;
#[cfg(test)]
use std::sync::Mutex;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a chunk of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Append-only capture of a process's stdout and stderr.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    stdout: String,
    stderr: String,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk to the buffer for `stream`.
    pub fn push(&mut self, stream: StreamKind, text: &str) {
        match stream {
            StreamKind::Stdout => self.stdout.push_str(text),
            StreamKind::Stderr => self.stderr.push_str(text),
        }
    }

    #[cfg(test)]
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    #[cfg(test)]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len());
        combined.push_str(&self.stdout);
        combined.push_str(&self.stderr);
        combined
    }
}

/// Destination for live process output.
pub trait OutputSink: Send + Sync {
    fn write(&self, stream: StreamKind, text: &str);
}

/// Forwards server output to this process's own stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn write(&self, stream: StreamKind, text: &str) {
        match stream {
            StreamKind::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            StreamKind::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = err.write_all(text.as_bytes());
                let _ = err.flush();
            }
        }
    }
}

/// Discards all output.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[cfg(test)]
impl OutputSink for NullSink {
    fn write(&self, _stream: StreamKind, _text: &str) {}
}

/// Keeps forwarded output in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CaptureSink {
    buffer: Mutex<OutputBuffer>,
}

#[cfg(test)]
impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> OutputBuffer {
        match self.buffer.lock() {
            Ok(buffer) => buffer.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
impl OutputSink for CaptureSink {
    fn write(&self, stream: StreamKind, text: &str) {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.push(stream, text);
    }
}

/// Decodes a byte stream into text without splitting multi-byte characters.
///
/// Bytes of an incomplete trailing sequence are held back until the next chunk;
/// invalid sequences are replaced.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `bytes`, prefixed by whatever was held back from the last call.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let remainder = rest.to_vec();
        self.pending = remainder;
        text
    }

    /// Flushes held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        text
    }
}

/// Strips ANSI escape codes so color output does not hide fatal messages.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Shortens `text` to its last `max_lines` lines for log messages.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
