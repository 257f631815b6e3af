//! Incremental parser for concatenated JSON objects.
//!
//! The telemetry log is neither an array nor newline-delimited: objects are
//! appended back to back, possibly pretty-printed, and a single read can end
//! anywhere inside one. The parser tracks brace depth and string state across
//! `feed` calls and emits each object once its closing brace arrives.
//!
//! Scanning is done on bytes. `{`, `}`, `"` and `\` never occur inside a
//! multi-byte UTF-8 sequence, so a chunk boundary that splits a character is
//! harmless.

use serde_json::Value;
use tracing::trace;

use crate::error::TelemetryParseError;

#[derive(Debug, Default, Clone)]
pub struct TelemetryStreamParser {
    buffer: Vec<u8>,
    depth: usize,
    in_string: bool,
    escape: bool,
}

impl TelemetryStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one chunk and returns every object completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut completed = Vec::new();
        for &byte in chunk {
            if self.in_string {
                self.buffer.push(byte);
                if self.escape {
                    self.escape = false;
                } else if byte == b'\\' {
                    self.escape = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'{' => {
                    self.depth += 1;
                    self.buffer.push(byte);
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    self.buffer.push(byte);
                    if self.depth == 0 {
                        // Telemetry is advisory: a malformed object is dropped
                        // and parsing continues with the next one.
                        match self.take_object() {
                            Ok(value) => completed.push(value),
                            Err(err) => trace!(error = %err, "dropping malformed telemetry object"),
                        }
                    }
                }
                b'"' if self.depth > 0 => {
                    self.in_string = true;
                    self.buffer.push(byte);
                }
                _ if self.depth > 0 => self.buffer.push(byte),
                // Separators and stray bytes between top-level objects.
                _ => {}
            }
        }
        completed
    }

    fn take_object(&mut self) -> Result<Value, TelemetryParseError> {
        let bytes = std::mem::take(&mut self.buffer);
        serde_json::from_slice(&bytes).map_err(|source| TelemetryParseError::InvalidJson { source })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial object is pending.
    pub fn is_idle(&self) -> bool {
        self.depth == 0 && self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
