//! Incremental `application/x-www-form-urlencoded` parser.
//!
//! Tokens are `key=value` pairs separated by `&`; `%HH` is percent-decoded
//! and `+` decodes as space. The parser must tolerate a token — or even a
//! single percent-escape — arriving split across two `STDIN` records, so
//! all state lives in `self` and `feed` may be called any number of times
//! before `finish`.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Key,
    Value,
}

#[derive(Debug)]
pub struct UrlEncodedParser {
    phase: Phase,
    key: Vec<u8>,
    value: Vec<u8>,
    /// Hex digits collected so far after seeing a `%`; `None` when not
    /// mid-escape.
    pending_escape: Option<Vec<u8>>,
    any_bytes_seen: bool,
}

impl Default for UrlEncodedParser {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl UrlEncodedParser {
    pub fn new() -> Self {
        UrlEncodedParser {
            phase: Phase::Key,
            key: Vec::new(),
            value: Vec::new(),
            pending_escape: None,
            any_bytes_seen: false,
        }
    }

    fn push_decoded(&mut self, b: u8) {
        match self.phase {
            Phase::Key => self.key.push(b),
            Phase::Value => self.value.push(b),
        }
    }

    fn take_pair(&mut self) -> Result<(String, String)> {
        let key = String::from_utf8(std::mem::take(&mut self.key))
            .map_err(|e| Error::BodyParse(format!("non-utf8 key: {e}")))?;
        let value = String::from_utf8(std::mem::take(&mut self.value))
            .map_err(|e| Error::BodyParse(format!("non-utf8 value: {e}")))?;
        self.phase = Phase::Key;
        Ok((key, value))
    }

    /// Feed the next chunk (a `STDIN` record's content), returning every
    /// `(key, value)` pair that completed (on an `&`) within it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for &b in chunk {
            self.any_bytes_seen = true;
            if let Some(hex) = &mut self.pending_escape {
                if hex_val(b).is_none() {
                    return Err(Error::BodyParse(format!(
                        "invalid percent escape digit {b:#x}"
                    )));
                }
                hex.push(b);
                if hex.len() == 2 {
                    let hi = hex_val(hex[0]).unwrap();
                    let lo = hex_val(hex[1]).unwrap();
                    self.push_decoded((hi << 4) | lo);
                    self.pending_escape = None;
                }
                continue;
            }
            match b {
                b'%' => self.pending_escape = Some(Vec::with_capacity(2)),
                b'+' => self.push_decoded(b' '),
                b'=' if self.phase == Phase::Key => self.phase = Phase::Value,
                b'&' => out.push(self.take_pair()?),
                other => self.push_decoded(other),
            }
        }
        Ok(out)
    }

    /// Flush any trailing `key=value` pair that wasn't terminated by a
    /// final `&` (the normal end-of-stream case). Errors if a percent
    /// escape was left incomplete.
    pub fn finish(&mut self) -> Result<Option<(String, String)>> {
        if let Some(hex) = &self.pending_escape {
            if !hex.is_empty() || self.any_bytes_seen {
                return Err(Error::BodyParse(
                    "input ended mid percent-escape".to_string(),
                ));
            }
        }
        if self.key.is_empty() && self.value.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.take_pair()?))
    }
}
