//! `multipart/form-data` (and nested `multipart/mixed`) parser.
//!
//! Driven incrementally, record by record, by the request state machine:
//! a header phase, a body phase, a tempfile spill threshold, and
//! recursion into nested `mixed` parts, expressed as a plain state
//! machine rather than a class hierarchy.

use std::collections::HashMap;

use crate::boyer_moore::Searcher;
use crate::error::{Error, Result};
use crate::tempfile::TempFile;

use super::codec::{base64_decode, quoted_printable_decode};
use super::{extract_attribute, starts_with_ci};

/// Where a part's body bytes end up: small/inline parts stay in memory,
/// parts carrying a `filename` spill to a tempfile.
#[derive(Debug)]
pub enum EntryBody {
    InMemory(Vec<u8>),
    File(TempFile),
}

/// One parsed `multipart/form-data` (or nested `multipart/mixed`) part.
#[derive(Debug)]
pub struct MultipartEntry {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub transfer_encoding: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: EntryBody,
}

impl MultipartEntry {
    pub fn is_file(&self) -> bool {
        matches!(self.body, EntryBody::File(_))
    }

    /// Mark a file-backed entry's tempfile as surviving past the request.
    /// No-op for in-memory entries.
    pub fn make_persistent(&mut self) {
        if let EntryBody::File(f) = &mut self.body {
            f.make_persistent();
        }
    }

    /// Wrap a plain `key=value` pair (as produced by the url-encoded body
    /// parser) in the same entry shape multipart parts use, so `posts`
    /// holds one kind of value regardless of how the body was encoded.
    pub fn inline(name: String, value: String) -> Self {
        MultipartEntry {
            name,
            filename: None,
            content_type: None,
            charset: None,
            transfer_encoding: None,
            headers: HashMap::new(),
            body: EntryBody::InMemory(value.into_bytes()),
        }
    }
}

/// Sub-entry of a nested `multipart/mixed` part. Structurally identical to
/// [`MultipartEntry`]; kept as its own name because `mm_posts` is a
/// distinct map from `posts` on [`super::Environment`].
pub type MixedEntry = MultipartEntry;

/// One fully-parsed part, tagged by whether its `Content-Type` was
/// `multipart/mixed` (in which case it recursed and produced sub-entries
/// instead of a single body).
#[derive(Debug)]
pub enum Completed {
    Simple(MultipartEntry),
    Mixed { name: String, entries: Vec<MixedEntry> },
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    /// Consuming up to and including the opening boundary line; no entry
    /// is pending yet.
    Preamble,
    Header,
    Body,
    Done,
}

struct PendingHeaders {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    charset: Option<String>,
    transfer_encoding: Option<String>,
    headers: HashMap<String, String>,
}

enum Sink {
    Memory(Vec<u8>),
    File(TempFile),
    /// `multipart/mixed`: buffer the raw bytes, then hand them to a fresh
    /// nested `MultipartParser` once the outer boundary closes this part
    /// (the outer boundary can't legally appear inside a well-formed
    /// nested body, so this doesn't need incremental nested parsing).
    NestedMixed { boundary: String, raw: Vec<u8> },
}

struct Pending {
    headers: PendingHeaders,
    sink: Sink,
}

/// Incremental multipart parser for one `Content-Type: multipart/form-data;
/// boundary=...` (or, recursively, `multipart/mixed`) body.
pub struct MultipartParser {
    searcher: Searcher,
    state: State,
    buf: Vec<u8>,
    pending: Option<Pending>,
    completed: Vec<Completed>,
}

impl MultipartParser {
    /// `boundary` is the raw value from `Content-Type`'s `boundary=`
    /// attribute (without the leading `--`).
    pub fn new(boundary: &str) -> Self {
        let mut needle = Vec::with_capacity(boundary.len() + 4);
        needle.extend_from_slice(b"\r\n--");
        needle.extend_from_slice(boundary.as_bytes());
        MultipartParser {
            searcher: Searcher::new(&needle),
            state: State::Preamble,
            // A virtual leading CRLF so the very first boundary — which
            // the wire form omits the preceding CRLF for — still matches
            // the "\r\n--boundary" needle uniformly.
            buf: b"\r\n".to_vec(),
            pending: None,
            completed: Vec::new(),
        }
    }

    pub fn into_completed(self) -> Vec<Completed> {
        self.completed
    }

    /// Feed the next chunk of body bytes (one `STDIN` record's content).
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        loop {
            match self.state {
                State::Done => return Ok(()),
                State::Preamble => {
                    let needle_len = self.searcher.needle().len();
                    let Some(pos) = self.searcher.find(&self.buf) else {
                        return Ok(());
                    };
                    if self.buf.len() < pos + needle_len + 2 {
                        return Ok(());
                    }
                    let tail = &self.buf[pos + needle_len..pos + needle_len + 2];
                    let terminator = tail == b"--";
                    if !terminator && tail != b"\r\n" {
                        return Err(Error::BodyParse(
                            "malformed bytes following opening multipart boundary".into(),
                        ));
                    }
                    self.buf.drain(..pos + needle_len + 2);
                    self.state = if terminator { State::Done } else { State::Header };
                }
                State::Header => {
                    let Some(pos) = find_subslice(&self.buf, b"\r\n\r\n") else {
                        return Ok(());
                    };
                    let header_block = self.buf[..pos].to_vec();
                    self.buf.drain(..pos + 4);
                    self.pending = Some(Self::start_entry(&header_block)?);
                    self.state = State::Body;
                }
                State::Body => {
                    let needle_len = self.searcher.needle().len();
                    let Some(pos) = self.searcher.find(&self.buf) else {
                        return Ok(());
                    };
                    if self.buf.len() < pos + needle_len + 2 {
                        // Boundary matched but we can't yet tell whether
                        // it's "--" (terminator) or "\r\n" (continuation).
                        return Ok(());
                    }
                    let body_bytes = self.buf[..pos].to_vec();
                    self.append_body(&body_bytes)?;
                    let tail = &self.buf[pos + needle_len..pos + needle_len + 2];
                    let terminator = tail == b"--";
                    if !terminator && tail != b"\r\n" {
                        return Err(Error::BodyParse(
                            "malformed bytes following multipart boundary".into(),
                        ));
                    }
                    self.buf.drain(..pos + needle_len + 2);
                    self.completed.push(self.finish_entry()?);
                    self.state = if terminator { State::Done } else { State::Header };
                }
            }
        }
    }

    /// Signal end of input; errors if a part was left open.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            State::Done => Ok(()),
            _ if self.pending.is_none() && self.buf.trim_ascii().is_empty() => Ok(()),
            _ => Err(Error::BodyParse(
                "multipart body ended without a terminating boundary".into(),
            )),
        }
    }

    fn start_entry(header_block: &[u8]) -> Result<Pending> {
        let headers = parse_header_block(header_block)?;
        let disposition = headers
            .get("Content-Disposition")
            .ok_or_else(|| Error::BodyParse("multipart part missing Content-Disposition".into()))?;
        let name = extract_attribute(disposition, "name")
            .ok_or_else(|| Error::BodyParse("Content-Disposition missing name=".into()))?;
        let filename = extract_attribute(disposition, "filename");
        let content_type = headers.get("Content-Type").cloned();
        let charset = content_type
            .as_deref()
            .and_then(|ct| extract_attribute(ct, "charset"));
        let transfer_encoding = headers.get("Content-Transfer-Encoding").cloned();

        let is_mixed = content_type
            .as_deref()
            .map(|ct| starts_with_ci(ct.trim_start(), "multipart/mixed"))
            .unwrap_or(false);

        let sink = if is_mixed {
            let boundary = content_type
                .as_deref()
                .and_then(|ct| extract_attribute(ct, "boundary"))
                .ok_or_else(|| Error::BodyParse("multipart/mixed missing boundary=".into()))?;
            Sink::NestedMixed {
                boundary,
                raw: Vec::new(),
            }
        } else if filename.is_some() {
            Sink::File(TempFile::create(
                header_block,
                filename.as_deref().unwrap_or(""),
                content_type.as_deref().unwrap_or(""),
            )?)
        } else {
            Sink::Memory(Vec::new())
        };

        Ok(Pending {
            headers: PendingHeaders {
                name,
                filename,
                content_type,
                charset,
                transfer_encoding,
                headers,
            },
            sink,
        })
    }

    fn append_body(&mut self, raw: &[u8]) -> Result<()> {
        let pending = self.pending.as_mut().expect("body phase has a pending part");
        let decoded = match pending.headers.transfer_encoding.as_deref() {
            Some(te) if te.eq_ignore_ascii_case("base64") => base64_decode(raw)?,
            Some(te) if te.eq_ignore_ascii_case("quoted-printable") => {
                quoted_printable_decode(raw)?
            }
            _ => raw.to_vec(),
        };
        match &mut pending.sink {
            Sink::Memory(buf) => buf.extend_from_slice(&decoded),
            Sink::File(f) => f.write_all(&decoded)?,
            Sink::NestedMixed { raw, .. } => raw.extend_from_slice(&decoded),
        }
        Ok(())
    }

    fn finish_entry(&mut self) -> Result<Completed> {
        let pending = self.pending.take().expect("finishing an open part");
        let h = pending.headers;
        match pending.sink {
            Sink::Memory(buf) => Ok(Completed::Simple(MultipartEntry {
                name: h.name,
                filename: h.filename,
                content_type: h.content_type,
                charset: h.charset,
                transfer_encoding: h.transfer_encoding,
                headers: h.headers,
                body: EntryBody::InMemory(buf),
            })),
            Sink::File(f) => Ok(Completed::Simple(MultipartEntry {
                name: h.name,
                filename: h.filename,
                content_type: h.content_type,
                charset: h.charset,
                transfer_encoding: h.transfer_encoding,
                headers: h.headers,
                body: EntryBody::File(f),
            })),
            Sink::NestedMixed { boundary, raw } => {
                let mut nested = MultipartParser::new(&boundary);
                nested.feed(&raw)?;
                nested.finish()?;
                let entries = nested
                    .into_completed()
                    .into_iter()
                    .filter_map(|c| match c {
                        Completed::Simple(e) => Some(e),
                        Completed::Mixed { .. } => None,
                    })
                    .collect();
                Ok(Completed::Mixed { name: h.name, entries })
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse an RFC-822 header block (unfolding continuation lines), with
/// header names capitalised word-by-word (`content-type` ->
/// `Content-Type`).
fn parse_header_block(block: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(block)
        .map_err(|e| Error::BodyParse(format!("non-utf8 multipart header: {e}")))?;
    let mut headers = HashMap::new();
    let mut current: Option<(String, String)> = None;
    for line in text.split("\r\n") {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = &mut current {
                value.push(' ');
                value.push_str(line.trim_start());
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.insert(normalize_header_name(&name), value);
        }
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.find(':') else {
            return Err(Error::BodyParse(format!("malformed header line: {line:?}")));
        };
        current = Some((
            line[..colon].trim().to_string(),
            line[colon + 1..].trim().to_string(),
        ));
    }
    if let Some((name, value)) = current.take() {
        headers.insert(normalize_header_name(&name), value);
    }
    Ok(headers)
}

fn normalize_header_name(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
