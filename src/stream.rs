//! Output stream (C6): per-request `STDOUT`/`STDERR` sinks.
//!
//! Writes accumulate in an 8 192-byte staging buffer and are only framed
//! into records on flush, plus a `dump`/`dump_reader` bypass path for
//! streaming a large reader straight into record-sized chunks without
//! ever materializing it as one buffer.

use std::io::Read;

use crate::error::{Error, Result};
use crate::protocol::{Header, RecordType};
use crate::ringbuf::{FullId, RingBuffer};

/// Bytes buffered before a record is emitted for ordinary (non-`dump`)
/// writes.
const STAGING_SIZE: usize = 8192;
/// Chunk size `dump(reader)` pulls from its source before emitting each
/// record.
const DUMP_READ_SIZE: usize = 32_768;
/// `content_length` is a 16-bit field.
const MAX_RECORD_LEN: usize = 65_535;

/// One `STDOUT`- or `STDERR`-framed sink for a single request, backed by
/// the connection's shared [`RingBuffer`].
pub struct OutputStream {
    full_id: FullId,
    rec_type: RecordType,
    staging: Vec<u8>,
    /// Set once the request has finished (or aborted); further writes are
    /// discarded rather than erroring.
    closed: bool,
}

impl OutputStream {
    pub fn new(full_id: FullId, rec_type: RecordType) -> Self {
        OutputStream {
            full_id,
            rec_type,
            staging: Vec::with_capacity(STAGING_SIZE),
            closed: false,
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.staging.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffer `bytes`, emitting a record to `ring` each time the staging
    /// array fills.
    pub fn write(&mut self, ring: &mut RingBuffer, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut rest = bytes;
        while !rest.is_empty() {
            let space = STAGING_SIZE - self.staging.len();
            let take = space.min(rest.len());
            self.staging.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.staging.len() == STAGING_SIZE {
                self.flush_staged(ring);
            }
        }
        Ok(())
    }

    /// Serialise a `str` straight through as UTF-8 bytes.
    pub fn write_str(&mut self, ring: &mut RingBuffer, s: &str) -> Result<()> {
        self.write(ring, s.as_bytes())
    }

    /// Serialise a buffer of UTF-16 code units as UTF-8, for handlers built
    /// around wide-character strings. Fails with [`Error::Encoding`] on an
    /// unpaired surrogate rather than silently substituting a replacement
    /// character.
    pub fn write_wide(&mut self, ring: &mut RingBuffer, wide: &[u16]) -> Result<()> {
        let decoded = String::from_utf16(wide).map_err(|e| Error::Encoding(e.to_string()))?;
        self.write(ring, decoded.as_bytes())
    }

    /// Bypass staging entirely: write `bytes` directly as one or more
    /// records, chunked to the 65 535-byte record limit. Used for
    /// pre-encoded binary payloads (images, file contents).
    pub fn dump(&mut self, ring: &mut RingBuffer, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for chunk in bytes.chunks(MAX_RECORD_LEN.max(1)) {
            self.emit_record(ring, chunk);
        }
        Ok(())
    }

    /// Pull from `reader` in 32 768-byte chunks until EOF, dumping each one.
    pub fn dump_reader(&mut self, ring: &mut RingBuffer, reader: &mut dyn Read) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut buf = vec![0u8; DUMP_READ_SIZE];
        loop {
            let n = reader.read(&mut buf).map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            self.dump(ring, &buf[..n])?;
        }
        Ok(())
    }

    /// Serialise any staged bytes into one or more records. A no-op once
    /// closed.
    pub fn flush(&mut self, ring: &mut RingBuffer) -> Result<()> {
        if !self.closed {
            self.flush_staged(ring);
        }
        Ok(())
    }

    fn flush_staged(&mut self, ring: &mut RingBuffer) {
        if self.staging.is_empty() {
            return;
        }
        let staged = std::mem::replace(&mut self.staging, Vec::with_capacity(STAGING_SIZE));
        for chunk in staged.chunks(MAX_RECORD_LEN) {
            self.emit_record(ring, chunk);
        }
    }

    /// Write one record (`content_length <= MAX_RECORD_LEN`) into `ring`.
    fn emit_record(&self, ring: &mut RingBuffer, payload: &[u8]) {
        debug_assert!(payload.len() <= MAX_RECORD_LEN);
        let header = Header::new(self.rec_type, self.full_id.request_id, payload.len() as u16);
        let total = header.total_len();
        let region = ring.request_write(total);
        debug_assert!(
            region.len() >= total,
            "a record always fits in one ring buffer chunk"
        );
        region[..8].copy_from_slice(&header.encode());
        region[8..8 + payload.len()].copy_from_slice(payload);
        for b in &mut region[8 + payload.len()..total] {
            *b = 0;
        }
        ring.commit(total, self.full_id, false);
    }
}
