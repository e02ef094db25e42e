//! Ring buffer (C2): a grow-only chunked FIFO of outbound bytes, each byte
//! tagged with a destination connection and a "close on drain" flag.
//!
//! Growth is monotonic within a connection's lifetime so that transmit
//! never blocks; chunks rotate to the tail for reuse once fully drained,
//! which bounds steady-state memory without needing an intrusive linked
//! list.

use std::collections::VecDeque;
use std::os::fd::RawFd;

/// Size of one chunk in the arena.
pub const CHUNK_SIZE: usize = 131_072;

/// Below this much free space in the tail chunk, `commit` rolls over to a
/// fresh (or recycled) chunk rather than leaving a sliver writers have to
/// special-case.
const ROLLOVER_THRESHOLD: usize = 256;

/// `(connection_fd, request_id)`, the destination of a span of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullId {
    pub fd: RawFd,
    pub request_id: u16,
}

impl FullId {
    pub fn new(fd: RawFd, request_id: u16) -> Self {
        FullId { fd, request_id }
    }

    /// Management messages target the manager itself, not a live request.
    pub fn is_management(&self) -> bool {
        self.request_id == 0
    }
}

struct Chunk {
    data: Box<[u8; CHUNK_SIZE]>,
    end: usize,
}

impl Chunk {
    fn new() -> Self {
        Chunk {
            data: Box::new([0u8; CHUNK_SIZE]),
            end: 0,
        }
    }

    fn remaining(&self) -> usize {
        CHUNK_SIZE - self.end
    }
}

struct Frame {
    size: usize,
    close_fd: bool,
    full_id: FullId,
}

/// Grow-only chunked outbound byte queue shared by every connection the
/// transceiver is driving.
pub struct RingBuffer {
    chunks: VecDeque<Chunk>,
    /// Offset of the unread head of `chunks[0]`.
    read_pos: usize,
    frames: VecDeque<Frame>,
    bytes_committed: u64,
    bytes_freed: u64,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    pub fn new() -> Self {
        let mut chunks = VecDeque::with_capacity(1);
        chunks.push_back(Chunk::new());
        RingBuffer {
            chunks,
            read_pos: 0,
            frames: VecDeque::new(),
            bytes_committed: 0,
            bytes_freed: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// A contiguous writable region, at most `min_size` bytes, taken from the
    /// tail chunk. The caller fills some prefix of it and calls `commit`.
    ///
    /// When `min_size` fits within one chunk but the tail chunk's remaining
    /// space doesn't, rolls over to a fresh chunk first so the caller gets a
    /// single contiguous region rather than having to split a record across
    /// chunks (records up to 65 535 bytes plus header/padding are always
    /// well within `CHUNK_SIZE`).
    pub fn request_write(&mut self, min_size: usize) -> &mut [u8] {
        let remaining = self.chunks.back().expect("at least one chunk").remaining();
        if remaining < min_size && min_size <= CHUNK_SIZE {
            self.advance_write_chunk();
        }
        let tail = self.chunks.back_mut().expect("at least one chunk");
        let cap = min_size.min(tail.remaining());
        let start = tail.end;
        &mut tail.data[start..start + cap]
    }

    fn advance_write_chunk(&mut self) {
        // Reuse a fully-drained head chunk if one is sitting idle, else grow.
        if self.chunks.len() > 1 && self.chunks.front().map(|c| c.end == 0).unwrap_or(false) {
            let reusable = self.chunks.pop_front().unwrap();
            self.chunks.push_back(reusable);
        } else {
            self.chunks.push_back(Chunk::new());
        }
    }

    /// Mark `n` bytes (of the region just returned by `request_write`) as
    /// written, and enqueue a frame describing their destination.
    pub fn commit(&mut self, n: usize, full_id: FullId, close_fd: bool) {
        if n == 0 {
            return;
        }
        let tail = self.chunks.back_mut().expect("at least one chunk");
        tail.end += n;
        self.bytes_committed += n as u64;
        if let Some(last) = self.frames.back_mut() {
            if last.full_id == full_id && last.close_fd == close_fd {
                last.size += n;
                if tail.remaining() < ROLLOVER_THRESHOLD {
                    self.advance_write_chunk();
                }
                return;
            }
        }
        self.frames.push_back(Frame {
            size: n,
            close_fd,
            full_id,
        });
        if tail.remaining() < ROLLOVER_THRESHOLD {
            self.advance_write_chunk();
        }
    }

    /// The next contiguous span of unread bytes, capped by the head frame's
    /// remaining size, plus the fd it's destined for. `len() == 0` when
    /// empty.
    pub fn request_read(&self) -> (&[u8], RawFd) {
        let Some(frame) = self.frames.front() else {
            return (&[], 0);
        };
        let head = &self.chunks[0];
        let available = head.end - self.read_pos;
        let cap = available.min(frame.size);
        (&head.data[self.read_pos..self.read_pos + cap], frame.full_id.fd)
    }

    /// Consume `n` bytes from the read cursor. Returns the fds that should
    /// now be closed, because the frame that just fully drained was flagged
    /// `close_fd`. Empty chunks rotate to the tail instead of being freed.
    pub fn free_read(&mut self, n: usize) -> Vec<RawFd> {
        let mut to_close = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(frame) = self.frames.front_mut() else {
                break;
            };
            let take = remaining.min(frame.size);
            frame.size -= take;
            self.read_pos += take;
            remaining -= take;
            self.bytes_freed += take as u64;

            if frame.size == 0 {
                let done = self.frames.pop_front().unwrap();
                if done.close_fd {
                    to_close.push(done.full_id.fd);
                }
            }

            let head = &self.chunks[0];
            if self.read_pos >= head.end && self.chunks.len() > 1 {
                let mut drained = self.chunks.pop_front().expect("just checked len() > 1");
                drained.end = 0;
                self.chunks.push_back(drained);
                self.read_pos = 0;
            }
        }
        to_close
    }

    #[cfg(test)]
    fn accounting_holds(&self) -> bool {
        let sum_frames: u64 = self.frames.iter().map(|f| f.size as u64).sum();
        sum_frames == self.bytes_committed - self.bytes_freed
    }
}
