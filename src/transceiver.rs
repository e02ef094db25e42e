//! Transceiver (C3): single-threaded, non-blocking socket I/O.
//!
//! Accepts connections on a listening socket handed over by the front-end
//! server, drives `poll(2)` across every open connection plus a self-pipe
//! wakeup fd (`nix::sys::socket::socketpair`), reassembles records from
//! partial reads, and drains queued ring-buffer frames back out.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::error::{Error, Result};
use crate::protocol::{Header, HEADER_LEN};
use crate::ringbuf::RingBuffer;

/// One fully reassembled record, handed to the collaborator callback
/// (the manager's `push`) keyed by `(header.request_id, fd)`.
#[derive(Debug)]
pub struct Message {
    pub fd: RawFd,
    pub header: Header,
    /// `content_length` bytes only; padding has already been stripped.
    pub payload: Vec<u8>,
}

enum ReadPhase {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { header: Header, buf: Vec<u8>, filled: usize },
}

impl ReadPhase {
    fn fresh() -> Self {
        ReadPhase::Header { buf: [0u8; HEADER_LEN], filled: 0 }
    }
}

struct Connection {
    stream: UnixStream,
    phase: ReadPhase,
}

/// A cheaply-copyable handle that can wake a sleeping [`Transceiver`] from
/// any thread by writing one byte to its self-pipe.
#[derive(Clone, Copy)]
pub struct WakeHandle(RawFd);

// SAFETY: the wrapped fd is only ever used to `write(2)` a single byte; the
// transceiver that owns the read end outlives every clone handed out to
// other threads (it's constructed once at startup and run for the process
// lifetime).
unsafe impl Send for WakeHandle {}
unsafe impl Sync for WakeHandle {}

impl WakeHandle {
    pub fn wake(&self) -> Result<()> {
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.0) };
        loop {
            match nix::unistd::write(fd, &[1u8]) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                // Self-pipe already has an unread wake byte pending.
                Err(Errno::EAGAIN) => return Ok(()),
                Err(e) => return Err(Error::Poll(e.to_string())),
            }
        }
    }
}

/// Owns the listening fd, the self-pipe, and every live connection's
/// reassembly state. Single-threaded; `WakeHandle` is the only piece meant
/// to cross a thread boundary.
pub struct Transceiver {
    listener: UnixListener,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    connections: HashMap<RawFd, Connection>,
}

impl Transceiver {
    pub fn new(listener: UnixListener) -> Result<Self> {
        listener.set_nonblocking(true).map_err(Error::Io)?;
        let (wake_read, wake_write) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .map_err(|e| Error::Poll(e.to_string()))?;
        Ok(Transceiver {
            listener,
            wake_read,
            wake_write,
            connections: HashMap::new(),
        })
    }

    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle(self.wake_write.as_raw_fd())
    }

    /// Block until some fd in the poll set is ready, or forever if none
    /// ever is (the self-pipe is always in the set, so `wake()` from
    /// another thread always unblocks this).
    pub fn sleep(&mut self) -> Result<()> {
        self.poll_once(PollTimeout::NONE)?;
        Ok(())
    }

    /// One step of the event loop: drain what it can of the ring buffer,
    /// then service at most one ready fd. Returns whether the transceiver
    /// is idle (nothing left to transmit and nothing was serviced).
    pub fn handler(
        &mut self,
        ring: &mut RingBuffer,
        on_message: &mut dyn FnMut(Message),
    ) -> Result<bool> {
        self.transmit(ring)?;

        let ready = self.poll_once(PollTimeout::ZERO)?;
        let Some(&(fd, revents)) = ready.first() else {
            return Ok(ring.is_empty());
        };

        if fd == self.listener.as_raw_fd() {
            self.accept_one()?;
            return Ok(false);
        }
        if fd == self.wake_read.as_raw_fd() {
            self.drain_wake_pipe();
            return Ok(false);
        }
        if revents.contains(PollFlags::POLLIN) {
            self.read_one(fd, on_message)?;
        } else if revents.contains(PollFlags::POLLHUP) {
            self.remove_connection(fd);
        }
        Ok(false)
    }

    fn poll_once(&mut self, timeout: PollTimeout) -> Result<Vec<(RawFd, PollFlags)>> {
        let mut pollfds = Vec::with_capacity(self.connections.len() + 2);
        let mut ids = Vec::with_capacity(pollfds.capacity());

        pollfds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        ids.push(self.listener.as_raw_fd());

        pollfds.push(PollFd::new(self.wake_read.as_fd(), PollFlags::POLLIN));
        ids.push(self.wake_read.as_raw_fd());

        for (&fd, conn) in &self.connections {
            pollfds.push(PollFd::new(
                conn.stream.as_fd(),
                PollFlags::POLLIN | PollFlags::POLLHUP,
            ));
            ids.push(fd);
        }

        let n = poll(&mut pollfds, timeout).map_err(|e| Error::Poll(e.to_string()))?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut ready = Vec::new();
        for (id, pfd) in ids.into_iter().zip(pollfds.iter()) {
            if let Some(revents) = pfd.revents() {
                if !revents.is_empty() {
                    ready.push((id, revents));
                }
            }
        }
        Ok(ready)
    }

    fn accept_one(&mut self) -> Result<()> {
        let (stream, _addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };
        stream.set_nonblocking(true).map_err(Error::Io)?;
        let fd = stream.as_raw_fd();
        self.connections.insert(
            fd,
            Connection {
                stream,
                phase: ReadPhase::fresh(),
            },
        );
        Ok(())
    }

    fn drain_wake_pipe(&self) {
        let mut scratch = [0u8; 64];
        loop {
            match nix::unistd::read(self.wake_read.as_fd(), &mut scratch) {
                Ok(0) | Err(Errno::EAGAIN) => return,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => return,
            }
        }
    }

    fn read_one(&mut self, fd: RawFd, on_message: &mut dyn FnMut(Message)) -> Result<()> {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        let dest: &mut [u8] = match &mut conn.phase {
            ReadPhase::Header { buf, filled } => &mut buf[*filled..],
            ReadPhase::Payload { buf, filled, .. } => &mut buf[*filled..],
        };
        match nix::unistd::read(conn.stream.as_fd(), dest) {
            Ok(0) => {
                self.remove_connection(fd);
                Ok(())
            }
            Ok(n) => {
                let complete = {
                    let conn = self.connections.get_mut(&fd).expect("just read from this fd");
                    match &mut conn.phase {
                        ReadPhase::Header { filled, .. } => {
                            *filled += n;
                            *filled == HEADER_LEN
                        }
                        ReadPhase::Payload { filled, buf, .. } => {
                            *filled += n;
                            *filled == buf.len()
                        }
                    }
                };
                if complete {
                    self.advance_phase(fd, on_message)?;
                }
                Ok(())
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(()),
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                self.remove_connection(fd);
                Ok(())
            }
            Err(e) => Err(Error::Io(std::io::Error::from(e))),
        }
    }

    fn advance_phase(&mut self, fd: RawFd, on_message: &mut dyn FnMut(Message)) -> Result<()> {
        let conn = self.connections.get_mut(&fd).expect("fd present");
        let next_phase;
        let emit;
        match &conn.phase {
            ReadPhase::Header { buf, .. } => {
                let header = Header::decode(buf)?;
                let body_len = header.content_length as usize + header.padding_length as usize;
                if body_len == 0 {
                    emit = Some(Message { fd, header, payload: Vec::new() });
                    next_phase = ReadPhase::fresh();
                } else {
                    emit = None;
                    next_phase = ReadPhase::Payload {
                        header,
                        buf: vec![0u8; body_len],
                        filled: 0,
                    };
                }
            }
            ReadPhase::Payload { header, buf, .. } => {
                let payload = buf[..header.content_length as usize].to_vec();
                emit = Some(Message { fd, header: *header, payload });
                next_phase = ReadPhase::fresh();
            }
        }
        conn.phase = next_phase;
        if let Some(msg) = emit {
            on_message(msg);
        }
        Ok(())
    }

    fn remove_connection(&mut self, fd: RawFd) {
        self.connections.remove(&fd);
    }

    /// Drain the ring buffer into live connections until it's empty, a
    /// write would block, or a connection dies.
    fn transmit(&mut self, ring: &mut RingBuffer) -> Result<()> {
        loop {
            let (data, fd) = ring.request_read();
            if data.is_empty() {
                return Ok(());
            }
            let Some(conn) = self.connections.get(&fd) else {
                // Destination already gone (e.g. a prior POLLHUP); drop
                // this span of bytes rather than stalling the buffer.
                let closed = ring.free_read(data.len());
                self.close_dangling(closed);
                continue;
            };
            match nix::unistd::write(conn.stream.as_fd(), data) {
                Ok(n) => {
                    let closed = ring.free_read(n);
                    self.close_dangling(closed);
                }
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) => {
                    self.remove_connection(fd);
                    let closed = ring.free_read(data.len());
                    self.close_dangling(closed);
                }
                Err(e) => return Err(Error::Io(std::io::Error::from(e))),
            }
        }
    }

    fn close_dangling(&mut self, fds: Vec<RawFd>) {
        for fd in fds {
            self.remove_connection(fd);
        }
    }
}
