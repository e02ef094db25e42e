//! Manager (C8): owns the connection set and request table, routes
//! inbound records to requests, answers management queries, schedules
//! request handlers, and implements signal-driven stop/terminate.
//!
//! Signal delivery goes through `signal_hook`'s atomic-flag registration
//! rather than a hand-rolled `sigaction` callback: locking a `Mutex` from
//! inside a signal handler is unsound in a multi-threaded binary, and
//! `signal_hook::flag` sidesteps that entirely.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use nix::sys::signal::{self, SigHandler, Signal};
use num_traits::ToPrimitive;
use signal_hook::consts::{SIGTERM, SIGUSR1};

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::protocol::{
    decode_name_value_stream, encode_name_value, BeginRequestBody, Header, RecordType,
    UnknownTypeBody,
};
use crate::request::{Handler, MessageQueue, PushCallback, Request};
use crate::ringbuf::{FullId, RingBuffer};
use crate::transceiver::{Message, Transceiver, WakeHandle};

/// Produces a fresh [`Handler`] for each inbound `BEGIN_REQUEST`.
pub type HandlerFactory = Box<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

struct Shared {
    requests: RwLock<HashMap<FullId, Request>>,
    record_queues: Mutex<HashMap<FullId, VecDeque<(RecordType, Vec<u8>)>>>,
    tasks: Mutex<VecDeque<FullId>>,
    management_queue: Mutex<VecDeque<(RawFd, RecordType, Vec<u8>)>>,
    asleep: AtomicBool,
    do_stop: Arc<AtomicBool>,
    do_terminate: Arc<AtomicBool>,
    wake: WakeHandle,
}

impl Shared {
    fn wake_if_asleep(&self) {
        if self.asleep.load(Ordering::Acquire) {
            let _ = self.wake.wake();
        }
    }
}

/// Process-global `pid -> manager` table, kept so a deployment can ask
/// "which manager is running in this process." Actual signal delivery
/// below doesn't need to consult this — `signal_hook` flags are
/// per-registration, not per-pid — single-instance-per-process
/// deployments degenerate to one entry.
static SIGNAL_MANAGERS: OnceLock<RwLock<HashMap<u32, Arc<()>>>> = OnceLock::new();

fn signal_managers() -> &'static RwLock<HashMap<u32, Arc<()>>> {
    SIGNAL_MANAGERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Owns the transceiver, the request table, and the task queue; runs the
/// single I/O + dispatcher thread loop.
pub struct Manager {
    shared: Arc<Shared>,
    transceiver: Transceiver,
    ring: RingBuffer,
    config: Config,
    handler_factory: HandlerFactory,
    registry_token: Arc<()>,
}

impl Manager {
    pub fn new(
        listener: UnixListener,
        config: Config,
        handler_factory: HandlerFactory,
    ) -> Result<Self> {
        let transceiver = Transceiver::new(listener)?;
        let wake = transceiver.wake_handle();

        let do_stop = Arc::new(AtomicBool::new(false));
        let do_terminate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, Arc::clone(&do_stop)).map_err(Error::Io)?;
        signal_hook::flag::register(SIGUSR1, Arc::clone(&do_terminate)).map_err(Error::Io)?;
        // SAFETY: installs the default ignore-action for SIGPIPE; no
        // handler closure is registered, so there's nothing async-signal-
        // unsafe running here.
        unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }
            .map_err(|e| Error::Poll(e.to_string()))?;

        let shared = Arc::new(Shared {
            requests: RwLock::new(HashMap::new()),
            record_queues: Mutex::new(HashMap::new()),
            tasks: Mutex::new(VecDeque::new()),
            management_queue: Mutex::new(VecDeque::new()),
            asleep: AtomicBool::new(false),
            do_stop,
            do_terminate,
            wake,
        });
        let registry_token = Arc::new(());
        signal_managers()
            .write()
            .expect("signal manager table mutex poisoned")
            .insert(std::process::id(), Arc::clone(&registry_token));

        Ok(Manager {
            shared,
            transceiver,
            ring: RingBuffer::new(),
            config,
            handler_factory,
            registry_token,
        })
    }

    /// Request a graceful stop at the top of the next loop iteration,
    /// leaving in-flight requests intact. Wired to `SIGTERM`.
    pub fn stop(&self) {
        self.shared.do_stop.store(true, Ordering::Release);
        self.shared.wake_if_asleep();
    }

    /// Request a graceful drain: exit only once every request has
    /// finished and the transceiver is idle. Wired to `SIGUSR1`.
    pub fn terminate(&self) {
        self.shared.do_terminate.store(true, Ordering::Release);
        self.shared.wake_if_asleep();
    }

    /// Run the dispatcher loop until `stop()`/`SIGTERM` fires, or until
    /// `terminate()`/`SIGUSR1` fires and every request has drained.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.step()? {
                return Ok(());
            }
        }
    }

    /// One iteration of the dispatcher loop. Returns `true` when the
    /// caller should stop calling `step()` again.
    pub fn step(&mut self) -> Result<bool> {
        if self.shared.do_stop.swap(false, Ordering::AcqRel) {
            return Ok(true);
        }

        let idle = {
            let Manager {
                shared,
                transceiver,
                ring,
                handler_factory,
                ..
            } = self;
            transceiver.handler(ring, &mut |msg| {
                if let Err(e) = push_record(shared, handler_factory, msg) {
                    log::warn!("dropping malformed FastCGI record: {e}");
                }
            })?
        };

        if self.shared.do_terminate.load(Ordering::Acquire) {
            let drained = self
                .shared
                .requests
                .read()
                .expect("requests lock poisoned")
                .is_empty();
            if drained && idle {
                return Ok(true);
            }
        }

        let next_task = self
            .shared
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .pop_front();
        let Some(full_id) = next_task else {
            self.shared.asleep.store(true, Ordering::Release);
            if idle {
                self.transceiver.sleep()?;
            }
            self.shared.asleep.store(false, Ordering::Release);
            return Ok(false);
        };

        self.run_task(full_id)?;
        Ok(false)
    }

    /// Dispatch one queued record (or a bare continuation wakeup) to the
    /// request it belongs to. A per-request fault never escapes here: it's
    /// caught and turned into a finalized, `app_status=1` request so the
    /// rest of the connection's multiplexed requests keep running.
    fn run_task(&mut self, full_id: FullId) -> Result<()> {
        if full_id.is_management() {
            return self.run_management_task();
        }

        let record = self
            .shared
            .record_queues
            .lock()
            .expect("record queue lock poisoned")
            .get_mut(&full_id)
            .and_then(VecDeque::pop_front);

        let mut requests = self
            .shared
            .requests
            .write()
            .expect("requests lock poisoned");
        let Some(req) = requests.get_mut(&full_id) else {
            return Ok(());
        };
        let outcome = match record {
            Some((rec_type, content)) => req.handle_record(&mut self.ring, rec_type, &content),
            None => req.resume(&mut self.ring),
        };
        let finished = match outcome {
            Ok(finished) => finished,
            Err(e) => {
                log::warn!("request {full_id:?} failed, finalizing with app_status=1: {e}");
                req.fail(&mut self.ring, &e);
                true
            }
        };
        if finished {
            requests.remove(&full_id);
            self.shared
                .record_queues
                .lock()
                .expect("record queue lock poisoned")
                .remove(&full_id);
        }
        Ok(())
    }

    /// Answer `GET_VALUES`, or echo any other management record type
    /// back as `UNKNOWN_TYPE`.
    fn run_management_task(&mut self) -> Result<()> {
        let Some((fd, rec_type, payload)) = self
            .shared
            .management_queue
            .lock()
            .expect("management queue lock poisoned")
            .pop_front()
        else {
            return Ok(());
        };

        match rec_type {
            RecordType::GetValues => {
                let (pairs, _) = decode_name_value_stream(&payload)?;
                let mut body = Vec::new();
                for (name, _value) in pairs {
                    let recognised = match name.as_slice() {
                        b"FCGI_MAX_CONNS" => Some(self.config.max_conns.to_string()),
                        b"FCGI_MAX_REQS" => Some(self.config.max_reqs.to_string()),
                        b"FCGI_MPXS_CONNS" => Some(config::DEFAULT_MPXS_CONNS.to_string()),
                        _ => None,
                    };
                    if let Some(value) = recognised {
                        body.extend(encode_name_value(&name, value.as_bytes()));
                    }
                }
                self.emit_management_record(fd, RecordType::GetValuesResult, &body);
            }
            other => {
                let body = UnknownTypeBody {
                    kind: other.to_u8().unwrap_or(0),
                };
                self.emit_management_record(fd, RecordType::UnknownType, &body.encode());
            }
        }
        Ok(())
    }

    fn emit_management_record(&mut self, fd: RawFd, rec_type: RecordType, payload: &[u8]) {
        let full_id = FullId::new(fd, 0);
        let mut chunks = payload.chunks(u16::MAX as usize).peekable();
        if chunks.peek().is_none() {
            self.write_one_management_record(full_id, rec_type, &[]);
        }
        for chunk in chunks {
            self.write_one_management_record(full_id, rec_type, chunk);
        }
    }

    fn write_one_management_record(&mut self, full_id: FullId, rec_type: RecordType, payload: &[u8]) {
        let header = Header::new(rec_type, 0, payload.len() as u16);
        let total = header.total_len();
        let region = self.ring.request_write(total);
        region[..8].copy_from_slice(&header.encode());
        region[8..8 + payload.len()].copy_from_slice(payload);
        for b in &mut region[8 + payload.len()..total] {
            *b = 0;
        }
        self.ring.commit(total, full_id, false);
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let mut table = signal_managers()
            .write()
            .expect("signal manager table mutex poisoned");
        if let Some(existing) = table.get(&std::process::id()) {
            if Arc::ptr_eq(existing, &self.registry_token) {
                table.remove(&std::process::id());
            }
        }
    }
}

/// The transceiver callback body, split out of `Manager::step` as a free
/// function so `&self.shared`/`&self.handler_factory` can be borrowed
/// independently of `&mut self.transceiver`/`&mut self.ring`.
fn push_record(shared: &Arc<Shared>, handler_factory: &HandlerFactory, msg: Message) -> Result<()> {
    let fd = msg.fd;
    let req_id = msg.header.request_id;

    if req_id == 0 {
        shared
            .management_queue
            .lock()
            .expect("management queue lock poisoned")
            .push_back((fd, msg.header.rec_type, msg.payload));
        shared
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .push_back(FullId::new(fd, 0));
    } else {
        let full_id = FullId::new(fd, req_id);
        let exists = shared
            .requests
            .read()
            .expect("requests lock poisoned")
            .contains_key(&full_id);

        if !exists {
            if msg.header.rec_type == RecordType::BeginRequest {
                let body = BeginRequestBody::decode(&msg.payload)?;
                let handler = handler_factory();
                let queue = MessageQueue::default();
                let callback: PushCallback = {
                    let shared = Arc::clone(shared);
                    let queue_for_cb = queue.clone();
                    Arc::new(move |message: Vec<u8>| {
                        queue_for_cb.push(message);
                        shared
                            .tasks
                            .lock()
                            .expect("tasks lock poisoned")
                            .push_back(full_id);
                        shared.wake_if_asleep();
                    })
                };
                let req = Request::new(full_id, body.role, body.keep_conn(), handler, queue, callback);
                shared
                    .requests
                    .write()
                    .expect("requests lock poisoned")
                    .insert(full_id, req);
            }
            // Any other record type for an unknown request is discarded.
        } else {
            shared
                .record_queues
                .lock()
                .expect("record queue lock poisoned")
                .entry(full_id)
                .or_default()
                .push_back((msg.header.rec_type, msg.payload));
            shared
                .tasks
                .lock()
                .expect("tasks lock poisoned")
                .push_back(full_id);
        }
    }

    shared.wake_if_asleep();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Role, VERSION};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn bound_listener() -> (tempfile::TempDir, UnixListener, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = UnixListener::bind(&path).unwrap();
        (dir, listener, path)
    }

    fn record(rec_type: RecordType, request_id: u16, payload: &[u8]) -> Vec<u8> {
        let header = Header::new(rec_type, request_id, payload.len() as u16);
        let mut wire = header.encode().to_vec();
        wire.extend_from_slice(payload);
        wire.extend(std::iter::repeat(0u8).take(header.padding_length as usize));
        wire
    }

    fn drain_one_record(client: &mut UnixStream) -> (Header, Vec<u8>) {
        client.set_nonblocking(true).unwrap();
        let mut header_bytes = [0u8; 8];
        let mut filled = 0;
        for _ in 0..200 {
            match client.read(&mut header_bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled == 8 {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(filled, 8, "did not receive a full header");
        let header = Header::decode(&header_bytes).unwrap();
        let total = header.content_length as usize + header.padding_length as usize;
        let mut body = vec![0u8; total];
        let mut got = 0;
        for _ in 0..200 {
            if got == total {
                break;
            }
            match client.read(&mut body[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            }
        }
        body.truncate(header.content_length as usize);
        (header, body)
    }

    /// Steps the manager until at least `want` bytes are sitting unread in
    /// `client`'s kernel receive buffer, checked with a non-blocking
    /// `peek` *before* every `step()` call. Stopping the instant the
    /// predicate holds, rather than after a fixed iteration count, avoids
    /// ever taking the one extra step that would find nothing left to do
    /// and block in `Transceiver::sleep` for good.
    fn drive_until_peekable(manager: &mut Manager, client: &UnixStream, want: usize) {
        client.set_nonblocking(true).unwrap();
        let mut buf = vec![0u8; want];
        for _ in 0..300 {
            if let Ok(n) = client.peek(&mut buf) {
                if n >= want {
                    return;
                }
            }
            manager.step().unwrap();
        }
        panic!("expected {want} bytes never became available");
    }

    struct OkHandler;
    impl Handler for OkHandler {
        fn response(&mut self, _req: &mut Request, _ring: &mut RingBuffer) -> bool {
            true
        }
    }

    #[test]
    fn get_values_reports_recognised_names_only() {
        let (_dir, listener, path) = bound_listener();
        let mut manager = Manager::new(listener, Config::default(), Box::new(|| Box::new(OkHandler))).unwrap();
        let mut client = UnixStream::connect(&path).unwrap();

        let mut query = Vec::new();
        for name in ["FCGI_MAX_CONNS", "FCGI_MAX_REQS", "FCGI_MPXS_CONNS", "UNKNOWN_NAME"] {
            query.extend(encode_name_value(name.as_bytes(), b""));
        }
        client.write_all(&record(RecordType::GetValues, 0, &query)).unwrap();

        drive_until_peekable(&mut manager, &client, 8);
        let (header, body) = drain_one_record(&mut client);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.rec_type, RecordType::GetValuesResult);
        let (pairs, _) = decode_name_value_stream(&body).unwrap();
        let names: Vec<_> = pairs.iter().map(|(n, _)| String::from_utf8_lossy(n).to_string()).collect();
        assert!(names.contains(&"FCGI_MAX_CONNS".to_string()));
        assert!(names.contains(&"FCGI_MAX_REQS".to_string()));
        assert!(names.contains(&"FCGI_MPXS_CONNS".to_string()));
        assert!(!names.contains(&"UNKNOWN_NAME".to_string()));
        for (name, value) in &pairs {
            match name.as_slice() {
                b"FCGI_MAX_CONNS" => assert_eq!(value, b"10"),
                b"FCGI_MAX_REQS" => assert_eq!(value, b"50"),
                b"FCGI_MPXS_CONNS" => assert_eq!(value, b"1"),
                _ => panic!("unexpected recognised name"),
            }
        }
    }

    #[test]
    fn unknown_management_record_is_echoed_back() {
        let (_dir, listener, path) = bound_listener();
        let mut manager = Manager::new(listener, Config::default(), Box::new(|| Box::new(OkHandler))).unwrap();
        let mut client = UnixStream::connect(&path).unwrap();

        // `FCGI_DATA`'s numeric value (8) used here purely as "some type
        // the manager doesn't specially interpret at request_id 0".
        client.write_all(&record(RecordType::Data, 0, &[])).unwrap();
        drive_until_peekable(&mut manager, &client, 8);
        let (header, body) = drain_one_record(&mut client);
        assert_eq!(header.rec_type, RecordType::UnknownType);
        assert_eq!(body[0], RecordType::Data.to_u8().unwrap());
    }

    #[test]
    fn begin_request_round_trips_through_responder() {
        let (_dir, listener, path) = bound_listener();
        let mut manager =
            Manager::new(listener, Config::default(), Box::new(|| Box::new(EchoHandler))).unwrap();
        let mut client = UnixStream::connect(&path).unwrap();

        let begin_body = BeginRequestBody { role: Role::Responder, flags: 0 }.encode();
        client.write_all(&record(RecordType::BeginRequest, 7, &begin_body)).unwrap();
        client.write_all(&record(RecordType::Params, 7, &[])).unwrap();
        client.write_all(&record(RecordType::Stdin, 7, &[])).unwrap();

        // Both records (STDOUT then END_REQUEST) are written by the same
        // `transmit` call, so waiting for their combined size is safe.
        drive_until_peekable(&mut manager, &client, 32);
        let (stdout_header, stdout_body) = drain_one_record(&mut client);
        assert_eq!(stdout_header.rec_type, RecordType::Stdout);
        assert_eq!(stdout_body, b"hi");
        let (end_header, end_body) = drain_one_record(&mut client);
        assert_eq!(end_header.rec_type, RecordType::EndRequest);
        assert_eq!(end_body[4], 0); // REQUEST_COMPLETE
    }

    #[test]
    fn a_malformed_request_is_finalized_without_taking_down_its_neighbor() {
        let (_dir, listener, path) = bound_listener();
        let mut manager =
            Manager::new(listener, Config::default(), Box::new(|| Box::new(EchoHandler))).unwrap();
        let mut client = UnixStream::connect(&path).unwrap();

        // Both requests keep the connection alive, so request 1's error
        // finalizing doesn't tear down the fd request 2 still needs.
        let begin_body = BeginRequestBody { role: Role::Responder, flags: 1 }.encode();

        // Request 1 is still waiting out its Params phase; a STDIN record
        // there is out of order and makes `handle_record` return `Err`.
        client.write_all(&record(RecordType::BeginRequest, 1, &begin_body)).unwrap();
        client.write_all(&record(RecordType::Stdin, 1, b"oops")).unwrap();

        // Request 2 on the same connection proceeds normally and must
        // still complete even though request 1 just errored out.
        client.write_all(&record(RecordType::BeginRequest, 2, &begin_body)).unwrap();
        client.write_all(&record(RecordType::Params, 2, &[])).unwrap();
        client.write_all(&record(RecordType::Stdin, 2, &[])).unwrap();

        let mut seen = std::collections::HashMap::new();
        for _ in 0..4 {
            drive_until_peekable(&mut manager, &client, 8);
            let (header, body) = drain_one_record(&mut client);
            if header.rec_type == RecordType::EndRequest {
                seen.insert(header.request_id, body[3]); // low byte of app_status (be32)
            }
        }
        assert_eq!(seen.get(&1), Some(&1)); // app_status = 1, caught fault
        assert_eq!(seen.get(&2), Some(&0)); // app_status = 0, unaffected
    }

    #[test]
    fn stop_exits_the_loop_on_next_step() {
        let (_dir, listener, _path) = bound_listener();
        let mut manager = Manager::new(listener, Config::default(), Box::new(|| Box::new(OkHandler))).unwrap();
        manager.stop();
        assert!(manager.step().unwrap());
    }

    struct EchoHandler;
    impl Handler for EchoHandler {
        fn response(&mut self, req: &mut Request, ring: &mut RingBuffer) -> bool {
            req.out.write(ring, b"hi").ok();
            true
        }
    }
}
