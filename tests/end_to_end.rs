//! End-to-end tests driving a real [`Manager`] over a Unix-domain socket,
//! speaking the FastCGI wire format by hand rather than through the
//! crate's own codec, the way a front-end server actually would.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};

use mosh_fcgi::{Config, Handler, Manager, PushCallback, Request, RingBuffer};

const VERSION: u8 = 1;
const BEGIN_REQUEST: u8 = 1;
const ABORT_REQUEST: u8 = 2;
const PARAMS: u8 = 4;
const STDIN: u8 = 5;
const STDOUT: u8 = 6;
const END_REQUEST: u8 = 3;
const ROLE_RESPONDER: u16 = 1;
const FLAG_KEEP_CONN: u8 = 0x01;

fn header(rec_type: u8, request_id: u16, content_length: u16) -> Vec<u8> {
    let padding = ((8 - (content_length & 0x7)) & 0x7) as u8;
    let id = request_id.to_be_bytes();
    let len = content_length.to_be_bytes();
    vec![VERSION, rec_type, id[0], id[1], len[0], len[1], padding, 0]
}

fn record(rec_type: u8, request_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut wire = header(rec_type, request_id, payload.len() as u16);
    let padding = wire[6] as usize;
    wire.extend_from_slice(payload);
    wire.extend(std::iter::repeat(0u8).take(padding));
    wire
}

fn begin_request_body(keep_conn: bool) -> Vec<u8> {
    let role = ROLE_RESPONDER.to_be_bytes();
    let flags = if keep_conn { FLAG_KEEP_CONN } else { 0 };
    vec![role[0], role[1], flags, 0, 0, 0, 0, 0]
}

fn name_value(name: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(name.len() as u8);
    out.push(value.len() as u8);
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    out
}

fn bound_listener() -> (tempfile::TempDir, UnixListener, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sock");
    let listener = UnixListener::bind(&path).unwrap();
    (dir, listener, path)
}

/// Step the manager until at least `want` bytes are readable on `client`,
/// checked with a non-blocking peek before every `step()` to avoid ever
/// taking the one extra step that would block forever in `sleep()`.
fn drive_until_peekable(manager: &mut Manager, client: &UnixStream, want: usize) {
    client.set_nonblocking(true).unwrap();
    let mut buf = vec![0u8; want];
    for _ in 0..500 {
        if let Ok(n) = client.peek(&mut buf) {
            if n >= want {
                return;
            }
        }
        manager.step().unwrap();
    }
    panic!("expected {want} bytes never became available");
}

fn read_exact_record(client: &mut UnixStream) -> (u8, u16, Vec<u8>) {
    client.set_nonblocking(true).unwrap();
    let mut head = [0u8; 8];
    let mut filled = 0;
    for _ in 0..500 {
        match client.read(&mut head[filled..]) {
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
    assert_eq!(filled, 8, "did not receive a full record header");
    let rec_type = head[1];
    let request_id = u16::from_be_bytes([head[2], head[3]]);
    let content_length = u16::from_be_bytes([head[4], head[5]]) as usize;
    let padding_length = head[6] as usize;
    let mut body = vec![0u8; content_length + padding_length];
    let mut got = 0;
    for _ in 0..500 {
        if got == body.len() {
            break;
        }
        match client.read(&mut body[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("{e}"),
        }
    }
    body.truncate(content_length);
    (rec_type, request_id, body)
}

struct HelloHandler;
impl Handler for HelloHandler {
    fn response(&mut self, req: &mut Request, ring: &mut RingBuffer) -> bool {
        req.out.write(ring, b"hello").ok();
        true
    }
}

#[test]
fn minimal_responder_round_trip() {
    let (_dir, listener, path) = bound_listener();
    let mut manager = Manager::new(listener, Config::default(), Box::new(|| Box::new(HelloHandler))).unwrap();
    let mut client = UnixStream::connect(&path).unwrap();

    client.write_all(&record(BEGIN_REQUEST, 1, &begin_request_body(false))).unwrap();
    client.write_all(&record(PARAMS, 1, &[])).unwrap();
    client.write_all(&record(STDIN, 1, &[])).unwrap();

    drive_until_peekable(&mut manager, &client, 32);
    let (rec_type, request_id, body) = read_exact_record(&mut client);
    assert_eq!(rec_type, STDOUT);
    assert_eq!(request_id, 1);
    assert_eq!(body, b"hello");

    let (rec_type, request_id, _) = read_exact_record(&mut client);
    assert_eq!(rec_type, END_REQUEST);
    assert_eq!(request_id, 1);
}

struct TaggedHandler;
impl Handler for TaggedHandler {
    fn response(&mut self, req: &mut Request, ring: &mut RingBuffer) -> bool {
        let tag = format!("req-{}", req.full_id.request_id);
        req.out.write(ring, tag.as_bytes()).ok();
        true
    }
}

#[test]
fn two_multiplexed_requests_share_one_connection() {
    let (_dir, listener, path) = bound_listener();
    let mut manager =
        Manager::new(listener, Config::default(), Box::new(|| Box::new(TaggedHandler))).unwrap();
    let mut client = UnixStream::connect(&path).unwrap();

    // Both requests kept alive; interleave their records the way a
    // multiplexing front-end server would rather than finishing one
    // before starting the other.
    client.write_all(&record(BEGIN_REQUEST, 1, &begin_request_body(true))).unwrap();
    client.write_all(&record(BEGIN_REQUEST, 2, &begin_request_body(true))).unwrap();
    client.write_all(&record(PARAMS, 1, &[])).unwrap();
    client.write_all(&record(PARAMS, 2, &[])).unwrap();
    client.write_all(&record(STDIN, 1, &[])).unwrap();
    client.write_all(&record(STDIN, 2, &[])).unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..4 {
        drive_until_peekable(&mut manager, &client, 8);
        let (rec_type, request_id, body) = read_exact_record(&mut client);
        if rec_type == STDOUT {
            assert_eq!(body, format!("req-{request_id}").into_bytes());
            seen.insert(request_id);
        } else {
            assert_eq!(rec_type, END_REQUEST);
        }
    }
    assert_eq!(seen, [1u16, 2u16].into_iter().collect());

    // The connection is still usable: the front end can issue a further
    // request over it rather than having to reconnect.
    client.write_all(&record(BEGIN_REQUEST, 3, &begin_request_body(false))).unwrap();
    client.write_all(&record(PARAMS, 3, &[])).unwrap();
    client.write_all(&record(STDIN, 3, &[])).unwrap();
    drive_until_peekable(&mut manager, &client, 8);
    let (rec_type, request_id, body) = read_exact_record(&mut client);
    assert_eq!(rec_type, STDOUT);
    assert_eq!(request_id, 3);
    assert_eq!(body, b"req-3");
}

struct UploadHandler {
    captured: Arc<Mutex<Option<String>>>,
}
impl Handler for UploadHandler {
    fn response(&mut self, req: &mut Request, ring: &mut RingBuffer) -> bool {
        let value = req.env.posts.get("title").and_then(|entries| entries.first()).and_then(|e| match &e.body {
            mosh_fcgi::EntryBody::InMemory(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            mosh_fcgi::EntryBody::File(_) => None,
        });
        *self.captured.lock().unwrap() = value;
        req.out.write(ring, b"ok").ok();
        true
    }
}

#[test]
fn multipart_upload_populates_posts() {
    let (_dir, listener, path) = bound_listener();
    let captured: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let captured_for_factory = Arc::clone(&captured);
    let mut manager = Manager::new(
        listener,
        Config::default(),
        Box::new(move || {
            Box::new(UploadHandler {
                captured: Arc::clone(&captured_for_factory),
            })
        }),
    )
    .unwrap();
    let mut client = UnixStream::connect(&path).unwrap();

    let body = b"--XYZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n--XYZ--\r\n";
    client.write_all(&record(BEGIN_REQUEST, 4, &begin_request_body(false))).unwrap();
    let mut params = Vec::new();
    params.extend(name_value(b"REQUEST_METHOD", b"POST"));
    params.extend(name_value(b"CONTENT_TYPE", b"multipart/form-data; boundary=XYZ"));
    client.write_all(&record(PARAMS, 4, &params)).unwrap();
    client.write_all(&record(PARAMS, 4, &[])).unwrap();
    client.write_all(&record(STDIN, 4, body)).unwrap();
    client.write_all(&record(STDIN, 4, &[])).unwrap();

    drive_until_peekable(&mut manager, &client, 8);
    let (rec_type, request_id, resp_body) = read_exact_record(&mut client);
    assert_eq!(rec_type, STDOUT);
    assert_eq!(request_id, 4);
    assert_eq!(resp_body, b"ok");
    assert_eq!(captured.lock().unwrap().as_deref(), Some("hello"));
}

#[test]
fn abort_request_finalizes_immediately() {
    let (_dir, listener, path) = bound_listener();
    let mut manager = Manager::new(listener, Config::default(), Box::new(|| Box::new(HelloHandler))).unwrap();
    let mut client = UnixStream::connect(&path).unwrap();

    client.write_all(&record(BEGIN_REQUEST, 5, &begin_request_body(false))).unwrap();
    client.write_all(&record(PARAMS, 5, &[])).unwrap();
    // Abort before STDIN ever closes the Params/In phase.
    client.write_all(&record(ABORT_REQUEST, 5, &[])).unwrap();

    drive_until_peekable(&mut manager, &client, 8);
    let (rec_type, request_id, _) = read_exact_record(&mut client);
    assert_eq!(rec_type, END_REQUEST);
    assert_eq!(request_id, 5);
}

struct WaitingHandler {
    slot: Arc<Mutex<Option<PushCallback>>>,
    resumed: bool,
}
impl Handler for WaitingHandler {
    fn response(&mut self, req: &mut Request, ring: &mut RingBuffer) -> bool {
        if !self.resumed {
            *self.slot.lock().unwrap() = Some(req.callback());
            self.resumed = true;
            false
        } else {
            req.out.write(ring, b"woke").ok();
            true
        }
    }
}

#[test]
fn handler_yields_and_resumes_on_an_external_message() {
    let (_dir, listener, path) = bound_listener();
    let slot: Arc<Mutex<Option<PushCallback>>> = Arc::new(Mutex::new(None));
    let slot_for_factory = Arc::clone(&slot);
    let mut manager = Manager::new(
        listener,
        Config::default(),
        Box::new(move || {
            Box::new(WaitingHandler {
                slot: Arc::clone(&slot_for_factory),
                resumed: false,
            })
        }),
    )
    .unwrap();
    let mut client = UnixStream::connect(&path).unwrap();

    client.write_all(&record(BEGIN_REQUEST, 9, &begin_request_body(false))).unwrap();
    client.write_all(&record(PARAMS, 9, &[])).unwrap();
    client.write_all(&record(STDIN, 9, &[])).unwrap();

    // Drive until the handler has parked its callback, then wake it from
    // an outside thread the way a spawned worker would.
    for _ in 0..500 {
        if slot.lock().unwrap().is_some() {
            break;
        }
        manager.step().unwrap();
    }
    let callback = slot.lock().unwrap().take().expect("handler never yielded");
    callback(b"go".to_vec());

    drive_until_peekable(&mut manager, &client, 8);
    let (rec_type, request_id, body) = read_exact_record(&mut client);
    assert_eq!(rec_type, STDOUT);
    assert_eq!(request_id, 9);
    assert_eq!(body, b"woke");
}

#[test]
fn get_values_query_is_answered_over_a_fresh_connection() {
    let (_dir, listener, path) = bound_listener();
    let mut manager = Manager::new(listener, Config::default(), Box::new(|| Box::new(HelloHandler))).unwrap();
    let mut client = UnixStream::connect(&path).unwrap();

    let query = name_value(b"FCGI_MAX_CONNS", b"");
    client.write_all(&record(9, 0, &query)).unwrap();
    drive_until_peekable(&mut manager, &client, 8);
    let (rec_type, request_id, body) = read_exact_record(&mut client);
    assert_eq!(rec_type, 10); // GET_VALUES_RESULT
    assert_eq!(request_id, 0);
    assert!(!body.is_empty());
}
