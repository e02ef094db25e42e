//! Request (C7): per-request state machine and hook dispatch.
//!
//! Widened from an accumulate-until-empty-record `Params -> Stdin -> done`
//! path to the full `Params/In/Data/Out/Done` table below, and from a
//! free-function `handler(...)` callback to a `Handler` trait.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use num_traits::ToPrimitive;

use crate::error::{Error, Result};
use crate::http::multipart::Completed;
use crate::http::{extract_attribute, starts_with_ci, BodyParser, Environment, MultipartEntry};
use crate::http::UrlEncodedParser;
use crate::protocol::{decode_name_value_stream, EndRequestBody, Header, ProtocolStatus, RecordType, Role};
use crate::ringbuf::{FullId, RingBuffer};
use crate::stream::OutputStream;

/// `{Params, In, Data, Out, Done}` phase transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Params,
    In,
    Data,
    Out,
    Done,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Params => "Params",
            Phase::In => "In",
            Phase::Data => "Data",
            Phase::Out => "Out",
            Phase::Done => "Done",
        }
    }
}

/// A cross-thread-pushable FIFO of opaque messages, the basis of the
/// cooperative continuation mechanism: `response()` returning `false`
/// relinquishes control until one of these arrives.
#[derive(Clone, Default)]
pub struct MessageQueue(Arc<Mutex<VecDeque<Vec<u8>>>>);

impl MessageQueue {
    pub fn push(&self, message: Vec<u8>) {
        self.0.lock().expect("message queue mutex poisoned").push_back(message);
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.0.lock().expect("message queue mutex poisoned").pop_front()
    }

    fn is_empty(&self) -> bool {
        self.0.lock().expect("message queue mutex poisoned").is_empty()
    }
}

/// A cloneable handle auxiliary threads use to push a message onto a
/// request's queue and wake the I/O thread, bound by the manager at
/// `BEGIN_REQUEST` time so that auxiliary threads interact with a request
/// only through this closure, never through the (non-`Send`) `Request`
/// itself.
pub type PushCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Polymorphic per-request hook set, invoked by the state machine as
/// records arrive. Default bodies retain every `PARAMS` pair and otherwise
/// do nothing; `response` has no sensible default and must be supplied.
pub trait Handler {
    /// Called once per decoded `PARAMS` pair; the return value decides
    /// whether it's retained in `req.env.envs`.
    fn params_handler(&mut self, _req: &mut Request, _name: &str, _value: &str) -> bool {
        true
    }

    /// Called after every `STDIN` chunk, with a final empty-slice call once
    /// the stream ends.
    fn in_handler(&mut self, _req: &mut Request, _bytes: &[u8]) {}

    /// Called after every `FCGI_DATA` chunk (`Filter` role only),
    /// analogously to `in_handler`.
    fn data_handler(&mut self, _req: &mut Request, _bytes: &[u8]) {}

    /// Invoked once the request reaches the `Out` phase, and again each
    /// time it's resumed after yielding. `true` finalizes the request now;
    /// `false` yields until a message is pushed onto `req.messages`. `ring`
    /// is the connection's real outbound byte queue: writes through
    /// `req.out`/`req.err` need it live, not a throwaway, since a write
    /// that fills the staging buffer flushes into whatever ring it's given.
    fn response(&mut self, req: &mut Request, ring: &mut RingBuffer) -> bool;
}

/// One in-flight FastCGI request: state machine, parsed environment, and
/// the two framed output sinks the handler writes to.
pub struct Request {
    pub full_id: FullId,
    pub role: Role,
    pub env: Environment,
    pub out: OutputStream,
    pub err: OutputStream,
    pub messages: MessageQueue,
    callback: PushCallback,
    phase: Phase,
    keep_conn: bool,
    app_status: i32,
    param_buf: Vec<u8>,
    body_parser: BodyParser,
    handler: Option<Box<dyn Handler>>,
    waiting: bool,
    done: bool,
}

impl Request {
    /// `messages` and `callback` are constructed by the caller (the
    /// manager) so that `callback`, handed out to auxiliary threads, can
    /// push onto the very same queue this request drains from without a
    /// circular handle-before-the-request-exists problem.
    pub fn new(
        full_id: FullId,
        role: Role,
        keep_conn: bool,
        handler: Box<dyn Handler>,
        messages: MessageQueue,
        callback: PushCallback,
    ) -> Self {
        Request {
            full_id,
            role,
            env: Environment::default(),
            out: OutputStream::new(full_id, RecordType::Stdout),
            err: OutputStream::new(full_id, RecordType::Stderr),
            messages,
            callback,
            phase: Phase::Params,
            keep_conn,
            app_status: 0,
            param_buf: Vec::new(),
            body_parser: BodyParser::None,
            handler: Some(handler),
            waiting: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// A cloneable handle other threads can use to wake this request
    /// without touching the (non-`Send`) `Request` itself.
    pub fn message_handle(&self) -> MessageQueue {
        self.messages.clone()
    }

    /// The push callback bound to this request, for handing off to
    /// application threads spawned from within `Handler::response`.
    pub fn callback(&self) -> PushCallback {
        self.callback.clone()
    }

    /// Pop the next pending message, if any. Meant to be called from
    /// within `Handler::response`.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        self.messages.pop()
    }

    /// Set the `app_status` reported in `END_REQUEST` (0 on success, 1 on a
    /// caught exception).
    pub fn set_app_status(&mut self, status: i32) {
        self.app_status = status;
    }

    fn call_handler<R>(&mut self, f: impl FnOnce(&mut dyn Handler, &mut Request) -> R) -> R {
        let mut handler = self.handler.take().expect("handler present while request is alive");
        let result = f(&mut *handler, self);
        self.handler = Some(handler);
        result
    }

    /// Like `call_handler`, but for `response()` specifically: threads the
    /// real connection ring through so staging-buffer flushes during the
    /// call land on the wire instead of a disposable buffer.
    fn call_response(&mut self, ring: &mut RingBuffer) -> bool {
        let mut handler = self.handler.take().expect("handler present while request is alive");
        let result = handler.response(self, ring);
        self.handler = Some(handler);
        result
    }

    /// Feed one inbound record body to the state machine. `ring` is where
    /// any response output (including `END_REQUEST`) gets framed once the
    /// request reaches `Out` and the handler writes or finalizes.
    pub fn handle_record(
        &mut self,
        ring: &mut RingBuffer,
        rec_type: RecordType,
        content: &[u8],
    ) -> Result<bool> {
        if rec_type == RecordType::AbortRequest {
            self.phase = Phase::Done;
            self.finalize(ring)?;
            return Ok(true);
        }

        match (self.phase, rec_type) {
            (Phase::Params, RecordType::Params) => {
                if content.is_empty() {
                    self.phase = match self.role {
                        Role::Authorizer => Phase::Out,
                        Role::Responder | Role::Filter => Phase::In,
                    };
                } else {
                    self.feed_params(content)?;
                }
            }
            (Phase::In, RecordType::Stdin) => {
                if content.is_empty() {
                    self.call_handler(|h, req| h.in_handler(req, &[]));
                    self.finish_body_parser_into_posts()?;
                    self.phase = match self.role {
                        Role::Filter => Phase::Data,
                        Role::Responder | Role::Authorizer => Phase::Out,
                    };
                } else {
                    self.feed_stdin(content)?;
                }
            }
            (Phase::Data, RecordType::Data) => {
                if content.is_empty() {
                    self.call_handler(|h, req| h.data_handler(req, &[]));
                    self.phase = Phase::Out;
                } else {
                    self.call_handler(|h, req| h.data_handler(req, content));
                }
            }
            (phase, got) => {
                return Err(Error::RecordOutOfOrder {
                    state: phase.name(),
                    got: got.to_u8().unwrap_or(0),
                });
            }
        }

        if self.phase == Phase::Out {
            return self.drive_response(ring);
        }
        Ok(false)
    }

    /// Re-entry point for the manager: call after pushing a message onto a
    /// request that previously yielded from `response()`.
    pub fn resume(&mut self, ring: &mut RingBuffer) -> Result<bool> {
        if self.phase == Phase::Out {
            self.drive_response(ring)
        } else {
            Ok(self.done)
        }
    }

    fn drive_response(&mut self, ring: &mut RingBuffer) -> Result<bool> {
        if self.done {
            return Ok(true);
        }
        if self.waiting {
            if self.messages.is_empty() {
                return Ok(false);
            }
            self.waiting = false;
        }
        let finished = self.call_response(ring);
        if finished {
            self.finalize(ring)?;
            Ok(true)
        } else {
            self.waiting = true;
            Ok(false)
        }
    }

    fn finalize(&mut self, ring: &mut RingBuffer) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.out.flush(ring)?;
        self.err.flush(ring)?;

        let body = EndRequestBody {
            app_status: self.app_status,
            protocol_status: ProtocolStatus::RequestComplete,
        };
        let header = Header::new(RecordType::EndRequest, self.full_id.request_id, EndRequestBody::LEN as u16);
        let total = header.total_len();
        let region = ring.request_write(total);
        debug_assert!(region.len() >= total);
        region[..8].copy_from_slice(&header.encode());
        region[8..8 + EndRequestBody::LEN].copy_from_slice(&body.encode());
        for b in &mut region[8 + EndRequestBody::LEN..total] {
            *b = 0;
        }
        ring.commit(total, self.full_id, !self.keep_conn);
        self.out.close();
        self.err.close();
        self.done = true;
        Ok(())
    }

    /// Catch a fault the state machine or a body parser raised: log it to
    /// `err` and finalize with `app_status=1`, rather than letting the
    /// manager's dispatch loop propagate it and tear down every other
    /// in-flight request on the connection. Safe to call from any phase.
    pub(crate) fn fail(&mut self, ring: &mut RingBuffer, err: &Error) {
        if self.done {
            return;
        }
        let _ = self.err.write_str(ring, &format!("{err}\n"));
        self.app_status = 1;
        if self.finalize(ring).is_err() {
            // `finalize`'s own fallible steps never actually fail today
            // (ring writes are infallible); force the request closed
            // regardless so a future fallible step here can't wedge it.
            self.out.close();
            self.err.close();
            self.done = true;
        }
    }

    fn feed_params(&mut self, content: &[u8]) -> Result<()> {
        self.param_buf.extend_from_slice(content);
        let (pairs, consumed) = decode_name_value_stream(&self.param_buf)?;
        self.param_buf.drain(..consumed);
        for (name_bytes, value_bytes) in pairs {
            let name = String::from_utf8(name_bytes).map_err(|e| Error::Encoding(e.to_string()))?;
            let value = String::from_utf8(value_bytes).map_err(|e| Error::Encoding(e.to_string()))?;
            self.arm_body_parser_from_param(&name, &value)?;
            let retain = self.call_handler(|h, req| h.params_handler(req, &name, &value));
            if retain {
                self.env.envs.push(name, value);
            }
        }
        Ok(())
    }

    fn arm_body_parser_from_param(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "CONTENT_TYPE" => {
                if starts_with_ci(value, "application/x-www-form-urlencoded") {
                    self.body_parser = BodyParser::UrlEncoded(UrlEncodedParser::new());
                } else if starts_with_ci(value, "multipart/form-data") {
                    let boundary = extract_attribute(value, "boundary").ok_or_else(|| {
                        Error::BodyParse("multipart/form-data missing boundary=".into())
                    })?;
                    self.body_parser =
                        BodyParser::Multipart(Box::new(crate::http::MultipartParser::new(&boundary)));
                }
            }
            "QUERY_STRING" => {
                let mut parser = UrlEncodedParser::new();
                let mut pairs = parser.feed(value.as_bytes())?;
                pairs.extend(parser.finish()?);
                for (k, v) in pairs {
                    self.env.gets.push(k, v);
                }
            }
            "HTTP_COOKIE" => {
                self.env.cookies.parse(value)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn feed_stdin(&mut self, content: &[u8]) -> Result<()> {
        self.call_handler(|h, req| h.in_handler(req, content));
        match &mut self.body_parser {
            BodyParser::UrlEncoded(parser) => {
                let pairs = parser.feed(content)?;
                for (k, v) in pairs {
                    self.env.posts.push(k.clone(), MultipartEntry::inline(k, v));
                }
            }
            BodyParser::Multipart(parser) => {
                parser.feed(content)?;
            }
            BodyParser::None => {}
        }
        Ok(())
    }

    fn finish_body_parser_into_posts(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.body_parser, BodyParser::None) {
            BodyParser::None => Ok(()),
            BodyParser::UrlEncoded(mut parser) => {
                if let Some((k, v)) = parser.finish()? {
                    self.env.posts.push(k.clone(), MultipartEntry::inline(k, v));
                }
                Ok(())
            }
            BodyParser::Multipart(mut parser) => {
                parser.finish()?;
                for completed in parser.into_completed() {
                    match completed {
                        Completed::Simple(entry) => self.env.posts.push(entry.name.clone(), entry),
                        Completed::Mixed { name, entries } => {
                            for entry in entries {
                                self.env.mm_posts.push(name.clone(), entry);
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
