//! FastCGI application-side runtime: a multiplexed request engine for
//! processes dispatched to by a front-end web server.
//!
//! A typical embedder calls [`init_fcgi`] to take over the listening
//! socket handed down by the front-end server, builds a [`Config`]
//! (normally via [`Config::from_env`]), and runs a [`Manager`] with a
//! [`Handler`]-implementing type supplied per request.

mod boyer_moore;
mod config;
mod error;
mod fcgisocketsetup;
mod http;
mod manager;
mod protocol;
mod request;
mod ringbuf;
mod stream;
mod tempfile;
mod transceiver;

pub use config::Config;
pub use error::{Error, Result};
pub use fcgisocketsetup::init_fcgi;
pub use http::{Cookie, CookieJar, Environment, EntryBody, MixedEntry, MultiMap, MultipartEntry};
pub use manager::{HandlerFactory, Manager};
pub use protocol::{ProtocolStatus, Role};
pub use request::{Handler, MessageQueue, PushCallback, Request};
pub use ringbuf::{FullId, RingBuffer};
