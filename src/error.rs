//! Crate-wide error type.
//!
//! Every fault a request can hit on the wire or in a body parser funnels
//! through here. None of it panics: malformed input from the front-end
//! server is adversarial by default.

use thiserror::Error;

/// A fault occurring while decoding the wire, parsing a body, or driving a
/// request's state machine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed FastCGI record: {0}")]
    WireMalformed(String),

    #[error("record type {got:?} not valid in state {state:?}")]
    RecordOutOfOrder { state: &'static str, got: u8 },

    #[error("HTTP body parse error: {0}")]
    BodyParse(String),

    #[error("character encoding failure: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tempfile error: {0}")]
    Tempfile(String),

    #[error("poll(2) failed: {0}")]
    Poll(String),
}

pub type Result<T> = std::result::Result<T, Error>;
