//! Runtime configuration for the manager and transceiver.
//!
//! Loaded from a single named environment variable rather than a file
//! path, with `serde`/`serde_json` doing the structured decoding.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Value reported for `FCGI_MAX_CONNS` in a `GET_VALUES_RESULT` reply.
pub const DEFAULT_MAX_CONNS: u32 = 10;
/// Value reported for `FCGI_MAX_REQS`.
pub const DEFAULT_MAX_REQS: u32 = 50;
/// Value reported for `FCGI_MPXS_CONNS`: this crate always advertises
/// multiplexing support.
pub const DEFAULT_MPXS_CONNS: u32 = 1;

/// Knobs the manager and transceiver read at startup. `Default` reproduces
/// the hard-coded `GET_VALUES` values this crate advertises out of the box.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Advertised via `GET_VALUES_RESULT`'s `FCGI_MAX_CONNS`.
    pub max_conns: u32,
    /// Advertised via `GET_VALUES_RESULT`'s `FCGI_MAX_REQS`.
    pub max_reqs: u32,
    /// File descriptor the front-end server bound the listening socket on.
    /// 0 unless the embedder was launched with a non-default fd.
    pub listening_fd: i32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_conns: DEFAULT_MAX_CONNS,
            max_reqs: DEFAULT_MAX_REQS,
            listening_fd: 0,
        }
    }
}

impl Config {
    /// Load overrides from a `MOSH_FCGI_CONFIG` environment variable holding
    /// a JSON object. Falls back to [`Config::default`] when the variable
    /// is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var("MOSH_FCGI_CONFIG") {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Encoding(format!("MOSH_FCGI_CONFIG: {e}"))),
            Err(std::env::VarError::NotPresent) => Ok(Config::default()),
            Err(e) => Err(Error::Encoding(format!("MOSH_FCGI_CONFIG: {e}"))),
        }
    }
}
