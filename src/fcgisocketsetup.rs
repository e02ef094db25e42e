//! Takes over the FastCGI listening socket handed down by the front-end
//! server at process launch: fd 0 by convention, or whatever
//! [`Config::listening_fd`](crate::Config::listening_fd) names.
//!
//! <https://users.rust-lang.org/t/reading-from-pipe-via-stdin-in-binary/133088/10>

use std::fs::File;
use std::io;
use std::io::stdin;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener;

use nix::sys::socket::getpeername;
use nix::unistd::dup2_stdin;

use crate::config::Config;

/// Confirms the configured fd is a connected listening socket and takes it
/// as the `UnixListener` the transceiver binds to. For the default fd 0,
/// additionally replaces stdin with `/dev/null` so ordinary IO on fd 0
/// can't collide with it; a non-default fd is taken over as-is.
pub fn init_fcgi(config: &Config) -> io::Result<UnixListener> {
    if config.listening_fd == 0 {
        if getpeername::<()>(stdin().as_raw_fd()) != Err(nix::Error::ENOTCONN) {
            return Err(io::Error::other(
                "Not a FastCGI application (FD-0 is not a listener socket)",
            ));
        }
        let file = File::open("/dev/null")?;
        let socket_fd = stdin().as_fd().try_clone_to_owned()?;
        dup2_stdin(file)?; // atomically replace stdin
        return Ok(UnixListener::from(socket_fd));
    }

    let fd: RawFd = config.listening_fd;
    if getpeername::<()>(fd) != Err(nix::Error::ENOTCONN) {
        return Err(io::Error::other(
            "Not a FastCGI application (the configured listening fd is not a listener socket)",
        ));
    }
    // SAFETY: the front-end server handed this fd down to us at process
    // launch and keeps no other reference to it; we take sole ownership.
    Ok(unsafe { UnixListener::from_raw_fd(fd) })
}
