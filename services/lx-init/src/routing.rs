//! PF_ROUTE routing socket.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

use lxinit_networking::RouteChannel;
use tracing::debug;

/// Routing control channel backed by a raw `PF_ROUTE` socket.
///
/// A fresh socket is opened for each message and closed after the write.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoutingSocket;

impl RoutingSocket {
    fn open() -> io::Result<OwnedFd> {
        // SAFETY: socket(2) has no memory-safety preconditions.
        let fd = unsafe { libc::socket(libc::PF_ROUTE, libc::SOCK_RAW, libc::AF_INET) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl RouteChannel for RoutingSocket {
    fn interface_index(&self, name: &str) -> Option<u32> {
        match nix::net::if_::if_nametoindex(name) {
            Ok(index) => Some(index),
            Err(errno) => {
                debug!(iface = name, %errno, "interface index lookup failed");
                None
            }
        }
    }

    fn send_message(&self, message: &[u8]) -> io::Result<usize> {
        let fd = Self::open()?;
        let written = nix::unistd::write(&fd, message)?;
        Ok(written)
    }
}
