//! Transport layer interface between the host stack and an HCI controller.
//!
//! The transport presents the controller as a bidirectional stream of
//! complete, tagged HCI packets. Platform adapters (Linux HCI socket, USB,
//! in-memory loopback for tests) live outside this crate.

use std::fmt::Debug;
use std::io;

use futures_core::future::BoxFuture;

/// Local host errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport was closed by the controller or the platform.
    #[error("transport closed")]
    Closed,
    /// An I/O error reported by the platform transport.
    #[error("transport i/o error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Self {
        Self::Io(e.kind())
    }
}

/// Common host result type.
pub type Result<T> = std::result::Result<T, Error>;

/// HCI transport layer.
///
/// Each packet starts with a one-byte type tag followed by the packet
/// payload. `recv` yields exactly one complete packet per call and `send`
/// writes one; the transport owns any framing needed below that.
pub trait Transport: Debug + Send + Sync {
    /// Receives the next complete HCI packet into `buf`, returning its
    /// length. A zero-length read means the transport was closed.
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>>;

    /// Sends one complete HCI packet.
    fn send<'a>(&'a self, pkt: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}
