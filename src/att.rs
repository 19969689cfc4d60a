//! Attribute Protocol ([Vol 3] Part F).
//!
//! The [`Server`] answers one client over an LE-U connection using the
//! sequential request/response discipline; the [`Client`] issues requests
//! from the central role. Both share the [`Db`] attribute database and the
//! wire [`Opcode`]/[`ErrorCode`] vocabulary.

use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

pub use {
    client::{Client, NotificationSink},
    consts::*,
    db::*,
    server::{Server, Session},
};

use crate::l2cap;

mod client;
mod consts;
mod db;
mod server;

/// Transaction timeout for responses and confirmations
/// ([Vol 3] Part F, Section 3.3.3).
pub(crate) const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type returned by the ATT layer.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    L2cap(#[from] l2cap::Error),
    /// The remote server answered a request with `ATT_ERROR_RSP`.
    #[error(transparent)]
    Rsp(#[from] ErrorRsp),
    /// Sequential protocol timeout: the peer did not respond or confirm
    /// within 30 seconds. Never sent on the wire.
    #[error("timeout waiting for {0} response")]
    Timeout(Opcode),
    /// The notification session or connection ended.
    #[error("notification session closed")]
    Closed,
}

/// Common ATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// `ATT_ERROR_RSP` received from a remote server
/// ([Vol 3] Part F, Section 3.4.1.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub struct ErrorRsp {
    /// Opcode of the request that failed.
    pub req: u8,
    /// Attribute handle in error, 0x0000 when not applicable.
    pub handle: u16,
    /// Reason the request failed.
    pub err: ErrorCode,
}

impl Display for ErrorRsp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ATT request {:#04X} ", self.req)?;
        if self.handle != 0 {
            write!(f, "for handle {:#06X} ", self.handle)?;
        }
        write!(f, "failed with {}", self.err)
    }
}
