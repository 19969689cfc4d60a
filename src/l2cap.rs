//! Logical Link Control and Adaptation Protocol over the LE-U logical link
//! ([Vol 3] Part A).
//!
//! One [`LeL2cap`] instance serves one HCI. It owns the connection
//! lifecycle: LE Connection Complete creates a [`Conn`] and publishes it on
//! the accept channel, Disconnection Complete tears it down, and Number Of
//! Completed Packets returns transmit buffers to the shared pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use conn::{Conn, Params, Pdu};
use pool::Pool;

use crate::hci::{
    ConnHandle, DisconnectionComplete, EventCode, Hci, LeConnectionComplete,
    LeConnectionUpdateComplete, LeLongTermKeyRequest, NumberOfCompletedPackets, SubeventCode,
    ACL_HDR,
};
use crate::{hci, host, SyncMutex};

mod conn;
mod pool;

/// Basic L2CAP header length: PDU length and CID ([Vol 3] Part A,
/// Section 3.1).
pub(crate) const L2CAP_HDR: usize = 4;

/// Fixed channel identifiers ([Vol 3] Part A, Section 2.1).
pub(crate) const CID_ATT: u16 = 0x0004;
pub(crate) const CID_LE_SIGNAL: u16 = 0x0005;
pub(crate) const CID_SMP: u16 = 0x0006;

/// Default ATT MTU until Exchange MTU completes
/// ([Vol 3] Part F, Section 3.2.8).
pub const DEFAULT_MTU: u16 = 23;

/// Inbound ACL fragment queue depth per connection.
const INBOUND_QUEUE: usize = 16;

/// Pending accepted connections.
const ACCEPT_QUEUE: usize = 4;

/// Error type returned by the L2CAP layer.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Hci(#[from] hci::Error),
    #[error("connection closed ({0})")]
    ConnClosed(ConnHandle),
    #[error("channel manager stopped")]
    Stopped,
}

impl From<host::Error> for Error {
    #[inline]
    fn from(e: host::Error) -> Self {
        Self::Hci(e.into())
    }
}

/// Common L2CAP result type.
pub type Result<T> = std::result::Result<T, Error>;

/// LE-U channel manager for one HCI.
#[derive(Debug)]
pub struct LeL2cap {
    accept: mpsc::Receiver<Arc<Conn>>,
    #[allow(dead_code)]
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    hci: Hci,
    pool: Arc<Pool>,
    acl_mtu: usize,
    conns: SyncMutex<HashMap<u16, ConnEntry>>,
    accept_tx: mpsc::Sender<Arc<Conn>>,
}

#[derive(Clone, Debug)]
struct ConnEntry {
    conn: Arc<Conn>,
    in_tx: mpsc::Sender<Vec<u8>>,
}

impl LeL2cap {
    /// Creates the channel manager and attaches it to `hci`, which must be
    /// initialized so that the controller's ACL buffer parameters are known.
    #[must_use]
    pub fn new(hci: &Hci) -> Self {
        let info = hci.info();
        let (accept_tx, accept) = mpsc::channel(ACCEPT_QUEUE);
        // Head room for the HCI type tag and ACL data packet header
        let pool = Pool::new(
            1 + ACL_HDR + usize::from(info.acl_data_len),
            usize::from(info.acl_num_pkts),
        );
        let inner = Arc::new(Inner {
            hci: hci.clone(),
            pool,
            acl_mtu: usize::from(info.acl_data_len),
            conns: SyncMutex::new(HashMap::new()),
            accept_tx,
        });

        let w = Arc::downgrade(&inner);
        hci.set_acl_sink(move |pkt| {
            if let Some(inner) = w.upgrade() {
                inner.handle_acl_data(pkt);
            }
        });
        let w = Arc::downgrade(&inner);
        hci.set_event_handler(EventCode::DisconnectionComplete, move |params: &[u8]| {
            if let Some(inner) = w.upgrade() {
                inner.handle_disconnect(params);
            }
        });
        let w = Arc::downgrade(&inner);
        hci.set_event_handler(EventCode::NumberOfCompletedPackets, move |params: &[u8]| {
            if let Some(inner) = w.upgrade() {
                inner.handle_num_completed(params);
            }
        });
        let w = Arc::downgrade(&inner);
        hci.set_subevent_handler(SubeventCode::LeConnectionComplete, move |params: &[u8]| {
            if let Some(inner) = w.upgrade() {
                inner.handle_connect(params);
            }
        });
        let w = Arc::downgrade(&inner);
        (hci.set_subevent_handler(
            SubeventCode::LeConnectionUpdateComplete,
            move |params: &[u8]| {
                if let Some(inner) = w.upgrade() {
                    inner.handle_conn_update(params);
                }
            },
        ));
        let w = Arc::downgrade(&inner);
        hci.set_subevent_handler(SubeventCode::LeLongTermKeyRequest, move |params: &[u8]| {
            if let Some(inner) = w.upgrade() {
                inner.handle_ltk_request(params);
            }
        });

        Self { accept, inner }
    }

    /// Returns the next established LE-U connection. This method is cancel
    /// safe.
    pub async fn accept(&mut self) -> Result<Arc<Conn>> {
        self.accept.recv().await.ok_or(Error::Stopped)
    }
}

impl Inner {
    /// Routes one inbound ACL packet (without the HCI type tag) to its
    /// connection's fragment queue.
    fn handle_acl_data(&self, pkt: &[u8]) {
        let Some(hf) = pkt.get(..2) else {
            warn!("short ACL data packet: {pkt:02X?}");
            return;
        };
        let handle = u16::from_le_bytes([hf[0], hf[1]]) & 0x0FFF;
        let entry = self.conns.lock().get(&handle).cloned();
        let Some(entry) = entry else {
            warn!("ACL data for unknown connection {handle:#06X}");
            return;
        };
        match entry.in_tx.try_send(pkt.to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} inbound queue full, dropping fragment", entry.conn.handle());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Handles the creation of a new LE-U logical link.
    fn handle_connect(&self, params: &[u8]) {
        let Some(evt) = LeConnectionComplete::unpack(params) else {
            warn!("invalid LE connection complete event: {params:02X?}");
            return;
        };
        if !evt.status.is_ok() {
            return;
        }
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let conn = Arc::new(Conn::new(
            evt.handle,
            evt.peer_addr,
            self.hci.acl_writer(),
            self.acl_mtu,
            Arc::clone(&self.pool),
            in_rx,
            Params {
                tx_mtu: DEFAULT_MTU,
                rx_mtu: DEFAULT_MTU,
                interval: evt.interval,
                latency: evt.latency,
                supervision_timeout: evt.supervision_timeout,
            },
        ));
        debug!("connected: {} as {:?} ({})", conn.peer(), evt.role, evt.handle);
        let entry = ConnEntry {
            conn: Arc::clone(&conn),
            in_tx,
        };
        self.conns.lock().insert(u16::from(evt.handle), entry);
        if self.accept_tx.try_send(conn).is_err() {
            warn!("accept queue full, dropping {}", evt.handle);
            if let Some(e) = self.conns.lock().remove(&u16::from(evt.handle)) {
                e.conn.close();
            }
        }
    }

    /// Handles LE-U logical link disconnection.
    fn handle_disconnect(&self, params: &[u8]) {
        let Some(evt) = DisconnectionComplete::unpack(params) else {
            warn!("invalid disconnection complete event: {params:02X?}");
            return;
        };
        if !evt.status.is_ok() {
            return;
        }
        let Some(entry) = self.conns.lock().remove(&u16::from(evt.handle)) else {
            warn!("disconnect for unknown connection {}", evt.handle);
            return;
        };
        debug!("disconnected: {} (reason {:#04X})", evt.handle, evt.reason);
        // Dropping `in_tx` closes the inbound channel, signaling readers.
        entry.conn.close();
    }

    /// Returns acknowledged transmit buffers to the pool.
    fn handle_num_completed(&self, params: &[u8]) {
        let Some(evt) = NumberOfCompletedPackets::unpack(params) else {
            warn!("invalid number of completed packets event: {params:02X?}");
            return;
        };
        let conns = self.conns.lock();
        for (handle, n) in evt.entries {
            if let Some(entry) = conns.get(&u16::from(handle)) {
                entry.conn.free_leases(usize::from(n));
            }
        }
    }

    /// Refreshes connection parameters after a connection update.
    fn handle_conn_update(&self, params: &[u8]) {
        let Some(evt) = LeConnectionUpdateComplete::unpack(params) else {
            warn!("invalid connection update event: {params:02X?}");
            return;
        };
        if !evt.status.is_ok() {
            return;
        }
        if let Some(entry) = self.conns.lock().get(&u16::from(evt.handle)) {
            (entry.conn).update_params(evt.interval, evt.latency, evt.supervision_timeout);
        }
    }

    /// Rejects long term key requests; the security manager is out of scope.
    fn handle_ltk_request(&self, params: &[u8]) {
        let Some(evt) = LeLongTermKeyRequest::unpack(params) else {
            warn!("invalid long term key request event: {params:02X?}");
            return;
        };
        let hci = self.hci.clone();
        tokio::spawn(async move {
            if let Err(e) = hci.le_long_term_key_request_negative_reply(evt.handle).await {
                warn!("long term key negative reply failed: {e}");
            }
        });
    }
}

#[cfg(test)]
pub(crate) use conn::testing;
