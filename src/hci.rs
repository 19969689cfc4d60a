//! Host Controller Interface ([Vol 4] Part E).
//!
//! The HCI core multiplexes one packet-oriented transport: a reader task
//! demultiplexes inbound packets by type tag, a sender task serializes
//! outbound commands under controller-granted credit, and registered
//! handlers receive events, LE meta subevents, and inbound ACL data.

use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use structbuf::Unpacker;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use {cmd::*, event::*};

use crate::dev::RawAddr;
use crate::{host, SyncMutex};

mod cmd;
mod event;

/// HCI packet type tags ([Vol 4] Part A, Section 2).
pub(crate) const PKT_COMMAND: u8 = 0x01;
pub(crate) const PKT_ACL_DATA: u8 = 0x02;
pub(crate) const PKT_SCO_DATA: u8 = 0x03;
pub(crate) const PKT_EVENT: u8 = 0x04;
pub(crate) const PKT_VENDOR: u8 = 0xFF;

/// ACL data packet header length: handle/flags and data length
/// ([Vol 4] Part E, Section 5.4.2).
pub(crate) const ACL_HDR: usize = 4;

/// Scratch buffer size for inbound transport reads.
const READ_BUF: usize = 4096;

/// Error type returned by the HCI layer.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Host(#[from] host::Error),
    #[error("{opcode} command failed: {status}")]
    Command { opcode: Opcode, status: Status },
    #[error("{opcode} command aborted")]
    Aborted { opcode: Opcode },
    #[error("invalid {opcode} return parameters")]
    InvalidReturn { opcode: Opcode },
    #[error("controller initialization error: {0}")]
    Init(&'static str),
}

/// Common HCI result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Connection handle assigned by the controller
/// ([Vol 4] Part E, Section 5.3.1).
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnHandle(u16);

impl ConnHandle {
    /// Wraps a raw 12-bit connection handle.
    #[inline]
    #[must_use]
    pub const fn new(h: u16) -> Self {
        Self(h & 0x0FFF)
    }
}

impl Debug for ConnHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnHandle({:#06X})", self.0)
    }
}

impl Display for ConnHandle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<ConnHandle> for u16 {
    #[inline]
    fn from(h: ConnHandle) -> Self {
        h.0
    }
}

/// Host side of the Host Controller Interface.
#[derive(Clone, Debug)]
pub struct Hci {
    transport: Arc<dyn host::Transport>,
    router: Arc<Router>,
    commands: Arc<Commands>,
    acl: Arc<AclState>,
    info: Arc<SyncMutex<ControllerInfo>>,
}

/// Inbound ACL data callback and negotiated buffer parameters.
#[derive(Default)]
struct AclState {
    sink: SyncMutex<Option<Arc<dyn Fn(&[u8]) + Send + Sync>>>,
}

impl Debug for AclState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclState").finish_non_exhaustive()
    }
}

/// Controller information gathered during [`Hci::init`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ControllerInfo {
    /// Public device address.
    pub addr: RawAddr,
    /// Maximum ACL data payload per packet.
    pub acl_data_len: u16,
    /// Number of ACL data packets the controller can buffer.
    pub acl_num_pkts: u16,
    /// Advertising channel transmit power in dBm.
    pub tx_power: i8,
}

impl Hci {
    /// Creates an HCI host over transport `t`. [`Self::run`] must be called
    /// before submitting commands or expecting events.
    #[must_use]
    pub fn new(t: Arc<dyn host::Transport>) -> Self {
        Self {
            transport: t,
            router: Arc::new(Router::default()),
            commands: Arc::new(Commands::new()),
            acl: Arc::new(AclState::default()),
            info: Arc::new(SyncMutex::new(ControllerInfo::default())),
        }
    }

    /// Spawns the transport reader and command sender tasks. The tasks stop
    /// when the returned future is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    #[must_use]
    pub fn run(&self) -> EventLoop {
        let ct = CancellationToken::new();
        let sender = (self.commands.take_sender()).expect("HCI tasks already running");
        EventLoop {
            reader: tokio::spawn(Self::reader_loop(self.clone(), ct.clone())),
            sender: tokio::spawn(sender.run(Arc::clone(&self.transport), ct.clone())),
            cancel: ct.clone(),
            _guard: ct.drop_guard(),
        }
    }

    /// Receives packets from the transport until cancellation or a fatal
    /// transport error.
    async fn reader_loop(self, ct: CancellationToken) -> Result<()> {
        debug!("HCI reader started");
        let mut buf = vec![0; READ_BUF];
        loop {
            let n = tokio::select! {
                r = self.transport.recv(&mut buf) => r?,
                _ = ct.cancelled() => {
                    debug!("HCI reader terminating");
                    return Ok(());
                }
            };
            if n == 0 {
                return Err(host::Error::Closed.into());
            }
            self.handle_packet(&buf[..n]);
        }
    }

    /// Demultiplexes one inbound packet by its type tag.
    fn handle_packet(&self, pkt: &[u8]) {
        let Some((&typ, payload)) = pkt.split_first() else {
            warn!("empty packet");
            return;
        };
        match typ {
            PKT_ACL_DATA => {
                let sink = self.acl.sink.lock().clone();
                match sink {
                    Some(sink) => sink(payload),
                    None => warn!("ACL data with no sink: {payload:02X?}"),
                }
            }
            PKT_EVENT => self.handle_event(payload),
            PKT_COMMAND => warn!("unmanaged command packet: {payload:02X?}"),
            PKT_SCO_DATA => warn!("unsupported SCO packet: {payload:02X?}"),
            PKT_VENDOR => warn!("unsupported vendor packet: {payload:02X?}"),
            _ => warn!("invalid packet type {typ:#04X}: {payload:02X?}"),
        }
    }

    /// Validates the event header and routes the parameters. Command
    /// completion events feed the command sender; LE meta events are
    /// re-dispatched on their subevent code.
    fn handle_event(&self, evt: &[u8]) {
        let mut p = Unpacker::new(evt);
        let (code, plen) = (p.u8(), p.u8());
        if !p.is_ok() || p.len() != usize::from(plen) {
            warn!("corrupt event packet: {evt:02X?}");
            return;
        }
        let params = p.into_inner();
        match EventCode::try_from(code) {
            Ok(EventCode::CommandComplete) => self.commands.handle_complete(params),
            Ok(EventCode::CommandStatus) => self.commands.handle_status(params),
            Ok(EventCode::LeMeta) => {
                let Some((&subevent, params)) = params.split_first() else {
                    warn!("empty LE meta event");
                    return;
                };
                self.router.dispatch_subevent(subevent, params);
            }
            _ => self.router.dispatch_event(code, params),
        }
    }

    /// Registers `h` as the handler for event `code`, returning the previous
    /// handler.
    pub fn set_event_handler(
        &self,
        code: EventCode,
        h: impl EventHandler + 'static,
    ) -> Option<Arc<dyn EventHandler>> {
        self.router.set_event_handler(code, Arc::new(h))
    }

    /// Registers `h` as the handler for LE meta subevent `code`, returning
    /// the previous handler.
    pub fn set_subevent_handler(
        &self,
        code: SubeventCode,
        h: impl EventHandler + 'static,
    ) -> Option<Arc<dyn EventHandler>> {
        self.router.set_subevent_handler(code, Arc::new(h))
    }

    /// Registers the inbound ACL data callback. The callback receives each
    /// ACL packet without the HCI type tag and must not block.
    pub(crate) fn set_acl_sink(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.acl.sink.lock() = Some(Arc::new(f));
    }

    /// Returns an outbound ACL data write sink.
    #[inline]
    #[must_use]
    pub(crate) fn acl_writer(&self) -> AclWriter {
        AclWriter(Arc::clone(&self.transport))
    }

    /// Returns controller information. Valid after [`Self::init`].
    #[inline]
    #[must_use]
    pub fn info(&self) -> ControllerInfo {
        *self.info.lock()
    }

    /// Resets and initializes the controller. The reader and sender tasks
    /// must be running. Failure at any step aborts startup.
    pub async fn init(&self) -> Result<()> {
        debug!("HCI reset...");
        self.reset().await?;

        let addr = self.read_bd_addr().await?;
        debug!("Controller address: {addr}");
        self.read_local_supported_commands().await?;
        self.read_local_supported_features().await?;
        let ver = self.read_local_version().await?;
        debug!("Controller version: {ver:?}");

        // Assume ACL-U and LE-U share buffers until the controller reports
        // dedicated LE buffers.
        let mut buf = self.read_buffer_size().await?;
        debug!("Controller BR/EDR/LE buffers: {buf:?}");
        let le = self.le_read_buffer_size().await?;
        debug!("Controller LE buffers: {le:?}");
        if le.acl_num_pkts != 0 {
            buf = le;
        }
        if buf.acl_data_len == 0 || buf.acl_num_pkts == 0 {
            return Err(Error::Init("invalid buffer parameters"));
        }

        self.le_read_local_supported_features().await?;
        self.le_read_supported_states().await?;
        let tx_power = self.le_read_advertising_channel_tx_power().await?;

        self.le_set_event_mask(0x0000_0000_0000_001F).await?;
        self.set_event_mask(0x3dbf_f807_fffb_ffff).await?;
        self.write_le_host_support(true, false).await?;
        self.write_class_of_device(0x0004_0204).await?;

        *self.info.lock() = ControllerInfo {
            addr,
            acl_data_len: buf.acl_data_len,
            acl_num_pkts: buf.acl_num_pkts,
            tx_power,
        };
        Ok(())
    }
}

/// Outbound ACL data write sink exported to the L2CAP layer.
#[derive(Clone, Debug)]
pub(crate) struct AclWriter(Arc<dyn host::Transport>);

impl AclWriter {
    /// Writes one complete ACL data packet, including the HCI type tag.
    #[inline]
    pub async fn write(&self, pkt: &[u8]) -> host::Result<()> {
        self.0.send(pkt).await
    }

    /// Creates a writer over a bare transport for protocol tests.
    #[cfg(test)]
    pub(crate) fn testing(t: Arc<dyn host::Transport>) -> Self {
        Self(t)
    }
}

/// Future that resolves when the HCI reader or sender task stops.
#[derive(Debug)]
pub struct EventLoop {
    reader: tokio::task::JoinHandle<Result<()>>,
    sender: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
    _guard: tokio_util::sync::DropGuard,
}

impl EventLoop {
    /// Stops packet processing.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.sender.abort();
        self.reader.await.expect("HCI reader panic")
    }
}

impl Future for EventLoop {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(ready!(Pin::new(&mut self.reader).poll(cx)).expect("HCI reader panic"))
    }
}
