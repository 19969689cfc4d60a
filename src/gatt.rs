//! Generic Attribute Profile ([Vol 3] Part G): the service tree, the
//! application handler model, and value-change notification sessions.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bitflags::bitflags;
use tokio_util::sync::CancellationToken;

pub use {client::*, server::*};

use crate::att::{self, Handle, Session};
use crate::dev::Addr;
use crate::uuid::Uuid;

mod client;
mod server;

/// Error type returned by the GATT layer.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Att(#[from] att::Error),
    #[error("characteristic has no client characteristic configuration descriptor")]
    NoCccd,
}

impl From<crate::l2cap::Error> for Error {
    #[inline]
    fn from(e: crate::l2cap::Error) -> Self {
        Self::Att(e.into())
    }
}

impl From<crate::hci::Error> for Error {
    #[inline]
    fn from(e: crate::hci::Error) -> Self {
        Self::Att(att::Error::L2cap(e.into()))
    }
}

/// Common GATT result type.
pub type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// Characteristic property flags ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Prop: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_NO_RSP = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const SIGNED_WRITE = 0x40;
        const EXTENDED = 0x80;
    }
}

/// A GATT service: a named group of characteristics.
#[derive(Debug)]
pub struct Service {
    pub(crate) uuid: Uuid,
    pub(crate) characteristics: Vec<Characteristic>,
}

impl Service {
    /// Creates an empty service.
    #[must_use]
    pub fn new(uuid: impl Into<Uuid>) -> Self {
        Self {
            uuid: uuid.into(),
            characteristics: Vec::new(),
        }
    }

    /// Returns the service UUID.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Adds a characteristic to the service and returns it for
    /// configuration.
    pub fn add_characteristic(&mut self, uuid: impl Into<Uuid>) -> &mut Characteristic {
        self.characteristics.push(Characteristic {
            uuid: uuid.into(),
            props: Prop::empty(),
            value: None,
            handlers: Handlers::default(),
            descriptors: Vec::new(),
        });
        self.characteristics.last_mut().expect("just pushed")
    }
}

/// Handlers recorded per capability. One registration may serve several
/// capabilities.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub read: Option<Arc<dyn Handler>>,
    pub write: Option<Arc<dyn Handler>>,
    pub write_no_rsp: Option<Arc<dyn Handler>>,
    pub notify: Option<Arc<dyn Handler>>,
    pub indicate: Option<Arc<dyn Handler>>,
}

impl Handlers {
    fn record(&mut self, props: Prop, h: &Arc<dyn Handler>) {
        for (bit, slot) in [
            (Prop::READ, &mut self.read),
            (Prop::WRITE, &mut self.write),
            (Prop::WRITE_NO_RSP, &mut self.write_no_rsp),
            (Prop::NOTIFY, &mut self.notify),
            (Prop::INDICATE, &mut self.indicate),
        ] {
            if props.contains(bit) {
                *slot = Some(Arc::clone(h));
            }
        }
    }
}

impl Debug for Handlers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Handlers"))
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("write_no_rsp", &self.write_no_rsp.is_some())
            .field("notify", &self.notify.is_some())
            .field("indicate", &self.indicate.is_some())
            .finish()
    }
}

/// A GATT characteristic: one value attribute plus optional descriptors.
#[derive(Debug)]
pub struct Characteristic {
    pub(crate) uuid: Uuid,
    pub(crate) props: Prop,
    pub(crate) value: Option<Box<[u8]>>,
    pub(crate) handlers: Handlers,
    pub(crate) descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Registers `h` for every capability named in `props`, enabling those
    /// properties.
    pub fn handle(&mut self, props: Prop, h: impl Handler + 'static) -> &mut Self {
        let h: Arc<dyn Handler> = Arc::new(h);
        self.props |= props;
        self.handlers.record(props, &h);
        self
    }

    /// Installs a static read-only value.
    pub fn set_value(&mut self, v: impl Into<Box<[u8]>>) -> &mut Self {
        self.props |= Prop::READ;
        self.value = Some(v.into());
        self
    }

    /// Adds a descriptor and returns it for configuration.
    pub fn add_descriptor(&mut self, uuid: impl Into<Uuid>) -> &mut Descriptor {
        self.descriptors.push(Descriptor {
            uuid: uuid.into(),
            props: Prop::empty(),
            value: None,
            handlers: Handlers::default(),
        });
        self.descriptors.last_mut().expect("just pushed")
    }
}

/// A GATT descriptor.
#[derive(Debug)]
pub struct Descriptor {
    pub(crate) uuid: Uuid,
    pub(crate) props: Prop,
    pub(crate) value: Option<Box<[u8]>>,
    pub(crate) handlers: Handlers,
}

impl Descriptor {
    /// Registers `h` for the read/write capabilities named in `props`.
    ///
    /// # Panics
    ///
    /// Panics if `props` names a capability a descriptor cannot have.
    pub fn handle(&mut self, props: Prop, h: impl Handler + 'static) -> &mut Self {
        assert!(
            !props.intersects(!(Prop::READ | Prop::WRITE | Prop::WRITE_NO_RSP)),
            "invalid descriptor property"
        );
        let h: Arc<dyn Handler> = Arc::new(h);
        self.props |= props;
        self.handlers.record(props, &h);
        self
    }

    /// Installs a static read-only value.
    pub fn set_value(&mut self, v: impl Into<Box<[u8]>>) -> &mut Self {
        self.props |= Prop::READ;
        self.value = Some(v.into());
        self
    }
}

/// Application handler for characteristic and descriptor access. Handlers
/// run on the connection's ATT loop and must not block; producers that wait
/// take the [`Notifier`] and move it into their own task.
pub trait Handler: Send + Sync {
    fn serve(&self, req: &mut Request<'_>, rsp: &mut ResponseWriter<'_>);
}

impl<F: Fn(&mut Request<'_>, &mut ResponseWriter<'_>) + Send + Sync> Handler for F {
    #[inline]
    fn serve(&self, req: &mut Request<'_>, rsp: &mut ResponseWriter<'_>) {
        self(req, rsp);
    }
}

/// Context for one request from a connected central.
#[derive(Debug)]
pub struct Request<'a> {
    pub(crate) peer: Addr,
    pub(crate) conn_id: u16,
    pub(crate) mtu: u16,
    pub(crate) data: &'a [u8],
    pub(crate) offset: u16,
    pub(crate) notifier: Option<Notifier>,
}

impl<'a> Request<'a> {
    /// Returns the central's device address.
    #[inline]
    #[must_use]
    pub const fn peer(&self) -> Addr {
        self.peer
    }

    /// Returns an identifier unique among connected centrals.
    #[inline]
    #[must_use]
    pub const fn conn_id(&self) -> u16 {
        self.conn_id
    }

    /// Returns the negotiated TX MTU.
    #[inline]
    #[must_use]
    pub const fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Returns the value being written. Empty for reads.
    #[inline]
    #[must_use]
    pub const fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the value offset of a read blob request.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u16 {
        self.offset
    }

    /// Takes the notifier of a subscription request. Present only when the
    /// handler is invoked for a rising notify or indicate edge.
    #[inline]
    pub fn take_notifier(&mut self) -> Option<Notifier> {
        self.notifier.take()
    }
}

/// Reply writer handed to application handlers.
#[derive(Debug)]
pub struct ResponseWriter<'a> {
    pub(crate) w: &'a mut att::ResponseWriter,
    pub(crate) status: att::ErrorCode,
}

impl ResponseWriter<'_> {
    /// Appends value bytes, truncating at the reply capacity. Returns the
    /// number of bytes accepted.
    #[inline]
    pub fn write(&mut self, v: &[u8]) -> usize {
        self.w.write(v)
    }

    /// Reports the result of the request.
    #[inline]
    pub fn set_status(&mut self, status: att::ErrorCode) {
        self.status = status;
    }
}

/// Sends value-change notifications or indications for one characteristic
/// to one subscribed central.
#[derive(Clone, Debug)]
pub struct Notifier {
    pub(crate) session: Session,
    pub(crate) value_handle: Handle,
    pub(crate) indicate: bool,
    pub(crate) stop: CancellationToken,
}

impl Notifier {
    /// Sends `data` as a notification or indication for the subscribed
    /// characteristic, truncated to [`Self::capacity`]. For indications,
    /// returns after the central confirms.
    pub async fn write(&self, data: &[u8]) -> att::Result<usize> {
        if self.is_done() {
            return Err(att::Error::Closed);
        }
        if self.indicate {
            self.session.indicate(self.value_handle, data).await
        } else {
            self.session.notify(self.value_handle, data).await
        }
    }

    /// Returns whether the central unsubscribed or disconnected.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Returns when the subscription ends. This method is cancel safe.
    #[inline]
    pub async fn closed(&self) {
        self.stop.cancelled().await;
    }

    /// Returns the most value bytes one transmission can carry
    /// (TX MTU - 3).
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        usize::from(self.session.mtu()) - 3
    }
}
