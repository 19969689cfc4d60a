//! HCI event routing and parameter decoding ([Vol 4] Part E, Section 7.7).

use std::collections::HashMap;

use structbuf::Unpacker;

use crate::dev::Addr;

use super::*;

/// HCI event code.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum EventCode {
    DisconnectionComplete = 0x05,
    EncryptionChange = 0x08,
    ReadRemoteVersionInformationComplete = 0x0C,
    CommandComplete = 0x0E,
    CommandStatus = 0x0F,
    HardwareError = 0x10,
    NumberOfCompletedPackets = 0x13,
    DataBufferOverflow = 0x1A,
    EncryptionKeyRefreshComplete = 0x30,
    LeMeta = 0x3E,
    AuthenticatedPayloadTimeoutExpired = 0x57,
}

/// LE meta event subevent code ([Vol 4] Part E, Section 7.7.65).
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum SubeventCode {
    LeConnectionComplete = 0x01,
    LeAdvertisingReport = 0x02,
    LeConnectionUpdateComplete = 0x03,
    LeReadRemoteFeaturesComplete = 0x04,
    LeLongTermKeyRequest = 0x05,
    LeRemoteConnectionParameterRequest = 0x06,
}

/// Handler for HCI event or LE meta subevent parameters. Handlers run on
/// the transport reader task and must not block; work that waits is spawned.
pub trait EventHandler: Send + Sync {
    /// Handles the event parameters, excluding the event header and, for
    /// subevents, the subevent code.
    fn handle(&self, params: &[u8]);
}

impl<F: Fn(&[u8]) + Send + Sync> EventHandler for F {
    #[inline]
    fn handle(&self, params: &[u8]) {
        self(params);
    }
}

/// Two-level `{code -> handler}` event router.
#[derive(Default)]
pub(super) struct Router {
    evt: SyncMutex<HashMap<u8, Arc<dyn EventHandler>>>,
    sub: SyncMutex<HashMap<u8, Arc<dyn EventHandler>>>,
}

impl Debug for Router {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Router"))
            .field("evt", &self.evt.lock().keys())
            .field("sub", &self.sub.lock().keys())
            .finish()
    }
}

impl Router {
    pub fn set_event_handler(
        &self,
        code: EventCode,
        h: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        self.evt.lock().insert(code.into(), h)
    }

    pub fn set_subevent_handler(
        &self,
        code: SubeventCode,
        h: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        self.sub.lock().insert(code.into(), h)
    }

    /// Routes one event to its registered handler. Unknown codes are logged
    /// and never fatal.
    pub fn dispatch_event(&self, code: u8, params: &[u8]) {
        let h = self.evt.lock().get(&code).cloned();
        match h {
            Some(h) => h.handle(params),
            None => debug!("unhandled event {code:#04X}: {params:02X?}"),
        }
    }

    /// Routes one LE meta subevent to its registered handler.
    pub fn dispatch_subevent(&self, code: u8, params: &[u8]) {
        let h = self.sub.lock().get(&code).cloned();
        match h {
            Some(h) => h.handle(params),
            None => debug!("unhandled LE subevent {code:#04X}: {params:02X?}"),
        }
    }
}

/// Local role within a connection.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Central,
    Peripheral,
}

/// `HCI_Disconnection_Complete` parameters
/// ([Vol 4] Part E, Section 7.7.5).
#[derive(Clone, Copy, Debug)]
pub struct DisconnectionComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub reason: u8,
}

impl DisconnectionComplete {
    #[must_use]
    pub fn unpack(params: &[u8]) -> Option<Self> {
        let mut p = Unpacker::new(params);
        let v = Self {
            status: Status::from(p.u8()),
            handle: ConnHandle::new(p.u16()),
            reason: p.u8(),
        };
        p.is_ok().then_some(v)
    }
}

/// `HCI_Number_Of_Completed_Packets` parameters
/// ([Vol 4] Part E, Section 7.7.19).
#[derive(Clone, Debug)]
pub struct NumberOfCompletedPackets {
    /// `(connection handle, completed packet count)` pairs.
    pub entries: Vec<(ConnHandle, u16)>,
}

impl NumberOfCompletedPackets {
    #[must_use]
    pub fn unpack(params: &[u8]) -> Option<Self> {
        let mut p = Unpacker::new(params);
        let n = usize::from(p.u8());
        let mut handles = p.skip(2 * n)?;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            entries.push((ConnHandle::new(handles.u16()), p.u16()));
        }
        (p.is_ok() && handles.is_ok()).then_some(Self { entries })
    }
}

/// `HCI_LE_Connection_Complete` subevent parameters
/// ([Vol 4] Part E, Section 7.7.65.1).
#[derive(Clone, Copy, Debug)]
pub struct LeConnectionComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub role: Role,
    pub peer_addr: Addr,
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    /// Peripheral latency in connection events.
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub supervision_timeout: u16,
}

impl LeConnectionComplete {
    #[must_use]
    pub fn unpack(params: &[u8]) -> Option<Self> {
        let mut p = Unpacker::new(params);
        let status = Status::from(p.u8());
        let handle = ConnHandle::new(p.u16());
        let role = match p.u8() {
            0x00 => Role::Central,
            _ => Role::Peripheral,
        };
        let addr_type = p.u8();
        let raw: [u8; 6] = p.skip(6)?.into_inner().try_into().ok()?;
        let v = Self {
            status,
            handle,
            role,
            peer_addr: Addr::peer(addr_type, raw.into()),
            interval: p.u16(),
            latency: p.u16(),
            supervision_timeout: p.u16(),
        };
        let _ = p.skip(1)?; // Central clock accuracy
        p.is_ok().then_some(v)
    }
}

/// `HCI_LE_Connection_Update_Complete` subevent parameters
/// ([Vol 4] Part E, Section 7.7.65.3).
#[derive(Clone, Copy, Debug)]
pub struct LeConnectionUpdateComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

impl LeConnectionUpdateComplete {
    #[must_use]
    pub fn unpack(params: &[u8]) -> Option<Self> {
        let mut p = Unpacker::new(params);
        let v = Self {
            status: Status::from(p.u8()),
            handle: ConnHandle::new(p.u16()),
            interval: p.u16(),
            latency: p.u16(),
            supervision_timeout: p.u16(),
        };
        p.is_ok().then_some(v)
    }
}

/// `HCI_LE_Long_Term_Key_Request` subevent parameters
/// ([Vol 4] Part E, Section 7.7.65.5).
#[derive(Clone, Copy, Debug)]
pub struct LeLongTermKeyRequest {
    pub handle: ConnHandle,
    pub rand: u64,
    pub ediv: u16,
}

impl LeLongTermKeyRequest {
    #[must_use]
    pub fn unpack(params: &[u8]) -> Option<Self> {
        let mut p = Unpacker::new(params);
        let v = Self {
            handle: ConnHandle::new(p.u16()),
            rand: p.u64(),
            ediv: p.u16(),
        };
        p.is_ok().then_some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_connection_complete() {
        let params = [
            0x00, // Status
            0x40, 0x00, // Handle
            0x01, // Role: peripheral
            0x00, // Peer address type: public
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // Peer address
            0x28, 0x00, // Interval
            0x00, 0x00, // Latency
            0xC8, 0x00, // Supervision timeout
            0x00, // Central clock accuracy
        ];
        let e = LeConnectionComplete::unpack(&params).unwrap();
        assert!(e.status.is_ok());
        assert_eq!(u16::from(e.handle), 0x0040);
        assert_eq!(e.role, Role::Peripheral);
        assert_eq!(e.peer_addr.raw().as_le_bytes(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(e.interval, 0x0028);
        assert_eq!(e.supervision_timeout, 0x00C8);
        assert!(LeConnectionComplete::unpack(&params[..10]).is_none());
    }

    #[test]
    fn number_of_completed_packets() {
        let params = [0x02, 0x40, 0x00, 0x41, 0x00, 0x03, 0x00, 0x01, 0x00];
        let e = NumberOfCompletedPackets::unpack(&params).unwrap();
        assert_eq!(
            e.entries,
            vec![(ConnHandle::new(0x40), 3), (ConnHandle::new(0x41), 1)]
        );
    }
}
