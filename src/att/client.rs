//! ATT client: request/response procedures issued from the central role
//! ([Vol 3] Part F, Section 3.4).

use std::sync::Arc;

use structbuf::{Pack, Packer, StructBuf, Unpacker};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::l2cap::{Conn, CID_ATT, DEFAULT_MTU};
use crate::uuid::Uuid;
use crate::SyncMutex;

use super::*;

/// Sink for handle value notifications and indications received from the
/// remote server. Indications are confirmed automatically after dispatch.
pub trait NotificationSink: Send + Sync {
    fn handle(&self, value_handle: u16, indicate: bool, value: &[u8]);
}

impl<F: Fn(u16, bool, &[u8]) + Send + Sync> NotificationSink for F {
    #[inline]
    fn handle(&self, value_handle: u16, indicate: bool, value: &[u8]) {
        self(value_handle, indicate, value);
    }
}

/// One outstanding request waiting for its response.
struct Pending {
    req: Opcode,
    rsp: Opcode,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

/// ATT client over one LE-U connection. Requests are serialized: at most
/// one is outstanding at a time, with a 30-second transaction timeout.
#[derive(Debug)]
pub struct Client {
    inner: Arc<Inner>,
    serial: tokio::sync::Mutex<()>,
}

struct Inner {
    conn: Arc<Conn>,
    pending: SyncMutex<Option<Pending>>,
    sink: SyncMutex<Option<Arc<dyn NotificationSink>>>,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Client")).field("conn", &self.conn).finish_non_exhaustive()
    }
}

impl Client {
    /// Creates an ATT client for `conn` and spawns its receive loop. The
    /// loop ends when the connection closes.
    #[must_use]
    pub fn new(conn: Arc<Conn>) -> Self {
        let inner = Arc::new(Inner {
            conn,
            pending: SyncMutex::new(None),
            sink: SyncMutex::new(None),
        });
        tokio::spawn(Arc::clone(&inner).recv_loop());
        Self {
            inner,
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Registers the sink receiving notifications and indications.
    pub fn set_notification_sink(&self, sink: impl NotificationSink + 'static) {
        *self.inner.sink.lock() = Some(Arc::new(sink));
    }

    /// Returns the underlying connection.
    #[inline]
    #[must_use]
    pub fn conn(&self) -> &Arc<Conn> {
        &self.inner.conn
    }

    /// Performs MTU exchange ([Vol 3] Part F, Section 3.4.2). Returns the
    /// effective MTU.
    pub async fn exchange_mtu(&self, mtu: u16) -> Result<u16> {
        let mtu = mtu.max(DEFAULT_MTU);
        let rsp = (self.request(Opcode::ExchangeMtuReq, Opcode::ExchangeMtuRsp, |p| {
            p.u16(mtu);
        }))
        .await?;
        let Some(server_mtu) = Unpacker::new(&rsp[1..]).map(Unpacker::u16) else {
            return Err(ErrorRsp {
                req: Opcode::ExchangeMtuReq.into(),
                handle: 0,
                err: ErrorCode::InvalidPdu,
            }
            .into());
        };
        let eff = mtu.min(server_mtu).max(DEFAULT_MTU);
        self.inner.conn.set_tx_mtu(eff);
        self.inner.conn.set_rx_mtu(eff);
        debug!("exchange MTU: client {mtu}, server {server_mtu}, effective {eff}");
        Ok(eff)
    }

    /// `ATT_FIND_INFORMATION_REQ`: returns `(handle, type)` pairs in
    /// `[start, end]` ([Vol 3] Part F, Section 3.4.3.1).
    pub async fn find_information(&self, start: u16, end: u16) -> Result<Vec<(u16, Uuid)>> {
        let rsp = (self.request(Opcode::FindInformationReq, Opcode::FindInformationRsp, |p| {
            p.u16(start).u16(end);
        }))
        .await?;
        let mut p = Unpacker::new(&rsp[1..]);
        let tlen = match p.u8() {
            0x01 => 2,
            0x02 => 16,
            _ => return Err(invalid_rsp(Opcode::FindInformationReq)),
        };
        let mut out = Vec::new();
        while p.len() >= 2 + tlen {
            let handle = p.u16();
            let Some(typ) = p.skip(tlen).and_then(|t| Uuid::from_le_bytes(t.into_inner())) else {
                return Err(invalid_rsp(Opcode::FindInformationReq));
            };
            out.push((handle, typ));
        }
        Ok(out)
    }

    /// `ATT_FIND_BY_TYPE_VALUE_REQ`: returns `(found, group end)` handle
    /// pairs ([Vol 3] Part F, Section 3.4.3.3).
    pub async fn find_by_type_value(
        &self,
        start: u16,
        end: u16,
        typ: u16,
        value: &[u8],
    ) -> Result<Vec<(u16, u16)>> {
        let rsp = (self.request(Opcode::FindByTypeValueReq, Opcode::FindByTypeValueRsp, |p| {
            p.u16(start).u16(end).u16(typ).put(value);
        }))
        .await?;
        let mut p = Unpacker::new(&rsp[1..]);
        let mut out = Vec::new();
        while p.len() >= 4 {
            out.push((p.u16(), p.u16()));
        }
        Ok(out)
    }

    /// `ATT_READ_BY_TYPE_REQ`: returns `(handle, value)` records
    /// ([Vol 3] Part F, Section 3.4.4.1).
    pub async fn read_by_type(
        &self,
        start: u16,
        end: u16,
        typ: Uuid,
    ) -> Result<Vec<(u16, Vec<u8>)>> {
        let rsp = (self.request(Opcode::ReadByTypeReq, Opcode::ReadByTypeRsp, |p| {
            p.u16(start).u16(end);
            typ.pack(p);
        }))
        .await?;
        let mut p = Unpacker::new(&rsp[1..]);
        let dlen = usize::from(p.u8());
        if dlen < 2 {
            return Err(invalid_rsp(Opcode::ReadByTypeReq));
        }
        let mut out = Vec::new();
        while p.len() >= dlen {
            let handle = p.u16();
            let Some(v) = p.skip(dlen - 2) else {
                return Err(invalid_rsp(Opcode::ReadByTypeReq));
            };
            out.push((handle, v.into_inner().to_vec()));
        }
        Ok(out)
    }

    /// `ATT_READ_REQ` ([Vol 3] Part F, Section 3.4.4.3).
    pub async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        let mut rsp = (self.request(Opcode::ReadReq, Opcode::ReadRsp, |p| {
            p.u16(handle);
        }))
        .await?;
        rsp.remove(0);
        Ok(rsp)
    }

    /// `ATT_READ_BLOB_REQ` ([Vol 3] Part F, Section 3.4.4.5).
    pub async fn read_blob(&self, handle: u16, offset: u16) -> Result<Vec<u8>> {
        let mut rsp = (self.request(Opcode::ReadBlobReq, Opcode::ReadBlobRsp, |p| {
            p.u16(handle).u16(offset);
        }))
        .await?;
        rsp.remove(0);
        Ok(rsp)
    }

    /// `ATT_READ_BY_GROUP_TYPE_REQ`: returns `(handle, group end, value)`
    /// records ([Vol 3] Part F, Section 3.4.4.9).
    pub async fn read_by_group_type(
        &self,
        start: u16,
        end: u16,
        typ: Uuid,
    ) -> Result<Vec<(u16, u16, Vec<u8>)>> {
        let rsp = (self.request(Opcode::ReadByGroupTypeReq, Opcode::ReadByGroupTypeRsp, |p| {
            p.u16(start).u16(end);
            typ.pack(p);
        }))
        .await?;
        let mut p = Unpacker::new(&rsp[1..]);
        let dlen = usize::from(p.u8());
        if dlen < 4 {
            return Err(invalid_rsp(Opcode::ReadByGroupTypeReq));
        }
        let mut out = Vec::new();
        while p.len() >= dlen {
            let (handle, group_end) = (p.u16(), p.u16());
            let Some(v) = p.skip(dlen - 4) else {
                return Err(invalid_rsp(Opcode::ReadByGroupTypeReq));
            };
            out.push((handle, group_end, v.into_inner().to_vec()));
        }
        Ok(out)
    }

    /// `ATT_WRITE_REQ` ([Vol 3] Part F, Section 3.4.5.1).
    pub async fn write(&self, handle: u16, value: &[u8]) -> Result<()> {
        (self.request(Opcode::WriteReq, Opcode::WriteRsp, |p| {
            p.u16(handle).put(value);
        }))
        .await
        .map(|_| ())
    }

    /// `ATT_WRITE_CMD` ([Vol 3] Part F, Section 3.4.5.3). No response is
    /// expected.
    pub async fn write_cmd(&self, handle: u16, value: &[u8]) -> Result<()> {
        let mut pdu = StructBuf::new(3 + value.len());
        (pdu.append()).u8(Opcode::WriteCmd).u16(handle).put(value);
        Ok(self.inner.conn.send(CID_ATT, pdu.as_ref()).await?)
    }

    /// Issues one request and waits for its response, holding the
    /// sequential-protocol slot for the duration.
    async fn request(
        &self,
        req: Opcode,
        rsp: Opcode,
        f: impl FnOnce(&mut Packer),
    ) -> Result<Vec<u8>> {
        let _serial = self.serial.lock().await;
        let mut pdu = StructBuf::new(usize::from(self.inner.conn.tx_mtu()));
        f((pdu.append()).u8(req));
        let (tx, rx) = oneshot::channel();
        *self.inner.pending.lock() = Some(Pending { req, rsp, tx });
        trace!("{req}: {:02X?}", pdu.as_ref());
        if let Err(e) = self.inner.conn.send(CID_ATT, pdu.as_ref()).await {
            self.inner.pending.lock().take();
            return Err(e.into());
        }
        match tokio::time::timeout(TRANSACTION_TIMEOUT, rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.inner.pending.lock().take();
                Err(Error::Timeout(req))
            }
        }
    }
}

/// Decodes an error response, falling back to `UnlikelyError` for unknown
/// codes.
fn error_rsp(pdu: &[u8]) -> ErrorRsp {
    let mut p = Unpacker::new(&pdu[1..]);
    ErrorRsp {
        req: p.u8(),
        handle: p.u16(),
        err: ErrorCode::try_from(p.u8()).unwrap_or(ErrorCode::UnlikelyError),
    }
}

fn invalid_rsp(req: Opcode) -> Error {
    ErrorRsp {
        req: req.into(),
        handle: 0,
        err: ErrorCode::InvalidPdu,
    }
    .into()
}

impl Inner {
    /// Receives PDUs until the connection closes, resolving pending
    /// requests and dispatching notifications.
    async fn recv_loop(self: Arc<Self>) {
        loop {
            let pdu = match self.conn.recv().await {
                Ok(pdu) => pdu,
                Err(_) => {
                    // Dropping a pending request resolves it with `Closed`
                    self.pending.lock().take();
                    return;
                }
            };
            self.handle_pdu(pdu.payload()).await;
        }
    }

    async fn handle_pdu(&self, pdu: &[u8]) {
        let Some(&op) = pdu.first() else { return };
        match Opcode::try_from(op) {
            Ok(Opcode::HandleValueNtf) => self.dispatch_notification(pdu, false),
            Ok(Opcode::HandleValueInd) => {
                self.dispatch_notification(pdu, true);
                // Confirm after dispatch
                if let Err(e) = self.conn.send(CID_ATT, &[Opcode::HandleValueCfm.into()]).await {
                    warn!("failed to confirm indication: {e}");
                }
            }
            Ok(Opcode::ExchangeMtuReq) => {
                // Server-initiated exchange: answer with our receive MTU
                let mut rsp = StructBuf::new(3);
                (rsp.append()).u8(Opcode::ExchangeMtuRsp).u16(self.conn.rx_mtu());
                if let Err(e) = self.conn.send(CID_ATT, rsp.as_ref()).await {
                    warn!("failed to answer MTU exchange: {e}");
                }
            }
            Ok(Opcode::ErrorRsp) if pdu.len() == 5 => {
                let e = error_rsp(pdu);
                let mut pending = self.pending.lock();
                match pending.take() {
                    Some(p) if u8::from(p.req) == e.req => {
                        let _ = p.tx.send(Err(e.into()));
                    }
                    other => {
                        warn!("unexpected {e}");
                        *pending = other;
                    }
                }
            }
            Ok(op) => {
                let mut pending = self.pending.lock();
                match pending.take() {
                    Some(p) if p.rsp == op => {
                        let _ = p.tx.send(Ok(pdu.to_vec()));
                    }
                    other => {
                        warn!("unexpected PDU {op}");
                        *pending = other;
                    }
                }
            }
            Err(_) => warn!("unknown opcode {op:#04X}: {pdu:02X?}"),
        }
    }

    fn dispatch_notification(&self, pdu: &[u8], indicate: bool) {
        let mut p = Unpacker::new(&pdu[1..]);
        let handle = p.u16();
        if !p.is_ok() {
            warn!("malformed notification: {pdu:02X?}");
            return;
        }
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.handle(handle, indicate, p.into_inner()),
            None => debug!("dropped notification for {handle:#06X}"),
        }
    }
}
