//! ATT server: sequential request/response processing and the
//! notification/indication path ([Vol 3] Part F, Sections 3.3-3.4).

use std::sync::Arc;

use structbuf::{Pack, StructBuf, Unpacker};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::dev::Addr;
use crate::l2cap::{Conn, CID_ATT, DEFAULT_MTU};
use crate::uuid::Uuid;
use crate::SyncMutex;

use super::*;

/// ATT server for one client connection. The server processes requests in
/// strict receive order and writes exactly one reply per request; write
/// commands and confirmations produce none.
#[derive(Debug)]
pub struct Server {
    conn: Arc<Conn>,
    db: Arc<Db>,
    rx_mtu: u16,
    tx: StructBuf,
    pending_mtu: Option<u16>,
    out: Arc<Outbound>,
}

/// Transmit state shared with notification sessions. The notification and
/// indication buffers are single-slot so an unsolicited transmission never
/// collides with a reply or another indication.
struct Outbound {
    conn: Arc<Conn>,
    ntf: tokio::sync::Mutex<StructBuf>,
    ind: tokio::sync::Mutex<StructBuf>,
    confirm: SyncMutex<Option<oneshot::Sender<()>>>,
}

impl Debug for Outbound {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Outbound")).field("conn", &self.conn).finish_non_exhaustive()
    }
}

/// Per-connection surface handed to attribute handlers and notification
/// sessions.
#[derive(Clone, Debug)]
pub struct Session {
    out: Arc<Outbound>,
}

impl Session {
    /// Returns the remote device address.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> Addr {
        self.out.conn.peer()
    }

    /// Returns an identifier unique among live connections.
    #[inline]
    #[must_use]
    pub fn conn_id(&self) -> u16 {
        self.out.conn.handle().into()
    }

    /// Returns the negotiated TX MTU.
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.out.conn.tx_mtu()
    }

    /// Returns a token that is cancelled when the connection ends.
    #[inline]
    #[must_use]
    pub fn done(&self) -> tokio_util::sync::CancellationToken {
        self.out.conn.done()
    }

    /// Sends a handle value notification, truncating `data` to TX MTU - 3.
    /// Returns the number of value bytes sent.
    #[inline]
    pub async fn notify(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        self.out.notify(handle, data).await
    }

    /// Sends a handle value indication, truncating `data` to TX MTU - 3,
    /// and waits for the client's confirmation. Only one indication may be
    /// in flight at a time; times out after 30 seconds.
    #[inline]
    pub async fn indicate(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        self.out.indicate(handle, data).await
    }
}

impl Outbound {
    /// Replaces the single-slot transmit buffers after an MTU change.
    async fn set_mtu(&self, mtu: u16) {
        *self.ntf.lock().await = StructBuf::new(usize::from(mtu));
        *self.ind.lock().await = StructBuf::new(usize::from(mtu));
    }

    async fn notify(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        if self.conn.is_closed() {
            return Err(Error::Closed);
        }
        let mut buf = self.ntf.lock().await;
        let n = data.len().min(buf.lim() - 3);
        debug!("notifying {handle}: {:02X?}", &data[..n]);
        buf.clear();
        (buf.append())
            .u8(Opcode::HandleValueNtf)
            .u16(u16::from(handle))
            .put(&data[..n]);
        self.conn.send(CID_ATT, buf.as_ref()).await?;
        Ok(n)
    }

    async fn indicate(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        if self.conn.is_closed() {
            return Err(Error::Closed);
        }
        let mut buf = self.ind.lock().await;
        let n = data.len().min(buf.lim() - 3);
        debug!("indicating {handle}: {:02X?}", &data[..n]);
        buf.clear();
        (buf.append())
            .u8(Opcode::HandleValueInd)
            .u16(u16::from(handle))
            .put(&data[..n]);
        // Park the waiter before sending so a fast confirmation is never
        // mistaken for a spurious one.
        let (tx, rx) = oneshot::channel();
        *self.confirm.lock() = Some(tx);
        if let Err(e) = self.conn.send(CID_ATT, buf.as_ref()).await {
            self.confirm.lock().take();
            return Err(e.into());
        }
        match tokio::time::timeout(TRANSACTION_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(n),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.confirm.lock().take();
                Err(Error::Timeout(Opcode::HandleValueInd))
            }
        }
        // The indication slot is released on every path when `buf` drops.
    }

    /// Resumes the indication waiter. Spurious confirmations are dropped.
    fn handle_confirmation(&self) {
        match self.confirm.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => warn!("received a spurious confirmation"),
        }
    }
}

impl Server {
    /// Creates an ATT server for `conn` over database `db`. `rx_mtu` is the
    /// receive buffer size offered in the MTU exchange; only the default
    /// ATT MTU is used until the client requests an exchange.
    #[must_use]
    pub fn new(conn: Arc<Conn>, db: Arc<Db>, rx_mtu: u16) -> Self {
        let mtu = usize::from(DEFAULT_MTU);
        let out = Arc::new(Outbound {
            conn: Arc::clone(&conn),
            ntf: tokio::sync::Mutex::new(StructBuf::new(mtu)),
            ind: tokio::sync::Mutex::new(StructBuf::new(mtu)),
            confirm: SyncMutex::new(None),
        });
        Self {
            conn,
            db,
            rx_mtu: rx_mtu.max(DEFAULT_MTU),
            tx: StructBuf::new(mtu),
            pending_mtu: None,
            out,
        }
    }

    /// Returns the per-connection handler surface.
    #[inline]
    #[must_use]
    pub fn session(&self) -> Session {
        Session {
            out: Arc::clone(&self.out),
        }
    }

    /// Accepts incoming requests until the connection ends. Protocol errors
    /// produce error responses and keep the loop running; only link loss
    /// ends it.
    pub async fn serve(mut self) -> Result<()> {
        loop {
            let pdu = match self.conn.recv().await {
                Ok(pdu) => pdu,
                Err(l2cap::Error::ConnClosed(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            eprintln!("DEBUG req: {:02X?}", pdu.payload());
            if self.handle_pdu(pdu.payload()) {
                trace!("rsp: {:02X?}", self.tx.as_ref());
                let conn = Arc::clone(&self.conn);
                conn.send(CID_ATT, self.tx.as_ref()).await?;
            }
            if let Some(mtu) = self.pending_mtu.take() {
                // Applied after the Exchange MTU response and before any
                // other PDU is sent.
                self.tx = StructBuf::new(usize::from(mtu));
                self.out.set_mtu(mtu).await;
            }
        }
    }

    /// Dispatches one PDU, returning whether `tx` now holds a reply.
    fn handle_pdu(&mut self, pdu: &[u8]) -> bool {
        use Opcode::*;
        let Some(&op) = pdu.first() else {
            warn!("empty PDU");
            return false;
        };
        match Opcode::try_from(op) {
            Ok(ExchangeMtuReq) => self.exchange_mtu(pdu),
            Ok(FindInformationReq) => self.find_information(pdu),
            Ok(FindByTypeValueReq) => self.find_by_type_value(pdu),
            Ok(ReadByTypeReq) => self.read_by_type(pdu),
            Ok(ReadReq) => self.read(pdu),
            Ok(ReadBlobReq) => self.read_blob(pdu),
            Ok(ReadByGroupTypeReq) => self.read_by_group_type(pdu),
            Ok(WriteReq) => self.write(pdu),
            Ok(WriteCmd) => {
                self.write_cmd(pdu);
                false
            }
            Ok(HandleValueCfm) => {
                self.out.handle_confirmation();
                false
            }
            _ => { eprintln!("DEBUG unsupported op {op:#04X}"); self.err(op, 0x0000, ErrorCode::RequestNotSupported) },
        }
    }

    /// Stores an `ATT_ERROR_RSP` in the reply buffer.
    fn err(&mut self, req: u8, handle: u16, err: ErrorCode) -> bool {
        warn!("request {req:#04X} for handle {handle:#06X} failed with {err}");
        self.tx.clear();
        (self.tx.append())
            .u8(Opcode::ErrorRsp)
            .u8(req)
            .u16(handle)
            .u8(err);
        true
    }

    /// Handles `ATT_EXCHANGE_MTU_REQ` ([Vol 3] Part F, Section 3.4.2.1).
    fn exchange_mtu(&mut self, pdu: &[u8]) -> bool {
        let op = Opcode::ExchangeMtuReq;
        if pdu.len() != 3 {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        }
        let client_mtu = Unpacker::new(&pdu[1..]).u16();
        if client_mtu < DEFAULT_MTU {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        }
        debug!("exchange MTU: client {client_mtu}, server {}", self.rx_mtu);
        self.conn.set_tx_mtu(client_mtu);
        self.conn.set_rx_mtu(self.rx_mtu);
        if usize::from(client_mtu) != self.tx.lim() {
            // Applied after this response is sent
            self.pending_mtu = Some(client_mtu);
        }
        self.tx.clear();
        (self.tx.append()).u8(Opcode::ExchangeMtuRsp).u16(self.rx_mtu);
        true
    }

    /// Handles `ATT_FIND_INFORMATION_REQ`
    /// ([Vol 3] Part F, Sections 3.4.3.1 and 3.4.3.2).
    fn find_information(&mut self, pdu: &[u8]) -> bool {
        let op = Opcode::FindInformationReq;
        if pdu.len() != 5 {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        }
        let mut p = Unpacker::new(&pdu[1..]);
        let (start, end) = (p.u16(), p.u16());
        if start == 0 || start > end {
            return self.err(op.into(), start, ErrorCode::InvalidHandle);
        }

        let db = Arc::clone(&self.db);
        self.tx.clear();
        (self.tx.append()).u8(Opcode::FindInformationRsp).u8(0u8);
        // Every response carries types of one format
        let mut format = 0u8;
        for at in db.subrange(start, end) {
            let tlen = at.typ().len();
            if format == 0 {
                format = if tlen == 2 { 0x01 } else { 0x02 };
            }
            if (format == 0x01 && tlen != 2) || (format == 0x02 && tlen != 16) {
                break;
            }
            if self.tx.remaining() < 2 + tlen {
                break;
            }
            let mut p = self.tx.append();
            p.u16(at.handle_u16());
            at.typ().pack(&mut p);
        }
        if format == 0 {
            return self.err(op.into(), start, ErrorCode::AttributeNotFound);
        }
        self.tx.at(1).u8(format);
        true
    }

    /// Handles `ATT_FIND_BY_TYPE_VALUE_REQ`
    /// ([Vol 3] Part F, Sections 3.4.3.3 and 3.4.3.4).
    fn find_by_type_value(&mut self, pdu: &[u8]) -> bool {
        let op = Opcode::FindByTypeValueReq;
        let mut p = Unpacker::new(&pdu[1..]);
        let (start, end, typ) = (p.u16(), p.u16(), p.u16());
        if !p.is_ok() {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        }
        if start == 0 || start > end {
            return self.err(op.into(), start, ErrorCode::InvalidHandle);
        }
        let (typ, want) = (Uuid::u16(typ), p.into_inner());

        let (db, session, mtu) = self.tx_context();
        self.tx.clear();
        (self.tx.append()).u8(Opcode::FindByTypeValueRsp);
        let mut found = false;
        for at in db.subrange(start, end) {
            if at.typ() != typ {
                continue;
            }
            let mut dynamic;
            let (value, group_end): (&[u8], u16) = if let Some(v) = at.value() {
                (v, at.end_u16())
            } else {
                let Some(h) = at.handler() else { continue };
                // One extra byte so a value too long for any response is
                // detected rather than silently truncated
                dynamic = ResponseWriter::new(mtu - 7 + 1);
                let req = Request::new(op, at.handle(), &[], 0);
                let e = h.handle(&session, &req, &mut dynamic);
                if e != ErrorCode::Success {
                    return self.err(op.into(), start, e);
                }
                if dynamic.len() > mtu - 7 {
                    return self.err(op.into(), start, ErrorCode::UnlikelyError);
                }
                (dynamic.as_ref(), at.handle_u16())
            };
            if value != want {
                continue;
            }
            if self.tx.remaining() < 4 {
                break;
            }
            (self.tx.append()).u16(at.handle_u16()).u16(group_end);
            found = true;
        }
        if !found {
            return self.err(op.into(), start, ErrorCode::AttributeNotFound);
        }
        true
    }

    /// Handles `ATT_READ_BY_TYPE_REQ`
    /// ([Vol 3] Part F, Sections 3.4.4.1 and 3.4.4.2).
    fn read_by_type(&mut self, pdu: &[u8]) -> bool {
        let op = Opcode::ReadByTypeReq;
        let mut p = Unpacker::new(&pdu[1..]);
        let (start, end) = (p.u16(), p.u16());
        let Some(typ) = Uuid::from_le_bytes(p.into_inner()) else {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        };
        if !p.is_ok() {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        }
        if start == 0 || start > end {
            return self.err(op.into(), start, ErrorCode::InvalidHandle);
        }

        let (db, session, mtu) = self.tx_context();
        self.tx.clear();
        (self.tx.append()).u8(Opcode::ReadByTypeRsp).u8(0u8);
        // Handle (2 bytes) plus value; every record has the length of the
        // first one, capped at 255 and at the space after the header
        let mut dlen = 0usize;
        for at in db.subrange(start, end) {
            if at.typ() != typ {
                continue;
            }
            let mut dynamic;
            let value: &[u8] = if let Some(v) = at.value() {
                v
            } else {
                let Some(h) = at.handler() else { continue };
                dynamic = ResponseWriter::new(mtu - 2);
                let req = Request::new(op, at.handle(), &[], 0);
                let e = h.handle(&session, &req, &mut dynamic);
                if e != ErrorCode::Success {
                    // The first failure is the reply; later ones end the list
                    if dlen == 0 {
                        return self.err(op.into(), start, e);
                    }
                    break;
                }
                dynamic.as_ref()
            };
            if dlen == 0 {
                dlen = (2 + value.len()).min(255).min(mtu - 2);
                #[allow(clippy::cast_possible_truncation)]
                self.tx.at(1).u8(dlen as u8);
            } else if 2 + value.len() != dlen {
                break;
            }
            if self.tx.remaining() < dlen {
                break;
            }
            (self.tx.append()).u16(at.handle_u16()).put(&value[..dlen - 2]);
        }
        if dlen == 0 {
            return self.err(op.into(), start, ErrorCode::AttributeNotFound);
        }
        true
    }

    /// Handles `ATT_READ_REQ`
    /// ([Vol 3] Part F, Sections 3.4.4.3 and 3.4.4.4).
    fn read(&mut self, pdu: &[u8]) -> bool {
        let op = Opcode::ReadReq;
        let Some(handle) = Unpacker::new(&pdu[1..]).map(Unpacker::u16) else {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        };
        self.read_value(op, handle, 0)
    }

    /// Handles `ATT_READ_BLOB_REQ`
    /// ([Vol 3] Part F, Sections 3.4.4.5 and 3.4.4.6).
    fn read_blob(&mut self, pdu: &[u8]) -> bool {
        let op = Opcode::ReadBlobReq;
        let Some((handle, offset)) = Unpacker::new(&pdu[1..]).map(|p| (p.u16(), p.u16())) else {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        };
        self.read_value(op, handle, offset)
    }

    /// Shared read path: a static value is returned verbatim, a dynamic
    /// handler's output is truncated to MTU - 1.
    fn read_value(&mut self, op: Opcode, handle: u16, offset: u16) -> bool {
        let (db, session, mtu) = self.tx_context();
        let Some(at) = db.at(handle) else {
            return self.err(op.into(), handle, ErrorCode::InvalidHandle);
        };
        let rsp = match op {
            Opcode::ReadReq => Opcode::ReadRsp,
            _ => Opcode::ReadBlobRsp,
        };
        self.tx.clear();
        (self.tx.append()).u8(rsp);
        if let Some(v) = at.value() {
            (self.tx.append()).put(&v[..v.len().min(mtu - 1)]);
            return true;
        }
        let Some(h) = at.handler() else {
            return self.err(op.into(), handle, ErrorCode::ReadNotPermitted);
        };
        let mut w = ResponseWriter::new(mtu - 1);
        let req = Request::new(op, at.handle(), &[], offset);
        let e = h.handle(&session, &req, &mut w);
        if e != ErrorCode::Success {
            return self.err(op.into(), handle, e);
        }
        (self.tx.append()).put(w.as_ref());
        true
    }

    /// Handles `ATT_READ_BY_GROUP_TYPE_REQ`
    /// ([Vol 3] Part F, Sections 3.4.4.9 and 3.4.4.10).
    fn read_by_group_type(&mut self, pdu: &[u8]) -> bool {
        let op = Opcode::ReadByGroupTypeReq;
        let mut p = Unpacker::new(&pdu[1..]);
        let (start, end) = (p.u16(), p.u16());
        let Some(typ) = Uuid::from_le_bytes(p.into_inner()) else {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        };
        if !p.is_ok() {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        }
        if start == 0 || start > end {
            return self.err(op.into(), start, ErrorCode::InvalidHandle);
        }

        let (db, session, mtu) = self.tx_context();
        self.tx.clear();
        (self.tx.append()).u8(Opcode::ReadByGroupTypeRsp).u8(0u8);
        let mut dlen = 0usize;
        for at in db.subrange(start, end) {
            if at.typ() != typ {
                continue;
            }
            let mut dynamic;
            let value: &[u8] = if let Some(v) = at.value() {
                v
            } else {
                let Some(h) = at.handler() else { continue };
                dynamic = ResponseWriter::new(mtu - 6);
                let req = Request::new(op, at.handle(), &[], 0);
                let e = h.handle(&session, &req, &mut dynamic);
                if e != ErrorCode::Success {
                    if dlen == 0 {
                        return self.err(op.into(), start, e);
                    }
                    break;
                }
                dynamic.as_ref()
            };
            if dlen == 0 {
                dlen = (4 + value.len()).min(255).min(mtu - 2);
                #[allow(clippy::cast_possible_truncation)]
                self.tx.at(1).u8(dlen as u8);
            } else if 4 + value.len() != dlen {
                break;
            }
            if self.tx.remaining() < dlen {
                break;
            }
            (self.tx.append())
                .u16(at.handle_u16())
                .u16(at.end_u16())
                .put(&value[..dlen - 4]);
        }
        if dlen == 0 {
            return self.err(op.into(), start, ErrorCode::AttributeNotFound);
        }
        true
    }

    /// Handles `ATT_WRITE_REQ`
    /// ([Vol 3] Part F, Sections 3.4.5.1 and 3.4.5.2).
    fn write(&mut self, pdu: &[u8]) -> bool {
        let op = Opcode::WriteReq;
        let mut p = Unpacker::new(&pdu[1..]);
        let handle = p.u16();
        if !p.is_ok() {
            return self.err(op.into(), 0x0000, ErrorCode::InvalidPdu);
        }
        let value = p.into_inner();

        let (db, session, _) = self.tx_context();
        let Some(at) = db.at(handle) else {
            return self.err(op.into(), handle, ErrorCode::InvalidHandle);
        };
        // Static values are not writable
        let Some(h) = at.handler() else {
            return self.err(op.into(), handle, ErrorCode::WriteNotPermitted);
        };
        let req = Request::new(op, at.handle(), value, 0);
        let e = h.handle(&session, &req, &mut ResponseWriter::new(0));
        if e != ErrorCode::Success {
            return self.err(op.into(), handle, e);
        }
        self.tx.clear();
        (self.tx.append()).u8(Opcode::WriteRsp);
        true
    }

    /// Handles `ATT_WRITE_CMD` ([Vol 3] Part F, Section 3.4.5.3). Errors are
    /// silently dropped.
    fn write_cmd(&mut self, pdu: &[u8]) {
        if pdu.len() <= 3 {
            return;
        }
        let mut p = Unpacker::new(&pdu[1..]);
        let handle = p.u16();
        let value = p.into_inner();
        let (db, session, _) = self.tx_context();
        let Some(at) = db.at(handle) else { return };
        let Some(h) = at.handler() else { return };
        let req = Request::new(Opcode::WriteCmd, at.handle(), value, 0);
        h.handle(&session, &req, &mut ResponseWriter::new(0));
    }

    /// Returns the shared pieces every opcode handler needs.
    fn tx_context(&self) -> (Arc<Db>, Session, usize) {
        (
            Arc::clone(&self.db),
            self.session(),
            usize::from(self.conn.tx_mtu()),
        )
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use crate::l2cap::testing::{att_pdu, conn};

    use super::*;

    struct Echo(Vec<u8>);

    impl Handler for Echo {
        fn handle(
            &self,
            _: &Session,
            req: &Request<'_>,
            rsp: &mut ResponseWriter,
        ) -> ErrorCode {
            if req.opcode().access() == Some(Access::Read) {
                rsp.write(&self.0);
            }
            ErrorCode::Success
        }
    }

    fn db() -> Arc<Db> {
        let mut b = Db::build();
        b.value(Uuid::u16(0x2A00), *b"static-value-longer-than-default-mtu");
        b.handler(Uuid::u16(0x2A01), Arc::new(Echo(vec![0xAA; 4])));
        Arc::new(b.freeze())
    }

    /// Spawns a server and returns channels for driving it with raw ATT
    /// PDUs and reading its replies.
    fn serve() -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>, Session) {
        let (cn, in_tx, out_rx) = conn(251, 4);
        let srv = Server::new(cn, db(), 1024);
        let session = srv.session();
        tokio::spawn(srv.serve());
        (in_tx, out_rx, session)
    }

    /// Extracts the ATT payload from one outbound HCI ACL packet.
    fn att_payload(pkt: &[u8]) -> &[u8] {
        assert_eq!(pkt[0], crate::hci::PKT_ACL_DATA);
        &pkt[1 + crate::hci::ACL_HDR + crate::l2cap::L2CAP_HDR..]
    }

    #[tokio::test]
    async fn one_response_per_request() {
        let (tx, mut rx, _) = serve();
        // Read of the dynamic attribute
        tx.send(att_pdu(&[0x0A, 0x02, 0x00])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt), [0x0B, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[tokio::test]
    async fn static_read_truncates_to_mtu() {
        let (tx, mut rx, _) = serve();
        tx.send(att_pdu(&[0x0A, 0x01, 0x00])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        let payload = att_payload(&pkt).to_vec();
        assert_eq!(payload[0], 0x0B);
        // Default MTU caps the value at 22 bytes
        assert_eq!(&payload[1..], &b"static-value-longer-than-default-mtu"[..22]);
    }

    #[tokio::test]
    async fn invalid_pdu_length() {
        let (tx, mut rx, _) = serve();
        // Exchange MTU with a missing byte, then with a trailing one
        tx.send(att_pdu(&[0x02, 0x64])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt), [0x01, 0x02, 0x00, 0x00, 0x04]);
        tx.send(att_pdu(&[0x02, 0x64, 0x00, 0xFF])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt), [0x01, 0x02, 0x00, 0x00, 0x04]);
        // Find Information must be exactly 5 bytes
        tx.send(att_pdu(&[0x04, 0x01, 0x00, 0xFF, 0xFF, 0x00])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt), [0x01, 0x04, 0x00, 0x00, 0x04]);
    }

    #[tokio::test]
    async fn exchange_mtu_is_idempotent() {
        let (tx, mut rx, _) = serve();
        for _ in 0..2 {
            tx.send(att_pdu(&[0x02, 0x64, 0x00])).await.unwrap();
            let pkt = rx.recv().await.unwrap();
            assert_eq!(att_payload(&pkt), [0x03, 0x00, 0x04]);
        }
        // TX MTU is now 100: the static value is no longer truncated
        tx.send(att_pdu(&[0x0A, 0x01, 0x00])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(&att_payload(&pkt)[1..], b"static-value-longer-than-default-mtu");
    }

    #[tokio::test]
    async fn write_to_static_not_permitted() {
        let (tx, mut rx, _) = serve();
        tx.send(att_pdu(&[0x12, 0x01, 0x00, 0x00])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt), [0x01, 0x12, 0x01, 0x00, 0x03]);
    }

    #[tokio::test]
    async fn find_information_formats() {
        let (tx, mut rx, _) = serve();
        tx.send(att_pdu(&[0x04, 0x01, 0x00, 0xFF, 0xFF])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(
            att_payload(&pkt),
            [0x05, 0x01, 0x01, 0x00, 0x00, 0x2A, 0x02, 0x00, 0x01, 0x2A]
        );
        // Empty range
        tx.send(att_pdu(&[0x04, 0x03, 0x00, 0xFF, 0xFF])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt), [0x01, 0x04, 0x03, 0x00, 0x0A]);
    }

    #[tokio::test]
    async fn unsupported_requests() {
        let (tx, mut rx, _) = serve();
        for op in [0x0E, 0x16, 0x18, 0xD2, 0x7F] {
            tx.send(att_pdu(&[op, 0x01, 0x00])).await.unwrap();
            let pkt = rx.recv().await.unwrap();
            assert_eq!(att_payload(&pkt), [0x01, op, 0x00, 0x00, 0x06]);
        }
    }

    #[tokio::test]
    async fn spurious_confirmation_is_dropped() {
        let (tx, mut rx, _) = serve();
        tx.send(att_pdu(&[0x1E])).await.unwrap();
        // No reply; the next request is still answered
        tx.send(att_pdu(&[0x0A, 0x02, 0x00])).await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt)[0], 0x0B);
    }

    #[tokio::test(start_paused = true)]
    async fn indication_timeout_releases_slot() {
        let (tx, mut rx, session) = serve();
        let r = session.indicate(Handle::new(2).unwrap(), b"x").await;
        assert!(matches!(r, Err(Error::Timeout(Opcode::HandleValueInd))));
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt), [0x1D, 0x02, 0x00, b'x']);
        // The slot is free: a confirmed indication now succeeds
        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.indicate(Handle::new(2).unwrap(), b"y").await }
        });
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt), [0x1D, 0x02, 0x00, b'y']);
        tx.send(att_pdu(&[0x1E])).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn notification_truncates_to_mtu() {
        let (_tx, mut rx, session) = serve();
        let n = (session.notify(Handle::new(2).unwrap(), &[0x55; 64]).await).unwrap();
        assert_eq!(n, 20); // Default MTU - 3
        let pkt = rx.recv().await.unwrap();
        assert_eq!(att_payload(&pkt).len(), 23);
    }
}
