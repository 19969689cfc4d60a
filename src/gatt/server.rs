//! GATT server: translation of the service tree into the attribute
//! database, the CCCD subscription machinery, and the accept loop
//! ([Vol 3] Part G, Sections 3-4).

use std::collections::HashMap;

use structbuf::{Pack, StructBuf};
use tracing::debug;

use crate::hci::Hci;
use crate::l2cap::LeL2cap;
use crate::SyncMutex;

use super::*;

/// Receive buffer size offered to each central in the MTU exchange.
const SERVER_RX_MTU: u16 = 1024;

/// Advertising interval in 0.625 ms units.
const ADV_INTERVAL: u16 = 0x0800;

/// CCCD subscription bits ([Vol 3] Part G, Section 3.3.3.3).
const NOTIFY_BIT: u16 = 0x0001;
const INDICATE_BIT: u16 = 0x0002;

/// GATT server: a service tree published to every connecting central.
#[derive(Debug)]
pub struct Server {
    name: String,
    services: Vec<Service>,
}

impl Server {
    /// Creates a server advertising as `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: Vec::new(),
        }
    }

    /// Adds a service. Services must be added before [`Self::run`].
    pub fn add_service(&mut self, svc: Service) -> &mut Self {
        self.services.push(svc);
        self
    }

    /// Builds the attribute database, starts advertising, and serves every
    /// connecting central until an HCI fault.
    pub async fn run(self, hci: &Hci) -> Result<()> {
        let (db, cccds) = build_db(&self.services);
        let (db, cccds) = (Arc::new(db), Arc::new(cccds));
        let mut l2cap = LeL2cap::new(hci);
        self.start_advertising(hci).await?;
        loop {
            let conn = l2cap.accept().await.map_err(att::Error::from)?;
            tokio::spawn(serve_central(conn, Arc::clone(&db), Arc::clone(&cccds)));
        }
    }

    async fn start_advertising(&self, hci: &Hci) -> Result<()> {
        hci.le_set_advertising_parameters(ADV_INTERVAL, ADV_INTERVAL).await?;
        hci.le_set_advertising_data(adv_data(&self.services).as_ref()).await?;
        hci.le_set_scan_response_data(scan_data(&self.name).as_ref()).await?;
        hci.le_set_advertise_enable(true).await?;
        debug!("advertising as {:?}", self.name);
        Ok(())
    }
}

/// Serves one central connection, then clears its subscription state.
async fn serve_central(
    conn: Arc<crate::l2cap::Conn>,
    db: Arc<att::Db>,
    cccds: Arc<Vec<Arc<Cccd>>>,
) {
    let peer = conn.peer();
    let conn_id = u16::from(conn.handle());
    debug!("central connected: {peer}");
    let srv = att::Server::new(conn, db, SERVER_RX_MTU);
    if let Err(e) = srv.serve().await {
        debug!("central {peer} closed: {e}");
    }
    for cccd in cccds.iter() {
        cccd.disconnect(conn_id);
    }
    debug!("central disconnected: {peer}");
}

/// Advertising data: general-discoverable flags plus the 16-bit service
/// UUIDs that fit.
#[allow(clippy::cast_possible_truncation)]
fn adv_data(services: &[Service]) -> StructBuf {
    let mut buf = StructBuf::new(31);
    (buf.append()).u8(2u8).u8(0x01u8).u8(0x06u8); // Flags: LE general, no BR/EDR
    let uuids: Vec<Uuid> = (services.iter().map(|s| s.uuid()))
        .filter(|u| u.as_u16().is_some())
        .collect();
    if !uuids.is_empty() {
        let n = uuids.len().min((buf.remaining() - 2) / 2);
        let mut p = buf.append();
        p.u8((1 + 2 * n) as u8).u8(0x03u8); // Complete list of 16-bit UUIDs
        for u in &uuids[..n] {
            u.pack(&mut p);
        }
    }
    buf
}

/// Scan response data: the complete or shortened local name.
fn scan_data(name: &str) -> StructBuf {
    let mut buf = StructBuf::new(31);
    let (name, typ) = if name.len() <= 29 {
        (name.as_bytes(), 0x09u8) // Complete local name
    } else {
        (&name.as_bytes()[..29], 0x08u8) // Shortened local name
    };
    #[allow(clippy::cast_possible_truncation)]
    (buf.append()).u8((1 + name.len()) as u8).u8(typ).put(name);
    buf
}

/// Translates the service tree into attributes. Returns the database and
/// the CCCDs needing per-connection teardown.
pub(crate) fn build_db(services: &[Service]) -> (att::Db, Vec<Arc<Cccd>>) {
    let mut b = att::Db::build();
    let mut cccds = Vec::new();
    for svc in services {
        let svc_decl = b.value(Uuid::PRIMARY_SERVICE, svc.uuid.as_le_bytes().to_vec());
        let mut svc_end = svc_decl;
        for chr in &svc.characteristics {
            // Declaration: properties, value handle, characteristic UUID
            let vh = u16::from(b.next_handle()) + 1;
            let mut decl = Vec::with_capacity(3 + chr.uuid.len());
            decl.push(chr.props.bits());
            decl.extend_from_slice(&vh.to_le_bytes());
            decl.extend_from_slice(chr.uuid.as_le_bytes());
            let chr_decl = b.value(Uuid::CHARACTERISTIC, decl);

            let dynamic = chr.handlers.read.is_some()
                || chr.handlers.write.is_some()
                || chr.handlers.write_no_rsp.is_some();
            let value_handle = match (&chr.value, dynamic) {
                (Some(v), false) => b.value(chr.uuid, v.clone()),
                _ => b.handler(
                    chr.uuid,
                    Arc::new(AttrValue {
                        handlers: chr.handlers.clone(),
                        value: chr.value.clone(),
                    }),
                ),
            };
            debug_assert_eq!(u16::from(value_handle), vh);
            let mut chr_end = value_handle;

            for d in &chr.descriptors {
                chr_end = match (&d.value, d.handlers.read.is_some() || d.handlers.write.is_some())
                {
                    (Some(v), false) => b.value(d.uuid, v.clone()),
                    _ => b.handler(
                        d.uuid,
                        Arc::new(AttrValue {
                            handlers: d.handlers.clone(),
                            value: d.value.clone(),
                        }),
                    ),
                };
            }

            // Subscription state descriptor, created lazily
            if chr.props.intersects(Prop::NOTIFY | Prop::INDICATE) {
                let cccd = Arc::new(Cccd {
                    value_handle,
                    notify: chr.handlers.notify.clone(),
                    indicate: chr.handlers.indicate.clone(),
                    state: SyncMutex::new(HashMap::new()),
                });
                chr_end = b.handler(
                    Uuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
                    Arc::<Cccd>::clone(&cccd),
                );
                cccds.push(cccd);
            }

            b.set_group_end(chr_decl, chr_end);
            svc_end = chr_end;
        }
        b.set_group_end(svc_decl, svc_end);
    }
    (b.freeze(), cccds)
}

/// Routes attribute access to the capability handler registered for the
/// request's opcode.
struct AttrValue {
    handlers: Handlers,
    value: Option<Box<[u8]>>,
}

impl AttrValue {
    fn serve(
        h: &Arc<dyn Handler>,
        session: &Session,
        req: &att::Request<'_>,
        rsp: &mut att::ResponseWriter,
        data: &[u8],
    ) -> att::ErrorCode {
        let mut greq = Request {
            peer: session.peer(),
            conn_id: session.conn_id(),
            mtu: session.mtu(),
            data,
            offset: req.offset(),
            notifier: None,
        };
        let mut grsp = ResponseWriter {
            w: rsp,
            status: att::ErrorCode::Success,
        };
        h.serve(&mut greq, &mut grsp);
        grsp.status
    }
}

impl att::Handler for AttrValue {
    fn handle(
        &self,
        session: &Session,
        req: &att::Request<'_>,
        rsp: &mut att::ResponseWriter,
    ) -> att::ErrorCode {
        use att::Access;
        match req.opcode().access() {
            Some(Access::Read) => {
                if let Some(h) = &self.handlers.read {
                    return Self::serve(h, session, req, rsp, &[]);
                }
                if let Some(v) = &self.value {
                    rsp.write(v);
                    return att::ErrorCode::Success;
                }
                att::ErrorCode::ReadNotPermitted
            }
            Some(Access::Write) => match &self.handlers.write {
                Some(h) => Self::serve(h, session, req, rsp, req.value()),
                None => att::ErrorCode::WriteNotPermitted,
            },
            Some(Access::WriteNoRsp) => match &self.handlers.write_no_rsp {
                Some(h) => Self::serve(h, session, req, rsp, req.value()),
                None => att::ErrorCode::WriteNotPermitted,
            },
            None => att::ErrorCode::RequestNotSupported,
        }
    }
}

/// Client Characteristic Configuration descriptor (UUID 0x2902).
/// Subscription state is kept per connection; a rising notify or indicate
/// bit launches the application handler in a background task with a bound
/// [`Notifier`], and a falling bit marks that notifier done.
pub(crate) struct Cccd {
    value_handle: Handle,
    notify: Option<Arc<dyn Handler>>,
    indicate: Option<Arc<dyn Handler>>,
    state: SyncMutex<HashMap<u16, ClientState>>,
}

#[derive(Default)]
struct ClientState {
    value: u16,
    notify_stop: Option<CancellationToken>,
    indicate_stop: Option<CancellationToken>,
}

impl Cccd {
    fn write(&self, session: &Session, data: &[u8]) -> att::ErrorCode {
        let Ok(v) = <[u8; 2]>::try_from(data) else {
            return att::ErrorCode::InvalidAttributeValueLength;
        };
        let v = u16::from_le_bytes(v);
        let mut state = self.state.lock();
        let st = state.entry(session.conn_id()).or_default();
        debug!(
            "CCCD for {}: {:#06X} -> {v:#06X}",
            self.value_handle, st.value
        );
        // Notify and indicate edges are independent
        if st.value & INDICATE_BIT == 0 && v & INDICATE_BIT != 0 {
            if let Some(h) = &self.indicate {
                st.indicate_stop = Some(self.spawn(session, h, true));
            }
        }
        if st.value & INDICATE_BIT != 0 && v & INDICATE_BIT == 0 {
            if let Some(stop) = st.indicate_stop.take() {
                stop.cancel();
            }
        }
        if st.value & NOTIFY_BIT == 0 && v & NOTIFY_BIT != 0 {
            if let Some(h) = &self.notify {
                st.notify_stop = Some(self.spawn(session, h, false));
            }
        }
        if st.value & NOTIFY_BIT != 0 && v & NOTIFY_BIT == 0 {
            if let Some(stop) = st.notify_stop.take() {
                stop.cancel();
            }
        }
        st.value = v;
        att::ErrorCode::Success
    }

    /// Launches the application handler with a notifier bound to this
    /// subscription. The returned token ends the session on a falling edge;
    /// disconnect cancels it through the parent.
    fn spawn(&self, session: &Session, h: &Arc<dyn Handler>, indicate: bool) -> CancellationToken {
        let stop = session.done().child_token();
        let notifier = Notifier {
            session: session.clone(),
            value_handle: self.value_handle,
            indicate,
            stop: stop.clone(),
        };
        let h = Arc::clone(h);
        let (peer, conn_id, mtu) = (session.peer(), session.conn_id(), session.mtu());
        tokio::spawn(async move {
            let mut rsp = att::ResponseWriter::new(0);
            let mut req = Request {
                peer,
                conn_id,
                mtu,
                data: &[],
                offset: 0,
                notifier: Some(notifier),
            };
            h.serve(
                &mut req,
                &mut ResponseWriter {
                    w: &mut rsp,
                    status: att::ErrorCode::Success,
                },
            );
        });
        stop
    }

    /// Drops one connection's subscription state and ends its sessions.
    pub(crate) fn disconnect(&self, conn_id: u16) {
        if let Some(st) = self.state.lock().remove(&conn_id) {
            if let Some(stop) = st.notify_stop {
                stop.cancel();
            }
            if let Some(stop) = st.indicate_stop {
                stop.cancel();
            }
        }
    }
}

impl att::Handler for Cccd {
    fn handle(
        &self,
        session: &Session,
        req: &att::Request<'_>,
        rsp: &mut att::ResponseWriter,
    ) -> att::ErrorCode {
        use att::Access;
        match req.opcode().access() {
            Some(Access::Read) => {
                let v = (self.state.lock().get(&session.conn_id())).map_or(0, |st| st.value);
                rsp.write(&v.to_le_bytes());
                att::ErrorCode::Success
            }
            Some(Access::Write | Access::WriteNoRsp) => self.write(session, req.value()),
            None => att::ErrorCode::RequestNotSupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> impl Handler {
        |_: &mut Request<'_>, _: &mut ResponseWriter<'_>| {}
    }

    #[test]
    fn schema_layout() {
        // Two services: 0x1800 at handles 1-5, 0x180F at 6-9
        let mut gap = Service::new(0x1800u16);
        gap.add_characteristic(0x2A00u16).set_value(*b"demo");
        gap.add_characteristic(0x2A01u16).set_value([0u8, 0]);
        let mut bas = Service::new(0x180Fu16);
        (bas.add_characteristic(0x2A19u16))
            .set_value([100u8])
            .handle(Prop::NOTIFY, handler());

        let (db, cccds) = build_db(&[gap, bas]);
        assert_eq!(db.len(), 9);
        assert_eq!(cccds.len(), 1);

        let svc = db.at(1).unwrap();
        assert_eq!(svc.typ(), Uuid::PRIMARY_SERVICE);
        assert_eq!(svc.value(), Some(&[0x00, 0x18][..]));
        assert_eq!(u16::from(svc.end_group()), 5);

        // Characteristic declaration: props, value handle, UUID
        let decl = db.at(2).unwrap();
        assert_eq!(decl.typ(), Uuid::CHARACTERISTIC);
        assert_eq!(decl.value(), Some(&[0x02, 0x03, 0x00, 0x00, 0x2A][..]));
        assert_eq!(db.at(3).unwrap().value(), Some(&b"demo"[..]));

        let svc = db.at(6).unwrap();
        assert_eq!(svc.value(), Some(&[0x0F, 0x18][..]));
        assert_eq!(u16::from(svc.end_group()), 9);
        // Notify adds a CCCD after the value attribute
        let cccd = db.at(9).unwrap();
        assert_eq!(cccd.typ(), Uuid::CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(
            db.at(7).unwrap().value(),
            Some(&[0x12, 0x08, 0x00, 0x19, 0x2A][..])
        );
    }
}
