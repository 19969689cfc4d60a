//! LE-U connection state: inbound PDU recombination, outbound
//! fragmentation, and transmit credit accounting.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use structbuf::{Pack, StructBuf, Unpacker};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dev::Addr;
use crate::hci::{AclWriter, ConnHandle, PKT_ACL_DATA};
use crate::SyncMutex;

use super::pool::{Lease, Pool};
use super::{Error, Result, CID_ATT, CID_LE_SIGNAL, CID_SMP, DEFAULT_MTU, L2CAP_HDR};

/// Packet boundary flags in bits 12-13 of the ACL handle field
/// ([Vol 4] Part E, Section 5.4.2).
const PB_FIRST: u16 = 0x0 << 12;
const PB_CONT: u16 = 0x1 << 12;
const PB_START: u16 = 0x2 << 12;

/// Established LE-U logical link to one remote peer.
pub struct Conn {
    handle: ConnHandle,
    peer: Addr,
    writer: AclWriter,
    acl_mtu: usize,
    pool: Arc<Pool>,
    leases: SyncMutex<VecDeque<Lease>>,
    rx: tokio::sync::Mutex<Receiver>,
    params: SyncMutex<Params>,
    done: CancellationToken,
}

/// Inbound fragment queue and recombination state. Only the connection's
/// reader task touches this.
struct Receiver {
    ch: mpsc::Receiver<Vec<u8>>,
    partial: Option<StructBuf>,
}

/// Negotiated connection parameters.
#[derive(Clone, Copy, Debug)]
pub struct Params {
    /// Largest ATT payload the remote peer accepts.
    pub tx_mtu: u16,
    /// Largest ATT payload this host accepts.
    pub rx_mtu: u16,
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    /// Peripheral latency in connection events.
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub supervision_timeout: u16,
}

/// Complete inbound L2CAP PDU, starting with the basic header.
#[derive(Debug)]
pub struct Pdu {
    cid: u16,
    buf: StructBuf,
}

impl Pdu {
    /// Returns the destination channel identifier.
    #[inline]
    #[must_use]
    pub const fn cid(&self) -> u16 {
        self.cid
    }

    /// Returns the information payload.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[L2CAP_HDR..]
    }
}

impl Conn {
    pub(super) fn new(
        handle: ConnHandle,
        peer: Addr,
        writer: AclWriter,
        acl_mtu: usize,
        pool: Arc<Pool>,
        ch: mpsc::Receiver<Vec<u8>>,
        params: Params,
    ) -> Self {
        Self {
            handle,
            peer,
            writer,
            acl_mtu,
            pool,
            leases: SyncMutex::new(VecDeque::new()),
            rx: tokio::sync::Mutex::new(Receiver { ch, partial: None }),
            params: SyncMutex::new(params),
            done: CancellationToken::new(),
        }
    }

    /// Returns the connection handle.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> ConnHandle {
        self.handle
    }

    /// Returns the remote device address.
    #[inline]
    #[must_use]
    pub const fn peer(&self) -> Addr {
        self.peer
    }

    /// Returns the current connection parameters.
    #[inline]
    #[must_use]
    pub fn params(&self) -> Params {
        *self.params.lock()
    }

    /// Returns the largest ATT payload the remote peer accepts.
    #[inline]
    #[must_use]
    pub fn tx_mtu(&self) -> u16 {
        self.params.lock().tx_mtu
    }

    /// Sets the largest ATT payload the remote peer accepts.
    pub fn set_tx_mtu(&self, mtu: u16) {
        self.params.lock().tx_mtu = mtu;
    }

    /// Returns the largest ATT payload this host accepts.
    #[inline]
    #[must_use]
    pub fn rx_mtu(&self) -> u16 {
        self.params.lock().rx_mtu
    }

    /// Sets the largest ATT payload this host accepts.
    pub fn set_rx_mtu(&self, mtu: u16) {
        self.params.lock().rx_mtu = mtu;
    }

    pub(super) fn update_params(&self, interval: u16, latency: u16, supervision_timeout: u16) {
        let mut p = self.params.lock();
        p.interval = interval;
        p.latency = latency;
        p.supervision_timeout = supervision_timeout;
    }

    /// Returns a token that is cancelled when the connection ends.
    #[inline]
    #[must_use]
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Returns whether the connection has ended.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Marks the connection closed and releases all transmit buffers that
    /// the controller will never acknowledge.
    pub(super) fn close(&self) {
        self.done.cancel();
        self.leases.lock().clear();
    }

    /// Releases the `n` oldest transmit buffers acknowledged by a
    /// `Number Of Completed Packets` event.
    pub(super) fn free_leases(&self, n: usize) {
        let mut q = self.leases.lock();
        for _ in 0..n {
            if q.pop_front().is_none() {
                warn!("{} over-acknowledged transmit buffers", self.handle);
                break;
            }
        }
    }

    /// Receives the next complete PDU for the ATT channel. PDUs for other
    /// channels are dropped. This method is cancel safe.
    pub async fn recv(&self) -> Result<Pdu> {
        let mut rx = self.rx.lock().await;
        loop {
            eprintln!("DEBUG waiting recv"); let Some(frag) = rx.ch.recv().await else {
                return Err(Error::ConnClosed(self.handle));
            };
            let Some(pdu) = Self::recombine(&mut rx.partial, &frag) else { continue };
            match pdu.cid {
                CID_ATT => return Ok(pdu),
                CID_LE_SIGNAL | CID_SMP => debug!("ignoring PDU for CID {:#06X}", pdu.cid),
                _ => warn!("PDU for unknown CID {:#06X}", pdu.cid),
            }
        }
    }

    /// Adds one ACL fragment to the recombination buffer, returning a
    /// complete PDU when the accumulated length matches the L2CAP length
    /// field. Malformed fragments discard any partial PDU.
    fn recombine(partial: &mut Option<StructBuf>, frag: &[u8]) -> Option<Pdu> {
        let mut p = Unpacker::new(frag);
        let (hf, dlen) = (p.u16(), p.u16());
        if !p.is_ok() || p.len() != usize::from(dlen) {
            warn!("invalid ACL data packet: {frag:02X?}");
            *partial = None;
            return None;
        }
        let data = p.into_inner();
        let buf = match hf & (0x3 << 12) {
            PB_START => {
                if partial.take().is_some() {
                    warn!("unfinished PDU discarded");
                }
                let mut hp = Unpacker::new(data);
                let plen = hp.u16();
                if !hp.is_ok() {
                    warn!("ACL fragment too short for basic L2CAP header");
                    return None;
                }
                let frame_len = L2CAP_HDR + usize::from(plen);
                if data.len() > frame_len {
                    warn!("L2CAP PDU longer than its length field: {data:02X?}");
                    return None;
                }
                let mut buf = StructBuf::new(frame_len);
                buf.put_at(0, data);
                buf
            }
            PB_CONT => {
                let Some(mut buf) = partial.take() else {
                    warn!("continuation fragment without start");
                    return None;
                };
                let at = buf.as_ref().len();
                if at + data.len() > buf.lim() {
                    warn!("L2CAP PDU overflow, discarding");
                    return None;
                }
                buf.put_at(at, data);
                buf
            }
            pb => {
                warn!("unexpected packet boundary flag {:#X}", pb >> 12);
                *partial = None;
                return None;
            }
        };
        if buf.as_ref().len() < buf.lim() {
            *partial = Some(buf);
            return None;
        }
        let cid = Unpacker::new(&buf.as_ref()[2..]).u16();
        trace!("PDU for CID {cid:#06X}: {:02X?}", &buf.as_ref()[L2CAP_HDR..]);
        Some(Pdu { cid, buf })
    }

    /// Sends one PDU on channel `cid`, fragmenting to the controller's ACL
    /// MTU. One transmit buffer is borrowed per fragment and returned when
    /// the controller acknowledges it.
    pub async fn send(&self, cid: u16, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= usize::from(u16::MAX) - L2CAP_HDR);
        let mut frame = StructBuf::new(L2CAP_HDR + payload.len());
        #[allow(clippy::cast_possible_truncation)]
        (frame.append()).u16(payload.len() as u16).u16(cid).put(payload);
        let mut pb = PB_FIRST;
        for chunk in frame.as_ref().chunks(self.acl_mtu) {
            if self.is_closed() {
                return Err(Error::ConnClosed(self.handle));
            }
            let mut lease = self.pool.lease().await;
            let buf = lease.buf();
            buf.clear();
            #[allow(clippy::cast_possible_truncation)]
            (buf.append())
                .u8(PKT_ACL_DATA)
                .u16(u16::from(self.handle) | pb)
                .u16(chunk.len() as u16)
                .put(chunk);
            self.writer.write(buf.as_ref()).await.map_err(crate::hci::Error::from)?;
            self.leases.lock().push_back(lease);
            pb = PB_CONT;
        }
        Ok(())
    }
}

impl Debug for Conn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Conn"))
            .field("handle", &self.handle)
            .field("peer", &self.peer)
            .field("params", &self.params())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use futures_core::future::BoxFuture;

    use crate::host;

    use super::*;

    /// Transport stub that captures outbound packets and never receives.
    #[derive(Debug)]
    struct SinkTransport(mpsc::Sender<Vec<u8>>);

    impl host::Transport for SinkTransport {
        fn recv<'a>(&'a self, _buf: &'a mut [u8]) -> BoxFuture<'a, host::Result<usize>> {
            Box::pin(std::future::pending())
        }

        fn send<'a>(&'a self, pkt: &'a [u8]) -> BoxFuture<'a, host::Result<()>> {
            let pkt = pkt.to_vec();
            Box::pin(async move {
                self.0.send(pkt).await.map_err(|_| host::Error::Closed)
            })
        }
    }

    /// Creates a detached connection for protocol tests. Returns the
    /// connection, a sender for injecting inbound ACL fragments (without the
    /// HCI type tag), and a receiver of raw outbound HCI packets.
    pub(crate) fn conn(
        acl_mtu: usize,
        pool_count: usize,
    ) -> (Arc<Conn>, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let transport: Arc<dyn host::Transport> = Arc::new(SinkTransport(out_tx));
        let cn = Conn::new(
            ConnHandle::new(0x0040),
            Addr::default(),
            AclWriter::testing(transport),
            acl_mtu,
            Pool::new(1 + crate::hci::ACL_HDR + acl_mtu, pool_count),
            in_rx,
            Params {
                tx_mtu: DEFAULT_MTU,
                rx_mtu: DEFAULT_MTU,
                interval: 0,
                latency: 0,
                supervision_timeout: 0,
            },
        );
        (Arc::new(cn), in_tx, out_rx)
    }

    /// Frames `data` as one inbound ACL fragment for the test connection.
    pub(crate) fn frag(start: bool, data: &[u8]) -> Vec<u8> {
        let mut buf = StructBuf::new(crate::hci::ACL_HDR + data.len());
        let pb = if start { PB_START } else { PB_CONT };
        #[allow(clippy::cast_possible_truncation)]
        (buf.append()).u16(0x0040 | pb).u16(data.len() as u16).put(data);
        buf.as_ref().to_vec()
    }

    /// Frames a complete inbound ATT PDU as a single start fragment.
    pub(crate) fn att_pdu(payload: &[u8]) -> Vec<u8> {
        let mut buf = StructBuf::new(L2CAP_HDR + payload.len());
        #[allow(clippy::cast_possible_truncation)]
        (buf.append()).u16(payload.len() as u16).u16(CID_ATT).put(payload);
        frag(true, buf.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{att_pdu, conn, frag};
    use super::*;

    #[tokio::test]
    async fn recombines_fragments() {
        let (cn, in_tx, _out) = conn(27, 4);
        // 10-byte ATT payload split across three fragments
        let payload = [0x52, 0x05, 0x00, b'f', b'r', b'a', b'g', b'd', b'a', b't'];
        let mut pdu = vec![10, 0, 0x04, 0x00];
        pdu.extend_from_slice(&payload);
        in_tx.send(frag(true, &pdu[..6])).await.unwrap();
        in_tx.send(frag(false, &pdu[6..9])).await.unwrap();
        in_tx.send(frag(false, &pdu[9..])).await.unwrap();
        let got = cn.recv().await.unwrap();
        assert_eq!(got.cid(), CID_ATT);
        assert_eq!(got.payload(), payload);
    }

    #[tokio::test]
    async fn drops_malformed_sequences() {
        let (cn, in_tx, _out) = conn(27, 4);
        // Continuation with no start
        in_tx.send(frag(false, &[1, 2, 3])).await.unwrap();
        // Start of a PDU that never completes
        in_tx.send(frag(true, &[9, 0, 0x04, 0x00, 1])).await.unwrap();
        // A fresh complete PDU supersedes the partial one
        in_tx.send(att_pdu(&[0x0A, 0x01, 0x00])).await.unwrap();
        let got = cn.recv().await.unwrap();
        assert_eq!(got.payload(), [0x0A, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn fragments_outbound_pdus() {
        let (cn, _in, mut out) = conn(27, 4);
        let payload = vec![0xAB; 40]; // 44-byte frame over 27-byte ACL MTU
        cn.send(CID_ATT, &payload).await.unwrap();
        let first = out.recv().await.unwrap();
        assert_eq!(first[0], PKT_ACL_DATA);
        assert_eq!(u16::from_le_bytes([first[1], first[2]]), 0x0040); // PB first
        assert_eq!(u16::from_le_bytes([first[3], first[4]]), 27);
        assert_eq!(&first[5..9], &[40, 0, 0x04, 0x00]);
        let second = out.recv().await.unwrap();
        assert_eq!(u16::from_le_bytes([second[1], second[2]]), 0x0040 | 0x1000);
        assert_eq!(u16::from_le_bytes([second[3], second[4]]), 44 - 27);
        // Two fragments outstanding, two leases held
        assert_eq!(cn.leases.lock().len(), 2);
        cn.free_leases(2);
        assert!(cn.leases.lock().is_empty());
    }
}
