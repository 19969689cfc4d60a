//! End-to-end tests driving the full stack over an in-memory transport,
//! with a minimal controller emulator answering commands and echoing
//! buffer acknowledgments.

use std::sync::Arc;

use futures_core::future::BoxFuture;
use tokio::sync::mpsc;

use bluelet::gatt::{self, Prop};
use bluelet::hci::{EventLoop, Hci};
use bluelet::host;

/// Transport backed by two packet channels.
#[derive(Debug)]
struct MockTransport {
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl host::Transport for MockTransport {
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, host::Result<usize>> {
        Box::pin(async move {
            match self.rx.lock().await.recv().await {
                Some(pkt) => {
                    buf[..pkt.len()].copy_from_slice(&pkt);
                    Ok(pkt.len())
                }
                None => Ok(0),
            }
        })
    }

    fn send<'a>(&'a self, pkt: &'a [u8]) -> BoxFuture<'a, host::Result<()>> {
        let pkt = pkt.to_vec();
        Box::pin(async move { self.tx.send(pkt).await.map_err(|_| host::Error::Closed) })
    }
}

/// Return parameters for the emulated controller's command completions.
fn return_params(opcode: u16) -> Vec<u8> {
    match opcode {
        // Read BD_ADDR
        0x1009 => vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
        // Read Local Version Information
        0x1001 => vec![0x00, 0x0B, 0x00, 0x00, 0x0B, 0x0F, 0x00, 0x00, 0x00],
        // Read Buffer Size: ACL 64 bytes x 8 packets
        0x1005 => vec![0x00, 0x40, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00],
        // LE Read Buffer Size: ACL 251 bytes x 4 packets
        0x2002 => vec![0x00, 0xFB, 0x00, 0x04],
        // LE Read Advertising Channel Tx Power
        0x2007 => vec![0x00, 0x00],
        _ => vec![0x00],
    }
}

/// Host stack plus the controller-side channel ends.
struct Harness {
    hci: Hci,
    to_host: mpsc::Sender<Vec<u8>>,
    acl: mpsc::Receiver<Vec<u8>>,
    cmds: mpsc::Receiver<u16>,
    _run: EventLoop,
}

async fn start() -> Harness {
    let (to_host_tx, to_host_rx) = mpsc::channel(64);
    let (from_host_tx, mut from_host_rx) = mpsc::channel::<Vec<u8>>(64);
    let (acl_tx, acl_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    let th = to_host_tx.clone();
    tokio::spawn(async move {
        while let Some(pkt) = from_host_rx.recv().await {
            match pkt[0] {
                0x01 => {
                    let opcode = u16::from_le_bytes([pkt[1], pkt[2]]);
                    let _ = cmd_tx.send(opcode).await;
                    let rp = return_params(opcode);
                    #[allow(clippy::cast_possible_truncation)]
                    let mut evt = vec![0x04, 0x0E, 3 + rp.len() as u8, 0x01, pkt[1], pkt[2]];
                    evt.extend(rp);
                    let _ = th.send(evt).await;
                }
                0x02 => {
                    // Acknowledge the transmit buffer, then surface the packet
                    let nocp = vec![0x04, 0x13, 0x05, 0x01, 0x40, 0x00, 0x01, 0x00];
                    let _ = th.send(nocp).await;
                    let _ = acl_tx.send(pkt).await;
                }
                _ => {}
            }
        }
    });

    let transport = Arc::new(MockTransport {
        rx: tokio::sync::Mutex::new(to_host_rx),
        tx: from_host_tx,
    });
    let hci = Hci::new(transport);
    let run = hci.run();
    hci.init().await.unwrap();
    Harness {
        hci,
        to_host: to_host_tx,
        acl: acl_rx,
        cmds: cmd_rx,
        _run: run,
    }
}

impl Harness {
    /// Waits until the host issues the given command.
    async fn wait_cmd(&mut self, opcode: u16) {
        while let Some(op) = self.cmds.recv().await {
            if op == opcode {
                return;
            }
        }
        panic!("host never sent command {opcode:#06X}");
    }

    /// Delivers an LE Connection Complete for handle 0x0040.
    async fn connect(&self) {
        let evt = vec![
            0x04, 0x3E, 0x13, 0x01, // LE meta, connection complete
            0x00, // Status
            0x40, 0x00, // Handle
            0x01, // Role: peripheral
            0x00, // Peer address type
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // Peer address
            0x28, 0x00, // Interval
            0x00, 0x00, // Latency
            0xC8, 0x00, // Supervision timeout
            0x00, // Central clock accuracy
        ];
        self.to_host.send(evt).await.unwrap();
    }

    /// Sends one ATT PDU from the emulated central.
    async fn send_att(&self, payload: &[u8]) {
        let mut pkt = vec![0x02, 0x40, 0x20];
        #[allow(clippy::cast_possible_truncation)]
        pkt.extend_from_slice(&(4 + payload.len() as u16).to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        pkt.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        pkt.extend_from_slice(&[0x04, 0x00]);
        pkt.extend_from_slice(payload);
        self.to_host.send(pkt).await.unwrap();
    }

    /// Receives the next ATT PDU sent by the server.
    async fn expect_att(&mut self) -> Vec<u8> {
        let pkt = self.acl.recv().await.expect("no outbound packet");
        assert_eq!(&pkt[..3], &[0x02, 0x40, 0x00], "not a first ACL fragment");
        pkt[9..].to_vec()
    }
}

/// Two services at handles 1-5 and 6-9: a static name, a write-no-response
/// sink, and a subscribable value.
fn fixture(
    wrote: mpsc::Sender<Vec<u8>>,
    notified: mpsc::Sender<Result<usize, String>>,
) -> (gatt::Service, gatt::Service) {
    let mut gap = gatt::Service::new(0x1800u16);
    gap.add_characteristic(0x2A00u16).set_value(*b"demo");
    (gap.add_characteristic(0x2A01u16)).handle(
        Prop::WRITE_NO_RSP,
        move |req: &mut gatt::Request<'_>, _: &mut gatt::ResponseWriter<'_>| {
            let _ = wrote.try_send(req.data().to_vec());
        },
    );

    let mut bas = gatt::Service::new(0x180Fu16);
    (bas.add_characteristic(0x2A19u16)).handle(
        Prop::NOTIFY | Prop::INDICATE,
        move |req: &mut gatt::Request<'_>, _: &mut gatt::ResponseWriter<'_>| {
            let Some(n) = req.take_notifier() else { return };
            let tx = notified.clone();
            tokio::spawn(async move {
                let r = n.write(b"x").await.map_err(|e| e.to_string());
                let _ = tx.send(r).await;
            });
        },
    );
    (gap, bas)
}

/// Starts the stack and a GATT server over the fixture services, returning
/// once the server is advertising and a central is connected.
async fn start_with_server(
    wrote: mpsc::Sender<Vec<u8>>,
    notified: mpsc::Sender<Result<usize, String>>,
) -> Harness {
    let mut h = start().await;
    let (gap, bas) = fixture(wrote, notified);
    let mut srv = gatt::Server::new("loopback");
    srv.add_service(gap).add_service(bas);
    let hci = h.hci.clone();
    tokio::spawn(async move { srv.run(&hci).await });
    // Advertise enable is the last bring-up command
    h.wait_cmd(0x200A).await;
    h.connect().await;
    h
}

fn sinks() -> (
    mpsc::Sender<Vec<u8>>,
    mpsc::Receiver<Vec<u8>>,
    mpsc::Sender<Result<usize, String>>,
    mpsc::Receiver<Result<usize, String>>,
) {
    let (wrote_tx, wrote_rx) = mpsc::channel(8);
    let (ntf_tx, ntf_rx) = mpsc::channel(8);
    (wrote_tx, wrote_rx, ntf_tx, ntf_rx)
}

#[tokio::test]
async fn init_follows_controller_bring_up() {
    let mut h = start().await;
    let want = [
        0x0C03, 0x1009, 0x1002, 0x1003, 0x1001, 0x1005, 0x2002, 0x2003, 0x201C, 0x2007,
        0x2001, 0x0C01, 0x0C6D, 0x0C24,
    ];
    for opcode in want {
        assert_eq!(h.cmds.recv().await, Some(opcode));
    }
    let info = h.hci.info();
    assert_eq!(info.acl_data_len, 251);
    assert_eq!(info.acl_num_pkts, 4);
    assert_eq!(info.addr.as_le_bytes(), &[1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn mtu_exchange() {
    let (w, _wr, n, _nr) = sinks();
    let mut h = start_with_server(w, n).await;
    h.send_att(&[0x02, 0x64, 0x00]).await;
    // Server receive MTU is 1024
    assert_eq!(h.expect_att().await, [0x03, 0x00, 0x04]);
}

#[tokio::test]
async fn read_primary_services() {
    let (w, _wr, n, _nr) = sinks();
    let mut h = start_with_server(w, n).await;
    h.send_att(&[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]).await;
    assert_eq!(
        h.expect_att().await,
        [
            0x11, 0x06, // One 6-byte record per service
            0x01, 0x00, 0x05, 0x00, 0x00, 0x18, // 0x1800 at 1-5
            0x06, 0x00, 0x09, 0x00, 0x0F, 0x18, // 0x180F at 6-9
        ]
    );
}

#[tokio::test]
async fn read_of_unknown_handle() {
    let (w, _wr, n, _nr) = sinks();
    let mut h = start_with_server(w, n).await;
    h.send_att(&[0x0A, 0xFF, 0xFF]).await;
    assert_eq!(h.expect_att().await, [0x01, 0x0A, 0xFF, 0xFF, 0x01]);
}

#[tokio::test]
async fn write_command_reaches_handler_without_reply() {
    let (w, mut wrote, n, _nr) = sinks();
    let mut h = start_with_server(w, n).await;
    h.send_att(&[0x52, 0x05, 0x00, 0x48, 0x69]).await;
    assert_eq!(wrote.recv().await.unwrap(), b"Hi");
    // No reply was queued: the next response answers the next request
    h.send_att(&[0x0A, 0x03, 0x00]).await;
    assert_eq!(h.expect_att().await, [0x0B, b'd', b'e', b'm', b'o']);
}

#[tokio::test]
async fn subscribe_then_notify() {
    let (w, _wr, n, mut notified) = sinks();
    let mut h = start_with_server(w, n).await;
    // Enable notifications on the CCCD at handle 9
    h.send_att(&[0x12, 0x09, 0x00, 0x01, 0x00]).await;
    assert_eq!(h.expect_att().await, [0x13]);
    // The producer writes "x" for value handle 8
    assert_eq!(h.expect_att().await, [0x1B, 0x08, 0x00, b'x']);
    assert_eq!(notified.recv().await.unwrap(), Ok(1));
    // Reading the CCCD back returns this connection's value
    h.send_att(&[0x0A, 0x09, 0x00]).await;
    assert_eq!(h.expect_att().await, [0x0B, 0x01, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn indication_timeout_frees_the_slot() {
    let (w, _wr, n, mut notified) = sinks();
    let mut h = start_with_server(w, n).await;
    // Enable indications; never confirm
    h.send_att(&[0x12, 0x09, 0x00, 0x02, 0x00]).await;
    assert_eq!(h.expect_att().await, [0x13]);
    assert_eq!(h.expect_att().await, [0x1D, 0x08, 0x00, b'x']);
    let r = notified.recv().await.unwrap();
    assert!(r.unwrap_err().contains("timeout"), "expected a timeout");
    // The slot is free: re-subscribing indicates again, and confirmation
    // now completes the write
    h.send_att(&[0x12, 0x09, 0x00, 0x00, 0x00]).await;
    assert_eq!(h.expect_att().await, [0x13]);
    h.send_att(&[0x12, 0x09, 0x00, 0x02, 0x00]).await;
    assert_eq!(h.expect_att().await, [0x13]);
    assert_eq!(h.expect_att().await, [0x1D, 0x08, 0x00, b'x']);
    h.send_att(&[0x1E]).await;
    assert_eq!(notified.recv().await.unwrap(), Ok(1));
}
