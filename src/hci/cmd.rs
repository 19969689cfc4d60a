//! HCI command encoding and flow control ([Vol 4] Part E, Sections 4.4, 7).

use std::collections::HashMap;

use structbuf::{Pack, Packer, StructBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace, warn};

use super::*;

/// Command packet header: type tag, opcode, and parameter length.
const CMD_HDR: usize = 4;

/// Maximum command parameter length ([Vol 4] Part E, Section 5.4.1).
const CMD_PARAMS_MAX: usize = 255;

/// Upper bound on banked command credits. The controller rarely grants more
/// than a few; surplus grants are discarded.
const CMD_CREDITS_MAX: usize = 8;

/// Command opcode: OGF in the upper 6 bits, OCF in the lower 10
/// ([Vol 4] Part E, Section 5.4.1).
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
#[repr(u16)]
pub enum Opcode {
    /// Flow-control NOP.
    Nop = 0x0000,
    SetEventMask = 0x0C01,
    Reset = 0x0C03,
    WriteClassOfDevice = 0x0C24,
    WriteLeHostSupport = 0x0C6D,
    ReadLocalVersionInformation = 0x1001,
    ReadLocalSupportedCommands = 0x1002,
    ReadLocalSupportedFeatures = 0x1003,
    ReadBufferSize = 0x1005,
    ReadBdAddr = 0x1009,
    LeSetEventMask = 0x2001,
    LeReadBufferSize = 0x2002,
    LeReadLocalSupportedFeatures = 0x2003,
    LeSetAdvertisingParameters = 0x2006,
    LeReadAdvertisingChannelTxPower = 0x2007,
    LeSetAdvertisingData = 0x2008,
    LeSetScanResponseData = 0x2009,
    LeSetAdvertiseEnable = 0x200A,
    LeLongTermKeyRequestNegativeReply = 0x201B,
    LeReadSupportedStates = 0x201C,
}

impl Display for Opcode {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Command or event status code ([Vol 1] Part F, Section 1.3).
#[derive(Clone, Copy, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct Status(u8);

impl Status {
    /// Command succeeded.
    pub const SUCCESS: Self = Self(0x00);

    /// Returns whether the status indicates success.
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0x00
    }
}

impl From<u8> for Status {
    #[inline]
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl Debug for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Status({:#04X})", self.0)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_ok() {
            f.write_str("success")
        } else {
            write!(f, "status {:#04X}", self.0)
        }
    }
}

/// One submitted command awaiting a credit and its completion event.
struct CmdPkt {
    opcode: Opcode,
    params: StructBuf,
    done: oneshot::Sender<Result<Vec<u8>>>,
}

/// Pending command map shared by the sender task and the event side.
type Inflight = Arc<SyncMutex<HashMap<u16, (Opcode, oneshot::Sender<Result<Vec<u8>>>)>>>;

/// Host-to-controller command flow control state
/// ([Vol 4] Part E, Section 4.4).
#[derive(Debug)]
pub(super) struct Commands {
    submit: mpsc::Sender<CmdPkt>,
    credits: mpsc::Sender<StructBuf>,
    inflight: Inflight,
    sender: SyncMutex<Option<Sender>>,
}

impl Debug for CmdPkt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdPkt").field("opcode", &self.opcode).finish_non_exhaustive()
    }
}

/// Receiving half of the command pump, consumed by [`Hci::run`].
#[derive(Debug)]
pub(super) struct Sender {
    submit: mpsc::Receiver<CmdPkt>,
    credits: mpsc::Receiver<StructBuf>,
    inflight: Inflight,
}

impl Commands {
    /// Creates the command pump with an initial credit of one.
    pub fn new() -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(1);
        let (credit_tx, credit_rx) = mpsc::channel(CMD_CREDITS_MAX);
        let inflight = Inflight::default();
        credit_tx
            .try_send(StructBuf::new(CMD_HDR + CMD_PARAMS_MAX))
            .expect("empty credit queue");
        Self {
            submit: submit_tx,
            credits: credit_tx,
            inflight: Arc::clone(&inflight),
            sender: SyncMutex::new(Some(Sender {
                submit: submit_rx,
                credits: credit_rx,
                inflight,
            })),
        }
    }

    /// Takes the sender task state. Returns `None` after the first call.
    pub fn take_sender(&self) -> Option<Sender> {
        self.sender.lock().take()
    }

    /// Handles `HCI_Command_Complete` ([Vol 4] Part E, Section 7.7.14).
    pub fn handle_complete(&self, params: &[u8]) {
        let mut p = Unpacker::new(params);
        let (ncmd, opcode) = (p.u8(), p.u16());
        if !p.is_ok() {
            warn!("corrupt command complete event: {params:02X?}");
            return;
        }
        self.grant(ncmd);
        if opcode == u16::from(Opcode::Nop) {
            return; // NOP, flow control only
        }
        let Some((_, done)) = self.inflight_remove(opcode) else {
            warn!("command complete for unknown opcode {opcode:#06X}");
            return;
        };
        let _ = done.send(Ok(p.into_inner().to_vec()));
    }

    /// Handles `HCI_Command_Status` ([Vol 4] Part E, Section 7.7.15).
    pub fn handle_status(&self, params: &[u8]) {
        let mut p = Unpacker::new(params);
        let (status, ncmd, opcode) = (Status::from(p.u8()), p.u8(), p.u16());
        if !p.is_ok() {
            warn!("corrupt command status event: {params:02X?}");
            return;
        }
        self.grant(ncmd);
        if opcode == u16::from(Opcode::Nop) {
            return;
        }
        let Some((opcode, done)) = self.inflight_remove(opcode) else {
            warn!("command status for unknown opcode {opcode:#06X}");
            return;
        };
        let r = if status.is_ok() {
            Ok(Vec::new())
        } else {
            Err(Error::Command { opcode, status })
        };
        let _ = done.send(r);
    }

    /// Banks `n` command credits, discarding any beyond the queue bound.
    fn grant(&self, n: u8) {
        for _ in 0..n {
            if (self.credits.try_send(StructBuf::new(CMD_HDR + CMD_PARAMS_MAX))).is_err() {
                break;
            }
        }
    }

    fn inflight_remove(
        &self,
        opcode: u16,
    ) -> Option<(Opcode, oneshot::Sender<Result<Vec<u8>>>)> {
        self.inflight.lock().remove(&opcode)
    }
}

impl Sender {
    /// Frames and submits commands as credits become available. The
    /// controller never has more outstanding commands than credits granted.
    pub(super) async fn run(mut self, t: Arc<dyn host::Transport>, ct: CancellationToken) {
        debug!("HCI command sender started");
        loop {
            let pkt = tokio::select! {
                p = self.submit.recv() => p,
                _ = ct.cancelled() => None,
            };
            let Some(pkt) = pkt else {
                debug!("HCI command sender terminating");
                return;
            };
            let Some(mut buf) = self.credits.recv().await else { return };
            let params = pkt.params.as_ref();
            buf.clear();
            let mut p = buf.append();
            #[allow(clippy::cast_possible_truncation)]
            p.u8(PKT_COMMAND)
                .u16(u16::from(pkt.opcode))
                .u8(params.len() as u8)
                .put(params);
            trace!("{}: {:02X?}", pkt.opcode, buf.as_ref());
            let old = (self.inflight.lock()).insert(u16::from(pkt.opcode), (pkt.opcode, pkt.done));
            if let Some((opcode, _)) = old {
                warn!("{opcode} command superseded while in flight");
            }
            if let Err(e) = t.send(buf.as_ref()).await {
                error!("failed to send {} command: {e}", pkt.opcode);
            }
        }
    }
}

/// ACL buffer parameters ([Vol 4] Part E, Sections 7.4.5 and 7.8.2).
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferSize {
    /// Maximum ACL data payload per packet.
    pub acl_data_len: u16,
    /// Number of ACL data packets the controller can buffer.
    pub acl_num_pkts: u16,
}

/// Controller version information ([Vol 4] Part E, Section 7.4.1).
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalVersion {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

/// Command submission and typed wrappers.
impl Hci {
    /// Executes a command, calling `f` to encode its parameters, and returns
    /// the raw return parameters of the completion event.
    async fn exec(&self, opcode: Opcode, f: impl FnOnce(&mut Packer)) -> Result<Vec<u8>> {
        let mut params = StructBuf::new(CMD_PARAMS_MAX);
        f(&mut params.append());
        let (done, rx) = oneshot::channel();
        (self.commands.submit)
            .send(CmdPkt { opcode, params, done })
            .await
            .map_err(|_| Error::Aborted { opcode })?;
        rx.await.map_err(|_| Error::Aborted { opcode })?
    }

    /// Executes a command whose return parameters start with a status byte,
    /// failing on a non-success status.
    async fn exec_checked(
        &self,
        opcode: Opcode,
        f: impl FnOnce(&mut Packer),
    ) -> Result<Vec<u8>> {
        let rp = self.exec(opcode, f).await?;
        let status = Status::from(*rp.first().ok_or(Error::InvalidReturn { opcode })?);
        if !status.is_ok() {
            return Err(Error::Command { opcode, status });
        }
        Ok(rp)
    }

    /// `HCI_Reset` ([Vol 4] Part E, Section 7.3.2).
    pub async fn reset(&self) -> Result<()> {
        self.exec_checked(Opcode::Reset, |_| {}).await.map(|_| ())
    }

    /// `HCI_Read_BD_ADDR` ([Vol 4] Part E, Section 7.4.6).
    pub async fn read_bd_addr(&self) -> Result<RawAddr> {
        let opcode = Opcode::ReadBdAddr;
        let rp = self.exec_checked(opcode, |_| {}).await?;
        let addr: [u8; 6] = (rp.get(1..7))
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::InvalidReturn { opcode })?;
        Ok(RawAddr::from(addr))
    }

    /// `HCI_Read_Local_Supported_Commands` ([Vol 4] Part E, Section 7.4.2).
    pub async fn read_local_supported_commands(&self) -> Result<()> {
        (self.exec_checked(Opcode::ReadLocalSupportedCommands, |_| {}).await).map(|_| ())
    }

    /// `HCI_Read_Local_Supported_Features` ([Vol 4] Part E, Section 7.4.3).
    pub async fn read_local_supported_features(&self) -> Result<()> {
        (self.exec_checked(Opcode::ReadLocalSupportedFeatures, |_| {}).await).map(|_| ())
    }

    /// `HCI_Read_Local_Version_Information` ([Vol 4] Part E, Section 7.4.1).
    pub async fn read_local_version(&self) -> Result<LocalVersion> {
        let opcode = Opcode::ReadLocalVersionInformation;
        let rp = self.exec_checked(opcode, |_| {}).await?;
        let mut p = Unpacker::new(&rp);
        p.skip(1); // Status
        let v = LocalVersion {
            hci_version: p.u8(),
            hci_revision: p.u16(),
            lmp_version: p.u8(),
            manufacturer: p.u16(),
            lmp_subversion: p.u16(),
        };
        p.is_ok().then_some(v).ok_or(Error::InvalidReturn { opcode })
    }

    /// `HCI_Read_Buffer_Size` ([Vol 4] Part E, Section 7.4.5).
    pub async fn read_buffer_size(&self) -> Result<BufferSize> {
        let opcode = Opcode::ReadBufferSize;
        let rp = self.exec_checked(opcode, |_| {}).await?;
        let mut p = Unpacker::new(&rp);
        p.skip(1); // Status
        let acl_data_len = p.u16();
        p.skip(1); // SCO data length
        let acl_num_pkts = p.u16();
        (p.is_ok())
            .then_some(BufferSize { acl_data_len, acl_num_pkts })
            .ok_or(Error::InvalidReturn { opcode })
    }

    /// `HCI_LE_Read_Buffer_Size` ([Vol 4] Part E, Section 7.8.2). A zero
    /// packet count means LE shares the BR/EDR buffers.
    pub async fn le_read_buffer_size(&self) -> Result<BufferSize> {
        let opcode = Opcode::LeReadBufferSize;
        let rp = self.exec_checked(opcode, |_| {}).await?;
        let mut p = Unpacker::new(&rp);
        p.skip(1); // Status
        let acl_data_len = p.u16();
        let acl_num_pkts = u16::from(p.u8());
        (p.is_ok())
            .then_some(BufferSize { acl_data_len, acl_num_pkts })
            .ok_or(Error::InvalidReturn { opcode })
    }

    /// `HCI_LE_Read_Local_Supported_Features` ([Vol 4] Part E,
    /// Section 7.8.3).
    pub async fn le_read_local_supported_features(&self) -> Result<()> {
        (self.exec_checked(Opcode::LeReadLocalSupportedFeatures, |_| {}).await).map(|_| ())
    }

    /// `HCI_LE_Read_Supported_States` ([Vol 4] Part E, Section 7.8.27).
    pub async fn le_read_supported_states(&self) -> Result<()> {
        (self.exec_checked(Opcode::LeReadSupportedStates, |_| {}).await).map(|_| ())
    }

    /// `HCI_LE_Read_Advertising_Channel_Tx_Power` ([Vol 4] Part E,
    /// Section 7.8.6).
    pub async fn le_read_advertising_channel_tx_power(&self) -> Result<i8> {
        let opcode = Opcode::LeReadAdvertisingChannelTxPower;
        let rp = self.exec_checked(opcode, |_| {}).await?;
        #[allow(clippy::cast_possible_wrap)]
        (rp.get(1).map(|&v| v as i8)).ok_or(Error::InvalidReturn { opcode })
    }

    /// `HCI_LE_Set_Event_Mask` ([Vol 4] Part E, Section 7.8.1).
    pub async fn le_set_event_mask(&self, mask: u64) -> Result<()> {
        (self.exec_checked(Opcode::LeSetEventMask, |p| {
            p.u64(mask);
        }))
        .await
        .map(|_| ())
    }

    /// `HCI_Set_Event_Mask` ([Vol 4] Part E, Section 7.3.1).
    pub async fn set_event_mask(&self, mask: u64) -> Result<()> {
        (self.exec_checked(Opcode::SetEventMask, |p| {
            p.u64(mask);
        }))
        .await
        .map(|_| ())
    }

    /// `HCI_Write_LE_Host_Support` ([Vol 4] Part E, Section 7.3.79).
    pub async fn write_le_host_support(&self, le: bool, simul: bool) -> Result<()> {
        (self.exec_checked(Opcode::WriteLeHostSupport, |p| {
            p.bool(le).bool(simul);
        }))
        .await
        .map(|_| ())
    }

    /// `HCI_Write_Class_Of_Device` ([Vol 4] Part E, Section 7.3.26).
    pub async fn write_class_of_device(&self, cod: u32) -> Result<()> {
        (self.exec_checked(Opcode::WriteClassOfDevice, |p| {
            p.put(&cod.to_le_bytes()[..3]);
        }))
        .await
        .map(|_| ())
    }

    /// `HCI_LE_Long_Term_Key_Request_Negative_Reply` ([Vol 4] Part E,
    /// Section 7.8.26).
    pub async fn le_long_term_key_request_negative_reply(
        &self,
        handle: ConnHandle,
    ) -> Result<()> {
        (self.exec_checked(Opcode::LeLongTermKeyRequestNegativeReply, |p| {
            p.u16(u16::from(handle));
        }))
        .await
        .map(|_| ())
    }

    /// `HCI_LE_Set_Advertising_Parameters` ([Vol 4] Part E, Section 7.8.5)
    /// for connectable undirected advertising.
    pub async fn le_set_advertising_parameters(
        &self,
        interval_min: u16,
        interval_max: u16,
    ) -> Result<()> {
        (self.exec_checked(Opcode::LeSetAdvertisingParameters, |p| {
            p.u16(interval_min)
                .u16(interval_max)
                .u8(0x00u8) // ADV_IND
                .u8(0x00u8) // Own address: public
                .u8(0x00u8) // Peer address type
                .put([0; 6]) // Peer address
                .u8(0x07u8) // All advertising channels
                .u8(0x00u8); // No filter policy
        }))
        .await
        .map(|_| ())
    }

    /// `HCI_LE_Set_Advertising_Data` ([Vol 4] Part E, Section 7.8.7). `data`
    /// must be at most 31 bytes; the packet is zero-padded.
    pub async fn le_set_advertising_data(&self, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 31);
        (self.exec_checked(Opcode::LeSetAdvertisingData, |p| {
            #[allow(clippy::cast_possible_truncation)]
            p.u8(data.len() as u8).put(data).put(&[0u8; 31][data.len()..]);
        }))
        .await
        .map(|_| ())
    }

    /// `HCI_LE_Set_Scan_Response_Data` ([Vol 4] Part E, Section 7.8.8).
    pub async fn le_set_scan_response_data(&self, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 31);
        (self.exec_checked(Opcode::LeSetScanResponseData, |p| {
            #[allow(clippy::cast_possible_truncation)]
            p.u8(data.len() as u8).put(data).put(&[0u8; 31][data.len()..]);
        }))
        .await
        .map(|_| ())
    }

    /// `HCI_LE_Set_Advertise_Enable` ([Vol 4] Part E, Section 7.8.9).
    pub async fn le_set_advertise_enable(&self, enable: bool) -> Result<()> {
        (self.exec_checked(Opcode::LeSetAdvertiseEnable, |p| {
            p.bool(enable);
        }))
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_grant_is_bounded() {
        let c = Commands::new();
        let mut sender = c.take_sender().unwrap();
        // Initial credit plus a grant far beyond the bound
        c.handle_complete(&[200, 0x00, 0x00]);
        let mut n = 0;
        while sender.credits.try_recv().is_ok() {
            n += 1;
        }
        assert_eq!(n, CMD_CREDITS_MAX);
    }

    #[test]
    fn nop_only_grants() {
        let c = Commands::new();
        let _sender = c.take_sender().unwrap();
        // NOP must not resolve or log an unknown opcode as a completion
        c.handle_complete(&[1, 0x00, 0x00]);
        assert!(c.inflight.lock().is_empty());
    }
}
