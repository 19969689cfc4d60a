//! GATT client: discovery procedures and subscriptions against a remote
//! peripheral ([Vol 3] Part G, Section 4).

use std::collections::HashMap;

use tracing::debug;

use crate::att::{Client, ErrorCode};
use crate::l2cap::Conn;
use crate::SyncMutex;

use super::*;

/// CCCD subscription bits, as written by the client.
const NOTIFY_BIT: u16 = 0x0001;
const INDICATE_BIT: u16 = 0x0002;

/// A remote GATT peripheral reached through an ATT client.
#[derive(Debug)]
pub struct Peripheral {
    client: Client,
    subs: Arc<Subscriptions>,
}

/// A primary service discovered on the remote peripheral.
#[derive(Clone, Copy, Debug)]
pub struct RemoteService {
    pub uuid: Uuid,
    /// Declaration handle.
    pub start: u16,
    /// Last handle in the service group.
    pub end: u16,
}

/// A characteristic discovered within a remote service.
#[derive(Clone, Copy, Debug)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    pub props: Prop,
    /// Declaration handle.
    pub decl: u16,
    /// Value attribute handle.
    pub value: u16,
    /// Last handle belonging to this characteristic.
    pub end: u16,
    /// CCCD handle, filled in by descriptor discovery.
    pub cccd: Option<u16>,
}

/// A descriptor discovered within a remote characteristic.
#[derive(Clone, Copy, Debug)]
pub struct RemoteDescriptor {
    pub uuid: Uuid,
    pub handle: u16,
}

/// Callback receiving subscribed value updates.
pub type ValueCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct Subscriptions(SyncMutex<HashMap<(u16, bool), ValueCallback>>);

impl att::NotificationSink for Subscriptions {
    fn handle(&self, value_handle: u16, indicate: bool, value: &[u8]) {
        let cb = self.0.lock().get(&(value_handle, indicate)).cloned();
        match cb {
            Some(cb) => cb(value),
            None => debug!("no subscriber for {value_handle:#06X}"),
        }
    }
}

impl Peripheral {
    /// Creates a GATT client over an accepted connection.
    #[must_use]
    pub fn new(conn: Arc<Conn>) -> Self {
        let client = Client::new(conn);
        let subs = Arc::new(Subscriptions::default());
        let sink = Arc::clone(&subs);
        client.set_notification_sink(move |h: u16, ind: bool, v: &[u8]| {
            att::NotificationSink::handle(&*sink, h, ind, v);
        });
        Self { client, subs }
    }

    /// Negotiates the ATT MTU ([Vol 3] Part G, Section 4.3.1).
    pub async fn exchange_mtu(&self, mtu: u16) -> Result<u16> {
        Ok(self.client.exchange_mtu(mtu).await?)
    }

    /// Discovers all primary services ([Vol 3] Part G, Section 4.4.1).
    pub async fn discover_services(&self) -> Result<Vec<RemoteService>> {
        let mut svcs = Vec::new();
        let mut start = 0x0001u16;
        'outer: loop {
            let records = match (self.client)
                .read_by_group_type(start, 0xFFFF, Uuid::PRIMARY_SERVICE)
                .await
            {
                Ok(r) => r,
                Err(att::Error::Rsp(e)) if e.err == ErrorCode::AttributeNotFound => break,
                Err(e) => return Err(e.into()),
            };
            if records.is_empty() {
                break;
            }
            for (h, end, value) in records {
                let Some(uuid) = Uuid::from_le_bytes(&value) else { continue };
                svcs.push(RemoteService {
                    uuid,
                    start: h,
                    end,
                });
                if end == 0xFFFF {
                    break 'outer;
                }
                start = end + 1;
            }
        }
        Ok(svcs)
    }

    /// Discovers the characteristics of `svc`
    /// ([Vol 3] Part G, Section 4.6.1).
    pub async fn discover_characteristics(
        &self,
        svc: &RemoteService,
    ) -> Result<Vec<RemoteCharacteristic>> {
        let mut chars: Vec<RemoteCharacteristic> = Vec::new();
        let mut start = svc.start;
        while start <= svc.end {
            let records = match (self.client)
                .read_by_type(start, svc.end, Uuid::CHARACTERISTIC)
                .await
            {
                Ok(r) => r,
                Err(att::Error::Rsp(e)) if e.err == ErrorCode::AttributeNotFound => break,
                Err(e) => return Err(e.into()),
            };
            if records.is_empty() {
                break;
            }
            for (decl, value) in records {
                // Declaration value: properties, value handle, UUID
                if value.len() < 5 {
                    continue;
                }
                let props = Prop::from_bits_retain(value[0]);
                let vh = u16::from_le_bytes([value[1], value[2]]);
                let Some(uuid) = Uuid::from_le_bytes(&value[3..]) else { continue };
                // The previous characteristic ends where this one begins
                if let Some(last) = chars.last_mut() {
                    last.end = decl - 1;
                }
                chars.push(RemoteCharacteristic {
                    uuid,
                    props,
                    decl,
                    value: vh,
                    end: svc.end,
                    cccd: None,
                });
                start = vh.saturating_add(1);
                if start == 0 {
                    break;
                }
            }
        }
        Ok(chars)
    }

    /// Discovers the descriptors of `chr`, recording its CCCD
    /// ([Vol 3] Part G, Section 4.7.1).
    pub async fn discover_descriptors(
        &self,
        chr: &mut RemoteCharacteristic,
    ) -> Result<Vec<RemoteDescriptor>> {
        let mut descs = Vec::new();
        let mut start = chr.value.saturating_add(1);
        while start != 0 && start <= chr.end {
            let records = match self.client.find_information(start, chr.end).await {
                Ok(r) => r,
                Err(att::Error::Rsp(e)) if e.err == ErrorCode::AttributeNotFound => break,
                Err(e) => return Err(e.into()),
            };
            if records.is_empty() {
                break;
            }
            for (handle, uuid) in records {
                if uuid == Uuid::CLIENT_CHARACTERISTIC_CONFIGURATION {
                    chr.cccd = Some(handle);
                }
                descs.push(RemoteDescriptor { uuid, handle });
                start = handle.saturating_add(1);
            }
            if start == 0 {
                break;
            }
        }
        Ok(descs)
    }

    /// Reads the value of a characteristic.
    pub async fn read_characteristic(&self, chr: &RemoteCharacteristic) -> Result<Vec<u8>> {
        Ok(self.client.read(chr.value).await?)
    }

    /// Writes the value of a characteristic, with or without response.
    pub async fn write_characteristic(
        &self,
        chr: &RemoteCharacteristic,
        value: &[u8],
        no_rsp: bool,
    ) -> Result<()> {
        if no_rsp {
            Ok(self.client.write_cmd(chr.value, value).await?)
        } else {
            Ok(self.client.write(chr.value, value).await?)
        }
    }

    /// Reads the value of a descriptor.
    pub async fn read_descriptor(&self, d: &RemoteDescriptor) -> Result<Vec<u8>> {
        Ok(self.client.read(d.handle).await?)
    }

    /// Writes the value of a descriptor.
    pub async fn write_descriptor(&self, d: &RemoteDescriptor, value: &[u8]) -> Result<()> {
        Ok(self.client.write(d.handle, value).await?)
    }

    /// Subscribes to notifications or indications from `chr`, routing value
    /// updates to `f`. Descriptor discovery must have found a CCCD.
    pub async fn subscribe(
        &self,
        chr: &RemoteCharacteristic,
        indicate: bool,
        f: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<()> {
        let cccd = chr.cccd.ok_or(Error::NoCccd)?;
        let bit = if indicate { INDICATE_BIT } else { NOTIFY_BIT };
        (self.subs.0.lock()).insert((chr.value, indicate), Arc::new(f));
        self.client.write(cccd, &bit.to_le_bytes()).await?;
        Ok(())
    }

    /// Unsubscribes from `chr` and clears its CCCD.
    pub async fn unsubscribe(&self, chr: &RemoteCharacteristic, indicate: bool) -> Result<()> {
        let cccd = chr.cccd.ok_or(Error::NoCccd)?;
        self.client.write(cccd, &0u16.to_le_bytes()).await?;
        self.subs.0.lock().remove(&(chr.value, indicate));
        Ok(())
    }

    /// Returns the underlying ATT client.
    #[inline]
    #[must_use]
    pub const fn att(&self) -> &Client {
        &self.client
    }
}

impl Debug for Subscriptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Subscriptions"))
            .field("active", &self.0.lock().len())
            .finish()
    }
}
