//! The seam between a [`Session`](crate::Session) and the platform radio
//! stack.
//!
//! A [`Backend`] creates GATT links and opens channel streams. GATT
//! operations issued through a [`GattLink`] only report whether the
//! request could be submitted; their completions arrive later as
//! [`BackendEvent`]s on the link's event bus, in the same way a platform
//! GATT callback object would deliver them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::characteristic::{CharacteristicKey, WriteType};
use crate::service::ServiceInfo;
use crate::{Address, GattStatus, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

#[derive(Clone, Debug)]
pub enum BackendEvent {
    Connected,
    Disconnected {
        status: GattStatus,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        target: CharacteristicKey,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        target: CharacteristicKey,
        status: GattStatus,
    },
    CharacteristicChanged {
        target: CharacteristicKey,
        value: Vec<u8>,
    },
    DescriptorWritten {
        target: CharacteristicKey,
        descriptor: Uuid,
        status: GattStatus,
    },
    RssiRead {
        rssi: i16,
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
}

/// The sending end of the backend bus handed to each new GATT link.
///
/// Every link gets a fresh generation so that any late events from a
/// link that has since been replaced can be recognised and ignored.
#[derive(Clone, Debug)]
pub struct LinkEvents {
    generation: u64,
    bus: mpsc::UnboundedSender<(u64, BackendEvent)>,
}

impl LinkEvents {
    pub(crate) fn new(generation: u64, bus: mpsc::UnboundedSender<(u64, BackendEvent)>) -> Self {
        Self { generation, bus }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session has gone away.
    pub fn send(&self, event: BackendEvent) -> bool {
        self.bus.send((self.generation, event)).is_ok()
    }
}

pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

impl fmt::Debug for dyn ChannelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelStream")
    }
}

#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Starts establishing a GATT connection; `BackendEvent::Connected`
    /// or `BackendEvent::Disconnected` follow on `events`.
    fn connect_gatt(&self, address: &Address, auto_connect: bool, events: LinkEvents)
                    -> Result<Arc<dyn GattLink>>;

    /// Opens a connection-oriented channel, secure or unauthenticated.
    async fn open_channel(&self, address: &Address, psm: u16, secure: bool)
                          -> Result<Box<dyn ChannelStream>>;
}

/// One physical GATT connection.
///
/// At most one request may be outstanding at a time; callers are expected
/// to wait for the completion event before issuing the next one.
pub trait GattLink: Send + Sync + fmt::Debug {
    fn discover_services(&self) -> Result<()>;

    /// The attribute table found by the last successful discovery
    fn services(&self) -> Vec<ServiceInfo>;

    fn read_characteristic(&self, target: &CharacteristicKey) -> Result<()>;
    fn write_characteristic(&self, target: &CharacteristicKey, value: &[u8], write_type: WriteType)
                            -> Result<()>;

    /// Enables or disables local delivery of value changes. This completes
    /// synchronously, there's no matching event.
    fn set_characteristic_notification(&self, target: &CharacteristicKey, enable: bool)
                                       -> Result<()>;

    fn write_descriptor(&self, target: &CharacteristicKey, descriptor: Uuid, value: &[u8])
                        -> Result<()>;

    fn read_remote_rssi(&self) -> Result<()>;
    fn request_mtu(&self, mtu: u16) -> Result<()>;
    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()>;

    /// Drops any cached attribute table so the next discovery starts afresh.
    fn refresh(&self) -> Result<()>;

    fn disconnect(&self);

    /// Releases the link. No further events are expected after this.
    fn close(&self);
}
