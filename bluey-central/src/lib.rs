//! Per-peripheral session management for a single remote BLE device.
//!
//! A [`Session`](session::Session) owns the physical GATT connection to one
//! peripheral, serializes GATT operations (the radio stack only permits one
//! outstanding request at a time), turns notification callbacks into value
//! streams and runs any number of independent L2CAP-style byte channels
//! alongside the GATT traffic.
//!
//! The platform radio stack itself is injected via the [`backend::Backend`]
//! trait.

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod uuid;

pub mod backend;

pub mod pending;

pub mod characteristic;
pub mod descriptor;
pub mod service;

pub mod peripheral;

mod channel;
mod command;
mod connection;
mod notification;

pub mod session;

pub mod fake;

pub use channel::OpenedChannel;
pub use connection::{ConnectionState, RetryPolicy};
pub use notification::Notification;
pub use session::{Session, SessionConfig};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// A backend-specific unique identifier for a remote device
///
/// The underlying hardware MAC address is used where the platform exposes
/// it, otherwise an opaque platform string (e.g. a CoreBluetooth UUID).
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "{}", mac)
            }
            Address::String(s) => {
                write!(f, "{}", s)
            }
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "MAC:{}", mac)
            }
            Address::String(s) => {
                write!(f, "String:{}", s)
            }
        }
    }
}

// Returns None for anything that isn't a colon separated, 6 octet address
// (which is expected for opaque platform ids) so there's no allocation on
// that path.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if !s.contains(':') {
        return None;
    }
    let mut parts = ArrayVec::<_, 6>::new();
    for part in s.split(':') {
        if parts.try_push(part).is_err() {
            return None;
        }
    }
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, part) in parts.iter().enumerate() {
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

#[test]
fn mac_two_way() {
    let addr = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(addr, Address::MAC(_)));
    // Octets are formatted as uppercase since platforms (Android notably)
    // are particular about this when looking devices up by address
    assert_eq!(addr.to_string(), "F1:E2:D3:C4:B5:A6");

    let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(addr, Address::String(_)));
    assert_eq!(addr.to_string(), "18c2a267-a539-4423-aecc-edeeb2784bcc");

    let addr = Address::from_str("F1:E2:D3:C4:B5").unwrap();
    assert!(matches!(addr, Address::String(_)));
}

/// A raw status code reported by the platform GATT stack for a completed
/// operation or a disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);

    /// The catch-all `GATT_ERROR` status. On disconnect this is empirically
    /// associated with link-layer races that resolve on an immediate retry.
    pub const GATT_ERROR: GattStatus = GattStatus(133);

    pub fn is_success(&self) -> bool {
        *self == GattStatus::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found.")]
    NotFound(String),

    #[error("{0}")]
    NotConnected(String),

    #[error("BluetoothGatt is null")]
    NoConnection,

    #[error("{operation} failed, status={status}")]
    OperationFailed {
        operation: String,
        status: GattStatus,
    },

    #[error("{address}: {reason}")]
    LinkLost {
        address: Address,
        reason: String,
    },

    #[error("L2CAP PSM {psm}: {reason}")]
    ChannelClosed {
        psm: u16,
        reason: String,
    },

    #[error("L2CAP write failed")]
    ChannelIo(#[source] std::io::Error),

    #[error("The system doesn't support this request / operation")]
    Unsupported,

    #[error("The session dropped this request without a result")]
    SessionClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn operation_failed(operation: impl Into<String>, status: GattStatus) -> Self {
        Error::OperationFailed {
            operation: operation.into(),
            status,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
