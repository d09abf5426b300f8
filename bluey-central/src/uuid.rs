use uuid::Uuid;

use crate::{Error, Result};

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

pub trait BluetoothUuid {
    fn as_u16(&self) -> Option<u16>;
    fn as_u32(&self) -> Option<u32>;
    fn from_u16(v: u16) -> Uuid;
    fn from_u32(v: u32) -> Uuid;

    /// Formats the UUID in its 16-bit short form (e.g. `"2902"`) if it's
    /// derived from the Bluetooth base UUID, or the full hyphenated form
    /// otherwise.
    fn to_short_string(&self) -> String;
}

impl BluetoothUuid for Uuid {
    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_32 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn from_u16(v: u16) -> Uuid {
        uuid_from_u16(v)
    }

    fn from_u32(v: u32) -> Uuid {
        uuid_from_u32(v)
    }

    fn to_short_string(&self) -> String {
        match self.as_u16() {
            Some(short) => format!("{:04x}", short),
            None => self.to_hyphenated().to_string(),
        }
    }
}

// It's useful to have const functions so apps can declare const Uuids but
// unfortunately we can't have const functions in traits yet

pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}
pub const fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// Parses either a 16-bit short form UUID (`"180d"`) or a full UUID string.
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    if s.len() == 4 {
        let short = u16::from_str_radix(s, 16)
            .map_err(|err| Error::Other(anyhow::anyhow!("Invalid short UUID {}: {}", s, err)))?;
        return Ok(uuid_from_u16(short));
    }
    Uuid::parse_str(s).map_err(|err| Error::Other(anyhow::anyhow!("Invalid UUID {}: {}", s, err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_round_trip() {
        let cccd = parse_uuid("2902").unwrap();
        assert_eq!(cccd.as_u16(), Some(0x2902));
        assert_eq!(cccd.to_short_string(), "2902");
        assert_eq!(cccd,
                   parse_uuid("00002902-0000-1000-8000-00805F9B34FB").unwrap());
    }

    #[test]
    fn custom_uuid_keeps_long_form() {
        let s = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
        let uuid = parse_uuid(s).unwrap();
        assert_eq!(uuid.as_u16(), None);
        assert_eq!(uuid.to_short_string(), s);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_uuid("zz01").is_err());
        assert!(parse_uuid("not-a-uuid").is_err());
    }
}
