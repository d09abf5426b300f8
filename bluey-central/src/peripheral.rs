use serde::Serialize;

use crate::service::ServiceInfo;
use crate::Address;

/// The capability description delivered to the connect sink once service
/// discovery completes.
#[derive(Clone, Debug, Serialize)]
pub struct PeripheralInfo {
    pub address: Address,
    pub name: Option<String>,

    /// Last successfully read signal strength, if any
    pub rssi: Option<i16>,

    pub services: Vec<ServiceInfo>,
}

impl PeripheralInfo {
    pub fn service(&self, uuid: uuid::Uuid) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.uuid == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::{CharacteristicInfo, CharacteristicProperties};
    use crate::descriptor::CLIENT_CHARACTERISTIC_CONFIGURATION;
    use crate::uuid::uuid_from_u16;
    use std::str::FromStr;

    #[test]
    fn serializes_property_names() {
        let info = PeripheralInfo {
            address: Address::from_str("F1:E2:D3:C4:B5:A6").unwrap(),
            name: Some("Polar H10".to_string()),
            rssi: Some(-60),
            services: vec![ServiceInfo::new(uuid_from_u16(0x180d)).with_characteristic(
                CharacteristicInfo::new(uuid_from_u16(0x2a37), 0, CharacteristicProperties::NOTIFY)
                    .with_descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION))],
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["rssi"], -60);
        assert_eq!(json["services"][0]["characteristics"][0]["properties"][0], "Notify");
        assert_eq!(json["services"][0]["characteristics"][0]["descriptors"][0],
                   "00002902-0000-1000-8000-00805f9b34fb");
    }
}
