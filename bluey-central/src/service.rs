use serde::Serialize;
use uuid::Uuid;

use crate::characteristic::{CharacteristicInfo, CharacteristicProperties, WriteType};

/// A discovered GATT service and its characteristics.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, characteristics: vec![] }
    }

    pub fn with_characteristic(mut self, characteristic: CharacteristicInfo) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    // Some devices expose the same characteristic uuid more than once so
    // resolution scans them all and takes the first with a preferred
    // property before falling back to the first uuid match.
    fn find_preferring(&self, uuid: Uuid, preferences: &[CharacteristicProperties])
                       -> Option<&CharacteristicInfo> {
        let mut matching = self.characteristics.iter().filter(|c| c.uuid == uuid);
        for preferred in preferences {
            if let Some(found) = matching.clone().find(|c| c.properties.contains(*preferred)) {
                return Some(found);
            }
        }
        matching.next()
    }

    pub fn find_notify_characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.find_preferring(uuid, &[CharacteristicProperties::NOTIFY,
                                     CharacteristicProperties::INDICATE])
    }

    pub fn find_readable_characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.find_preferring(uuid, &[CharacteristicProperties::READ])
    }

    pub fn find_writable_characteristic(&self, uuid: Uuid, write_type: WriteType)
                                        -> Option<&CharacteristicInfo> {
        self.find_preferring(uuid, &[write_type.required_property()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::uuid_from_u16;

    fn duplicated_service() -> ServiceInfo {
        let uuid = uuid_from_u16(0x2a37);
        ServiceInfo::new(uuid_from_u16(0x180d))
            .with_characteristic(CharacteristicInfo::new(uuid, 1, CharacteristicProperties::WRITE))
            .with_characteristic(CharacteristicInfo::new(uuid, 2, CharacteristicProperties::INDICATE))
            .with_characteristic(CharacteristicInfo::new(uuid, 3, CharacteristicProperties::NOTIFY
                                                                  | CharacteristicProperties::READ))
    }

    #[test]
    fn notify_preferred_over_indicate() {
        let service = duplicated_service();
        let found = service.find_notify_characteristic(uuid_from_u16(0x2a37)).unwrap();
        assert_eq!(found.instance, 3);

        let mut without_notify = service.clone();
        without_notify.characteristics.pop();
        let found = without_notify.find_notify_characteristic(uuid_from_u16(0x2a37)).unwrap();
        assert_eq!(found.instance, 2);
    }

    #[test]
    fn falls_back_to_first_uuid_match() {
        let service = duplicated_service();
        let found = service.find_writable_characteristic(uuid_from_u16(0x2a37),
                                                         WriteType::WithoutResponse).unwrap();
        assert_eq!(found.instance, 1);
        let found = service.find_readable_characteristic(uuid_from_u16(0x2a37)).unwrap();
        assert_eq!(found.instance, 3);
        assert!(service.find_readable_characteristic(uuid_from_u16(0x2a38)).is_none());
    }
}
