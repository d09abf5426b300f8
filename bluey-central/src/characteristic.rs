use bitflags::bitflags;
use serde::{Serialize, Serializer};
use uuid::Uuid;

// NB: we don't use a Uuid as a unique key for a characteristic
// since it's possible for devices to expose the same characteristic
// (with the same uuid) multiple times, differentiated by an instance id
// that the platform assigns.

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

const PROPERTY_NAMES: [(CharacteristicProperties, &str); 8] = [
    (CharacteristicProperties::BROADCAST, "Broadcast"),
    (CharacteristicProperties::READ, "Read"),
    (CharacteristicProperties::WRITE_WITHOUT_RESPONSE, "WriteWithoutResponse"),
    (CharacteristicProperties::WRITE, "Write"),
    (CharacteristicProperties::NOTIFY, "Notify"),
    (CharacteristicProperties::INDICATE, "Indicate"),
    (CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES, "AuthenticateSignedWrites"),
    (CharacteristicProperties::EXTENDED_PROPERTIES, "ExtendedProperties"),
];

impl CharacteristicProperties {
    /// Human readable names for the standard property bits, in bit order.
    pub fn names(&self) -> Vec<&'static str> {
        PROPERTY_NAMES.iter()
                      .filter(|(flag, _)| self.contains(*flag))
                      .map(|(_, name)| *name)
                      .collect()
    }
}

impl Serialize for CharacteristicProperties {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl WriteType {
    pub(crate) fn required_property(&self) -> CharacteristicProperties {
        match self {
            WriteType::WithResponse => CharacteristicProperties::WRITE,
            WriteType::WithoutResponse => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        }
    }
}

/// Identifies one concrete characteristic on a connected peripheral.
///
/// The instance id disambiguates characteristics that share a UUID
/// within the same service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CharacteristicKey {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub instance: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub instance: u32,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Uuid>,
}

impl CharacteristicInfo {
    pub fn new(uuid: Uuid, instance: u32, properties: CharacteristicProperties) -> Self {
        Self { uuid, instance, properties, descriptors: vec![] }
    }

    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(uuid);
        self
    }

    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }

    pub(crate) fn key(&self, service: Uuid) -> CharacteristicKey {
        CharacteristicKey { service, characteristic: self.uuid, instance: self.instance }
    }
}

#[test]
fn property_names() {
    let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY
                | CharacteristicProperties::RELIABLE_WRITES;
    assert_eq!(props.names(), vec!["Read", "Notify"]);
    assert!(CharacteristicProperties::NONE.names().is_empty());
}
