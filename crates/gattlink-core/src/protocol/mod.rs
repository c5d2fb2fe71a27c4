//! Protocol constants and the identifiers naming the logical channel.
//!
//! A channel is one GATT service with two characteristics:
//!
//! - **write**: the central writes chunks here, the peripheral receives them
//!   as write requests
//! - **indication**: the peripheral indicates chunks here, the central
//!   receives them as notifications

pub mod codec;
pub mod gate;

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// ATT MTU before any exchange took place.
pub const DEFAULT_MTU: u16 = 23;

/// MTU both roles ask for during negotiation.
pub const MTU_CANDIDATE: u16 = 512;

/// Opcode + handle bytes every ATT write/notification spends out of the MTU.
pub const ATT_HEADER_LEN: u16 = 3;

/// Client Characteristic Configuration descriptor (0x2902).
pub const CCC_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCC value switching indications on.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// The three identifiers that name a gattlink channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub service_id: Uuid,
    pub write_characteristic_id: Uuid,
    pub indication_characteristic_id: Uuid,
}

impl ServiceDescriptor {
    pub fn new(
        service_id: Uuid,
        write_characteristic_id: Uuid,
        indication_characteristic_id: Uuid,
    ) -> Self {
        Self {
            service_id,
            write_characteristic_id,
            indication_characteristic_id,
        }
    }

    /// Build a descriptor from the textual UUID form hosts usually hold.
    pub fn parse(
        service_id: &str,
        write_characteristic_id: &str,
        indication_characteristic_id: &str,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(
            parse_uuid(service_id)?,
            parse_uuid(write_characteristic_id)?,
            parse_uuid(indication_characteristic_id)?,
        ))
    }
}

fn parse_uuid(text: &str) -> Result<Uuid, TransportError> {
    Uuid::parse_str(text.trim()).map_err(|_| TransportError::InvalidUuid(text.to_string()))
}

/// A remote device as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralRef {
    pub identifier: String,
}

impl PeripheralRef {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    /// Addresses are compared case-insensitively, radios disagree on casing.
    pub fn matches(&self, identifier: &str) -> bool {
        self.identifier.eq_ignore_ascii_case(identifier)
    }
}

impl std::fmt::Display for PeripheralRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_descriptor() {
        let descriptor = ServiceDescriptor::parse(
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e",
            "6E400002-B5A3-F393-E0A9-E50E24DCCA9E",
            " 6e400003-b5a3-f393-e0a9-e50e24dcca9e ",
        )
        .unwrap();

        assert_eq!(
            descriptor.write_characteristic_id,
            Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e)
        );
        assert_eq!(
            descriptor.indication_characteristic_id.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = ServiceDescriptor::parse(
            "not-a-uuid",
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e",
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e",
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUuid(ref s) if s == "not-a-uuid"));
    }

    #[test]
    fn test_peripheral_ref_matches_ignoring_case() {
        let peer = PeripheralRef::new("AA:BB:CC:DD:EE:FF");
        assert!(peer.matches("aa:bb:cc:dd:ee:ff"));
        assert!(!peer.matches("AA:BB:CC:DD:EE:00"));
    }
}
