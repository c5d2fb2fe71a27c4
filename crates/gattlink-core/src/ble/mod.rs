//! Radio stack seam
//!
//! The link state machines never touch a Bluetooth stack directly. They call
//! into [`CentralRadio`] / [`PeripheralRadio`], whose methods only *request*
//! an operation; the outcome comes back later as a [`CentralRadioEvent`] or
//! [`PeripheralRadioEvent`] on the channel handed to the role driver.
//!
//! # Backends
//!
//! - [`client::BtleplugCentral`]: central role over btleplug
//! - [`server::BluerPeripheral`]: peripheral role over BlueZ (bluer)
//! - [`crate::mock`]: in-memory radios for tests and the loopback demo

pub mod client;
pub mod server;

use crate::protocol::ServiceDescriptor;
use uuid::Uuid;

pub use client::BtleplugCentral;
pub use server::BluerPeripheral;

/// Failure reported by a radio backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("GATT operation failed with status {0}")]
    Status(u16),

    #[error("radio backend has shut down")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

impl From<btleplug::Error> for RadioError {
    fn from(e: btleplug::Error) -> Self {
        RadioError::Backend(e.to_string())
    }
}

impl From<bluer::Error> for RadioError {
    fn from(e: bluer::Error) -> Self {
        RadioError::Backend(e.to_string())
    }
}

/// A primary service found on the remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Requests the central state machine issues to the radio.
pub trait CentralRadio: Send {
    fn start_scan(&mut self, service: Option<Uuid>) -> Result<(), RadioError>;

    fn stop_scan(&mut self) -> Result<(), RadioError>;

    /// Open a physical link; answered by `Connected` or `Disconnected`.
    fn connect(&mut self, identifier: &str) -> Result<(), RadioError>;

    fn disconnect(&mut self, identifier: &str) -> Result<(), RadioError>;

    /// Answered by `ServicesDiscovered`.
    fn discover_services(&mut self, identifier: &str) -> Result<(), RadioError>;

    /// A failure is reported as `IndicationSetupFailed`.
    fn enable_notifications(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
    ) -> Result<(), RadioError>;

    /// Answered by `MtuChanged`.
    fn request_mtu(&mut self, identifier: &str, candidate: u16) -> Result<(), RadioError>;

    /// A failure is reported as `IndicationSetupFailed`.
    fn write_descriptor(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError>;

    /// Answered by `WriteCompleted`.
    fn write_characteristic(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        value: &[u8],
        response_needed: bool,
    ) -> Result<(), RadioError>;
}

/// Callbacks delivered to the central state machine, in radio order.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralRadioEvent {
    Discovered {
        identifier: String,
    },
    Connected {
        identifier: String,
    },
    Disconnected {
        identifier: String,
    },
    ServicesDiscovered {
        identifier: String,
        result: Result<Vec<GattService>, RadioError>,
    },
    MtuChanged {
        identifier: String,
        result: Result<u16, RadioError>,
    },
    WriteCompleted {
        identifier: String,
        result: Result<(), RadioError>,
    },
    /// Subscribing to the indication characteristic or writing its CCC
    /// descriptor failed.
    IndicationSetupFailed {
        identifier: String,
        error: RadioError,
    },
    Notification {
        identifier: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Requests the peripheral state machine issues to the radio.
pub trait PeripheralRadio: Send {
    /// Register the GATT service (write + indication characteristics).
    fn publish_service(&mut self, service: &ServiceDescriptor) -> Result<(), RadioError>;

    /// Answered by `AdvertisingStarted`.
    fn start_advertising(&mut self, service_id: Uuid) -> Result<(), RadioError>;

    fn stop_advertising(&mut self) -> Result<(), RadioError>;

    /// Acknowledge a write request.
    fn send_response(
        &mut self,
        identifier: &str,
        request_id: u32,
        offset: u16,
        value: &[u8],
    ) -> Result<(), RadioError>;

    /// Answered by `NotificationSent`.
    fn send_indication(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError>;

    /// Open the role-reversed client link used only to exchange the MTU.
    /// Answered by `MtuLinkConnected` or `MtuLinkFailed`.
    fn open_mtu_link(&mut self, identifier: &str) -> Result<(), RadioError>;

    /// Answered by `MtuLinkChanged`.
    fn request_link_mtu(&mut self, identifier: &str, candidate: u16) -> Result<(), RadioError>;

    fn close_mtu_link(&mut self, identifier: &str) -> Result<(), RadioError>;

    /// Drop the connected client.
    fn disconnect_client(&mut self, identifier: &str) -> Result<(), RadioError>;
}

/// Callbacks delivered to the peripheral state machine, in radio order.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralRadioEvent {
    AdvertisingStarted {
        result: Result<(), RadioError>,
    },
    ClientConnected {
        identifier: String,
    },
    ClientDisconnected {
        identifier: String,
    },
    WriteRequest {
        identifier: String,
        request_id: u32,
        characteristic: Uuid,
        offset: u16,
        value: Vec<u8>,
        response_needed: bool,
    },
    ExecuteWrite {
        identifier: String,
        request_id: u32,
    },
    NotificationSent {
        identifier: String,
        result: Result<(), RadioError>,
    },
    MtuLinkConnected {
        identifier: String,
    },
    MtuLinkFailed {
        identifier: String,
        error: RadioError,
    },
    MtuLinkChanged {
        identifier: String,
        result: Result<u16, RadioError>,
    },
}
