//! In-memory radios
//!
//! [`MockCentralRadio`] and [`MockPeripheralRadio`] record every request and
//! never answer; tests feed the radio events by hand. [`LoopbackAir`] joins a
//! central and a peripheral radio so that two role tasks can talk to each
//! other without hardware.

use log::trace;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::{
    CentralRadio, CentralRadioEvent, GattService, PeripheralRadio, PeripheralRadioEvent,
    RadioError,
};
use crate::protocol::ServiceDescriptor;

/// Address the loopback central reports to the peripheral.
pub const LOOPBACK_CENTRAL: &str = "00:00:00:00:00:01";
/// Address the loopback peripheral is discovered under.
pub const LOOPBACK_PERIPHERAL: &str = "00:00:00:00:00:02";

/// Everything queued on `rx` right now.
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCall {
    StartScan(Option<Uuid>),
    StopScan,
    Connect(String),
    Disconnect(String),
    DiscoverServices(String),
    EnableNotifications(String, Uuid),
    RequestMtu(String, u16),
    WriteDescriptor {
        identifier: String,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Write {
        identifier: String,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
}

/// Central radio that only records.
#[derive(Debug)]
pub struct MockCentralRadio {
    calls: mpsc::UnboundedSender<CentralCall>,
}

impl MockCentralRadio {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CentralCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Self { calls }, rx)
    }

    fn record(&self, call: CentralCall) -> Result<(), RadioError> {
        self.calls.send(call).map_err(|_| RadioError::Closed)
    }
}

impl CentralRadio for MockCentralRadio {
    fn start_scan(&mut self, service: Option<Uuid>) -> Result<(), RadioError> {
        self.record(CentralCall::StartScan(service))
    }

    fn stop_scan(&mut self) -> Result<(), RadioError> {
        self.record(CentralCall::StopScan)
    }

    fn connect(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.record(CentralCall::Connect(identifier.to_string()))
    }

    fn disconnect(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.record(CentralCall::Disconnect(identifier.to_string()))
    }

    fn discover_services(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.record(CentralCall::DiscoverServices(identifier.to_string()))
    }

    fn enable_notifications(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        self.record(CentralCall::EnableNotifications(
            identifier.to_string(),
            characteristic,
        ))
    }

    fn request_mtu(&mut self, identifier: &str, candidate: u16) -> Result<(), RadioError> {
        self.record(CentralCall::RequestMtu(identifier.to_string(), candidate))
    }

    fn write_descriptor(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.record(CentralCall::WriteDescriptor {
            identifier: identifier.to_string(),
            characteristic,
            descriptor,
            value: value.to_vec(),
        })
    }

    fn write_characteristic(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        value: &[u8],
        response_needed: bool,
    ) -> Result<(), RadioError> {
        self.record(CentralCall::Write {
            identifier: identifier.to_string(),
            characteristic,
            value: value.to_vec(),
            response_needed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    PublishService(ServiceDescriptor),
    StartAdvertising(Uuid),
    StopAdvertising,
    SendResponse {
        identifier: String,
        request_id: u32,
        offset: u16,
        value: Vec<u8>,
    },
    SendIndication {
        identifier: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    OpenMtuLink(String),
    RequestLinkMtu(String, u16),
    CloseMtuLink(String),
    DisconnectClient(String),
}

/// Peripheral radio that only records.
#[derive(Debug)]
pub struct MockPeripheralRadio {
    calls: mpsc::UnboundedSender<PeripheralCall>,
}

impl MockPeripheralRadio {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeripheralCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Self { calls }, rx)
    }

    fn record(&self, call: PeripheralCall) -> Result<(), RadioError> {
        self.calls.send(call).map_err(|_| RadioError::Closed)
    }
}

impl PeripheralRadio for MockPeripheralRadio {
    fn publish_service(&mut self, service: &ServiceDescriptor) -> Result<(), RadioError> {
        self.record(PeripheralCall::PublishService(*service))
    }

    fn start_advertising(&mut self, service_id: Uuid) -> Result<(), RadioError> {
        self.record(PeripheralCall::StartAdvertising(service_id))
    }

    fn stop_advertising(&mut self) -> Result<(), RadioError> {
        self.record(PeripheralCall::StopAdvertising)
    }

    fn send_response(
        &mut self,
        identifier: &str,
        request_id: u32,
        offset: u16,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.record(PeripheralCall::SendResponse {
            identifier: identifier.to_string(),
            request_id,
            offset,
            value: value.to_vec(),
        })
    }

    fn send_indication(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.record(PeripheralCall::SendIndication {
            identifier: identifier.to_string(),
            characteristic,
            value: value.to_vec(),
        })
    }

    fn open_mtu_link(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.record(PeripheralCall::OpenMtuLink(identifier.to_string()))
    }

    fn request_link_mtu(&mut self, identifier: &str, candidate: u16) -> Result<(), RadioError> {
        self.record(PeripheralCall::RequestLinkMtu(
            identifier.to_string(),
            candidate,
        ))
    }

    fn close_mtu_link(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.record(PeripheralCall::CloseMtuLink(identifier.to_string()))
    }

    fn disconnect_client(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.record(PeripheralCall::DisconnectClient(identifier.to_string()))
    }
}

/// Shared medium of a loopback pair.
#[derive(Debug)]
struct Air {
    mtu: u16,
    central_tx: mpsc::UnboundedSender<CentralRadioEvent>,
    peripheral_tx: mpsc::UnboundedSender<PeripheralRadioEvent>,
    service: Option<ServiceDescriptor>,
    advertising: Option<Uuid>,
    scanning: Option<Option<Uuid>>,
    connected: bool,
    next_request_id: u32,
    awaiting_response: HashSet<u32>,
}

impl Air {
    fn to_central(&self, event: CentralRadioEvent) {
        trace!("air -> central: {:?}", event);
        let _ = self.central_tx.send(event);
    }

    fn to_peripheral(&self, event: PeripheralRadioEvent) {
        trace!("air -> peripheral: {:?}", event);
        let _ = self.peripheral_tx.send(event);
    }

    /// Report the peripheral to a scanning central if the filter allows it.
    fn announce(&self) {
        let (Some(filter), Some(advertised)) = (self.scanning, self.advertising) else {
            return;
        };
        if filter.is_none_or(|wanted| wanted == advertised) {
            self.to_central(CentralRadioEvent::Discovered {
                identifier: LOOPBACK_PERIPHERAL.to_string(),
            });
        }
    }

    fn require_link(&self, identifier: &str, expected: &str) -> Result<(), RadioError> {
        if !self.connected {
            return Err(RadioError::Closed);
        }
        if !identifier.eq_ignore_ascii_case(expected) {
            return Err(RadioError::UnknownDevice(identifier.to_string()));
        }
        Ok(())
    }

    fn drop_link(&mut self) {
        if self.connected {
            self.connected = false;
            self.awaiting_response.clear();
            self.to_central(CentralRadioEvent::Disconnected {
                identifier: LOOPBACK_PERIPHERAL.to_string(),
            });
            self.to_peripheral(PeripheralRadioEvent::ClientDisconnected {
                identifier: LOOPBACK_CENTRAL.to_string(),
            });
        }
    }
}

/// One central and one peripheral joined in memory.
pub struct LoopbackAir {
    pub central: LoopbackCentral,
    pub central_events: mpsc::UnboundedReceiver<CentralRadioEvent>,
    pub peripheral: LoopbackPeripheral,
    pub peripheral_events: mpsc::UnboundedReceiver<PeripheralRadioEvent>,
}

impl LoopbackAir {
    /// `mtu` is the largest ATT MTU either side will agree to.
    pub fn new(mtu: u16) -> Self {
        let (central_tx, central_events) = mpsc::unbounded_channel();
        let (peripheral_tx, peripheral_events) = mpsc::unbounded_channel();
        let air = Arc::new(Mutex::new(Air {
            mtu,
            central_tx,
            peripheral_tx,
            service: None,
            advertising: None,
            scanning: None,
            connected: false,
            next_request_id: 0,
            awaiting_response: HashSet::new(),
        }));
        Self {
            central: LoopbackCentral { air: air.clone() },
            central_events,
            peripheral: LoopbackPeripheral { air },
            peripheral_events,
        }
    }
}

fn lock(air: &Mutex<Air>) -> MutexGuard<'_, Air> {
    air.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LoopbackCentral {
    air: Arc<Mutex<Air>>,
}

impl CentralRadio for LoopbackCentral {
    fn start_scan(&mut self, service: Option<Uuid>) -> Result<(), RadioError> {
        let mut air = lock(&self.air);
        air.scanning = Some(service);
        air.announce();
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), RadioError> {
        lock(&self.air).scanning = None;
        Ok(())
    }

    fn connect(&mut self, identifier: &str) -> Result<(), RadioError> {
        let mut air = lock(&self.air);
        if air.connected
            || air.advertising.is_none()
            || !identifier.eq_ignore_ascii_case(LOOPBACK_PERIPHERAL)
        {
            // a failed connect shows up as a disconnect, like on real stacks
            air.to_central(CentralRadioEvent::Disconnected {
                identifier: identifier.to_string(),
            });
            return Ok(());
        }
        air.connected = true;
        air.to_central(CentralRadioEvent::Connected {
            identifier: identifier.to_string(),
        });
        air.to_peripheral(PeripheralRadioEvent::ClientConnected {
            identifier: LOOPBACK_CENTRAL.to_string(),
        });
        Ok(())
    }

    fn disconnect(&mut self, identifier: &str) -> Result<(), RadioError> {
        let mut air = lock(&self.air);
        air.require_link(identifier, LOOPBACK_PERIPHERAL)?;
        air.drop_link();
        Ok(())
    }

    fn discover_services(&mut self, identifier: &str) -> Result<(), RadioError> {
        let air = lock(&self.air);
        air.require_link(identifier, LOOPBACK_PERIPHERAL)?;
        let services = air
            .service
            .map(|s| GattService {
                uuid: s.service_id,
                characteristics: vec![s.write_characteristic_id, s.indication_characteristic_id],
            })
            .into_iter()
            .collect();
        air.to_central(CentralRadioEvent::ServicesDiscovered {
            identifier: identifier.to_string(),
            result: Ok(services),
        });
        Ok(())
    }

    fn enable_notifications(
        &mut self,
        identifier: &str,
        _characteristic: Uuid,
    ) -> Result<(), RadioError> {
        lock(&self.air).require_link(identifier, LOOPBACK_PERIPHERAL)
    }

    fn request_mtu(&mut self, identifier: &str, candidate: u16) -> Result<(), RadioError> {
        let air = lock(&self.air);
        air.require_link(identifier, LOOPBACK_PERIPHERAL)?;
        air.to_central(CentralRadioEvent::MtuChanged {
            identifier: identifier.to_string(),
            result: Ok(candidate.min(air.mtu)),
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        identifier: &str,
        _characteristic: Uuid,
        _descriptor: Uuid,
        _value: &[u8],
    ) -> Result<(), RadioError> {
        lock(&self.air).require_link(identifier, LOOPBACK_PERIPHERAL)
    }

    fn write_characteristic(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        value: &[u8],
        response_needed: bool,
    ) -> Result<(), RadioError> {
        let mut air = lock(&self.air);
        air.require_link(identifier, LOOPBACK_PERIPHERAL)?;
        air.next_request_id = air.next_request_id.wrapping_add(1);
        let request_id = air.next_request_id;
        air.to_peripheral(PeripheralRadioEvent::WriteRequest {
            identifier: LOOPBACK_CENTRAL.to_string(),
            request_id,
            characteristic,
            offset: 0,
            value: value.to_vec(),
            response_needed,
        });
        if response_needed {
            air.awaiting_response.insert(request_id);
        } else {
            air.to_central(CentralRadioEvent::WriteCompleted {
                identifier: identifier.to_string(),
                result: Ok(()),
            });
        }
        Ok(())
    }
}

pub struct LoopbackPeripheral {
    air: Arc<Mutex<Air>>,
}

impl PeripheralRadio for LoopbackPeripheral {
    fn publish_service(&mut self, service: &ServiceDescriptor) -> Result<(), RadioError> {
        lock(&self.air).service = Some(*service);
        Ok(())
    }

    fn start_advertising(&mut self, service_id: Uuid) -> Result<(), RadioError> {
        let mut air = lock(&self.air);
        air.advertising = Some(service_id);
        air.to_peripheral(PeripheralRadioEvent::AdvertisingStarted { result: Ok(()) });
        air.announce();
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), RadioError> {
        lock(&self.air).advertising = None;
        Ok(())
    }

    fn send_response(
        &mut self,
        _identifier: &str,
        request_id: u32,
        _offset: u16,
        _value: &[u8],
    ) -> Result<(), RadioError> {
        let mut air = lock(&self.air);
        if air.awaiting_response.remove(&request_id) {
            air.to_central(CentralRadioEvent::WriteCompleted {
                identifier: LOOPBACK_PERIPHERAL.to_string(),
                result: Ok(()),
            });
        }
        Ok(())
    }

    fn send_indication(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let air = lock(&self.air);
        air.require_link(identifier, LOOPBACK_CENTRAL)?;
        air.to_central(CentralRadioEvent::Notification {
            identifier: LOOPBACK_PERIPHERAL.to_string(),
            characteristic,
            value: value.to_vec(),
        });
        air.to_peripheral(PeripheralRadioEvent::NotificationSent {
            identifier: identifier.to_string(),
            result: Ok(()),
        });
        Ok(())
    }

    fn open_mtu_link(&mut self, identifier: &str) -> Result<(), RadioError> {
        let air = lock(&self.air);
        air.require_link(identifier, LOOPBACK_CENTRAL)?;
        air.to_peripheral(PeripheralRadioEvent::MtuLinkConnected {
            identifier: identifier.to_string(),
        });
        Ok(())
    }

    fn request_link_mtu(&mut self, identifier: &str, candidate: u16) -> Result<(), RadioError> {
        let air = lock(&self.air);
        air.require_link(identifier, LOOPBACK_CENTRAL)?;
        air.to_peripheral(PeripheralRadioEvent::MtuLinkChanged {
            identifier: identifier.to_string(),
            result: Ok(candidate.min(air.mtu)),
        });
        Ok(())
    }

    fn close_mtu_link(&mut self, _identifier: &str) -> Result<(), RadioError> {
        Ok(())
    }

    fn disconnect_client(&mut self, identifier: &str) -> Result<(), RadioError> {
        let mut air = lock(&self.air);
        air.require_link(identifier, LOOPBACK_CENTRAL)?;
        air.drop_link();
        Ok(())
    }
}
