//! Central role
//!
//! ```text
//! NotStarted -> Idle -> Scanning -> Connecting -> ServicesDiscovering
//!            -> NegotiatingMtu -> Ready -> Disconnected
//! ```
//!
//! Outbound messages are GATT writes with response on the write
//! characteristic; inbound chunks arrive as notifications on the indication
//! characteristic.

use log::{debug, info, trace, warn};
use std::mem;

use crate::ble::{CentralRadio, CentralRadioEvent, GattService, RadioError};
use crate::config::TransportSettings;
use crate::error::TransportError;
use crate::events::{EventEmitter, TransportEvent};
use crate::link::{Connection, NegotiationClock, Role};
use crate::protocol::{CCC_DESCRIPTOR_UUID, ENABLE_INDICATION_VALUE, PeripheralRef, ServiceDescriptor};
use crate::transport::RoleMachine;

#[derive(Debug)]
enum CentralState {
    NotStarted,
    Idle,
    Scanning,
    Connecting(PeripheralRef),
    ServicesDiscovering(Connection),
    NegotiatingMtu(Connection),
    Ready(Connection),
    Disconnected,
}

/// Where the central machine currently is, without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralPhase {
    NotStarted,
    Idle,
    Scanning,
    Connecting,
    ServicesDiscovering,
    NegotiatingMtu,
    Ready,
    Disconnected,
}

impl CentralPhase {
    pub fn describe(self) -> &'static str {
        match self {
            CentralPhase::NotStarted => "not started",
            CentralPhase::Idle => "idle",
            CentralPhase::Scanning => "scanning",
            CentralPhase::Connecting => "connecting",
            CentralPhase::ServicesDiscovering => "discovering services",
            CentralPhase::NegotiatingMtu => "negotiating MTU",
            CentralPhase::Ready => "ready",
            CentralPhase::Disconnected => "disconnected",
        }
    }
}

impl CentralState {
    fn phase(&self) -> CentralPhase {
        match self {
            CentralState::NotStarted => CentralPhase::NotStarted,
            CentralState::Idle => CentralPhase::Idle,
            CentralState::Scanning => CentralPhase::Scanning,
            CentralState::Connecting(_) => CentralPhase::Connecting,
            CentralState::ServicesDiscovering(_) => CentralPhase::ServicesDiscovering,
            CentralState::NegotiatingMtu(_) => CentralPhase::NegotiatingMtu,
            CentralState::Ready(_) => CentralPhase::Ready,
            CentralState::Disconnected => CentralPhase::Disconnected,
        }
    }

    fn connection(&self) -> Option<&Connection> {
        match self {
            CentralState::ServicesDiscovering(conn)
            | CentralState::NegotiatingMtu(conn)
            | CentralState::Ready(conn) => Some(conn),
            _ => None,
        }
    }

    fn connection_mut(&mut self) -> Option<&mut Connection> {
        match self {
            CentralState::ServicesDiscovering(conn)
            | CentralState::NegotiatingMtu(conn)
            | CentralState::Ready(conn) => Some(conn),
            _ => None,
        }
    }

    /// The remote device this state is bound to, if any.
    fn peer(&self) -> Option<&PeripheralRef> {
        match self {
            CentralState::Connecting(peer) => Some(peer),
            other => other.connection().map(Connection::peer),
        }
    }
}

/// GATT client side of the transport.
pub struct CentralMachine {
    radio: Box<dyn CentralRadio>,
    events: EventEmitter,
    service: Option<ServiceDescriptor>,
    mtu_candidate: u16,
    filter_scan_by_service: bool,
    state: CentralState,
    clock: NegotiationClock,
    // host asked for a disconnect the radio has not reported yet
    closing: bool,
}

impl CentralMachine {
    pub fn new(
        radio: Box<dyn CentralRadio>,
        events: EventEmitter,
        settings: &TransportSettings,
    ) -> Self {
        Self {
            radio,
            events,
            service: None,
            mtu_candidate: settings.mtu_candidate,
            filter_scan_by_service: settings.filter_scan_by_service,
            state: CentralState::NotStarted,
            clock: NegotiationClock::default(),
            closing: false,
        }
    }

    pub fn phase(&self) -> CentralPhase {
        self.state.phase()
    }

    /// MTU of the current link once the exchange finished.
    pub fn negotiated_mtu(&self) -> Option<u16> {
        match &self.state {
            CentralState::Ready(conn) => Some(conn.negotiated_mtu()),
            _ => None,
        }
    }

    /// Bytes of a partially received message on the current link.
    pub fn pending_inbound(&self) -> usize {
        self.state.connection().map_or(0, Connection::inbound_len)
    }

    pub fn start(&mut self) -> Result<(), TransportError> {
        if matches!(self.state, CentralState::NotStarted) {
            debug!("Central role started");
            self.state = CentralState::Idle;
        }
        Ok(())
    }

    /// Tear everything down and return to `NotStarted`.
    pub fn stop(&mut self) -> Result<(), TransportError> {
        match mem::replace(&mut self.state, CentralState::NotStarted) {
            CentralState::Scanning => {
                if let Err(e) = self.radio.stop_scan() {
                    debug!("stop_scan during stop failed: {}", e);
                }
            }
            other => {
                if let Some(peer) = other.peer() {
                    if let Err(e) = self.radio.disconnect(&peer.identifier) {
                        debug!("disconnect during stop failed: {}", e);
                    }
                    self.events.emit(TransportEvent::DisconnectedPeripheral {
                        identifier: peer.identifier.clone(),
                    });
                }
            }
        }
        self.service = None;
        self.closing = false;
        info!("Central role stopped");
        Ok(())
    }

    pub fn set_service(&mut self, service: ServiceDescriptor) -> Result<(), TransportError> {
        self.ensure_started()?;
        match self.service {
            Some(current) if current != service => Err(TransportError::ServiceAlreadyConfigured),
            _ => {
                debug!("Central service set to {}", service.service_id);
                self.service = Some(service);
                Ok(())
            }
        }
    }

    pub fn scan(&mut self) -> Result<(), TransportError> {
        self.ensure_started()?;
        match self.state {
            CentralState::Idle | CentralState::Disconnected | CentralState::Scanning => {
                let filter = self
                    .service
                    .filter(|_| self.filter_scan_by_service)
                    .map(|s| s.service_id);
                self.radio.start_scan(filter)?;
                info!("Scanning for peripherals (filter: {:?})", filter);
                self.state = CentralState::Scanning;
                Ok(())
            }
            ref other => Err(TransportError::InvalidState {
                operation: "scan",
                state: other.phase().describe(),
            }),
        }
    }

    pub fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.ensure_started()?;
        if matches!(self.state, CentralState::Scanning) {
            self.radio.stop_scan()?;
            self.state = CentralState::Idle;
        }
        Ok(())
    }

    pub fn connect(&mut self, identifier: &str) -> Result<(), TransportError> {
        self.ensure_started()?;
        if self.service.is_none() {
            return Err(TransportError::ServiceNotConfigured);
        }
        match self.state {
            CentralState::Idle | CentralState::Scanning | CentralState::Disconnected => {
                self.radio.connect(identifier)?;
                info!("Connecting to {}", identifier);
                self.state = CentralState::Connecting(PeripheralRef::new(identifier));
                Ok(())
            }
            ref other => Err(TransportError::InvalidState {
                operation: "connect",
                state: other.phase().describe(),
            }),
        }
    }

    /// Ask the radio to drop the link. Unsent chunks are abandoned now and
    /// writes are refused; the state changes when the radio reports the
    /// disconnect.
    pub fn disconnect(&mut self) -> Result<(), TransportError> {
        self.ensure_started()?;
        let Some(peer) = self.state.peer() else {
            return Err(TransportError::InvalidState {
                operation: "disconnect",
                state: self.phase().describe(),
            });
        };
        self.radio.disconnect(&peer.identifier)?;
        self.closing = true;
        if let Some(conn) = self.state.connection_mut() {
            let dropped = conn.outbound().abandon();
            if dropped > 0 {
                debug!("Abandoned {} unsent chunks", dropped);
            }
        }
        Ok(())
    }

    /// Send one message to the peripheral.
    pub fn write(&mut self, message: &[u8]) -> Result<(), TransportError> {
        let conn = match &mut self.state {
            CentralState::NotStarted => return Err(TransportError::NotStarted(Role::Central)),
            CentralState::Ready(_) if self.closing => {
                return Err(TransportError::NotReady("disconnecting"));
            }
            CentralState::Ready(conn) => conn,
            other => return Err(TransportError::NotReady(other.phase().describe())),
        };
        let frames = conn.queue_message(message)?;
        debug!(
            "Writing {} bytes to {} as {} chunks of <= {} bytes",
            message.len(),
            conn.peer(),
            frames,
            conn.chunk_size()
        );
        self.pump();
        Ok(())
    }

    pub fn handle_radio_event(&mut self, event: CentralRadioEvent) {
        match event {
            CentralRadioEvent::Discovered { identifier } => {
                if matches!(self.state, CentralState::Scanning) {
                    self.events
                        .emit(TransportEvent::PeripheralDiscovered { identifier });
                } else {
                    trace!("Discovery of {} outside scanning ignored", identifier);
                }
            }
            CentralRadioEvent::Connected { identifier } => self.on_connected(&identifier),
            CentralRadioEvent::Disconnected { identifier } => self.on_disconnected(&identifier),
            CentralRadioEvent::ServicesDiscovered { identifier, result } => {
                self.on_services_discovered(&identifier, result);
            }
            CentralRadioEvent::MtuChanged { identifier, result } => {
                self.on_mtu_changed(&identifier, result);
            }
            CentralRadioEvent::WriteCompleted { identifier, result } => {
                self.on_write_completed(&identifier, result);
            }
            CentralRadioEvent::IndicationSetupFailed { identifier, error } => {
                let attached = self
                    .state
                    .connection()
                    .is_some_and(|conn| conn.peer().matches(&identifier));
                if attached {
                    self.negotiation_failed(&identifier, &format!("enabling indications: {error}"));
                } else {
                    trace!("Indication setup failure for {} ignored", identifier);
                }
            }
            CentralRadioEvent::Notification {
                identifier,
                characteristic,
                value,
            } => {
                let Some(service) = self.service else { return };
                if characteristic != service.indication_characteristic_id {
                    trace!("Notification on {} ignored", characteristic);
                    return;
                }
                let Some(conn) = self.state.connection_mut() else {
                    trace!("Notification from {} without a link ignored", identifier);
                    return;
                };
                if !conn.peer().matches(&identifier) {
                    return;
                }
                trace!("Chunk of {} bytes from {}", value.len(), identifier);
                if let Some(message) = conn.receive(&value) {
                    debug!("Received message of {} bytes", message.len());
                    self.events.emit(TransportEvent::MessageReceived { message });
                }
            }
        }
    }

    fn on_connected(&mut self, identifier: &str) {
        match mem::replace(&mut self.state, CentralState::Idle) {
            CentralState::Connecting(peer) if peer.matches(identifier) => {
                if let Err(e) = self.radio.stop_scan() {
                    debug!("stop_scan after connect failed: {}", e);
                }
                info!("Connected to {}", peer);
                self.closing = false;
                self.events.emit(TransportEvent::ConnectedPeripheral {
                    identifier: peer.identifier.clone(),
                });
                let discovery = self.radio.discover_services(&peer.identifier);
                self.state =
                    CentralState::ServicesDiscovering(Connection::new(Role::Central, peer));
                self.clock.restart();
                if let Err(e) = discovery {
                    self.negotiation_failed(identifier, &format!("service discovery: {e}"));
                }
            }
            other => {
                warn!(
                    "Unexpected connection of {} while {}",
                    identifier,
                    other.phase().describe()
                );
                self.state = other;
            }
        }
    }

    fn on_disconnected(&mut self, identifier: &str) {
        if !self.state.peer().is_some_and(|p| p.matches(identifier)) {
            trace!("Disconnect of unrelated device {} ignored", identifier);
            return;
        }
        if let Some(conn) = self.state.connection() {
            if conn.inbound_len() > 0 {
                debug!("Discarding {} bytes of partial message", conn.inbound_len());
            }
        }
        info!("Disconnected from {}", identifier);
        self.state = CentralState::Disconnected;
        self.closing = false;
        self.events.emit(TransportEvent::DisconnectedPeripheral {
            identifier: identifier.to_string(),
        });
    }

    fn on_services_discovered(
        &mut self,
        identifier: &str,
        result: Result<Vec<GattService>, RadioError>,
    ) {
        let CentralState::ServicesDiscovering(conn) = &self.state else {
            warn!("Service discovery result outside discovery ignored");
            return;
        };
        if !conn.peer().matches(identifier) {
            return;
        }
        let Some(service) = self.service else {
            self.negotiation_failed(identifier, "service identifiers not configured");
            return;
        };
        let services = match result {
            Ok(services) => services,
            Err(e) => {
                self.negotiation_failed(identifier, &format!("service discovery: {e}"));
                return;
            }
        };
        if let Err(reason) = resolve_channel(&services, &service) {
            self.negotiation_failed(identifier, &reason);
            return;
        }
        debug!("Resolved channel {} on {}", service.service_id, identifier);

        let requested = self
            .radio
            .enable_notifications(identifier, service.indication_characteristic_id)
            .and_then(|()| self.radio.request_mtu(identifier, self.mtu_candidate));
        if let Err(e) = requested {
            self.negotiation_failed(identifier, &format!("MTU request: {e}"));
            return;
        }

        self.state = match mem::replace(&mut self.state, CentralState::Idle) {
            CentralState::ServicesDiscovering(conn) => CentralState::NegotiatingMtu(conn),
            other => other,
        };
        self.clock.restart();
    }

    fn on_mtu_changed(&mut self, identifier: &str, result: Result<u16, RadioError>) {
        let CentralState::NegotiatingMtu(conn) = &mut self.state else {
            warn!("MTU change outside negotiation ignored");
            return;
        };
        if !conn.peer().matches(identifier) {
            return;
        }
        let mtu = match result {
            Ok(mtu) => conn.settle_mtu(mtu),
            Err(e) => {
                self.negotiation_failed(identifier, &format!("MTU exchange: {e}"));
                return;
            }
        };
        let Some(service) = self.service else { return };
        if let Err(e) = self.radio.write_descriptor(
            identifier,
            service.indication_characteristic_id,
            CCC_DESCRIPTOR_UUID,
            &ENABLE_INDICATION_VALUE,
        ) {
            self.negotiation_failed(identifier, &format!("enabling indications: {e}"));
            return;
        }

        self.state = match mem::replace(&mut self.state, CentralState::Idle) {
            CentralState::NegotiatingMtu(mut conn) => {
                conn.mark_ready();
                CentralState::Ready(conn)
            }
            other => other,
        };
        info!("Link to {} ready, MTU {}", identifier, mtu);
        self.events.emit(TransportEvent::LinkReady {
            role: Role::Central,
            identifier: identifier.to_string(),
            mtu,
        });
    }

    fn on_write_completed(&mut self, identifier: &str, result: Result<(), RadioError>) {
        let CentralState::Ready(conn) = &mut self.state else {
            trace!("Write completion outside ready ignored");
            return;
        };
        if !conn.peer().matches(identifier) {
            return;
        }
        match result {
            Ok(()) => {
                if conn.outbound().confirm() {
                    debug!("Message to {} delivered", identifier);
                    self.events
                        .emit(TransportEvent::MessageSent { role: Role::Central });
                }
                self.pump();
            }
            Err(e) => {
                let dropped = conn.outbound().fail();
                warn!("Write to {} failed, dropped {} chunks: {}", identifier, dropped, e);
                self.events.emit(TransportEvent::SendFailed {
                    role: Role::Central,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Submit the next chunk if the gate is open.
    fn pump(&mut self) {
        let CentralState::Ready(conn) = &mut self.state else { return };
        let Some(service) = self.service else { return };
        let Some(frame) = conn.outbound().next_frame() else { return };

        trace!("Submitting chunk of {} bytes", frame.len());
        if let Err(e) = self.radio.write_characteristic(
            &conn.peer().identifier,
            service.write_characteristic_id,
            &frame,
            true,
        ) {
            let dropped = conn.outbound().fail();
            warn!("Write submission failed, dropped {} chunks: {}", dropped, e);
            self.events.emit(TransportEvent::SendFailed {
                role: Role::Central,
                reason: e.to_string(),
            });
        }
    }

    fn negotiation_failed(&self, identifier: &str, reason: &str) {
        warn!("Negotiation with {} failed: {}", identifier, reason);
        self.events.emit(TransportEvent::NegotiationFailed {
            role: Role::Central,
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        });
    }

    fn ensure_started(&self) -> Result<(), TransportError> {
        if matches!(self.state, CentralState::NotStarted) {
            Err(TransportError::NotStarted(Role::Central))
        } else {
            Ok(())
        }
    }
}

/// Check the discovered services expose the configured channel.
fn resolve_channel(services: &[GattService], descriptor: &ServiceDescriptor) -> Result<(), String> {
    let service = services
        .iter()
        .find(|s| s.uuid == descriptor.service_id)
        .ok_or_else(|| format!("service {} not found", descriptor.service_id))?;
    for wanted in [
        descriptor.write_characteristic_id,
        descriptor.indication_characteristic_id,
    ] {
        if !service.characteristics.contains(&wanted) {
            return Err(format!("characteristic {wanted} not found"));
        }
    }
    Ok(())
}

impl RoleMachine for CentralMachine {
    type RadioEvent = CentralRadioEvent;

    fn on_radio_event(&mut self, event: CentralRadioEvent) {
        self.handle_radio_event(event);
    }

    fn negotiation_epoch(&self) -> Option<u64> {
        match self.state {
            CentralState::ServicesDiscovering(_) | CentralState::NegotiatingMtu(_) => {
                self.clock.armed()
            }
            _ => None,
        }
    }

    fn on_negotiation_timeout(&mut self, epoch: u64) {
        if self.negotiation_epoch() != Some(epoch) || !self.clock.expire(epoch) {
            return;
        }
        let phase = self.phase().describe();
        if let Some(peer) = self.state.peer().cloned() {
            self.negotiation_failed(&peer.identifier, &format!("timed out while {phase}"));
        }
    }

    fn shutdown(&mut self) {
        if !matches!(self.state, CentralState::NotStarted) {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStream;
    use crate::mock::{CentralCall, MockCentralRadio, drain};
    use crate::protocol::codec::EOM;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    const PEER: &str = "AA:BB:CC:DD:EE:FF";

    fn service() -> ServiceDescriptor {
        ServiceDescriptor::new(
            Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
            Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e),
            Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e),
        )
    }

    fn gatt_services() -> Vec<GattService> {
        let s = service();
        vec![GattService {
            uuid: s.service_id,
            characteristics: vec![s.write_characteristic_id, s.indication_characteristic_id],
        }]
    }

    struct Harness {
        machine: CentralMachine,
        calls: UnboundedReceiver<CentralCall>,
        events: EventStream,
    }

    impl Harness {
        fn new() -> Self {
            let (radio, calls) = MockCentralRadio::new();
            let (emitter, events) = EventEmitter::channel();
            let machine =
                CentralMachine::new(Box::new(radio), emitter, &TransportSettings::default());
            Self {
                machine,
                calls,
                events,
            }
        }

        fn configured() -> Self {
            let mut h = Self::new();
            h.machine.start().unwrap();
            h.machine.set_service(service()).unwrap();
            h
        }

        /// Drive a link all the way to `Ready` with the given MTU.
        fn ready(mtu: u16) -> Self {
            let mut h = Self::configured();
            h.machine.connect(PEER).unwrap();
            h.radio(CentralRadioEvent::Connected {
                identifier: PEER.into(),
            });
            h.radio(CentralRadioEvent::ServicesDiscovered {
                identifier: PEER.into(),
                result: Ok(gatt_services()),
            });
            h.radio(CentralRadioEvent::MtuChanged {
                identifier: PEER.into(),
                result: Ok(mtu),
            });
            assert_eq!(h.machine.phase(), CentralPhase::Ready);
            h.calls();
            h.events();
            h
        }

        fn radio(&mut self, event: CentralRadioEvent) {
            self.machine.handle_radio_event(event);
        }

        fn calls(&mut self) -> Vec<CentralCall> {
            drain(&mut self.calls)
        }

        fn events(&mut self) -> Vec<TransportEvent> {
            std::iter::from_fn(|| self.events.try_recv()).collect()
        }

        fn written(&mut self) -> Vec<Vec<u8>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    CentralCall::Write { value, .. } => Some(value),
                    _ => None,
                })
                .collect()
        }

        fn complete_write(&mut self) {
            self.radio(CentralRadioEvent::WriteCompleted {
                identifier: PEER.into(),
                result: Ok(()),
            });
        }

        fn notify(&mut self, value: &[u8]) {
            self.radio(CentralRadioEvent::Notification {
                identifier: PEER.into(),
                characteristic: service().indication_characteristic_id,
                value: value.to_vec(),
            });
        }
    }

    #[test]
    fn test_operations_before_start_fail() {
        let mut h = Harness::new();
        assert!(matches!(
            h.machine.set_service(service()),
            Err(TransportError::NotStarted(Role::Central))
        ));
        assert!(matches!(h.machine.scan(), Err(TransportError::NotStarted(_))));
        assert!(matches!(h.machine.connect(PEER), Err(TransportError::NotStarted(_))));
        assert!(matches!(h.machine.write(b"hi"), Err(TransportError::NotStarted(_))));
        assert_eq!(h.machine.phase(), CentralPhase::NotStarted);
        assert!(h.calls().is_empty());
    }

    #[test]
    fn test_connect_requires_service() {
        let mut h = Harness::new();
        h.machine.start().unwrap();
        assert!(matches!(
            h.machine.connect(PEER),
            Err(TransportError::ServiceNotConfigured)
        ));
        assert_eq!(h.machine.phase(), CentralPhase::Idle);
    }

    #[test]
    fn test_service_is_immutable_once_set() {
        let mut h = Harness::configured();
        h.machine.set_service(service()).unwrap();

        let other = ServiceDescriptor::new(Uuid::from_u128(9), Uuid::from_u128(8), Uuid::from_u128(7));
        assert!(matches!(
            h.machine.set_service(other),
            Err(TransportError::ServiceAlreadyConfigured)
        ));
    }

    #[test]
    fn test_scan_reports_discoveries() {
        let mut h = Harness::configured();
        h.radio(CentralRadioEvent::Discovered {
            identifier: "11:22".into(),
        });
        assert!(h.events().is_empty());

        h.machine.scan().unwrap();
        assert_eq!(h.calls(), vec![CentralCall::StartScan(Some(service().service_id))]);

        for _ in 0..2 {
            h.radio(CentralRadioEvent::Discovered {
                identifier: "11:22".into(),
            });
        }
        assert_eq!(
            h.events(),
            vec![
                TransportEvent::PeripheralDiscovered {
                    identifier: "11:22".into()
                };
                2
            ]
        );
    }

    #[test]
    fn test_full_lifecycle_to_ready() {
        let mut h = Harness::configured();
        h.machine.scan().unwrap();
        h.machine.connect(PEER).unwrap();
        assert_eq!(h.machine.phase(), CentralPhase::Connecting);

        h.radio(CentralRadioEvent::Connected {
            identifier: PEER.into(),
        });
        assert_eq!(h.machine.phase(), CentralPhase::ServicesDiscovering);

        h.radio(CentralRadioEvent::ServicesDiscovered {
            identifier: PEER.into(),
            result: Ok(gatt_services()),
        });
        assert_eq!(h.machine.phase(), CentralPhase::NegotiatingMtu);
        assert!(matches!(h.machine.write(b"early"), Err(TransportError::NotReady(_))));

        h.radio(CentralRadioEvent::MtuChanged {
            identifier: PEER.into(),
            result: Ok(247),
        });
        assert_eq!(h.machine.phase(), CentralPhase::Ready);
        assert_eq!(h.machine.negotiated_mtu(), Some(247));

        let s = service();
        assert_eq!(
            h.calls(),
            vec![
                CentralCall::StartScan(Some(s.service_id)),
                CentralCall::Connect(PEER.into()),
                CentralCall::StopScan,
                CentralCall::DiscoverServices(PEER.into()),
                CentralCall::EnableNotifications(PEER.into(), s.indication_characteristic_id),
                CentralCall::RequestMtu(PEER.into(), 512),
                CentralCall::WriteDescriptor {
                    identifier: PEER.into(),
                    characteristic: s.indication_characteristic_id,
                    descriptor: CCC_DESCRIPTOR_UUID,
                    value: ENABLE_INDICATION_VALUE.to_vec(),
                },
            ]
        );
        assert_eq!(
            h.events(),
            vec![
                TransportEvent::ConnectedPeripheral {
                    identifier: PEER.into()
                },
                TransportEvent::LinkReady {
                    role: Role::Central,
                    identifier: PEER.into(),
                    mtu: 247,
                },
            ]
        );
    }

    #[test]
    fn test_small_message_single_chunk() {
        let mut h = Harness::ready(512);
        h.machine.write(b"hi").unwrap();
        assert_eq!(h.written(), vec![b"hi".to_vec()]);

        h.complete_write();
        assert_eq!(h.written(), vec![EOM.to_vec()]);
        h.complete_write();
        assert!(h.written().is_empty());
        assert_eq!(
            h.events(),
            vec![TransportEvent::MessageSent { role: Role::Central }]
        );
    }

    #[test]
    fn test_multi_chunk_message_one_at_a_time() {
        // default MTU leaves 20 bytes per chunk after the ATT header
        let mut h = Harness::ready(23);
        let message: Vec<u8> = (0u8..45).collect();
        h.machine.write(&message).unwrap();

        let mut sent = Vec::new();
        for _ in 0..4 {
            let written = h.written();
            assert_eq!(written.len(), 1, "exactly one chunk in flight");
            sent.extend(written);
            h.complete_write();
        }
        assert_eq!(
            sent,
            vec![
                message[..20].to_vec(),
                message[20..40].to_vec(),
                message[40..].to_vec(),
                EOM.to_vec()
            ]
        );
    }

    #[test]
    fn test_second_write_while_draining_is_busy() {
        let mut h = Harness::ready(23);
        h.machine.write(&[7u8; 45]).unwrap();
        assert_eq!(h.written().len(), 1);

        let err = h.machine.write(b"again").unwrap_err();
        assert!(matches!(err, TransportError::Busy));
        assert!(err.is_retryable());
        assert!(h.written().is_empty());
    }

    #[test]
    fn test_failed_write_abandons_message() {
        let mut h = Harness::ready(23);
        h.machine.write(&[7u8; 45]).unwrap();
        h.written();
        h.radio(CentralRadioEvent::WriteCompleted {
            identifier: PEER.into(),
            result: Err(RadioError::Status(0x85)),
        });
        assert!(h.written().is_empty());
        assert!(matches!(
            h.events().as_slice(),
            [TransportEvent::SendFailed { role: Role::Central, .. }]
        ));

        h.machine.write(b"retry").unwrap();
        assert_eq!(h.written(), vec![b"retry".to_vec()]);
    }

    #[test]
    fn test_notifications_reassemble_message() {
        let mut h = Harness::ready(512);
        h.notify(b"hel");
        h.notify(b"lo");
        assert!(h.events().is_empty());
        h.notify(EOM);
        assert_eq!(
            h.events(),
            vec![TransportEvent::MessageReceived {
                message: b"hello".to_vec()
            }]
        );
    }

    #[test]
    fn test_notification_on_other_characteristic_ignored() {
        let mut h = Harness::ready(512);
        h.radio(CentralRadioEvent::Notification {
            identifier: PEER.into(),
            characteristic: Uuid::from_u128(42),
            value: EOM.to_vec(),
        });
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_mtu_failure_keeps_state() {
        let mut h = Harness::configured();
        h.machine.connect(PEER).unwrap();
        h.radio(CentralRadioEvent::Connected {
            identifier: PEER.into(),
        });
        h.radio(CentralRadioEvent::ServicesDiscovered {
            identifier: PEER.into(),
            result: Ok(gatt_services()),
        });
        h.events();

        h.radio(CentralRadioEvent::MtuChanged {
            identifier: PEER.into(),
            result: Err(RadioError::Status(0x0e)),
        });
        assert_eq!(h.machine.phase(), CentralPhase::NegotiatingMtu);
        assert!(matches!(
            h.events().as_slice(),
            [TransportEvent::NegotiationFailed { role: Role::Central, .. }]
        ));
        assert!(matches!(h.machine.write(b"x"), Err(TransportError::NotReady(_))));
    }

    #[test]
    fn test_indication_setup_failure_reported() {
        let mut h = Harness::ready(185);
        h.radio(CentralRadioEvent::IndicationSetupFailed {
            identifier: PEER.into(),
            error: RadioError::CharacteristicNotFound(service().indication_characteristic_id),
        });
        assert!(matches!(
            h.events().as_slice(),
            [TransportEvent::NegotiationFailed { role: Role::Central, reason, .. }]
                if reason.contains("enabling indications")
        ));

        h.radio(CentralRadioEvent::IndicationSetupFailed {
            identifier: "11:22".into(),
            error: RadioError::Closed,
        });
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_rejected_discovery_request_fails_negotiation() {
        let (radio, calls) = MockCentralRadio::new();
        let (emitter, mut events) = EventEmitter::channel();
        let mut machine =
            CentralMachine::new(Box::new(radio), emitter, &TransportSettings::default());
        machine.start().unwrap();
        machine.set_service(service()).unwrap();
        machine.connect(PEER).unwrap();

        drop(calls);
        machine.handle_radio_event(CentralRadioEvent::Connected {
            identifier: PEER.into(),
        });
        assert_eq!(machine.phase(), CentralPhase::ServicesDiscovering);
        assert!(matches!(
            events.try_recv(),
            Some(TransportEvent::ConnectedPeripheral { .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Some(TransportEvent::NegotiationFailed { reason, .. }) if reason.contains("service discovery")
        ));
    }

    #[test]
    fn test_missing_characteristic_fails_negotiation() {
        let mut h = Harness::configured();
        h.machine.connect(PEER).unwrap();
        h.radio(CentralRadioEvent::Connected {
            identifier: PEER.into(),
        });
        h.events();
        h.calls();

        h.radio(CentralRadioEvent::ServicesDiscovered {
            identifier: PEER.into(),
            result: Ok(vec![GattService {
                uuid: service().service_id,
                characteristics: vec![service().write_characteristic_id],
            }]),
        });
        assert_eq!(h.machine.phase(), CentralPhase::ServicesDiscovering);
        assert!(h.calls().is_empty());
        assert!(matches!(
            h.events().as_slice(),
            [TransportEvent::NegotiationFailed { reason, .. }] if reason.contains("not found")
        ));
    }

    #[test]
    fn test_disconnect_discards_partial_message() {
        let mut h = Harness::ready(512);
        h.notify(b"partial");
        assert_eq!(h.machine.pending_inbound(), 7);

        h.radio(CentralRadioEvent::Disconnected {
            identifier: PEER.into(),
        });
        assert_eq!(h.machine.phase(), CentralPhase::Disconnected);
        assert_eq!(
            h.events(),
            vec![TransportEvent::DisconnectedPeripheral {
                identifier: PEER.into()
            }]
        );

        h.machine.connect(PEER).unwrap();
        h.radio(CentralRadioEvent::Connected {
            identifier: PEER.into(),
        });
        h.radio(CentralRadioEvent::ServicesDiscovered {
            identifier: PEER.into(),
            result: Ok(gatt_services()),
        });
        h.radio(CentralRadioEvent::MtuChanged {
            identifier: PEER.into(),
            result: Ok(512),
        });
        assert_eq!(h.machine.pending_inbound(), 0);
        h.events();

        h.notify(EOM);
        assert_eq!(
            h.events(),
            vec![TransportEvent::MessageReceived { message: Vec::new() }]
        );
    }

    #[test]
    fn test_disconnect_of_other_device_ignored() {
        let mut h = Harness::ready(512);
        h.radio(CentralRadioEvent::Disconnected {
            identifier: "00:00:00:00:00:01".into(),
        });
        assert_eq!(h.machine.phase(), CentralPhase::Ready);
    }

    #[test]
    fn test_host_disconnect_abandons_outbound() {
        let mut h = Harness::ready(23);
        h.machine.write(&[7u8; 45]).unwrap();
        assert_eq!(h.written().len(), 1);

        h.machine.disconnect().unwrap();
        assert_eq!(h.calls(), vec![CentralCall::Disconnect(PEER.into())]);
        assert_eq!(h.machine.phase(), CentralPhase::Ready);

        // no new message may start before the radio reports the disconnect
        assert!(matches!(
            h.machine.write(b"new"),
            Err(TransportError::NotReady("disconnecting"))
        ));
        assert!(h.written().is_empty());

        // late confirmation of the chunk already in flight
        h.complete_write();
        h.complete_write();
        assert!(h.written().is_empty());
        assert!(h.events().is_empty());

        h.radio(CentralRadioEvent::Disconnected {
            identifier: PEER.into(),
        });
        assert_eq!(h.machine.phase(), CentralPhase::Disconnected);
    }

    #[test]
    fn test_failed_disconnect_request_keeps_link_usable() {
        let (radio, calls) = MockCentralRadio::new();
        let (emitter, mut events) = EventEmitter::channel();
        let mut machine =
            CentralMachine::new(Box::new(radio), emitter, &TransportSettings::default());
        machine.start().unwrap();
        machine.set_service(service()).unwrap();
        machine.connect(PEER).unwrap();
        machine.handle_radio_event(CentralRadioEvent::Connected {
            identifier: PEER.into(),
        });
        machine.handle_radio_event(CentralRadioEvent::ServicesDiscovered {
            identifier: PEER.into(),
            result: Ok(gatt_services()),
        });
        machine.handle_radio_event(CentralRadioEvent::MtuChanged {
            identifier: PEER.into(),
            result: Ok(23),
        });
        assert_eq!(machine.phase(), CentralPhase::Ready);

        // radio gone: every request now fails synchronously
        drop(calls);
        assert!(matches!(
            machine.disconnect(),
            Err(TransportError::Radio(RadioError::Closed))
        ));
        assert_eq!(machine.phase(), CentralPhase::Ready);
        while events.try_recv().is_some() {}

        // a rejected submission releases the gate instead of wedging it
        for _ in 0..2 {
            machine.write(b"x").unwrap();
            assert!(matches!(
                events.try_recv(),
                Some(TransportEvent::SendFailed { role: Role::Central, .. })
            ));
        }
    }

    #[test]
    fn test_scan_rejected_while_connected() {
        let mut h = Harness::ready(512);
        assert!(matches!(
            h.machine.scan(),
            Err(TransportError::InvalidState { operation: "scan", .. })
        ));
    }

    #[test]
    fn test_stop_reports_disconnect_and_resets() {
        let mut h = Harness::ready(512);
        h.machine.stop().unwrap();
        assert_eq!(h.machine.phase(), CentralPhase::NotStarted);
        assert_eq!(h.calls(), vec![CentralCall::Disconnect(PEER.into())]);
        assert_eq!(
            h.events(),
            vec![TransportEvent::DisconnectedPeripheral {
                identifier: PEER.into()
            }]
        );

        h.machine.start().unwrap();
        assert!(matches!(
            h.machine.connect(PEER),
            Err(TransportError::ServiceNotConfigured)
        ));
    }

    #[test]
    fn test_negotiation_timeout_reports_failure_once() {
        let mut h = Harness::configured();
        h.machine.connect(PEER).unwrap();
        assert_eq!(h.machine.negotiation_epoch(), None);

        h.radio(CentralRadioEvent::Connected {
            identifier: PEER.into(),
        });
        h.events();
        let epoch = h.machine.negotiation_epoch().unwrap();

        h.machine.on_negotiation_timeout(epoch);
        h.machine.on_negotiation_timeout(epoch);
        assert!(matches!(
            h.events().as_slice(),
            [TransportEvent::NegotiationFailed { reason, .. }] if reason.contains("timed out")
        ));
        assert_eq!(h.machine.negotiation_epoch(), None);
        assert_eq!(h.machine.phase(), CentralPhase::ServicesDiscovering);
    }
}
