//! Peripheral role
//!
//! ```text
//! NotStarted -> Idle -> Advertising -> ClientAttaching -> NegotiatingMtu
//!            -> Ready -> Disconnected
//! ```
//!
//! A GATT server cannot start the MTU exchange itself, so once a client
//! attaches the peripheral opens a second, role-reversed client link to the
//! same device just to request the MTU. Indications stay blocked until that
//! exchange finished.

use log::{debug, info, trace, warn};
use std::mem;

use crate::ble::{PeripheralRadio, PeripheralRadioEvent, RadioError};
use crate::config::TransportSettings;
use crate::error::TransportError;
use crate::events::{EventEmitter, TransportEvent};
use crate::link::{Connection, NegotiationClock, Role};
use crate::protocol::{PeripheralRef, ServiceDescriptor};
use crate::transport::RoleMachine;

#[derive(Debug)]
enum PeripheralState {
    NotStarted,
    Idle,
    Advertising,
    ClientAttaching(Connection),
    NegotiatingMtu(Connection),
    Ready(Connection),
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralPhase {
    NotStarted,
    Idle,
    Advertising,
    ClientAttaching,
    NegotiatingMtu,
    Ready,
    Disconnected,
}

impl PeripheralPhase {
    pub fn describe(self) -> &'static str {
        match self {
            PeripheralPhase::NotStarted => "not started",
            PeripheralPhase::Idle => "idle",
            PeripheralPhase::Advertising => "advertising",
            PeripheralPhase::ClientAttaching => "attaching client",
            PeripheralPhase::NegotiatingMtu => "negotiating MTU",
            PeripheralPhase::Ready => "ready",
            PeripheralPhase::Disconnected => "disconnected",
        }
    }
}

impl PeripheralState {
    fn phase(&self) -> PeripheralPhase {
        match self {
            PeripheralState::NotStarted => PeripheralPhase::NotStarted,
            PeripheralState::Idle => PeripheralPhase::Idle,
            PeripheralState::Advertising => PeripheralPhase::Advertising,
            PeripheralState::ClientAttaching(_) => PeripheralPhase::ClientAttaching,
            PeripheralState::NegotiatingMtu(_) => PeripheralPhase::NegotiatingMtu,
            PeripheralState::Ready(_) => PeripheralPhase::Ready,
            PeripheralState::Disconnected => PeripheralPhase::Disconnected,
        }
    }

    fn connection(&self) -> Option<&Connection> {
        match self {
            PeripheralState::ClientAttaching(conn)
            | PeripheralState::NegotiatingMtu(conn)
            | PeripheralState::Ready(conn) => Some(conn),
            _ => None,
        }
    }

    fn connection_mut(&mut self) -> Option<&mut Connection> {
        match self {
            PeripheralState::ClientAttaching(conn)
            | PeripheralState::NegotiatingMtu(conn)
            | PeripheralState::Ready(conn) => Some(conn),
            _ => None,
        }
    }

    /// A new client may attach.
    fn accepts_client(&self) -> bool {
        matches!(
            self,
            PeripheralState::Idle | PeripheralState::Advertising | PeripheralState::Disconnected
        )
    }
}

/// GATT server side of the transport.
pub struct PeripheralMachine {
    radio: Box<dyn PeripheralRadio>,
    events: EventEmitter,
    service: Option<ServiceDescriptor>,
    published: bool,
    mtu_candidate: u16,
    state: PeripheralState,
    clock: NegotiationClock,
}

impl PeripheralMachine {
    pub fn new(
        radio: Box<dyn PeripheralRadio>,
        events: EventEmitter,
        settings: &TransportSettings,
    ) -> Self {
        Self {
            radio,
            events,
            service: None,
            published: false,
            mtu_candidate: settings.mtu_candidate,
            state: PeripheralState::NotStarted,
            clock: NegotiationClock::default(),
        }
    }

    pub fn phase(&self) -> PeripheralPhase {
        self.state.phase()
    }

    pub fn negotiated_mtu(&self) -> Option<u16> {
        match &self.state {
            PeripheralState::Ready(conn) => Some(conn.negotiated_mtu()),
            _ => None,
        }
    }

    pub fn pending_inbound(&self) -> usize {
        self.state.connection().map_or(0, Connection::inbound_len)
    }

    pub fn start(&mut self) -> Result<(), TransportError> {
        if matches!(self.state, PeripheralState::NotStarted) {
            debug!("Peripheral role started");
            self.state = PeripheralState::Idle;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), TransportError> {
        match mem::replace(&mut self.state, PeripheralState::NotStarted) {
            PeripheralState::Advertising => {
                if let Err(e) = self.radio.stop_advertising() {
                    debug!("stop_advertising during stop failed: {}", e);
                }
            }
            other => {
                if let Some(conn) = other.connection() {
                    let identifier = &conn.peer().identifier;
                    if !matches!(other, PeripheralState::Ready(_)) {
                        if let Err(e) = self.radio.close_mtu_link(identifier) {
                            debug!("close_mtu_link during stop failed: {}", e);
                        }
                    }
                    if let Err(e) = self.radio.disconnect_client(identifier) {
                        debug!("disconnect_client during stop failed: {}", e);
                    }
                    self.events.emit(TransportEvent::DisconnectedCentral {
                        identifier: identifier.clone(),
                    });
                }
            }
        }
        self.service = None;
        self.published = false;
        info!("Peripheral role stopped");
        Ok(())
    }

    pub fn set_service(&mut self, service: ServiceDescriptor) -> Result<(), TransportError> {
        self.ensure_started()?;
        match self.service {
            Some(current) if current != service => Err(TransportError::ServiceAlreadyConfigured),
            _ => {
                debug!("Peripheral service set to {}", service.service_id);
                self.service = Some(service);
                Ok(())
            }
        }
    }

    /// Publish the service (once) and start broadcasting its id.
    pub fn advertise(&mut self) -> Result<(), TransportError> {
        self.ensure_started()?;
        let service = self.service.ok_or(TransportError::ServiceNotConfigured)?;
        if !matches!(
            self.state,
            PeripheralState::Idle | PeripheralState::Disconnected | PeripheralState::Advertising
        ) {
            return Err(TransportError::InvalidState {
                operation: "advertise",
                state: self.phase().describe(),
            });
        }
        if !self.published {
            self.radio.publish_service(&service)?;
            self.published = true;
            info!("GATT service {} registered", service.service_id);
        }
        self.radio.start_advertising(service.service_id)?;
        self.state = PeripheralState::Advertising;
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> Result<(), TransportError> {
        self.ensure_started()?;
        if matches!(self.state, PeripheralState::Advertising) {
            self.radio.stop_advertising()?;
            self.state = PeripheralState::Idle;
            info!("Advertising stopped");
        }
        Ok(())
    }

    /// Send one message to the attached central as indications.
    pub fn indicate(&mut self, message: &[u8]) -> Result<(), TransportError> {
        let conn = match &mut self.state {
            PeripheralState::NotStarted => {
                return Err(TransportError::NotStarted(Role::Peripheral));
            }
            PeripheralState::Ready(conn) => conn,
            other => return Err(TransportError::NotReady(other.phase().describe())),
        };
        let frames = conn.queue_message(message)?;
        debug!(
            "Indicating {} bytes to {} as {} chunks",
            message.len(),
            conn.peer(),
            frames
        );
        self.pump();
        Ok(())
    }

    pub fn handle_radio_event(&mut self, event: PeripheralRadioEvent) {
        match event {
            PeripheralRadioEvent::AdvertisingStarted { result } => match result {
                Ok(()) => info!("Advertising started"),
                Err(e) => {
                    warn!("Advertising failed to start: {}", e);
                    if matches!(self.state, PeripheralState::Advertising) {
                        self.state = PeripheralState::Idle;
                    }
                }
            },
            PeripheralRadioEvent::ClientConnected { identifier } => {
                self.on_client_connected(&identifier);
            }
            PeripheralRadioEvent::ClientDisconnected { identifier } => {
                self.on_client_disconnected(&identifier);
            }
            PeripheralRadioEvent::MtuLinkConnected { identifier } => {
                self.on_mtu_link_connected(&identifier);
            }
            PeripheralRadioEvent::MtuLinkFailed { identifier, error } => {
                let negotiating = matches!(
                    &self.state,
                    PeripheralState::ClientAttaching(conn) | PeripheralState::NegotiatingMtu(conn)
                        if conn.peer().matches(&identifier)
                );
                if negotiating {
                    self.negotiation_failed(&identifier, &format!("opening MTU link: {error}"));
                } else {
                    trace!("MTU link failure for {} ignored", identifier);
                }
            }
            PeripheralRadioEvent::MtuLinkChanged { identifier, result } => {
                self.on_mtu_link_changed(&identifier, result);
            }
            PeripheralRadioEvent::WriteRequest {
                identifier,
                request_id,
                characteristic,
                offset,
                value,
                response_needed,
            } => {
                if response_needed {
                    if let Err(e) = self.radio.send_response(&identifier, request_id, offset, &value) {
                        warn!("Failed to acknowledge write {}: {}", request_id, e);
                    }
                }
                self.on_write(&identifier, characteristic, &value);
            }
            PeripheralRadioEvent::ExecuteWrite {
                identifier,
                request_id,
            } => {
                trace!("Execute write {} from {}", request_id, identifier);
                if let Err(e) = self.radio.send_response(&identifier, request_id, 0, &[]) {
                    warn!("Failed to acknowledge execute write {}: {}", request_id, e);
                }
            }
            PeripheralRadioEvent::NotificationSent { identifier, result } => {
                self.on_notification_sent(&identifier, result);
            }
        }
    }

    fn on_client_connected(&mut self, identifier: &str) {
        if !self.state.accepts_client() {
            warn!(
                "Ignoring client {} while {}",
                identifier,
                self.phase().describe()
            );
            return;
        }
        info!("Client {} attached", identifier);
        self.state = PeripheralState::ClientAttaching(Connection::new(
            Role::Peripheral,
            PeripheralRef::new(identifier),
        ));
        self.clock.restart();
        self.events.emit(TransportEvent::ConnectedCentral {
            identifier: identifier.to_string(),
        });
        if let Err(e) = self.radio.open_mtu_link(identifier) {
            self.negotiation_failed(identifier, &format!("opening MTU link: {e}"));
        }
    }

    fn on_client_disconnected(&mut self, identifier: &str) {
        let Some(conn) = self.state.connection() else {
            trace!("Disconnect of {} without a client ignored", identifier);
            return;
        };
        if !conn.peer().matches(identifier) {
            return;
        }
        if conn.inbound_len() > 0 {
            debug!("Discarding {} bytes of partial message", conn.inbound_len());
        }
        if !matches!(self.state, PeripheralState::Ready(_)) {
            if let Err(e) = self.radio.close_mtu_link(identifier) {
                debug!("close_mtu_link after disconnect failed: {}", e);
            }
        }
        info!("Client {} detached", identifier);
        self.state = PeripheralState::Disconnected;
        self.events.emit(TransportEvent::DisconnectedCentral {
            identifier: identifier.to_string(),
        });
    }

    fn on_mtu_link_connected(&mut self, identifier: &str) {
        let PeripheralState::ClientAttaching(conn) = &self.state else {
            warn!("MTU link to {} outside attaching ignored", identifier);
            return;
        };
        if !conn.peer().matches(identifier) {
            return;
        }
        if let Err(e) = self.radio.request_link_mtu(identifier, self.mtu_candidate) {
            self.negotiation_failed(identifier, &format!("MTU request: {e}"));
            return;
        }
        debug!("Requested MTU {} from {}", self.mtu_candidate, identifier);
        self.state = match mem::replace(&mut self.state, PeripheralState::Idle) {
            PeripheralState::ClientAttaching(conn) => PeripheralState::NegotiatingMtu(conn),
            other => other,
        };
        self.clock.restart();
    }

    fn on_mtu_link_changed(&mut self, identifier: &str, result: Result<u16, RadioError>) {
        let PeripheralState::NegotiatingMtu(conn) = &mut self.state else {
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
        if let Err(e) = self.radio.close_mtu_link(identifier) {
            debug!("Closing MTU link failed: {}", e);
        }

        self.state = match mem::replace(&mut self.state, PeripheralState::Idle) {
            PeripheralState::NegotiatingMtu(mut conn) => {
                conn.mark_ready();
                PeripheralState::Ready(conn)
            }
            other => other,
        };
        info!("Link to {} ready, MTU {}", identifier, mtu);
        self.events.emit(TransportEvent::LinkReady {
            role: Role::Peripheral,
            identifier: identifier.to_string(),
            mtu,
        });
    }

    fn on_write(&mut self, identifier: &str, characteristic: uuid::Uuid, value: &[u8]) {
        let Some(service) = self.service else { return };
        if characteristic != service.write_characteristic_id {
            trace!("Write on {} ignored", characteristic);
            return;
        }
        let Some(conn) = self.state.connection_mut() else {
            trace!("Write from {} without a client ignored", identifier);
            return;
        };
        if !conn.peer().matches(identifier) {
            warn!("Write from unattached device {} ignored", identifier);
            return;
        }
        trace!("Chunk of {} bytes from {}", value.len(), identifier);
        if let Some(message) = conn.receive(value) {
            debug!("Received message of {} bytes", message.len());
            self.events
                .emit(TransportEvent::MessageReceivedWithoutResponse { message });
        }
    }

    fn on_notification_sent(&mut self, identifier: &str, result: Result<(), RadioError>) {
        let PeripheralState::Ready(conn) = &mut self.state else {
            trace!("Indication confirmation outside ready ignored");
            return;
        };
        if !conn.peer().matches(identifier) {
            return;
        }
        match result {
            Ok(()) => {
                if conn.outbound().confirm() {
                    debug!("Message to {} delivered", identifier);
                    self.events.emit(TransportEvent::MessageSent {
                        role: Role::Peripheral,
                    });
                }
                self.pump();
            }
            Err(e) => {
                let dropped = conn.outbound().fail();
                warn!("Indication to {} failed, dropped {} chunks: {}", identifier, dropped, e);
                self.events.emit(TransportEvent::SendFailed {
                    role: Role::Peripheral,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn pump(&mut self) {
        let PeripheralState::Ready(conn) = &mut self.state else { return };
        let Some(service) = self.service else { return };
        let Some(frame) = conn.outbound().next_frame() else { return };

        trace!("Indicating chunk of {} bytes", frame.len());
        if let Err(e) = self.radio.send_indication(
            &conn.peer().identifier,
            service.indication_characteristic_id,
            &frame,
        ) {
            let dropped = conn.outbound().fail();
            warn!("Indication submission failed, dropped {} chunks: {}", dropped, e);
            self.events.emit(TransportEvent::SendFailed {
                role: Role::Peripheral,
                reason: e.to_string(),
            });
        }
    }

    fn negotiation_failed(&self, identifier: &str, reason: &str) {
        warn!("Negotiation with {} failed: {}", identifier, reason);
        self.events.emit(TransportEvent::NegotiationFailed {
            role: Role::Peripheral,
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        });
    }

    fn ensure_started(&self) -> Result<(), TransportError> {
        if matches!(self.state, PeripheralState::NotStarted) {
            Err(TransportError::NotStarted(Role::Peripheral))
        } else {
            Ok(())
        }
    }
}

impl RoleMachine for PeripheralMachine {
    type RadioEvent = PeripheralRadioEvent;

    fn on_radio_event(&mut self, event: PeripheralRadioEvent) {
        self.handle_radio_event(event);
    }

    fn negotiation_epoch(&self) -> Option<u64> {
        match self.state {
            PeripheralState::ClientAttaching(_) | PeripheralState::NegotiatingMtu(_) => {
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
        if let Some(identifier) = self.state.connection().map(|c| c.peer().identifier.clone()) {
            self.negotiation_failed(&identifier, &format!("timed out while {phase}"));
        }
    }

    fn shutdown(&mut self) {
        if !matches!(self.state, PeripheralState::NotStarted) {
            let _ = self.stop();
        }
    }
}
