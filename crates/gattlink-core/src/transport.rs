//! Role tasks and host handles
//!
//! Each role runs as one tokio task that owns its state machine and handles,
//! one at a time, host commands, radio callbacks and the negotiation
//! deadline. Host handles are cheap to clone and talk to the task over a
//! bounded channel; every call waits for the machine's answer.

use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::ble::{CentralRadio, CentralRadioEvent, PeripheralRadio, PeripheralRadioEvent};
use crate::config::TransportSettings;
use crate::error::TransportError;
use crate::events::{EventEmitter, EventStream};
use crate::link::{CentralMachine, CentralPhase, PeripheralMachine, PeripheralPhase};
use crate::protocol::ServiceDescriptor;

const COMMAND_QUEUE: usize = 16;

/// What a role task needs from the machine it drives.
pub trait RoleMachine: Send + 'static {
    type RadioEvent: Send + 'static;

    fn on_radio_event(&mut self, event: Self::RadioEvent);

    /// Epoch of the negotiation currently waiting on the radio, if any.
    fn negotiation_epoch(&self) -> Option<u64>;

    fn on_negotiation_timeout(&mut self, epoch: u64);

    /// The last handle went away.
    fn shutdown(&mut self);
}

type Command<M> = Box<dyn FnOnce(&mut M) + Send>;

struct RoleHandle<M> {
    tx: mpsc::Sender<Command<M>>,
}

impl<M> Clone for RoleHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: RoleMachine> RoleHandle<M> {
    fn spawn(
        machine: M,
        radio_events: mpsc::UnboundedReceiver<M::RadioEvent>,
        negotiation_timeout: Option<Duration>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(drive(machine, rx, radio_events, negotiation_timeout));
        Self { tx }
    }

    async fn call<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut M) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command: Command<M> = Box::new(move |machine| {
            let _ = reply_tx.send(f(machine));
        });
        self.tx
            .send(command)
            .await
            .map_err(|_| TransportError::Shutdown)?;
        reply_rx.await.map_err(|_| TransportError::Shutdown)
    }
}

async fn drive<M: RoleMachine>(
    mut machine: M,
    mut commands: mpsc::Receiver<Command<M>>,
    mut radio_events: mpsc::UnboundedReceiver<M::RadioEvent>,
    negotiation_timeout: Option<Duration>,
) {
    let mut radio_open = true;
    let mut deadline: Option<(u64, Instant)> = None;

    loop {
        deadline = match (machine.negotiation_epoch(), negotiation_timeout) {
            (Some(epoch), Some(limit)) => match deadline {
                Some((armed, at)) if armed == epoch => Some((armed, at)),
                _ => Some((epoch, Instant::now() + limit)),
            },
            _ => None,
        };
        let expiry = async move {
            match deadline {
                Some((_, at)) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command(&mut machine),
                None => break,
            },
            event = radio_events.recv(), if radio_open => match event {
                Some(event) => machine.on_radio_event(event),
                None => {
                    warn!("Radio event channel closed");
                    radio_open = false;
                }
            },
            () = expiry => {
                if let Some((epoch, _)) = deadline.take() {
                    machine.on_negotiation_timeout(epoch);
                }
            }
        }
    }

    machine.shutdown();
    debug!("Role task finished");
}

/// Host side of the central role.
#[derive(Clone)]
pub struct CentralHandle {
    inner: RoleHandle<CentralMachine>,
}

impl CentralHandle {
    pub async fn start(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.start()).await?
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.stop()).await?
    }

    pub async fn set_service(&self, service: ServiceDescriptor) -> Result<(), TransportError> {
        self.inner.call(move |m| m.set_service(service)).await?
    }

    pub async fn scan(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.scan()).await?
    }

    pub async fn stop_scan(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.stop_scan()).await?
    }

    pub async fn connect(&self, identifier: impl Into<String>) -> Result<(), TransportError> {
        let identifier = identifier.into();
        self.inner.call(move |m| m.connect(&identifier)).await?
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.disconnect()).await?
    }

    /// Returns once the first chunk was handed to the radio. Completion is
    /// reported as `MessageSent` or `SendFailed`.
    pub async fn write(&self, message: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        let message = message.into();
        self.inner.call(move |m| m.write(&message)).await?
    }

    pub async fn phase(&self) -> Result<CentralPhase, TransportError> {
        self.inner.call(|m| m.phase()).await
    }

    pub async fn negotiated_mtu(&self) -> Result<Option<u16>, TransportError> {
        self.inner.call(|m| m.negotiated_mtu()).await
    }
}

/// Host side of the peripheral role.
#[derive(Clone)]
pub struct PeripheralHandle {
    inner: RoleHandle<PeripheralMachine>,
}

impl PeripheralHandle {
    pub async fn start(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.start()).await?
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.stop()).await?
    }

    pub async fn set_service(&self, service: ServiceDescriptor) -> Result<(), TransportError> {
        self.inner.call(move |m| m.set_service(service)).await?
    }

    pub async fn advertise(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.advertise()).await?
    }

    pub async fn stop_advertising(&self) -> Result<(), TransportError> {
        self.inner.call(|m| m.stop_advertising()).await?
    }

    /// Returns once the first chunk was handed to the radio.
    pub async fn indicate(&self, message: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        let message = message.into();
        self.inner.call(move |m| m.indicate(&message)).await?
    }

    pub async fn phase(&self) -> Result<PeripheralPhase, TransportError> {
        self.inner.call(|m| m.phase()).await
    }

    pub async fn negotiated_mtu(&self) -> Result<Option<u16>, TransportError> {
        self.inner.call(|m| m.negotiated_mtu()).await
    }
}

/// Entry point: spawns role tasks that share one event stream.
pub struct Transport {
    settings: TransportSettings,
    events: EventEmitter,
}

impl Transport {
    pub fn new(settings: TransportSettings) -> (Self, EventStream) {
        let (events, stream) = EventEmitter::channel();
        (Self { settings, events }, stream)
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Must be called inside a tokio runtime.
    pub fn spawn_central<R>(
        &self,
        radio: R,
        radio_events: mpsc::UnboundedReceiver<CentralRadioEvent>,
    ) -> CentralHandle
    where
        R: CentralRadio + 'static,
    {
        info!("Spawning central role");
        let machine = CentralMachine::new(Box::new(radio), self.events.clone(), &self.settings);
        CentralHandle {
            inner: RoleHandle::spawn(
                machine,
                radio_events,
                self.settings.negotiation_timeout(),
            ),
        }
    }

    /// Must be called inside a tokio runtime.
    pub fn spawn_peripheral<R>(
        &self,
        radio: R,
        radio_events: mpsc::UnboundedReceiver<PeripheralRadioEvent>,
    ) -> PeripheralHandle
    where
        R: PeripheralRadio + 'static,
    {
        info!("Spawning peripheral role");
        let machine =
            PeripheralMachine::new(Box::new(radio), self.events.clone(), &self.settings);
        PeripheralHandle {
            inner: RoleHandle::spawn(
                machine,
                radio_events,
                self.settings.negotiation_timeout(),
            ),
        }
    }
}
