//! Host-facing event channel
//!
//! Both role tasks share one [`EventEmitter`]. Events reach the single
//! [`EventStream`] subscriber in the order the state transitions happened,
//! once per transition. Nothing is buffered for a subscriber that went away.

use crate::link::Role;
use base64::{Engine as _, engine::general_purpose};
use futures_util::Stream;
use log::{debug, trace};
use serde::{Serialize, Serializer};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Something the host should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportEvent {
    /// A device showed up while scanning.
    PeripheralDiscovered { identifier: String },
    /// Central link established.
    ConnectedPeripheral { identifier: String },
    /// Central link gone.
    DisconnectedPeripheral { identifier: String },
    /// A client attached to the peripheral.
    ConnectedCentral { identifier: String },
    /// The attached client left.
    DisconnectedCentral { identifier: String },
    /// Complete message received by the central.
    MessageReceived {
        #[serde(serialize_with = "as_base64")]
        message: Vec<u8>,
    },
    /// Complete message received by the peripheral.
    MessageReceivedWithoutResponse {
        #[serde(serialize_with = "as_base64")]
        message: Vec<u8>,
    },
    /// MTU settled, sends are accepted from now on.
    LinkReady {
        role: Role,
        identifier: String,
        mtu: u16,
    },
    /// Service discovery or MTU negotiation failed; disconnect and retry.
    NegotiationFailed {
        role: Role,
        identifier: String,
        reason: String,
    },
    /// The terminator of the last sent message was confirmed.
    MessageSent { role: Role },
    /// A chunk was not delivered; the rest of the message was dropped.
    SendFailed { role: Role, reason: String },
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::PeripheralDiscovered { .. } => "peripheralDiscovered",
            TransportEvent::ConnectedPeripheral { .. } => "connectedPeripheral",
            TransportEvent::DisconnectedPeripheral { .. } => "disconnectedPeripheral",
            TransportEvent::ConnectedCentral { .. } => "connectedCentral",
            TransportEvent::DisconnectedCentral { .. } => "disconnectedCentral",
            TransportEvent::MessageReceived { .. } => "messageReceived",
            TransportEvent::MessageReceivedWithoutResponse { .. } => {
                "messageReceivedWithoutResponse"
            }
            TransportEvent::LinkReady { .. } => "linkReady",
            TransportEvent::NegotiationFailed { .. } => "negotiationFailed",
            TransportEvent::MessageSent { .. } => "messageSent",
            TransportEvent::SendFailed { .. } => "sendFailed",
        }
    }
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
}

/// Sending half, cloned into every role task.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            EventStream { rx },
        )
    }

    pub fn emit(&self, event: TransportEvent) {
        debug!("Emitting {}", event.name());
        if self.tx.send(event).is_err() {
            trace!("Event dropped, no subscriber");
        }
    }
}

/// Receiving half handed to the host.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventStream {
    /// Next event, `None` once every emitter is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_keep_emission_order() {
        let (emitter, mut stream) = EventEmitter::channel();
        emitter.emit(TransportEvent::ConnectedPeripheral {
            identifier: "AA".into(),
        });
        emitter.emit(TransportEvent::MessageReceived {
            message: b"hi".to_vec(),
        });

        assert_eq!(
            stream.try_recv(),
            Some(TransportEvent::ConnectedPeripheral {
                identifier: "AA".into()
            })
        );
        assert_eq!(
            stream.try_recv().map(|e| e.name()),
            Some("messageReceived")
        );
        assert_eq!(stream.try_recv(), None);
    }

    #[test]
    fn test_emit_without_subscriber_is_silent() {
        let (emitter, stream) = EventEmitter::channel();
        drop(stream);
        emitter.emit(TransportEvent::MessageSent {
            role: Role::Central,
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = TransportEvent::MessageReceivedWithoutResponse {
            message: b"hi".to_vec(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "messageReceivedWithoutResponse");
        assert_eq!(json["message"], "aGk=");

        let ready = TransportEvent::LinkReady {
            role: Role::Peripheral,
            identifier: "AA".into(),
            mtu: 512,
        };
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["role"], "peripheral");
        assert_eq!(json["mtu"], 512);
    }
}
