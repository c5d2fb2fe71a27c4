//! Link state machines
//!
//! One machine per GATT role. Each owns at most one [`Connection`], reached
//! only through the machine's state, and is driven serially by its role task
//! (see [`crate::transport`]).

pub mod central;
pub mod peripheral;

use crate::error::TransportError;
use crate::protocol::codec::{Reassembler, wire_frames};
use crate::protocol::gate::ChunkPump;
use crate::protocol::{ATT_HEADER_LEN, DEFAULT_MTU, PeripheralRef};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use central::{CentralMachine, CentralPhase};
pub use peripheral::{PeripheralMachine, PeripheralPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Central,
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Central => f.write_str("central"),
            Role::Peripheral => f.write_str("peripheral"),
        }
    }
}

/// State of one active link.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    peer: PeripheralRef,
    negotiated_mtu: u16,
    mtu_settled: bool,
    outbound: ChunkPump,
    inbound: Reassembler,
}

impl Connection {
    pub fn new(role: Role, peer: PeripheralRef) -> Self {
        Self {
            role,
            peer,
            negotiated_mtu: DEFAULT_MTU,
            mtu_settled: false,
            outbound: ChunkPump::new(),
            inbound: Reassembler::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &PeripheralRef {
        &self.peer
    }

    pub fn negotiated_mtu(&self) -> u16 {
        self.negotiated_mtu
    }

    /// Central → peripheral direction may submit a chunk.
    pub fn write_ready(&self) -> bool {
        self.role == Role::Central && self.outbound.is_ready()
    }

    /// Peripheral → central direction may submit a chunk.
    pub fn indicate_ready(&self) -> bool {
        self.role == Role::Peripheral && self.outbound.is_ready()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Record the outcome of the MTU exchange.
    ///
    /// The first result is final and never lowers the default floor.
    pub fn settle_mtu(&mut self, mtu: u16) -> u16 {
        if !self.mtu_settled {
            self.negotiated_mtu = self.negotiated_mtu.max(mtu);
            self.mtu_settled = true;
        }
        self.negotiated_mtu
    }

    /// Payload bytes one chunk may carry.
    pub fn chunk_size(&self) -> usize {
        usize::from(self.negotiated_mtu.saturating_sub(ATT_HEADER_LEN)).max(1)
    }

    /// The link is usable: open the outbound gate.
    pub(crate) fn mark_ready(&mut self) {
        self.outbound.arm();
    }

    pub(crate) fn queue_message(&mut self, message: &[u8]) -> Result<usize, TransportError> {
        let frames = wire_frames(message, self.chunk_size());
        let count = frames.len();
        self.outbound.load(frames)?;
        Ok(count)
    }

    pub(crate) fn outbound(&mut self) -> &mut ChunkPump {
        &mut self.outbound
    }

    pub(crate) fn receive(&mut self, value: &[u8]) -> Option<Vec<u8>> {
        self.inbound.push(value)
    }
}

/// Epoch counter behind the negotiation deadline.
///
/// Every entry into a negotiating state starts a new epoch; the driver arms a
/// deadline per epoch and reports expiry back with the epoch it armed.
#[derive(Debug, Default)]
pub(crate) struct NegotiationClock {
    epoch: u64,
    expired: bool,
}

impl NegotiationClock {
    pub(crate) fn restart(&mut self) {
        self.epoch += 1;
        self.expired = false;
    }

    pub(crate) fn armed(&self) -> Option<u64> {
        (!self.expired).then_some(self.epoch)
    }

    /// Whether `epoch` is the running one; marks it expired if so.
    pub(crate) fn expire(&mut self, epoch: u64) -> bool {
        if self.expired || epoch != self.epoch {
            return false;
        }
        self.expired = true;
        true
    }
}
