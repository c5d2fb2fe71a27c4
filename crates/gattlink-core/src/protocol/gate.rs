//! Readiness gate and the outbound chunk pump built on it.
//!
//! The gate is closed the moment a chunk is handed to the radio and opened
//! only by that chunk's delivery confirmation. [`ChunkPump::next_frame`] is
//! the single place frames leave the pump and it yields nothing while the
//! gate is closed.

use crate::error::TransportError;
use std::collections::VecDeque;

/// Per-direction flow-control flag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessGate {
    ready: bool,
}

impl ReadinessGate {
    /// A gate that blocks until the first [`open`](Self::open).
    pub fn closed() -> Self {
        Self { ready: false }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Delivery confirmed (or link became usable).
    pub fn open(&mut self) {
        self.ready = true;
    }

    fn close(&mut self) {
        self.ready = false;
    }
}

/// Frames of the one message currently draining, behind a [`ReadinessGate`].
#[derive(Debug, Default)]
pub struct ChunkPump {
    gate: ReadinessGate,
    pending: VecDeque<Vec<u8>>,
    in_flight: bool,
    // the frame in flight belongs to an abandoned message
    orphaned: bool,
}

impl ChunkPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    /// Still sending a message: frames queued or one awaiting confirmation.
    pub fn is_draining(&self) -> bool {
        self.in_flight || !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Open the gate for the first time once the link is usable.
    pub fn arm(&mut self) {
        if !self.in_flight {
            self.gate.open();
        }
    }

    /// Queue the frames of a new message.
    ///
    /// Rejected with [`TransportError::Busy`] while a previous message drains.
    pub fn load(&mut self, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        if self.is_draining() || !self.gate.is_ready() {
            return Err(TransportError::Busy);
        }
        self.pending.extend(frames);
        Ok(())
    }

    /// Take the next frame to submit, closing the gate behind it.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if !self.gate.is_ready() {
            return None;
        }
        let frame = self.pending.pop_front()?;
        self.gate.close();
        self.in_flight = true;
        Some(frame)
    }

    /// Delivery confirmation for the frame in flight.
    ///
    /// Returns `true` when that frame was the last one of its message. A
    /// confirmation with nothing in flight is ignored.
    pub fn confirm(&mut self) -> bool {
        if !self.in_flight {
            return false;
        }
        let finished = self.pending.is_empty() && !self.orphaned;
        self.in_flight = false;
        self.orphaned = false;
        self.gate.open();
        finished
    }

    /// The frame in flight was not delivered: drop the rest of its message.
    ///
    /// Returns how many frames were never submitted.
    pub fn fail(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.in_flight = false;
        self.orphaned = false;
        self.gate.open();
        dropped
    }

    /// Drop the frames not yet submitted.
    ///
    /// A frame already handed to the radio stays in flight and keeps the
    /// gate closed until its confirmation arrives.
    pub fn abandon(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if self.in_flight {
            self.orphaned = true;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(values: &[&[u8]]) -> Vec<Vec<u8>> {
        values.iter().map(|v| v.to_vec()).collect()
    }

    #[test]
    fn test_gate_starts_closed() {
        let gate = ReadinessGate::closed();
        assert!(!gate.is_ready());

        let mut pump = ChunkPump::new();
        assert!(matches!(pump.load(frames(&[b"a"])), Err(TransportError::Busy)));
        assert_eq!(pump.next_frame(), None);
    }

    #[test]
    fn test_one_frame_in_flight() {
        let mut pump = ChunkPump::new();
        pump.arm();
        pump.load(frames(&[b"ABC", b"DEF", b"EOM"])).unwrap();

        assert_eq!(pump.next_frame(), Some(b"ABC".to_vec()));
        assert!(!pump.is_ready());
        assert_eq!(pump.next_frame(), None);

        assert!(!pump.confirm());
        assert_eq!(pump.next_frame(), Some(b"DEF".to_vec()));
        assert!(!pump.confirm());
        assert_eq!(pump.next_frame(), Some(b"EOM".to_vec()));
        assert!(pump.confirm());

        assert!(!pump.is_draining());
        assert!(pump.is_ready());
    }

    #[test]
    fn test_second_message_rejected_while_draining() {
        let mut pump = ChunkPump::new();
        pump.arm();
        pump.load(frames(&[b"hi", b"EOM"])).unwrap();
        pump.next_frame().unwrap();

        assert!(matches!(pump.load(frames(&[b"yo"])), Err(TransportError::Busy)));
        assert_eq!(pump.pending_len(), 1);

        pump.confirm();
        pump.next_frame().unwrap();
        assert!(pump.confirm());
        pump.load(frames(&[b"yo"])).unwrap();
    }

    #[test]
    fn test_failure_reopens_gate() {
        let mut pump = ChunkPump::new();
        pump.arm();
        pump.load(frames(&[b"a", b"b", b"EOM"])).unwrap();
        pump.next_frame().unwrap();

        assert_eq!(pump.fail(), 2);
        assert!(pump.is_ready());
        assert!(!pump.is_draining());
    }

    #[test]
    fn test_abandon_waits_for_frame_in_flight() {
        let mut pump = ChunkPump::new();
        pump.arm();
        pump.load(frames(&[b"a", b"b", b"EOM"])).unwrap();
        pump.next_frame().unwrap();

        assert_eq!(pump.abandon(), 2);
        assert!(!pump.is_ready());
        assert!(pump.is_draining());
        assert!(matches!(pump.load(frames(&[b"new"])), Err(TransportError::Busy)));
        assert_eq!(pump.next_frame(), None);

        // the abandoned message never counts as delivered
        assert!(!pump.confirm());
        assert!(pump.is_ready());
        pump.load(frames(&[b"new", b"EOM"])).unwrap();
        assert_eq!(pump.next_frame(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_confirm_without_frame_in_flight_ignored() {
        let mut pump = ChunkPump::new();
        pump.arm();
        assert!(!pump.confirm());

        pump.load(frames(&[b"x", b"EOM"])).unwrap();
        pump.next_frame().unwrap();
        assert!(!pump.confirm());
        pump.next_frame().unwrap();
        assert!(pump.confirm());
        assert!(!pump.confirm());
        assert!(!pump.is_draining());
    }
}
