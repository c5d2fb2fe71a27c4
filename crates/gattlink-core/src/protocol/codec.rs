//! Chunk codec
//!
//! A message travels as a run of data chunks followed by one end-of-message
//! chunk whose wire value is the ASCII bytes `EOM`:
//!
//! ```text
//! "ABCDEFG" @ 3 bytes/chunk  ->  "ABC" | "DEF" | "G" | "EOM"
//! ```
//!
//! The terminator is recognised by value. A data slice that happens to be
//! exactly `EOM` is therefore split in two before it goes on the air, so a
//! receiver never sees the sentinel value in isolation except as the real
//! terminator.

/// Wire value of the end-of-message chunk.
pub const EOM: &[u8; 3] = b"EOM";

/// One unit of a framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    Eom,
}

impl Chunk {
    /// Classify a value received from the air.
    pub fn from_wire(value: &[u8]) -> Self {
        if value == EOM {
            Chunk::Eom
        } else {
            Chunk::Data(value.to_vec())
        }
    }

    pub fn is_eom(&self) -> bool {
        matches!(self, Chunk::Eom)
    }
}

/// Split `message` into `chunk_size`-byte data chunks and terminate with `Eom`.
///
/// `chunk_size` must already account for any per-packet overhead; values
/// below 1 are treated as 1. An empty message yields only `Eom`.
pub fn encode(message: &[u8], chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks: Vec<Chunk> = message
        .chunks(chunk_size)
        .map(|slice| Chunk::Data(slice.to_vec()))
        .collect();
    chunks.push(Chunk::Eom);
    chunks
}

/// Apply one chunk to `buffer`.
///
/// Returns the completed message on `Eom` and leaves `buffer` empty.
pub fn decode(chunk: Chunk, buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    match chunk {
        Chunk::Eom => Some(std::mem::take(buffer)),
        Chunk::Data(bytes) => {
            buffer.extend_from_slice(&bytes);
            None
        }
    }
}

/// Encode `message` into the exact values written to the air, in order.
pub fn wire_frames(message: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for chunk in encode(message, chunk_size) {
        match chunk {
            Chunk::Eom => frames.push(EOM.to_vec()),
            Chunk::Data(bytes) if bytes == EOM => {
                frames.push(bytes[..2].to_vec());
                frames.push(bytes[2..].to_vec());
            }
            Chunk::Data(bytes) => frames.push(bytes),
        }
    }
    frames
}

/// Inbound half of the codec, owning the accumulation buffer of one link.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one value received from the air.
    ///
    /// Returns `Some(message)` when the value terminated a message.
    pub fn push(&mut self, value: &[u8]) -> Option<Vec<u8>> {
        decode(Chunk::from_wire(value), &mut self.buffer)
    }

    /// Discard a partially assembled message.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}
