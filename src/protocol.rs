//! Message framing.
//!
//! A client sends one message terminated by a single newline. The server
//! reads it in fixed-size chunks and classifies each chunk as it arrives:
//!
//! ```text
//! "hel"        -> Partial
//! "lo\n"       -> Final
//! "lo\nmore"   -> ProtocolViolation { trailing: 4 }
//! ```
//!
//! Bytes after the delimiter in the same chunk are rejected rather than
//! buffered as the start of another message.

use thiserror::Error;

/// End-of-message marker.
pub const DELIMITER: u8 = b'\n';

/// Classification of one inbound chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// No delimiter yet; more chunks follow.
    Partial,
    /// The chunk's last byte is the delimiter.
    Final,
}

/// Data followed the delimiter within a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Unexpected data after new-line ({trailing} trailing byte(s))")]
pub struct ProtocolViolation {
    /// Number of bytes after the delimiter.
    pub trailing: usize,
}

/// Classify a chunk read from the client.
pub fn classify(chunk: &[u8]) -> Result<Chunk, ProtocolViolation> {
    match chunk.iter().position(|&b| b == DELIMITER) {
        None => Ok(Chunk::Partial),
        Some(pos) if pos + 1 == chunk.len() => Ok(Chunk::Final),
        Some(pos) => Err(ProtocolViolation {
            trailing: chunk.len() - pos - 1,
        }),
    }
}
