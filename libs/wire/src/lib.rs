//! Wire Protocol
//!
//! Message types and framing shared between the Coordinator and strand
//! processes. Every coordination exchange is a single datagram: a fixed
//! magic/version preamble followed by one opcode-tagged record. Frames are
//! value types; they are copied whole into the transport and never aliased.

pub mod codec;
pub mod endpoint;
pub mod message;
pub mod types;

// Re-export commonly used types
pub use codec::{decode, encode, WireError, FRAME_MAGIC, MAX_FRAME, PROTOCOL_VERSION};
pub use endpoint::{coordinator_endpoint, strand_endpoint};
pub use message::{ListenSpec, Message, Opcode};
pub use types::{KidId, QuestionerId, RequestId, StrandCoord};

/// Result type alias for wire operations
pub type Result<T> = std::result::Result<T, WireError>;
