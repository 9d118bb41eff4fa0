//! Coordination Messages
//!
//! The tagged union carried by every coordination datagram, keyed by
//! [`Opcode`]. Each variant holds exactly the identity/correlation/payload
//! fields its exchange needs. Cache-manager and SNMP traffic rides the same
//! transport but stays opaque here; it is routed to registered handlers
//! without inspecting the payload.

use crate::types::{KidId, QuestionerId, RequestId, StrandCoord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable opcode set consumed by the coordination layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    RegisterStrand,
    StrandRegistered,
    FindStrand,
    StrandReady,
    SharedListenRequest,
    SharedListenResponse,
    SynchronizationRequest,
    SynchronizationResponse,
    KidCompletedStartup,
    CacheMgrRequest,
    CacheMgrResponse,
    SnmpRequest,
    SnmpResponse,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Parameters of a listening socket a strand wants the Coordinator to open
/// (or reuse) on its behalf. The response carries the open descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenSpec {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// One coordination exchange, selected by opcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Strand -> Coordinator: join (or re-join) the instance
    RegisterStrand {
        coord: StrandCoord,
        questioner: QuestionerId,
    },
    /// Coordinator -> strand: registration acknowledged; `coord` echoes the
    /// registry entry (kid id and pid) so the receiver can verify identity
    StrandRegistered { coord: StrandCoord },

    /// Strand -> Coordinator: find the strand advertising `tag`
    FindStrand {
        coord: StrandCoord,
        request: RequestId,
        tag: String,
    },
    /// Coordinator -> strand: the strand responsible for the requested tag
    StrandReady {
        request: RequestId,
        coord: StrandCoord,
    },

    /// Strand -> Coordinator: open (or reuse) a shared listening socket
    SharedListenRequest {
        coord: StrandCoord,
        request: RequestId,
        spec: ListenSpec,
    },
    /// Coordinator -> strand: listen outcome; `error` is an errno-style code
    /// (zero on success) and the descriptor itself travels out of band as
    /// ancillary data on the same datagram
    SharedListenResponse { request: RequestId, error: i32 },

    /// Strand -> Coordinator: block me until the whole cohort is ready
    SynchronizationRequest {
        coord: StrandCoord,
        questioner: QuestionerId,
    },
    /// Coordinator -> strand: the barrier has been crossed
    SynchronizationResponse { kid: KidId },

    /// Strand -> Coordinator: my own startup finished (fire-and-forget)
    KidCompletedStartup { kid: KidId },

    /// Opaque cache-manager aggregation traffic, routed to handlers
    CacheMgrRequest {
        coord: StrandCoord,
        request: RequestId,
        payload: Vec<u8>,
    },
    CacheMgrResponse {
        request: RequestId,
        payload: Vec<u8>,
    },

    /// Opaque SNMP traffic, routed to handlers
    SnmpRequest {
        coord: StrandCoord,
        request: RequestId,
        payload: Vec<u8>,
    },
    SnmpResponse {
        request: RequestId,
        payload: Vec<u8>,
    },
}

impl Message {
    /// The opcode selecting this variant
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::RegisterStrand { .. } => Opcode::RegisterStrand,
            Message::StrandRegistered { .. } => Opcode::StrandRegistered,
            Message::FindStrand { .. } => Opcode::FindStrand,
            Message::StrandReady { .. } => Opcode::StrandReady,
            Message::SharedListenRequest { .. } => Opcode::SharedListenRequest,
            Message::SharedListenResponse { .. } => Opcode::SharedListenResponse,
            Message::SynchronizationRequest { .. } => Opcode::SynchronizationRequest,
            Message::SynchronizationResponse { .. } => Opcode::SynchronizationResponse,
            Message::KidCompletedStartup { .. } => Opcode::KidCompletedStartup,
            Message::CacheMgrRequest { .. } => Opcode::CacheMgrRequest,
            Message::CacheMgrResponse { .. } => Opcode::CacheMgrResponse,
            Message::SnmpRequest { .. } => Opcode::SnmpRequest,
            Message::SnmpResponse { .. } => Opcode::SnmpResponse,
        }
    }
}
