//! Coordination Identities
//!
//! Small value types that travel inside every coordination message: who a
//! strand is, who asked a question, and which question an answer belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable role-slot integer identifying a strand for the instance lifetime.
/// The Coordinator itself is kid 0; workers and disk processes are 1-based.
pub type KidId = u32;

/// Identity of one strand: role slot, OS process id, and an optional
/// well-known tag other strands can search by (e.g. a cache-directory path).
///
/// A copy travels inside every message a strand sends. The Coordinator's
/// registry owns the authoritative entry and overwrites it on
/// re-registration after a strand restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandCoord {
    pub kid: KidId,
    pub pid: i32,
    pub tag: Option<String>,
}

impl StrandCoord {
    /// Identity for the calling process
    pub fn new(kid: KidId, tag: Option<String>) -> Self {
        Self {
            kid,
            pid: std::process::id() as i32,
            tag,
        }
    }

    /// True when this coord advertises the given tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag.as_deref() == Some(tag)
    }
}

impl fmt::Display for StrandCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "kid{} (pid {}, tag {:?})", self.kid, self.pid, tag),
            None => write!(f, "kid{} (pid {})", self.kid, self.pid),
        }
    }
}

/// OS process id of the asker, captured at send time.
///
/// Response receivers compare this against their own current identity to
/// reject answers addressed to a previous incarnation of the same kid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuestionerId(pub i32);

impl QuestionerId {
    /// Capture the calling process's identity
    pub fn mine() -> Self {
        Self(std::process::id() as i32)
    }

    /// True when the answer was addressed to this process
    pub fn is_mine(&self) -> bool {
        self.0 == std::process::id() as i32
    }
}

impl fmt::Display for QuestionerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Correlates an asynchronous request with its eventual response.
///
/// Created by the asker, echoed unchanged by the answerer, never interpreted
/// in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub questioner: QuestionerId,
    pub index: u64,
}

impl RequestId {
    pub fn new(questioner: QuestionerId, index: u64) -> Self {
        Self { questioner, index }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.questioner, self.index)
    }
}
