//! Frame Codec
//!
//! One coordination message per datagram: a 6-byte preamble (magic + protocol
//! version) followed by the bincode-encoded record. The preamble rejects
//! foreign or stale-version traffic before any field is interpreted.

use crate::message::Message;
use thiserror::Error;

/// First four bytes of every frame
pub const FRAME_MAGIC: u32 = 0x5746_5401; // "WFT" + 0x01

/// Bumped whenever the record layout changes incompatibly
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound for one coordination datagram. Every variant encodes far
/// below this; anything larger is a protocol violation, not a truncation.
pub const MAX_FRAME: usize = 8 * 1024;

const PREAMBLE_LEN: usize = 6;

/// Frame encode/decode failures
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame too short: {len} bytes")]
    Truncated { len: usize },

    #[error("bad frame magic: expected {expected:#010x}, got {got:#010x}")]
    BadMagic { expected: u32, got: u32 },

    #[error("unsupported protocol version: expected {expected}, got {got}")]
    BadVersion { expected: u16, got: u16 },

    #[error("frame exceeds {MAX_FRAME} bytes: {len}")]
    Oversized { len: usize },

    #[error("record encoding failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("record decoding failed: {0}")]
    Decode(#[source] bincode::Error),
}

/// Encode a message into a single transmittable frame
pub fn encode(message: &Message) -> crate::Result<Vec<u8>> {
    let body = bincode::serialize(message).map_err(WireError::Encode)?;
    let len = PREAMBLE_LEN + body.len();
    if len > MAX_FRAME {
        return Err(WireError::Oversized { len });
    }

    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    frame.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one received frame back into a message
pub fn decode(frame: &[u8]) -> crate::Result<Message> {
    if frame.len() > MAX_FRAME {
        return Err(WireError::Oversized { len: frame.len() });
    }
    if frame.len() < PREAMBLE_LEN {
        return Err(WireError::Truncated { len: frame.len() });
    }

    let magic = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if magic != FRAME_MAGIC {
        return Err(WireError::BadMagic {
            expected: FRAME_MAGIC,
            got: magic,
        });
    }

    let version = u16::from_le_bytes([frame[4], frame[5]]);
    if version != PROTOCOL_VERSION {
        return Err(WireError::BadVersion {
            expected: PROTOCOL_VERSION,
            got: version,
        });
    }

    bincode::deserialize(&frame[PREAMBLE_LEN..]).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QuestionerId, RequestId, StrandCoord};

    #[test]
    fn roundtrip_registration() {
        let msg = Message::RegisterStrand {
            coord: StrandCoord {
                kid: 2,
                pid: 4242,
                tag: Some("/cache/disk0".to_string()),
            },
            questioner: QuestionerId(4242),
        };

        let frame = encode(&msg).unwrap();
        assert_eq!(&frame[..4], FRAME_MAGIC.to_le_bytes().as_slice());
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn roundtrip_shared_listen() {
        let msg = Message::SharedListenResponse {
            request: RequestId::new(QuestionerId(77), 3),
            error: 0,
        };
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn rejects_bad_magic() {
        let msg = Message::KidCompletedStartup { kid: 1 };
        let mut frame = encode(&msg).unwrap();
        frame[0] ^= 0xff;
        assert!(matches!(decode(&frame), Err(WireError::BadMagic { .. })));
    }

    #[test]
    fn rejects_stale_version() {
        let msg = Message::KidCompletedStartup { kid: 1 };
        let mut frame = encode(&msg).unwrap();
        frame[4] = 0xfe;
        assert!(matches!(decode(&frame), Err(WireError::BadVersion { .. })));
    }

    #[test]
    fn rejects_short_frames() {
        assert!(matches!(
            decode(&[0x01, 0x02]),
            Err(WireError::Truncated { len: 2 })
        ));
    }

    #[test]
    fn rejects_oversized_payload() {
        let msg = Message::CacheMgrRequest {
            coord: StrandCoord {
                kid: 1,
                pid: 1,
                tag: None,
            },
            request: RequestId::new(QuestionerId(1), 1),
            payload: vec![0u8; MAX_FRAME],
        };
        assert!(matches!(encode(&msg), Err(WireError::Oversized { .. })));
    }

    #[test]
    fn rejects_garbage_body() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        frame.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        frame.extend_from_slice(&[0xff; 16]);
        assert!(matches!(decode(&frame), Err(WireError::Decode(_))));
    }
}
