//! Messages exchanged between rollback endpoints over the rollback channel.

use serde::{Deserialize, Serialize};

use crate::network::codec::{self, CodecOperation, CodecResult};
use crate::Frame;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    pub random_request: u32, // please reply back with this random data
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    pub random_reply: u32, // here's your random data back
}

/// A run of consecutive inputs starting at `start_frame`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub disconnect_requested: bool,
    pub start_frame: Frame,
    pub ack_frame: Frame,
    /// Codec encoding of `Vec<I>`, one input per frame.
    pub bytes: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            disconnect_requested: false,
            start_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            bytes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            disconnect_requested,
            start_frame,
            ack_frame,
            bytes,
        } = self;

        f.debug_struct("Input")
            .field("disconnect_requested", disconnect_requested)
            .field("start_frame", start_frame)
            .field("ack_frame", ack_frame)
            .field("bytes", &BytesDebug(bytes))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    pub frame_advantage: i16,
    pub ping: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct ChecksumReport {
    pub checksum: u32,
    pub frame: Frame,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    /// Reset cookie of the session that created the sending engine.
    pub epoch: u32,
    pub magic: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    ChecksumReport(ChecksumReport),
    KeepAlive,
}

/// One rollback-channel datagram.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        codec::encode(self).map_err(|e| e.during(CodecOperation::EncodeRollback))
    }

    /// Trailing bytes after a complete message are ignored.
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        codec::decode_value(bytes).map_err(|e| e.during(CodecOperation::DecodeRollback))
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn input_default_is_empty() {
        let input = Input::default();
        assert!(!input.disconnect_requested);
        assert_eq!(input.start_frame, Frame::NULL);
        assert_eq!(input.ack_frame, Frame::NULL);
        assert!(input.bytes.is_empty());
    }

    #[test]
    fn input_debug_prints_hex_payload() {
        let input = Input {
            disconnect_requested: true,
            start_frame: Frame::new(10),
            ack_frame: Frame::new(5),
            bytes: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let debug = format!("{:?}", input);
        assert!(debug.contains("disconnect_requested"));
        assert!(debug.contains("0xdeadbeef"));
    }

    #[test]
    fn message_survives_the_wire() {
        let msg = Message {
            header: MessageHeader {
                epoch: 3,
                magic: 0x1234,
            },
            body: MessageBody::ChecksumReport(ChecksumReport {
                checksum: 0xCAFE_BABE,
                frame: Frame::new(64),
            }),
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(Message::from_bytes(&[0xFF; 3]).is_err());
        assert!(Message::from_bytes(&[]).is_err());
    }
}
