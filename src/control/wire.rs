//! Byte layout of control messages.
//!
//! Every message starts with an 8-byte little-endian header `{type: u32, declared_size: u32}`,
//! where `declared_size` covers the whole message including the header. The fixed part of each
//! payload is a fixed-int bincode encoding; strings are zero-padded byte arrays. Two messages
//! carry a variable tail after the fixed part: `Reset` (the snapshot, sized by its
//! `state_data_size` field) and `ChatMessage` (UTF-8 text up to `declared_size`).
//!
//! Checks run in this order, and nothing is interpreted before its check passed:
//!
//! 1. at least a header was received;
//! 2. the type is known;
//! 3. `declared_size` covers the header and the fixed payload of that type;
//! 4. at least `declared_size` bytes were received;
//! 5. `Reset`: the fixed part plus `state_data_size` fit in `declared_size`;
//!    `ChatMessage`: the text is valid UTF-8;
//! 6. enum and id fields hold known values.
//!
//! Bytes past `declared_size` are ignored.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use super::{
    CloseReason, ConnectMode, ConnectRequest, ConnectResponse, ConnectResult, ControlMessage,
    ControlMessageType, DropReason, ResetMessage, ResetRequestReason,
};
use crate::network::codec::{self, CodecError, CodecOperation, CodecResult};
use crate::peers::truncate_nickname;
use crate::reset::{Roster, RosterEntry};
use crate::{NetplayError, PlayerId, MAX_NICKNAME_LENGTH, MAX_PLAYERS};

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum password length in bytes.
pub const MAX_PASSWORD_LENGTH: usize = 32;

const CONNECT_REQUEST_SIZE: usize = 4 + 4 + MAX_NICKNAME_LENGTH + MAX_PASSWORD_LENGTH;
const CONNECT_RESPONSE_SIZE: usize = 8;
const ROSTER_ENTRY_SIZE: usize = 2 + 16 + 2 + MAX_NICKNAME_LENGTH;
const RESET_SIZE: usize = 4 + 4 + MAX_PLAYERS * ROSTER_ENTRY_SIZE + 4;
const RESET_COMPLETE_SIZE: usize = 4;
const PLAYER_JOINED_SIZE: usize = 4;
const DROP_PLAYER_SIZE: usize = 8;
const RESET_REQUEST_SIZE: usize = 8;
const CLOSE_SESSION_SIZE: usize = 4;

/// Why an inbound control packet was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlDecodeError {
    /// Fewer bytes than a header.
    MissingHeader {
        /// Bytes received.
        received: usize,
    },
    /// The type tag is not a known message.
    UnknownType {
        /// The tag.
        tag: u32,
    },
    /// `declared_size` is smaller than the fixed layout of the type.
    DeclaredTooSmall {
        /// The message type.
        kind: ControlMessageType,
        /// Declared size.
        declared: usize,
        /// Header plus fixed payload.
        required: usize,
    },
    /// Fewer bytes arrived than `declared_size`.
    Truncated {
        /// The message type.
        kind: ControlMessageType,
        /// Declared size.
        declared: usize,
        /// Bytes received.
        received: usize,
    },
    /// A `Reset` whose snapshot does not fit in the declared size.
    StateOverrun {
        /// Declared size.
        declared: usize,
        /// Header, fixed part and snapshot.
        required: usize,
    },
    /// Chat text that is not UTF-8.
    InvalidText,
    /// A field holds a value outside its domain.
    BadField {
        /// The message type.
        kind: ControlMessageType,
        /// Field name.
        field: &'static str,
        /// The offending value.
        value: i64,
    },
    /// The fixed part did not decode.
    Codec(CodecError),
}

impl fmt::Display for ControlDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHeader { received } => {
                write!(f, "packet of {received} bytes is shorter than a header")
            },
            Self::UnknownType { tag } => write!(f, "unknown control message type {tag}"),
            Self::DeclaredTooSmall {
                kind,
                declared,
                required,
            } => write!(
                f,
                "{kind:?} declares {declared} bytes but needs at least {required}"
            ),
            Self::Truncated {
                kind,
                declared,
                received,
            } => write!(
                f,
                "{kind:?} declares {declared} bytes but only {received} were received"
            ),
            Self::StateOverrun { declared, required } => write!(
                f,
                "Reset declares {declared} bytes but its state needs {required}"
            ),
            Self::InvalidText => write!(f, "chat text is not valid UTF-8"),
            Self::BadField { kind, field, value } => {
                write!(f, "{kind:?} has invalid {field} {value}")
            },
            Self::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ControlDecodeError {}

impl From<CodecError> for ControlDecodeError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err.during(CodecOperation::DecodeControl))
    }
}

impl From<ControlDecodeError> for NetplayError {
    fn from(err: ControlDecodeError) -> Self {
        NetplayError::Protocol {
            context: err.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    kind: u32,
    size: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct ConnectRequestWire {
    mode: u32,
    requested_player_id: i32,
    nickname: [u8; MAX_NICKNAME_LENGTH],
    password: [u8; MAX_PASSWORD_LENGTH],
}

#[derive(Serialize, Deserialize, Default)]
struct ConnectResponseWire {
    result: u32,
    player_id: i32,
}

#[derive(Serialize, Deserialize, Default, Clone, Copy)]
struct RosterEntryWire {
    controller_port: i16,
    ip: [u8; 16],
    port: u16,
    nickname: [u8; MAX_NICKNAME_LENGTH],
}

#[derive(Serialize, Deserialize, Default)]
struct ResetWire {
    cookie: u32,
    num_players: u32,
    players: [RosterEntryWire; MAX_PLAYERS],
    state_data_size: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct CookieWire {
    cookie: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct PlayerWire {
    player_id: i32,
}

#[derive(Serialize, Deserialize, Default)]
struct ReasonPlayerWire {
    reason: u32,
    player_id: i32,
}

#[derive(Serialize, Deserialize, Default)]
struct ReasonWire {
    reason: u32,
}

/// Bytes of the fixed payload that follows the header.
#[must_use]
pub const fn fixed_payload_size(kind: ControlMessageType) -> usize {
    match kind {
        ControlMessageType::ConnectRequest => CONNECT_REQUEST_SIZE,
        ControlMessageType::ConnectResponse => CONNECT_RESPONSE_SIZE,
        ControlMessageType::Reset => RESET_SIZE,
        ControlMessageType::ResetComplete => RESET_COMPLETE_SIZE,
        ControlMessageType::ResumeSession => 0,
        ControlMessageType::PlayerJoined => PLAYER_JOINED_SIZE,
        ControlMessageType::DropPlayer => DROP_PLAYER_SIZE,
        ControlMessageType::ResetRequest => RESET_REQUEST_SIZE,
        ControlMessageType::CloseSession => CLOSE_SESSION_SIZE,
        ControlMessageType::ChatMessage => 0,
    }
}

fn pad<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut end = text.len().min(N);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    if let (Some(dst), Some(src)) = (out.get_mut(..end), text.as_bytes().get(..end)) {
        dst.copy_from_slice(src);
    }
    out
}

fn unpad(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    truncate_nickname(&String::from_utf8_lossy(bytes.get(..end).unwrap_or_default()))
}

fn ip_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn wire_player(kind: ControlMessageType, field: &'static str, raw: i32) -> Result<PlayerId, ControlDecodeError> {
    PlayerId::from_wire(raw)
        .filter(|id| id.is_valid())
        .ok_or(ControlDecodeError::BadField {
            kind,
            field,
            value: i64::from(raw),
        })
}

fn optional_wire_player(
    kind: ControlMessageType,
    field: &'static str,
    raw: i32,
) -> Result<Option<PlayerId>, ControlDecodeError> {
    if raw < 0 {
        Ok(None)
    } else {
        wire_player(kind, field, raw).map(Some)
    }
}

fn bad_enum(kind: ControlMessageType, field: &'static str, raw: u32) -> ControlDecodeError {
    ControlDecodeError::BadField {
        kind,
        field,
        value: i64::from(raw),
    }
}

fn encode_roster(roster: &Roster) -> [RosterEntryWire; MAX_PLAYERS] {
    let mut players = [RosterEntryWire {
        controller_port: -1,
        ..RosterEntryWire::default()
    }; MAX_PLAYERS];
    for (wire, entry) in players.iter_mut().zip(roster.slots()) {
        if let Some(entry) = entry {
            *wire = RosterEntryWire {
                controller_port: i16::try_from(entry.controller_port).unwrap_or(i16::MAX),
                ip: ip_octets(entry.address.ip()),
                port: entry.address.port(),
                nickname: pad(&entry.nickname),
            };
        }
    }
    players
}

fn decode_roster(wire: &ResetWire) -> Result<Roster, ControlDecodeError> {
    let mut roster = Roster::new();
    for (i, entry) in wire.players.iter().enumerate() {
        let Ok(controller_port) = u16::try_from(entry.controller_port) else {
            continue;
        };
        let ip = Ipv6Addr::from(entry.ip).to_canonical();
        roster.insert(
            PlayerId::new(i),
            RosterEntry {
                controller_port,
                address: SocketAddr::new(ip, entry.port),
                nickname: unpad(&entry.nickname),
            },
        );
    }
    if roster.num_players() != wire.num_players as usize {
        return Err(bad_enum(
            ControlMessageType::Reset,
            "num_players",
            wire.num_players,
        ));
    }
    Ok(roster)
}

/// Encodes a message with its header.
///
/// # Errors
/// Fails if the message does not fit a `u32` size or does not serialize.
pub fn encode(message: &ControlMessage) -> CodecResult<Vec<u8>> {
    let (fixed, tail): (Vec<u8>, &[u8]) = match message {
        ControlMessage::ConnectRequest(req) => (
            codec::encode(&ConnectRequestWire {
                mode: match req.mode {
                    ConnectMode::Player => 0,
                    ConnectMode::Spectator => 1,
                },
                requested_player_id: PlayerId::to_wire(req.requested_player_id),
                nickname: pad(&req.nickname),
                password: pad(&req.password),
            })?,
            &[],
        ),
        ControlMessage::ConnectResponse(resp) => (
            codec::encode(&ConnectResponseWire {
                result: resp.result.code(),
                player_id: PlayerId::to_wire(resp.player_id),
            })?,
            &[],
        ),
        ControlMessage::Reset(reset) => {
            let state_data_size = u32::try_from(reset.state.len()).map_err(|e| {
                CodecError::encode(
                    format!("snapshot of {} bytes is too large: {e}", reset.state.len()),
                    CodecOperation::EncodeControl,
                )
            })?;
            (
                codec::encode(&ResetWire {
                    cookie: reset.cookie,
                    num_players: reset.roster.num_players() as u32,
                    players: encode_roster(&reset.roster),
                    state_data_size,
                })?,
                reset.state.as_slice(),
            )
        },
        ControlMessage::ResetComplete { cookie } => {
            (codec::encode(&CookieWire { cookie: *cookie })?, &[])
        },
        ControlMessage::ResumeSession => (Vec::new(), &[]),
        ControlMessage::PlayerJoined { player_id } => (
            codec::encode(&PlayerWire {
                player_id: PlayerId::to_wire(Some(*player_id)),
            })?,
            &[],
        ),
        ControlMessage::DropPlayer { reason, player_id } => (
            codec::encode(&ReasonPlayerWire {
                reason: match reason {
                    DropReason::ConnectTimeout => 0,
                    DropReason::DisconnectedFromHost => 1,
                },
                player_id: PlayerId::to_wire(Some(*player_id)),
            })?,
            &[],
        ),
        ControlMessage::ResetRequest {
            reason,
            causing_player_id,
        } => (
            codec::encode(&ReasonPlayerWire {
                reason: match reason {
                    ResetRequestReason::ConnectTimeout => 0,
                    ResetRequestReason::ConnectionLost => 1,
                },
                player_id: PlayerId::to_wire(*causing_player_id),
            })?,
            &[],
        ),
        ControlMessage::CloseSession { reason } => (
            codec::encode(&ReasonWire {
                reason: match reason {
                    CloseReason::HostShutdown => 0,
                },
            })?,
            &[],
        ),
        ControlMessage::Chat { text } => (Vec::new(), text.as_bytes()),
    };

    let total = HEADER_SIZE + fixed.len() + tail.len();
    let size = u32::try_from(total).map_err(|e| {
        CodecError::encode(
            format!("control message of {total} bytes is too large: {e}"),
            CodecOperation::EncodeControl,
        )
    })?;
    let mut bytes = Vec::with_capacity(total);
    codec::encode_append(
        &Header {
            kind: message.message_type().as_u32(),
            size,
        },
        &mut bytes,
    )
    .map_err(|e| e.during(CodecOperation::EncodeControl))?;
    bytes.extend_from_slice(&fixed);
    bytes.extend_from_slice(tail);
    Ok(bytes)
}

/// Validates and decodes one control packet.
///
/// # Errors
/// Returns the first check that failed; see the module documentation for the order.
pub fn decode(bytes: &[u8]) -> Result<ControlMessage, ControlDecodeError> {
    let header_bytes = bytes
        .get(..HEADER_SIZE)
        .ok_or(ControlDecodeError::MissingHeader {
            received: bytes.len(),
        })?;
    let header: Header = codec::decode_value(header_bytes)?;
    let kind = ControlMessageType::from_u32(header.kind)
        .ok_or(ControlDecodeError::UnknownType { tag: header.kind })?;

    let declared = header.size as usize;
    let required = HEADER_SIZE + fixed_payload_size(kind);
    if declared < required {
        return Err(ControlDecodeError::DeclaredTooSmall {
            kind,
            declared,
            required,
        });
    }
    let Some(body) = bytes.get(HEADER_SIZE..declared) else {
        return Err(ControlDecodeError::Truncated {
            kind,
            declared,
            received: bytes.len(),
        });
    };

    let message = match kind {
        ControlMessageType::ConnectRequest => {
            let wire: ConnectRequestWire = codec::decode_value(body)?;
            let mode = match wire.mode {
                0 => ConnectMode::Player,
                1 => ConnectMode::Spectator,
                other => return Err(bad_enum(kind, "mode", other)),
            };
            ControlMessage::ConnectRequest(ConnectRequest {
                mode,
                requested_player_id: optional_wire_player(
                    kind,
                    "requested_player_id",
                    wire.requested_player_id,
                )?,
                nickname: unpad(&wire.nickname),
                password: unpad(&wire.password),
            })
        },
        ControlMessageType::ConnectResponse => {
            let wire: ConnectResponseWire = codec::decode_value(body)?;
            let result = match wire.result {
                0 => ConnectResult::Success,
                1 => ConnectResult::PlayerIdInUse,
                2 => ConnectResult::ServerFull,
                3 => ConnectResult::SessionClosed,
                other => return Err(bad_enum(kind, "result", other)),
            };
            ControlMessage::ConnectResponse(ConnectResponse {
                result,
                player_id: optional_wire_player(kind, "player_id", wire.player_id)?,
            })
        },
        ControlMessageType::Reset => {
            let wire: ResetWire = codec::decode_value(body)?;
            let state_size = wire.state_data_size as usize;
            let needed = required.saturating_add(state_size);
            let state = body
                .get(RESET_SIZE..RESET_SIZE.saturating_add(state_size))
                .filter(|_| needed <= declared)
                .ok_or(ControlDecodeError::StateOverrun {
                    declared,
                    required: needed,
                })?;
            ControlMessage::Reset(ResetMessage {
                cookie: wire.cookie,
                roster: decode_roster(&wire)?,
                state: state.to_vec(),
            })
        },
        ControlMessageType::ResetComplete => {
            let wire: CookieWire = codec::decode_value(body)?;
            ControlMessage::ResetComplete {
                cookie: wire.cookie,
            }
        },
        ControlMessageType::ResumeSession => ControlMessage::ResumeSession,
        ControlMessageType::PlayerJoined => {
            let wire: PlayerWire = codec::decode_value(body)?;
            ControlMessage::PlayerJoined {
                player_id: wire_player(kind, "player_id", wire.player_id)?,
            }
        },
        ControlMessageType::DropPlayer => {
            let wire: ReasonPlayerWire = codec::decode_value(body)?;
            let reason = match wire.reason {
                0 => DropReason::ConnectTimeout,
                1 => DropReason::DisconnectedFromHost,
                other => return Err(bad_enum(kind, "reason", other)),
            };
            ControlMessage::DropPlayer {
                reason,
                player_id: wire_player(kind, "player_id", wire.player_id)?,
            }
        },
        ControlMessageType::ResetRequest => {
            let wire: ReasonPlayerWire = codec::decode_value(body)?;
            let reason = match wire.reason {
                0 => ResetRequestReason::ConnectTimeout,
                1 => ResetRequestReason::ConnectionLost,
                other => return Err(bad_enum(kind, "reason", other)),
            };
            ControlMessage::ResetRequest {
                reason,
                causing_player_id: optional_wire_player(
                    kind,
                    "causing_player_id",
                    wire.player_id,
                )?,
            }
        },
        ControlMessageType::CloseSession => {
            let wire: ReasonWire = codec::decode_value(body)?;
            let reason = match wire.reason {
                0 => CloseReason::HostShutdown,
                other => return Err(bad_enum(kind, "reason", other)),
            };
            ControlMessage::CloseSession { reason }
        },
        ControlMessageType::ChatMessage => {
            let text = match std::str::from_utf8(body) {
                Ok(text) => text,
                Err(_) => return Err(ControlDecodeError::InvalidText),
            };
            ControlMessage::Chat {
                text: text.to_owned(),
            }
        },
    };
    Ok(message)
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
    use proptest::prelude::*;

    fn roster() -> Roster {
        let mut roster = Roster::new();
        roster.insert(
            PlayerId::new(0),
            RosterEntry {
                controller_port: 0,
                address: "127.0.0.1:7000".parse().unwrap(),
                nickname: "host".to_owned(),
            },
        );
        roster.insert(
            PlayerId::new(2),
            RosterEntry {
                controller_port: 2,
                address: "[::1]:7002".parse().unwrap(),
                nickname: "two".to_owned(),
            },
        );
        roster
    }

    fn with_declared_size(mut bytes: Vec<u8>, size: u32) -> Vec<u8> {
        bytes[4..8].copy_from_slice(&size.to_le_bytes());
        bytes
    }

    #[test]
    fn fixed_sizes_match_the_encoding() {
        assert_eq!(
            codec::encoded_size(&ConnectRequestWire::default()).unwrap(),
            CONNECT_REQUEST_SIZE
        );
        assert_eq!(
            codec::encoded_size(&ConnectResponseWire::default()).unwrap(),
            CONNECT_RESPONSE_SIZE
        );
        assert_eq!(
            codec::encoded_size(&RosterEntryWire::default()).unwrap(),
            ROSTER_ENTRY_SIZE
        );
        assert_eq!(
            codec::encoded_size(&ResetWire::default()).unwrap(),
            RESET_SIZE
        );
        assert_eq!(
            codec::encoded_size(&ReasonPlayerWire::default()).unwrap(),
            DROP_PLAYER_SIZE
        );
        assert_eq!(
            codec::encoded_size(&Header { kind: 0, size: 0 }).unwrap(),
            HEADER_SIZE
        );
    }

    #[test]
    fn header_is_type_then_total_size() {
        let bytes = encode(&ControlMessage::ResetComplete { cookie: 3 }).unwrap();
        assert_eq!(bytes, [4, 0, 0, 0, 12, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn reset_carries_roster_and_state() {
        let message = ControlMessage::Reset(ResetMessage {
            cookie: 42,
            roster: roster(),
            state: vec![1, 2, 3, 4, 5],
        });
        let bytes = encode(&message).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + RESET_SIZE + 5);
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn connect_request_keeps_names_and_requested_id() {
        let message = ControlMessage::ConnectRequest(ConnectRequest {
            mode: ConnectMode::Player,
            requested_player_id: None,
            nickname: "ken".to_owned(),
            password: "hunter2".to_owned(),
        });
        assert_eq!(decode(&encode(&message).unwrap()).unwrap(), message);
    }

    #[test]
    fn long_nicknames_are_cut_on_a_char_boundary() {
        let message = ControlMessage::ConnectRequest(ConnectRequest {
            mode: ConnectMode::Player,
            requested_player_id: Some(PlayerId::new(2)),
            nickname: format!("a{}", "é".repeat(20)),
            password: "x".repeat(40),
        });
        let ControlMessage::ConnectRequest(decoded) = decode(&encode(&message).unwrap()).unwrap()
        else {
            panic!("expected a connect request");
        };
        assert_eq!(decoded.nickname, format!("a{}", "é".repeat(15)));
        assert_eq!(decoded.password, "x".repeat(MAX_PASSWORD_LENGTH));
        assert_eq!(decoded.requested_player_id, Some(PlayerId::new(2)));
    }

    #[test]
    fn chat_text_fills_the_rest_of_the_message() {
        let message = ControlMessage::Chat {
            text: "gg ✌".to_owned(),
        };
        let mut bytes = encode(&message).unwrap();
        bytes.extend_from_slice(b"trailing garbage");
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn declared_size_larger_than_received_is_rejected() {
        let bytes = with_declared_size(
            encode(&ControlMessage::ConnectResponse(ConnectResponse {
                result: ConnectResult::Success,
                player_id: Some(PlayerId::new(1)),
            }))
            .unwrap(),
            40,
        );
        let mut truncated = bytes;
        truncated.resize(20, 0);
        assert_eq!(
            decode(&truncated),
            Err(ControlDecodeError::Truncated {
                kind: ControlMessageType::ConnectResponse,
                declared: 40,
                received: 20
            })
        );
    }

    #[test]
    fn declared_size_below_fixed_layout_is_rejected() {
        let bytes = with_declared_size(
            encode(&ControlMessage::DropPlayer {
                reason: DropReason::ConnectTimeout,
                player_id: PlayerId::new(1),
            })
            .unwrap(),
            10,
        );
        assert!(matches!(
            decode(&bytes),
            Err(ControlDecodeError::DeclaredTooSmall { required: 16, .. })
        ));
    }

    #[test]
    fn reset_state_must_fit_declared_size() {
        let bytes = encode(&ControlMessage::Reset(ResetMessage {
            cookie: 1,
            roster: roster(),
            state: vec![0; 16],
        }))
        .unwrap();
        let shrunk = with_declared_size(bytes, (HEADER_SIZE + RESET_SIZE + 8) as u32);
        assert!(matches!(
            decode(&shrunk),
            Err(ControlDecodeError::StateOverrun { .. })
        ));
    }

    #[test]
    fn short_and_unknown_packets_are_rejected() {
        assert_eq!(
            decode(&[1, 0, 0]),
            Err(ControlDecodeError::MissingHeader { received: 3 })
        );
        assert_eq!(
            decode(&[99, 0, 0, 0, 8, 0, 0, 0]),
            Err(ControlDecodeError::UnknownType { tag: 99 })
        );
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let mut bytes = encode(&ControlMessage::PlayerJoined {
            player_id: PlayerId::new(1),
        })
        .unwrap();
        bytes[8..12].copy_from_slice(&(MAX_PLAYERS as i32).to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(ControlDecodeError::BadField {
                field: "player_id",
                ..
            })
        ));

        let mut bytes = encode(&ControlMessage::CloseSession {
            reason: CloseReason::HostShutdown,
        })
        .unwrap();
        bytes[8] = 7;
        assert!(matches!(
            decode(&bytes),
            Err(ControlDecodeError::BadField { field: "reason", .. })
        ));
    }

    #[test]
    fn invalid_chat_utf8_is_rejected() {
        let mut bytes = encode(&ControlMessage::Chat {
            text: "ab".to_owned(),
        })
        .unwrap();
        bytes[8] = 0xFF;
        assert_eq!(decode(&bytes), Err(ControlDecodeError::InvalidText));
    }

    #[test]
    fn roster_count_must_match_entries() {
        let mut bytes = encode(&ControlMessage::Reset(ResetMessage {
            cookie: 1,
            roster: roster(),
            state: Vec::new(),
        }))
        .unwrap();
        bytes[12..16].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(ControlDecodeError::BadField {
                field: "num_players",
                ..
            })
        ));
    }

    #[test]
    fn decode_errors_become_protocol_errors() {
        let err: NetplayError = ControlDecodeError::InvalidText.into();
        assert!(matches!(err, NetplayError::Protocol { .. }));
    }

    proptest! {
        /// Arbitrary bytes never panic the decoder.
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..400)) {
            let _ = decode(&bytes);
        }

        /// Any valid header followed by arbitrary payload never panics either.
        #[test]
        fn arbitrary_payload_under_valid_header_never_panics(
            tag in 1u32..=10,
            declared in 0u32..600,
            payload in proptest::collection::vec(any::<u8>(), 0..600),
        ) {
            let mut bytes = tag.to_le_bytes().to_vec();
            bytes.extend_from_slice(&declared.to_le_bytes());
            bytes.extend_from_slice(&payload);
            if let Ok(message) = decode(&bytes) {
                prop_assert_eq!(message.message_type().as_u32(), tag);
            }
        }
    }
}
