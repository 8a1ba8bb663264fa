//! The control protocol: session membership, resynchronization, chat and teardown.
//!
//! Control messages travel over the reliable [`Channel::Control`] channel. Every inbound packet
//! is validated by [`wire::decode`] before any field is read; a packet that fails validation is
//! dropped with a [`ViolationKind::ControlProtocol`] warning and changes nothing.
//!
//! Which role may send which message is checked by the session, not here.

pub mod wire;

use std::fmt;
use std::sync::Arc;

use crate::reset::Roster;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::transport::{send_or_log, Channel, PeerId, Reliability, Transport};
use crate::{report_violation_to, PlayerId};

pub use wire::{ControlDecodeError, HEADER_SIZE};

/// Wire tag of each control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlMessageType {
    /// See [`ConnectRequest`].
    ConnectRequest = 1,
    /// See [`ConnectResponse`].
    ConnectResponse = 2,
    /// See [`ResetMessage`].
    Reset = 3,
    /// Client acknowledgment of a reset cookie.
    ResetComplete = 4,
    /// Host tells clients every player is reset.
    ResumeSession = 5,
    /// Host announces a new player.
    PlayerJoined = 6,
    /// Host tells clients a player was dropped.
    DropPlayer = 7,
    /// Client asks the host to reset.
    ResetRequest = 8,
    /// The session is ending.
    CloseSession = 9,
    /// Free text.
    ChatMessage = 10,
}

impl ControlMessageType {
    /// Decodes a wire tag.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::ConnectRequest,
            2 => Self::ConnectResponse,
            3 => Self::Reset,
            4 => Self::ResetComplete,
            5 => Self::ResumeSession,
            6 => Self::PlayerJoined,
            7 => Self::DropPlayer,
            8 => Self::ResetRequest,
            9 => Self::CloseSession,
            10 => Self::ChatMessage,
            _ => return None,
        })
    }

    /// The wire tag.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// How a connecting peer wants to take part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectMode {
    /// Takes a player slot.
    Player,
    /// Watches only. Not supported; the host answers [`ConnectResult::SessionClosed`].
    Spectator,
}

/// The host's answer to a [`ConnectRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectResult {
    /// A slot was assigned.
    Success,
    /// The requested id is taken.
    PlayerIdInUse,
    /// No slot is free.
    ServerFull,
    /// The session does not accept this peer.
    SessionClosed,
}

impl ConnectResult {
    /// The numeric result code sent on the wire.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::PlayerIdInUse => 1,
            Self::ServerFull => 2,
            Self::SessionClosed => 3,
        }
    }
}

impl fmt::Display for ConnectResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::PlayerIdInUse => "player id in use",
            Self::ServerFull => "server full",
            Self::SessionClosed => "session closed",
        })
    }
}

/// Why the host dropped a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The player did not finish a reset in time.
    ConnectTimeout,
    /// The player's connection to the host went away.
    DisconnectedFromHost,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConnectTimeout => "Connection timeout",
            Self::DisconnectedFromHost => "Disconnected from host",
        })
    }
}

/// Why a client asks the host for a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetRequestReason {
    /// A connection to another player could not be set up in time.
    ConnectTimeout,
    /// The connection to another player was lost.
    ConnectionLost,
}

impl fmt::Display for ResetRequestReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConnectTimeout => "connect timeout",
            Self::ConnectionLost => "connection lost",
        })
    }
}

/// Why the session is closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The host shut the session down.
    HostShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HostShutdown => "The host shut down the session.",
        })
    }
}

/// First message of a joining peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// How the peer wants to take part.
    pub mode: ConnectMode,
    /// A specific slot, when reconnecting. `None` takes the lowest free one.
    pub requested_player_id: Option<PlayerId>,
    /// Display name.
    pub nickname: String,
    /// Session password. Carried but never checked.
    pub password: String,
}

/// The host's reply to a [`ConnectRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// The outcome.
    pub result: ConnectResult,
    /// The assigned id on success.
    pub player_id: Option<PlayerId>,
}

/// Full-state resynchronization broadcast by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetMessage {
    /// Identifies this reset round.
    pub cookie: u32,
    /// Every player of the session after the reset.
    pub roster: Roster,
    /// Encoded [`Snapshot`](crate::snapshot::Snapshot) of the host's simulation.
    pub state: Vec<u8>,
}

/// One control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// A peer asks to join.
    ConnectRequest(ConnectRequest),
    /// The host answers a join.
    ConnectResponse(ConnectResponse),
    /// The host resynchronizes everyone.
    Reset(ResetMessage),
    /// A client finished the reset round `cookie`.
    ResetComplete {
        /// The round being acknowledged.
        cookie: u32,
    },
    /// Every player is reset; the host resumes play.
    ResumeSession,
    /// The host announces a player that joined.
    PlayerJoined {
        /// The new player.
        player_id: PlayerId,
    },
    /// The host dropped a player.
    DropPlayer {
        /// Why.
        reason: DropReason,
        /// The dropped player.
        player_id: PlayerId,
    },
    /// A client asks the host to reset.
    ResetRequest {
        /// Why.
        reason: ResetRequestReason,
        /// The player whose connection caused the request, if any.
        causing_player_id: Option<PlayerId>,
    },
    /// The session is ending.
    CloseSession {
        /// Why.
        reason: CloseReason,
    },
    /// Free text from a player.
    Chat {
        /// UTF-8 message text.
        text: String,
    },
}

impl ControlMessage {
    /// The wire tag of this message.
    #[must_use]
    pub fn message_type(&self) -> ControlMessageType {
        match self {
            Self::ConnectRequest(_) => ControlMessageType::ConnectRequest,
            Self::ConnectResponse(_) => ControlMessageType::ConnectResponse,
            Self::Reset(_) => ControlMessageType::Reset,
            Self::ResetComplete { .. } => ControlMessageType::ResetComplete,
            Self::ResumeSession => ControlMessageType::ResumeSession,
            Self::PlayerJoined { .. } => ControlMessageType::PlayerJoined,
            Self::DropPlayer { .. } => ControlMessageType::DropPlayer,
            Self::ResetRequest { .. } => ControlMessageType::ResetRequest,
            Self::CloseSession { .. } => ControlMessageType::CloseSession,
            Self::Chat { .. } => ControlMessageType::ChatMessage,
        }
    }
}

/// Encodes and reliably sends a control message. Failures are reported and the message is
/// dropped. Returns `true` if the transport accepted it.
pub(crate) fn send_control<T: Transport + ?Sized>(
    transport: &mut T,
    observer: &Option<Arc<dyn ViolationObserver>>,
    peer: PeerId,
    message: &ControlMessage,
) -> bool {
    match wire::encode(message) {
        Ok(bytes) => send_or_log(
            transport,
            peer,
            Channel::Control,
            &bytes,
            Reliability::Reliable,
        ),
        Err(e) => {
            report_violation_to!(
                observer,
                ViolationSeverity::Error,
                ViolationKind::ControlProtocol,
                "failed to encode {:?} for {}: {}",
                message.message_type(),
                peer,
                e
            );
            false
        },
    }
}

/// Decodes an inbound control packet, reporting and swallowing anything malformed.
pub(crate) fn receive_control(
    observer: &Option<Arc<dyn ViolationObserver>>,
    peer: PeerId,
    bytes: &[u8],
) -> Option<ControlMessage> {
    match wire::decode(bytes) {
        Ok(message) => Some(message),
        Err(e) => {
            report_violation_to!(
                observer,
                ViolationSeverity::Warning,
                ViolationKind::ControlProtocol,
                "dropping control packet from {}: {}",
                peer,
                e
            );
            None
        },
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
    use crate::telemetry::CollectingObserver;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::TransportEvent;
    use web_time::Duration;

    #[test]
    fn every_tag_round_trips() {
        for raw in 1..=10 {
            let kind = ControlMessageType::from_u32(raw).unwrap();
            assert_eq!(kind.as_u32(), raw);
        }
        assert_eq!(ControlMessageType::from_u32(0), None);
        assert_eq!(ControlMessageType::from_u32(11), None);
    }

    #[test]
    fn drop_reasons_read_like_the_user_message() {
        assert_eq!(DropReason::ConnectTimeout.to_string(), "Connection timeout");
        assert_eq!(
            DropReason::DisconnectedFromHost.to_string(),
            "Disconnected from host"
        );
    }

    #[test]
    fn malformed_packets_are_reported_not_returned() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        assert_eq!(receive_control(&observer, PeerId::new(1), &[1, 2, 3]), None);
        assert!(collector.has_violation(ViolationKind::ControlProtocol));
    }

    #[test]
    fn send_control_delivers_a_decodable_packet() {
        let network = MemoryNetwork::new();
        let mut host = network.bind(7100).unwrap();
        let mut client = network.bind(7101).unwrap();
        let to_host = client.connect(host.local_addr(), 5).unwrap();
        let Some(TransportEvent::Connected { .. }) = host.poll(Duration::ZERO) else {
            panic!("host should see the connection");
        };
        assert!(matches!(
            client.poll(Duration::ZERO),
            Some(TransportEvent::Connected { .. })
        ));

        let message = ControlMessage::ResetComplete { cookie: 9 };
        assert!(send_control(&mut client, &None, to_host, &message));
        match host.poll(Duration::ZERO) {
            Some(TransportEvent::Received {
                channel: Channel::Control,
                payload,
                ..
            }) => assert_eq!(wire::decode(&payload).unwrap(), message),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
