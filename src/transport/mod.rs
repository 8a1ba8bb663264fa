//! The dual-channel peer-to-peer connection primitive the session runs on.
//!
//! A [`Transport`] owns a set of peers. Each peer carries two logical channels: the
//! [`Channel::Control`] channel (reliable and ordered, used by the control protocol) and the
//! [`Channel::Rollback`] channel (best effort, used by the rollback engine). Send failures are
//! reported and the packet is dropped; retrying is the caller's business.

pub mod memory;

use std::fmt;
use std::net::SocketAddr;

use web_time::Duration;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NetplayError;

/// Connect data meaning "no player id claimed".
pub const NO_CLAIMED_PLAYER: u32 = u32::MAX;

/// Identifies one peer of a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u32);

impl PeerId {
    /// Creates a peer id from its raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Logical channel of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Session membership, resynchronization, chat and teardown. Always reliable.
    Control,
    /// Speculative input exchange. Best effort.
    Rollback,
}

impl Channel {
    /// Wire index of the channel.
    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Rollback => 1,
        }
    }
}

/// Delivery guarantee requested for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// Delivered once, in order with other reliable packets of the same channel.
    Reliable,
    /// May be lost.
    Unreliable,
}

/// Connection state of a peer, as seen by the local transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Handshake in flight.
    Connecting,
    /// Packets flow both ways.
    Connected,
    /// A graceful disconnect is in progress.
    Disconnecting,
    /// Gone, or never known.
    Disconnected,
}

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection completed. On the accepting side `data` is the word the connecting side
    /// passed to [`Transport::connect`]; the connecting side sees `0`.
    Connected {
        /// The new peer.
        peer: PeerId,
        /// Connect data.
        data: u32,
    },
    /// The peer went away.
    Disconnected {
        /// The lost peer.
        peer: PeerId,
    },
    /// A packet arrived.
    Received {
        /// Sender.
        peer: PeerId,
        /// Channel it arrived on.
        channel: Channel,
        /// Packet contents.
        payload: Vec<u8>,
    },
}

/// A peer-to-peer datagram host.
///
/// Every call is non-blocking except [`poll`](Transport::poll), which waits at most `timeout`.
#[cfg(feature = "sync-send")]
pub trait Transport: Send {
    /// Address other peers can connect to.
    fn local_addr(&self) -> SocketAddr;

    /// Starts connecting to `addr`. Completion is reported as [`TransportEvent::Connected`].
    ///
    /// # Errors
    /// Returns [`NetplayError::Transport`] if no connection attempt could be started.
    fn connect(&mut self, addr: SocketAddr, data: u32) -> Result<PeerId, NetplayError>;

    /// Sends one packet. Control packets are always sent reliably.
    ///
    /// # Errors
    /// Returns [`NetplayError::Transport`] if the peer is unknown or not connected.
    fn send(
        &mut self,
        peer: PeerId,
        channel: Channel,
        payload: &[u8],
        reliability: Reliability,
    ) -> Result<(), NetplayError>;

    /// Returns the next event, waiting up to `timeout` for one.
    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent>;

    /// Graceful disconnect: both sides see [`TransportEvent::Disconnected`].
    fn disconnect(&mut self, peer: PeerId);

    /// Immediate disconnect: the remote side is told, the local side gets no event.
    fn disconnect_now(&mut self, peer: PeerId);

    /// Graceful disconnect once everything queued for the peer has been delivered.
    fn disconnect_later(&mut self, peer: PeerId);

    /// Forgets the peer without telling anyone.
    fn reset_peer(&mut self, peer: PeerId);

    /// Remote address of a known peer.
    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr>;

    /// Connection state of a peer.
    fn peer_state(&self, peer: PeerId) -> PeerState;
}

/// A peer-to-peer datagram host.
///
/// Every call is non-blocking except [`poll`](Transport::poll), which waits at most `timeout`.
#[cfg(not(feature = "sync-send"))]
pub trait Transport {
    /// Address other peers can connect to.
    fn local_addr(&self) -> SocketAddr;

    /// Starts connecting to `addr`. Completion is reported as [`TransportEvent::Connected`].
    ///
    /// # Errors
    /// Returns [`NetplayError::Transport`] if no connection attempt could be started.
    fn connect(&mut self, addr: SocketAddr, data: u32) -> Result<PeerId, NetplayError>;

    /// Sends one packet. Control packets are always sent reliably.
    ///
    /// # Errors
    /// Returns [`NetplayError::Transport`] if the peer is unknown or not connected.
    fn send(
        &mut self,
        peer: PeerId,
        channel: Channel,
        payload: &[u8],
        reliability: Reliability,
    ) -> Result<(), NetplayError>;

    /// Returns the next event, waiting up to `timeout` for one.
    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent>;

    /// Graceful disconnect: both sides see [`TransportEvent::Disconnected`].
    fn disconnect(&mut self, peer: PeerId);

    /// Immediate disconnect: the remote side is told, the local side gets no event.
    fn disconnect_now(&mut self, peer: PeerId);

    /// Graceful disconnect once everything queued for the peer has been delivered.
    fn disconnect_later(&mut self, peer: PeerId);

    /// Forgets the peer without telling anyone.
    fn reset_peer(&mut self, peer: PeerId);

    /// Remote address of a known peer.
    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr>;

    /// Connection state of a peer.
    fn peer_state(&self, peer: PeerId) -> PeerState;
}

/// Creates the transport a session runs on. A session opens one when it starts and drops it
/// when it closes.
pub trait TransportFactory {
    /// Binds a new transport to `port`, or to any free port with `None`.
    ///
    /// # Errors
    /// Returns [`NetplayError::Transport`] if the port cannot be bound.
    fn open(&self, port: Option<u16>) -> Result<Box<dyn Transport>, NetplayError>;
}

/// Sends a packet, turning a failure into a [`ViolationKind::Transport`] warning.
///
/// Returns `true` if the transport accepted the packet.
pub(crate) fn send_or_log<T: Transport + ?Sized>(
    transport: &mut T,
    peer: PeerId,
    channel: Channel,
    payload: &[u8],
    reliability: Reliability,
) -> bool {
    match transport.send(peer, channel, payload, reliability) {
        Ok(()) => true,
        Err(e) => {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "dropping {} byte {:?} packet to {}: {}",
                payload.len(),
                channel,
                peer,
                e
            );
            false
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
    use super::memory::MemoryNetwork;
    use super::*;

    #[test]
    fn peer_id_display() {
        assert_eq!(PeerId::new(3).to_string(), "peer#3");
    }

    #[test]
    fn channel_indices_are_distinct() {
        assert_ne!(Channel::Control.index(), Channel::Rollback.index());
    }

    #[test]
    fn send_or_log_reports_unknown_peer() {
        let network = MemoryNetwork::new();
        let mut transport = network.bind(7000).unwrap();
        assert!(!send_or_log(
            &mut transport,
            PeerId::new(99),
            Channel::Control,
            &[1, 2, 3],
            Reliability::Reliable
        ));
    }
}
