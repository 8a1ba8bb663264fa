//! # Rollback Netplay
//!
//! A peer-to-peer rollback netplay layer for deterministic simulations such as emulated
//! machines. N instances play in lock-step over an unreliable network; latency is hidden by
//! speculative execution and state rewind.
//!
//! The crate is organised leaf-first:
//!
//! - [`transport`]: a thin dual-channel (control / rollback) peer connection interface, plus an
//!   in-memory implementation.
//! - [`peers`]: the fixed-capacity player slot table.
//! - [`control`]: the typed control message set and its validated wire codec.
//! - [`rollback`]: the speculative-execution core (input queues, saved states, per-peer
//!   endpoints, checksum exchange, save-buffer pooling).
//! - [`session`]: the top-level state machine and run loop that orchestrates everything.
//! - [`pacing`]: the adaptive frame throttle fed by time-sync events.
//! - [`reset`]: host-authoritative resynchronization data (epochs, rosters, reconnect plans).
//!
//! The simulation itself and the UI are external collaborators, reached through the
//! [`SimulationDriver`] and [`HostUi`] traits.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

pub use checksum::frame_checksum;
pub use config::{EndpointConfig, NetplayConfig, RollbackConfig};
pub use driver::{
    BootParams, HostUi, LoadingProgress, PadInput, SettingValue, SettingsOverlay, SimulationDriver,
};
pub use error::NetplayError;
pub use network::network_stats::NetworkStats;
pub use pacing::FramePacer;
pub use peers::{PeerTable, PlayerSlot};
pub use rollback::save_pool::{SaveBuffer, SaveBufferPool};
pub use rollback::{RollbackEngine, RollbackEvent, RollbackHandler, SavedFrame};
pub use session::{HostParams, JoinParams, Role, Session, SessionState};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::{
    Channel, PeerId, PeerState, Reliability, Transport, TransportEvent, TransportFactory,
};

pub mod checksum;
pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod pacing;
pub mod peers;
pub mod reset;
pub mod rollback;
#[doc(hidden)]
pub mod rng;
pub mod session;
pub mod snapshot;
pub mod telemetry;
pub mod transport;
#[doc(hidden)]
pub mod network {
    /// Binary codec for wire serialization.
    ///
    /// Provides centralized encoding and decoding using bincode with a fixed-int,
    /// little-endian configuration.
    pub mod codec;
    pub mod network_stats;
}

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The fixed maximum number of players in a session. Slot index is the player id.
pub const MAX_PLAYERS: usize = 4;

/// Maximum length in bytes of a player nickname, on the wire and in the [`PeerTable`].
pub const MAX_NICKNAME_LENGTH: usize = 32;

/// A frame number of the simulation.
///
/// Frames are `i32` under the hood; [`Frame::NULL`] (-1) means "no frame".
///
/// # Examples
///
/// ```
/// use rollback_netplay::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns `Some(self)` if the frame is valid, or `None` if it's null or negative.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Frame> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }

    /// Adds `rhs`, saturating at `i32::MAX`.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, rhs: i32) -> Frame {
        Frame(self.0.saturating_add(rhs))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Index of a player inside one rollback session.
///
/// Rollback handles are dense (`0..num_players`) and are reassigned every time the rollback
/// session is recreated after a reset, so they are never stored across resets. The stable
/// identity of a player is its [`PlayerId`].
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle` from a `usize` value.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle is valid for a session with `num_players` players.
    #[inline]
    #[must_use]
    pub const fn is_valid_player_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a player: the index of its slot in the [`PeerTable`].
///
/// The host is always player 0.
///
/// ```
/// use rollback_netplay::{PlayerId, MAX_PLAYERS};
///
/// assert!(PlayerId::HOST.is_valid());
/// assert!(!PlayerId::new(MAX_PLAYERS).is_valid());
/// assert_eq!(PlayerId::from_wire(-1), None);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerId(usize);

impl PlayerId {
    /// The id of the hosting player.
    pub const HOST: PlayerId = PlayerId(0);

    /// Creates a new `PlayerId`. Use [`PlayerId::is_valid`] before indexing with it.
    #[inline]
    #[must_use]
    pub const fn new(id: usize) -> Self {
        PlayerId(id)
    }

    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if the id addresses a slot in `[0, MAX_PLAYERS)`.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 < MAX_PLAYERS
    }

    /// Decodes the wire representation, where any negative value means "none".
    #[must_use]
    pub fn from_wire(raw: i32) -> Option<PlayerId> {
        usize::try_from(raw).ok().map(PlayerId)
    }

    /// Encodes an optional id for the wire, using -1 for `None`.
    #[must_use]
    pub fn to_wire(id: Option<PlayerId>) -> i32 {
        id.and_then(|id| i32::try_from(id.0).ok()).unwrap_or(-1)
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a player's input for a frame was received or predicted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input of this player for this frame is an actual received input.
    Confirmed,
    /// The input of this player for this frame is predicted.
    Predicted,
    /// The player has disconnected at or prior to this frame, so this input is a dummy.
    Disconnected,
}

/// Stack-allocated input vector used for synchronized inputs (no heap for up to 4 players).
pub type InputVec<I> = smallvec::SmallVec<[(I, InputStatus); 4]>;

/// Per-frame input exchanged between peers. This is the only simulation data transmitted
/// every frame.
///
/// [Default] represents "no input", including for disconnected players. Implemented for every
/// type with the required bounds.
pub trait NetInput:
    Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned + Debug + 'static
{
}

impl<T> NetInput for T where
    T: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned + Debug + 'static
{
}

/// Compile time parameterization for sessions.
///
/// Bundles the input type exchanged over the network with the simulation driver and UI
/// collaborators a [`Session`] drives.
pub trait Config: 'static {
    /// The input type for a session.
    type Input: NetInput;

    /// The simulation (emulated machine) being kept in lock-step.
    type Driver: SimulationDriver<Self::Input>;

    /// The UI layer that displays messages and progress.
    type Ui: HostUi;
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
    fn frame_arithmetic() {
        let frame = Frame::new(10);
        assert_eq!(frame + 5, Frame::new(15));
        assert_eq!(frame - 3, Frame::new(7));
        assert_eq!(Frame::new(15) - frame, 5);
        let mut f = frame;
        f += 2;
        assert_eq!(f, 12);
    }

    #[test]
    fn frame_null_is_not_valid() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert_eq!(Frame::NULL.to_option(), None);
        assert_eq!(Frame::new(3).to_option(), Some(Frame::new(3)));
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
    }

    #[test]
    fn frame_saturating_add_does_not_overflow() {
        assert_eq!(Frame::new(i32::MAX).saturating_add(1), Frame::new(i32::MAX));
    }

    #[test]
    fn player_id_wire_round_trip() {
        assert_eq!(PlayerId::to_wire(None), -1);
        assert_eq!(PlayerId::to_wire(Some(PlayerId::new(2))), 2);
        assert_eq!(PlayerId::from_wire(3), Some(PlayerId::new(3)));
        assert_eq!(PlayerId::from_wire(-7), None);
    }

    #[test]
    fn player_id_validity_is_bounded_by_max_players() {
        for i in 0..MAX_PLAYERS {
            assert!(PlayerId::new(i).is_valid());
        }
        assert!(!PlayerId::new(MAX_PLAYERS).is_valid());
    }

    #[test]
    fn player_handle_validity() {
        assert!(PlayerHandle::new(1).is_valid_player_for(2));
        assert!(!PlayerHandle::new(2).is_valid_player_for(2));
    }
}
