//! The speculative-execution core.
//!
//! A [`RollbackEngine`] keeps one authoritative linear history of the simulation. Local input
//! is applied immediately; remote input that has not arrived yet is predicted by repeating the
//! last confirmed input. When a remote input disagrees with its prediction, the engine loads the
//! first incorrect frame, drops every prediction and resimulates up to the present, saving each
//! frame on the way.
//!
//! The engine never touches the transport or the simulation directly. Packets come in through
//! [`RollbackEngine::handle_packet`] and go out through [`RollbackEngine::flush`]; the
//! simulation is reached through a [`RollbackHandler`].
//!
//! ```
//! use rollback_netplay::{Frame, NetplayConfig, NetplayError, PlayerHandle, RollbackEngine};
//! use rollback_netplay::{RollbackHandler, SaveBuffer, SavedFrame};
//!
//! /// A counter that adds up every input it sees.
//! struct Sum(u32);
//!
//! impl RollbackHandler<u8> for Sum {
//!     fn save_frame(&mut self, _frame: Frame) -> Result<SavedFrame, NetplayError> {
//!         Ok(SavedFrame { buffer: SaveBuffer::from_vec(self.0.to_le_bytes().to_vec()), checksum: self.0 })
//!     }
//!     fn load_frame(&mut self, saved: &SavedFrame, _frame: Frame) -> Result<(), NetplayError> {
//!         self.0 = saved.checksum;
//!         Ok(())
//!     }
//!     fn free_frame(&mut self, _buffer: SaveBuffer) {}
//!     fn advance_frame(&mut self, inputs: &[u8], _disconnect_flags: u32) -> Result<(), NetplayError> {
//!         self.0 += inputs.iter().map(|&i| u32::from(i)).sum::<u32>();
//!         Ok(())
//!     }
//! }
//!
//! let config = NetplayConfig::default().with_input_delay(0);
//! let mut engine = RollbackEngine::<u8>::new(1, PlayerHandle::new(0), &[], 0, &config)?;
//! let mut sim = Sum(0);
//! for _ in 0..3 {
//!     engine.idle(&mut sim)?;
//!     engine.add_local_input(2)?;
//!     let (inputs, _flags) = engine.synchronize_input()?;
//!     sim.advance_frame(&inputs, 0)?;
//!     engine.advance_frame(&mut sim)?;
//! }
//! assert_eq!(sim.0, 6);
//! assert_eq!(engine.current_frame(), Frame::new(3));
//! # Ok::<(), NetplayError>(())
//! ```

pub(crate) mod endpoint;
pub(crate) mod input_queue;
pub(crate) mod messages;
pub mod save_pool;
pub(crate) mod sync_layer;
pub(crate) mod time_sync;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use self::endpoint::{Endpoint, EndpointEvent, EndpointState};
use self::input_queue::PlayerInput;
use self::messages::Message;
use self::sync_layer::{ConnectionStatus, SyncLayer};
use crate::config::{NetplayConfig, RollbackConfig};
use crate::network::network_stats::NetworkStats;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::transport::{send_or_log, Channel, PeerId, Reliability, Transport};
use crate::{
    report_violation_to, Frame, InputStatus, InputVec, NetInput, NetplayError, PlayerHandle,
    MAX_PLAYERS,
};

pub use save_pool::SaveBuffer;

/// Queued engine events beyond this are dropped oldest first.
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// A saved frame: the captured state and its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFrame {
    /// The captured simulation memory.
    pub buffer: SaveBuffer,
    /// Checksum of the frame, compared between peers.
    pub checksum: u32,
}

/// Callbacks the engine needs from the simulation.
///
/// Every call happens synchronously from inside an engine method.
pub trait RollbackHandler<I> {
    /// Captures the simulation state as of the start of `frame`.
    ///
    /// Must be deterministic: peers with identical state return identical checksums.
    fn save_frame(&mut self, frame: Frame) -> Result<SavedFrame, NetplayError>;

    /// Restores the simulation exactly to a state captured by [`save_frame`](Self::save_frame).
    fn load_frame(&mut self, saved: &SavedFrame, frame: Frame) -> Result<(), NetplayError>;

    /// Takes back a buffer the engine no longer needs.
    fn free_frame(&mut self, buffer: SaveBuffer);

    /// Runs one frame with `inputs` (one per player). Bit `i` of `disconnect_flags` is set when
    /// player `i` is disconnected and its input is a placeholder.
    fn advance_frame(&mut self, inputs: &[I], disconnect_flags: u32) -> Result<(), NetplayError>;
}

/// Lifecycle notices from the engine, drained with [`RollbackEngine::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackEvent {
    /// The first rollback message from a remote player arrived.
    ConnectedToPeer {
        /// The remote player.
        player: PlayerHandle,
    },
    /// Handshake progress with a remote player.
    SynchronizingWithPeer {
        /// The remote player.
        player: PlayerHandle,
        /// Round trips completed.
        count: u32,
        /// Round trips required.
        total: u32,
    },
    /// The handshake with a remote player completed.
    SynchronizedWithPeer {
        /// The remote player.
        player: PlayerHandle,
    },
    /// Every remote player is synchronized; input is accepted from now on.
    Running,
    /// A remote player has been silent for a while.
    ConnectionInterrupted {
        /// The remote player.
        player: PlayerHandle,
        /// Silence that triggered the notice.
        disconnect_timeout: Duration,
    },
    /// An interrupted remote player is talking again.
    ConnectionResumed {
        /// The remote player.
        player: PlayerHandle,
    },
    /// A remote player asked to be disconnected or was disconnected locally.
    DisconnectedFromPeer {
        /// The remote player.
        player: PlayerHandle,
    },
    /// Periodic clock drift estimate.
    TimeSync {
        /// How many frames the local simulation runs ahead of the slowest peer. Negative when
        /// behind.
        frames_ahead: f32,
        /// Frames until the next estimate.
        period_frames: u32,
    },
    /// Local and remote checksums differ for a confirmed frame.
    DesyncDetected {
        /// The frame that was compared.
        frame: Frame,
        /// Our checksum.
        local_checksum: u32,
        /// The remote player's checksum.
        remote_checksum: u32,
        /// The remote player.
        player: PlayerHandle,
    },
}

#[derive(Debug, Clone, Copy)]
struct Comparison {
    frame: Frame,
    local: u32,
    remote: u32,
}

/// Rollback session between the local player and a fixed set of remote players.
///
/// Created for one reset epoch and thrown away at the next reset.
pub struct RollbackEngine<I: NetInput> {
    config: RollbackConfig,
    num_players: usize,
    local_handle: PlayerHandle,
    epoch: u32,
    sync_layer: SyncLayer<I>,
    endpoints: Vec<Endpoint<I>>,
    local_connect_status: Vec<ConnectionStatus>,
    running: bool,

    /// Resimulation is forced from here when a player is found to have disconnected earlier.
    disconnect_frame: Frame,
    next_recommended_sleep: Frame,
    frames_ahead: f32,

    local_checksum_history: BTreeMap<Frame, u32>,
    last_sent_checksum_frame: Frame,
    last_compared: BTreeMap<PlayerHandle, Comparison>,

    event_queue: VecDeque<RollbackEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<I: NetInput> RollbackEngine<I> {
    /// Creates an engine for `num_players` players, where `local_handle` is ours and every
    /// other handle is reached through the listed transport peer.
    ///
    /// Without remote players the engine runs immediately. Otherwise it starts the handshake
    /// with every remote player; queued packets go out on the next [`flush`](Self::flush).
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if the handles do not form `0..num_players`, or
    /// the configuration does not validate.
    pub fn new(
        num_players: usize,
        local_handle: PlayerHandle,
        remotes: &[(PlayerHandle, PeerId)],
        epoch: u32,
        config: &NetplayConfig,
    ) -> Result<Self, NetplayError> {
        if num_players == 0 || num_players > MAX_PLAYERS {
            return Err(NetplayError::InvalidRequest {
                info: format!("player count {num_players} must be within [1, {MAX_PLAYERS}]"),
            });
        }
        if remotes.len() + 1 != num_players {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "{} remote players do not add up to {} players",
                    remotes.len(),
                    num_players
                ),
            });
        }
        let mut seen = [false; MAX_PLAYERS];
        for handle in std::iter::once(local_handle).chain(remotes.iter().map(|(h, _)| *h)) {
            if !handle.is_valid_player_for(num_players) || seen[handle.as_usize()] {
                return Err(NetplayError::InvalidRequest {
                    info: format!("player handle {handle} is out of range or used twice"),
                });
            }
            seen[handle.as_usize()] = true;
        }
        config.rollback.validate(config.input_delay)?;

        let mut sync_layer = SyncLayer::new(
            num_players,
            config.rollback.max_prediction,
            config.rollback.input_queue_length,
        )?;
        sync_layer.set_frame_delay(local_handle, config.input_delay)?;

        let mut endpoints: Vec<Endpoint<I>> = remotes
            .iter()
            .map(|&(handle, peer)| {
                Endpoint::new(
                    peer,
                    handle,
                    epoch,
                    config.endpoint,
                    config.tick_rate_hz,
                    config.rollback.time_sync_window,
                )
            })
            .collect();
        for endpoint in &mut endpoints {
            endpoint.synchronize();
        }

        let running = endpoints.is_empty();
        let mut event_queue = VecDeque::new();
        if running {
            event_queue.push_back(RollbackEvent::Running);
        }
        debug!(
            "Rollback engine for epoch {}: {} players, local handle {}",
            epoch, num_players, local_handle
        );

        Ok(Self {
            config: config.rollback,
            num_players,
            local_handle,
            epoch,
            sync_layer,
            endpoints,
            local_connect_status: vec![ConnectionStatus::default(); num_players],
            running,
            disconnect_frame: Frame::NULL,
            next_recommended_sleep: Frame::new(0),
            frames_ahead: 0.0,
            local_checksum_history: BTreeMap::new(),
            last_sent_checksum_frame: Frame::NULL,
            last_compared: BTreeMap::new(),
            event_queue,
            violation_observer: None,
        })
    }

    /// Routes violations to `observer` instead of `tracing`.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.violation_observer = observer;
    }

    /// Submits the local input for the current frame and sends it to every remote player.
    ///
    /// # Errors
    /// - [`NetplayError::NotSynchronized`] until every remote player finished the handshake.
    /// - [`NetplayError::PredictionThreshold`] when the engine is `max_prediction` frames ahead
    ///   of the last confirmed frame. Keep calling [`idle`](Self::idle) and try again.
    /// - [`NetplayError::InvalidRequest`] if input for this frame was already added.
    pub fn add_local_input(&mut self, input: I) -> Result<(), NetplayError> {
        if !self.running {
            return Err(NetplayError::NotSynchronized);
        }
        let current = self.sync_layer.current_frame();
        if self.frames_ahead_of_confirmed() >= self.config.max_prediction as i32 {
            trace!("Prediction threshold reached at frame {}", current);
            return Err(NetplayError::PredictionThreshold);
        }

        let actual = self
            .sync_layer
            .add_local_input(self.local_handle, PlayerInput::new(current, input));
        if actual.is_null() {
            return Err(NetplayError::InvalidRequest {
                info: format!("local input for frame {current} was already added"),
            });
        }
        if let Some(status) = self.local_connect_status.get_mut(self.local_handle.as_usize()) {
            status.last_frame = actual;
        }
        for endpoint in &mut self.endpoints {
            endpoint.send_input(PlayerInput::new(actual, input));
        }
        Ok(())
    }

    /// Inputs of every player for the current frame, predicted where they have not arrived,
    /// and the disconnect flags (bit `i` set when player `i` is disconnected).
    ///
    /// # Errors
    /// Returns [`NetplayError::NotSynchronized`] before the engine runs, and
    /// [`NetplayError::InternalError`] if a misprediction is still pending.
    pub fn synchronize_input(&mut self) -> Result<(SmallVec<[I; 4]>, u32), NetplayError> {
        if !self.running {
            return Err(NetplayError::NotSynchronized);
        }
        let inputs = self
            .sync_layer
            .synchronized_inputs(&self.local_connect_status)
            .ok_or_else(|| NetplayError::InternalError {
                context: format!(
                    "no synchronized inputs for frame {}",
                    self.sync_layer.current_frame()
                ),
            })?;
        Ok(split_inputs(&inputs))
    }

    /// Commits the frame the simulation just ran: saves it and reconciles with remote input.
    ///
    /// # Errors
    /// Propagates handler failures; saving or loading a frame the engine declared valid is a
    /// broken contract.
    pub fn advance_frame<H: RollbackHandler<I> + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        self.save_initial_frame(handler)?;
        self.sync_layer.advance_frame();
        trace!("Advanced to frame {}", self.sync_layer.current_frame());
        self.sync_layer.save_current_state(handler)?;
        self.do_poll(handler)
    }

    /// Gives the engine time to work between frames: endpoint timers, handshake retries,
    /// checksum exchange, rollbacks and time-sync estimates.
    ///
    /// # Errors
    /// Propagates handler failures during a rollback.
    pub fn idle<H: RollbackHandler<I> + ?Sized>(&mut self, handler: &mut H) -> Result<(), NetplayError> {
        let now = Instant::now();
        let current = self.sync_layer.current_frame();
        for endpoint in &mut self.endpoints {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current);
            }
            endpoint.poll(now);
        }
        self.process_endpoint_events();
        self.do_poll(handler)
    }

    /// Feeds one rollback-channel packet from `peer`.
    ///
    /// Packets from unknown peers and undecodable packets are dropped.
    pub fn handle_packet(&mut self, peer: PeerId, bytes: &[u8]) {
        let Some(endpoint) = self.endpoints.iter_mut().find(|ep| ep.peer() == peer) else {
            trace!("Rollback packet from {} which is not in this session", peer);
            return;
        };
        match Message::from_bytes(bytes) {
            Ok(msg) => endpoint.handle_message(&msg),
            Err(e) => {
                report_violation_to!(
                    &self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::RollbackProtocol,
                    "dropping undecodable rollback packet from {}: {}",
                    peer,
                    e
                );
                return;
            },
        }
        self.process_endpoint_events();
    }

    /// Sends every queued rollback message.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        for endpoint in &mut self.endpoints {
            let peer = endpoint.peer();
            let messages: Vec<Message> = endpoint.drain_messages().collect();
            for msg in messages {
                match msg.to_bytes() {
                    Ok(bytes) => {
                        send_or_log(
                            transport,
                            peer,
                            Channel::Rollback,
                            &bytes,
                            Reliability::Unreliable,
                        );
                    },
                    Err(e) => report_violation_to!(
                        &self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::RollbackProtocol,
                        "failed to encode rollback message for {}: {}",
                        peer,
                        e
                    ),
                }
            }
        }
    }

    /// Drains queued events.
    pub fn events(&mut self) -> std::collections::vec_deque::Drain<'_, RollbackEvent> {
        self.event_queue.drain(..)
    }

    /// Changes the input delay of a player. Only takes effect for inputs added afterwards.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidPlayer`] for an unknown handle.
    pub fn set_frame_delay(&mut self, player: PlayerHandle, delay: usize) -> Result<(), NetplayError> {
        self.sync_layer.set_frame_delay(player, delay)
    }

    /// The frame about to be simulated.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// Most recent frame with confirmed input from every connected player.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync_layer.last_confirmed_frame()
    }

    /// The rollback window in frames.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.config.max_prediction
    }

    /// Last time-sync estimate.
    #[must_use]
    pub fn frames_ahead(&self) -> f32 {
        self.frames_ahead
    }

    /// `true` once every remote player is synchronized.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Our player handle.
    #[must_use]
    pub fn local_handle(&self) -> PlayerHandle {
        self.local_handle
    }

    /// Number of players, including us.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Reset epoch the engine was created for.
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Last measured round trip to a remote player, in milliseconds.
    #[must_use]
    pub fn ping_ms(&self, player: PlayerHandle) -> Option<u64> {
        self.endpoint(player)
            .filter(|ep| ep.is_running())
            .map(Endpoint::round_trip_time)
    }

    /// Connection statistics for a remote player.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidPlayer`] if `player` is not a remote player.
    /// - [`NetplayError::NotSynchronized`] while its handshake is still running.
    pub fn network_stats(&self, player: PlayerHandle) -> Result<NetworkStats, NetplayError> {
        let endpoint = self
            .endpoint(player)
            .ok_or(NetplayError::InvalidPlayer { player })?;
        let mut stats = endpoint
            .network_stats()
            .ok_or(NetplayError::NotSynchronized)?;
        if let Some(comparison) = self.last_compared.get(&player) {
            stats.last_compared_frame = Some(comparison.frame);
            stats.local_checksum = Some(comparison.local);
            stats.remote_checksum = Some(comparison.remote);
        }
        Ok(stats)
    }

    /// Stops waiting for a remote player. Its input is replaced by the default input from the
    /// frame after its last received one.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] for the local player or a player that is
    /// already disconnected, and [`NetplayError::InvalidPlayer`] for an unknown handle.
    pub fn disconnect_player(&mut self, player: PlayerHandle) -> Result<(), NetplayError> {
        if player == self.local_handle {
            return Err(NetplayError::InvalidRequest {
                info: "the local player cannot be disconnected".to_owned(),
            });
        }
        let status = self
            .local_connect_status
            .get(player.as_usize())
            .copied()
            .ok_or(NetplayError::InvalidPlayer { player })?;
        if status.disconnected {
            return Err(NetplayError::InvalidRequest {
                info: format!("player {player} is already disconnected"),
            });
        }
        self.disconnect_player_at_frame(player, status.last_frame);
        Ok(())
    }

    /// Hands every saved buffer back to the handler. Call before dropping the engine.
    pub fn release_saved_states<H: RollbackHandler<I> + ?Sized>(&mut self, handler: &mut H) {
        self.sync_layer.release_saved_states(handler);
    }

    fn endpoint(&self, player: PlayerHandle) -> Option<&Endpoint<I>> {
        self.endpoints.iter().find(|ep| ep.handle() == player)
    }

    fn frames_ahead_of_confirmed(&self) -> i32 {
        let current = self.sync_layer.current_frame();
        let confirmed = self.sync_layer.last_confirmed_frame();
        if confirmed.is_null() {
            current.as_i32()
        } else {
            current - confirmed
        }
    }

    fn save_initial_frame<H: RollbackHandler<I> + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        if self.sync_layer.current_frame() == 0 && self.sync_layer.last_saved_frame().is_null() {
            trace!("Saving state of first frame");
            self.sync_layer.save_current_state(handler)?;
        }
        Ok(())
    }

    fn do_poll<H: RollbackHandler<I> + ?Sized>(&mut self, handler: &mut H) -> Result<(), NetplayError> {
        if !self.running {
            return Ok(());
        }
        self.save_initial_frame(handler)?;

        // Checksums are examined before the confirmed frame moves, so a frame that is about to
        // be resimulated is never compared against its stale checksum.
        if self.config.checksum_interval > 0 {
            self.send_checksum_if_due();
            self.compare_checksums();
        }

        let first_incorrect = self
            .sync_layer
            .check_simulation_consistency(self.disconnect_frame);
        if !first_incorrect.is_null() {
            self.adjust_gamestate(first_incorrect, handler)?;
            self.disconnect_frame = Frame::NULL;
        }

        let confirmed = self
            .local_connect_status
            .iter()
            .filter(|status| !status.disconnected)
            .map(|status| status.last_frame)
            .min()
            .unwrap_or(Frame::NULL);
        if !confirmed.is_null() {
            self.sync_layer.set_last_confirmed_frame(confirmed);
        }

        self.check_time_sync();
        Ok(())
    }

    /// Loads `first_incorrect` and resimulates up to the current frame with corrected inputs.
    fn adjust_gamestate<H: RollbackHandler<I> + ?Sized>(
        &mut self,
        first_incorrect: Frame,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        let current = self.sync_layer.current_frame();
        if first_incorrect >= current {
            // the misprediction is for a frame we have not simulated yet
            self.sync_layer.reset_prediction();
            return Ok(());
        }

        let count = current - first_incorrect;
        debug!(
            "Rolling back {} frames from {} to {}",
            count, current, first_incorrect
        );
        self.sync_layer.load_frame(first_incorrect, handler)?;
        self.sync_layer.reset_prediction();

        for _ in 0..count {
            let inputs = self
                .sync_layer
                .synchronized_inputs(&self.local_connect_status)
                .ok_or_else(|| NetplayError::InternalError {
                    context: format!(
                        "no synchronized inputs while resimulating frame {}",
                        self.sync_layer.current_frame()
                    ),
                })?;
            let (inputs, disconnect_flags) = split_inputs(&inputs);
            handler.advance_frame(&inputs, disconnect_flags)?;
            self.sync_layer.advance_frame();
            self.sync_layer.save_current_state(handler)?;
        }

        let final_frame = self.sync_layer.current_frame();
        if final_frame != current {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "resimulation ended at frame {} instead of {}",
                final_frame,
                current
            );
        }
        Ok(())
    }

    fn disconnect_player_at_frame(&mut self, player: PlayerHandle, last_frame: Frame) {
        let Some(status) = self.local_connect_status.get_mut(player.as_usize()) else {
            return;
        };
        status.disconnected = true;
        if let Some(endpoint) = self.endpoints.iter_mut().find(|ep| ep.handle() == player) {
            endpoint.disconnect();
        }
        if self.sync_layer.current_frame() > last_frame {
            // resimulate from the first frame the player's input was predicted
            self.disconnect_frame = last_frame.saturating_add(1);
        }
        debug!("Player {} disconnected after frame {}", player, last_frame);
        self.check_initial_sync();
    }

    fn check_initial_sync(&mut self) {
        if self.running {
            return;
        }
        if self
            .endpoints
            .iter()
            .all(|ep| ep.state() != EndpointState::Synchronizing)
        {
            debug!("All rollback endpoints synchronized for epoch {}", self.epoch);
            self.running = true;
            self.push_event(RollbackEvent::Running);
        }
    }

    fn process_endpoint_events(&mut self) {
        for index in 0..self.endpoints.len() {
            let (player, events) = {
                let endpoint = &mut self.endpoints[index];
                let events: Vec<EndpointEvent<I>> = endpoint.drain_events().collect();
                (endpoint.handle(), events)
            };
            for event in events {
                self.handle_endpoint_event(player, event);
            }
        }
    }

    fn handle_endpoint_event(&mut self, player: PlayerHandle, event: EndpointEvent<I>) {
        match event {
            EndpointEvent::Connected => {
                self.push_event(RollbackEvent::ConnectedToPeer { player });
            },
            EndpointEvent::Synchronizing { count, total } => {
                self.push_event(RollbackEvent::SynchronizingWithPeer {
                    player,
                    count,
                    total,
                });
            },
            EndpointEvent::Synchronized => {
                self.push_event(RollbackEvent::SynchronizedWithPeer { player });
                self.check_initial_sync();
            },
            EndpointEvent::Input(input) => {
                let Some(status) = self.local_connect_status.get_mut(player.as_usize()) else {
                    return;
                };
                if status.disconnected {
                    return;
                }
                if !status.last_frame.is_null() && status.last_frame + 1 != input.frame {
                    report_violation_to!(
                        &self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::RollbackProtocol,
                        "input from player {} for frame {} does not follow frame {}",
                        player,
                        input.frame,
                        status.last_frame
                    );
                    return;
                }
                status.last_frame = input.frame;
                self.sync_layer.add_remote_input(player, input);
            },
            EndpointEvent::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(RollbackEvent::ConnectionInterrupted {
                    player,
                    disconnect_timeout,
                });
            },
            EndpointEvent::NetworkResumed => {
                self.push_event(RollbackEvent::ConnectionResumed { player });
            },
            EndpointEvent::Disconnected => {
                let last_frame = self
                    .local_connect_status
                    .get(player.as_usize())
                    .map_or(Frame::NULL, |status| status.last_frame);
                self.disconnect_player_at_frame(player, last_frame);
                self.push_event(RollbackEvent::DisconnectedFromPeer { player });
            },
        }
    }

    fn check_time_sync(&mut self) {
        let current = self.sync_layer.current_frame();
        if current <= self.next_recommended_sleep {
            return;
        }
        let frames_ahead = self
            .endpoints
            .iter()
            .filter(|ep| ep.is_running())
            .map(Endpoint::frames_ahead)
            .fold(None, |max: Option<f32>, ahead| {
                Some(max.map_or(ahead, |m| m.max(ahead)))
            })
            .unwrap_or(0.0);
        self.frames_ahead = frames_ahead;
        self.next_recommended_sleep = current + self.config.recommendation_interval as i32;
        self.push_event(RollbackEvent::TimeSync {
            frames_ahead,
            period_frames: self.config.recommendation_interval,
        });
    }

    fn send_checksum_if_due(&mut self) {
        let interval = self.config.checksum_interval as i32;
        let frame_to_send = if self.last_sent_checksum_frame.is_null() {
            Frame::new(interval)
        } else {
            self.last_sent_checksum_frame + interval
        };
        if frame_to_send > self.sync_layer.last_confirmed_frame()
            || frame_to_send > self.sync_layer.last_saved_frame()
        {
            return;
        }

        match self.sync_layer.saved_checksum(frame_to_send) {
            Some(checksum) => {
                for endpoint in self.endpoints.iter_mut().filter(|ep| ep.is_running()) {
                    endpoint.send_checksum_report(frame_to_send, checksum);
                }
                self.local_checksum_history.insert(frame_to_send, checksum);
            },
            None => report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::StateManagement,
                "frame {} left the save ring before its checksum was sent",
                frame_to_send
            ),
        }
        self.last_sent_checksum_frame = frame_to_send;

        let oldest_to_keep = frame_to_send - interval * 32;
        self.local_checksum_history
            .retain(|&frame, _| frame >= oldest_to_keep);
    }

    fn compare_checksums(&mut self) {
        let confirmed = self.sync_layer.last_confirmed_frame();
        if confirmed.is_null() {
            return;
        }
        for index in 0..self.endpoints.len() {
            let endpoint = &mut self.endpoints[index];
            let player = endpoint.handle();
            for (frame, remote) in endpoint.take_checksums_before(confirmed) {
                let Some(&local) = self.local_checksum_history.get(&frame) else {
                    continue;
                };
                self.last_compared.insert(
                    player,
                    Comparison {
                        frame,
                        local,
                        remote,
                    },
                );
                if local != remote {
                    report_violation_to!(
                        &self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Desync,
                        "desync with player {} at frame {}: local {:08x}, remote {:08x}",
                        player,
                        frame,
                        local,
                        remote
                    );
                    self.event_queue.push_back(RollbackEvent::DesyncDetected {
                        frame,
                        local_checksum: local,
                        remote_checksum: remote,
                        player,
                    });
                }
            }
        }
        self.trim_events();
    }

    fn push_event(&mut self, event: RollbackEvent) {
        self.event_queue.push_back(event);
        self.trim_events();
    }

    fn trim_events(&mut self) {
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }
}

/// Splits synchronized inputs into plain inputs and disconnect flags.
fn split_inputs<I: NetInput>(inputs: &InputVec<I>) -> (SmallVec<[I; 4]>, u32) {
    let mut flags = 0u32;
    let plain = inputs
        .iter()
        .enumerate()
        .map(|(i, (input, status))| {
            if *status == InputStatus::Disconnected {
                flags |= 1 << i;
            }
            *input
        })
        .collect();
    (plain, flags)
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
    use crate::checksum::frame_checksum;
    use crate::telemetry::CollectingObserver;
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};
    use crate::transport::TransportEvent;

    /// Deterministic toy simulation: the state is a running hash of every input.
    #[derive(Default)]
    struct Hasher {
        state: u64,
        frame: i32,
        loads: usize,
        advances: usize,
        freed: usize,
        /// Added to the state on every frame to fake a non-deterministic simulation.
        drift: u64,
    }

    impl RollbackHandler<u8> for Hasher {
        fn save_frame(&mut self, frame: Frame) -> Result<SavedFrame, NetplayError> {
            assert_eq!(frame.as_i32(), self.frame);
            let mut bytes = self.state.to_le_bytes().to_vec();
            bytes.extend_from_slice(&self.frame.to_le_bytes());
            let checksum = frame_checksum(frame, &bytes);
            Ok(SavedFrame {
                buffer: SaveBuffer::from_vec(bytes),
                checksum,
            })
        }

        fn load_frame(&mut self, saved: &SavedFrame, frame: Frame) -> Result<(), NetplayError> {
            let bytes = saved.buffer.as_slice();
            self.state = u64::from_le_bytes(bytes[..8].try_into().unwrap());
            self.frame = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
            assert_eq!(self.frame, frame.as_i32());
            self.loads += 1;
            Ok(())
        }

        fn free_frame(&mut self, _buffer: SaveBuffer) {
            self.freed += 1;
        }

        fn advance_frame(&mut self, inputs: &[u8], disconnect_flags: u32) -> Result<(), NetplayError> {
            for &input in inputs {
                self.state = self.state.wrapping_mul(31).wrapping_add(u64::from(input));
            }
            self.state = self
                .state
                .wrapping_add(u64::from(disconnect_flags))
                .wrapping_add(self.drift);
            self.frame += 1;
            self.advances += 1;
            Ok(())
        }
    }

    fn config() -> NetplayConfig {
        NetplayConfig::default().with_input_delay(0)
    }

    struct Peer {
        engine: RollbackEngine<u8>,
        sim: Hasher,
        transport: MemoryTransport,
    }

    impl Peer {
        fn pump(&mut self) {
            while let Some(event) = self.transport.poll(Duration::ZERO) {
                if let TransportEvent::Received {
                    peer,
                    channel: Channel::Rollback,
                    payload,
                } = event
                {
                    self.engine.handle_packet(peer, &payload);
                }
            }
            self.engine.idle(&mut self.sim).unwrap();
            self.engine.flush(&mut self.transport);
        }

        /// Runs one frame if the engine allows it. Returns `false` when the input was refused.
        fn step(&mut self, input: u8) -> bool {
            match self.engine.add_local_input(input) {
                Ok(()) => {},
                Err(NetplayError::PredictionThreshold | NetplayError::NotSynchronized) => {
                    return false
                },
                Err(e) => panic!("unexpected error {e}"),
            }
            let (inputs, flags) = self.engine.synchronize_input().unwrap();
            self.sim.advance_frame(&inputs, flags).unwrap();
            self.engine.advance_frame(&mut self.sim).unwrap();
            self.engine.flush(&mut self.transport);
            true
        }
    }

    fn two_peers(config: &NetplayConfig) -> (MemoryNetwork, Peer, Peer) {
        let network = MemoryNetwork::new();
        let mut ta = network.bind(5000).unwrap();
        let mut tb = network.bind(5001).unwrap();
        let a_to_b = ta.connect(tb.local_addr(), 0).unwrap();
        let Some(TransportEvent::Connected { peer: b_to_a, .. }) = tb.poll(Duration::ZERO) else {
            panic!("no connect event");
        };
        ta.poll(Duration::ZERO);

        let a = RollbackEngine::new(2, PlayerHandle::new(0), &[(PlayerHandle::new(1), a_to_b)], 1, config)
            .unwrap();
        let b = RollbackEngine::new(2, PlayerHandle::new(1), &[(PlayerHandle::new(0), b_to_a)], 1, config)
            .unwrap();
        let mut a = Peer {
            engine: a,
            sim: Hasher::default(),
            transport: ta,
        };
        let mut b = Peer {
            engine: b,
            sim: Hasher::default(),
            transport: tb,
        };
        for _ in 0..20 {
            a.pump();
            b.pump();
        }
        assert!(a.engine.is_running() && b.engine.is_running());
        (network, a, b)
    }

    #[test]
    fn rejects_bad_handles() {
        let config = config();
        assert!(RollbackEngine::<u8>::new(0, PlayerHandle::new(0), &[], 0, &config).is_err());
        assert!(RollbackEngine::<u8>::new(1, PlayerHandle::new(1), &[], 0, &config).is_err());
        assert!(RollbackEngine::<u8>::new(
            2,
            PlayerHandle::new(0),
            &[(PlayerHandle::new(0), PeerId::new(1))],
            0,
            &config
        )
        .is_err());
        assert!(RollbackEngine::<u8>::new(2, PlayerHandle::new(0), &[], 0, &config).is_err());
    }

    #[test]
    fn single_player_runs_immediately() {
        let mut engine = RollbackEngine::<u8>::new(1, PlayerHandle::new(0), &[], 0, &config()).unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.events().collect::<Vec<_>>(), vec![RollbackEvent::Running]);
        assert_eq!(engine.confirmed_frame(), Frame::NULL);
    }

    #[test]
    fn input_is_refused_until_synchronized() {
        let mut engine = RollbackEngine::<u8>::new(
            2,
            PlayerHandle::new(0),
            &[(PlayerHandle::new(1), PeerId::new(0))],
            0,
            &config(),
        )
        .unwrap();
        assert_eq!(engine.add_local_input(1), Err(NetplayError::NotSynchronized));
        assert!(matches!(
            engine.synchronize_input(),
            Err(NetplayError::NotSynchronized)
        ));
    }

    #[test]
    fn input_delay_shifts_local_input() {
        let config = NetplayConfig::default().with_input_delay(2);
        let mut engine = RollbackEngine::<u8>::new(1, PlayerHandle::new(0), &[], 0, &config).unwrap();
        let mut sim = Hasher::default();
        let mut seen = Vec::new();
        for input in 1..=4u8 {
            engine.idle(&mut sim).unwrap();
            engine.add_local_input(input).unwrap();
            let (inputs, _) = engine.synchronize_input().unwrap();
            seen.push(inputs[0]);
            sim.advance_frame(&inputs, 0).unwrap();
            engine.advance_frame(&mut sim).unwrap();
        }
        assert_eq!(seen, vec![0, 0, 1, 2]);
    }

    #[test]
    fn double_input_in_one_frame_is_rejected() {
        let mut engine = RollbackEngine::<u8>::new(1, PlayerHandle::new(0), &[], 0, &config()).unwrap();
        engine.add_local_input(1).unwrap();
        assert!(matches!(
            engine.add_local_input(2),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn prediction_threshold_stops_a_lonely_peer() {
        let (_network, mut a, _b) = two_peers(&config());
        let max = a.engine.max_prediction();
        let mut frames = 0;
        while a.step(1) {
            frames += 1;
            assert!(frames <= max + 1, "ran past the prediction window");
        }
        assert_eq!(frames, max);
        assert_eq!(a.engine.add_local_input(1), Err(NetplayError::PredictionThreshold));
    }

    #[test]
    fn peers_converge_after_rollback() {
        let (_network, mut a, mut b) = two_peers(&config());
        // a runs ahead predicting b's input as 0, then b's real inputs arrive
        for frame in 0..5u8 {
            assert!(a.step(frame + 1));
        }
        for frame in 0..5u8 {
            assert!(b.step(frame + 100));
        }
        for _ in 0..4 {
            a.pump();
            b.pump();
        }
        assert!(a.sim.loads > 0, "a never rolled back");
        assert_eq!(a.engine.current_frame(), b.engine.current_frame());
        assert_eq!(a.sim.state, b.sim.state);
        assert_eq!(a.engine.confirmed_frame(), Frame::new(4));
    }

    #[test]
    fn alternating_play_stays_in_sync() {
        let (_network, mut a, mut b) = two_peers(&config());
        for frame in 0..40u8 {
            assert!(a.step(frame));
            assert!(b.step(frame.wrapping_mul(3)));
            a.pump();
            b.pump();
        }
        assert_eq!(a.sim.state, b.sim.state);
        assert_eq!(a.engine.current_frame(), Frame::new(40));
    }

    #[test]
    fn identical_simulations_report_no_desync() {
        let (_network, mut a, mut b) = two_peers(&config());
        for frame in 0..60u8 {
            a.step(frame);
            b.step(frame);
            a.pump();
            b.pump();
        }
        let events: Vec<RollbackEvent> = a.engine.events().collect();
        assert!(!events
            .iter()
            .any(|e| matches!(e, RollbackEvent::DesyncDetected { .. })));
        let stats = a.engine.network_stats(PlayerHandle::new(1)).unwrap();
        assert_eq!(stats.checksums_match(), Some(true));
    }

    #[test]
    fn diverging_simulations_report_desync() {
        let (_network, mut a, mut b) = two_peers(&config());
        let observer = Arc::new(CollectingObserver::new());
        a.engine
            .set_violation_observer(Some(observer.clone() as Arc<dyn ViolationObserver>));
        b.sim.drift = 1;
        for frame in 0..60u8 {
            a.step(frame);
            b.step(frame);
            a.pump();
            b.pump();
        }
        let desync = a
            .engine
            .events()
            .find(|e| matches!(e, RollbackEvent::DesyncDetected { .. }));
        let Some(RollbackEvent::DesyncDetected {
            frame,
            local_checksum,
            remote_checksum,
            player,
        }) = desync
        else {
            panic!("no desync reported");
        };
        assert_eq!(frame, Frame::new(16));
        assert_ne!(local_checksum, remote_checksum);
        assert_eq!(player, PlayerHandle::new(1));
        assert!(observer.has_violation(ViolationKind::Desync));
    }

    #[test]
    fn disconnected_player_gets_flagged_default_input() {
        let (_network, mut a, _b) = two_peers(&config());
        a.engine.disconnect_player(PlayerHandle::new(1)).unwrap();
        assert!(a.engine.disconnect_player(PlayerHandle::new(1)).is_err());
        assert!(a.engine.disconnect_player(PlayerHandle::new(0)).is_err());
        a.engine.add_local_input(9).unwrap();
        let (inputs, flags) = a.engine.synchronize_input().unwrap();
        assert_eq!(inputs.as_slice(), &[9, 0]);
        assert_eq!(flags, 0b10);
        a.sim.advance_frame(&inputs, flags).unwrap();
        a.engine.advance_frame(&mut a.sim).unwrap();
        // nobody to wait for, so the window never fills up
        for _ in 0..30 {
            assert!(a.step(9));
        }
        assert_eq!(a.engine.current_frame(), Frame::new(31));
    }

    #[test]
    fn packets_from_another_epoch_are_ignored() {
        let config = config();
        let network = MemoryNetwork::new();
        let mut ta = network.bind(6000).unwrap();
        let tb = network.bind(6001).unwrap();
        let a_to_b = ta.connect(tb.local_addr(), 0).unwrap();

        let mut old = RollbackEngine::<u8>::new(2, PlayerHandle::new(1), &[(PlayerHandle::new(0), PeerId::new(0))], 1, &config)
            .unwrap();
        let mut new = RollbackEngine::<u8>::new(2, PlayerHandle::new(0), &[(PlayerHandle::new(1), a_to_b)], 2, &config)
            .unwrap();
        let stale: Vec<Vec<u8>> = old.endpoints[0]
            .drain_messages()
            .map(|m| m.to_bytes().unwrap())
            .collect();
        for bytes in &stale {
            new.handle_packet(a_to_b, bytes);
        }
        assert!(new.events().next().is_none());
    }

    #[test]
    fn garbage_packets_are_reported() {
        let observer = Arc::new(CollectingObserver::new());
        let mut engine = RollbackEngine::<u8>::new(
            2,
            PlayerHandle::new(0),
            &[(PlayerHandle::new(1), PeerId::new(3))],
            0,
            &config(),
        )
        .unwrap();
        engine.set_violation_observer(Some(observer.clone() as Arc<dyn ViolationObserver>));
        engine.handle_packet(PeerId::new(3), &[0xFF, 0xFF, 0xFF]);
        assert!(observer.has_violation(ViolationKind::RollbackProtocol));
        // unknown peers are ignored without a report
        engine.handle_packet(PeerId::new(4), &[0xFF]);
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn time_sync_is_reported_periodically() {
        let config = config().with_rollback(RollbackConfig {
            recommendation_interval: 10,
            ..RollbackConfig::default()
        });
        let (_network, mut a, mut b) = two_peers(&config);
        for frame in 0..25u8 {
            a.step(frame);
            b.step(frame);
            a.pump();
            b.pump();
        }
        let syncs = a
            .engine
            .events()
            .filter(|e| matches!(e, RollbackEvent::TimeSync { period_frames: 10, .. }))
            .count();
        assert_eq!(syncs, 3);
    }

    #[test]
    fn release_returns_every_buffer() {
        let mut engine = RollbackEngine::<u8>::new(1, PlayerHandle::new(0), &[], 0, &config()).unwrap();
        let mut sim = Hasher::default();
        for _ in 0..3 {
            engine.idle(&mut sim).unwrap();
            engine.add_local_input(0).unwrap();
            let (inputs, flags) = engine.synchronize_input().unwrap();
            sim.advance_frame(&inputs, flags).unwrap();
            engine.advance_frame(&mut sim).unwrap();
        }
        engine.release_saved_states(&mut sim);
        assert_eq!(sim.freed, 4);
    }

    #[test]
    fn split_inputs_sets_flags_for_disconnected_players() {
        let mut inputs = InputVec::<u8>::new();
        inputs.push((1, InputStatus::Confirmed));
        inputs.push((0, InputStatus::Disconnected));
        inputs.push((3, InputStatus::Predicted));
        inputs.push((0, InputStatus::Disconnected));
        let (plain, flags) = split_inputs(&inputs);
        assert_eq!(plain.as_slice(), &[1, 0, 3, 0]);
        assert_eq!(flags, 0b1010);
    }
}
