//! The netplay session: lifecycle, membership and the run loop.
//!
//! A [`Session`] is either hosting (player 0, the authority over membership and state) or a
//! client. The host accepts joins, and after every membership change broadcasts a snapshot of
//! its simulation so every player restarts from bit-identical state. Between resets, frames
//! run through a [`RollbackEngine`] that hides latency with prediction and rewind.
//!
//! Everything happens on the caller's thread. [`Session::update`] runs one iteration of the
//! loop for the current state and never blocks for longer than a poll interval or a frame
//! period; [`Session::execute`] calls it until the session is inactive again.

mod control;
mod frame;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};
use web_time::{Duration, Instant};

use self::frame::FrameHandler;
use crate::config::NetplayConfig;
use crate::control::{send_control, CloseReason, ControlMessage, DropReason};
use crate::driver::{BootParams, HostUi, LoadingProgress, SettingsOverlay, SimulationDriver};
use crate::network::network_stats::NetworkStats;
use crate::pacing::FramePacer;
use crate::peers::PeerTable;
use crate::reset::ResetEpoch;
use crate::rollback::save_pool::SaveBufferPool;
use crate::rollback::{RollbackEngine, RollbackEvent};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::transport::{
    PeerId, PeerState, Transport, TransportEvent, TransportFactory, NO_CLAIMED_PLAYER,
};
use crate::{
    report_violation_to, Config, Frame, NetplayError, PlayerHandle, PlayerId, MAX_PLAYERS,
};

pub use state::{Role, SessionState};

/// Parameters of [`Session::start_host`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostParams {
    /// The host's nickname.
    pub nickname: String,
    /// Port to listen on.
    pub port: u16,
    /// Largest number of players, the host included. At most [`MAX_PLAYERS`].
    pub max_players: usize,
    /// Session password. Sent along but never checked.
    pub password: String,
}

/// Parameters of [`Session::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    /// The joiner's nickname.
    pub nickname: String,
    /// Where the host listens.
    pub host_addr: SocketAddr,
    /// Session password. Sent along but never checked.
    pub password: String,
}

/// Title of errors that end the session.
const ERROR_TITLE: &str = "Netplay Error";

/// One netplay session, hosting or joined.
///
/// `T` bundles the input type with the simulation driver and UI the session drives.
pub struct Session<T: Config> {
    config: NetplayConfig,
    factory: Box<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    driver: T::Driver,
    ui: T::Ui,

    state: SessionState,
    role: Option<Role>,
    peers: PeerTable,
    num_players: usize,
    max_players: usize,
    password: String,
    host_addr: Option<SocketAddr>,

    epoch: ResetEpoch,
    engine: Option<RollbackEngine<T::Input>>,
    save_pool: SaveBufferPool,
    pacer: FramePacer,
    settings: SettingsOverlay,

    /// Start of the current connect, reset or close phase.
    phase_started: Instant,
    last_host_attempt: Instant,

    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> Session<T> {
    /// Creates an inactive session. `factory` opens the transport when the session starts.
    pub fn new(
        config: NetplayConfig,
        factory: Box<dyn TransportFactory>,
        driver: T::Driver,
        ui: T::Ui,
    ) -> Self {
        let now = Instant::now();
        let pacer = FramePacer::new(config.tick_rate_hz, config.throttle_slice, now);
        Self {
            config,
            factory,
            transport: None,
            driver,
            ui,
            state: SessionState::Inactive,
            role: None,
            peers: PeerTable::default(),
            num_players: 0,
            max_players: MAX_PLAYERS,
            password: String::new(),
            host_addr: None,
            epoch: ResetEpoch::default(),
            engine: None,
            save_pool: SaveBufferPool::new(),
            pacer,
            settings: SettingsOverlay::netplay_defaults(),
            phase_started: now,
            last_host_attempt: now,
            violation_observer: None,
        }
    }

    /// Routes violations to `observer` instead of `tracing`, for this session and every
    /// rollback engine it creates.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        if let Some(engine) = self.engine.as_mut() {
            engine.set_violation_observer(observer.clone());
        }
        self.violation_observer = observer;
    }

    /// Replaces the settings forced while the session is active. Takes effect on the next
    /// start.
    pub fn set_settings_overlay(&mut self, overlay: SettingsOverlay) {
        self.settings = overlay;
    }

    /// Starts hosting on `params.port`. The simulation must already be running.
    ///
    /// The host is player 0 and starts in [`SessionState::Running`] on its own.
    ///
    /// # Errors
    /// - [`NetplayError::AlreadyActive`] if a session is active or closing.
    /// - [`NetplayError::InvalidRequest`] for a bad configuration, player count, or without a
    ///   running simulation.
    /// - [`NetplayError::Transport`] if the port cannot be bound.
    pub fn start_host(&mut self, params: HostParams) -> Result<(), NetplayError> {
        self.check_startable()?;
        if !self.driver.is_running() {
            return Err(NetplayError::InvalidRequest {
                info: "cannot host a netplay session without a running simulation".to_owned(),
            });
        }
        if params.max_players == 0 || params.max_players > MAX_PLAYERS {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "max_players {} must be within [1, {MAX_PLAYERS}]",
                    params.max_players
                ),
            });
        }

        self.begin_start(Role::Host, &params.nickname, params.password);
        self.max_players = params.max_players;
        let transport = match self.factory.open(Some(params.port)) {
            Ok(transport) => transport,
            Err(e) => {
                self.abort_start();
                return Err(e);
            },
        };
        self.transport = Some(transport);
        self.peers = PeerTable::new(Some(PlayerId::HOST), &params.nickname);
        self.num_players = 1;
        self.epoch.adopt(0, PlayerId::HOST);
        self.create_engine();
        self.set_state(SessionState::Running);
        info!("Netplay session started as host on port {}", params.port);
        Ok(())
    }

    /// Connects to a host. Boots an empty simulation first if none is running; the host's
    /// snapshot replaces it.
    ///
    /// The session is in [`SessionState::Connecting`] until the host answers.
    ///
    /// # Errors
    /// - [`NetplayError::AlreadyActive`] if a session is active or closing.
    /// - [`NetplayError::InvalidRequest`] for a bad configuration.
    /// - [`NetplayError::Simulation`] if the simulation cannot boot.
    /// - [`NetplayError::Transport`] if no transport can be opened or the connection attempt
    ///   cannot start.
    pub fn join(&mut self, params: JoinParams) -> Result<(), NetplayError> {
        self.check_startable()?;
        if !self.driver.is_running() {
            self.driver.boot(&BootParams {
                content: None,
                fast_boot: true,
            })?;
        }

        self.begin_start(Role::Client, &params.nickname, params.password);
        let started = self
            .factory
            .open(None)
            .and_then(|mut transport| {
                let peer = transport.connect(params.host_addr, NO_CLAIMED_PLAYER)?;
                Ok((transport, peer))
            });
        let (transport, host_peer) = match started {
            Ok(started) => started,
            Err(e) => {
                self.abort_start();
                return Err(e);
            },
        };
        self.transport = Some(transport);
        self.peers = PeerTable::new(None, &params.nickname);
        if let Err(e) = self.peers.assign(PlayerId::HOST, host_peer) {
            self.abort_start();
            return Err(e);
        }
        self.host_addr = Some(params.host_addr);
        self.num_players = 0;
        self.epoch = ResetEpoch::default();
        self.phase_started = Instant::now();
        self.last_host_attempt = self.phase_started;
        self.set_state(SessionState::Connecting);
        info!("Connecting to netplay host at {}", params.host_addr);
        Ok(())
    }

    /// Runs one iteration of the loop for the current state. Returns the state afterwards.
    pub fn update(&mut self) -> SessionState {
        match self.state {
            SessionState::Connecting => self.update_connecting(),
            SessionState::Resetting => self.update_resetting(),
            SessionState::Running => {
                self.run_frame();
                self.ui.pump_messages();
                if self.state == SessionState::Running {
                    self.throttle();
                }
            },
            SessionState::ClosingSession => self.update_closing(),
            SessionState::Inactive | SessionState::Initializing => {},
        }
        self.state
    }

    /// Runs the loop until the session is inactive.
    pub fn execute(&mut self) {
        while self.update() != SessionState::Inactive {}
    }

    /// Sends a chat line to every player and shows it locally. Empty lines are ignored.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if no session is active.
    pub fn send_chat(&mut self, text: &str) -> Result<(), NetplayError> {
        if !self.state.is_active() {
            return Err(NetplayError::InvalidRequest {
                info: "no netplay session is active".to_owned(),
            });
        }
        if text.is_empty() {
            return Ok(());
        }
        self.send_to_all(&ControlMessage::Chat {
            text: text.to_owned(),
        });
        if let Some(local) = self.peers.local_player() {
            self.show_chat(local, text);
        }
        Ok(())
    }

    /// Starts closing the session. The host tells everyone first.
    ///
    /// Peers are disconnected gracefully; the session turns inactive once they are gone or
    /// the close timeout elapsed. Does nothing unless a session is active.
    pub fn request_close(&mut self, reason: CloseReason) {
        if !self.state.is_active() || self.state == SessionState::Initializing {
            return;
        }
        info!("Closing netplay session: {}", reason);
        if self.role == Some(Role::Host) {
            self.send_to_all(&ControlMessage::CloseSession { reason });
        }
        self.begin_closing();
    }

    /// The simulation is going away: closes the session and waits for the close to finish.
    pub fn system_destroyed(&mut self) {
        self.request_close(CloseReason::HostShutdown);
        while self.state == SessionState::ClosingSession {
            self.update_closing();
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Host or client, while a session exists.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Our player id, once known.
    #[must_use]
    pub fn local_player_id(&self) -> Option<PlayerId> {
        self.peers.local_player()
    }

    /// Number of players in the session, us included.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// A player's nickname, or `""` for an unknown player.
    #[must_use]
    pub fn nickname(&self, player: PlayerId) -> &str {
        self.peers.nickname(player)
    }

    /// Every player and nickname, in id order.
    pub fn nicknames(&self) -> impl Iterator<Item = (PlayerId, &str)> + '_ {
        self.peers.nicknames()
    }

    /// Round-trip time to a remote player in milliseconds, while frames are running.
    #[must_use]
    pub fn ping(&self, player: PlayerId) -> Option<u64> {
        let handle = self.peers.rollback_handle(player)?;
        self.engine.as_ref()?.ping_ms(handle)
    }

    /// Connection statistics of a remote player.
    ///
    /// # Errors
    /// - [`NetplayError::NotSynchronized`] while no rollback engine runs.
    /// - [`NetplayError::InvalidRequest`] for an unknown or local player.
    pub fn network_stats(&self, player: PlayerId) -> Result<NetworkStats, NetplayError> {
        let engine = self.engine.as_ref().ok_or(NetplayError::NotSynchronized)?;
        let handle = self
            .peers
            .rollback_handle(player)
            .ok_or_else(|| NetplayError::InvalidRequest {
                info: format!("player {player} is not in the rollback session"),
            })?;
        engine.network_stats(handle)
    }

    /// How many frames the engine may predict ahead of confirmed input.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.engine
            .as_ref()
            .map_or(self.config.rollback.max_prediction, RollbackEngine::max_prediction)
    }

    /// The frame about to be simulated, or [`Frame::NULL`] while not running.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.engine
            .as_ref()
            .map_or(Frame::NULL, RollbackEngine::current_frame)
    }

    /// Cookie of the current reset round.
    #[must_use]
    pub fn reset_cookie(&self) -> u32 {
        self.epoch.cookie()
    }

    /// The player table.
    #[must_use]
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Where this session can be reached, while a transport is open.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|t| t.local_addr())
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &NetplayConfig {
        &self.config
    }

    /// The simulation driver.
    #[must_use]
    pub fn driver(&self) -> &T::Driver {
        &self.driver
    }

    /// The simulation driver, mutably.
    pub fn driver_mut(&mut self) -> &mut T::Driver {
        &mut self.driver
    }

    /// The UI.
    #[must_use]
    pub fn ui(&self) -> &T::Ui {
        &self.ui
    }

    /// The UI, mutably.
    pub fn ui_mut(&mut self) -> &mut T::Ui {
        &mut self.ui
    }

    fn check_startable(&self) -> Result<(), NetplayError> {
        if self.state != SessionState::Inactive {
            return Err(NetplayError::AlreadyActive);
        }
        self.config.validate()
    }

    fn begin_start(&mut self, role: Role, nickname: &str, password: String) {
        self.set_state(SessionState::Initializing);
        self.role = Some(role);
        self.password = password;
        self.peers = PeerTable::new(None, nickname);
        self.driver.apply_settings(Some(&self.settings));
    }

    /// Undoes a start whose local setup failed.
    fn abort_start(&mut self) {
        self.transport = None;
        self.peers = PeerTable::default();
        self.driver.apply_settings(None);
        self.role = None;
        self.set_state(SessionState::Inactive);
    }

    /// Moves to `next`. An illegal transition is a broken invariant and aborts.
    fn set_state(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            fatal(
                &self.violation_observer,
                ViolationKind::InternalError,
                &format!("illegal session state transition {} -> {}", self.state, next),
            );
        }
        debug!("Session state {} -> {}", self.state, next);
        self.state = next;
    }

    fn update_connecting(&mut self) {
        let now = Instant::now();
        if now - self.phase_started >= self.config.connect_timeout {
            self.close_with_error("Timed out connecting to server.");
            return;
        }

        // The host may not have been listening yet when we first tried.
        let host_peer = self.peers.peer_for_player(PlayerId::HOST);
        if now - self.last_host_attempt > self.config.reconnect_interval()
            && self.peer_state(host_peer) != PeerState::Connected
        {
            self.reconnect_to_host(host_peer);
            self.last_host_attempt = now;
        }

        self.poll_transport(self.config.poll_interval);
        self.ui
            .display_loading(&LoadingProgress::indeterminate("Connecting to host..."));
        self.ui.pump_messages();
    }

    fn reconnect_to_host(&mut self, stale: Option<PeerId>) {
        let (Some(transport), Some(addr)) = (self.transport.as_deref_mut(), self.host_addr) else {
            return;
        };
        if let Some(stale) = stale {
            transport.reset_peer(stale);
            self.peers.clear(PlayerId::HOST);
        }
        debug!("Retrying connection to host at {}", addr);
        match transport.connect(addr, NO_CLAIMED_PLAYER) {
            Ok(peer) => {
                if let Err(e) = self.peers.assign(PlayerId::HOST, peer) {
                    warn!("Could not track host connection: {}", e);
                }
            },
            Err(e) => warn!("Failed to retry connection to host: {}", e),
        }
    }

    fn update_resetting(&mut self) {
        let elapsed = Instant::now() - self.phase_started;
        match self.role {
            Some(Role::Host) => {
                if self.epoch.ack_count() == self.num_players {
                    info!("All {} players synchronized, resuming", self.num_players);
                    self.send_to_all(&ControlMessage::ResumeSession);
                    self.create_engine();
                    self.set_state(SessionState::Running);
                    return;
                }
                if elapsed >= self.config.connect_timeout {
                    info!("Reset timeout, dropping any players who aren't connected");
                    let stranded: Vec<PlayerId> = self
                        .peers
                        .connected_peers()
                        .map(|(player, _)| player)
                        .filter(|&player| !self.epoch.is_acked(player))
                        .collect();
                    self.drop_players(&stranded, DropReason::ConnectTimeout);
                }
            },
            Some(Role::Client) => {
                if self.epoch.ack_count() != self.num_players {
                    let connected: Vec<PlayerId> = self
                        .peers
                        .connected_peers()
                        .filter(|&(_, peer)| self.peer_state(Some(peer)) == PeerState::Connected)
                        .map(|(player, _)| player)
                        .collect();
                    for player in connected {
                        self.epoch.mark(player);
                    }
                    if self.epoch.ack_count() == self.num_players {
                        info!(
                            "Connected to {} players, waiting for host...",
                            self.num_players
                        );
                        let cookie = self.epoch.cookie();
                        self.send_to_player(PlayerId::HOST, &ControlMessage::ResetComplete { cookie });
                    }
                }
                if elapsed >= self.config.resync_timeout() {
                    self.close_with_error("Failed to connect within timeout");
                    return;
                }
            },
            None => {},
        }

        self.poll_transport(self.config.poll_interval);
        self.ui.display_loading(&LoadingProgress {
            message: "Netplay synchronizing",
            value: u32::try_from(self.epoch.ack_count()).unwrap_or(u32::MAX),
            max: u32::try_from(self.num_players).unwrap_or(u32::MAX),
        });
        self.ui.pump_messages();
    }

    fn run_frame(&mut self) {
        self.poll_transport(Duration::ZERO);
        if self.state != SessionState::Running {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let mut handler: FrameHandler<'_, T::Input, T::Driver> =
            FrameHandler::new(&mut self.driver, &mut self.save_pool);
        if let Err(e) = engine.idle(&mut handler) {
            fatal(
                &self.violation_observer,
                ViolationKind::StateManagement,
                &format!("rollback failed: {e}"),
            );
        }

        let input = handler.driver().read_local_input();
        let synchronized = engine
            .add_local_input(input)
            .and_then(|()| engine.synchronize_input());
        match synchronized {
            Ok((inputs, _disconnect_flags)) => {
                // Rollbacks mute audio; a real frame brings it back.
                let driver = handler.driver();
                driver.set_audio_muted(false);
                driver.set_inputs(&inputs);
                if let Err(e) = driver.run_frame() {
                    fatal(
                        &self.violation_observer,
                        ViolationKind::StateManagement,
                        &format!("simulation failed to run a frame: {e}"),
                    );
                }
                if let Err(e) = engine.advance_frame(&mut handler) {
                    fatal(
                        &self.violation_observer,
                        ViolationKind::StateManagement,
                        &format!("failed to commit frame: {e}"),
                    );
                }
                handler.driver().present_frame();
            },
            Err(NetplayError::PredictionThreshold | NetplayError::NotSynchronized) => {},
            Err(e) => report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "frame {} skipped: {}",
                engine.current_frame(),
                e
            ),
        }

        if let Some(transport) = self.transport.as_deref_mut() {
            engine.flush(transport);
        }
        let events: Vec<RollbackEvent> = engine.events().collect();
        for event in events {
            self.handle_engine_event(event);
        }
    }

    /// Waits for the next frame, polling the transport in short slices.
    ///
    /// The pacer is moved out for the wait, so the wait ends as soon as the rollback session
    /// it schedules for is replaced; the new session restarts the schedule.
    fn throttle(&mut self) {
        let current = self.current_frame();
        let cookie = self.epoch.cookie();
        let idle = FramePacer::new(
            self.config.tick_rate_hz,
            self.config.throttle_slice,
            Instant::now(),
        );
        let mut pacer = std::mem::replace(&mut self.pacer, idle);
        pacer.throttle(current, |slice| {
            self.poll_transport(slice);
            self.state == SessionState::Running && self.epoch.cookie() == cookie
        });
        if self.epoch.cookie() != cookie {
            pacer.reset(Instant::now());
        }
        self.pacer = pacer;
    }

    fn handle_engine_event(&mut self, event: RollbackEvent) {
        match event {
            RollbackEvent::ConnectedToPeer { player } => {
                info!("Rollback connected to player handle {}", player);
            },
            RollbackEvent::SynchronizingWithPeer {
                player,
                count,
                total,
            } => info!("Synchronizing with player handle {}: {}/{}", player, count, total),
            RollbackEvent::SynchronizedWithPeer { player } => {
                info!("Synchronized with player handle {}", player);
            },
            RollbackEvent::Running => info!("Rollback session running"),
            RollbackEvent::ConnectionInterrupted {
                player,
                disconnect_timeout,
            } => warn!(
                "Player handle {} silent for {:?}",
                player, disconnect_timeout
            ),
            RollbackEvent::ConnectionResumed { player } => {
                info!("Player handle {} is back", player);
            },
            RollbackEvent::DisconnectedFromPeer { player } => {
                info!("Rollback disconnected from player handle {}", player);
            },
            RollbackEvent::TimeSync {
                frames_ahead,
                period_frames,
            } => {
                let current = self.current_frame();
                self.pacer
                    .handle_time_sync(frames_ahead, period_frames, current);
            },
            RollbackEvent::DesyncDetected {
                frame,
                local_checksum,
                remote_checksum,
                player,
            } => {
                let current = self.current_frame();
                report_violation_to!(
                    &self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Desync,
                    "frame {} differs from player handle {}: {:08x} vs {:08x}",
                    frame,
                    player,
                    local_checksum,
                    remote_checksum
                );
                self.ui.on_message(&format!(
                    "Desync Detected: Current Frame: {}, Desync Frame: {}, Diff: {}, L:{}, R:{}",
                    current,
                    frame,
                    current - frame,
                    local_checksum,
                    remote_checksum
                ));
            },
        }
    }

    /// Handles transport events until `timeout` passed without one, or the session stops
    /// being active.
    fn poll_transport(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.state.is_active() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(transport) = self.transport.as_deref_mut() else {
                return;
            };
            let Some(event) = transport.poll(remaining) else {
                return;
            };
            self.handle_transport_event(event);
            // Packets often call for an immediate answer.
            self.flush_engine();
        }
    }

    fn flush_engine(&mut self) {
        if let (Some(engine), Some(transport)) = (self.engine.as_mut(), self.transport.as_deref_mut()) {
            engine.flush(transport);
        }
    }

    /// Creates the rollback engine for the current players, in slot order.
    fn create_engine(&mut self) {
        let Some(local) = self.peers.local_player() else {
            fatal(
                &self.violation_observer,
                ViolationKind::InternalError,
                "cannot start a rollback session before our player id is known",
            );
        };
        let players: Vec<PlayerId> = self.peers.occupied().collect();
        if players.len() != self.num_players {
            warn!(
                "Starting rollback with {} connected players, expected {}",
                players.len(),
                self.num_players
            );
        }

        let mut local_handle = PlayerHandle::new(0);
        let mut remotes = Vec::with_capacity(players.len());
        for (index, &player) in players.iter().enumerate() {
            let handle = PlayerHandle::new(index);
            if player == local {
                local_handle = handle;
            } else if let Some(peer) = self.peers.peer_for_player(player) {
                remotes.push((handle, peer));
            }
            if let Err(e) = self.peers.set_rollback_handle(player, Some(handle)) {
                warn!("Could not record rollback handle of player {}: {}", player, e);
            }
        }

        let mut engine = match RollbackEngine::new(
            players.len(),
            local_handle,
            &remotes,
            self.epoch.cookie(),
            &self.config,
        ) {
            Ok(engine) => engine,
            Err(e) => fatal(
                &self.violation_observer,
                ViolationKind::InternalError,
                &format!("failed to create rollback session: {e}"),
            ),
        };
        engine.set_violation_observer(self.violation_observer.clone());
        if let Some(transport) = self.transport.as_deref_mut() {
            engine.flush(transport);
        }
        debug!(
            "Rollback session for epoch {} with {} players, local handle {}",
            self.epoch.cookie(),
            players.len(),
            local_handle
        );
        self.engine = Some(engine);
        self.pacer.reset(Instant::now());
    }

    /// Throws the rollback engine away, returning every saved buffer to the pool first.
    fn destroy_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            debug!("Destroying rollback session for epoch {}", engine.epoch());
            let mut handler: FrameHandler<'_, T::Input, T::Driver> =
                FrameHandler::new(&mut self.driver, &mut self.save_pool);
            engine.release_saved_states(&mut handler);
        }
        self.save_pool.clear();
        self.peers.clear_rollback_handles();
    }

    fn begin_closing(&mut self) {
        self.destroy_engine();
        let is_host = self.role == Some(Role::Host);
        if let Some(transport) = self.transport.as_deref_mut() {
            for (_, peer) in self.peers.connected_peers() {
                if is_host {
                    transport.disconnect_later(peer);
                } else {
                    transport.disconnect(peer);
                }
            }
        }
        self.set_state(SessionState::ClosingSession);
        self.phase_started = Instant::now();
    }

    /// Shows `message` to the user and starts closing.
    fn close_with_error(&mut self, message: &str) {
        if !self.state.is_active() {
            return;
        }
        warn!("Closing netplay session: {}", message);
        self.ui.report_error(ERROR_TITLE, message);
        self.begin_closing();
    }

    /// Waits for peers to go away, discarding everything they still send.
    fn update_closing(&mut self) {
        if Instant::now() - self.phase_started < self.config.close_timeout {
            let deadline = Instant::now() + self.config.poll_interval;
            while self.peers.connected_peers().next().is_some() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let Some(transport) = self.transport.as_deref_mut() else {
                    break;
                };
                match transport.poll(remaining) {
                    Some(TransportEvent::Disconnected { peer }) => {
                        if let Some(player) = self.peers.player_for_peer(peer) {
                            self.peers.clear(player);
                        }
                    },
                    Some(TransportEvent::Connected { peer, .. }) => transport.disconnect_now(peer),
                    Some(TransportEvent::Received { .. }) => {},
                    None => break,
                }
            }
            if self.peers.connected_peers().next().is_some() {
                self.ui
                    .display_loading(&LoadingProgress::indeterminate("Closing session"));
                self.ui.pump_messages();
                return;
            }
        }
        self.close();
    }

    fn close(&mut self) {
        let was_host = self.role == Some(Role::Host);
        self.destroy_engine();
        self.peers.clear_all();
        self.transport = None;
        self.host_addr = None;
        self.num_players = 0;
        self.role = None;
        self.driver.apply_settings(None);
        self.set_state(SessionState::Inactive);
        if !was_host {
            self.driver.shutdown();
        }
        info!("Netplay session closed");
    }

    fn peer_state(&self, peer: Option<PeerId>) -> PeerState {
        match (peer, self.transport.as_deref()) {
            (Some(peer), Some(transport)) => transport.peer_state(peer),
            _ => PeerState::Disconnected,
        }
    }

    fn send_to_peer(&mut self, peer: PeerId, message: &ControlMessage) -> bool {
        match self.transport.as_deref_mut() {
            Some(transport) => send_control(transport, &self.violation_observer, peer, message),
            None => false,
        }
    }

    fn send_to_player(&mut self, player: PlayerId, message: &ControlMessage) -> bool {
        match self.peers.peer_for_player(player) {
            Some(peer) => self.send_to_peer(peer, message),
            None => false,
        }
    }

    fn send_to_all(&mut self, message: &ControlMessage) {
        let peers: Vec<PeerId> = self.peers.connected_peers().map(|(_, peer)| peer).collect();
        for peer in peers {
            self.send_to_peer(peer, message);
        }
    }
}

impl<T: Config> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("peers", &self.peers)
            .field("num_players", &self.num_players)
            .field("epoch", &self.epoch)
            .field("current_frame", &self.current_frame())
            .finish_non_exhaustive()
    }
}

/// Reports a broken invariant and aborts. These are contract violations with the simulation
/// driver or bugs, never network conditions.
#[allow(clippy::panic)]
fn fatal(observer: &Option<Arc<dyn ViolationObserver>>, kind: ViolationKind, context: &str) -> ! {
    report_violation_to!(observer, ViolationSeverity::Critical, kind, "{}", context);
    panic!("netplay: {context}");
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
    use crate::driver::PadInput;
    use crate::rollback::save_pool::SaveBuffer;
    use crate::transport::memory::MemoryNetwork;

    #[derive(Default)]
    struct Machine {
        running: bool,
        state: u64,
        frames: u32,
        inputs: Vec<PadInput>,
        overlay_applied: Option<bool>,
        shut_down: bool,
    }

    impl SimulationDriver<PadInput> for Machine {
        fn is_running(&self) -> bool {
            self.running
        }

        fn boot(&mut self, _params: &BootParams) -> Result<(), NetplayError> {
            self.running = true;
            Ok(())
        }

        fn run_frame(&mut self) -> Result<(), NetplayError> {
            for pad in &self.inputs {
                self.state = self.state.wrapping_mul(31).wrapping_add(u64::from(pad.buttons));
            }
            self.frames += 1;
            Ok(())
        }

        fn state_version(&self) -> u32 {
            1
        }

        fn save_state(&mut self) -> Result<Vec<u8>, NetplayError> {
            let mut raw = self.state.to_le_bytes().to_vec();
            raw.extend_from_slice(&self.frames.to_le_bytes());
            Ok(raw)
        }

        fn load_state(&mut self, raw: &[u8]) -> Result<(), NetplayError> {
            self.state = u64::from_le_bytes(raw[..8].try_into().unwrap());
            self.frames = u32::from_le_bytes(raw[8..12].try_into().unwrap());
            Ok(())
        }

        fn save_memory_state(&mut self, buffer: &mut SaveBuffer) -> Result<(), NetplayError> {
            let raw = self.save_state()?;
            buffer.data_mut().clear();
            buffer.data_mut().extend_from_slice(&raw);
            Ok(())
        }

        fn load_memory_state(&mut self, buffer: &SaveBuffer) -> Result<(), NetplayError> {
            self.load_state(buffer.as_slice())
        }

        fn frame_number(&self) -> u32 {
            self.frames
        }

        fn set_audio_muted(&mut self, _muted: bool) {}

        fn set_inputs(&mut self, inputs: &[PadInput]) {
            self.inputs = inputs.to_vec();
        }

        fn read_local_input(&mut self) -> PadInput {
            PadInput {
                buttons: self.frames % 7,
            }
        }

        fn apply_settings(&mut self, overlay: Option<&SettingsOverlay>) {
            self.overlay_applied = Some(overlay.is_some());
        }

        fn shutdown(&mut self) {
            self.running = false;
            self.shut_down = true;
        }
    }

    #[derive(Default)]
    struct Screen {
        messages: Vec<String>,
        errors: Vec<(String, String)>,
    }

    impl HostUi for Screen {
        fn on_message(&mut self, message: &str) {
            self.messages.push(message.to_owned());
        }

        fn report_error(&mut self, title: &str, message: &str) {
            self.errors.push((title.to_owned(), message.to_owned()));
        }

        fn display_loading(&mut self, _progress: &LoadingProgress) {}

        fn pump_messages(&mut self) {}
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = PadInput;
        type Driver = Machine;
        type Ui = Screen;
    }

    fn fast_config() -> NetplayConfig {
        NetplayConfig::default()
            .with_tick_rate(500.0)
            .with_poll_interval(Duration::from_millis(1))
            .with_connect_timeout(Duration::from_millis(100))
            .with_close_timeout(Duration::from_millis(50))
    }

    fn session(network: &MemoryNetwork, running: bool) -> Session<TestConfig> {
        Session::new(
            fast_config(),
            Box::new(network.clone()),
            Machine {
                running,
                ..Machine::default()
            },
            Screen::default(),
        )
    }

    fn host_params(port: u16) -> HostParams {
        HostParams {
            nickname: "host".to_owned(),
            port,
            max_players: 2,
            password: String::new(),
        }
    }

    #[test]
    fn hosting_runs_immediately_as_player_zero() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, true);
        host.start_host(host_params(7000)).unwrap();

        assert_eq!(host.state(), SessionState::Running);
        assert_eq!(host.role(), Some(Role::Host));
        assert_eq!(host.local_player_id(), Some(PlayerId::HOST));
        assert_eq!(host.num_players(), 1);
        assert_eq!(host.nickname(PlayerId::HOST), "host");
        assert_eq!(host.reset_cookie(), 0);
        assert_eq!(host.driver().overlay_applied, Some(true));
    }

    #[test]
    fn second_start_is_rejected() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, true);
        host.start_host(host_params(7000)).unwrap();

        assert!(matches!(
            host.start_host(host_params(7001)),
            Err(NetplayError::AlreadyActive)
        ));
        let join = JoinParams {
            nickname: "again".to_owned(),
            host_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            password: String::new(),
        };
        assert!(matches!(host.join(join), Err(NetplayError::AlreadyActive)));
        assert_eq!(host.state(), SessionState::Running);
    }

    #[test]
    fn hosting_needs_a_running_simulation_and_a_sane_player_count() {
        let network = MemoryNetwork::new();
        let mut idle = session(&network, false);
        assert!(matches!(
            idle.start_host(host_params(7000)),
            Err(NetplayError::InvalidRequest { .. })
        ));
        assert_eq!(idle.state(), SessionState::Inactive);

        let mut host = session(&network, true);
        for max_players in [0, MAX_PLAYERS + 1] {
            let params = HostParams {
                max_players,
                ..host_params(7000)
            };
            assert!(matches!(
                host.start_host(params),
                Err(NetplayError::InvalidRequest { .. })
            ));
        }
        assert_eq!(host.state(), SessionState::Inactive);
    }

    #[test]
    fn failed_bind_leaves_the_session_inactive() {
        let network = MemoryNetwork::new();
        let _squatter = network.bind(7000).unwrap();
        let mut host = session(&network, true);

        assert!(matches!(
            host.start_host(host_params(7000)),
            Err(NetplayError::Transport { .. })
        ));
        assert_eq!(host.state(), SessionState::Inactive);
        assert_eq!(host.role(), None);
        assert_eq!(host.driver().overlay_applied, Some(false));
        assert!(!host.driver().shut_down);
    }

    #[test]
    fn chat_needs_a_session_and_skips_empty_lines() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, true);
        assert!(matches!(
            host.send_chat("hello"),
            Err(NetplayError::InvalidRequest { .. })
        ));

        host.start_host(host_params(7000)).unwrap();
        host.send_chat("").unwrap();
        assert!(host.ui().messages.is_empty());
        host.send_chat("hello").unwrap();
        assert_eq!(host.ui().messages, vec!["host: hello".to_owned()]);
    }

    #[test]
    fn a_lone_host_simulates_frames() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, true);
        host.start_host(host_params(7000)).unwrap();

        for _ in 0..20 {
            assert_eq!(host.update(), SessionState::Running);
        }
        assert!(host.current_frame() >= Frame::new(20));
        assert_eq!(host.driver().frames, 20);
        assert_eq!(host.driver().inputs.len(), 1);
        assert!(host.ping(PlayerId::HOST).is_none());
        assert!(host.network_stats(PlayerId::new(1)).is_err());
    }

    #[test]
    fn running_frames_are_paced_to_the_tick_rate() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, true);
        host.start_host(host_params(7000)).unwrap();
        let period = host.pacer.period();

        let started = Instant::now();
        for _ in 0..40 {
            host.update();
        }
        assert!(started.elapsed() >= period * 39);
        // The schedule survives the wait: one period per frame.
        assert!(host.pacer.next_frame_time() >= started + period * 39);
        assert!((host.pacer.target_speed() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn host_close_returns_to_inactive_and_keeps_the_simulation() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, true);
        host.start_host(host_params(7000)).unwrap();

        host.request_close(CloseReason::HostShutdown);
        assert_eq!(host.state(), SessionState::ClosingSession);
        host.execute();

        assert_eq!(host.state(), SessionState::Inactive);
        assert_eq!(host.role(), None);
        assert_eq!(host.current_frame(), Frame::NULL);
        assert!(host.local_addr().is_none());
        assert!(host.driver().running);
        assert_eq!(host.driver().overlay_applied, Some(false));
        // The port is free again.
        host.start_host(host_params(7000)).unwrap();
    }

    #[test]
    fn joining_an_absent_host_times_out() {
        let network = MemoryNetwork::new();
        let mut client = session(&network, false);
        client
            .join(JoinParams {
                nickname: "lonely".to_owned(),
                host_addr: SocketAddr::from(([127, 0, 0, 1], 7999)),
                password: String::new(),
            })
            .unwrap();
        assert_eq!(client.state(), SessionState::Connecting);
        assert!(client.driver().running);

        client.execute();

        assert_eq!(client.state(), SessionState::Inactive);
        assert_eq!(
            client.ui().errors,
            vec![(
                ERROR_TITLE.to_owned(),
                "Timed out connecting to server.".to_owned()
            )]
        );
        assert!(client.driver().shut_down);
    }

    #[test]
    fn system_destroyed_closes_synchronously() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, true);
        host.start_host(host_params(7000)).unwrap();
        host.system_destroyed();
        assert_eq!(host.state(), SessionState::Inactive);
    }
}
