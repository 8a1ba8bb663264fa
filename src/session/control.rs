//! Transport event dispatch and the control protocol handlers.

use std::net::{Ipv4Addr, SocketAddr};

use tracing::{debug, info, trace, warn};
use web_time::Instant;

use super::{fatal, Role, Session, SessionState};
use crate::control::{
    receive_control, ConnectMode, ConnectRequest, ConnectResponse, ConnectResult, ControlMessage,
    DropReason, ResetMessage, ResetRequestReason,
};
use crate::driver::{HostUi, SimulationDriver};
use crate::reset::{plan_reconciliation, ReconcileAction, Roster, RosterEntry};
use crate::snapshot::Snapshot;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::transport::{Channel, PeerId, PeerState, TransportEvent};
use crate::{report_violation_to, Config, PlayerId};

const SESSION_ENDED_TITLE: &str = "Netplay Session Ended";

impl<T: Config> Session<T> {
    pub(super) fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, data } => self.handle_peer_connected(peer, data),
            TransportEvent::Disconnected { peer } => self.handle_peer_disconnected(peer),
            TransportEvent::Received {
                peer,
                channel,
                payload,
            } => self.handle_packet(peer, channel, &payload),
        }
    }

    fn handle_peer_connected(&mut self, peer: PeerId, data: u32) {
        if self.role == Some(Role::Host) {
            // Joiners identify themselves with a connect request.
            debug!("{} connected, waiting for its connect request", peer);
            return;
        }

        if let Some(player) = self.peers.player_for_peer(peer) {
            if player == PlayerId::HOST && self.state == SessionState::Connecting {
                info!("Connected to host, requesting to join");
                let request = ControlMessage::ConnectRequest(ConnectRequest {
                    mode: ConnectMode::Player,
                    requested_player_id: self.peers.local_player(),
                    nickname: self.peers.local_nickname().to_owned(),
                    password: self.password.clone(),
                });
                self.send_to_peer(peer, &request);
            } else {
                info!("Connection to player {} complete", player);
            }
            return;
        }

        // A lower-numbered player reaching us after a reset. It claims its id in the connect
        // data.
        let claimed = i32::try_from(data).ok().and_then(PlayerId::from_wire);
        let Some(player) = claimed.filter(|&id| {
            id.is_valid() && id != PlayerId::HOST && Some(id) != self.peers.local_player()
        }) else {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::ControlProtocol,
                "{} connected claiming invalid player id {}",
                peer,
                data
            );
            self.disconnect_peer_now(peer);
            return;
        };

        if let Some(existing) = self.peers.peer_for_player(player) {
            if self.peer_state(Some(existing)) == PeerState::Connected {
                warn!(
                    "{} claims player {}, which is already connected as {}",
                    peer, player, existing
                );
                self.disconnect_peer_now(peer);
                return;
            }
            debug!("Replacing stale connection {} of player {}", existing, player);
            if let Some(transport) = self.transport.as_deref_mut() {
                transport.reset_peer(existing);
            }
            self.peers.clear(player);
        }

        match self.peers.assign(player, peer) {
            Ok(()) => info!("Player {} connected to us as {}", player, peer),
            Err(e) => {
                warn!("Rejecting connection {}: {}", peer, e);
                self.disconnect_peer_now(peer);
            },
        }
    }

    fn handle_peer_disconnected(&mut self, peer: PeerId) {
        let Some(player) = self.peers.player_for_peer(peer) else {
            trace!("Ignoring disconnect of unknown {}", peer);
            return;
        };

        match self.state {
            SessionState::Connecting => {
                if player == PlayerId::HOST {
                    self.close_with_error("Failed to connect to host");
                } else {
                    self.peers.clear(player);
                }
            },
            // The reset timeout takes care of anyone lost now.
            SessionState::Resetting => {
                debug!("Player {} disconnected during reset", player);
            },
            _ => {
                if self.role == Some(Role::Host) {
                    self.drop_players(&[player], DropReason::DisconnectedFromHost);
                } else if player == PlayerId::HOST {
                    self.close_with_error("Lost connection to host");
                } else {
                    info!("Lost connection to player {}, asking host to reset", player);
                    self.send_to_player(
                        PlayerId::HOST,
                        &ControlMessage::ResetRequest {
                            reason: ResetRequestReason::ConnectionLost,
                            causing_player_id: Some(player),
                        },
                    );
                }
            },
        }
    }

    fn handle_packet(&mut self, peer: PeerId, channel: Channel, payload: &[u8]) {
        let Some(player) = self.peers.player_for_peer(peer) else {
            self.handle_unknown_peer_packet(peer, channel, payload);
            return;
        };

        match channel {
            Channel::Control => {
                if let Some(message) = receive_control(&self.violation_observer, peer, payload) {
                    self.handle_control(player, peer, message);
                }
            },
            Channel::Rollback => match self.engine.as_mut() {
                Some(engine) => engine.handle_packet(peer, payload),
                None => trace!("Dropping rollback packet from player {} between sessions", player),
            },
        }
    }

    fn handle_unknown_peer_packet(&mut self, peer: PeerId, channel: Channel, payload: &[u8]) {
        if self.role != Some(Role::Host) || channel != Channel::Control {
            trace!("Dropping {:?} packet from unknown {}", channel, peer);
            if channel == Channel::Control {
                self.reset_peer(peer);
            }
            return;
        }

        match receive_control(&self.violation_observer, peer, payload) {
            Some(ControlMessage::ConnectRequest(request)) => {
                self.handle_connect_request(peer, &request);
            },
            Some(other) => {
                report_violation_to!(
                    &self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::ControlProtocol,
                    "unknown {} sent {:?} before a connect request",
                    peer,
                    other.message_type()
                );
                self.reset_peer(peer);
            },
            None => self.reset_peer(peer),
        }
    }

    fn handle_control(&mut self, player: PlayerId, peer: PeerId, message: ControlMessage) {
        trace!("Control {:?} from player {}", message.message_type(), player);
        let is_host = self.role == Some(Role::Host);
        let from_host = player == PlayerId::HOST;

        match message {
            ControlMessage::ConnectResponse(response)
                if !is_host && from_host && self.state == SessionState::Connecting =>
            {
                self.handle_connect_response(response);
            },
            ControlMessage::Reset(reset) if !is_host && from_host => self.handle_reset(reset),
            ControlMessage::ResetComplete { cookie }
                if is_host && self.state == SessionState::Resetting =>
            {
                self.handle_reset_complete(player, cookie);
            },
            ControlMessage::ResumeSession
                if !is_host && from_host && self.state == SessionState::Resetting =>
            {
                info!("All players synchronized, resuming");
                self.create_engine();
                self.set_state(SessionState::Running);
            },
            ControlMessage::PlayerJoined { player_id } if !is_host && from_host => {
                if Some(player_id) != self.peers.local_player() {
                    self.show_player_joined(player_id);
                }
            },
            ControlMessage::DropPlayer { reason, player_id } if !is_host && from_host => {
                if !player_id.is_valid()
                    || player_id == PlayerId::HOST
                    || Some(player_id) == self.peers.local_player()
                {
                    report_violation_to!(
                        &self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::ControlProtocol,
                        "host asked to drop player {}",
                        player_id
                    );
                    return;
                }
                if matches!(self.state, SessionState::Running | SessionState::Resetting) {
                    self.drop_players(&[player_id], reason);
                }
            },
            ControlMessage::ResetRequest {
                reason,
                causing_player_id,
            } if is_host && !from_host => {
                info!(
                    "Player {} requested a reset ({}, caused by {:?})",
                    player, reason, causing_player_id
                );
                if matches!(self.state, SessionState::Running | SessionState::Resetting) {
                    self.reset();
                }
            },
            ControlMessage::CloseSession { reason } if !is_host && from_host => {
                self.ui
                    .report_error(SESSION_ENDED_TITLE, &reason.to_string());
                self.request_close(reason);
            },
            ControlMessage::Chat { text } => {
                if !text.is_empty() {
                    self.show_chat(player, &text);
                }
            },
            other => report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::ControlProtocol,
                "unexpected {:?} from player {} ({}) while {}",
                other.message_type(),
                player,
                peer,
                self.state
            ),
        }
    }

    fn handle_connect_request(&mut self, peer: PeerId, request: &ConnectRequest) {
        let assigned = match (request.mode, request.requested_player_id) {
            (ConnectMode::Spectator, _) => Err(ConnectResult::SessionClosed),
            (ConnectMode::Player, Some(id)) if self.peers.is_valid_player(id) => {
                Err(ConnectResult::PlayerIdInUse)
            },
            (ConnectMode::Player, Some(id)) if id.as_usize() >= self.max_players => {
                Err(ConnectResult::ServerFull)
            },
            (ConnectMode::Player, Some(id)) => Ok(id),
            (ConnectMode::Player, None) => self
                .peers
                .free_player_id()
                .filter(|id| id.as_usize() < self.max_players)
                .ok_or(ConnectResult::ServerFull),
        };

        let player = match assigned {
            Ok(player) => player,
            Err(result) => {
                info!("Rejecting connect request from {}: {}", peer, result);
                self.send_to_peer(
                    peer,
                    &ControlMessage::ConnectResponse(ConnectResponse {
                        result,
                        player_id: None,
                    }),
                );
                if let Some(transport) = self.transport.as_deref_mut() {
                    transport.disconnect_later(peer);
                }
                return;
            },
        };

        if let Err(e) = self.peers.assign(player, peer) {
            warn!("Cannot seat {} as player {}: {}", peer, player, e);
            self.reset_peer(peer);
            return;
        }
        if let Err(e) = self.peers.set_nickname(player, &request.nickname) {
            warn!("Cannot name player {}: {}", player, e);
        }
        self.send_to_peer(
            peer,
            &ControlMessage::ConnectResponse(ConnectResponse {
                result: ConnectResult::Success,
                player_id: Some(player),
            }),
        );
        self.num_players += 1;
        // The reset carries the new nickname, so everyone knows it by the time the notice lands.
        self.reset();
        self.notify_player_joined(player);
    }

    fn notify_player_joined(&mut self, player: PlayerId) {
        self.show_player_joined(player);
        self.send_to_all(&ControlMessage::PlayerJoined { player_id: player });
    }

    /// The nickname is known here: the notice follows the reset that carried it.
    fn show_player_joined(&mut self, player: PlayerId) {
        let message = format!(
            "{} is joining the session as player {}.",
            self.peers.nickname(player),
            player
        );
        info!("{}", message);
        self.ui.on_message(&message);
    }

    fn handle_connect_response(&mut self, response: ConnectResponse) {
        if response.result != ConnectResult::Success {
            self.close_with_error(&format!(
                "Connection rejected by server with error code {}",
                response.result.code()
            ));
            return;
        }
        let Some(player) = response
            .player_id
            .filter(|&id| id.is_valid() && id != PlayerId::HOST)
        else {
            self.close_with_error("Host assigned an invalid player id");
            return;
        };

        // Someone may have connected to us under our new id already.
        if let Some(peer) = self.peers.peer_for_player(player) {
            self.disconnect_peer_now(peer);
            self.peers.clear(player);
        }
        if let Err(e) = self.peers.set_local_player(player) {
            self.close_with_error(&format!("Could not take player slot {player}: {e}"));
            return;
        }

        info!("Joined the session as player {}, waiting for state", player);
        self.epoch.clear_acks();
        self.set_state(SessionState::Resetting);
        self.phase_started = Instant::now();
    }

    /// Host: snapshots the simulation and restarts everyone from it.
    pub(super) fn reset(&mut self) {
        let raw = match self.driver.save_state() {
            Ok(raw) => raw,
            Err(e) => fatal(
                &self.violation_observer,
                ViolationKind::StateManagement,
                &format!("failed to save state for reset: {e}"),
            ),
        };
        let state = Snapshot::encode(self.driver.state_version(), &raw);
        let cookie = self.epoch.begin_next(PlayerId::HOST);

        let roster = self.build_roster();
        self.num_players = roster.num_players();
        info!(
            "Resetting session (cookie {}, {} players, {} byte snapshot)",
            cookie,
            self.num_players,
            state.len()
        );

        self.destroy_engine();
        self.send_to_all(&ControlMessage::Reset(ResetMessage {
            cookie,
            roster,
            state,
        }));

        // Reloading our own snapshot puts us on exactly the state the clients load.
        if let Err(e) = self.driver.load_state(&raw) {
            fatal(
                &self.violation_observer,
                ViolationKind::StateManagement,
                &format!("failed to reload own state: {e}"),
            );
        }

        self.set_state(SessionState::Resetting);
        self.phase_started = Instant::now();
    }

    fn build_roster(&self) -> Roster {
        let unknown = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let mut roster = Roster::new();
        for player in self.peers.occupied() {
            let address = if Some(player) == self.peers.local_player() {
                self.local_addr()
            } else {
                let address = self
                    .peers
                    .peer_for_player(player)
                    .and_then(|peer| self.transport.as_deref()?.peer_addr(peer));
                if address.is_none() {
                    report_violation_to!(
                        &self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Reset,
                        "no address known for player {}; other players cannot reach it",
                        player
                    );
                }
                address
            };
            roster.insert(
                player,
                RosterEntry {
                    controller_port: u16::try_from(player.as_usize()).unwrap_or(u16::MAX),
                    address: address.unwrap_or(unknown),
                    nickname: self.peers.nickname(player).to_owned(),
                },
            );
        }
        roster
    }

    fn handle_reset(&mut self, reset: ResetMessage) {
        let Some(local) = self.peers.local_player() else {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Reset,
                "reset {} arrived before the host assigned us an id",
                reset.cookie
            );
            return;
        };
        if !matches!(self.state, SessionState::Running | SessionState::Resetting) {
            return;
        }

        self.destroy_engine();
        if !reset.roster.contains(local) {
            self.close_with_error("The host no longer lists us in the session");
            return;
        }
        self.num_players = reset.roster.num_players();
        info!(
            "Reset {} from host with {} players",
            reset.cookie, self.num_players
        );

        let actions = {
            let transport = self.transport.as_deref();
            plan_reconciliation(&self.peers, &reset.roster, local, PlayerId::HOST, |peer| {
                transport.and_then(|t| t.peer_addr(peer))
            })
        };
        for action in actions {
            self.apply_reconcile_action(local, action);
        }
        for (player, entry) in reset.roster.players() {
            if player != local {
                if let Err(e) = self.peers.set_nickname(player, &entry.nickname) {
                    warn!("Cannot name player {}: {}", player, e);
                }
            }
        }

        let loaded = Snapshot::decode(&reset.state, self.driver.state_version())
            .and_then(|raw| self.driver.load_state(&raw));
        if let Err(e) = loaded {
            self.close_with_error(&format!("Failed to load host state: {e}"));
            return;
        }

        self.epoch.adopt(reset.cookie, local);
        self.set_state(SessionState::Resetting);
        self.phase_started = Instant::now();
    }

    fn apply_reconcile_action(&mut self, local: PlayerId, action: ReconcileAction) {
        match action {
            ReconcileAction::Preserve { player } => {
                trace!("Keeping connection to player {}", player);
            },
            ReconcileAction::Disconnect { player, peer } => {
                info!("Player {} left, disconnecting {}", player, peer);
                self.disconnect_peer_now(peer);
                self.peers.clear(player);
            },
            ReconcileAction::Connect {
                player,
                address,
                stale,
            } => {
                if let Some(stale) = stale {
                    self.reset_peer(stale);
                    self.peers.clear(player);
                }
                let Some(transport) = self.transport.as_deref_mut() else {
                    return;
                };
                let claim = u32::try_from(local.as_usize()).unwrap_or(u32::MAX);
                info!("Connecting to player {} at {}", player, address);
                match transport.connect(address, claim) {
                    Ok(peer) => {
                        if let Err(e) = self.peers.assign(player, peer) {
                            warn!("Cannot track connection to player {}: {}", player, e);
                        }
                    },
                    Err(e) => warn!("Failed to connect to player {}: {}", player, e),
                }
            },
            ReconcileAction::Unreachable { player, stale } => {
                if let Some(stale) = stale {
                    self.reset_peer(stale);
                    self.peers.clear(player);
                }
                report_violation_to!(
                    &self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Reset,
                    "the host listed no address for player {}, not connecting",
                    player
                );
            },
            ReconcileAction::Await { player, stale } => {
                if let Some(stale) = stale {
                    self.reset_peer(stale);
                    self.peers.clear(player);
                }
                debug!("Waiting for player {} to connect", player);
            },
        }
    }

    fn handle_reset_complete(&mut self, player: PlayerId, cookie: u32) {
        match self.epoch.acknowledge(player, cookie) {
            Ok(()) => info!(
                "Player {} finished reset {} ({}/{})",
                player,
                cookie,
                self.epoch.ack_count(),
                self.num_players
            ),
            Err(rejection) => report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Reset,
                "ignoring reset acknowledgment from player {}: {}",
                player,
                rejection
            ),
        }
    }

    /// Removes players from the session. The host tells everyone and resets once; a client
    /// waits for that reset.
    pub(super) fn drop_players(&mut self, players: &[PlayerId], reason: DropReason) {
        let is_host = self.role == Some(Role::Host);
        let mut dropped = false;
        for &player in players {
            let Some(peer) = self.peers.peer_for_player(player) else {
                continue;
            };
            let message = format!(
                "{} left the session: {}",
                self.peers.nickname(player),
                reason
            );
            info!("{}", message);
            self.ui.on_message(&message);
            self.disconnect_peer_now(peer);
            self.peers.clear(player);
            self.num_players = self.num_players.saturating_sub(1);
            dropped = true;
            if is_host {
                self.send_to_all(&ControlMessage::DropPlayer {
                    reason,
                    player_id: player,
                });
            }
        }
        if !dropped {
            return;
        }

        if is_host {
            self.reset();
        } else {
            self.destroy_engine();
            self.epoch.clear_acks();
            self.set_state(SessionState::Resetting);
            self.phase_started = Instant::now();
        }
    }

    pub(super) fn show_chat(&mut self, player: PlayerId, text: &str) {
        let line = format!("{}: {}", self.peers.nickname(player), text);
        info!("Chat {}", line);
        self.ui.on_message(&line);
    }

    fn disconnect_peer_now(&mut self, peer: PeerId) {
        if let Some(transport) = self.transport.as_deref_mut() {
            transport.disconnect_now(peer);
        }
    }

    fn reset_peer(&mut self, peer: PeerId) {
        if let Some(transport) = self.transport.as_deref_mut() {
            transport.reset_peer(peer);
        }
    }
}
