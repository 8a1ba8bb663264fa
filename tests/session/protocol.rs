//! Hand-crafted control traffic against a live host.

use std::sync::Arc;

use crate::common::{host_addr, Cluster, TestSession};
use rollback_netplay::control::wire::{decode, encode};
use rollback_netplay::control::{ConnectMode, ConnectRequest, ConnectResult, ControlMessage};
use rollback_netplay::telemetry::{CollectingObserver, ViolationKind};
use rollback_netplay::transport::NO_CLAIMED_PLAYER;
use rollback_netplay::{
    Channel, MemoryTransport, PeerId, PeerState, PlayerId, Reliability, SessionState, Transport,
    TransportEvent,
};
use serial_test::serial;
use web_time::Duration;

/// A scripted peer speaking the control protocol by hand.
struct FakeClient {
    transport: MemoryTransport,
    host: PeerId,
}

impl FakeClient {
    fn connect(cluster: &Cluster, port: u16) -> Self {
        let mut transport = cluster.network.bind(port).unwrap();
        let host = transport.connect(host_addr(), NO_CLAIMED_PLAYER).unwrap();
        Self { transport, host }
    }

    fn send(&mut self, message: &ControlMessage) {
        self.send_raw(&encode(message).unwrap());
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.transport
            .send(self.host, Channel::Control, bytes, Reliability::Reliable)
            .unwrap();
    }

    /// Steps the host a few times and returns the control messages it sent us.
    fn exchange(&mut self, host: &mut TestSession) -> Vec<ControlMessage> {
        for _ in 0..5 {
            host.update();
        }
        let mut received = Vec::new();
        while let Some(event) = self.transport.poll(Duration::ZERO) {
            if let TransportEvent::Received {
                channel: Channel::Control,
                payload,
                ..
            } = event
            {
                received.push(decode(&payload).unwrap());
            }
        }
        received
    }

    fn join(&mut self, host: &mut TestSession) -> u32 {
        self.send(&ControlMessage::ConnectRequest(ConnectRequest {
            mode: ConnectMode::Player,
            requested_player_id: None,
            nickname: "fake".to_owned(),
            password: String::new(),
        }));
        let received = self.exchange(host);
        assert!(matches!(
            received.first(),
            Some(ControlMessage::ConnectResponse(r))
                if r.result == ConnectResult::Success && r.player_id == Some(PlayerId::new(1))
        ));
        received
            .iter()
            .find_map(|m| match m {
                ControlMessage::Reset(reset) => Some(reset.cookie),
                _ => None,
            })
            .expect("host sent a reset")
    }
}

fn observed_host(max_players: usize) -> (Cluster, Arc<CollectingObserver>) {
    let mut cluster = Cluster::host(max_players);
    let observer = Arc::new(CollectingObserver::new());
    cluster
        .session_mut(0)
        .set_violation_observer(Some(observer.clone()));
    (cluster, observer)
}

#[test]
#[serial]
fn stale_reset_acknowledgments_are_ignored() {
    let (mut cluster, observer) = observed_host(2);
    let mut fake = FakeClient::connect(&cluster, 7100);
    let cookie = fake.join(cluster.session_mut(0));
    assert_eq!(cluster.session(0).state(), SessionState::Resetting);

    fake.send(&ControlMessage::ResetComplete { cookie: cookie + 41 });
    fake.exchange(cluster.session_mut(0));
    assert_eq!(cluster.session(0).state(), SessionState::Resetting);
    assert!(observer.has_violation(ViolationKind::Reset));

    fake.send(&ControlMessage::ResetComplete { cookie });
    let received = fake.exchange(cluster.session_mut(0));
    assert!(received.contains(&ControlMessage::ResumeSession));
    assert_eq!(cluster.session(0).state(), SessionState::Running);
    assert_eq!(cluster.session(0).num_players(), 2);
}

#[test]
#[serial]
fn truncated_packets_change_nothing() {
    let (mut cluster, observer) = observed_host(2);
    let mut fake = FakeClient::connect(&cluster, 7100);
    let cookie = fake.join(cluster.session_mut(0));
    fake.send(&ControlMessage::ResetComplete { cookie });
    fake.exchange(cluster.session_mut(0));
    assert_eq!(cluster.session(0).state(), SessionState::Running);
    observer.clear();

    // A chat message declaring 40 bytes of which only 20 arrive.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&10u32.to_le_bytes());
    bytes.extend_from_slice(&40u32.to_le_bytes());
    bytes.extend_from_slice(b"hello world!");
    assert_eq!(bytes.len(), 20);
    fake.send_raw(&bytes);
    fake.exchange(cluster.session_mut(0));

    let host = cluster.session(0);
    assert!(observer.has_violation(ViolationKind::ControlProtocol));
    assert!(host.ui().messages.iter().all(|m| !m.contains("hello")));
    assert_eq!(host.state(), SessionState::Running);
    assert_eq!(host.num_players(), 2);
    assert_eq!(host.reset_cookie(), cookie);
}

#[test]
#[serial]
fn strangers_must_introduce_themselves_first() {
    let (mut cluster, observer) = observed_host(2);
    let mut fake = FakeClient::connect(&cluster, 7100);
    fake.send(&ControlMessage::Chat {
        text: "let me in".to_owned(),
    });
    fake.exchange(cluster.session_mut(0));

    let host = cluster.session(0);
    assert!(observer.has_violation(ViolationKind::ControlProtocol));
    assert_eq!(host.num_players(), 1);
    assert!(host.ui().messages.is_empty());
    assert_eq!(host.reset_cookie(), 0);
}

#[test]
#[serial]
fn taken_and_spectator_requests_are_refused() {
    let (mut cluster, _observer) = observed_host(3);
    let mut fake = FakeClient::connect(&cluster, 7100);
    fake.send(&ControlMessage::ConnectRequest(ConnectRequest {
        mode: ConnectMode::Player,
        requested_player_id: Some(PlayerId::HOST),
        nickname: "usurper".to_owned(),
        password: String::new(),
    }));
    let received = fake.exchange(cluster.session_mut(0));
    assert!(matches!(
        received.first(),
        Some(ControlMessage::ConnectResponse(r)) if r.result == ConnectResult::PlayerIdInUse
    ));

    let mut watcher = FakeClient::connect(&cluster, 7101);
    watcher.send(&ControlMessage::ConnectRequest(ConnectRequest {
        mode: ConnectMode::Spectator,
        requested_player_id: None,
        nickname: "watcher".to_owned(),
        password: String::new(),
    }));
    let received = watcher.exchange(cluster.session_mut(0));
    assert!(matches!(
        received.first(),
        Some(ControlMessage::ConnectResponse(r)) if r.result == ConnectResult::SessionClosed
    ));
    assert_eq!(cluster.session(0).num_players(), 1);
    assert_eq!(cluster.session(0).state(), SessionState::Running);
}

#[test]
#[serial]
fn silent_players_are_dropped_after_the_reset_timeout() {
    let (mut cluster, _observer) = observed_host(2);
    let mut fake = FakeClient::connect(&cluster, 7100);
    let cookie = fake.join(cluster.session_mut(0));

    cluster.step_until("the host to give up on the fake", |c| {
        c.session(0).state() == SessionState::Running
    });
    let host = cluster.session(0);
    assert_eq!(host.num_players(), 1);
    assert!(host.reset_cookie() > cookie);
    assert!(host.ui().saw_message("fake left the session: Connection timeout"));

    assert_eq!(fake.transport.peer_state(fake.host), PeerState::Disconnected);
}
