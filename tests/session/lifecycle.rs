//! Hosting, joining, rejection and closing.

use crate::common::{join_params, new_session, Cluster, TestMachine};
use rollback_netplay::{MemoryNetwork, PlayerId, Role, SessionState};
use serial_test::serial;

#[test]
#[serial]
fn client_joins_resets_and_runs() {
    let mut cluster = Cluster::host(2);
    let client = cluster.join("p1");
    assert_eq!(cluster.session(client).state(), SessionState::Connecting);

    cluster.settle(2);

    let host = cluster.session(0);
    let joined = cluster.session(client);
    assert_eq!(joined.role(), Some(Role::Client));
    assert_eq!(joined.local_player_id(), Some(PlayerId::new(1)));
    assert_eq!(host.nickname(PlayerId::new(1)), "p1");
    assert_eq!(joined.nickname(PlayerId::HOST), "host");
    assert_eq!(host.reset_cookie(), 1);
    assert_eq!(joined.reset_cookie(), 1);
    assert!(host.ui().saw_message("p1 is joining the session as player 1."));
    assert_eq!(joined.driver().state_loads, 1);
    assert_eq!(joined.driver().overlay_applied, Some(true));
    assert!(joined
        .ui()
        .loading
        .iter()
        .any(|(message, _, max)| message == "Netplay synchronizing" && *max == 2));
}

#[test]
#[serial]
fn a_full_session_rejects_the_next_joiner() {
    let mut cluster = Cluster::host(2);
    cluster.join("p1");
    cluster.settle(2);

    let late = cluster.join("late");
    cluster.step_until("the late joiner to give up", |c| {
        c.session(late).state() == SessionState::Inactive
    });

    let rejected = cluster.session(late);
    assert_eq!(
        rejected.ui().errors,
        vec![(
            "Netplay Error".to_owned(),
            "Connection rejected by server with error code 2".to_owned()
        )]
    );
    assert!(rejected.driver().shut_down);
    assert_eq!(cluster.session(0).num_players(), 2);
    assert_eq!(cluster.session(0).state(), SessionState::Running);
    assert_eq!(cluster.session(0).reset_cookie(), 1);
}

#[test]
#[serial]
fn host_shutdown_ends_every_client() {
    let mut cluster = Cluster::host(3);
    cluster.join("p1");
    cluster.settle(2);
    cluster.join("p2");
    cluster.settle(3);

    cluster.session_mut(0).system_destroyed();
    assert_eq!(cluster.session(0).state(), SessionState::Inactive);
    assert!(!cluster.session(0).driver().shut_down);

    cluster.step_until("clients to close", |c| {
        c.sessions.iter().all(|s| s.state() == SessionState::Inactive)
    });
    for index in 1..3 {
        let client = cluster.session(index);
        assert_eq!(
            client.ui().errors.first(),
            Some(&(
                "Netplay Session Ended".to_owned(),
                "The host shut down the session.".to_owned()
            ))
        );
        assert!(client.driver().shut_down);
        assert_eq!(client.driver().overlay_applied, Some(false));
    }
}

#[test]
#[serial]
fn chat_reaches_every_player() {
    let mut cluster = Cluster::host(3);
    cluster.join("p1");
    cluster.settle(2);
    cluster.join("p2");
    cluster.settle(3);

    cluster.session_mut(1).send_chat("good game").unwrap();
    cluster.step_until("chat to arrive", |c| {
        c.sessions
            .iter()
            .all(|s| s.ui().saw_message("p1: good game"))
    });
}

#[test]
#[serial]
fn joining_boots_an_idle_simulation() {
    let network = MemoryNetwork::new();
    let mut client = new_session(&network, TestMachine::default());
    client.join(join_params("cold")).unwrap();
    assert!(client.driver().running);
    assert_eq!(client.state(), SessionState::Connecting);
    client.system_destroyed();
    assert_eq!(client.state(), SessionState::Inactive);
}
