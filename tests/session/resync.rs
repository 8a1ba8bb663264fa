//! Membership changes and the reset rounds they trigger.

use crate::common::Cluster;
use rollback_netplay::control::CloseReason;
use rollback_netplay::{PlayerId, SessionState};
use serial_test::serial;

#[test]
#[serial]
fn second_joiner_meshes_with_the_first() {
    let mut cluster = Cluster::host(4);
    cluster.join("p1");
    cluster.settle(2);
    cluster.join("p2");
    cluster.settle(3);

    let first = cluster.session(1);
    let second = cluster.session(2);
    assert_eq!(second.local_player_id(), Some(PlayerId::new(2)));
    assert!(first.peers().peer_for_player(PlayerId::new(2)).is_some());
    assert!(second.peers().peer_for_player(PlayerId::new(1)).is_some());
    assert_eq!(first.nickname(PlayerId::new(2)), "p2");
    assert_eq!(second.nickname(PlayerId::new(1)), "p1");

    let cookie = cluster.session(0).reset_cookie();
    assert_eq!(cookie, 2);
    assert!(cluster.sessions.iter().all(|s| s.reset_cookie() == cookie));
    // The first client reloaded the host's state once per round.
    assert_eq!(first.driver().state_loads, 2);
}

#[test]
#[serial]
fn existing_clients_learn_the_joiners_name() {
    let mut cluster = Cluster::host(4);
    cluster.join("p1");
    cluster.settle(2);
    cluster.join("p2");
    cluster.settle(3);

    let first = cluster.session(1);
    assert!(first.ui().saw_message("p2 is joining the session as player 2."));
    assert!(!first.ui().saw_message("p1 is joining"));
    // The joiner is not told about itself.
    assert!(!cluster.session(2).ui().saw_message("is joining the session"));
}

#[test]
#[serial]
fn a_leaving_client_triggers_a_resync_without_it() {
    let mut cluster = Cluster::host(4);
    cluster.join("p1");
    cluster.settle(2);
    cluster.join("p2");
    cluster.settle(3);
    cluster.run_to_frame(20);
    let cookie_before = cluster.session(0).reset_cookie();

    cluster.session_mut(2).request_close(CloseReason::HostShutdown);
    cluster.step_until("the others to resync without p2", |c| {
        c.session(2).state() == SessionState::Inactive
            && (0..2).all(|i| {
                c.session(i).state() == SessionState::Running && c.session(i).num_players() == 2
            })
    });

    let host = cluster.session(0);
    assert!(host.reset_cookie() > cookie_before);
    assert!(host.ui().saw_message("p2 left the session: Disconnected from host"));
    assert_eq!(host.nickname(PlayerId::new(2)), "");
    assert!(cluster.session(1).ui().saw_message("p2 left the session"));
    assert!(cluster
        .session(1)
        .peers()
        .peer_for_player(PlayerId::new(2))
        .is_none());
    assert_eq!(
        cluster.session(1).reset_cookie(),
        cluster.session(0).reset_cookie()
    );

    // Play continues with the remaining pair.
    let frame = cluster.session(1).current_frame().as_i32();
    cluster.sessions.truncate(2);
    cluster.run_to_frame(frame + 20);
}

#[test]
#[serial]
fn a_freed_slot_is_reused_by_the_next_joiner() {
    let mut cluster = Cluster::host(3);
    cluster.join("p1");
    cluster.settle(2);
    cluster.join("p2");
    cluster.settle(3);

    cluster.session_mut(1).request_close(CloseReason::HostShutdown);
    cluster.step_until("p1 to leave", |c| {
        c.session(1).state() == SessionState::Inactive
            && c.session(0).state() == SessionState::Running
            && c.session(0).num_players() == 2
            && c.session(2).state() == SessionState::Running
            && c.session(2).num_players() == 2
    });
    cluster.sessions.remove(1);

    let again = cluster.join("p3");
    cluster.settle(3);
    assert_eq!(
        cluster.session(again).local_player_id(),
        Some(PlayerId::new(1))
    );
    assert_eq!(cluster.session(0).nickname(PlayerId::new(1)), "p3");
}
