//! Every player computes the same frames.

use std::sync::Arc;

use crate::common::Cluster;
use rollback_netplay::telemetry::{CollectingObserver, ViolationKind};
use serial_test::serial;

fn observe(cluster: &mut Cluster) -> Vec<Arc<CollectingObserver>> {
    cluster
        .sessions
        .iter_mut()
        .map(|session| {
            let observer = Arc::new(CollectingObserver::new());
            session.set_violation_observer(Some(observer.clone()));
            observer
        })
        .collect()
}

#[test]
#[serial]
fn three_players_agree_on_every_checked_frame() {
    let mut cluster = Cluster::host(3);
    cluster.join("p1");
    cluster.settle(2);
    cluster.join("p2");
    cluster.settle(3);
    let observers = observe(&mut cluster);

    cluster.run_to_frame(120);

    for (index, observer) in observers.iter().enumerate() {
        assert!(
            !observer.has_violation(ViolationKind::Desync),
            "player {index} saw a desync: {:?}",
            observer.violations_of_kind(ViolationKind::Desync)
        );
    }
    for session in &cluster.sessions {
        assert!(!session.ui().saw_message("Desync Detected"));
        // Every player feeds one input per player into each frame.
        assert_eq!(session.driver().inputs.len(), 3);
    }
}

#[test]
#[serial]
fn a_diverging_machine_is_reported() {
    let mut cluster = Cluster::host(2);
    let client = cluster.join("p1");
    cluster.settle(2);
    cluster.session_mut(client).driver_mut().drift = 1;

    cluster.step_until("a desync report", |c| {
        c.sessions
            .iter()
            .any(|s| s.ui().saw_message("Desync Detected"))
    });
}
