//! Whole-cohort scenarios over real datagram sockets

use std::time::Duration;
use tokio::time::{sleep, timeout};
use weft_e2e_tests::{start_coordinator, start_strand, test_instance};
use wire::ListenSpec;

const SETTLE: Duration = Duration::from_millis(100);
const DEADLINE: Duration = Duration::from_secs(5);

/// Three kids: 1 and 2 wait at the barrier, 3 bypasses it by reporting
/// startup completion without ever asking. Both waiters must be released
/// once kid 3 completes, and readiness must be announced exactly once after
/// all three complete.
#[test_log::test(tokio::test)]
async fn barrier_and_readiness_across_a_cohort_of_three() {
    let dir = tempfile::tempdir().unwrap();
    let instance = test_instance(dir.path(), 3, 0);
    let (mut ready, _serving) = start_coordinator(&instance);

    let kid1 = start_strand(&instance, 1, None);
    let kid2 = start_strand(&instance, 2, None);
    let kid3 = start_strand(&instance, 3, None);

    kid1.register().await.unwrap();
    kid2.register().await.unwrap();
    kid3.register().await.unwrap();

    let wait1 = tokio::spawn({
        let kid1 = kid1.clone();
        async move { kid1.barrier_wait().await }
    });
    let wait2 = tokio::spawn({
        let kid2 = kid2.clone();
        async move { kid2.barrier_wait().await }
    });

    // Two of three kids are at the barrier; nothing may cross yet.
    sleep(SETTLE).await;
    assert!(!wait1.is_finished());
    assert!(!wait2.is_finished());
    assert!(!*ready.borrow());

    // Kid 3 bypasses the barrier via direct completion, releasing 1 and 2.
    kid3.completed_startup().unwrap();
    timeout(DEADLINE, wait1).await.unwrap().unwrap().unwrap();
    timeout(DEADLINE, wait2).await.unwrap().unwrap().unwrap();
    assert!(!*ready.borrow(), "readiness needs every completion");

    kid1.completed_startup().unwrap();
    kid2.completed_startup().unwrap();
    timeout(DEADLINE, ready.wait_for(|r| *r))
        .await
        .expect("readiness should be announced")
        .unwrap();
}

/// A kid that reaches the barrier after it crossed is answered immediately.
#[test_log::test(tokio::test)]
async fn late_askers_cross_an_already_crossed_barrier() {
    let dir = tempfile::tempdir().unwrap();
    let instance = test_instance(dir.path(), 2, 0);
    let (_ready, _serving) = start_coordinator(&instance);

    let kid1 = start_strand(&instance, 1, None);
    let kid2 = start_strand(&instance, 2, None);
    kid1.register().await.unwrap();
    kid2.register().await.unwrap();

    let wait1 = tokio::spawn({
        let kid1 = kid1.clone();
        async move { kid1.barrier_wait().await }
    });
    sleep(SETTLE).await;
    kid2.completed_startup().unwrap();
    timeout(DEADLINE, wait1).await.unwrap().unwrap().unwrap();

    // The latch stays set: kid 2's own (late) wait resolves at once.
    timeout(DEADLINE, kid2.barrier_wait())
        .await
        .expect("a crossed barrier answers immediately")
        .unwrap();
}

/// Discovery by tag resolves across registration order: the asker queues
/// until the tagged strand registers.
#[test_log::test(tokio::test)]
async fn discovery_spans_registration_order() {
    let dir = tempfile::tempdir().unwrap();
    let instance = test_instance(dir.path(), 2, 0);
    let (_ready, _serving) = start_coordinator(&instance);

    let kid1 = start_strand(&instance, 1, None);
    kid1.register().await.unwrap();

    let finding = tokio::spawn({
        let kid1 = kid1.clone();
        async move { kid1.find_strand("/cache/disk0").await }
    });
    sleep(SETTLE).await;
    assert!(!finding.is_finished(), "no such strand yet");

    let kid2 = start_strand(&instance, 2, Some("/cache/disk0"));
    kid2.register().await.unwrap();

    let found = timeout(DEADLINE, finding).await.unwrap().unwrap().unwrap();
    assert_eq!(found.kid, 2);
    assert!(found.has_tag("/cache/disk0"));
}

/// Shared-listen descriptors: one socket per spec, duplicated per asker.
#[test_log::test(tokio::test)]
async fn shared_listen_hands_out_the_same_socket() {
    let dir = tempfile::tempdir().unwrap();
    let instance = test_instance(dir.path(), 2, 0);
    let (_ready, _serving) = start_coordinator(&instance);

    let kid1 = start_strand(&instance, 1, None);
    let kid2 = start_strand(&instance, 2, None);
    kid1.register().await.unwrap();
    kid2.register().await.unwrap();

    let spec = ListenSpec {
        address: "127.0.0.1".to_string(),
        port: 0,
    };
    let fd1 = timeout(DEADLINE, kid1.shared_listen(spec.clone()))
        .await
        .unwrap()
        .unwrap();
    let fd2 = timeout(DEADLINE, kid2.shared_listen(spec))
        .await
        .unwrap()
        .unwrap();

    // Both descriptors refer to the same listening socket.
    let listener1 = std::net::TcpListener::from(fd1);
    let listener2 = std::net::TcpListener::from(fd2);
    assert_eq!(
        listener1.local_addr().unwrap(),
        listener2.local_addr().unwrap()
    );
}

/// A restarted strand (same kid id, new endpoint and "pid") re-registers
/// and keeps working against the same Coordinator.
#[test_log::test(tokio::test)]
async fn a_restarted_strand_rejoins_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let instance = test_instance(dir.path(), 1, 0);
    let (mut ready, _serving) = start_coordinator(&instance);

    {
        let first_life = start_strand(&instance, 1, Some("/cache/disk0"));
        first_life.register().await.unwrap();
    }

    // Rebinds the same endpoint; the registry entry is overwritten.
    let second_life = start_strand(&instance, 1, None);
    second_life.register().await.unwrap();
    second_life.completed_startup().unwrap();

    timeout(DEADLINE, ready.wait_for(|r| *r))
        .await
        .expect("instance should become ready after the restart")
        .unwrap();

    // The tag from the first registration survived the restart.
    let found = timeout(DEADLINE, second_life.find_strand("/cache/disk0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.kid, 1);
}
