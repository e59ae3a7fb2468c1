use rustbully_local_cluster::{
    local_cluster_tester::{strongest, LocalClusterRunner},
    TEST_BULLY_TIME, TEST_HEARTBEAT_INTERVAL,
};
use rand::prelude::SliceRandom;
use rustbully_node::msg::MAX_MISSED_HEARTBEATS;
use std::time::Instant;

fn bully_ms() -> u64 {
    TEST_BULLY_TIME.as_millis() as u64
}

fn heartbeat_ms() -> u64 {
    TEST_HEARTBEAT_INTERVAL.as_millis() as u64
}

/// Y connects to X: both identify, both see one neighbor and the stronger
/// identity ends up leader on both.
#[tokio::test]
async fn pair_elects_stronger_identity() {
    let mut cr = LocalClusterRunner::new(2).await;
    assert!(cr.has_no_leader().await);

    let started = Instant::now();
    cr.link(1, 0).await;
    let x = cr.wait_for_neighbors(0, 1).await.unwrap();
    let y = cr.wait_for_neighbors(1, 1).await.unwrap();
    assert_eq!(x.node.neighbors[0].identity.as_ref(), Some(&y.node.identity));
    assert_eq!(y.node.neighbors[0].identity.as_ref(), Some(&x.node.identity));

    let leader = cr.check_one_leader().await.unwrap();
    assert!(started.elapsed().as_millis() < (6 * bully_ms()) as u128);
    let nodes = cr.get_cluster_state().await;
    assert_eq!(Some(leader.node.identity), strongest(&nodes));
}

/// Both ends of a settled pair start an election at once; they still end up
/// agreeing on one leader.
#[tokio::test]
async fn simultaneous_elections_do_not_split() {
    let mut cr = LocalClusterRunner::new(2).await;
    cr.link(1, 0).await;
    let first = cr.check_one_leader().await.unwrap();

    cr.start_election(0).await;
    cr.start_election(1).await;
    cr.sleep(2 * bully_ms()).await;
    cr.wait_for_quiet().await.unwrap();

    let second = cr.check_one_leader().await.unwrap();
    assert_eq!(first.node.identity, second.node.identity);
}

/// X - Y - Z in a line: a broadcast from X reaches Z exactly once.
#[tokio::test]
async fn broadcast_crosses_a_line_once() {
    let mut cr = LocalClusterRunner::new(3).await;
    cr.link(1, 0).await;
    cr.link(2, 1).await;
    cr.wait_for_neighbors(1, 2).await.unwrap();
    cr.check_one_leader().await.unwrap();

    let before = cr.wait_for_quiet().await.unwrap();
    let id = cr.broadcast(0, "note$hello").await;
    cr.sleep(300).await;
    let after = cr.get_cluster_state().await;

    let z = &after[2];
    assert_eq!(z.node.seen.iter().filter(|s| **s == id).count(), 1);
    assert_eq!(z.node.delivered, before[2].node.delivered + 1);
    assert_eq!(after[1].node.delivered, before[1].node.delivered + 1);
    // The originator drops its own echo.
    assert_eq!(after[0].node.delivered, before[0].node.delivered);
    // Uninterpreted gossip leaves leadership alone.
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.node.leader, a.node.leader);
    }
}

/// Full mesh of three: the strongest identity wins.
#[tokio::test]
async fn mesh_elects_strongest() {
    let mut cr = LocalClusterRunner::new(3).await;
    cr.link(1, 0).await;
    cr.link(2, 0).await;
    cr.link(2, 1).await;
    cr.wait_for_neighbors(2, 2).await.unwrap();

    let leader = cr.check_one_leader().await.unwrap();
    let nodes = cr.get_cluster_state().await;
    assert_eq!(Some(leader.node.identity), strongest(&nodes));
}

/// The leader hangs without closing its socket: the survivor drops it after
/// the missed heartbeats and elects itself.
#[tokio::test]
async fn hung_leader_is_replaced() {
    let mut cr = LocalClusterRunner::new(2).await;
    cr.link(1, 0).await;
    let leader = cr.check_one_leader().await.unwrap();
    let survivor = 1 - leader.id;

    cr.kill(leader.id).await;
    cr.sleep(u64::from(MAX_MISSED_HEARTBEATS + 1) * heartbeat_ms()).await;
    cr.wait_for_neighbors(survivor, 0).await.unwrap();

    let new_leader = cr.check_one_leader().await.unwrap();
    assert_eq!(new_leader.id, survivor);
}

/// Three in a mesh lose their leader: the two left elect the stronger one.
#[tokio::test]
async fn re_election_after_leader_failure() {
    let mut cr = LocalClusterRunner::new(3).await;
    cr.link(1, 0).await;
    cr.link(2, 0).await;
    cr.link(2, 1).await;
    cr.wait_for_neighbors(2, 2).await.unwrap();
    let leader1 = cr.check_one_leader().await.unwrap();

    cr.kill(leader1.id).await;
    let leader2 = cr.check_one_leader().await.unwrap();
    assert_ne!(leader1.id, leader2.id);

    let live: Vec<_> = cr
        .get_cluster_state()
        .await
        .into_iter()
        .filter(|n| !n.is_dead)
        .collect();
    assert_eq!(Some(leader2.node.identity), strongest(&live));
    for n in &live {
        cr.wait_for_neighbors(n.id, 1).await.unwrap();
    }
}

/// A follower going away does not disturb the leader.
#[tokio::test]
async fn follower_failure_keeps_leader() {
    let mut cr = LocalClusterRunner::new(3).await;
    cr.link(1, 0).await;
    cr.link(2, 0).await;
    cr.link(2, 1).await;
    cr.wait_for_neighbors(2, 2).await.unwrap();
    let leader = cr.check_one_leader().await.unwrap();

    let mut followers: Vec<usize> = (0..3).filter(|id| *id != leader.id).collect();
    followers.shuffle(&mut rand::thread_rng());
    let follower = followers[0];
    cr.kill(follower).await;
    cr.sleep(u64::from(MAX_MISSED_HEARTBEATS + 2) * heartbeat_ms()).await;

    cr.wait_for_neighbors(leader.id, 1).await.unwrap();
    let after = cr.check_one_leader().await.unwrap();
    assert_eq!(after.node.identity, leader.node.identity);
}
