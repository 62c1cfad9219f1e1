mod common;

use common::{test_config, Harness};
use pgwarden_core::{config, ClusterPhase, EventType, InstanceRole, StorageArtifact};
use pgwarden_operator::store::ObjectStore;
use pgwarden_operator::ReconcilerConfig;
use std::time::Duration;

const CLUSTER: &str = "cluster-pg-data-corruption";

fn name(serial: u32) -> String {
    format!("{CLUSTER}-{serial}")
}

async fn primaries_labelled(h: &Harness) -> usize {
    h.store
        .list_instances(CLUSTER)
        .await
        .unwrap()
        .iter()
        .filter(|i| i.role == InstanceRole::Primary)
        .count()
}

#[tokio::test]
async fn bootstrap_creates_primary_then_standbys() {
    let h = Harness::new(test_config());
    h.create_cluster(CLUSTER, 3);

    let cluster = h.settle(CLUSTER).await;
    assert_eq!(cluster.status.latest_generated_node, 3);
    assert_eq!(cluster.status.target_primary, name(1));
    assert_eq!(cluster.status.current_primary, name(1));
    assert_eq!(h.fleet.live_primaries(), vec![name(1)]);
    assert_eq!(primaries_labelled(&h).await, 1);

    let primary_pvc = h.store.artifact(&name(1)).unwrap();
    assert_eq!(primary_pvc.role(), Some(InstanceRole::Primary));
    assert_eq!(
        primary_pvc.meta.annotation(config::SERIAL_ANNOTATION),
        Some("1")
    );
}

#[tokio::test]
async fn corrupted_primary_is_replaced_without_data_loss() {
    let h = Harness::new(test_config());
    h.create_cluster(CLUSTER, 3);
    h.settle(CLUSTER).await;

    h.fleet.write(&name(1), "tps.tl row 1");
    h.fleet.write(&name(1), "tps.tl row 2");
    h.fleet.sync(&h.store, CLUSTER).await;

    // The primary's data directory is corrupted: the engine stops answering.
    h.fleet.crash(&h.store, &name(1));

    let outcome = h.step(CLUSTER).await;
    assert_eq!(outcome.phase, ClusterPhase::Promoting);
    let cluster = h.cluster(CLUSTER);
    // Equal positions: lowest serial wins.
    assert_eq!(cluster.status.target_primary, name(2));
    assert_eq!(h.fleet.promotions(), vec![name(2)]);

    let outcome = h.step(CLUSTER).await;
    assert_eq!(outcome.phase, ClusterPhase::Rejoining);
    let cluster = h.cluster(CLUSTER);
    assert_eq!(cluster.status.current_primary, name(2));
    assert_eq!(primaries_labelled(&h).await, 1);
    assert_eq!(
        h.store.artifact(&name(2)).unwrap().role(),
        Some(InstanceRole::Primary)
    );

    // The old primary is restarted and comes back still believing it leads.
    h.fleet.restart(&h.store, &name(1));
    assert!(h.store.instance(&name(1)).unwrap().restart_count > 0);
    h.step(CLUSTER).await;
    assert_eq!(h.fleet.demotions(), vec![name(1)]);
    assert_eq!(h.fleet.live_primaries(), vec![name(2)]);

    // Its volume and pod are then removed for good.
    h.store.remove_artifact(&name(1));
    h.store.remove_instance(&name(1));

    let cluster = h.settle(CLUSTER).await;
    assert_eq!(cluster.status.latest_generated_node, 4);
    assert_eq!(cluster.status.current_primary, name(2));
    assert!(h.store.instance(&name(1)).is_none(), "serial 1 must not come back");

    let replacement = h.fleet.node(&name(4)).expect("replacement exists");
    assert!(replacement.up && !replacement.primary, "replacement joins in recovery");
    assert_eq!(replacement.rows, vec!["tps.tl row 1", "tps.tl row 2"]);
    assert_eq!(h.fleet.node(&name(2)).unwrap().rows, replacement.rows);

    let reasons: Vec<_> = h.store.events(CLUSTER).into_iter().map(|e| e.reason).collect();
    for expected in ["PrimaryLost", "FailoverStarted", "FailoverCompleted", "InstanceDemoted"] {
        assert!(reasons.iter().any(|r| r == expected), "missing {expected} in {reasons:?}");
    }
}

#[tokio::test]
async fn stray_volume_with_bad_serial_does_not_block_failover() {
    let h = Harness::new(test_config());
    let cluster = h.create_cluster(CLUSTER, 3);
    h.settle(CLUSTER).await;

    let mut stray = StorageArtifact::for_instance(&cluster, 1, InstanceRole::Standby);
    stray.meta.name = format!("{CLUSTER}-scratch");
    stray.meta.owner_references.clear();
    stray
        .meta
        .annotations
        .insert(config::SERIAL_ANNOTATION.to_string(), "abc".to_string());
    h.store.insert_artifact(stray);

    h.fleet.crash(&h.store, &name(1));
    let outcome = h.step(CLUSTER).await;
    assert_eq!(outcome.phase, ClusterPhase::Promoting);
    let cluster = h.cluster(CLUSTER);
    assert_eq!(cluster.status.target_primary, name(2));
    assert_eq!(cluster.status.latest_generated_node, 3);
    assert!(h
        .store
        .artifact(&format!("{CLUSTER}-scratch"))
        .unwrap()
        .meta
        .is_orphan());
    assert!(!h
        .store
        .events(CLUSTER)
        .iter()
        .any(|e| e.reason == "ReconcileError"));
}

#[tokio::test]
async fn status_write_race_is_retried_within_the_cycle() {
    let h = Harness::new(test_config());
    h.create_cluster(CLUSTER, 3);
    h.settle(CLUSTER).await;

    h.fleet.crash(&h.store, &name(1));
    // Another writer touches the cluster between our read and our write.
    h.store.race_next_status_patch(CLUSTER);

    let outcome = h.reconciler.reconcile(CLUSTER).await.unwrap();
    assert_eq!(outcome.phase, ClusterPhase::Promoting);
    assert_eq!(h.cluster(CLUSTER).status.target_primary, name(2));
    assert_eq!(h.fleet.promotions(), vec![name(2)]);
    let lost = h
        .store
        .events(CLUSTER)
        .into_iter()
        .filter(|e| e.reason == "PrimaryLost")
        .count();
    assert_eq!(lost, 1);
}

#[tokio::test]
async fn instance_without_volume_is_deleted_and_replaced() {
    let h = Harness::new(test_config());
    h.create_cluster(CLUSTER, 2);
    h.settle(CLUSTER).await;

    h.store.remove_artifact(&name(2));
    h.step(CLUSTER).await;
    assert!(h.store.instance(&name(2)).is_none());
    assert!(h.store.instance(&name(3)).is_some());

    let cluster = h.settle(CLUSTER).await;
    assert_eq!(cluster.status.latest_generated_node, 3);
    assert!(h
        .store
        .events(CLUSTER)
        .iter()
        .any(|e| e.reason == "InstanceDeleted" && e.type_ == EventType::Warning));
}

#[tokio::test]
async fn most_advanced_standby_is_elected() {
    let h = Harness::new(test_config());
    h.create_cluster(CLUSTER, 3);
    h.settle(CLUSTER).await;

    // Only serial 3 received the last write before the primary died.
    h.fleet.crash(&h.store, &name(2));
    h.fleet.write(&name(1), "late row");
    h.fleet.sync(&h.store, CLUSTER).await;
    h.fleet.restart(&h.store, &name(2));
    h.fleet.crash(&h.store, &name(1));

    // Serial 2 restarted behind; it has not caught up since.
    assert!(h.fleet.node(&name(2)).unwrap().rows.is_empty());
    h.step(CLUSTER).await;
    assert_eq!(h.cluster(CLUSTER).status.target_primary, name(3));
}

#[tokio::test]
async fn primary_blip_within_grace_is_ignored() {
    let h = Harness::new(ReconcilerConfig {
        primary_grace: Duration::from_secs(60),
        ..test_config()
    });
    h.create_cluster(CLUSTER, 2);
    h.settle(CLUSTER).await;

    h.fleet.crash(&h.store, &name(1));
    let outcome = h.step(CLUSTER).await;
    assert_eq!(outcome.phase, ClusterPhase::Healthy);
    assert!(outcome.requeue_after.unwrap() <= Duration::from_secs(60));
    assert!(h.cluster(CLUSTER).status.current_primary_failing_since.is_some());
    assert!(h.fleet.promotions().is_empty());

    h.fleet.restart(&h.store, &name(1));
    h.step(CLUSTER).await;
    let cluster = h.cluster(CLUSTER);
    assert!(cluster.status.current_primary_failing_since.is_none());
    assert_eq!(cluster.status.target_primary, name(1));
}

#[tokio::test]
async fn failover_without_candidates_stalls_and_recovers() {
    let h = Harness::new(ReconcilerConfig {
        failover_timeout: Duration::ZERO,
        ..test_config()
    });
    h.create_cluster(CLUSTER, 1);
    h.settle(CLUSTER).await;

    h.fleet.crash(&h.store, &name(1));
    for _ in 0..3 {
        let outcome = h.step(CLUSTER).await;
        assert_eq!(outcome.phase, ClusterPhase::PrimaryLost);
    }
    let cluster = h.cluster(CLUSTER);
    assert_eq!(cluster.status.target_primary, name(1), "no primary is fabricated");
    let stalled = h
        .store
        .events(CLUSTER)
        .into_iter()
        .filter(|e| e.reason == "FailoverStalled")
        .count();
    assert_eq!(stalled, 1);

    h.fleet.restart(&h.store, &name(1));
    let cluster = h.settle(CLUSTER).await;
    assert_eq!(cluster.status.current_primary, name(1));
    assert!(h.store.events(CLUSTER).iter().any(|e| e.reason == "PrimaryRecovered"));
}

#[tokio::test]
async fn promotion_stuck_in_recovery_is_reported_once() {
    let h = Harness::new(ReconcilerConfig {
        failover_timeout: Duration::ZERO,
        ..test_config()
    });
    h.create_cluster(CLUSTER, 2);
    h.settle(CLUSTER).await;

    h.fleet.hold_in_recovery(&name(2));
    h.fleet.crash(&h.store, &name(1));
    let outcome = h.step(CLUSTER).await;
    assert_eq!(outcome.phase, ClusterPhase::Promoting);
    assert!(h.cluster(CLUSTER).status.promotion_started.is_some());

    for _ in 0..3 {
        let outcome = h.step(CLUSTER).await;
        assert_eq!(outcome.phase, ClusterPhase::Promoting);
    }
    let stalled = h
        .store
        .events(CLUSTER)
        .into_iter()
        .filter(|e| e.reason == "PromotionStalled")
        .count();
    assert_eq!(stalled, 1);
    assert_eq!(h.cluster(CLUSTER).status.target_primary, name(2));

    // The next promote request goes through.
    h.fleet.release(&name(2));
    h.step(CLUSTER).await;
    let outcome = h.step(CLUSTER).await;
    assert_ne!(outcome.phase, ClusterPhase::Promoting);
    let cluster = h.cluster(CLUSTER);
    assert_eq!(cluster.status.current_primary, name(2));
    assert!(cluster.status.promotion_started.is_none());
}

#[tokio::test]
async fn serial_counter_never_decreases() {
    let h = Harness::new(test_config());
    h.create_cluster(CLUSTER, 3);
    let mut last = 0;
    for round in 0..12 {
        if round == 4 {
            h.fleet.crash(&h.store, &name(1));
        }
        if round == 7 {
            h.store.remove_artifact(&name(1));
        }
        h.step(CLUSTER).await;
        let latest = h.cluster(CLUSTER).status.latest_generated_node;
        assert!(latest >= last, "latestGeneratedNode went from {last} to {latest}");
        assert!(primaries_labelled(&h).await <= 1);
        last = latest;
    }
}

#[tokio::test]
async fn deleted_cluster_is_not_found() {
    let h = Harness::new(test_config());
    let err = h.reconciler.reconcile("missing").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!err.is_retryable());
}
