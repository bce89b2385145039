//! Completion and garbage-collection waits.

use std::sync::Arc;
use std::time::Duration;

use tenant_migration_driver::client::RetryMode;
use tenant_migration_driver::cluster::{ClusterHandle, MigrationState, NodeHandle};
use tenant_migration_driver::error::{Error, ErrorKind, codes};
use tenant_migration_driver::wait::{GarbageCollectionPoller, PollOutcome, Poller};
use tenant_migration_driver::{MigrationDriver, RunOptions};

use crate::common::fixtures::test_config;
use crate::{Fault, MockCluster, abort_plan, setup};

#[tokio::test(start_paused = true)]
async fn test_wait_for_commit_observes_monotonic_states() {
    let (_world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap();

    let outcome = driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(outcome.reply.state, MigrationState::Committed);
    assert_eq!(
        outcome.observed_states,
        vec![
            MigrationState::DataSync,
            MigrationState::Blocking,
            MigrationState::Committed,
        ]
    );
    assert!(
        outcome
            .observed_states
            .windows(2)
            .all(|w| w[0].can_advance_to(w[1]))
    );
    assert_eq!(driver.metrics().polls("wait_for_migration_to_complete"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_abort_returns_abort_reason() {
    let (world, mut driver) = setup();
    world.lock().unwrap().set_plan("tenantB", abort_plan());
    let descriptor = driver.descriptor("tenantB");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();

    let outcome = driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap();

    assert!(outcome.is_aborted());
    let reason = outcome.reply.abort_reason.unwrap();
    assert_eq!(reason.code, codes::TENANT_MIGRATION_ABORTED);
    assert_eq!(outcome.reply.raw["abortReason"]["code"], codes::TENANT_MIGRATION_ABORTED);
}

#[tokio::test(start_paused = true)]
async fn test_wait_rejects_state_regression() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    world.lock().unwrap().inject_faults([
        Fault::ReportState(MigrationState::Blocking),
        Fault::ReportState(MigrationState::DataSync),
    ]);

    let err = driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap_err();

    match err {
        Error::ProtocolViolation(message) => {
            assert!(message.contains("from blocking back to data sync"), "{message}");
        }
        other => panic!("expected protocol violation, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_wait_survives_failover() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    world.lock().unwrap().inject_faults([
        Fault::NetworkError,
        Fault::StepDown { new_primary: 2 },
    ]);

    let outcome = driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(driver.donor().primary().host(), "d2");
    assert_eq!(driver.metrics().retries("donorStartMigration"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_wait_without_retry_surfaces_step_down() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    world.lock().unwrap().inject_faults([
        Fault::ReportState(MigrationState::DataSync),
        Fault::StepDown { new_primary: 1 },
    ]);

    let err = driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::Never)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotPrimary);
    assert_eq!(driver.metrics().retries("donorStartMigration"), 0);
    // The step-down ended the wait; nothing was re-sent to the new primary.
    let world = world.lock().unwrap();
    assert_eq!(world.commands_named("donorStartMigration"), 3);
    assert_eq!(world.primary(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_migration_without_retry_fails_on_step_down_during_wait() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    world.lock().unwrap().inject_faults([
        Fault::ReportState(MigrationState::DataSync),
        Fault::StepDown { new_primary: 1 },
    ]);

    let err = driver
        .run_migration(&descriptor, RunOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotPrimary);
    assert_eq!(driver.metrics().retries("donorStartMigration"), 0);
    assert_ne!(
        world.lock().unwrap().migration_state(&descriptor.migration_id),
        Some(MigrationState::Committed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_wait_fails_on_non_transient_status_error() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    world.lock().unwrap().inject_faults([Fault::CommandError {
        code: codes::NO_SUCH_TENANT_MIGRATION,
        code_name: "NoSuchTenantMigration",
    }]);

    let err = driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::NO_SUCH_TENANT_MIGRATION));
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_on_stuck_migration() {
    let world = crate::MockWorld::new(3);
    world
        .lock()
        .unwrap()
        .set_plan("tenantA", vec![MigrationState::DataSync]);
    let config = test_config().with_wait_timeout(Duration::from_secs(2));
    let mut driver = MigrationDriver::new(
        MockCluster::donor(&world),
        MockCluster::recipient(&world),
        config,
    )
    .unwrap();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();

    let err = driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap_err();

    match err {
        Error::Timeout {
            operation,
            duration,
            last_error,
        } => {
            assert_eq!(operation, "wait_for_migration_to_complete");
            assert_eq!(duration, Duration::from_secs(2));
            assert_eq!(last_error.unwrap(), "migration is in state data sync");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(
        driver.metrics().timeouts("wait_for_migration_to_complete"),
        1
    );
}

// ============================================================================
// Garbage collection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_garbage_collection_completes_on_every_node() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap();
    {
        // Secondaries keep showing the committed record for a while.
        let mut world = world.lock().unwrap();
        world.set_gc_delay(4);
        world.set_replication_lag(2);
    }
    driver
        .forget_migration(&descriptor.migration_id, RetryMode::OnTransientErrors)
        .await
        .unwrap();

    let nodes = driver.donor().all_nodes();
    driver
        .wait_for_migration_garbage_collection(
            &nodes,
            &descriptor.migration_id,
            &descriptor.tenant_id,
        )
        .await
        .unwrap();

    for node in &nodes {
        let status = node
            .read_migration_status(&descriptor.migration_id)
            .await
            .unwrap();
        assert!(status.durable_record.is_none(), "{}", node.host());
        assert!(status.access_blocker("tenantA").is_none(), "{}", node.host());
        assert_eq!(status.active_coordinator_count, 0, "{}", node.host());
    }
    assert!(driver.metrics().polls("wait_for_migration_garbage_collection") > 1);
}

#[tokio::test(start_paused = true)]
async fn test_garbage_collection_times_out_without_forget() {
    let world = crate::MockWorld::new(2);
    let config = test_config().with_wait_timeout(Duration::from_secs(1));
    let mut driver = MigrationDriver::new(
        MockCluster::donor(&world),
        MockCluster::recipient(&world),
        config,
    )
    .unwrap();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap();

    let nodes = driver.donor().all_nodes();
    let err = driver
        .wait_for_migration_garbage_collection(
            &nodes,
            &descriptor.migration_id,
            &descriptor.tenant_id,
        )
        .await
        .unwrap_err();

    match err {
        Error::Timeout {
            operation,
            last_error,
            ..
        } => {
            assert_eq!(operation, "wait_for_migration_garbage_collection");
            let reason = last_error.unwrap();
            assert!(reason.contains("d0: durable record present"), "{reason}");
            assert!(reason.contains("coordinator still active"), "{reason}");
            assert!(reason.contains("access blocker present"), "{reason}");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_garbage_collection_treats_unreachable_node_as_pending() {
    let world = crate::MockWorld::new(3);
    let config = test_config().with_wait_timeout(Duration::from_secs(1));
    let mut driver = MigrationDriver::new(
        MockCluster::donor(&world),
        MockCluster::recipient(&world),
        config,
    )
    .unwrap();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::OnTransientErrors)
        .await
        .unwrap();
    driver
        .forget_migration(&descriptor.migration_id, RetryMode::Never)
        .await
        .unwrap();
    world.lock().unwrap().set_node_up(2, false);

    let nodes = driver.donor().all_nodes();
    let err = driver
        .wait_for_migration_garbage_collection(
            &nodes,
            &descriptor.migration_id,
            &descriptor.tenant_id,
        )
        .await
        .unwrap_err();

    match err {
        Error::Timeout { last_error, .. } => {
            let reason = last_error.unwrap();
            assert!(reason.starts_with("d2: unreachable"), "{reason}");
            assert!(!reason.contains("d0"), "{reason}");
            assert!(!reason.contains("d1"), "{reason}");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_garbage_collection_requires_all_conditions_on_one_read() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    // Record goes first, then the coordinator, then the blocker.
    world.lock().unwrap().set_gc_stagger(3);
    driver
        .forget_migration(&descriptor.migration_id, RetryMode::Never)
        .await
        .unwrap();

    let primary = [driver.donor().primary()];
    let mut poller =
        GarbageCollectionPoller::new(&primary, &descriptor.migration_id, &descriptor.tenant_id);
    let mut seen = Vec::new();
    loop {
        let outcome = poller.poll().await;
        let progress = poller.progress()[0];
        seen.push(progress);
        match outcome {
            PollOutcome::Done(()) => break,
            PollOutcome::Pending => assert!(!progress.is_complete(), "{progress:?}"),
            PollOutcome::Failed(e) => panic!("unexpected failure: {e}"),
        }
        assert!(seen.len() < 20, "garbage collection never finished");
    }

    let first = seen[0];
    assert!(first.record_removed);
    assert!(!first.coordinators_idle);
    assert!(!first.blocker_removed);
    assert!(
        seen.iter()
            .any(|p| p.record_removed && p.coordinators_idle && !p.blocker_removed)
    );
    assert_eq!(seen.iter().filter(|p| p.is_complete()).count(), 1);
    assert!(seen.last().unwrap().is_complete());
}

#[tokio::test(start_paused = true)]
async fn test_garbage_collection_wait_covers_staggered_removal() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    {
        let mut world = world.lock().unwrap();
        world.set_gc_stagger(4);
        world.set_replication_lag(1);
    }
    driver
        .forget_migration(&descriptor.migration_id, RetryMode::Never)
        .await
        .unwrap();

    let nodes = driver.donor().all_nodes();
    driver
        .wait_for_migration_garbage_collection(
            &nodes,
            &descriptor.migration_id,
            &descriptor.tenant_id,
        )
        .await
        .unwrap();

    for node in &nodes {
        let status = node
            .read_migration_status(&descriptor.migration_id)
            .await
            .unwrap();
        let progress = status.garbage_collection(&descriptor.migration_id, "tenantA");
        assert!(progress.is_complete(), "{}: {:?}", node.host(), progress);
    }
}

#[tokio::test(start_paused = true)]
async fn test_garbage_collection_completes_after_node_recovers() {
    let (world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .start_migration(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    driver
        .wait_for_migration_to_complete(&descriptor, RetryMode::Never)
        .await
        .unwrap();
    driver
        .forget_migration(&descriptor.migration_id, RetryMode::Never)
        .await
        .unwrap();
    world.lock().unwrap().set_node_up(2, false);

    let recovering = Arc::clone(&world);
    let recover = async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        recovering.lock().unwrap().set_node_up(2, true);
    };
    let nodes = driver.donor().all_nodes();
    let (result, ()) = tokio::join!(
        driver.wait_for_migration_garbage_collection(
            &nodes,
            &descriptor.migration_id,
            &descriptor.tenant_id,
        ),
        recover
    );

    result.unwrap();
    // d2 was polled while down, then again once it came back.
    assert!(driver.metrics().polls("wait_for_migration_garbage_collection") > 5);
    let status = nodes[2]
        .read_migration_status(&descriptor.migration_id)
        .await
        .unwrap();
    assert!(
        status
            .garbage_collection(&descriptor.migration_id, "tenantA")
            .is_complete()
    );
}
