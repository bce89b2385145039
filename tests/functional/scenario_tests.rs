//! End-to-end migration scenarios.
//!
//! Each test runs a full flow through the driver façade: load data, start,
//! wait, verify, forget, wait for garbage collection.

use tenant_migration_driver::RunOptions;
use tenant_migration_driver::client::RetryMode;
use tenant_migration_driver::cluster::{ClusterHandle, MigrationState};
use tenant_migration_driver::error::ErrorKind;

use crate::common::fixtures::documents;
use crate::{Fault, setup};

/// The canonical flow: tenant `t1`, 20 documents in `t1_db.coll`.
#[tokio::test(start_paused = true)]
async fn test_end_to_end_t1_migration() {
    let (world, mut driver) = setup();
    let docs = documents("t1", 20);
    driver
        .insert_donor_data("t1_db", "coll", &docs)
        .await
        .unwrap();

    let descriptor = driver.descriptor("t1");
    let outcome = driver
        .run_migration(
            &descriptor,
            RunOptions::new().with_retry_on_transient_errors(true),
        )
        .await
        .unwrap();
    assert_eq!(outcome.state, MigrationState::Committed);

    let nodes = driver.donor().all_nodes();
    driver
        .wait_for_nodes_to_reach_state(
            &nodes,
            &descriptor.migration_id,
            "t1",
            MigrationState::Committed,
        )
        .await
        .unwrap();
    driver
        .assert_nodes_in_expected_state(
            &nodes,
            &descriptor.migration_id,
            "t1",
            MigrationState::Committed,
        )
        .await
        .unwrap();

    let report = driver
        .verify_recipient_data(&descriptor, "t1_db", "coll", &docs)
        .await
        .unwrap();
    assert_eq!(report.found, 20);

    driver
        .forget_migration(&descriptor.migration_id, RetryMode::OnTransientErrors)
        .await
        .unwrap();
    driver
        .wait_for_migration_garbage_collection(&nodes, &descriptor.migration_id, "t1")
        .await
        .unwrap();

    driver.stop().await.unwrap();
    let world = world.lock().unwrap();
    assert!(world.is_stopped("donor"));
    assert!(world.is_stopped("recipient"));
}

#[tokio::test(start_paused = true)]
async fn test_run_migration_with_automatic_forget() {
    let (world, mut driver) = setup();
    world.lock().unwrap().set_gc_delay(2);
    let descriptor = driver.descriptor("tenantA");

    let outcome = driver
        .run_migration(
            &descriptor,
            RunOptions::new()
                .with_retry_on_transient_errors(true)
                .with_automatic_forget(true),
        )
        .await
        .unwrap();
    assert!(outcome.is_committed());
    assert!(world.lock().unwrap().is_forgotten(&descriptor.migration_id));

    let nodes = driver.donor().all_nodes();
    driver
        .wait_for_migration_garbage_collection(&nodes, &descriptor.migration_id, "tenantA")
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_run_migration_survives_repeated_failover() {
    let (world, mut driver) = setup();
    let docs = documents("tenantA", 20);
    driver
        .insert_donor_data("tenantA_orders", "orders", &docs)
        .await
        .unwrap();
    world.lock().unwrap().inject_faults([
        Fault::StepDown { new_primary: 1 },
        Fault::NetworkError,
        Fault::StepDown { new_primary: 2 },
    ]);

    let descriptor = driver.descriptor("tenantA");
    let outcome = driver
        .run_migration(
            &descriptor,
            RunOptions::new()
                .with_retry_on_transient_errors(true)
                .with_automatic_forget(true),
        )
        .await
        .unwrap();

    assert!(outcome.is_committed());
    driver
        .verify_recipient_data(&descriptor, "tenantA_orders", "orders", &docs)
        .await
        .unwrap();

    let world = world.lock().unwrap();
    assert_eq!(world.primary(), 2);
    assert!(world.is_forgotten(&descriptor.migration_id));
    // Every start attempt targeted the same migration id.
    assert!(
        world
            .command_log()
            .iter()
            .all(|c| c.migration_id == descriptor.migration_id)
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_migration_without_retry_surfaces_step_down() {
    let (world, mut driver) = setup();
    world
        .lock()
        .unwrap()
        .inject_faults([Fault::StepDown { new_primary: 1 }]);
    let descriptor = driver.descriptor("tenantA");

    let err = driver
        .run_migration(&descriptor, RunOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotPrimary);
    assert_eq!(world.lock().unwrap().migration_state(&descriptor.migration_id), None);
}

#[tokio::test(start_paused = true)]
async fn test_abort_then_restart_tenant_with_new_id() {
    let (world, mut driver) = setup();
    let docs = documents("tenantA", 5);
    driver
        .insert_donor_data("tenantA_orders", "orders", &docs)
        .await
        .unwrap();

    let first = driver.descriptor("tenantA");
    driver
        .start_migration(&first, RetryMode::OnTransientErrors)
        .await
        .unwrap();
    driver
        .abort_migration(&first.migration_id, RetryMode::OnTransientErrors)
        .await
        .unwrap();
    let outcome = driver
        .wait_for_migration_to_complete(&first, RetryMode::OnTransientErrors)
        .await
        .unwrap();
    assert!(outcome.is_aborted());
    assert!(outcome.reply.abort_reason.is_some());

    let nodes = driver.donor().all_nodes();
    driver
        .assert_nodes_in_expected_state(&nodes, &first.migration_id, "tenantA", MigrationState::Aborted)
        .await
        .unwrap();
    // Nothing moved.
    assert!(
        world
            .lock()
            .unwrap()
            .recipient_documents("tenantA_orders", "orders")
            .is_empty()
    );

    driver
        .forget_migration(&first.migration_id, RetryMode::OnTransientErrors)
        .await
        .unwrap();
    driver
        .wait_for_migration_garbage_collection(&nodes, &first.migration_id, "tenantA")
        .await
        .unwrap();

    let second = driver.descriptor("tenantA");
    let outcome = driver
        .run_migration(
            &second,
            RunOptions::new().with_retry_on_transient_errors(true),
        )
        .await
        .unwrap();
    assert!(outcome.is_committed());
    driver
        .verify_recipient_data(&second, "tenantA_orders", "orders", &docs)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_metrics_cover_a_full_run() {
    let (_world, mut driver) = setup();
    let descriptor = driver.descriptor("tenantA");
    driver
        .run_migration(
            &descriptor,
            RunOptions::new()
                .with_retry_on_transient_errors(true)
                .with_automatic_forget(true),
        )
        .await
        .unwrap();

    let text = driver.metrics().encode();
    assert!(text.contains("command=\"donorStartMigration\""));
    assert!(text.contains("command=\"donorForgetMigration\""));
    assert!(text.contains("operation=\"wait_for_migration_to_complete\""));
}
