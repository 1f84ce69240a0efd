//! Integration tests for unwinding failed and cancelled builds.

mod common;

use std::time::Duration;

use common::{full_config, minimal_config, TestBuild, NAMESPACE};
use kubebake_builder::BuildError;
use kubebake_cluster::{
    ClusterCall, DataVolumePhase, InstancePhase, ResourceKind, WatchScript,
};
use tokio_util::sync::CancellationToken;

/// Two unnamed data volumes and nothing else.
fn two_volume_config() -> String {
    minimal_config().replace(
        "[[provision]]",
        r#"[[disk]]
        type = "datavolume"
        size = "2Gi"
        source = { type = "registry", url = "docker://quay.io/containerdisks/fedora:40" }

        [[provision]]"#,
    )
}

fn reversed(mut names: Vec<String>) -> Vec<String> {
    names.reverse();
    names
}

fn deletions(test: &TestBuild) -> Vec<(ResourceKind, String)> {
    test.cluster
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ClusterCall::Delete { kind, name } => Some((kind, name)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn failed_volume_halts_and_unwinds_in_reverse() {
    let test = TestBuild::new(&two_volume_config());
    test.cluster.script_data_volume_watch(WatchScript::new(vec![
        DataVolumePhase::Pending,
        DataVolumePhase::Failed,
        DataVolumePhase::Succeeded,
    ]));

    let failure = test.builder.run(CancellationToken::new()).await.unwrap_err();

    let created = test.cluster.created(ResourceKind::DataVolume);
    assert!(matches!(
        failure.error,
        BuildError::DataVolumeFailed { ref name } if *name == created[0]
    ));
    assert_eq!(test.cluster.deleted(ResourceKind::DataVolume), reversed(created));
    assert!(test.cluster.created(ResourceKind::VirtualMachineInstance).is_empty());
    assert!(failure.warnings.is_empty());
}

#[tokio::test]
async fn unknown_volume_phase_halts() {
    let test = TestBuild::new(&two_volume_config());
    test.cluster.script_data_volume_watch(WatchScript::new(vec![
        DataVolumePhase::ImportInProgress,
        DataVolumePhase::Other("Paused".to_owned()),
    ]));

    let failure = test.builder.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        failure.error,
        BuildError::UnexpectedDataVolumePhase { ref phase, .. } if phase == "Paused"
    ));
    assert!(test.cluster.existing(ResourceKind::DataVolume, NAMESPACE).is_empty());
}

#[tokio::test]
async fn closed_watch_halts() {
    let test = TestBuild::new(&minimal_config());
    test.cluster
        .script_data_volume_watch(WatchScript::new(vec![DataVolumePhase::Pending]).then_close());

    let failure = test.builder.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(failure.error, BuildError::WatchClosed { .. }));
    assert!(test.cluster.existing(ResourceKind::DataVolume, NAMESPACE).is_empty());
}

#[tokio::test]
async fn failing_step_owes_no_cleanup() {
    let test = TestBuild::new(&full_config());
    test.cluster.fail_next_create(ResourceKind::Secret);

    let failure = test.builder.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(failure.error, BuildError::Cluster { .. }));
    assert_eq!(
        test.cluster.deleted(ResourceKind::DataVolume),
        reversed(test.cluster.created(ResourceKind::DataVolume))
    );
    assert!(test.cluster.deleted(ResourceKind::Secret).is_empty());
    assert!(test.cluster.created(ResourceKind::VirtualMachineInstance).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_command_unwinds_instance_before_volumes() {
    let test = TestBuild::new(&minimal_config());
    test.connector.exit_status("poweroff", 1);

    let failure = test.builder.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        failure.error,
        BuildError::Provision { ref command, .. } if command == "poweroff"
    ));
    let instance = test.cluster.created(ResourceKind::VirtualMachineInstance);
    let volume = test.cluster.created(ResourceKind::DataVolume);
    assert_eq!(
        deletions(&test),
        vec![
            (ResourceKind::VirtualMachineInstance, instance[0].clone()),
            (ResourceKind::DataVolume, volume[0].clone()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn unexpected_instance_phase_unwinds_everything() {
    let test = TestBuild::new(&full_config());
    test.cluster.script_instance_watch(WatchScript::new(vec![
        InstancePhase::Running,
        InstancePhase::Failed,
    ]));

    let failure = test.builder.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        failure.error,
        BuildError::UnexpectedInstancePhase { ref phase, .. } if phase == "Failed"
    ));
    assert!(test.cluster.existing(ResourceKind::DataVolume, NAMESPACE).is_empty());
    assert!(test.cluster.existing(ResourceKind::Secret, NAMESPACE).is_empty());
    assert!(test
        .cluster
        .existing(ResourceKind::VirtualMachineInstance, NAMESPACE)
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn cleanup_failure_does_not_stop_the_unwind() {
    let test = TestBuild::new(&full_config());
    test.cluster.fail_delete("fedora-40");
    test.connector.exit_status("poweroff", 1);

    let failure = test.builder.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(failure.error, BuildError::Provision { .. }));
    assert_eq!(failure.warnings.len(), 1);
    assert!(failure.warnings[0].contains("fedora-40"));
    assert_eq!(
        test.cluster.existing(ResourceKind::DataVolume, NAMESPACE),
        vec!["fedora-40"]
    );
    assert!(test.cluster.existing(ResourceKind::Secret, NAMESPACE).is_empty());
    assert_eq!(
        deletions(&test).last(),
        Some(&(ResourceKind::DataVolume, "fedora-40".to_owned()))
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_unwinds_without_failure() {
    let test = TestBuild::new(&full_config());
    // The instance keeps running, so the build blocks until cancelled.
    test.cluster
        .script_instance_watch(WatchScript::new(vec![InstancePhase::Running]));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let failure = test.builder.run(cancel).await.unwrap_err();

    assert!(failure.error.is_cancellation());
    assert_eq!(test.connector.commands(), vec!["dnf -y update", "poweroff"]);
    assert!(test.cluster.existing(ResourceKind::DataVolume, NAMESPACE).is_empty());
    assert!(test.cluster.existing(ResourceKind::Secret, NAMESPACE).is_empty());
    assert!(test
        .cluster
        .existing(ResourceKind::VirtualMachineInstance, NAMESPACE)
        .is_empty());
}

#[tokio::test]
async fn cancelled_before_start_creates_nothing() {
    let test = TestBuild::new(&full_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = test.builder.run(cancel).await.unwrap_err();

    assert!(failure.error.is_cancellation());
    assert!(test.cluster.created(ResourceKind::DataVolume).is_empty());
}
