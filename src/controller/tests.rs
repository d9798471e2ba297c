//! Unit tests for the volume controller against the in-memory remote.

use std::collections::BTreeMap;
use std::time::Duration;

use rstest::{fixture, rstest};
use tokio::time::Instant;

use super::*;
use crate::error::Code;
use crate::metadata::MemoryStore;
use crate::remote::{DiskStatus, RemoteSnapshot, SnapshotStatus};
use crate::test_support::FakeRemote;
use crate::types::{VolumeCapability, ZONE_TOPOLOGY_KEY};

const GIB: u64 = 1 << 30;

type Controller = VolumeController<FakeRemote, MemoryStore>;

fn controller_over(remote: &FakeRemote, store: &MemoryStore) -> Controller {
    VolumeController::new(
        remote.clone(),
        store.clone(),
        ControllerSettings::new("fr-par-1", "sbs_5k"),
    )
}

#[fixture]
fn remote() -> FakeRemote {
    FakeRemote::new()
}

fn disk(id: &str, status: DiskStatus, attached_to: Option<&str>) -> RemoteDisk {
    RemoteDisk {
        id: id.to_owned(),
        name: format!("pvc-{id}"),
        status,
        attached_to: attached_to.map(str::to_owned),
        size_gib: 20,
        zone: String::from("fr-par-1"),
    }
}

fn request(name: &str, required_bytes: u64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_owned(),
        capacity: CapacityRange {
            required_bytes,
            limit_bytes: 0,
        },
        capabilities: vec![VolumeCapability::mount("ext4")],
        ..CreateVolumeRequest::default()
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_rounds_capacity_and_uses_default_type(remote: FakeRemote) {
    let controller = controller_over(&remote, &MemoryStore::new());

    let volume = controller
        .create_volume(&request("pvc-1", 11 * GIB))
        .await
        .expect("create volume");

    let submitted = remote.create_requests();
    assert_eq!(submitted.len(), 1);
    let first = submitted.first().expect("one request");
    assert_eq!(first.size_gib, 11);
    assert_eq!(first.disk_type, "sbs_5k");
    assert_eq!(first.client_token, "pvc-1");
    assert_eq!(volume.capacity_bytes, 11 * GIB);
    assert_eq!(volume.zone, "fr-par-1");
    assert_eq!(
        volume
            .accessible_topology
            .first()
            .and_then(|segment| segment.get(ZONE_TOPOLOGY_KEY))
            .map(String::as_str),
        Some("fr-par-1")
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_retry_returns_the_same_volume(remote: FakeRemote) {
    let controller = controller_over(&remote, &MemoryStore::new());

    let first = controller
        .create_volume(&request("pvc-1", GIB))
        .await
        .expect("first create");
    let second = controller
        .create_volume(&request("pvc-1", GIB))
        .await
        .expect("retried create");

    assert_eq!(first.volume_id, second.volume_id);
}

#[rstest]
#[tokio::test]
async fn create_rejects_block_capability_without_remote_calls(remote: FakeRemote) {
    let controller = controller_over(&remote, &MemoryStore::new());
    let mut block = request("pvc-1", GIB);
    block.capabilities = vec![VolumeCapability {
        access_type: crate::types::AccessType::Block,
        access_mode: crate::types::AccessMode::SingleNodeWriter,
    }];

    let err = controller
        .create_volume(&block)
        .await
        .expect_err("block access rejected");

    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(remote.calls("create_disk"), 0);
}

#[rstest]
#[tokio::test]
async fn create_from_missing_snapshot_is_not_found(remote: FakeRemote) {
    let controller = controller_over(&remote, &MemoryStore::new());
    let mut restore = request("pvc-1", GIB);
    restore.content_source = Some(ContentSource::Snapshot {
        id: String::from("snap-9"),
    });

    let err = controller
        .create_volume(&restore)
        .await
        .expect_err("missing snapshot");

    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(remote.calls("create_disk"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_restores_from_ready_snapshot(remote: FakeRemote) {
    remote.insert_snapshot(RemoteSnapshot {
        id: String::from("snap-9"),
        name: String::from("nightly"),
        source_disk_id: String::from("vol-0"),
        status: SnapshotStatus::Normal,
        percent: 100,
        size_bytes: GIB,
        created_at: None,
    });
    let controller = controller_over(&remote, &MemoryStore::new());
    let mut restore = request("pvc-1", GIB);
    restore.content_source = Some(ContentSource::Snapshot {
        id: String::from("snap-9"),
    });

    let volume = controller.create_volume(&restore).await.expect("restore");

    assert_eq!(volume.source_snapshot_id.as_deref(), Some("snap-9"));
    assert_eq!(
        remote
            .create_requests()
            .first()
            .and_then(|submitted| submitted.snapshot_id.clone()),
        Some(String::from("snap-9"))
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_policy_binding_does_not_fail_creation(remote: FakeRemote) {
    remote.fail_next(
        "bind_snapshot_policy",
        RemoteError::Unsupported {
            feature: String::from("automatic snapshot policies"),
        },
    );
    let controller = controller_over(&remote, &MemoryStore::new());
    let mut with_policy = request("pvc-1", GIB);
    with_policy.parameters = BTreeMap::from([(ASP_ID_KEY.to_owned(), String::from("asp-1"))]);

    controller
        .create_volume(&with_policy)
        .await
        .expect("policy failure is swallowed");

    assert_eq!(remote.calls("bind_snapshot_policy"), 1);
}

#[rstest]
#[tokio::test]
async fn delete_of_absent_volume_issues_no_delete(remote: FakeRemote) {
    let controller = controller_over(&remote, &MemoryStore::new());

    controller.delete_volume("vol-gone").await.expect("idempotent delete");

    assert_eq!(remote.calls("describe_disks"), 1);
    assert_eq!(remote.calls("delete_disk"), 0);
}

#[rstest]
#[tokio::test]
async fn delete_of_attached_volume_is_failed_precondition(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let controller = controller_over(&remote, &MemoryStore::new());

    let err = controller.delete_volume("vol-1").await.expect_err("in use");

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert_eq!(remote.calls("delete_disk"), 0);
}

#[rstest]
#[tokio::test]
async fn publish_to_current_owner_issues_no_attach(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let controller = controller_over(&remote, &MemoryStore::new());

    controller
        .publish_volume("vol-1", "node-a")
        .await
        .expect("already attached");

    assert_eq!(remote.calls("attach_disk"), 0);
}

#[rstest]
#[tokio::test]
async fn publish_to_another_node_is_failed_precondition(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let controller = controller_over(&remote, &MemoryStore::new());

    let err = controller
        .publish_volume("vol-1", "node-b")
        .await
        .expect_err("attached elsewhere");

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert_eq!(remote.calls("attach_disk"), 0);
}

#[tokio::test(start_paused = true)]
async fn publish_and_unpublish_wait_for_convergence() {
    let remote = FakeRemote::new().with_settle_ticks(2);
    remote.insert_disk(disk("vol-1", DiskStatus::Unattached, None));
    let controller = controller_over(&remote, &MemoryStore::new());
    let started = Instant::now();

    controller
        .publish_volume("vol-1", "node-a")
        .await
        .expect("attach converges");
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(
        remote.disk("vol-1").map(|found| found.status),
        Some(DiskStatus::Attached)
    );

    controller
        .unpublish_volume("vol-1", "node-a")
        .await
        .expect("detach converges");
    assert_eq!(remote.calls("attach_disk"), 1);
    assert_eq!(remote.calls("detach_disk"), 1);
    assert_eq!(
        remote.disk("vol-1").and_then(|found| found.attached_to),
        None
    );
}

#[tokio::test(start_paused = true)]
async fn publish_times_out_when_attach_never_converges() {
    let remote = FakeRemote::new().with_settle_ticks(u32::MAX);
    remote.insert_disk(disk("vol-1", DiskStatus::Unattached, None));
    let controller = controller_over(&remote, &MemoryStore::new());
    let started = Instant::now();

    let err = controller
        .publish_volume("vol-1", "node-a")
        .await
        .expect_err("deadline");

    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(started.elapsed(), Duration::from_secs(120));
    assert_eq!(remote.calls("attach_disk"), 1);
}

#[rstest]
#[case(DiskStatus::Attaching, Some("node-a"), Code::Aborted)]
#[case(DiskStatus::Attached, Some("node-b"), Code::FailedPrecondition)]
#[tokio::test]
async fn unpublish_rejects_conflicting_attachments(
    remote: FakeRemote,
    #[case] status: DiskStatus,
    #[case] owner: Option<&str>,
    #[case] expected: Code,
) {
    remote.insert_disk(disk("vol-1", status, owner));
    let controller = controller_over(&remote, &MemoryStore::new());

    let err = controller
        .unpublish_volume("vol-1", "node-a")
        .await
        .expect_err("conflict");

    assert_eq!(err.code(), expected);
    assert_eq!(remote.calls("detach_disk"), 0);
}

#[rstest]
#[tokio::test]
async fn unpublish_of_detached_volume_is_a_no_op(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Unattached, None));
    let controller = controller_over(&remote, &MemoryStore::new());

    controller
        .unpublish_volume("vol-1", "node-a")
        .await
        .expect("already detached");
    controller
        .unpublish_volume("vol-gone", "node-a")
        .await
        .expect("absent volume");

    assert_eq!(remote.calls("detach_disk"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn expand_resizes_only_when_growing(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let controller = controller_over(&remote, &MemoryStore::new());

    let unchanged = controller
        .expand_volume("vol-1", CapacityRange {
            required_bytes: 10 * GIB,
            limit_bytes: 0,
        })
        .await
        .expect("no growth");
    assert_eq!(unchanged.capacity_bytes, 20 * GIB);
    assert_eq!(remote.calls("resize_disk"), 0);

    let grown = controller
        .expand_volume("vol-1", CapacityRange {
            required_bytes: 30 * GIB,
            limit_bytes: 0,
        })
        .await
        .expect("growth");
    assert_eq!(grown.capacity_bytes, 30 * GIB);
    assert!(grown.node_expansion_required);
    assert_eq!(remote.calls("resize_disk"), 1);
}

#[rstest]
#[tokio::test]
async fn expand_of_missing_volume_is_not_found(remote: FakeRemote) {
    let controller = controller_over(&remote, &MemoryStore::new());

    let err = controller
        .expand_volume("vol-gone", CapacityRange::default())
        .await
        .expect_err("missing");

    assert_eq!(err.code(), Code::NotFound);
}

#[rstest]
#[tokio::test]
async fn concurrent_snapshot_creates_share_one_remote_create(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let controller = controller_over(&remote, &MemoryStore::new());

    let (first, second) = tokio::join!(
        controller.create_snapshot("nightly", "vol-1"),
        controller.create_snapshot("nightly", "vol-1"),
    );

    let first_id = first.expect("first create").snapshot_id;
    let second_id = second.expect("second create").snapshot_id;
    assert_eq!(first_id, second_id);
    assert_eq!(remote.calls("create_snapshot"), 1);
}

#[rstest]
#[tokio::test]
async fn snapshot_creation_reports_progress_until_ready(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let controller = controller_over(&remote, &MemoryStore::new());

    let submitted = controller
        .create_snapshot("nightly", "vol-1")
        .await
        .expect("submitted");
    assert!(!submitted.ready_to_use);
    assert_eq!(submitted.size_bytes, 20 * GIB);

    let refreshed = controller
        .create_snapshot("nightly", "vol-1")
        .await
        .expect("refreshed");
    assert!(refreshed.ready_to_use);
    assert_eq!(refreshed.snapshot_id, submitted.snapshot_id);
}

#[rstest]
#[tokio::test]
async fn snapshot_names_survive_a_restart(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let store = MemoryStore::new();
    let submitted = controller_over(&remote, &store)
        .create_snapshot("nightly", "vol-1")
        .await
        .expect("submitted");

    let restarted = controller_over(&remote, &store);
    assert_eq!(restarted.load_snapshots().expect("replay"), 1);
    let replayed = restarted
        .create_snapshot("nightly", "vol-1")
        .await
        .expect("replayed");

    assert_eq!(replayed.snapshot_id, submitted.snapshot_id);
    assert_eq!(remote.calls("create_snapshot"), 1);
}

#[rstest]
#[tokio::test]
async fn snapshot_name_reuse_for_other_volume_is_invalid(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    remote.insert_disk(disk("vol-2", DiskStatus::Unattached, None));
    let controller = controller_over(&remote, &MemoryStore::new());
    controller
        .create_snapshot("nightly", "vol-1")
        .await
        .expect("submitted");

    let err = controller
        .create_snapshot("nightly", "vol-2")
        .await
        .expect_err("name taken");

    assert_eq!(err.code(), Code::InvalidArgument);
}

#[rstest]
#[tokio::test]
async fn snapshot_of_missing_volume_is_not_found(remote: FakeRemote) {
    let controller = controller_over(&remote, &MemoryStore::new());

    let err = controller
        .create_snapshot("nightly", "vol-gone")
        .await
        .expect_err("missing source");

    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(remote.calls("create_snapshot"), 0);
}

#[rstest]
#[tokio::test]
async fn vanished_snapshot_is_recreated(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let controller = controller_over(&remote, &MemoryStore::new());
    let original = controller
        .create_snapshot("nightly", "vol-1")
        .await
        .expect("submitted");
    remote.forget_snapshot(&original.snapshot_id);

    let recreated = controller
        .create_snapshot("nightly", "vol-1")
        .await
        .expect("recreated");

    assert_ne!(recreated.snapshot_id, original.snapshot_id);
    assert_eq!(remote.calls("create_snapshot"), 2);
}

#[rstest]
#[tokio::test]
async fn delete_snapshot_is_idempotent(remote: FakeRemote) {
    remote.insert_disk(disk("vol-1", DiskStatus::Attached, Some("node-a")));
    let store = MemoryStore::new();
    let controller = controller_over(&remote, &store);
    let created = controller
        .create_snapshot("nightly", "vol-1")
        .await
        .expect("submitted");

    controller
        .delete_snapshot(&created.snapshot_id)
        .await
        .expect("delete");
    controller
        .delete_snapshot(&created.snapshot_id)
        .await
        .expect("repeat delete");

    assert_eq!(remote.calls("delete_snapshot"), 1);
    assert!(remote.snapshot(&created.snapshot_id).is_none());
    assert!(store.keys().is_empty());
}
