//! BDD step definitions for volume controller behaviour.

use rstest_bdd_macros::{given, then, when};
use volplane::{CapacityRange, ControllerError, CreateVolumeRequest, VolumeCapability};

use super::test_helpers::{ControllerContext, Outcome, attached_disk};

const GIB: u64 = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn failure(err: &ControllerError) -> Outcome {
    Outcome::Failure(err.code(), err.to_string())
}

#[given("a remote service with no volumes")]
fn empty_remote(controller_context: &ControllerContext) {
    assert!(controller_context.remote.disk("vol-0001").is_none());
}

#[given("volume \"{volume_id}\" is attached to node \"{node_id}\"")]
fn attached_volume(controller_context: &ControllerContext, volume_id: String, node_id: String) {
    controller_context
        .remote
        .insert_disk(attached_disk(volume_id.trim(), node_id.trim()));
}

#[when("I create volume \"{name}\" requesting {gib:u32} GiB")]
fn create_volume(controller_context: &ControllerContext, name: String, gib: u32) {
    let request = CreateVolumeRequest {
        name,
        capacity: CapacityRange {
            required_bytes: u64::from(gib) * GIB,
            limit_bytes: 0,
        },
        capabilities: vec![VolumeCapability::mount("ext4")],
        ..CreateVolumeRequest::default()
    };
    let controller = controller_context.controller.borrow();
    let outcome = match controller_context
        .runtime
        .block_on(controller.create_volume(&request))
    {
        Ok(_) => Outcome::Success,
        Err(err) => failure(&err),
    };
    controller_context.record(outcome);
}

#[when("I delete volume \"{volume_id}\"")]
fn delete_volume(controller_context: &ControllerContext, volume_id: String) {
    let controller = controller_context.controller.borrow();
    let outcome = match controller_context
        .runtime
        .block_on(controller.delete_volume(&volume_id))
    {
        Ok(()) => Outcome::Success,
        Err(err) => failure(&err),
    };
    controller_context.record(outcome);
}

#[when("I publish volume \"{volume_id}\" to node \"{node_id}\"")]
fn publish_volume(controller_context: &ControllerContext, volume_id: String, node_id: String) {
    let controller = controller_context.controller.borrow();
    let outcome = match controller_context
        .runtime
        .block_on(controller.publish_volume(&volume_id, &node_id))
    {
        Ok(()) => Outcome::Success,
        Err(err) => failure(&err),
    };
    controller_context.record(outcome);
}

#[when("I create snapshot \"{name}\" of volume \"{volume_id}\"")]
fn create_snapshot(controller_context: &ControllerContext, name: String, volume_id: String) {
    let controller = controller_context.controller.borrow();
    let outcome = match controller_context
        .runtime
        .block_on(controller.create_snapshot(&name, &volume_id))
    {
        Ok(snapshot) => Outcome::Snapshot(snapshot),
        Err(err) => failure(&err),
    };
    controller_context.record(outcome);
}

#[when("the controller restarts")]
fn controller_restarts(controller_context: &ControllerContext) {
    controller_context.restart();
}

fn current(controller_context: &ControllerContext) -> Result<Outcome, StepError> {
    controller_context
        .outcome
        .borrow()
        .clone()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

#[then("the request succeeds")]
fn request_succeeds(controller_context: &ControllerContext) -> Result<(), StepError> {
    match current(controller_context)? {
        Outcome::Success | Outcome::Snapshot(_) => Ok(()),
        Outcome::Failure(code, message) => Err(StepError::Assertion(format!(
            "expected success, got {code}: {message}"
        ))),
    }
}

#[then("the request fails with \"{code}\"")]
fn request_fails(controller_context: &ControllerContext, code: String) -> Result<(), StepError> {
    match current(controller_context)? {
        Outcome::Failure(actual, _) if actual.as_str() == code.trim() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected failure {code}, got {other:?}"
        ))),
    }
}

#[then("{count:u32} \"{operation}\" calls were issued")]
fn calls_issued(
    controller_context: &ControllerContext,
    count: u32,
    operation: String,
) -> Result<(), StepError> {
    let actual = controller_context.remote.calls(operation.trim());
    if actual == count as usize {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} {operation} calls, got {actual}"
        )))
    }
}

#[then("the remote received {count:u32} creation of {gib:u32} GiB with disk type \"{disk_type}\"")]
fn creation_received(
    controller_context: &ControllerContext,
    count: u32,
    gib: u32,
    disk_type: String,
) -> Result<(), StepError> {
    let requests = controller_context.remote.create_requests();
    if requests.len() != count as usize {
        return Err(StepError::Assertion(format!(
            "expected {count} creations, got {requests:?}"
        )));
    }
    let matches = requests
        .iter()
        .all(|request| request.size_gib == u64::from(gib) && request.disk_type == disk_type.trim());
    if matches {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected creation requests: {requests:?}"
        )))
    }
}

#[then("the snapshot is ready to use")]
fn snapshot_ready(controller_context: &ControllerContext) -> Result<(), StepError> {
    match current(controller_context)? {
        Outcome::Snapshot(snapshot) if snapshot.ready_to_use => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a ready snapshot, got {other:?}"
        ))),
    }
}
