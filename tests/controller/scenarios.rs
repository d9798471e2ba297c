//! BDD scenarios for the volume controller.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ControllerContext, controller_context};

#[scenario(
    path = "tests/features/controller.feature",
    name = "Create a volume with the default disk type"
)]
fn scenario_create_default_type(controller_context: ControllerContext) {
    drop(controller_context);
}

#[scenario(
    path = "tests/features/controller.feature",
    name = "Delete a volume the remote service no longer knows"
)]
fn scenario_delete_absent(controller_context: ControllerContext) {
    drop(controller_context);
}

#[scenario(
    path = "tests/features/controller.feature",
    name = "Publish a volume already attached to the node"
)]
fn scenario_publish_attached(controller_context: ControllerContext) {
    drop(controller_context);
}

#[scenario(
    path = "tests/features/controller.feature",
    name = "Publish a volume attached to another node"
)]
fn scenario_publish_elsewhere(controller_context: ControllerContext) {
    drop(controller_context);
}

#[scenario(
    path = "tests/features/controller.feature",
    name = "Snapshot names survive a controller restart"
)]
fn scenario_snapshot_restart(controller_context: ControllerContext) {
    drop(controller_context);
}
