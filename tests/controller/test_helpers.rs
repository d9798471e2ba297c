//! Shared fixtures for volume controller BDD scenarios.

use std::cell::RefCell;

use rstest::fixture;
use tokio::runtime::Runtime;
use volplane::remote::{DiskStatus, RemoteDisk};
use volplane::test_support::FakeRemote;
use volplane::{Code, ControllerSettings, MemoryStore, Snapshot, VolumeController};

pub type Controller = VolumeController<FakeRemote, MemoryStore>;

#[derive(Clone, Debug)]
pub enum Outcome {
    Success,
    Snapshot(Snapshot),
    Failure(Code, String),
}

pub struct ControllerContext {
    pub runtime: Runtime,
    pub remote: FakeRemote,
    pub store: MemoryStore,
    pub controller: RefCell<Controller>,
    pub outcome: RefCell<Option<Outcome>>,
}

impl ControllerContext {
    pub fn restart(&self) {
        let restarted = build_controller(&self.remote, &self.store);
        restarted
            .load_snapshots()
            .unwrap_or_else(|err| panic!("snapshot replay should succeed: {err}"));
        self.controller.replace(restarted);
    }

    pub fn record(&self, outcome: Outcome) {
        self.outcome.replace(Some(outcome));
    }
}

#[fixture]
pub fn controller_context() -> ControllerContext {
    let runtime =
        Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start: {err}"));
    let remote = FakeRemote::new();
    let store = MemoryStore::new();
    let controller = build_controller(&remote, &store);
    ControllerContext {
        runtime,
        remote,
        store,
        controller: RefCell::new(controller),
        outcome: RefCell::new(None),
    }
}

fn build_controller(remote: &FakeRemote, store: &MemoryStore) -> Controller {
    VolumeController::new(
        remote.clone(),
        store.clone(),
        ControllerSettings::new("fr-par-1", "sbs_5k"),
    )
}

pub fn attached_disk(id: &str, node_id: &str) -> RemoteDisk {
    RemoteDisk {
        id: id.to_owned(),
        name: format!("pvc-{id}"),
        status: DiskStatus::Attached,
        attached_to: Some(node_id.to_owned()),
        size_gib: 20,
        zone: String::from("fr-par-1"),
    }
}
