//! Test doubles shared across unit and behavioural tests.
//!
//! [`ScriptedRunner`] replays queued command outputs, [`FakeRemote`] emulates
//! the eventually consistent storage service in memory, and [`FakeMounter`]
//! keeps a mount table instead of touching the host.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::mount::{MountEntry, MountError, Mounter};
use crate::remote::{
    DiskRequest, DiskStatus, RemoteClient, RemoteDisk, RemoteError, RemoteFuture, RemoteSnapshot,
    SnapshotStatus,
};

const GIB: u64 = 1 << 30;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Clones share the queue and the invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len().saturating_add(1));
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Returns the recorded invocations rendered as command strings.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
struct PendingDisk {
    status: DiskStatus,
    attached_to: Option<String>,
    size_gib: u64,
    ticks: u32,
}

#[derive(Debug, Default)]
struct RemoteState {
    disks: BTreeMap<String, RemoteDisk>,
    pending_disks: BTreeMap<String, PendingDisk>,
    snapshots: BTreeMap<String, RemoteSnapshot>,
    pending_snapshots: BTreeMap<String, u32>,
    calls: BTreeMap<String, usize>,
    create_requests: Vec<DiskRequest>,
    failures: BTreeMap<String, VecDeque<RemoteError>>,
    next_id: u64,
}

impl RemoteState {
    fn record(&mut self, operation: &str) -> Result<(), RemoteError> {
        *self.calls.entry(operation.to_owned()).or_default() += 1;
        match self
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id = self.next_id.saturating_add(1);
        format!("{prefix}-{:04}", self.next_id)
    }

    fn advance_disk(&mut self, id: &str) {
        let Some(pending) = self.pending_disks.get_mut(id) else {
            return;
        };
        if pending.ticks > 0 {
            pending.ticks -= 1;
            return;
        }
        let settled = pending.clone();
        self.pending_disks.remove(id);
        if let Some(disk) = self.disks.get_mut(id) {
            disk.status = settled.status;
            disk.attached_to = settled.attached_to;
            disk.size_gib = settled.size_gib;
        }
    }

    fn advance_snapshot(&mut self, id: &str) {
        let Some(ticks) = self.pending_snapshots.get_mut(id) else {
            return;
        };
        if *ticks > 0 {
            *ticks -= 1;
            return;
        }
        self.pending_snapshots.remove(id);
        if let Some(snapshot) = self.snapshots.get_mut(id) {
            snapshot.status = SnapshotStatus::Normal;
            snapshot.percent = 100;
        }
    }
}

/// In-memory storage service with configurable convergence delay.
///
/// Every mutating call leaves the resource in a transitional state that
/// settles after `settle_ticks` further describe calls. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
    settle_ticks: u32,
}

impl FakeRemote {
    /// Creates a service whose resources settle on the first describe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `ticks` describe calls before a transition settles.
    #[must_use]
    pub const fn with_settle_ticks(mut self, ticks: u32) -> Self {
        self.settle_ticks = ticks;
        self
    }

    /// Seeds an existing disk.
    pub fn insert_disk(&self, disk: RemoteDisk) {
        locked(&self.state).disks.insert(disk.id.clone(), disk);
    }

    /// Seeds an existing snapshot.
    pub fn insert_snapshot(&self, snapshot: RemoteSnapshot) {
        locked(&self.state)
            .snapshots
            .insert(snapshot.id.clone(), snapshot);
    }

    /// Removes a snapshot behind the controller's back.
    pub fn forget_snapshot(&self, id: &str) {
        locked(&self.state).snapshots.remove(id);
    }

    /// Queues an error returned by the next call to `operation`.
    pub fn fail_next(&self, operation: &str, err: RemoteError) {
        locked(&self.state)
            .failures
            .entry(operation.to_owned())
            .or_default()
            .push_back(err);
    }

    /// Current state of a disk, without advancing any transition.
    #[must_use]
    pub fn disk(&self, id: &str) -> Option<RemoteDisk> {
        locked(&self.state).disks.get(id).cloned()
    }

    /// Current state of a snapshot, without advancing any transition.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<RemoteSnapshot> {
        locked(&self.state).snapshots.get(id).cloned()
    }

    /// Number of calls made to `operation` (for example `"attach_disk"`).
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        locked(&self.state)
            .calls
            .get(operation)
            .copied()
            .unwrap_or_default()
    }

    /// Creation requests received so far.
    #[must_use]
    pub fn create_requests(&self) -> Vec<DiskRequest> {
        locked(&self.state).create_requests.clone()
    }

    fn with_state<T>(
        &self,
        operation: &str,
        apply: impl FnOnce(&mut RemoteState) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut state = locked(&self.state);
        state.record(operation)?;
        apply(&mut state)
    }

    fn rejected(operation: &str, message: impl Into<String>) -> RemoteError {
        RemoteError::Rejected {
            operation: operation.to_owned(),
            message: message.into(),
        }
    }
}

impl RemoteClient for FakeRemote {
    fn create_disk<'a>(&'a self, request: &'a DiskRequest) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let ticks = self.settle_ticks;
            self.with_state("create_disk", |state| {
                state.create_requests.push(request.clone());
                if let Some(existing) = state
                    .disks
                    .values()
                    .find(|disk| disk.name == request.client_token)
                {
                    return Ok(existing.id.clone());
                }
                let id = state.allocate_id("vol");
                state.disks.insert(
                    id.clone(),
                    RemoteDisk {
                        id: id.clone(),
                        name: request.client_token.clone(),
                        status: DiskStatus::Creating,
                        attached_to: None,
                        size_gib: request.size_gib,
                        zone: request.zone.clone(),
                    },
                );
                state.pending_disks.insert(
                    id.clone(),
                    PendingDisk {
                        status: DiskStatus::Unattached,
                        attached_to: None,
                        size_gib: request.size_gib,
                        ticks,
                    },
                );
                Ok(id)
            })
        })
    }

    fn describe_disks<'a>(&'a self, ids: &'a [String]) -> RemoteFuture<'a, Vec<RemoteDisk>> {
        Box::pin(async move {
            self.with_state("describe_disks", |state| {
                let mut found = Vec::new();
                for id in ids {
                    state.advance_disk(id);
                    if let Some(disk) = state.disks.get(id) {
                        found.push(disk.clone());
                    }
                }
                Ok(found)
            })
        })
    }

    fn delete_disk<'a>(&'a self, id: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("delete_disk", |state| {
                match state.disks.get(id) {
                    None => return Err(Self::rejected("delete_disk", format!("{id} not found"))),
                    Some(disk) if disk.attached_to.is_some() => {
                        return Err(Self::rejected("delete_disk", format!("{id} is in use")));
                    }
                    Some(_) => {}
                }
                state.disks.remove(id);
                state.pending_disks.remove(id);
                Ok(())
            })
        })
    }

    fn attach_disk<'a>(&'a self, id: &'a str, node_id: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let ticks = self.settle_ticks;
            self.with_state("attach_disk", |state| {
                let Some(disk) = state.disks.get_mut(id) else {
                    return Err(Self::rejected("attach_disk", format!("{id} not found")));
                };
                if let Some(owner) = disk.attached_to.as_deref()
                    && owner != node_id
                {
                    return Err(Self::rejected("attach_disk", format!("{id} attached to {owner}")));
                }
                disk.status = DiskStatus::Attaching;
                disk.attached_to = Some(node_id.to_owned());
                let size_gib = disk.size_gib;
                state.pending_disks.insert(
                    id.to_owned(),
                    PendingDisk {
                        status: DiskStatus::Attached,
                        attached_to: Some(node_id.to_owned()),
                        size_gib,
                        ticks,
                    },
                );
                Ok(())
            })
        })
    }

    fn detach_disk<'a>(&'a self, id: &'a str, node_id: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let ticks = self.settle_ticks;
            self.with_state("detach_disk", |state| {
                let Some(disk) = state.disks.get_mut(id) else {
                    return Ok(());
                };
                if disk.attached_to.as_deref() != Some(node_id) {
                    return Ok(());
                }
                disk.status = DiskStatus::Detaching;
                let size_gib = disk.size_gib;
                state.pending_disks.insert(
                    id.to_owned(),
                    PendingDisk {
                        status: DiskStatus::Unattached,
                        attached_to: None,
                        size_gib,
                        ticks,
                    },
                );
                Ok(())
            })
        })
    }

    fn resize_disk<'a>(&'a self, id: &'a str, size_gib: u64) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let ticks = self.settle_ticks;
            self.with_state("resize_disk", |state| {
                let Some(disk) = state.disks.get(id) else {
                    return Err(Self::rejected("resize_disk", format!("{id} not found")));
                };
                let pending = PendingDisk {
                    status: disk.status.clone(),
                    attached_to: disk.attached_to.clone(),
                    size_gib,
                    ticks,
                };
                state.pending_disks.insert(id.to_owned(), pending);
                Ok(())
            })
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        source_id: &'a str,
        name: &'a str,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            // Let a concurrent caller interleave between lookup and create.
            tokio::task::yield_now().await;
            let ticks = self.settle_ticks;
            self.with_state("create_snapshot", |state| {
                let Some(source) = state.disks.get(source_id) else {
                    return Err(Self::rejected("create_snapshot", format!("{source_id} not found")));
                };
                let size_bytes = source.size_gib.saturating_mul(GIB);
                let id = state.allocate_id("snap");
                state.snapshots.insert(
                    id.clone(),
                    RemoteSnapshot {
                        id: id.clone(),
                        name: name.to_owned(),
                        source_disk_id: source_id.to_owned(),
                        status: SnapshotStatus::Creating,
                        percent: 0,
                        size_bytes,
                        created_at: Some(String::from("2026-01-01T00:00:00Z")),
                    },
                );
                state.pending_snapshots.insert(id.clone(), ticks);
                Ok(id)
            })
        })
    }

    fn describe_snapshots<'a>(
        &'a self,
        ids: &'a [String],
    ) -> RemoteFuture<'a, Vec<RemoteSnapshot>> {
        Box::pin(async move {
            self.with_state("describe_snapshots", |state| {
                let mut found = Vec::new();
                for id in ids {
                    state.advance_snapshot(id);
                    if let Some(snapshot) = state.snapshots.get(id) {
                        found.push(snapshot.clone());
                    }
                }
                Ok(found)
            })
        })
    }

    fn delete_snapshot<'a>(&'a self, id: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("delete_snapshot", |state| {
                state.snapshots.remove(id);
                state.pending_snapshots.remove(id);
                Ok(())
            })
        })
    }

    fn bind_snapshot_policy<'a>(
        &'a self,
        _policy_id: &'a str,
        _disk_id: &'a str,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move { self.with_state("bind_snapshot_policy", |_| Ok(())) })
    }
}

#[derive(Debug, Default)]
struct MountTable {
    entries: BTreeMap<Utf8PathBuf, MountEntry>,
    disconnected: BTreeSet<Utf8PathBuf>,
    calls: Vec<String>,
}

/// Mount primitives backed by an in-memory table. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct FakeMounter {
    table: Arc<Mutex<MountTable>>,
}

impl FakeMounter {
    /// Creates an empty mount table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an existing mount.
    pub fn insert_mount(&self, target: &Utf8Path, source: &str, fs_type: &str) {
        locked(&self.table).entries.insert(
            target.to_path_buf(),
            MountEntry {
                source: source.to_owned(),
                fs_type: fs_type.to_owned(),
                options: Vec::new(),
            },
        );
    }

    /// Makes `target` report a disconnected transport endpoint.
    pub fn mark_disconnected(&self, target: &Utf8Path) {
        locked(&self.table)
            .disconnected
            .insert(target.to_path_buf());
    }

    /// Mount recorded at `target`.
    #[must_use]
    pub fn mounted(&self, target: &Utf8Path) -> Option<MountEntry> {
        locked(&self.table).entries.get(target).cloned()
    }

    /// Every mutating call, rendered as `<operation> <args...>`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.table).calls.clone()
    }

    /// Number of mount and format-and-mount calls.
    #[must_use]
    pub fn mount_calls(&self) -> usize {
        locked(&self.table)
            .calls
            .iter()
            .filter(|call| call.starts_with("mount ") || call.starts_with("format_and_mount "))
            .count()
    }
}

impl Mounter for FakeMounter {
    fn is_likely_not_mount_point(&self, path: &Utf8Path) -> Result<bool, MountError> {
        let table = locked(&self.table);
        if table.disconnected.contains(path) {
            return Err(MountError::Disconnected {
                path: path.to_path_buf(),
            });
        }
        Ok(!table.entries.contains_key(path))
    }

    fn mount_info(&self, path: &Utf8Path) -> Result<Option<MountEntry>, MountError> {
        Ok(locked(&self.table).entries.get(path).cloned())
    }

    fn is_same_device(&self, mounted_source: &str, device: &Utf8Path) -> bool {
        mounted_source == device.as_str()
    }

    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let mut table = locked(&self.table);
        table.calls.push(format!(
            "mount {source} {target} {fs_type} {}",
            options.join(",")
        ));
        let fs = table
            .entries
            .get(Utf8Path::new(source))
            .map_or_else(|| fs_type.to_owned(), |entry| entry.fs_type.clone());
        let device = table
            .entries
            .get(Utf8Path::new(source))
            .map_or_else(|| source.to_owned(), |entry| entry.source.clone());
        table.entries.insert(
            target.to_path_buf(),
            MountEntry {
                source: device,
                fs_type: fs,
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<(), MountError> {
        let mut table = locked(&self.table);
        table.calls.push(format!("unmount {target}"));
        table.entries.remove(target);
        table.disconnected.remove(target);
        Ok(())
    }

    fn format_and_mount(
        &self,
        device: &Utf8Path,
        target: &Utf8Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let mut table = locked(&self.table);
        table.calls.push(format!("format_and_mount {device} {target} {fs_type}"));
        table.entries.insert(
            target.to_path_buf(),
            MountEntry {
                source: device.to_string(),
                fs_type: fs_type.to_owned(),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    fn resize_filesystem(
        &self,
        entry: &MountEntry,
        mount_path: &Utf8Path,
    ) -> Result<(), MountError> {
        locked(&self.table).calls.push(format!(
            "resize {} {mount_path} {}",
            entry.source, entry.fs_type
        ));
        Ok(())
    }
}
