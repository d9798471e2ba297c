//! Binary entry point for the `volplane` CLI.
//!
//! Each invocation runs one operation and exits. The in-flight tracker and
//! the per-name snapshot locks live in the process, so they only collapse
//! concurrent work issued within one invocation; callers running several
//! invocations at once rely on the remote-side idempotency (name lookups,
//! state checks before every mutation) instead.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use volplane::types::zone_topology;
use volplane::{
    AccessType, CapacityRange, Code, ConfigError, ContentSource, ControllerError,
    ControllerSettings, CreateVolumeRequest, DeviceAssembler, DriverConfig, FileStore,
    MetadataError, NodeController, NodeError, NodeExpandRequest, NodePublishRequest,
    ProcessCommandRunner, RemoteError, ScalewayClient, StageRequest, SystemMounter,
    TopologyRequirement, VolumeCapability, VolumeController,
};

mod cli;

use cli::{
    AttachmentArgs, Cli, CreateVolumeCommand, NodeExpandCommand, NodePublishCommand,
    StageCommand,
};

type Controller = VolumeController<ScalewayClient, FileStore>;
type Node = NodeController<SystemMounter<ProcessCommandRunner>, ProcessCommandRunner>;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("remote client setup failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("metadata store unavailable: {0}")]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

impl CliError {
    const fn code(&self) -> Code {
        match self {
            Self::Config(_) => Code::InvalidArgument,
            Self::Controller(err) => err.code(),
            Self::Node(err) => err.code(),
            Self::Remote(_) | Self::Metadata(_) | Self::Render(_) => Code::Internal,
        }
    }
}

#[derive(Serialize)]
struct Empty {}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(rendered) => {
            writeln!(io::stdout(), "{rendered}").ok();
            0
        }
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<String, CliError> {
    match cli {
        Cli::CreateVolume(args) => {
            let request = create_volume_request(args);
            render(&controller()?.create_volume(&request).await?)
        }
        Cli::DeleteVolume(args) => {
            controller()?.delete_volume(&args.volume_id).await?;
            render(&Empty {})
        }
        Cli::ExpandVolume(args) => {
            let capacity = CapacityRange {
                required_bytes: args.required_bytes,
                limit_bytes: 0,
            };
            render(&controller()?.expand_volume(&args.volume_id, capacity).await?)
        }
        Cli::Publish(AttachmentArgs { volume_id, node_id }) => {
            controller()?.publish_volume(&volume_id, &node_id).await?;
            render(&Empty {})
        }
        Cli::Unpublish(AttachmentArgs { volume_id, node_id }) => {
            controller()?.unpublish_volume(&volume_id, &node_id).await?;
            render(&Empty {})
        }
        Cli::CreateSnapshot(args) => render(
            &controller()?
                .create_snapshot(&args.name, &args.source_volume_id)
                .await?,
        ),
        Cli::DeleteSnapshot(args) => {
            controller()?.delete_snapshot(&args.snapshot_id).await?;
            render(&Empty {})
        }
        Cli::Stage(args) => {
            node()?.stage(&stage_request(args))?;
            render(&Empty {})
        }
        Cli::Unstage(args) => {
            node()?.unstage(&args.volume_id, &Utf8PathBuf::from(args.staging_path))?;
            render(&Empty {})
        }
        Cli::NodePublish(args) => {
            node()?.publish(&node_publish_request(args))?;
            render(&Empty {})
        }
        Cli::NodeUnpublish(args) => {
            node()?.unpublish(&args.volume_id, &Utf8PathBuf::from(args.target_path))?;
            render(&Empty {})
        }
        Cli::NodeExpand(args) => {
            node()?.expand(&node_expand_request(args))?;
            render(&Empty {})
        }
        Cli::NodeInfo => render(&node()?.get_info()),
    }
}

fn controller() -> Result<Controller, CliError> {
    let config = DriverConfig::load_without_cli_args()?;
    let credentials = config.validate_controller()?;
    let client = ScalewayClient::new(
        config.api_url.clone(),
        credentials.secret_key,
        credentials.project_id,
        config.zone.clone(),
    )?;
    let store = FileStore::open(&config.metadata_dir)?;
    let controller = VolumeController::new(
        client,
        store,
        ControllerSettings::new(config.zone, config.default_disk_type),
    );
    controller.load_snapshots()?;
    Ok(controller)
}

fn node() -> Result<Node, CliError> {
    let config = DriverConfig::load_without_cli_args()?;
    let node_id = config.validate_node()?;
    Ok(NodeController::new(
        node_id,
        config.zone.clone(),
        config.device_locator(),
        DeviceAssembler::new(ProcessCommandRunner),
        SystemMounter::new(ProcessCommandRunner),
    ))
}

fn create_volume_request(args: CreateVolumeCommand) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: args.name,
        capacity: CapacityRange {
            required_bytes: args.required_bytes,
            limit_bytes: args.limit_bytes,
        },
        capabilities: vec![VolumeCapability::mount(args.fs_type)],
        parameters: args.parameters.into_iter().collect(),
        content_source: args.from_snapshot.map(|id| ContentSource::Snapshot { id }),
        topology: args.preferred_zone.map(|zone| TopologyRequirement {
            requisite: Vec::new(),
            preferred: vec![zone_topology(&zone)],
        }),
    }
}

fn mount_capability(fs_type: String, mount_flags: Vec<String>) -> VolumeCapability {
    VolumeCapability {
        access_type: AccessType::Mount {
            fs_type,
            mount_flags,
        },
        ..VolumeCapability::mount("")
    }
}

fn stage_request(args: StageCommand) -> StageRequest {
    StageRequest {
        volume_id: args.volume_id,
        staging_path: Utf8PathBuf::from(args.staging_path),
        capability: mount_capability(args.fs_type, args.mount_flags),
        context: args.context.into_iter().collect::<BTreeMap<_, _>>(),
    }
}

fn node_publish_request(args: NodePublishCommand) -> NodePublishRequest {
    NodePublishRequest {
        volume_id: args.volume_id,
        staging_path: Utf8PathBuf::from(args.staging_path),
        target_path: Utf8PathBuf::from(args.target_path),
        capability: mount_capability(String::new(), args.mount_flags),
        read_only: args.read_only,
    }
}

fn node_expand_request(args: NodeExpandCommand) -> NodeExpandRequest {
    NodeExpandRequest {
        volume_id: args.volume_id,
        volume_path: Utf8PathBuf::from(args.volume_path),
        staging_path: args.staging_path.map(Utf8PathBuf::from),
        context: args.context.into_iter().collect(),
    }
}

fn render<T: Serialize>(value: &T) -> Result<String, CliError> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{}: {err}", err.code()).ok();
}
