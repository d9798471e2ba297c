//! Volume group aggregation through the LVM tools.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use super::{AssemblyError, LvmMode, device_args};
use crate::command::{CommandRunner, failure, os_args, run_checked};

const LV_NAME: &str = "data";

/// `lvextend` messages meaning the volume already fills the group.
const ALREADY_EXTENDED: [&str; 2] = ["matches existing size", "not larger than existing size"];

/// Device-mapper path of `<group>/<volume>`; dashes inside names are doubled.
pub(super) fn mapper_path(group: &str, volume: &str) -> Utf8PathBuf {
    Utf8Path::new("/dev/mapper").join(format!(
        "{}-{}",
        group.replace('-', "--"),
        volume.replace('-', "--")
    ))
}

/// Returns the mapper path of `<name>/data`, creating the group and volume
/// as needed. An existing volume is only activated.
pub(super) fn assemble<R: CommandRunner + ?Sized>(
    runner: &R,
    name: &str,
    mode: LvmMode,
    devices: &[Utf8PathBuf],
) -> Result<Utf8PathBuf, AssemblyError> {
    let volume = format!("{name}/{LV_NAME}");
    let mapper = mapper_path(name, LV_NAME);

    let existing = runner.run(
        "lvs",
        &os_args(["--noheadings", "-o", "lv_name", volume.as_str()]),
    )?;
    if existing.is_success() {
        run_checked(runner, "lvchange", &os_args(["-ay", volume.as_str()]))?;
        debug!(volume, "logical volume already exists, activated");
        return Ok(mapper);
    }

    let group = runner.run("vgs", &os_args(["--noheadings", name]))?;
    if group.is_success() {
        debug!(group = name, "volume group already exists");
    } else {
        for device in devices {
            run_checked(runner, "pvcreate", &os_args([device.as_str()]))?;
        }
        let mut args = os_args([name]);
        args.extend(os_args(device_args(devices)));
        run_checked(runner, "vgcreate", &args)?;
    }

    let mut args = os_args(["-y", "-l", "100%FREE", "-n", LV_NAME]);
    if mode == LvmMode::Striped {
        args.extend(os_args([String::from("-i"), devices.len().to_string()]));
    }
    args.extend(os_args([name]));
    run_checked(runner, "lvcreate", &args)?;
    info!(volume, mapper = %mapper, ?mode, "created logical volume");
    Ok(mapper)
}

/// Grows every physical volume, then extends the logical volume into the
/// freed extents.
pub(super) fn expand<R: CommandRunner + ?Sized>(
    runner: &R,
    name: &str,
    devices: &[Utf8PathBuf],
) -> Result<(), AssemblyError> {
    for device in devices {
        run_checked(runner, "pvresize", &os_args([device.as_str()]))?;
    }

    let volume = format!("{name}/{LV_NAME}");
    let args = os_args(["-l", "+100%FREE", volume.as_str()]);
    let output = runner.run("lvextend", &args)?;
    if output.is_success() {
        info!(volume, "logical volume extended");
        return Ok(());
    }
    if ALREADY_EXTENDED
        .iter()
        .any(|message| output.stderr.contains(message))
    {
        debug!(volume, "logical volume already uses every extent");
        return Ok(());
    }
    Err(failure("lvextend", &args, &output).into())
}
