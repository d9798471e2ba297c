//! Software RAID assembly through `mdadm`.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use super::{AssemblyError, Layout, RaidLevel, device_args};
use crate::command::{CommandRunner, os_args, run_checked};

const MD_DIR: &str = "/dev/md";

/// Returns `/dev/md/<name>`, creating the array unless the scan lists it.
pub(super) fn assemble<R: CommandRunner + ?Sized>(
    runner: &R,
    name: &str,
    level: RaidLevel,
    devices: &[Utf8PathBuf],
) -> Result<Utf8PathBuf, AssemblyError> {
    let array = Utf8Path::new(MD_DIR).join(name);

    let scan = run_checked(runner, "mdadm", &os_args(["--detail", "--scan"]))?;
    if lists_array(&scan.stdout, &array) {
        debug!(array = %array, "array already assembled");
        return Ok(array);
    }

    let minimum = level.min_members();
    if devices.len() < minimum {
        return Err(AssemblyError::TooFewMembers {
            level: Layout::Raid(level),
            minimum,
            count: devices.len(),
        });
    }

    let mut args = os_args([
        String::from("--create"),
        array.to_string(),
        String::from("--run"),
        format!("--level={}", level.mdadm_level()),
        format!("--raid-devices={}", devices.len()),
    ]);
    args.extend(os_args(device_args(devices)));
    run_checked(runner, "mdadm", &args)?;
    info!(array = %array, members = devices.len(), "created raid array");
    Ok(array)
}

/// Matches the device token of `ARRAY <device> ...` scan lines exactly.
fn lists_array(scan: &str, array: &Utf8Path) -> bool {
    scan.lines().any(|line| {
        let mut tokens = line.split_whitespace();
        tokens.next() == Some("ARRAY") && tokens.next() == Some(array.as_str())
    })
}
