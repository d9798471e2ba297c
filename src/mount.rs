//! OS mount, format, and filesystem-resize primitives.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandRunner, failure, os_args, run_checked};

/// File system used when a mount capability leaves the type empty.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// `blkid` exit status for a device without a recognisable signature.
const BLKID_NO_SIGNATURE: i32 = 2;

/// Errors raised by mount primitives.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum MountError {
    /// The path sits on a crashed network or FUSE mount.
    #[error("transport endpoint for {path} is not connected")]
    Disconnected {
        /// Path that could not be inspected.
        path: Utf8PathBuf,
    },
    /// Inspecting a path or the mount table failed.
    #[error("cannot inspect {path}: {message}")]
    Io {
        /// Path being inspected.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// The requested file system has no formatter or resizer.
    #[error("unsupported file system type {fs_type}")]
    UnsupportedFilesystem {
        /// Requested type.
        fs_type: String,
    },
    /// A host command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// One line of the mount table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountEntry {
    /// Mounted device or source.
    pub source: String,
    /// File system type.
    pub fs_type: String,
    /// Mount options.
    pub options: Vec<String>,
}

/// Host mount operations used by the node controller.
pub trait Mounter: Send + Sync {
    /// Returns `true` when `path` is probably not a mount point. A missing
    /// path is reported as not mounted.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Disconnected`] for a stale network mount.
    fn is_likely_not_mount_point(&self, path: &Utf8Path) -> Result<bool, MountError>;

    /// Returns the mount table entry for `path`, if it is a mount point.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Io`] when the mount table cannot be read.
    fn mount_info(&self, path: &Utf8Path) -> Result<Option<MountEntry>, MountError>;

    /// Returns `true` when `mounted_source` refers to `device`.
    fn is_same_device(&self, mounted_source: &str, device: &Utf8Path) -> bool;

    /// Mounts `source` on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Command`] when `mount` fails.
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Unmounts `target`. A target that is not mounted is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Command`] when `umount` fails for another reason.
    fn unmount(&self, target: &Utf8Path) -> Result<(), MountError>;

    /// Formats `device` when it carries no file system, then mounts it.
    ///
    /// # Errors
    ///
    /// Returns [`MountError`] when probing, formatting, or mounting fails.
    fn format_and_mount(
        &self,
        device: &Utf8Path,
        target: &Utf8Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Grows the file system described by `entry` to fill its device.
    ///
    /// # Errors
    ///
    /// Returns [`MountError`] when the resize tool fails or the file system
    /// type has no resizer.
    fn resize_filesystem(&self, entry: &MountEntry, mount_path: &Utf8Path)
    -> Result<(), MountError>;
}

/// [`Mounter`] backed by host commands and `/proc/self/mounts`.
#[derive(Clone, Debug)]
pub struct SystemMounter<R> {
    runner: R,
    proc_dir: Utf8PathBuf,
}

impl<R: CommandRunner> SystemMounter<R> {
    /// Creates a mounter reading the mount table of the current process.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            proc_dir: Utf8PathBuf::from("/proc/self"),
        }
    }

    /// Reads the mount table from `<proc_dir>/mounts` instead.
    #[must_use]
    pub fn with_proc_dir(mut self, proc_dir: impl Into<Utf8PathBuf>) -> Self {
        self.proc_dir = proc_dir.into();
        self
    }

    fn read_mount_table(&self) -> Result<String, MountError> {
        let io_error = |err: io::Error| MountError::Io {
            path: self.proc_dir.join("mounts"),
            message: err.to_string(),
        };
        let dir = Dir::open_ambient_dir(&self.proc_dir, ambient_authority()).map_err(io_error)?;
        dir.read_to_string("mounts").map_err(io_error)
    }

    fn probe_filesystem(&self, device: &Utf8Path) -> Result<Option<String>, MountError> {
        let args = os_args(["-p", "-s", "TYPE", "-o", "value", device.as_str()]);
        let output = self.runner.run("blkid", &args)?;
        match output.code {
            Some(0) => {
                let fs_type = output.stdout.trim();
                Ok((!fs_type.is_empty()).then(|| fs_type.to_owned()))
            }
            Some(BLKID_NO_SIGNATURE) => Ok(None),
            _ => Err(failure("blkid", &args, &output).into()),
        }
    }

    fn format(&self, device: &Utf8Path, fs_type: &str) -> Result<(), MountError> {
        let (program, args) = match fs_type {
            "ext2" | "ext3" | "ext4" => (
                format!("mkfs.{fs_type}"),
                os_args(["-F", "-m0", device.as_str()]),
            ),
            "xfs" => (String::from("mkfs.xfs"), os_args(["-f", device.as_str()])),
            other => {
                return Err(MountError::UnsupportedFilesystem {
                    fs_type: other.to_owned(),
                });
            }
        };
        info!(device = %device, fs_type, "formatting device");
        run_checked(&self.runner, &program, &args)?;
        Ok(())
    }
}

fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Finds the last mount of `path` in a `/proc/mounts` formatted table.
#[must_use]
pub fn parse_mount_table(table: &str, path: &Utf8Path) -> Option<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            (Utf8Path::new(&unescape_mount_field(target)) == path).then(|| MountEntry {
                source: unescape_mount_field(source),
                fs_type: fs_type.to_owned(),
                options: options.split(',').map(str::to_owned).collect(),
            })
        })
        .last()
}

impl<R: CommandRunner> Mounter for SystemMounter<R> {
    fn is_likely_not_mount_point(&self, path: &Utf8Path) -> Result<bool, MountError> {
        let inspect = |target: &Utf8Path| {
            fs::metadata(target).map_err(|err| match err.kind() {
                io::ErrorKind::NotConnected => MountError::Disconnected {
                    path: path.to_path_buf(),
                },
                _ => MountError::Io {
                    path: target.to_path_buf(),
                    message: err.to_string(),
                },
            })
        };
        let meta = match inspect(path) {
            Ok(meta) => meta,
            Err(MountError::Io { .. }) if !path.exists() => return Ok(true),
            Err(err) => return Err(err),
        };
        if let Some(parent) = path.parent()
            && inspect(parent)?.dev() != meta.dev()
        {
            return Ok(false);
        }
        // Bind mounts share the parent's device; fall back to the table.
        Ok(self.mount_info(path)?.is_none())
    }

    fn mount_info(&self, path: &Utf8Path) -> Result<Option<MountEntry>, MountError> {
        Ok(parse_mount_table(&self.read_mount_table()?, path))
    }

    fn is_same_device(&self, mounted_source: &str, device: &Utf8Path) -> bool {
        let canonical = |raw: &str| {
            fs::canonicalize(raw).map_or_else(|_| raw.to_owned(), |resolved| {
                resolved.to_string_lossy().into_owned()
            })
        };
        canonical(mounted_source) == canonical(device.as_str())
    }

    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let mut args = Vec::new();
        if !fs_type.is_empty() {
            args.extend(os_args(["-t", fs_type]));
        }
        if !options.is_empty() {
            args.extend(os_args([String::from("-o"), options.join(",")]));
        }
        args.extend(os_args([source, target.as_str()]));
        run_checked(&self.runner, "mount", &args)?;
        debug!(source, target = %target, fs_type, "mounted");
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<(), MountError> {
        let args = os_args([target.as_str()]);
        let output = self.runner.run("umount", &args)?;
        if output.is_success() {
            debug!(target = %target, "unmounted");
            return Ok(());
        }
        if output.stderr.contains("not mounted") {
            warn!(target = %target, "target was not mounted");
            return Ok(());
        }
        Err(failure("umount", &args, &output).into())
    }

    fn format_and_mount(
        &self,
        device: &Utf8Path,
        target: &Utf8Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let requested = if fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            fs_type
        };
        let existing = self.probe_filesystem(device)?;
        let mount_type = match existing {
            Some(found) => {
                if found != requested {
                    warn!(device = %device, found, requested, "keeping existing file system");
                }
                found
            }
            None => {
                self.format(device, requested)?;
                requested.to_owned()
            }
        };
        self.mount(device.as_str(), target, &mount_type, options)
    }

    fn resize_filesystem(
        &self,
        entry: &MountEntry,
        mount_path: &Utf8Path,
    ) -> Result<(), MountError> {
        let (program, args) = match entry.fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => ("resize2fs", os_args([entry.source.as_str()])),
            "xfs" => ("xfs_growfs", os_args([mount_path.as_str()])),
            other => {
                return Err(MountError::UnsupportedFilesystem {
                    fs_type: other.to_owned(),
                });
            }
        };
        run_checked(&self.runner, program, &args)?;
        info!(device = %entry.source, fs_type = %entry.fs_type, "file system resized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;
    use tempfile::TempDir;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/sdb /var/lib/staging/pvc-1/globalmount ext4 rw,relatime 0 0
/dev/sdb /var/lib/pods/a\\040b/mount ext4 rw,relatime 0 0
";

    #[rstest]
    #[case("/var/lib/staging/pvc-1/globalmount", Some("/dev/sdb"))]
    #[case("/var/lib/pods/a b/mount", Some("/dev/sdb"))]
    #[case("/var/lib/staging/pvc-2/globalmount", None)]
    fn parses_mount_table(#[case] path: &str, #[case] source: Option<&str>) {
        let entry = parse_mount_table(TABLE, Utf8Path::new(path));
        assert_eq!(entry.as_ref().map(|found| found.source.as_str()), source);
    }

    fn mounter_with_table(
        tmp: &TempDir,
        table: &str,
    ) -> (SystemMounter<ScriptedRunner>, ScriptedRunner) {
        let proc_dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
        fs::write(proc_dir.join("mounts"), table).expect("write table");
        let runner = ScriptedRunner::new();
        (
            SystemMounter::new(runner.clone()).with_proc_dir(proc_dir),
            runner,
        )
    }

    #[test]
    fn format_and_mount_formats_blank_devices() {
        let tmp = TempDir::new().expect("tempdir");
        let (mounter, runner) = mounter_with_table(&tmp, "");
        runner.push_output(Some(2), "", "");
        runner.push_success();
        runner.push_success();

        mounter
            .format_and_mount(
                Utf8Path::new("/dev/sdb"),
                Utf8Path::new("/staging"),
                "",
                &[String::from("noatime")],
            )
            .expect("format and mount");

        assert_eq!(
            runner.commands(),
            vec![
                "blkid -p -s TYPE -o value /dev/sdb",
                "mkfs.ext4 -F -m0 /dev/sdb",
                "mount -t ext4 -o noatime /dev/sdb /staging",
            ]
        );
    }

    #[test]
    fn format_and_mount_keeps_existing_file_system() {
        let tmp = TempDir::new().expect("tempdir");
        let (mounter, runner) = mounter_with_table(&tmp, "");
        runner.push_stdout("xfs\n");
        runner.push_success();

        mounter
            .format_and_mount(Utf8Path::new("/dev/sdb"), Utf8Path::new("/staging"), "ext4", &[])
            .expect("mount");

        assert_eq!(
            runner.commands(),
            vec![
                "blkid -p -s TYPE -o value /dev/sdb",
                "mount -t xfs /dev/sdb /staging",
            ]
        );
    }

    #[test]
    fn unmount_tolerates_targets_that_are_not_mounted() {
        let tmp = TempDir::new().expect("tempdir");
        let (mounter, runner) = mounter_with_table(&tmp, "");
        runner.push_failure(32, "umount: /target: not mounted.");

        mounter
            .unmount(Utf8Path::new("/target"))
            .expect("not mounted is success");
    }

    #[test]
    fn unmount_surfaces_busy_targets() {
        let tmp = TempDir::new().expect("tempdir");
        let (mounter, runner) = mounter_with_table(&tmp, "");
        runner.push_failure(32, "umount: /target: target is busy.");

        let err = mounter
            .unmount(Utf8Path::new("/target"))
            .expect_err("busy target");
        assert!(matches!(err, MountError::Command(CommandError::Failed { .. })));
    }

    #[test]
    fn bind_mount_is_detected_from_the_table() {
        let tmp = TempDir::new().expect("tempdir");
        let target = tmp.path().join("target");
        fs::create_dir(&target).expect("mkdir");
        let target_path = Utf8PathBuf::from_path_buf(target).expect("utf8 path");
        let table = format!("/dev/sdb {target_path} ext4 rw 0 0\n");
        let (mounter, _runner) = mounter_with_table(&tmp, &table);

        assert!(!mounter
            .is_likely_not_mount_point(&target_path)
            .expect("inspect"));
        assert!(mounter
            .is_likely_not_mount_point(&target_path.join("missing"))
            .expect("missing path"));
    }

    #[rstest]
    #[case("ext4", "resize2fs /dev/sdb")]
    #[case("xfs", "xfs_growfs /mnt/data")]
    fn resize_picks_tool_by_file_system(#[case] fs_type: &str, #[case] expected: &str) {
        let tmp = TempDir::new().expect("tempdir");
        let (mounter, runner) = mounter_with_table(&tmp, "");
        runner.push_success();
        let entry = MountEntry {
            source: String::from("/dev/sdb"),
            fs_type: fs_type.to_owned(),
            options: Vec::new(),
        };

        mounter
            .resize_filesystem(&entry, Utf8Path::new("/mnt/data"))
            .expect("resize");

        assert_eq!(runner.commands(), vec![expected]);
    }
}
