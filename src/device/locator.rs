//! Resolves remote disk identifiers to kernel block devices.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised while locating a device.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LocateError {
    /// No symlink exists for the disk yet; the attach has not propagated.
    #[error("disk {disk_id} not found at {link}")]
    DiskNotFound {
        /// Remote disk identifier.
        disk_id: String,
        /// Expected symlink path.
        link: Utf8PathBuf,
    },
    /// The stable path exists but is not a symlink.
    #[error("{link} is not a symlink")]
    NotASymlink {
        /// Offending path.
        link: Utf8PathBuf,
    },
    /// The symlink resolves outside the device namespace.
    #[error("{link} resolves to {target}, outside {device_root}")]
    OutsideNamespace {
        /// Symlink path.
        link: Utf8PathBuf,
        /// Resolved target.
        target: String,
        /// Expected namespace.
        device_root: Utf8PathBuf,
    },
    /// Inspecting the symlink failed.
    #[error("cannot resolve {link}: {message}")]
    Io {
        /// Symlink path.
        link: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
}

/// Maps `<by_id_root>/<prefix><disk id>` symlinks to real device paths.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceLocator {
    by_id_root: Utf8PathBuf,
    prefix: String,
    device_root: Utf8PathBuf,
}

impl DeviceLocator {
    /// Creates a locator over the given symlink directory and namespace.
    #[must_use]
    pub fn new(
        by_id_root: impl Into<Utf8PathBuf>,
        prefix: impl Into<String>,
        device_root: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            by_id_root: by_id_root.into(),
            prefix: prefix.into(),
            device_root: device_root.into(),
        }
    }

    /// Stable symlink path for `disk_id`. A `<zone>/` qualifier is dropped;
    /// the kernel names the device after the bare identifier.
    #[must_use]
    pub fn link_path(&self, disk_id: &str) -> Utf8PathBuf {
        let bare = disk_id.rsplit_once('/').map_or(disk_id, |(_, id)| id);
        self.by_id_root.join(format!("{}{bare}", self.prefix))
    }

    /// Resolves `disk_id` to its device path.
    ///
    /// # Errors
    ///
    /// Returns [`LocateError`] when the symlink is missing, is not a symlink,
    /// or points outside the device namespace.
    pub fn locate(&self, disk_id: &str) -> Result<Utf8PathBuf, LocateError> {
        let link = self.link_path(disk_id);
        let meta = match fs::symlink_metadata(&link) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(LocateError::DiskNotFound {
                    disk_id: disk_id.to_owned(),
                    link,
                });
            }
            Err(err) => return Err(io_error(&link, &err)),
        };
        if !meta.file_type().is_symlink() {
            return Err(LocateError::NotASymlink { link });
        }

        let resolved = fs::canonicalize(&link).map_err(|err| io_error(&link, &err))?;
        let root = fs::canonicalize(&self.device_root)
            .unwrap_or_else(|_| self.device_root.clone().into_std_path_buf());
        if !resolved.starts_with(&root) {
            return Err(LocateError::OutsideNamespace {
                target: resolved.display().to_string(),
                link,
                device_root: self.device_root.clone(),
            });
        }

        let device = Utf8PathBuf::from_path_buf(resolved).map_err(|path| LocateError::Io {
            link: link.clone(),
            message: format!("non UTF-8 device path {}", path.display()),
        })?;
        debug!(disk_id, device = %device, "located device");
        Ok(device)
    }
}

fn io_error(link: &Utf8Path, err: &io::Error) -> LocateError {
    LocateError::Io {
        link: link.to_path_buf(),
        message: err.to_string(),
    }
}
