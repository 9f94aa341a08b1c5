//! On-disk package layout (spec §4.5, §6).
//!
//! ```text
//! <name>/
//!   devices/
//!     <deviceId>/logs.db
//!   blobs/
//!     <relative/subpath>
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use syncstore_core::{DeviceId, Error, Result};

const DEVICES_DIR: &str = "devices";
const BLOBS_DIR: &str = "blobs";
const LOG_FILE_NAME: &str = "logs.db";

/// A package root plus the local device's identity.
#[derive(Debug, Clone)]
pub struct FilePackage {
    root: PathBuf,
    local_device: DeviceId,
}

impl FilePackage {
    pub fn new(root: impl Into<PathBuf>, local_device: DeviceId) -> Self {
        Self {
            root: root.into(),
            local_device,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_device(&self) -> &DeviceId {
        &self.local_device
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.root.join(DEVICES_DIR)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    /// Ensures the root package and the local device's subdirectory exist.
    /// Rejects a root or `devices/` path that already exists as a plain
    /// file (spec §4.5: `CorruptPackage`).
    pub fn prepare(&self) -> Result<()> {
        reject_if_plain_file(&self.root)?;
        fs::create_dir_all(&self.root)?;

        let devices_dir = self.devices_dir();
        reject_if_plain_file(&devices_dir)?;
        fs::create_dir_all(&devices_dir)?;

        reject_if_plain_file(&self.blobs_dir())?;
        fs::create_dir_all(self.blobs_dir())?;

        let local_dir = devices_dir.join(self.local_device.as_str());
        reject_if_plain_file(&local_dir)?;
        fs::create_dir_all(&local_dir)?;
        Ok(())
    }

    /// Subdirectories of `devices/` other than the local id, skipping
    /// hidden entries (prefix `.`), per spec §4.5 / §6.
    pub fn enumerate_foreign_devices(&self) -> Result<Vec<DeviceId>> {
        let devices_dir = self.devices_dir();
        let mut foreign = Vec::new();
        let entries = match fs::read_dir(&devices_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(foreign),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if name == self.local_device.as_str() {
                continue;
            }
            foreign.push(DeviceId::new(name.into_owned()));
        }
        foreign.sort();
        Ok(foreign)
    }

    /// Path to the local, writable `logs.db`.
    pub fn resolve_readwrite(&self) -> PathBuf {
        self.devices_dir()
            .join(self.local_device.as_str())
            .join(LOG_FILE_NAME)
    }

    /// Path to a foreign device's read-only `logs.db`.
    pub fn resolve_readonly(&self, device: &DeviceId) -> PathBuf {
        self.devices_dir().join(device.as_str()).join(LOG_FILE_NAME)
    }

    /// True once `prepare` has run and the local device directory exists.
    pub fn is_prepared(&self) -> bool {
        self.devices_dir()
            .join(self.local_device.as_str())
            .is_dir()
    }

    /// True if the package root has disappeared from disk (spec §3
    /// lifecycle: *deleted*).
    pub fn is_deleted(&self) -> bool {
        !self.root.exists()
    }
}

fn reject_if_plain_file(path: &Path) -> Result<()> {
    if path.is_file() {
        return Err(Error::corrupt_package(
            path.display().to_string(),
            "path exists as a plain file, expected a directory",
        ));
    }
    Ok(())
}
