//! Storage artifacts of a domain about to be cloned.
//!
//! A cloned artifact lives next to its source, in the same directory (and
//! therefore the same pool), named `<clone name>-<source file name>`. File
//! extensions are left alone: a qcow2 volume may legitimately end up named
//! `clone-disk.raw`, because nothing can tell an extension apart from any
//! other suffix after the last dot.

use std::path::Path;

use serde::Serialize;

fn parent_dir(source_path: &str) -> String {
    Path::new(source_path)
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name(source_path: &str) -> String {
    Path::new(source_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn join(dir: &str, name: &str) -> String {
    Path::new(dir).join(name).to_string_lossy().into_owned()
}

/// Boot firmware file (e.g. UEFI NVRAM) of a domain about to be cloned.
///
/// Firmware is always copied in full, whatever the clone mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFirmware {
    pub source_path: String,
    pub clone_name: String,
}

impl SourceFirmware {
    pub fn new(source_path: impl Into<String>, clone_name: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            clone_name: clone_name.into(),
        }
    }

    /// Directory holding the source, which is also the target pool's root.
    pub fn pool_path(&self) -> String {
        parent_dir(&self.source_path)
    }

    pub fn cloned_volume_name(&self) -> String {
        format!("{}-{}", self.clone_name, file_name(&self.source_path))
    }

    pub fn clone_path(&self) -> String {
        join(&self.pool_path(), &self.cloned_volume_name())
    }
}

/// Disk volume of a domain about to be cloned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceVolume {
    pub source_path: String,
    /// On-disk format of the source as declared by the disk driver
    /// (`qcow2`, `raw`, ...)
    pub source_format: String,
    pub clone_name: String,
}

impl SourceVolume {
    pub fn new(
        source_path: impl Into<String>,
        source_format: impl Into<String>,
        clone_name: impl Into<String>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            source_format: source_format.into(),
            clone_name: clone_name.into(),
        }
    }

    pub fn pool_path(&self) -> String {
        parent_dir(&self.source_path)
    }

    pub fn cloned_volume_name(&self) -> String {
        format!("{}-{}", self.clone_name, file_name(&self.source_path))
    }

    pub fn clone_path(&self) -> String {
        join(&self.pool_path(), &self.cloned_volume_name())
    }
}
