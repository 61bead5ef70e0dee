//! Materialization of cloned storage artifacts.
//!
//! Every artifact is created in the pool rooted at the directory of its
//! source, under its cloned volume name.
//!
//! A [`CloneMode::Linked`] clone reads every block it has not written from
//! the original volume. The original must therefore stay unmodified, and
//! must not be deleted, for as long as the linked clone exists. Nothing here
//! enforces that; it is up to the caller.

use tracing::{debug, instrument};

use super::source::{SourceFirmware, SourceVolume};
use crate::error::{HypervisorError, Result};
use crate::traits::StorageDirectory;
use crate::types::{CloneMode, PoolInfo, VolumeInfo};
use crate::volume::NewVolume;

async fn target_pool<S: StorageDirectory + ?Sized>(storage: &S, pool_path: &str) -> Result<PoolInfo> {
    storage
        .lookup_pool_by_target_path(pool_path)
        .await?
        .ok_or_else(|| HypervisorError::NotFound(format!("Storage pool at {}", pool_path)))
}

/// Copy a firmware file in full. Firmware is never reflinked or linked.
#[instrument(skip(storage, firmware), fields(source = %firmware.source_path))]
pub async fn copy_firmware<S: StorageDirectory + ?Sized>(
    storage: &S,
    firmware: &SourceFirmware,
) -> Result<VolumeInfo> {
    let pool = target_pool(storage, &firmware.pool_path()).await?;
    let xml = NewVolume::new(firmware.cloned_volume_name()).to_xml()?;

    let volume = storage
        .create_volume_from(&pool.name, &xml, &firmware.source_path, false)
        .await?;
    debug!(path = %volume.path, "Firmware copied");
    Ok(volume)
}

/// Materialize a cloned disk volume the way `mode` asks for.
///
/// Reflink support is not checked up front. If the pool, the filesystem or
/// the volume format cannot share blocks, the management layer says so and
/// its error is returned unchanged.
#[instrument(skip(storage, volume), fields(source = %volume.source_path, mode = %mode))]
pub async fn materialize_volume<S: StorageDirectory + ?Sized>(
    storage: &S,
    volume: &SourceVolume,
    mode: CloneMode,
) -> Result<VolumeInfo> {
    let pool = target_pool(storage, &volume.pool_path()).await?;

    let created = match mode {
        CloneMode::Copy | CloneMode::Reflink => {
            let xml = NewVolume::new(volume.cloned_volume_name())
                .with_format(&volume.source_format)
                .to_xml()?;
            let reflink = mode == CloneMode::Reflink;
            storage
                .create_volume_from(&pool.name, &xml, &volume.source_path, reflink)
                .await?
        }
        CloneMode::Linked => {
            let xml = NewVolume::new(volume.cloned_volume_name())
                .with_format("qcow2")
                .with_backing_store(&volume.source_path, &volume.source_format)
                .to_xml()?;
            storage.create_volume(&pool.name, &xml).await?
        }
    };

    debug!(path = %created.path, "Volume materialized");
    Ok(created)
}
