//! Volume import with sparse transfer.
//!
//! A local disk image is uploaded into a new volume without transmitting its
//! holes. The image is walked with `SEEK_DATA`/`SEEK_HOLE`: data regions are
//! read and sent, holes are only announced by their length, so the remote
//! side can keep them unallocated.
//!
//! Reads of the image run on tokio's blocking thread pool. Calls into the
//! libvirt backend still block the calling task.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::{StorageDirectory, VolumeStream};
use crate::volume::NewVolume;

/// Size of the data chunks sent over a volume stream.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Detects the on-disk format of a local disk image.
#[async_trait]
pub trait FormatProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<String>;
}

/// Format probe backed by `qemu-img info`.
#[derive(Debug, Clone)]
pub struct QemuImgProbe {
    qemu_img_path: String,
}

impl QemuImgProbe {
    pub fn new() -> Self {
        Self {
            qemu_img_path: "qemu-img".to_string(),
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_qemu_img(mut self, path: impl Into<String>) -> Self {
        self.qemu_img_path = path.into();
        self
    }
}

impl Default for QemuImgProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FormatProbe for QemuImgProbe {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn probe(&self, path: &Path) -> Result<String> {
        let output = Command::new(&self.qemu_img_path)
            .arg("info")
            .arg("--output=json")
            .arg(path)
            .output()
            .await
            .map_err(|e| HypervisorError::ProgramError(format!("Failed to execute qemu-img: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::ProgramError(format!(
                "qemu-img info failed with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            HypervisorError::ProgramError(format!("Failed to parse qemu-img output: {}", e))
        })?;

        let format = info["format"].as_str().ok_or_else(|| {
            HypervisorError::ProgramError(format!(
                "qemu-img could not determine the format of {}",
                path.display()
            ))
        })?;

        debug!(format = %format, "Probed image format");
        Ok(format.to_string())
    }
}

fn seek(file: &File, offset: u64, whence: libc::c_int) -> io::Result<u64> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
    // SAFETY: lseek only repositions the offset of a descriptor we own
    // through `file`.
    let position = unsafe { libc::lseek(file.as_raw_fd(), offset, whence) };
    if position < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(position as u64)
}

/// Next piece of a sparse file, starting at a given offset.
#[derive(Debug, PartialEq, Eq)]
enum Region {
    Hole(u64),
    Data(Vec<u8>),
}

/// Read the region of `file` at `offset`, at most [`CHUNK_SIZE`] bytes of
/// data. `offset` must lie before `end`.
fn read_region(file: &File, offset: u64, end: u64) -> io::Result<Region> {
    let data_start = match seek(file, offset, libc::SEEK_DATA) {
        Ok(position) => position,
        // No data past `offset`: the rest of the file is one hole.
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => return Ok(Region::Hole(end - offset)),
        Err(e) => return Err(e),
    };

    if data_start > offset {
        return Ok(Region::Hole(data_start.min(end) - offset));
    }

    // Every file ends in a hole, at the latest at end-of-file.
    let data_end = seek(file, offset, libc::SEEK_HOLE)?.min(end);
    let length = (data_end - offset).min(CHUNK_SIZE as u64) as usize;
    let mut buffer = vec![0u8; length];
    file.read_exact_at(&mut buffer, offset)?;
    Ok(Region::Data(buffer))
}

/// Run a blocking file operation on the blocking thread pool.
async fn blocking<T, F>(file: &Arc<File>, operation: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&File) -> io::Result<T> + Send + 'static,
{
    let file = Arc::clone(file);
    let result = tokio::task::spawn_blocking(move || operation(&file))
        .await
        .map_err(|e| HypervisorError::Internal(format!("File read task failed: {}", e)))?;
    Ok(result?)
}

/// Send the content of `file` over `stream`, skipping holes.
///
/// Seeks and reads run on the blocking thread pool, one chunk at a time.
/// Does not finish the stream.
pub async fn send_sparse(file: &File, stream: &mut dyn VolumeStream) -> Result<()> {
    let file = Arc::new(file.try_clone()?);
    let end = blocking(&file, |file| seek(file, 0, libc::SEEK_END)).await?;
    let mut offset = 0u64;

    while offset < end {
        match blocking(&file, move |file| read_region(file, offset, end)).await? {
            Region::Hole(length) => {
                stream.send_hole(length).await?;
                offset += length;
            }
            Region::Data(data) => {
                stream.send(&data).await?;
                offset += data.len() as u64;
            }
        }
    }

    Ok(())
}

/// Import the disk image at `path` into a new volume of `pool`.
///
/// The volume is named after the file and created with capacity 0; the
/// upload sets its real size. If the upload fails, the stream is aborted and
/// the volume deleted again.
///
/// Opening the image and the libvirt stream calls are blocking; image reads
/// are moved to the blocking thread pool by [`send_sparse`].
#[instrument(skip(storage, probe), fields(path = %path.display()))]
pub async fn import_volume<S: StorageDirectory + ?Sized>(
    storage: &S,
    probe: &dyn FormatProbe,
    path: &Path,
    pool: &str,
) -> Result<()> {
    if storage.lookup_pool(pool).await?.is_none() {
        return Err(HypervisorError::NotFound(format!("Storage pool {}", pool)));
    }

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(HypervisorError::NotFound(format!("File {}", path.display())));
        }
        Err(e) => return Err(e.into()),
    };

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| HypervisorError::InvalidInput(format!("{} is not a file", path.display())))?;

    let format = probe.probe(path).await?;

    if storage.lookup_volume(pool, &name).await?.is_some() {
        return Err(HypervisorError::Conflict(format!(
            "Volume {} already exists in pool {}",
            name, pool
        )));
    }

    let xml = NewVolume::new(&name).with_capacity(0).with_format(&format).to_xml()?;
    let volume = storage.create_volume(pool, &xml).await?;

    if let Err(e) = upload(storage, &file, &volume.path).await {
        if let Err(cleanup) = storage.delete_volume(&volume.path).await {
            warn!(volume = %volume.path, error = %cleanup, "Failed to delete partially imported volume");
        }
        return Err(e);
    }

    info!(volume = %volume.path, format = %format, "Volume imported");
    Ok(())
}

async fn upload<S: StorageDirectory + ?Sized>(storage: &S, file: &File, volume_path: &str) -> Result<()> {
    let mut stream = storage.upload_volume(volume_path).await?;

    match send_sparse(file, stream.as_mut()).await {
        Ok(()) => stream.finish().await,
        Err(e) => {
            if let Err(abort) = stream.abort().await {
                warn!(volume = %volume_path, error = %abort, "Failed to abort volume upload");
            }
            Err(e)
        }
    }
}
