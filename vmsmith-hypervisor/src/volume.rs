//! Storage volume descriptors.
//!
//! Reading: [`VolumeDescriptor::from_volume`] turns the descriptor document
//! reported by the management layer into a flat, serializable summary.
//!
//! Writing: [`NewVolume`] builds the minimal descriptor documents submitted
//! when creating volumes (clones, linked clones, imports).

use serde::Serialize;
use tracing::instrument;

use crate::error::{HypervisorError, Result};
use crate::traits::StorageDirectory;
use crate::types::VolumeInfo;
use crate::xml::Element;

/// Location and format of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    pub path: String,
    pub format_type: Option<String>,
}

/// Volume a copy-on-write volume reads unwritten blocks from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackingStoreDescriptor {
    pub path: Option<String>,
    pub format_type: Option<String>,
}

/// Summary of one storage volume. Sizes are in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDescriptor {
    pub name: String,
    pub key: String,
    pub capacity: Option<u64>,
    pub allocation: Option<u64>,
    pub physical: Option<u64>,
    #[serde(rename = "type")]
    pub volume_type: Option<String>,
    pub target: TargetDescriptor,
    pub backing_store: Option<BackingStoreDescriptor>,
}

impl VolumeDescriptor {
    /// Summarize a volume from its descriptor document.
    ///
    /// # Panics
    ///
    /// If a size element carries a unit other than bytes. The management
    /// layer always reports sizes in bytes, so anything else means the
    /// document did not come from it.
    pub fn from_volume(volume: &VolumeInfo) -> Result<Self> {
        let document = Element::parse(&volume.xml)?;

        let format_type = document
            .find("target/format")
            .and_then(|format| format.attr("type"))
            .map(str::to_string);

        Ok(Self {
            name: volume.name.clone(),
            key: volume.key.clone(),
            capacity: size_element(&document, "capacity")?,
            allocation: size_element(&document, "allocation")?,
            physical: size_element(&document, "physical")?,
            volume_type: document.attr("type").map(str::to_string),
            target: TargetDescriptor {
                path: volume.path.clone(),
                format_type,
            },
            backing_store: backing_store(&document),
        })
    }
}

/// Size in bytes of a sizing element, or `None` if it is absent or empty.
fn size_element(document: &Element, name: &str) -> Result<Option<u64>> {
    let element = match document.child(name) {
        Some(element) => element,
        None => return Ok(None),
    };
    let text = match element.text() {
        Some(text) if !text.trim().is_empty() => text,
        _ => return Ok(None),
    };

    let unit = element.attr("unit");
    assert!(
        unit.is_none() || unit == Some("bytes"),
        "volume size <{}> reported in unit {:?} instead of bytes",
        name,
        unit
    );

    text.trim().parse::<u64>().map(Some).map_err(|e| {
        HypervisorError::InvalidInput(format!("Invalid volume size <{}>: {}", name, e))
    })
}

fn backing_store(document: &Element) -> Option<BackingStoreDescriptor> {
    let backing_store = document.child("backingStore")?;
    Some(BackingStoreDescriptor {
        path: backing_store
            .child("path")
            .and_then(|path| path.text())
            .map(|path| path.into_owned()),
        format_type: backing_store
            .child("format")
            .and_then(|format| format.attr("type"))
            .map(str::to_string),
    })
}

/// List the volumes of `pool`, sorted by name.
#[instrument(skip(storage))]
pub async fn list_volumes<S: StorageDirectory + ?Sized>(
    storage: &S,
    pool: &str,
) -> Result<Vec<VolumeDescriptor>> {
    if storage.lookup_pool(pool).await?.is_none() {
        return Err(HypervisorError::NotFound(format!("Storage pool {}", pool)));
    }

    let mut volumes = storage
        .list_volumes(pool)
        .await?
        .iter()
        .map(VolumeDescriptor::from_volume)
        .collect::<Result<Vec<_>>>()?;
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(volumes)
}

// =============================================================================
// Descriptor builder
// =============================================================================

/// Descriptor document of a volume about to be created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewVolume {
    pub name: String,
    pub capacity: Option<u64>,
    pub format: Option<String>,
    pub backing_store: Option<(String, String)>,
}

impl NewVolume {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Back the volume by the volume at `path`, stored in `format`.
    pub fn with_backing_store(mut self, path: impl Into<String>, format: impl Into<String>) -> Self {
        self.backing_store = Some((path.into(), format.into()));
        self
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut volume = Element::new("volume").with_child(Element::new("name").with_text(&self.name));

        if let Some(capacity) = self.capacity {
            volume = volume.with_child(
                Element::new("capacity")
                    .with_attr("unit", "bytes")
                    .with_text(capacity.to_string()),
            );
        }

        if let Some(format) = &self.format {
            volume = volume.with_child(
                Element::new("target").with_child(Element::new("format").with_attr("type", format.as_str())),
            );
        }

        if let Some((path, format)) = &self.backing_store {
            volume = volume.with_child(
                Element::new("backingStore")
                    .with_child(Element::new("path").with_text(path.as_str()))
                    .with_child(Element::new("format").with_attr("type", format.as_str())),
            );
        }

        volume.to_xml_string()
    }
}
