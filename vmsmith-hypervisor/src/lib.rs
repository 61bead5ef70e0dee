//! # vmsmith Hypervisor
//!
//! Virtual machine lifecycle operations on top of a hypervisor management
//! layer: cloning domains with their disks and firmware, importing disk
//! images as sparse volumes, listing domains, pools and volumes, and probing
//! guest agents and the network interfaces of running domains.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  clone_domain     import_volume     list_* / ping    │
//! │  (rewrite, identity, strategies)    (upload)         │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//!               ManagementApi trait
//!        (DomainDirectory + StorageDirectory)
//!                            │
//!         ┌──────────────────┴──────────────────┐
//!         ▼                                     ▼
//! ┌───────────────────┐               ┌───────────────────┐
//! │  LibvirtBackend   │               │    MockBackend    │
//! │   (via libvirt)   │               │    (in memory)    │
//! └───────────────────┘               └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmsmith_hypervisor::{clone_domain, CloneMode, MockBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MockBackend::new();
//!     clone_domain(&backend, "vm1", "vm1-clone", CloneMode::Linked)
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod clone;
pub mod error;
pub mod guest;
pub mod identity;
pub mod inventory;
pub mod libvirt;
pub mod mock;
pub mod traits;
pub mod types;
pub mod upload;
pub mod volume;
pub mod xml;

pub use clone::{clone_domain, ClonePlan, DomainCloner, SourceFirmware, SourceVolume};
pub use error::{HypervisorError, Result};
pub use guest::ping_guest;
pub use identity::{InventoryMacFactory, InventoryUuidFactory, MacFactory, UuidFactory};
pub use inventory::{list_domain_interfaces, list_domains, list_pools};
pub use mock::MockBackend;
pub use traits::{DomainDirectory, ManagementApi, StorageDirectory, VolumeStream};
pub use types::*;
pub use upload::{import_volume, FormatProbe, QemuImgProbe};
pub use volume::{list_volumes, VolumeDescriptor};

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
