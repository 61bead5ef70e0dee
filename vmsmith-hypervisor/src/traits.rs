//! Management API abstraction traits.
//!
//! Everything the cloning and import logic needs from the hypervisor
//! management layer goes through these traits, so the same code runs
//! against libvirt and against the in-memory [`crate::MockBackend`].

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Domain directory: lookup, definition and state of domains.
#[async_trait]
pub trait DomainDirectory: Send + Sync {
    /// List all defined domains, running or not.
    async fn list_domains(&self) -> Result<Vec<DomainInfo>>;

    /// Look up a domain by name. Returns `None` if it does not exist.
    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainInfo>>;

    /// Fetch the configuration document of a domain.
    async fn domain_xml(&self, name: &str) -> Result<String>;

    /// Define (persist) a new domain from a configuration document.
    async fn define_domain(&self, xml: &str) -> Result<DomainInfo>;

    /// Undefine a domain.
    async fn undefine_domain(&self, name: &str) -> Result<()>;

    /// Query the run state of a domain.
    async fn domain_state(&self, name: &str) -> Result<DomainState>;

    // =========================================================================
    // Guest channel
    // =========================================================================

    /// Send a single JSON-encoded command to the guest agent of a domain.
    async fn guest_agent_command(&self, name: &str, command: &str) -> Result<String>;

    /// Network interfaces of a running domain with their IP addresses, as
    /// reported by `source`.
    async fn interface_addresses(
        &self,
        name: &str,
        source: AddressSource,
    ) -> Result<Vec<InterfaceInfo>>;

    /// Check if a domain exists.
    async fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lookup_domain(name).await?.is_some())
    }
}

/// Storage directory: pools, volumes and volume streams.
#[async_trait]
pub trait StorageDirectory: Send + Sync {
    /// List all storage pools.
    async fn list_pools(&self) -> Result<Vec<PoolInfo>>;

    /// Look up a pool by name. Returns `None` if it does not exist.
    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>>;

    /// Look up the pool rooted at the given directory.
    async fn lookup_pool_by_target_path(&self, path: &str) -> Result<Option<PoolInfo>>;

    /// List the volumes of a pool.
    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>>;

    /// Look up a volume by its path. Returns `None` if it does not exist.
    async fn lookup_volume_by_path(&self, path: &str) -> Result<Option<VolumeInfo>>;

    /// Look up a volume by pool and name. Returns `None` if it does not exist.
    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>>;

    /// Create a volume from a volume descriptor document.
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<VolumeInfo>;

    /// Create a volume from a descriptor, populated with the content of the
    /// volume at `source_path`.
    ///
    /// `reflink` asks for copy-on-write block sharing. Whether that is
    /// possible is for the management layer to decide; failures are reported
    /// as they come.
    async fn create_volume_from(
        &self,
        pool: &str,
        xml: &str,
        source_path: &str,
        reflink: bool,
    ) -> Result<VolumeInfo>;

    /// Delete the volume at `path`.
    async fn delete_volume(&self, path: &str) -> Result<()>;

    /// Open a stream that uploads into the volume at `path`.
    async fn upload_volume(&self, path: &str) -> Result<Box<dyn VolumeStream>>;
}

/// Byte stream into a volume, with sparse transfer support.
///
/// A stream must be consumed by exactly one of [`VolumeStream::finish`] or
/// [`VolumeStream::abort`].
#[async_trait]
pub trait VolumeStream: Send {
    /// Send a chunk of data.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Skip `length` bytes that read as zero without transmitting them.
    async fn send_hole(&mut self, length: u64) -> Result<()>;

    /// Commit the transfer.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Tell the remote side that the transfer did not complete.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// The complete management API consumed by the orchestrators.
pub trait ManagementApi: DomainDirectory + StorageDirectory {}

impl<T: DomainDirectory + StorageDirectory + ?Sized> ManagementApi for T {}
