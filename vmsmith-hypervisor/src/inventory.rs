//! Listings of domains, their network interfaces and storage pools.

use tracing::instrument;

use crate::error::{HypervisorError, Result};
use crate::traits::{DomainDirectory, StorageDirectory};
use crate::types::{AddressSource, DomainInfo, InterfaceInfo, PoolInfo};

/// All defined domains, running or not, sorted by UUID.
#[instrument(skip(directory))]
pub async fn list_domains<D: DomainDirectory + ?Sized>(directory: &D) -> Result<Vec<DomainInfo>> {
    let mut domains = directory.list_domains().await?;
    domains.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    Ok(domains)
}

/// Network interfaces of a running domain, sorted by MAC address, each with
/// its addresses sorted.
#[instrument(skip(directory))]
pub async fn list_domain_interfaces<D: DomainDirectory + ?Sized>(
    directory: &D,
    domain: &str,
    source: AddressSource,
) -> Result<Vec<InterfaceInfo>> {
    if !directory.domain_exists(domain).await? {
        return Err(HypervisorError::NotFound(format!("Domain {}", domain)));
    }

    let mut interfaces = directory.interface_addresses(domain, source).await?;
    for interface in &mut interfaces {
        interface.addresses.sort_by(|a, b| a.address.cmp(&b.address));
    }
    interfaces.sort_by(|a, b| a.hwaddr.cmp(&b.hwaddr));
    Ok(interfaces)
}

/// All storage pools, sorted by name.
#[instrument(skip(storage))]
pub async fn list_pools<S: StorageDirectory + ?Sized>(storage: &S) -> Result<Vec<PoolInfo>> {
    let mut pools = storage.list_pools().await?;
    pools.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(pools)
}
