//! Libvirt backend implementation.

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::{Domain, Interface};
use virt::error::{Error as VirtError, ErrorNumber};
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::{DomainDirectory, StorageDirectory, VolumeStream};
use crate::types::*;
use crate::xml::Element;

/// Seconds to wait for the guest agent to answer.
const AGENT_TIMEOUT_SECS: i32 = 5;

fn management(e: VirtError) -> HypervisorError {
    HypervisorError::Management(e.to_string())
}

/// Error codes libvirt uses for a lookup of an object that does not exist.
fn is_absent(code: ErrorNumber) -> bool {
    matches!(
        code,
        ErrorNumber::NoDomain | ErrorNumber::NoStoragePool | ErrorNumber::NoStorageVolume
    )
}

/// Turn a failed lookup into `None` if libvirt reports the object as absent.
fn absent_as_none<T>(result: std::result::Result<T, VirtError>) -> Result<Option<T>> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(e) if is_absent(e.code()) => Ok(None),
        Err(e) => Err(management(e)),
    }
}

fn address_source_to_libvirt(source: AddressSource) -> sys::virDomainInterfaceAddressesSource {
    match source {
        AddressSource::Lease => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE,
        AddressSource::Agent => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT,
        AddressSource::Arp => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_ARP,
    }
}

fn address_type_from_libvirt(typed: i64) -> Result<AddressType> {
    match typed {
        t if t == sys::VIR_IP_ADDR_TYPE_IPV4 as i64 => Ok(AddressType::IPv4),
        t if t == sys::VIR_IP_ADDR_TYPE_IPV6 as i64 => Ok(AddressType::IPv6),
        other => Err(HypervisorError::Internal(format!(
            "Unknown IP address type {}",
            other
        ))),
    }
}

fn interface_info(interface: Interface) -> Result<InterfaceInfo> {
    let addresses = interface
        .addrs
        .into_iter()
        .map(|address| {
            Ok(InterfaceAddress {
                address: address.addr,
                prefix: address.prefix,
                address_type: address_type_from_libvirt(address.typed)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(InterfaceInfo {
        name: interface.name,
        hwaddr: interface.hwaddr,
        addresses,
    })
}

/// Libvirt/QEMU management backend.
pub struct LibvirtBackend {
    connection: Connect,
}

impl LibvirtBackend {
    /// Connect to libvirt.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    ///
    /// Without a URI, libvirt picks its default connection.
    pub async fn new(uri: Option<&str>) -> Result<Self> {
        info!(uri = ?uri, "Connecting to libvirt");

        let connection = Connect::open(uri).map_err(management)?;

        info!("Connected to libvirt");

        Ok(Self { connection })
    }

    fn domain(&self, name: &str) -> Result<Domain> {
        absent_as_none(Domain::lookup_by_name(&self.connection, name))?
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain {}", name)))
    }

    fn pool(&self, name: &str) -> Result<StoragePool> {
        absent_as_none(StoragePool::lookup_by_name(&self.connection, name))?
            .ok_or_else(|| HypervisorError::NotFound(format!("Storage pool {}", name)))
    }

    fn volume(&self, path: &str) -> Result<StorageVol> {
        absent_as_none(StorageVol::lookup_by_path(&self.connection, path))?
            .ok_or_else(|| HypervisorError::NotFound(format!("Storage volume {}", path)))
    }

    fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
        match state {
            sys::VIR_DOMAIN_NOSTATE => DomainState::NoState,
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::ShutOff,
            sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }

    fn pool_state_from_libvirt(state: sys::virStoragePoolState) -> PoolState {
        match state {
            sys::VIR_STORAGE_POOL_INACTIVE => PoolState::Inactive,
            sys::VIR_STORAGE_POOL_BUILDING => PoolState::Building,
            sys::VIR_STORAGE_POOL_RUNNING => PoolState::Running,
            sys::VIR_STORAGE_POOL_DEGRADED => PoolState::Degraded,
            sys::VIR_STORAGE_POOL_INACCESSIBLE => PoolState::Inaccessible,
            _ => PoolState::Unknown,
        }
    }

    fn domain_info(domain: &Domain) -> Result<DomainInfo> {
        let name = domain.get_name().map_err(management)?;
        let uuid = domain.get_uuid_string().map_err(management)?;
        let uuid = Uuid::parse_str(&uuid)
            .map_err(|e| HypervisorError::Internal(format!("Invalid domain UUID {}: {}", uuid, e)))?;
        let (state, _) = domain.get_state().map_err(management)?;

        Ok(DomainInfo {
            uuid,
            name,
            state: Self::state_from_libvirt(state),
        })
    }

    fn pool_info(pool: &StoragePool) -> Result<PoolInfo> {
        let name = pool.get_name().map_err(management)?;
        let uuid = pool.get_uuid_string().map_err(management)?;
        let uuid = Uuid::parse_str(&uuid)
            .map_err(|e| HypervisorError::Internal(format!("Invalid pool UUID {}: {}", uuid, e)))?;
        let info = pool.get_info().map_err(management)?;
        let active = pool.is_active().map_err(management)?;

        let number_of_volumes = if active {
            Some(pool.num_of_volumes().map_err(management)? as u64)
        } else {
            None
        };

        let xml = pool.get_xml_desc(0).map_err(management)?;
        let target_path = Element::parse(&xml)?
            .find("target/path")
            .and_then(|path| path.text())
            .map(|path| path.trim().to_string());

        Ok(PoolInfo {
            name,
            uuid,
            state: Self::pool_state_from_libvirt(info.state as sys::virStoragePoolState),
            active,
            persistent: pool.is_persistent().map_err(management)?,
            capacity: info.capacity,
            allocation: info.allocation,
            available: info.available,
            number_of_volumes,
            target_path,
        })
    }

    fn volume_info(volume: &StorageVol) -> Result<VolumeInfo> {
        Ok(VolumeInfo {
            name: volume.get_name().map_err(management)?,
            key: volume.get_key().map_err(management)?,
            path: volume.get_path().map_err(management)?,
            xml: volume.get_xml_desc(0).map_err(management)?,
        })
    }
}

#[async_trait]
impl DomainDirectory for LibvirtBackend {
    #[instrument(skip(self))]
    async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;

        let domains = self.connection.list_all_domains(flags).map_err(management)?;
        let domains = domains
            .iter()
            .map(Self::domain_info)
            .collect::<Result<Vec<_>>>()?;

        debug!(count = domains.len(), "Listed domains");
        Ok(domains)
    }

    #[instrument(skip(self))]
    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainInfo>> {
        match absent_as_none(Domain::lookup_by_name(&self.connection, name))? {
            Some(domain) => Ok(Some(Self::domain_info(&domain)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn domain_xml(&self, name: &str) -> Result<String> {
        self.domain(name)?.get_xml_desc(0).map_err(management)
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<DomainInfo> {
        let domain = Domain::define_xml(&self.connection, xml).map_err(management)?;
        let info = Self::domain_info(&domain)?;
        info!(name = %info.name, uuid = %info.uuid, "Domain defined");
        Ok(info)
    }

    #[instrument(skip(self))]
    async fn undefine_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.undefine().map_err(management)?;
        info!("Domain undefined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let (state, _) = self.domain(name)?.get_state().map_err(management)?;
        Ok(Self::state_from_libvirt(state))
    }

    #[instrument(skip(self))]
    async fn guest_agent_command(&self, name: &str, command: &str) -> Result<String> {
        self.domain(name)?
            .qemu_agent_command(command, AGENT_TIMEOUT_SECS, 0)
            .map_err(management)
    }

    #[instrument(skip(self))]
    async fn interface_addresses(
        &self,
        name: &str,
        source: AddressSource,
    ) -> Result<Vec<InterfaceInfo>> {
        let interfaces = self
            .domain(name)?
            .interface_addresses(address_source_to_libvirt(source), 0)
            .map_err(management)?;

        debug!(count = interfaces.len(), "Listed interface addresses");
        interfaces.into_iter().map(interface_info).collect()
    }
}

#[async_trait]
impl StorageDirectory for LibvirtBackend {
    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        let pools = self.connection.list_all_storage_pools(0).map_err(management)?;
        pools.iter().map(Self::pool_info).collect()
    }

    #[instrument(skip(self))]
    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>> {
        match absent_as_none(StoragePool::lookup_by_name(&self.connection, name))? {
            Some(pool) => Ok(Some(Self::pool_info(&pool)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn lookup_pool_by_target_path(&self, path: &str) -> Result<Option<PoolInfo>> {
        let wanted = std::path::Path::new(path);
        let pools = self.list_pools().await?;
        Ok(pools.into_iter().find(|pool| {
            pool.target_path
                .as_deref()
                .map_or(false, |target| std::path::Path::new(target) == wanted)
        }))
    }

    #[instrument(skip(self))]
    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        let volumes = self.pool(pool)?.list_all_volumes(0).map_err(management)?;
        volumes.iter().map(Self::volume_info).collect()
    }

    #[instrument(skip(self))]
    async fn lookup_volume_by_path(&self, path: &str) -> Result<Option<VolumeInfo>> {
        match absent_as_none(StorageVol::lookup_by_path(&self.connection, path))? {
            Some(volume) => Ok(Some(Self::volume_info(&volume)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>> {
        let pool = self.pool(pool)?;
        match absent_as_none(StorageVol::lookup_by_name(&pool, name))? {
            Some(volume) => Ok(Some(Self::volume_info(&volume)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, xml))]
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<VolumeInfo> {
        let pool = self.pool(pool)?;
        let volume = StorageVol::create_xml(&pool, xml, 0).map_err(management)?;
        let info = Self::volume_info(&volume)?;
        info!(path = %info.path, "Volume created");
        Ok(info)
    }

    #[instrument(skip(self, xml))]
    async fn create_volume_from(
        &self,
        pool: &str,
        xml: &str,
        source_path: &str,
        reflink: bool,
    ) -> Result<VolumeInfo> {
        let pool = self.pool(pool)?;
        let source = self.volume(source_path)?;

        let flags = if reflink {
            sys::VIR_STORAGE_VOL_CREATE_REFLINK
        } else {
            0
        };

        let volume = StorageVol::create_xml_from(&pool, xml, &source, flags).map_err(management)?;
        let info = Self::volume_info(&volume)?;
        info!(path = %info.path, "Volume created from {}", source_path);
        Ok(info)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, path: &str) -> Result<()> {
        self.volume(path)?.delete(0).map_err(management)?;
        info!("Volume deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn upload_volume(&self, path: &str) -> Result<Box<dyn VolumeStream>> {
        let volume = self.volume(path)?;
        let stream = Stream::new(&self.connection, 0).map_err(management)?;

        volume
            .upload(&stream, 0, 0, sys::VIR_STORAGE_VOL_UPLOAD_SPARSE_STREAM)
            .map_err(management)?;

        debug!("Volume upload stream opened");
        Ok(Box::new(LibvirtStream { stream }))
    }
}

/// Sparse upload stream into a libvirt volume.
struct LibvirtStream {
    stream: Stream,
}

#[async_trait]
impl VolumeStream for LibvirtStream {
    async fn send(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let sent = self.stream.send(data).map_err(management)?;
            data = &data[sent..];
        }
        Ok(())
    }

    async fn send_hole(&mut self, length: u64) -> Result<()> {
        let length = libc::c_longlong::try_from(length).map_err(|_| {
            HypervisorError::InvalidInput(format!("Hole of {} bytes is too large", length))
        })?;
        // SAFETY: the stream pointer stays valid for as long as `self.stream`
        // is alive.
        let result = unsafe { sys::virStreamSendHole(self.stream.as_ptr(), length, 0) };
        if result < 0 {
            return Err(management(VirtError::last_error()));
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let LibvirtStream { stream } = *self;
        stream.finish().map_err(management)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let LibvirtStream { stream } = *self;
        stream.abort().map_err(management)
    }
}
