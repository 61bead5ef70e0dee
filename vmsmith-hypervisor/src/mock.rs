//! Mock management backend for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{HypervisorError, Result};
use crate::traits::{DomainDirectory, StorageDirectory, VolumeStream};
use crate::types::*;
use crate::xml::Element;

/// Capacity reported for every mock pool.
const POOL_CAPACITY: u64 = 1 << 40;

/// One operation received by a volume stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Vec<u8>),
    Hole(u64),
}

/// Mock management backend.
///
/// Keeps domains, pools and volumes in memory without requiring an actual
/// hypervisor. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed
///
/// Every successful mutation is recorded in a journal (see
/// [`MockBackend::journal`]), and failures can be injected to exercise
/// error paths.
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<RwLock<MockState>>,
}

#[derive(Default)]
struct MockState {
    domains: BTreeMap<String, MockDomain>,
    pools: BTreeMap<String, MockPool>,
    /// Volumes by path
    volumes: BTreeMap<String, MockVolume>,
    journal: Vec<String>,
    faults: Faults,
    aborted_uploads: u32,
}

struct MockDomain {
    uuid: Uuid,
    xml: String,
    state: DomainState,
    agent_responsive: bool,
    interfaces: BTreeMap<AddressSource, Vec<InterfaceInfo>>,
}

struct MockPool {
    uuid: Uuid,
    path: String,
    active: bool,
}

struct MockVolume {
    pool: String,
    name: String,
    format: Option<String>,
    capacity: u64,
    allocation: u64,
    backing_store: Option<(String, String)>,
    content: Vec<StreamEvent>,
}

struct Faults {
    failing_volumes: HashSet<String>,
    reflink_supported: bool,
    fail_uploads: bool,
    fail_volume_deletion: bool,
    fail_domain_definition: bool,
    refuse_undefine_with_firmware: bool,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            failing_volumes: HashSet::new(),
            reflink_supported: true,
            fail_uploads: false,
            fail_volume_deletion: false,
            fail_domain_definition: false,
            refuse_undefine_with_firmware: false,
        }
    }
}

impl MockVolume {
    fn path(&self, pool_path: &str) -> String {
        Path::new(pool_path)
            .join(&self.name)
            .to_string_lossy()
            .into_owned()
    }

    fn info(&self, path: &str) -> Result<VolumeInfo> {
        let mut document = Element::new("volume")
            .with_attr("type", "file")
            .with_child(Element::new("name").with_text(&self.name))
            .with_child(Element::new("key").with_text(path))
            .with_child(
                Element::new("capacity")
                    .with_attr("unit", "bytes")
                    .with_text(self.capacity.to_string()),
            )
            .with_child(
                Element::new("allocation")
                    .with_attr("unit", "bytes")
                    .with_text(self.allocation.to_string()),
            );

        let mut target = Element::new("target").with_child(Element::new("path").with_text(path));
        if let Some(format) = &self.format {
            target = target.with_child(Element::new("format").with_attr("type", format.as_str()));
        }
        document = document.with_child(target);

        if let Some((backing_path, backing_format)) = &self.backing_store {
            document = document.with_child(
                Element::new("backingStore")
                    .with_child(Element::new("path").with_text(backing_path.as_str()))
                    .with_child(Element::new("format").with_attr("type", backing_format.as_str())),
            );
        }

        Ok(VolumeInfo {
            name: self.name.clone(),
            key: path.to_string(),
            path: path.to_string(),
            xml: document.to_xml_string()?,
        })
    }
}

fn same_dir(a: &str, b: &str) -> bool {
    Path::new(a) == Path::new(b)
}

fn parse_domain(xml: &str) -> Result<(String, Option<Uuid>)> {
    let document = Element::parse(xml)?;
    let name = document
        .child("name")
        .and_then(|name| name.text())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| HypervisorError::InvalidInput("Domain has no name".to_string()))?;

    let uuid = match document.child("uuid").and_then(|uuid| uuid.text()) {
        Some(text) => Some(Uuid::parse_str(text.trim()).map_err(|e| {
            HypervisorError::InvalidInput(format!("Invalid domain UUID {}: {}", text, e))
        })?),
        None => None,
    };

    Ok((name, uuid))
}

/// The parts of a volume descriptor the mock understands.
struct VolumeRequest {
    name: String,
    capacity: Option<u64>,
    format: Option<String>,
    backing_store: Option<(String, String)>,
}

fn parse_volume(xml: &str) -> Result<VolumeRequest> {
    let document = Element::parse(xml)?;
    let name = document
        .child("name")
        .and_then(|name| name.text())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| HypervisorError::InvalidInput("Volume has no name".to_string()))?;

    let capacity = match document.child("capacity").and_then(|capacity| capacity.text()) {
        Some(text) => Some(text.trim().parse::<u64>().map_err(|e| {
            HypervisorError::InvalidInput(format!("Invalid volume capacity {}: {}", text, e))
        })?),
        None => None,
    };

    let format = document
        .find("target/format")
        .and_then(|format| format.attr("type"))
        .map(str::to_string);

    let backing_store = document.child("backingStore").and_then(|backing_store| {
        let path = backing_store.child("path")?.text()?.trim().to_string();
        let format = backing_store.child("format")?.attr("type")?.to_string();
        Some((path, format))
    });

    Ok(VolumeRequest {
        name,
        capacity,
        format,
        backing_store,
    })
}

impl MockBackend {
    /// Create a new, empty mock backend.
    pub fn new() -> Self {
        info!("Creating mock management backend");
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MockState>> {
        self.state
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MockState>> {
        self.state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    /// Seeding and fault injection never fail, even after a panic elsewhere.
    fn seed(&self) -> RwLockWriteGuard<'_, MockState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Add an active pool rooted at `path`.
    pub fn add_pool(&self, name: &str, path: &str) {
        self.seed().pools.insert(
            name.to_string(),
            MockPool {
                uuid: Uuid::new_v4(),
                path: path.to_string(),
                active: true,
            },
        );
    }

    pub fn set_pool_active(&self, name: &str, active: bool) {
        if let Some(pool) = self.seed().pools.get_mut(name) {
            pool.active = active;
        }
    }

    /// Add a fully allocated volume. Returns its path.
    pub fn add_volume(&self, pool: &str, name: &str, format: &str, capacity: u64) -> Result<String> {
        let mut state = self.seed();
        let pool_path = state
            .pools
            .get(pool)
            .map(|p| p.path.clone())
            .ok_or_else(|| HypervisorError::NotFound(format!("Storage pool {}", pool)))?;

        let volume = MockVolume {
            pool: pool.to_string(),
            name: name.to_string(),
            format: Some(format.to_string()),
            capacity,
            allocation: capacity,
            backing_store: None,
            content: Vec::new(),
        };
        let path = volume.path(&pool_path);
        state.volumes.insert(path.clone(), volume);
        Ok(path)
    }

    /// Add a domain in the given state without recording it in the journal.
    pub fn add_domain(&self, xml: &str, state: DomainState) -> Result<DomainInfo> {
        let (name, uuid) = parse_domain(xml)?;
        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        self.seed().domains.insert(
            name.clone(),
            MockDomain {
                uuid,
                xml: xml.to_string(),
                state,
                agent_responsive: true,
                interfaces: BTreeMap::new(),
            },
        );
        Ok(DomainInfo { uuid, name, state })
    }

    pub fn set_domain_state(&self, name: &str, state: DomainState) {
        if let Some(domain) = self.seed().domains.get_mut(name) {
            domain.state = state;
        }
    }

    /// Whether the guest agent of a running domain answers commands.
    pub fn set_guest_agent_responsive(&self, name: &str, responsive: bool) {
        if let Some(domain) = self.seed().domains.get_mut(name) {
            domain.agent_responsive = responsive;
        }
    }

    /// Interfaces reported for a domain when asked through `source`.
    pub fn set_interfaces(&self, name: &str, source: AddressSource, interfaces: Vec<InterfaceInfo>) {
        if let Some(domain) = self.seed().domains.get_mut(name) {
            domain.interfaces.insert(source, interfaces);
        }
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Make the creation of volumes named `name` fail.
    pub fn fail_volume_creation(&self, name: &str) {
        self.seed().faults.failing_volumes.insert(name.to_string());
    }

    pub fn set_reflink_supported(&self, supported: bool) {
        self.seed().faults.reflink_supported = supported;
    }

    /// Make every volume stream fail on its first transfer.
    pub fn fail_uploads(&self, fail: bool) {
        self.seed().faults.fail_uploads = fail;
    }

    pub fn fail_volume_deletion(&self, fail: bool) {
        self.seed().faults.fail_volume_deletion = fail;
    }

    pub fn fail_domain_definition(&self, fail: bool) {
        self.seed().faults.fail_domain_definition = fail;
    }

    /// Refuse to undefine a domain while its NVRAM volume still exists, as
    /// some hypervisor versions do.
    pub fn refuse_undefine_with_firmware(&self, refuse: bool) {
        self.seed().faults.refuse_undefine_with_firmware = refuse;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Successful mutations, oldest first: `define <name>`,
    /// `undefine <name>`, `create <path>`, `delete <path>`,
    /// `upload <path>`.
    pub fn journal(&self) -> Vec<String> {
        self.seed().journal.clone()
    }

    /// Everything committed to the volume at `path` by its last upload.
    pub fn uploaded_content(&self, path: &str) -> Option<Vec<StreamEvent>> {
        self.seed().volumes.get(path).map(|volume| volume.content.clone())
    }

    pub fn aborted_uploads(&self) -> u32 {
        self.seed().aborted_uploads
    }

    fn volume_info(state: &MockState, path: &str) -> Result<Option<VolumeInfo>> {
        match state.volumes.get(path) {
            Some(volume) => Ok(Some(volume.info(path)?)),
            None => Ok(None),
        }
    }

    fn insert_volume(state: &mut MockState, pool: &str, volume: MockVolume) -> Result<VolumeInfo> {
        if state.faults.failing_volumes.contains(&volume.name) {
            return Err(HypervisorError::Management(format!(
                "Failed to create volume {}: injected failure",
                volume.name
            )));
        }

        let pool_path = state
            .pools
            .get(pool)
            .map(|p| p.path.clone())
            .ok_or_else(|| HypervisorError::NotFound(format!("Storage pool {}", pool)))?;
        let path = volume.path(&pool_path);
        if state.volumes.contains_key(&path) {
            return Err(HypervisorError::Conflict(format!("Volume {} already exists", path)));
        }

        let info = volume.info(&path)?;
        state.volumes.insert(path.clone(), volume);
        state.journal.push(format!("create {}", path));
        Ok(info)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainDirectory for MockBackend {
    async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let state = self.read()?;
        Ok(state
            .domains
            .iter()
            .map(|(name, domain)| DomainInfo {
                uuid: domain.uuid,
                name: name.clone(),
                state: domain.state,
            })
            .collect())
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainInfo>> {
        let state = self.read()?;
        Ok(state.domains.get(name).map(|domain| DomainInfo {
            uuid: domain.uuid,
            name: name.to_string(),
            state: domain.state,
        }))
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        let state = self.read()?;
        state
            .domains
            .get(name)
            .map(|domain| domain.xml.clone())
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain {}", name)))
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<DomainInfo> {
        let (name, uuid) = parse_domain(xml)?;
        let mut state = self.write()?;

        if state.faults.fail_domain_definition {
            return Err(HypervisorError::Management(format!(
                "Failed to define domain {}: injected failure",
                name
            )));
        }
        if state.domains.contains_key(&name) {
            return Err(HypervisorError::Conflict(format!("Domain {} already exists", name)));
        }

        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        if state.domains.values().any(|domain| domain.uuid == uuid) {
            return Err(HypervisorError::Conflict(format!("Domain with UUID {} already exists", uuid)));
        }

        state.domains.insert(
            name.clone(),
            MockDomain {
                uuid,
                xml: xml.to_string(),
                state: DomainState::ShutOff,
                agent_responsive: true,
                interfaces: BTreeMap::new(),
            },
        );
        state.journal.push(format!("define {}", name));

        info!(name = %name, uuid = %uuid, "Mock domain defined");
        Ok(DomainInfo {
            uuid,
            name,
            state: DomainState::ShutOff,
        })
    }

    #[instrument(skip(self))]
    async fn undefine_domain(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        let domain = state
            .domains
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain {}", name)))?;

        if state.faults.refuse_undefine_with_firmware {
            let config = Element::parse(&domain.xml)?;
            let nvram_exists = config
                .find_all("os/nvram")
                .iter()
                .filter_map(|nvram| nvram.text())
                .any(|path| state.volumes.contains_key(path.trim()));
            if nvram_exists {
                return Err(HypervisorError::Management(format!(
                    "Cannot undefine domain {} with nvram",
                    name
                )));
            }
        }

        state.domains.remove(name);
        state.journal.push(format!("undefine {}", name));
        info!("Mock domain undefined");
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let state = self.read()?;
        state
            .domains
            .get(name)
            .map(|domain| domain.state)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain {}", name)))
    }

    #[instrument(skip(self))]
    async fn guest_agent_command(&self, name: &str, command: &str) -> Result<String> {
        let state = self.read()?;
        let domain = state
            .domains
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain {}", name)))?;

        if domain.state != DomainState::Running || !domain.agent_responsive {
            return Err(HypervisorError::Management(
                "Guest agent is not responding".to_string(),
            ));
        }

        debug!(command = %command, "Mock guest agent answered");
        Ok(r#"{"return":{}}"#.to_string())
    }

    #[instrument(skip(self))]
    async fn interface_addresses(
        &self,
        name: &str,
        source: AddressSource,
    ) -> Result<Vec<InterfaceInfo>> {
        let state = self.read()?;
        let domain = state
            .domains
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("Domain {}", name)))?;

        if domain.state != DomainState::Running {
            return Err(HypervisorError::Management(format!(
                "Requested operation is not valid: domain {} is not running",
                name
            )));
        }
        if source == AddressSource::Agent && !domain.agent_responsive {
            return Err(HypervisorError::Management(
                "Guest agent is not responding".to_string(),
            ));
        }

        Ok(domain.interfaces.get(&source).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl StorageDirectory for MockBackend {
    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        let state = self.read()?;
        Ok(state
            .pools
            .iter()
            .map(|(name, pool)| {
                let volumes = state.volumes.values().filter(|volume| &volume.pool == name);
                let allocation: u64 = volumes.clone().map(|volume| volume.allocation).sum();
                PoolInfo {
                    name: name.clone(),
                    uuid: pool.uuid,
                    state: if pool.active {
                        PoolState::Running
                    } else {
                        PoolState::Inactive
                    },
                    active: pool.active,
                    persistent: true,
                    capacity: POOL_CAPACITY,
                    allocation,
                    available: POOL_CAPACITY.saturating_sub(allocation),
                    number_of_volumes: pool.active.then(|| volumes.count() as u64),
                    target_path: Some(pool.path.clone()),
                }
            })
            .collect())
    }

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>> {
        let pools = self.list_pools().await?;
        Ok(pools.into_iter().find(|pool| pool.name == name))
    }

    async fn lookup_pool_by_target_path(&self, path: &str) -> Result<Option<PoolInfo>> {
        let pools = self.list_pools().await?;
        Ok(pools.into_iter().find(|pool| {
            pool.target_path
                .as_deref()
                .map_or(false, |target| same_dir(target, path))
        }))
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        let state = self.read()?;
        if !state.pools.contains_key(pool) {
            return Err(HypervisorError::NotFound(format!("Storage pool {}", pool)));
        }
        state
            .volumes
            .iter()
            .filter(|(_, volume)| volume.pool == pool)
            .map(|(path, volume)| volume.info(path))
            .collect()
    }

    async fn lookup_volume_by_path(&self, path: &str) -> Result<Option<VolumeInfo>> {
        let state = self.read()?;
        Self::volume_info(&state, path)
    }

    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>> {
        let state = self.read()?;
        match state
            .volumes
            .iter()
            .find(|(_, volume)| volume.pool == pool && volume.name == name)
        {
            Some((path, volume)) => Ok(Some(volume.info(path)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, xml))]
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<VolumeInfo> {
        let request = parse_volume(xml)?;
        let mut state = self.write()?;

        let backing_capacity = request
            .backing_store
            .as_ref()
            .and_then(|(path, _)| state.volumes.get(path))
            .map(|backing| backing.capacity);

        let volume = MockVolume {
            pool: pool.to_string(),
            name: request.name,
            format: request.format,
            capacity: request.capacity.or(backing_capacity).unwrap_or(0),
            allocation: 0,
            backing_store: request.backing_store,
            content: Vec::new(),
        };
        Self::insert_volume(&mut state, pool, volume)
    }

    #[instrument(skip(self, xml))]
    async fn create_volume_from(
        &self,
        pool: &str,
        xml: &str,
        source_path: &str,
        reflink: bool,
    ) -> Result<VolumeInfo> {
        let request = parse_volume(xml)?;
        let mut state = self.write()?;

        if reflink && !state.faults.reflink_supported {
            return Err(HypervisorError::Management(
                "Operation not supported: reflink is not supported on this filesystem".to_string(),
            ));
        }

        let source = state
            .volumes
            .get(source_path)
            .ok_or_else(|| HypervisorError::NotFound(format!("Storage volume {}", source_path)))?;

        let volume = MockVolume {
            pool: pool.to_string(),
            name: request.name,
            format: request.format.or_else(|| source.format.clone()),
            capacity: source.capacity,
            allocation: if reflink { 0 } else { source.allocation },
            backing_store: None,
            content: source.content.clone(),
        };
        Self::insert_volume(&mut state, pool, volume)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, path: &str) -> Result<()> {
        let mut state = self.write()?;
        if state.faults.fail_volume_deletion {
            return Err(HypervisorError::Management(format!(
                "Failed to delete volume {}: injected failure",
                path
            )));
        }
        if state.volumes.remove(path).is_none() {
            return Err(HypervisorError::NotFound(format!("Storage volume {}", path)));
        }
        state.journal.push(format!("delete {}", path));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn upload_volume(&self, path: &str) -> Result<Box<dyn VolumeStream>> {
        let state = self.read()?;
        if !state.volumes.contains_key(path) {
            return Err(HypervisorError::NotFound(format!("Storage volume {}", path)));
        }
        Ok(Box::new(MockStream {
            state: Arc::clone(&self.state),
            path: path.to_string(),
            events: Vec::new(),
            fail: state.faults.fail_uploads,
        }))
    }
}

/// Stream that commits into a mock volume on finish.
struct MockStream {
    state: Arc<RwLock<MockState>>,
    path: String,
    events: Vec<StreamEvent>,
    fail: bool,
}

impl MockStream {
    fn check(&self) -> Result<()> {
        if self.fail {
            return Err(HypervisorError::Management(format!(
                "Upload to {} failed: injected failure",
                self.path
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeStream for MockStream {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check()?;
        self.events.push(StreamEvent::Data(data.to_vec()));
        Ok(())
    }

    async fn send_hole(&mut self, length: u64) -> Result<()> {
        self.check()?;
        self.events.push(StreamEvent::Hole(length));
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let MockStream {
            state, path, events, ..
        } = *self;
        let mut state = state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;

        let (mut capacity, mut allocation) = (0u64, 0u64);
        for event in &events {
            match event {
                StreamEvent::Data(data) => {
                    capacity += data.len() as u64;
                    allocation += data.len() as u64;
                }
                StreamEvent::Hole(length) => capacity += length,
            }
        }

        let volume = state
            .volumes
            .get_mut(&path)
            .ok_or_else(|| HypervisorError::NotFound(format!("Storage volume {}", path)))?;
        volume.capacity = capacity;
        volume.allocation = allocation;
        volume.content = events;
        state.journal.push(format!("upload {}", path));
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        state.aborted_uploads += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type="kvm">
  <name>vm1</name>
  <uuid>0f1c1a83-5e5f-4a50-9e36-6f8a8e7b1b5a</uuid>
  <os><nvram>/nvram/vm1_VARS.fd</nvram></os>
</domain>"#;

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let backend = MockBackend::new();

        let domain = backend.define_domain(DOMAIN).await.unwrap();
        assert_eq!(domain.name, "vm1");
        assert_eq!(domain.state, DomainState::ShutOff);
        assert!(backend.domain_exists("vm1").await.unwrap());
        assert_eq!(backend.domain_xml("vm1").await.unwrap(), DOMAIN);

        let err = backend.define_domain(DOMAIN).await.unwrap_err();
        assert!(matches!(err, HypervisorError::Conflict(_)));

        backend.undefine_domain("vm1").await.unwrap();
        assert!(backend.lookup_domain("vm1").await.unwrap().is_none());
        assert_eq!(backend.journal(), vec!["define vm1", "undefine vm1"]);

        let err = backend.undefine_domain("vm1").await.unwrap_err();
        assert!(matches!(err, HypervisorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_undefine_refused_while_firmware_exists() {
        let backend = MockBackend::new();
        backend.add_pool("nvram", "/nvram");
        backend.add_volume("nvram", "vm1_VARS.fd", "raw", 128).unwrap();
        backend.add_domain(DOMAIN, DomainState::ShutOff).unwrap();
        backend.refuse_undefine_with_firmware(true);

        assert!(backend.undefine_domain("vm1").await.is_err());
        backend.delete_volume("/nvram/vm1_VARS.fd").await.unwrap();
        backend.undefine_domain("vm1").await.unwrap();
    }

    #[tokio::test]
    async fn test_volume_creation() {
        let backend = MockBackend::new();
        backend.add_pool("images", "/images/");
        let source = backend.add_volume("images", "base.qcow2", "qcow2", 4096).unwrap();
        assert_eq!(source, "/images/base.qcow2");

        let pool = backend.lookup_pool_by_target_path("/images").await.unwrap().unwrap();
        assert_eq!(pool.name, "images");
        assert_eq!(pool.number_of_volumes, Some(1));

        let copy = backend
            .create_volume_from("images", "<volume><name>copy</name></volume>", &source, false)
            .await
            .unwrap();
        assert_eq!(copy.path, "/images/copy");

        let err = backend
            .create_volume("images", "<volume><name>copy</name></volume>")
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Conflict(_)));

        let err = backend
            .create_volume("nowhere", "<volume><name>x</name></volume>")
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::NotFound(_)));

        backend.fail_volume_creation("broken");
        let err = backend
            .create_volume("images", "<volume><name>broken</name></volume>")
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Management(_)));

        assert_eq!(backend.journal(), vec!["create /images/copy"]);
    }

    #[tokio::test]
    async fn test_inactive_pool_has_no_volume_count() {
        let backend = MockBackend::new();
        backend.add_pool("images", "/images");
        backend.set_pool_active("images", false);

        let pools = backend.list_pools().await.unwrap();
        assert_eq!(pools[0].state, PoolState::Inactive);
        assert_eq!(pools[0].number_of_volumes, None);
    }

    #[tokio::test]
    async fn test_stream_commits_on_finish() {
        let backend = MockBackend::new();
        backend.add_pool("images", "/images");
        let path = backend.add_volume("images", "disk.raw", "raw", 0).unwrap();

        let mut stream = backend.upload_volume(&path).await.unwrap();
        stream.send(b"abc").await.unwrap();
        stream.send_hole(1024).await.unwrap();
        stream.finish().await.unwrap();

        let volume = backend.lookup_volume_by_path(&path).await.unwrap().unwrap();
        assert!(volume.xml.contains(r#"<capacity unit="bytes">1027</capacity>"#));
        assert!(volume.xml.contains(r#"<allocation unit="bytes">3</allocation>"#));
        assert_eq!(
            backend.uploaded_content(&path).unwrap(),
            vec![StreamEvent::Data(b"abc".to_vec()), StreamEvent::Hole(1024)]
        );
    }

    #[tokio::test]
    async fn test_guest_agent() {
        let backend = MockBackend::new();
        backend.add_domain(DOMAIN, DomainState::ShutOff).unwrap();
        let ping = r#"{"execute":"guest-ping"}"#;

        assert!(backend.guest_agent_command("vm1", ping).await.is_err());

        backend.set_domain_state("vm1", DomainState::Running);
        assert!(backend.guest_agent_command("vm1", ping).await.is_ok());

        backend.set_guest_agent_responsive("vm1", false);
        assert!(backend.guest_agent_command("vm1", ping).await.is_err());
    }

    #[tokio::test]
    async fn test_interface_addresses_need_running_domain() {
        let backend = MockBackend::new();
        backend.add_domain(DOMAIN, DomainState::ShutOff).unwrap();
        let interface = InterfaceInfo {
            name: "eth0".to_string(),
            hwaddr: "52:54:00:11:22:33".to_string(),
            addresses: vec![InterfaceAddress {
                address: "10.0.0.5".to_string(),
                prefix: 24,
                address_type: AddressType::IPv4,
            }],
        };
        backend.set_interfaces("vm1", AddressSource::Agent, vec![interface.clone()]);

        let err = backend
            .interface_addresses("vm1", AddressSource::Agent)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Management(_)));

        backend.set_domain_state("vm1", DomainState::Running);
        assert_eq!(
            backend.interface_addresses("vm1", AddressSource::Agent).await.unwrap(),
            vec![interface]
        );
        assert!(backend
            .interface_addresses("vm1", AddressSource::Lease)
            .await
            .unwrap()
            .is_empty());

        backend.set_guest_agent_responsive("vm1", false);
        assert!(backend.interface_addresses("vm1", AddressSource::Agent).await.is_err());

        let err = backend
            .interface_addresses("missing", AddressSource::Arp)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::NotFound(_)));
    }
}
