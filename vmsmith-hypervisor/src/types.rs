//! Type definitions for domains, pools and volumes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::HypervisorError;

// =============================================================================
// DOMAINS
// =============================================================================

/// Run state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainState {
    #[serde(rename = "no state")]
    NoState,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "shutdown")]
    Shutdown,
    #[serde(rename = "shut-off")]
    ShutOff,
    #[serde(rename = "crashed")]
    Crashed,
    #[serde(rename = "suspended")]
    Suspended,
    #[serde(rename = "unknown")]
    Unknown,
}

impl DomainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "no state",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::ShutOff => "shut-off",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
            DomainState::Unknown => "unknown",
        }
    }
}

impl Default for DomainState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a defined domain, as reported by `list_domains`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// UUID of the domain
    pub uuid: Uuid,
    /// Name of the domain
    pub name: String,
    /// Current state of the domain
    pub state: DomainState,
}

// =============================================================================
// NETWORK INTERFACES
// =============================================================================

/// Where the addresses of a domain's interfaces are learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    /// DHCP leases handed out by libvirt's own networks.
    Lease,
    /// The guest agent running inside the domain.
    Agent,
    /// The host's ARP table.
    Arp,
}

impl AddressSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressSource::Lease => "lease",
            AddressSource::Agent => "agent",
            AddressSource::Arp => "arp",
        }
    }
}

impl Default for AddressSource {
    fn default() -> Self {
        Self::Lease
    }
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressSource {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lease" => Ok(AddressSource::Lease),
            "agent" => Ok(AddressSource::Agent),
            "arp" => Ok(AddressSource::Arp),
            other => Err(HypervisorError::InvalidInput(format!(
                "Unknown address source: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    IPv4,
    IPv6,
}

/// One IP address of a network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub address: String,
    /// Network prefix length
    pub prefix: u64,
    #[serde(rename = "type")]
    pub address_type: AddressType,
}

/// Network interface of a running domain with its addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Interface name, as seen by the source that reported it
    pub name: String,
    /// MAC address
    pub hwaddr: String,
    pub addresses: Vec<InterfaceAddress>,
}

// =============================================================================
// CLONING
// =============================================================================

/// How the disks of a domain are cloned.
///
/// Firmware is always copied, whatever the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneMode {
    /// Full byte-for-byte copy in the source format.
    Copy,
    /// Copy that asks the filesystem to share blocks (copy-on-write).
    Reflink,
    /// New qcow2 volume backed by the original, unmodified volume.
    Linked,
}

impl CloneMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneMode::Copy => "copy",
            CloneMode::Reflink => "reflink",
            CloneMode::Linked => "linked",
        }
    }
}

impl Default for CloneMode {
    fn default() -> Self {
        Self::Copy
    }
}

impl fmt::Display for CloneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloneMode {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(CloneMode::Copy),
            "reflink" => Ok(CloneMode::Reflink),
            "linked" => Ok(CloneMode::Linked),
            other => Err(HypervisorError::InvalidInput(format!(
                "Unknown clone mode: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// STORAGE POOLS
// =============================================================================

/// State of a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Inactive,
    Building,
    Running,
    Degraded,
    Inaccessible,
    Unknown,
}

impl Default for PoolState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Storage pool summary, as reported by `list_pools`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub uuid: Uuid,
    pub state: PoolState,
    pub active: bool,
    pub persistent: bool,
    /// Total capacity in bytes
    pub capacity: u64,
    /// Allocated bytes
    pub allocation: u64,
    /// Free bytes
    pub available: u64,
    /// Number of volumes (None while the pool is inactive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_volumes: Option<u64>,
    /// Directory the pool is rooted at, if it has one
    #[serde(skip)]
    pub target_path: Option<String>,
}

// =============================================================================
// VOLUMES
// =============================================================================

/// Handle to a storage volume as returned by the management API.
///
/// `xml` carries the volume descriptor document; use
/// [`crate::volume::VolumeDescriptor::from_volume`] to interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub key: String,
    pub path: String,
    pub xml: String,
}
