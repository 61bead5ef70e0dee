//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vmsmith_hypervisor::{AddressSource, CloneMode};

/// vmsmith - Automate common virtual machine management tasks
#[derive(Parser, Debug)]
#[command(name = "vmsmith")]
#[command(about = "Automate common virtual machine management tasks")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (defaults to /etc/vmsmith/vmsmith.yaml if present)
    #[arg(long, env = "VMSMITH_CONFIG", global = true)]
    pub config: Option<String>,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(short = 'c', long, env = "LIBVIRT_DEFAULT_URI", global = true)]
    pub connect: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Enable development mode (mock backend)
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List all domains, running or not
    DomainList,

    /// Clone a shut-off domain
    DomainClone {
        /// Name of the domain to clone
        domain: String,
        /// Name of the new domain
        newname: String,
        /// How disks are cloned (copy, reflink, linked)
        #[arg(long, default_value = "copy")]
        mode: CloneMode,
    },

    /// List network interfaces of a running domain
    DomainIfaceList {
        /// Name of the domain
        domain: String,
        /// Where addresses are learned from (lease, agent, arp)
        #[arg(long, default_value = "lease")]
        source: AddressSource,
    },

    /// Check whether the guest agent of a domain answers
    GuestPing {
        /// Name of the domain to ping
        domain: String,
    },

    /// List all storage pools
    PoolList,

    /// List the volumes of a storage pool
    VolumeList {
        /// Name of the storage pool
        pool: String,
    },

    /// Import a local disk image into a storage pool
    VolumeImport {
        /// Path of the disk image
        file: PathBuf,
        /// Name of the storage pool
        pool: String,
    },
}
