//! # vmsmith
//!
//! Command-line front end for common virtual machine management tasks:
//! cloning shut-off domains, importing disk images as sparse volumes,
//! listing domains, pools and volumes, pinging guest agents and listing
//! the network interfaces of running domains.
//!
//! Listings are printed as JSON on stdout, logs go to stderr.
//!
//! ## Usage
//! ```bash
//! vmsmith domain-clone vm1 vm1-clone --mode linked
//! vmsmith volume-import ./disk.qcow2 default
//! vmsmith --dev pool-list
//! vmsmith domain-iface-list vm1 --source agent
//! ```

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, warn};

use vmsmith_hypervisor::{ManagementApi, MockBackend, QemuImgProbe};

mod cli;
mod commands;
mod config;

use cli::Args;
use config::{Backend, Config, LogFormat};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = Config::resolve(&args)?;

    match config.logging.format {
        LogFormat::Json => vmsmith_common::init_logging_json(&config.logging.level)?,
        LogFormat::Pretty => vmsmith_common::init_logging(&config.logging.level)?,
    }

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.connection.backend,
        uri = ?config.connection.uri,
        "Starting vmsmith"
    );

    let backend = connect(&config).await?;
    let probe = QemuImgProbe::new().with_qemu_img(config.storage.qemu_img_path.clone());

    let mut stdout = std::io::stdout().lock();
    let outcome = commands::execute(backend.as_ref(), &probe, &args.command, &mut stdout).await?;

    Ok(outcome.into())
}

/// Open the management backend selected by the configuration.
async fn connect(config: &Config) -> Result<Box<dyn ManagementApi>> {
    match config.connection.backend {
        Backend::Mock => {
            warn!("Using mock backend, changes are not persisted");
            Ok(Box::new(MockBackend::new()))
        }
        Backend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                let backend =
                    vmsmith_hypervisor::LibvirtBackend::new(config.connection.uri.as_deref()).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "libvirt"))]
            {
                anyhow::bail!(
                    "Libvirt support is not compiled in; rebuild with --features libvirt or pass --dev"
                )
            }
        }
    }
}
