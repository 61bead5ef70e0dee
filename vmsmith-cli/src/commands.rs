//! Subcommand execution against a management backend.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::process::ExitCode;
use tracing::info;

use vmsmith_hypervisor::{
    clone_domain, import_volume, list_domain_interfaces, list_domains, list_pools, list_volumes,
    ping_guest, FormatProbe, ManagementApi,
};

use crate::cli::Command;

/// How a command that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The command ran but reports a negative answer, like an unanswered
    /// guest ping.
    Negative,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => ExitCode::SUCCESS,
            Outcome::Negative => ExitCode::FAILURE,
        }
    }
}

/// Run `command` against `api`, writing its output to `out`.
pub async fn execute<A, W>(api: &A, probe: &dyn FormatProbe, command: &Command, out: &mut W) -> Result<Outcome>
where
    A: ManagementApi + ?Sized,
    W: Write,
{
    match command {
        Command::DomainList => {
            let domains = list_domains(api).await.context("Failed to list domains")?;
            print_json(out, &domains)?;
        }
        Command::DomainClone { domain, newname, mode } => {
            clone_domain(api, domain, newname, *mode)
                .await
                .with_context(|| format!("Failed to clone {} to {}", domain, newname))?;
            info!(domain = %domain, clone = %newname, mode = %mode, "Domain cloned");
        }
        Command::DomainIfaceList { domain, source } => {
            let interfaces = list_domain_interfaces(api, domain, *source)
                .await
                .with_context(|| format!("Failed to list interfaces of {}", domain))?;
            print_json(out, &interfaces)?;
        }
        Command::GuestPing { domain } => {
            let answered = ping_guest(api, domain)
                .await
                .with_context(|| format!("Failed to ping guest agent of {}", domain))?;
            if !answered {
                writeln!(out, "Guest agent of {} did not answer", domain)?;
                return Ok(Outcome::Negative);
            }
        }
        Command::PoolList => {
            let pools = list_pools(api).await.context("Failed to list storage pools")?;
            print_json(out, &pools)?;
        }
        Command::VolumeList { pool } => {
            let volumes = list_volumes(api, pool)
                .await
                .with_context(|| format!("Failed to list volumes of {}", pool))?;
            print_json(out, &volumes)?;
        }
        Command::VolumeImport { file, pool } => {
            import_volume(api, probe, file, pool)
                .await
                .with_context(|| format!("Failed to import {} into {}", file.display(), pool))?;
            info!(file = %file.display(), pool = %pool, "Volume imported");
        }
    }

    Ok(Outcome::Success)
}

fn print_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write as _;
    use std::path::{Path, PathBuf};
    use vmsmith_hypervisor::mock::StreamEvent;
    use vmsmith_hypervisor::{
        AddressSource, AddressType, CloneMode, DomainState, InterfaceAddress, InterfaceInfo,
        MockBackend,
    };

    const DOMAIN: &str = r#"<domain type="kvm">
  <name>vm1</name>
  <uuid>7d5f3c1e-2a44-4d6b-8b8e-3f2f6a1c9d10</uuid>
  <devices>
    <disk type="file" device="disk">
      <driver name="qemu" type="qcow2"/>
      <source file="/var/lib/libvirt/images/vm1.qcow2"/>
      <target dev="vda" bus="virtio"/>
    </disk>
  </devices>
</domain>"#;

    struct RawProbe;

    #[async_trait]
    impl FormatProbe for RawProbe {
        async fn probe(&self, _path: &Path) -> vmsmith_hypervisor::Result<String> {
            Ok("raw".to_string())
        }
    }

    fn backend() -> MockBackend {
        let backend = MockBackend::new();
        backend.add_pool("default", "/var/lib/libvirt/images");
        backend
            .add_volume("default", "vm1.qcow2", "qcow2", 1 << 30)
            .unwrap();
        backend.add_domain(DOMAIN, DomainState::ShutOff).unwrap();
        backend
    }

    async fn run(backend: &MockBackend, command: Command) -> (Result<Outcome>, String) {
        let mut out = Vec::new();
        let result = execute(backend, &RawProbe, &command, &mut out).await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_domain_list_prints_json() {
        let backend = backend();
        let (result, out) = run(&backend, Command::DomainList).await;
        assert_eq!(result.unwrap(), Outcome::Success);

        let domains: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(domains[0]["name"], "vm1");
        assert_eq!(domains[0]["state"], "shut-off");
    }

    #[tokio::test]
    async fn test_domain_clone_then_list() {
        let backend = backend();
        let (result, out) = run(
            &backend,
            Command::DomainClone {
                domain: "vm1".to_string(),
                newname: "vm1-clone".to_string(),
                mode: CloneMode::Linked,
            },
        )
        .await;
        assert_eq!(result.unwrap(), Outcome::Success);
        assert!(out.is_empty());

        let (_, out) = run(
            &backend,
            Command::VolumeList {
                pool: "default".to_string(),
            },
        )
        .await;
        let volumes: serde_json::Value = serde_json::from_str(&out).unwrap();
        let names: Vec<&str> = volumes
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["vm1-clone-vm1.qcow2", "vm1.qcow2"]);
    }

    #[tokio::test]
    async fn test_clone_error_carries_context() {
        let backend = backend();
        let (result, _) = run(
            &backend,
            Command::DomainClone {
                domain: "missing".to_string(),
                newname: "copy".to_string(),
                mode: CloneMode::Copy,
            },
        )
        .await;
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.starts_with("Failed to clone missing to copy"));
    }

    #[tokio::test]
    async fn test_guest_ping_exit_codes() {
        let backend = backend();
        let ping = Command::GuestPing {
            domain: "vm1".to_string(),
        };

        let (result, out) = run(&backend, ping.clone()).await;
        assert_eq!(result.unwrap(), Outcome::Negative);
        assert!(out.contains("did not answer"));

        backend.set_domain_state("vm1", DomainState::Running);
        let (result, out) = run(&backend, ping).await;
        assert_eq!(result.unwrap(), Outcome::Success);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_domain_iface_list() {
        let backend = backend();
        backend.set_interfaces(
            "vm1",
            AddressSource::Lease,
            vec![InterfaceInfo {
                name: "vnet0".to_string(),
                hwaddr: "52:54:00:4c:4e:25".to_string(),
                addresses: vec![InterfaceAddress {
                    address: "192.168.122.76".to_string(),
                    prefix: 24,
                    address_type: AddressType::IPv4,
                }],
            }],
        );
        let list = Command::DomainIfaceList {
            domain: "vm1".to_string(),
            source: AddressSource::Lease,
        };

        let (result, _) = run(&backend, list.clone()).await;
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.starts_with("Failed to list interfaces of vm1"));

        backend.set_domain_state("vm1", DomainState::Running);
        let (result, out) = run(&backend, list).await;
        assert_eq!(result.unwrap(), Outcome::Success);
        let interfaces: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(interfaces[0]["name"], "vnet0");
        assert_eq!(interfaces[0]["addresses"][0]["address"], "192.168.122.76");
        assert_eq!(interfaces[0]["addresses"][0]["type"], "IPv4");
    }

    #[tokio::test]
    async fn test_pool_list_and_import() {
        let backend = backend();
        let mut file = tempfile::Builder::new().suffix(".img").tempfile().unwrap();
        file.write_all(b"boot sector").unwrap();
        let path: PathBuf = file.path().to_path_buf();

        let (result, _) = run(
            &backend,
            Command::VolumeImport {
                file: path.clone(),
                pool: "default".to_string(),
            },
        )
        .await;
        assert_eq!(result.unwrap(), Outcome::Success);

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let uploaded = format!("/var/lib/libvirt/images/{}", name);
        assert_eq!(
            backend.uploaded_content(&uploaded).unwrap(),
            vec![StreamEvent::Data(b"boot sector".to_vec())]
        );

        let (result, out) = run(&backend, Command::PoolList).await;
        assert_eq!(result.unwrap(), Outcome::Success);
        let pools: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(pools[0]["name"], "default");
    }
}
