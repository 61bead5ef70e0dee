//! Rewriting of a domain configuration into a clone-ready configuration.
//!
//! The rewriter never touches the management API itself; the only outside
//! calls are the ones the identifier factories make. Constructs it does not
//! recognize are left untouched instead of being reported as errors.

use tracing::{debug, instrument};

use super::source::{SourceFirmware, SourceVolume};
use crate::error::{HypervisorError, Result};
use crate::identity::{MacFactory, UuidFactory};
use crate::types::CloneMode;
use crate::xml::Element;

/// Value of the `websocket` attribute that disables the VNC websocket.
const NO_WEBSOCKET: &str = "-1";

/// Rewritten configuration plus every storage artifact it refers to.
///
/// Built once per clone request and consumed by
/// [`super::DomainCloner::execute`].
#[derive(Debug, Clone)]
pub struct ClonePlan {
    pub clone_name: String,
    pub mode: CloneMode,
    /// Serialized configuration of the new domain
    pub config: String,
    /// Firmware to copy, in document order
    pub firmware: Vec<SourceFirmware>,
    /// Disk volumes to materialize, in document order
    pub volumes: Vec<SourceVolume>,
}

/// Turn `source_config` into the configuration of a clone named `new_name`.
#[instrument(skip(source_config, uuid_factory, mac_factory), fields(new_name = %new_name, mode = %mode))]
pub async fn rewrite(
    source_config: &str,
    new_name: &str,
    mode: CloneMode,
    uuid_factory: &mut dyn UuidFactory,
    mac_factory: &mut dyn MacFactory,
) -> Result<ClonePlan> {
    let mut config = Element::parse(source_config)?;

    config
        .child_mut("name")
        .ok_or_else(|| HypervisorError::InvalidInput("Required <name> is missing".to_string()))?
        .set_text(new_name);

    if config.child("uuid").is_none() {
        return Err(HypervisorError::InvalidInput(
            "Required <uuid> is missing".to_string(),
        ));
    }
    let uuid = uuid_factory.create().await?;
    if let Some(element) = config.child_mut("uuid") {
        element.set_text(uuid.to_string());
    }

    let firmware = rewrite_firmware(&mut config, new_name);
    let volumes = rewrite_disks(&mut config, new_name, mode);
    rewrite_interfaces(&mut config, mac_factory).await?;
    rewrite_graphics(&mut config);

    debug!(
        firmware = firmware.len(),
        volumes = volumes.len(),
        "Clone configuration rewritten"
    );

    Ok(ClonePlan {
        clone_name: new_name.to_string(),
        mode,
        config: config.to_xml_string()?,
        firmware,
        volumes,
    })
}

/// File-backed NVRAM is pointed at its future copy.
fn rewrite_firmware(config: &mut Element, new_name: &str) -> Vec<SourceFirmware> {
    let mut firmware = Vec::new();

    for nvram in config.find_all_mut("os/nvram") {
        // Network-backed firmware cannot be copied through a pool.
        if nvram.attr("type").map_or(false, |kind| kind != "file") {
            continue;
        }

        let source_path = match nvram.text() {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => continue,
        };

        let source = SourceFirmware::new(source_path, new_name);
        nvram.set_text(source.clone_path());
        firmware.push(source);
    }

    firmware
}

/// Writable, file-backed disks with a declared format are pointed at their
/// future clone. Linked clones are always qcow2.
fn rewrite_disks(config: &mut Element, new_name: &str, mode: CloneMode) -> Vec<SourceVolume> {
    let mut volumes = Vec::new();

    for disk in config.find_all_mut("devices/disk") {
        if disk.child("readonly").is_some() {
            continue;
        }
        if disk.attr("type") != Some("file") {
            continue;
        }

        let source_path = match disk.child("source").and_then(|source| source.attr("file")) {
            Some(path) => path.to_string(),
            None => continue,
        };
        let source_format = match disk.child("driver").and_then(|driver| driver.attr("type")) {
            Some(format) => format.to_string(),
            None => continue,
        };

        let volume = SourceVolume::new(source_path, source_format, new_name);

        if let Some(source) = disk.child_mut("source") {
            source.set_attr("file", volume.clone_path());
        }
        if mode == CloneMode::Linked {
            if let Some(driver) = disk.child_mut("driver") {
                driver.set_attr("type", "qcow2");
            }
        }

        volumes.push(volume);
    }

    volumes
}

/// Fresh MAC addresses, and no fixed target device names so the hypervisor
/// picks names that do not clash with the source domain.
async fn rewrite_interfaces(config: &mut Element, mac_factory: &mut dyn MacFactory) -> Result<()> {
    for mac in config.find_all_mut("devices/interface/mac") {
        let current = match mac.attr("address") {
            Some(address) => address.to_string(),
            None => continue,
        };
        let generated = mac_factory.create_from(&current).await?;
        mac.set_attr("address", generated);
    }

    for interface in config.find_all_mut("devices/interface") {
        interface.remove_children("target");
    }

    Ok(())
}

/// Fixed ports become automatically allocated ports. Websockets do not
/// support automatic allocation, so they are turned off.
fn rewrite_graphics(config: &mut Element) {
    for graphics in config.find_all_mut("devices/graphics") {
        if graphics.remove_attr("port").is_some() {
            graphics.set_attr("autoport", "yes");
        }
        if graphics.remove_attr("tlsPort").is_some() {
            graphics.set_attr("autoport", "yes");
        }
        if graphics.has_attr("websocket") {
            graphics.set_attr("websocket", NO_WEBSOCKET);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct FixedUuidFactory(pub Uuid);

    #[async_trait]
    impl UuidFactory for FixedUuidFactory {
        async fn create(&mut self) -> Result<Uuid> {
            Ok(self.0)
        }
    }

    /// Replaces the last octet with a counter.
    struct CountingMacFactory(pub u8);

    #[async_trait]
    impl MacFactory for CountingMacFactory {
        async fn create_from(&mut self, mac_address: &str) -> Result<String> {
            self.0 += 1;
            Ok(format!("{}:{:02x}", &mac_address[..14], self.0))
        }
    }

    const UUID: &str = "e5a8d70e-0cb5-49af-bf66-59c13180e344";

    const UEFI_DOMAIN: &str = r#"<domain type="kvm">
  <name>vm1</name>
  <uuid>8a2ea3e5-8d46-4b2f-9d2a-6a0b8b1f9c11</uuid>
  <os>
    <type arch="x86_64" machine="q35">hvm</type>
    <loader readonly="yes" type="pflash">/usr/share/OVMF/OVMF_CODE.fd</loader>
    <nvram>/var/lib/libvirt/qemu/nvram/vm1_VARS.fd</nvram>
  </os>
  <devices>
    <disk type="file" device="disk">
      <driver name="qemu" type="raw"/>
      <source file="/var/lib/libvirt/images/vm1.img"/>
      <target dev="vda" bus="virtio"/>
    </disk>
    <disk type="file" device="cdrom">
      <driver name="qemu" type="raw"/>
      <source file="/iso/install.iso"/>
      <target dev="sda" bus="sata"/>
      <readonly/>
    </disk>
    <disk type="network" device="disk">
      <driver name="qemu" type="raw"/>
      <source protocol="rbd" name="pool/image"/>
    </disk>
    <disk type="file" device="disk">
      <source file="/var/lib/libvirt/images/no-driver.qcow2"/>
    </disk>
    <interface type="network">
      <mac address="52:54:00:4c:4e:25"/>
      <source network="default"/>
      <target dev="vnet3"/>
    </interface>
    <interface type="bridge">
      <source bridge="br0"/>
    </interface>
    <graphics type="spice" port="5901" tlsPort="5902" autoport="no"/>
    <graphics type="vnc" port="5903" websocket="5704"/>
    <graphics type="vnc" autoport="yes"/>
  </devices>
</domain>"#;

    async fn plan(config: &str, mode: CloneMode) -> Result<ClonePlan> {
        let mut uuids = FixedUuidFactory(Uuid::parse_str(UUID).unwrap());
        let mut macs = CountingMacFactory(0);
        rewrite(config, "vm1-clone", mode, &mut uuids, &mut macs).await
    }

    #[tokio::test]
    async fn test_name_uuid_and_firmware() {
        let plan = plan(UEFI_DOMAIN, CloneMode::Copy).await.unwrap();
        let config = Element::parse(&plan.config).unwrap();

        assert_eq!(config.child("name").unwrap().text().unwrap(), "vm1-clone");
        assert_eq!(config.child("uuid").unwrap().text().unwrap(), UUID);
        assert_eq!(
            config.find("os/nvram").unwrap().text().unwrap(),
            "/var/lib/libvirt/qemu/nvram/vm1-clone-vm1_VARS.fd"
        );
        assert_eq!(
            plan.firmware,
            vec![SourceFirmware::new("/var/lib/libvirt/qemu/nvram/vm1_VARS.fd", "vm1-clone")]
        );
        // The loader is shared read-only code and stays untouched.
        assert_eq!(
            config.find("os/loader").unwrap().text().unwrap(),
            "/usr/share/OVMF/OVMF_CODE.fd"
        );
    }

    #[tokio::test]
    async fn test_only_clonable_disks_are_planned() {
        let plan = plan(UEFI_DOMAIN, CloneMode::Copy).await.unwrap();
        let config = Element::parse(&plan.config).unwrap();

        assert_eq!(
            plan.volumes,
            vec![SourceVolume::new("/var/lib/libvirt/images/vm1.img", "raw", "vm1-clone")]
        );

        let sources: Vec<_> = config
            .find_all("devices/disk/source")
            .iter()
            .filter_map(|source| source.attr("file").map(str::to_string))
            .collect();
        assert_eq!(
            sources,
            vec![
                "/var/lib/libvirt/images/vm1-clone-vm1.img".to_string(),
                "/iso/install.iso".to_string(),
                "/var/lib/libvirt/images/no-driver.qcow2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_driver_format_per_mode() {
        for mode in [CloneMode::Copy, CloneMode::Reflink] {
            let plan = plan(UEFI_DOMAIN, mode).await.unwrap();
            let config = Element::parse(&plan.config).unwrap();
            let driver = config.find("devices/disk/driver").unwrap();
            assert_eq!(driver.attr("type"), Some("raw"));
        }

        let plan = plan(UEFI_DOMAIN, CloneMode::Linked).await.unwrap();
        let config = Element::parse(&plan.config).unwrap();
        let drivers = config.find_all("devices/disk/driver");
        assert_eq!(drivers[0].attr("type"), Some("qcow2"));
        // Read-only disks are not cloned and keep their format.
        assert_eq!(drivers[1].attr("type"), Some("raw"));
        assert_eq!(plan.volumes[0].source_format, "raw");
    }

    #[tokio::test]
    async fn test_interfaces() {
        let plan = plan(UEFI_DOMAIN, CloneMode::Copy).await.unwrap();
        let config = Element::parse(&plan.config).unwrap();

        let macs = config.find_all("devices/interface/mac");
        assert_eq!(macs.len(), 1);
        assert_eq!(macs[0].attr("address"), Some("52:54:00:4c:4e:01"));
        assert!(config.find("devices/interface/target").is_none());
        assert_eq!(config.find_all("devices/interface").len(), 2);
    }

    #[tokio::test]
    async fn test_graphics() {
        let plan = plan(UEFI_DOMAIN, CloneMode::Copy).await.unwrap();
        let config = Element::parse(&plan.config).unwrap();
        let graphics = config.find_all("devices/graphics");

        assert_eq!(graphics[0].attr("port"), None);
        assert_eq!(graphics[0].attr("tlsPort"), None);
        assert_eq!(graphics[0].attr("autoport"), Some("yes"));

        assert_eq!(graphics[1].attr("port"), None);
        assert_eq!(graphics[1].attr("autoport"), Some("yes"));
        assert_eq!(graphics[1].attr("websocket"), Some(NO_WEBSOCKET));

        assert_eq!(graphics[2].attr("autoport"), Some("yes"));
        assert_eq!(graphics[2].attr("websocket"), None);
    }

    #[tokio::test]
    async fn test_network_firmware_is_skipped() {
        let config = r#"<domain>
  <name>vm1</name>
  <uuid>8a2ea3e5-8d46-4b2f-9d2a-6a0b8b1f9c11</uuid>
  <os>
    <nvram type="network"><source protocol="iscsi" name="iqn.2013-07.com.example:iscsi-nopool"/></nvram>
    <nvram/>
  </os>
</domain>"#;

        let plan = plan(config, CloneMode::Copy).await.unwrap();
        assert!(plan.firmware.is_empty());
        assert!(plan.volumes.is_empty());
    }

    #[tokio::test]
    async fn test_missing_name_or_uuid_is_malformed() {
        let err = plan("<domain><uuid>x</uuid></domain>", CloneMode::Copy)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidInput(_)));

        let err = plan("<domain><name>vm1</name></domain>", CloneMode::Copy)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidInput(_)));

        let err = plan("<domain><name>vm1", CloneMode::Copy).await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_invalid_mac_aborts_rewrite() {
        let config = r#"<domain>
  <name>vm1</name>
  <uuid>8a2ea3e5-8d46-4b2f-9d2a-6a0b8b1f9c11</uuid>
  <devices><interface type="network"><mac address="not-a-mac"/></interface></devices>
</domain>"#;

        let backend = crate::mock::MockBackend::new();
        let mut uuids = FixedUuidFactory(Uuid::parse_str(UUID).unwrap());
        let mut macs = crate::identity::InventoryMacFactory::new(&backend);
        let err = rewrite(config, "vm1-clone", CloneMode::Copy, &mut uuids, &mut macs)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidInput(_)));
    }
}
