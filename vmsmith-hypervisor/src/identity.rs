//! Collision-free identifiers for cloned domains.
//!
//! Both factories draw candidates from an injected random source and check
//! them against every domain currently defined through the management API.
//! Seeding the random source makes the produced sequence deterministic.
//!
//! MAC addresses are only checked against the configuration of locally
//! defined domains. Guests on other hosts of the same network segment (only
//! visible through ARP) are not consulted, so a collision with them remains
//! possible.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{HypervisorError, Result};
use crate::traits::DomainDirectory;
use crate::xml::Element;

/// Number of candidates tried before giving up.
pub const MAX_ATTEMPTS: u32 = 100;

/// Produces UUIDs for new domains.
#[async_trait]
pub trait UuidFactory: Send {
    async fn create(&mut self) -> Result<Uuid>;
}

/// Produces MAC addresses derived from an existing one.
#[async_trait]
pub trait MacFactory: Send {
    async fn create_from(&mut self, mac_address: &str) -> Result<String>;
}

/// Returns true if `mac_address` is six colon-separated hex octets.
pub fn is_valid_mac(mac_address: &str) -> bool {
    let octets: Vec<&str> = mac_address.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}

// =============================================================================
// UUIDs
// =============================================================================

/// UUID factory that avoids the UUIDs of all defined domains.
pub struct InventoryUuidFactory<'a, D: ?Sized, R = StdRng> {
    directory: &'a D,
    rng: R,
    attempts: u32,
}

impl<'a, D: DomainDirectory + ?Sized> InventoryUuidFactory<'a, D, StdRng> {
    /// Create a factory seeded from the operating system.
    pub fn new(directory: &'a D) -> Self {
        Self::with_rng(directory, StdRng::from_entropy())
    }
}

impl<'a, D: DomainDirectory + ?Sized, R: RngCore + Send> InventoryUuidFactory<'a, D, R> {
    /// Create a factory drawing from the given random source.
    pub fn with_rng(directory: &'a D, rng: R) -> Self {
        Self {
            directory,
            rng,
            attempts: 0,
        }
    }

    /// Attempts used by the most recent call to `create`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[async_trait]
impl<'a, D, R> UuidFactory for InventoryUuidFactory<'a, D, R>
where
    D: DomainDirectory + ?Sized,
    R: RngCore + Send,
{
    #[instrument(skip(self))]
    async fn create(&mut self) -> Result<Uuid> {
        for attempt in 1..=MAX_ATTEMPTS {
            self.attempts = attempt;

            let mut bytes = [0u8; 16];
            self.rng.fill_bytes(&mut bytes);
            let candidate = uuid::Builder::from_random_bytes(bytes).into_uuid();

            if !uuid_exists(self.directory, &candidate).await? {
                debug!(uuid = %candidate, attempts = attempt, "Generated UUID");
                return Ok(candidate);
            }
        }

        Err(HypervisorError::ExhaustedAttempts {
            what: "UUID",
            attempts: MAX_ATTEMPTS,
        })
    }
}

// =============================================================================
// MAC ADDRESSES
// =============================================================================

/// MAC factory that keeps the OUI of the seed address and randomizes the
/// rest, avoiding every MAC address configured on a defined domain.
pub struct InventoryMacFactory<'a, D: ?Sized, R = StdRng> {
    directory: &'a D,
    rng: R,
    attempts: u32,
}

impl<'a, D: DomainDirectory + ?Sized> InventoryMacFactory<'a, D, StdRng> {
    /// Create a factory seeded from the operating system.
    pub fn new(directory: &'a D) -> Self {
        Self::with_rng(directory, StdRng::from_entropy())
    }
}

impl<'a, D: DomainDirectory + ?Sized, R: RngCore + Send> InventoryMacFactory<'a, D, R> {
    /// Create a factory drawing from the given random source.
    pub fn with_rng(directory: &'a D, rng: R) -> Self {
        Self {
            directory,
            rng,
            attempts: 0,
        }
    }

    /// Attempts used by the most recent call to `create_from`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[async_trait]
impl<'a, D, R> MacFactory for InventoryMacFactory<'a, D, R>
where
    D: DomainDirectory + ?Sized,
    R: RngCore + Send,
{
    #[instrument(skip(self))]
    async fn create_from(&mut self, mac_address: &str) -> Result<String> {
        if !is_valid_mac(mac_address) {
            return Err(HypervisorError::InvalidInput(format!(
                "Invalid MAC address: {}",
                mac_address
            )));
        }

        let oui = &mac_address[..8];
        for attempt in 1..=MAX_ATTEMPTS {
            self.attempts = attempt;

            let candidate = format!(
                "{}:{:02x}:{:02x}:{:02x}",
                oui,
                self.rng.gen::<u8>(),
                self.rng.gen::<u8>(),
                self.rng.gen::<u8>()
            );

            if !mac_exists(self.directory, &candidate).await? {
                debug!(mac = %candidate, attempts = attempt, "Generated MAC address");
                return Ok(candidate);
            }
        }

        Err(HypervisorError::ExhaustedAttempts {
            what: "MAC address",
            attempts: MAX_ATTEMPTS,
        })
    }
}

async fn uuid_exists<D: DomainDirectory + ?Sized>(directory: &D, uuid: &Uuid) -> Result<bool> {
    let domains = directory.list_domains().await?;
    Ok(domains.iter().any(|domain| domain.uuid == *uuid))
}

/// Whether any defined domain, running or not, has an interface with this
/// MAC address in its configuration.
async fn mac_exists<D: DomainDirectory + ?Sized>(directory: &D, mac_address: &str) -> Result<bool> {
    for domain in directory.list_domains().await? {
        let xml = directory.domain_xml(&domain.name).await?;
        let config = Element::parse(&xml)?;
        let in_use = config
            .find_all("devices/interface/mac")
            .iter()
            .filter_map(|mac| mac.attr("address"))
            .any(|address| address.eq_ignore_ascii_case(mac_address));
        if in_use {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::traits::DomainDirectory;

    fn domain_with_mac(name: &str, uuid: &Uuid, mac: &str) -> String {
        format!(
            r#"<domain type="kvm">
  <name>{}</name>
  <uuid>{}</uuid>
  <devices>
    <interface type="network">
      <mac address="{}"/>
    </interface>
  </devices>
</domain>"#,
            name, uuid, mac
        )
    }

    #[test]
    fn test_is_valid_mac() {
        assert!(is_valid_mac("52:54:00:4c:4e:25"));
        assert!(is_valid_mac("52:54:00:4C:4E:25"));
        assert!(!is_valid_mac("_"));
        assert!(!is_valid_mac("z0:00:00:00:00:00"));
        assert!(!is_valid_mac("52:54:00:4c:4e"));
        assert!(!is_valid_mac("52:54:00:4c:4e:25:00"));
        assert!(!is_valid_mac("52-54-00-4c-4e-25"));
        assert!(!is_valid_mac("525:4:00:4c:4e:25"));
    }

    #[tokio::test]
    async fn test_mac_keeps_oui_and_is_deterministic() {
        let backend = MockBackend::new();

        let mut first = InventoryMacFactory::with_rng(&backend, StdRng::seed_from_u64(37));
        let mut second = InventoryMacFactory::with_rng(&backend, StdRng::seed_from_u64(37));

        let a = first.create_from("52:54:00:4c:4e:25").await.unwrap();
        let b = first.create_from("00:00:00:00:00:00").await.unwrap();

        assert!(a.starts_with("52:54:00:"));
        assert!(b.starts_with("00:00:00:"));
        assert!(is_valid_mac(&a));
        assert_eq!(first.attempts(), 1);

        assert_eq!(second.create_from("52:54:00:4c:4e:25").await.unwrap(), a);
        assert_eq!(second.create_from("00:00:00:00:00:00").await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_mac_rejects_invalid_seed() {
        let backend = MockBackend::new();
        let mut factory = InventoryMacFactory::with_rng(&backend, StdRng::seed_from_u64(1));

        let err = factory.create_from("_").await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidInput(_)));
        assert_eq!(err.to_string(), "Invalid input: Invalid MAC address: _");

        let err = factory.create_from("z0:00:00:00:00:00").await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_mac_collision_avoidance() {
        let backend = MockBackend::new();

        let mut unimpeded = InventoryMacFactory::with_rng(&backend, StdRng::seed_from_u64(37));
        let first = unimpeded.create_from("52:54:00:4c:4e:25").await.unwrap();
        let second = unimpeded.create_from("52:54:00:4c:4e:25").await.unwrap();
        assert_ne!(first, second);

        backend
            .define_domain(&domain_with_mac("taken", &Uuid::new_v4(), &first))
            .await
            .unwrap();

        let mut factory = InventoryMacFactory::with_rng(&backend, StdRng::seed_from_u64(37));
        assert_eq!(factory.create_from("52:54:00:4c:4e:25").await.unwrap(), second);
        assert_eq!(factory.attempts(), 2);
    }

    #[tokio::test]
    async fn test_uuid_is_v4_and_deterministic() {
        let backend = MockBackend::new();

        let mut first = InventoryUuidFactory::with_rng(&backend, StdRng::seed_from_u64(37));
        let mut second = InventoryUuidFactory::with_rng(&backend, StdRng::seed_from_u64(37));

        let a = first.create().await.unwrap();
        let b = first.create().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 4);

        assert_eq!(second.create().await.unwrap(), a);
        assert_eq!(second.create().await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_uuid_collision_avoidance() {
        let backend = MockBackend::new();

        let mut unimpeded = InventoryUuidFactory::with_rng(&backend, StdRng::seed_from_u64(37));
        let first = unimpeded.create().await.unwrap();
        let second = unimpeded.create().await.unwrap();

        backend
            .define_domain(&domain_with_mac("taken", &first, "52:54:00:00:00:01"))
            .await
            .unwrap();

        let mut factory = InventoryUuidFactory::with_rng(&backend, StdRng::seed_from_u64(37));
        assert_eq!(factory.create().await.unwrap(), second);
        assert_eq!(factory.attempts(), 2);
    }

    /// Random source that always yields the same bytes.
    struct StuckRng;

    impl RngCore for StuckRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
            dest.fill(0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exhausted_attempts() {
        let backend = MockBackend::new();

        let stuck_uuid = InventoryUuidFactory::with_rng(&backend, StuckRng)
            .create()
            .await
            .unwrap();
        backend
            .define_domain(&domain_with_mac("taken", &stuck_uuid, "52:54:00:00:00:00"))
            .await
            .unwrap();

        let mut macs = InventoryMacFactory::with_rng(&backend, StuckRng);
        let err = macs.create_from("52:54:00:11:22:33").await.unwrap_err();
        assert!(matches!(
            err,
            HypervisorError::ExhaustedAttempts { what: "MAC address", attempts: MAX_ATTEMPTS }
        ));
        assert_eq!(macs.attempts(), MAX_ATTEMPTS);

        let mut uuids = InventoryUuidFactory::with_rng(&backend, StuckRng);
        assert!(matches!(
            uuids.create().await,
            Err(HypervisorError::ExhaustedAttempts { what: "UUID", .. })
        ));
    }
}
