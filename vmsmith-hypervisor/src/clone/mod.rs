//! Domain cloning.
//!
//! A clone runs through these phases:
//!
//! ```text
//! Validating -> Rewriting -> Defining -> MaterializingArtifacts -> Done
//!      |            |           |                 |
//!      +------------+-----------+-----------------+--> RollingBack -> Failed
//! ```
//!
//! The management API has no multi-resource transactions. A failed clone is
//! undone instead: every artifact created so far is recorded on an undo
//! stack, and the stack is unwound in reverse when a later step fails. The
//! caller either gets a complete clone or nothing at all, plus the error
//! that stopped the clone.
//!
//! The new domain is defined before any of its volumes are created, so
//! undefining it is always the last undo step. Some hypervisor versions
//! refuse to undefine a domain while its firmware volume still exists;
//! others do not care. Deleting the firmware first works with both.
//!
//! Concurrent clones to the same name are not coordinated here. The
//! management layer rejects the second definition and that surfaces as an
//! ordinary failure.

mod rewrite;
mod source;
mod strategy;

pub use rewrite::{rewrite, ClonePlan};
pub use source::{SourceFirmware, SourceVolume};
pub use strategy::{copy_firmware, materialize_volume};

use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::identity::{InventoryMacFactory, InventoryUuidFactory, MacFactory, UuidFactory};
use crate::traits::ManagementApi;
use crate::types::{CloneMode, DomainState};

/// Phase of a clone, used to annotate logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClonePhase {
    Validating,
    Rewriting,
    Defining,
    MaterializingArtifacts,
    RollingBack,
    Done,
    Failed,
}

impl fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            ClonePhase::Validating => "validating",
            ClonePhase::Rewriting => "rewriting",
            ClonePhase::Defining => "defining",
            ClonePhase::MaterializingArtifacts => "materializing-artifacts",
            ClonePhase::RollingBack => "rolling-back",
            ClonePhase::Done => "done",
            ClonePhase::Failed => "failed",
        };
        write!(f, "{}", phase)
    }
}

/// One step that reverses something a clone created.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    UndefineDomain(String),
    DeleteVolume(String),
}

/// Clones domains through a management API.
pub struct DomainCloner<'a, A: ?Sized> {
    api: &'a A,
}

impl<'a, A: ManagementApi + ?Sized> DomainCloner<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self { api }
    }

    /// Clone the shut-off domain `name` into a new domain `new_name`.
    ///
    /// Identifiers come from factories seeded by the operating system. Use
    /// [`DomainCloner::clone_with`] to supply your own.
    pub async fn clone_domain(&self, name: &str, new_name: &str, mode: CloneMode) -> Result<()> {
        let mut uuids = InventoryUuidFactory::new(self.api);
        let mut macs = InventoryMacFactory::new(self.api);
        self.clone_with(name, new_name, mode, &mut uuids, &mut macs).await
    }

    /// Clone with the given identifier factories.
    #[instrument(skip(self, uuid_factory, mac_factory), fields(mode = %mode))]
    pub async fn clone_with(
        &self,
        name: &str,
        new_name: &str,
        mode: CloneMode,
        uuid_factory: &mut dyn UuidFactory,
        mac_factory: &mut dyn MacFactory,
    ) -> Result<()> {
        debug!(phase = %ClonePhase::Validating, "Checking clone preconditions");
        self.validate(name, new_name).await?;

        debug!(phase = %ClonePhase::Rewriting, "Rewriting domain configuration");
        let source_config = self.api.domain_xml(name).await?;
        let plan = rewrite(&source_config, new_name, mode, uuid_factory, mac_factory).await?;

        self.execute(plan).await?;

        info!(source = %name, clone = %new_name, "Domain cloned");
        Ok(())
    }

    async fn validate(&self, name: &str, new_name: &str) -> Result<()> {
        if !self.api.domain_exists(name).await? {
            return Err(HypervisorError::NotFound(format!("Domain {}", name)));
        }

        if self.api.domain_exists(new_name).await? {
            return Err(HypervisorError::Conflict(format!(
                "Domain {} already exists",
                new_name
            )));
        }

        let state = self.api.domain_state(name).await?;
        if state != DomainState::ShutOff {
            return Err(HypervisorError::InvalidState(format!(
                "Domain {} must be shut off to be cloned, but it is {}",
                name, state
            )));
        }

        Ok(())
    }

    /// Define the cloned domain and materialize its artifacts. On failure,
    /// everything created so far is removed again before the error is
    /// returned.
    #[instrument(skip(self, plan), fields(clone = %plan.clone_name))]
    pub async fn execute(&self, plan: ClonePlan) -> Result<()> {
        let mut undo = Vec::new();

        match self.materialize(&plan, &mut undo).await {
            Ok(()) => {
                debug!(phase = %ClonePhase::Done, artifacts = undo.len(), "Clone complete");
                Ok(())
            }
            Err(e) => {
                warn!(
                    phase = %ClonePhase::RollingBack,
                    error = %e,
                    steps = undo.len(),
                    "Clone failed, rolling back"
                );
                self.rollback(undo).await;
                debug!(phase = %ClonePhase::Failed, "Rollback finished");
                Err(e)
            }
        }
    }

    async fn materialize(&self, plan: &ClonePlan, undo: &mut Vec<Undo>) -> Result<()> {
        debug!(phase = %ClonePhase::Defining, "Defining cloned domain");
        let domain = self.api.define_domain(&plan.config).await?;
        undo.push(Undo::UndefineDomain(domain.name));

        debug!(phase = %ClonePhase::MaterializingArtifacts, "Materializing artifacts");
        for firmware in &plan.firmware {
            let created = copy_firmware(self.api, firmware).await?;
            undo.push(Undo::DeleteVolume(created.path));
        }

        for volume in &plan.volumes {
            let created = materialize_volume(self.api, volume, plan.mode).await?;
            undo.push(Undo::DeleteVolume(created.path));
        }

        Ok(())
    }

    /// Unwind the undo stack. A failed step is logged and skipped.
    async fn rollback(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match &step {
                Undo::DeleteVolume(path) => self.api.delete_volume(path).await,
                Undo::UndefineDomain(name) => self.api.undefine_domain(name).await,
            };

            match result {
                Ok(()) => debug!(?step, "Rolled back"),
                Err(e) => warn!(?step, error = %e, "Failed to roll back clone artifact"),
            }
        }
    }
}

/// Clone `name` into `new_name` on `api`.
pub async fn clone_domain<A: ManagementApi + ?Sized>(
    api: &A,
    name: &str,
    new_name: &str,
    mode: CloneMode,
) -> Result<()> {
    DomainCloner::new(api).clone_domain(name, new_name, mode).await
}
