//! Guest agent probing.

use serde_json::json;
use tracing::{debug, instrument};

use crate::error::{HypervisorError, Result};
use crate::traits::DomainDirectory;

/// Ping the guest agent of `domain`.
///
/// Returns `true` if the agent answered and `false` on any management error
/// (agent not installed, not running, domain shut off, ...).
#[instrument(skip(directory))]
pub async fn ping_guest<D: DomainDirectory + ?Sized>(directory: &D, domain: &str) -> Result<bool> {
    if !directory.domain_exists(domain).await? {
        return Err(HypervisorError::NotFound(format!("Domain {}", domain)));
    }

    let command = json!({ "execute": "guest-ping" }).to_string();
    match directory.guest_agent_command(domain, &command).await {
        Ok(_) => Ok(true),
        Err(HypervisorError::Management(message)) => {
            debug!(error = %message, "Guest agent did not answer");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
