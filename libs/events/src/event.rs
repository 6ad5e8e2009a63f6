//! Event payloads and topic names.

use kiln_id::VmId;
use kiln_model::{LogicalState, MicroVmStatus, ProviderState};
use serde::{Deserialize, Serialize};

/// All topic names as constants.
pub mod topics {
    // Intents
    pub const MICROVM_CREATED: &str = "vm.created";
    pub const MICROVM_UPDATED: &str = "vm.updated";
    pub const MICROVM_DELETED: &str = "vm.deleted";

    // Status
    pub const MICROVM_STATUS_UPDATED: &str = "vm.status.updated";
    pub const MICROVM_STATUS_FAILED: &str = "vm.status.failed";
    pub const MICROVM_STATUS_DELETED: &str = "vm.status.deleted";

    /// Filter matching every status topic.
    pub const MICROVM_STATUS_ALL: &str = "vm.status.*";

    /// Topics the reconciler consumes.
    pub const INTENTS: [&str; 3] = [MICROVM_CREATED, MICROVM_UPDATED, MICROVM_DELETED];
}

/// The observer-relevant part of a status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: LogicalState,
    pub provider_state: ProviderState,
    pub observed_generation: u64,
    pub retry: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&MicroVmStatus> for StatusSnapshot {
    fn from(status: &MicroVmStatus) -> Self {
        Self {
            state: status.state,
            provider_state: status.provider_state,
            observed_generation: status.observed_generation,
            retry: status.retry,
            last_error: status.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new spec was stored.
    MicroVmSpecCreated { id: VmId },

    /// An existing spec changed.
    MicroVmSpecUpdated { id: VmId, generation: u64 },

    /// Deletion was requested. `generation` is the one that set the
    /// desired state to deleted; repeated requests carry the same value.
    MicroVmSpecDeleted { id: VmId, generation: u64 },

    /// The reconciler changed the observed status.
    MicroVmStatusUpdated { id: VmId, status: StatusSnapshot },

    /// Retries are exhausted or the spec was rejected; an operator or a new
    /// generation is needed.
    MicroVmReconcileFailed {
        id: VmId,
        generation: u64,
        attempts: u32,
        error: String,
    },

    /// Every resource was released and the record removed.
    MicroVmDeleted { id: VmId },
}

impl Event {
    pub fn vm_id(&self) -> &VmId {
        match self {
            Event::MicroVmSpecCreated { id }
            | Event::MicroVmSpecUpdated { id, .. }
            | Event::MicroVmSpecDeleted { id, .. }
            | Event::MicroVmStatusUpdated { id, .. }
            | Event::MicroVmReconcileFailed { id, .. }
            | Event::MicroVmDeleted { id } => id,
        }
    }

    /// The topic this event is normally published on.
    pub fn default_topic(&self) -> &'static str {
        match self {
            Event::MicroVmSpecCreated { .. } => topics::MICROVM_CREATED,
            Event::MicroVmSpecUpdated { .. } => topics::MICROVM_UPDATED,
            Event::MicroVmSpecDeleted { .. } => topics::MICROVM_DELETED,
            Event::MicroVmStatusUpdated { .. } => topics::MICROVM_STATUS_UPDATED,
            Event::MicroVmReconcileFailed { .. } => topics::MICROVM_STATUS_FAILED,
            Event::MicroVmDeleted { .. } => topics::MICROVM_STATUS_DELETED,
        }
    }
}
