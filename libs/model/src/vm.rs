//! The MicroVM aggregate root.

use chrono::Utc;
use kiln_id::VmId;
use serde::{Deserialize, Serialize};

use crate::{DesiredState, LogicalState, MicroVmSpec, MicroVmStatus, ModelError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroVm {
    pub id: VmId,
    pub spec: MicroVmSpec,
    pub status: MicroVmStatus,
}

impl MicroVm {
    /// Declare a new VM at generation 1.
    pub fn new(id: VmId, mut spec: MicroVmSpec) -> Self {
        let now = Utc::now();
        spec.generation = 1;
        spec.created_at = now;
        spec.updated_at = now;
        spec.deleted_at = None;
        Self {
            id,
            spec,
            status: MicroVmStatus::default(),
        }
    }

    /// Replace the desired configuration, bumping the generation.
    ///
    /// Creation time and the deletion intent are preserved: an update cannot
    /// resurrect a VM that is being deleted.
    pub fn update_spec(&mut self, mut spec: MicroVmSpec) {
        spec.generation = self.spec.generation + 1;
        spec.created_at = self.spec.created_at;
        spec.updated_at = Utc::now();
        spec.desired_state = self.spec.desired_state;
        spec.deleted_at = self.spec.deleted_at;
        self.spec = spec;
    }

    /// Record the intent to delete, bumping the generation.
    pub fn mark_deleted(&mut self) {
        if self.spec.is_deleted() {
            return;
        }
        let now = Utc::now();
        self.spec.desired_state = DesiredState::Deleted;
        self.spec.generation += 1;
        self.spec.updated_at = now;
        self.spec.deleted_at = Some(now);
    }

    /// Retries are exhausted (or the spec was rejected) for the current
    /// generation.
    pub fn is_terminally_failed(&self) -> bool {
        self.status.state == LogicalState::Failed
            && self.status.failed_generation == Some(self.spec.generation)
    }

    /// Nothing left to do for the current generation.
    pub fn is_converged(&self) -> bool {
        if self.status.observed_generation != self.spec.generation {
            return false;
        }
        match self.spec.desired_state {
            DesiredState::Present => self.status.state == LogicalState::Running,
            DesiredState::Deleted => self.status.state == LogicalState::Deleted,
        }
    }

    /// Check the generation invariant still holds.
    pub fn check_generation(&self) -> Result<(), ModelError> {
        if self.status.observed_generation > self.spec.generation {
            return Err(ModelError::GenerationRegressed {
                generation: self.spec.generation,
                observed: self.status.observed_generation,
            });
        }
        Ok(())
    }
}
