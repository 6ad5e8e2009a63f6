//! Durable store of desired spec and observed status per microVM.
//!
//! Spec and status are written separately: clients own the spec, the
//! controller owns the status, and neither write can clobber the other.
//! Both writes are atomic per VM.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use kiln_id::VmId;
use kiln_model::{MicroVm, MicroVmSpec, MicroVmStatus};

use crate::error::RepositoryError;

#[async_trait]
pub trait MicroVmRepository: Send + Sync {
    async fn get(&self, id: &VmId) -> Result<Option<MicroVm>, RepositoryError>;

    /// Insert a VM with default status, or replace the spec of an existing
    /// one. A spec whose generation is behind the stored one is rejected.
    async fn save_spec(&self, id: &VmId, spec: &MicroVmSpec) -> Result<(), RepositoryError>;

    /// Replace the status of an existing VM. Rejected when
    /// `observed_generation` would exceed the stored spec generation.
    async fn save_status(&self, id: &VmId, status: &MicroVmStatus) -> Result<(), RepositoryError>;

    /// Remove a VM. Returns whether it existed.
    async fn delete(&self, id: &VmId) -> Result<bool, RepositoryError>;

    async fn list_ids(&self) -> Result<Vec<VmId>, RepositoryError>;

    /// All VMs, optionally restricted to one namespace, ordered by id.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<MicroVm>, RepositoryError>;
}

fn check_spec_write(id: &VmId, stored: u64, written: u64) -> Result<(), RepositoryError> {
    if written < stored {
        return Err(RepositoryError::Conflict {
            id: id.clone(),
            stored,
            written,
        });
    }
    Ok(())
}

fn check_status_write(
    spec: &MicroVmSpec,
    status: &MicroVmStatus,
) -> Result<(), RepositoryError> {
    if status.observed_generation > spec.generation {
        return Err(kiln_model::ModelError::GenerationRegressed {
            generation: spec.generation,
            observed: status.observed_generation,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every repository must share.

    use super::*;
    use kiln_model::LogicalState;

    fn spec() -> MicroVmSpec {
        let mut spec = MicroVmSpec::new("mock", 1, 128, "alpine:latest");
        spec.generation = 1;
        spec
    }

    pub async fn spec_and_status_are_independent(repo: &dyn MicroVmRepository) {
        let id = VmId::generate("default", "web").unwrap();
        assert!(repo.get(&id).await.unwrap().is_none());

        repo.save_spec(&id, &spec()).await.unwrap();
        let vm = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(vm.status, MicroVmStatus::default());

        let status = MicroVmStatus {
            state: LogicalState::Running,
            observed_generation: 1,
            ..Default::default()
        };
        repo.save_status(&id, &status).await.unwrap();

        let mut updated = spec();
        updated.generation = 2;
        updated.vcpu = 2;
        repo.save_spec(&id, &updated).await.unwrap();

        let vm = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(vm.spec.vcpu, 2);
        assert_eq!(vm.status.state, LogicalState::Running);
        assert_eq!(vm.status.observed_generation, 1);
    }

    pub async fn rejects_stale_and_impossible_writes(repo: &dyn MicroVmRepository) {
        let id = VmId::generate("default", "db").unwrap();
        let mut newer = spec();
        newer.generation = 3;
        repo.save_spec(&id, &newer).await.unwrap();

        assert!(matches!(
            repo.save_spec(&id, &spec()).await,
            Err(RepositoryError::Conflict { stored: 3, written: 1, .. })
        ));

        let ahead = MicroVmStatus {
            observed_generation: 4,
            ..Default::default()
        };
        assert!(matches!(
            repo.save_status(&id, &ahead).await,
            Err(RepositoryError::Model(_))
        ));

        let other = VmId::generate("default", "ghost").unwrap();
        assert!(matches!(
            repo.save_status(&other, &MicroVmStatus::default()).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    pub async fn lists_and_deletes(repo: &dyn MicroVmRepository) {
        let a = VmId::generate("team-a", "one").unwrap();
        let b = VmId::generate("team-b", "two").unwrap();
        repo.save_spec(&a, &spec()).await.unwrap();
        repo.save_spec(&b, &spec()).await.unwrap();

        let mut ids = repo.list_ids().await.unwrap();
        ids.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        let team_a = repo.list(Some("team-a")).await.unwrap();
        assert_eq!(team_a.len(), 1);
        assert_eq!(team_a[0].id, a);

        assert!(repo.delete(&a).await.unwrap());
        assert!(!repo.delete(&a).await.unwrap());
        assert_eq!(repo.list(None).await.unwrap().len(), 1);
    }
}
