//! Repository kept entirely in memory. Used by tests and API-only
//! deployments that do not need state across restarts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kiln_id::VmId;
use kiln_model::{MicroVm, MicroVmSpec, MicroVmStatus};
use parking_lot::RwLock;

use super::{check_spec_write, check_status_write, MicroVmRepository};
use crate::error::RepositoryError;

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    vms: RwLock<BTreeMap<VmId, MicroVm>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MicroVmRepository for InMemoryRepository {
    async fn get(&self, id: &VmId) -> Result<Option<MicroVm>, RepositoryError> {
        Ok(self.vms.read().get(id).cloned())
    }

    async fn save_spec(&self, id: &VmId, spec: &MicroVmSpec) -> Result<(), RepositoryError> {
        let mut vms = self.vms.write();
        match vms.get_mut(id) {
            Some(vm) => {
                check_spec_write(id, vm.spec.generation, spec.generation)?;
                vm.spec = spec.clone();
            }
            None => {
                vms.insert(
                    id.clone(),
                    MicroVm {
                        id: id.clone(),
                        spec: spec.clone(),
                        status: MicroVmStatus::default(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn save_status(&self, id: &VmId, status: &MicroVmStatus) -> Result<(), RepositoryError> {
        let mut vms = self.vms.write();
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        check_status_write(&vm.spec, status)?;
        vm.status = status.clone();
        Ok(())
    }

    async fn delete(&self, id: &VmId) -> Result<bool, RepositoryError> {
        Ok(self.vms.write().remove(id).is_some())
    }

    async fn list_ids(&self) -> Result<Vec<VmId>, RepositoryError> {
        Ok(self.vms.read().keys().cloned().collect())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<MicroVm>, RepositoryError> {
        Ok(self
            .vms
            .read()
            .values()
            .filter(|vm| namespace.is_none_or(|ns| vm.id.namespace() == ns))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::contract;

    #[tokio::test]
    async fn test_spec_and_status_are_independent() {
        contract::spec_and_status_are_independent(&InMemoryRepository::new()).await;
    }

    #[tokio::test]
    async fn test_rejects_stale_and_impossible_writes() {
        contract::rejects_stale_and_impossible_writes(&InMemoryRepository::new()).await;
    }

    #[tokio::test]
    async fn test_lists_and_deletes() {
        contract::lists_and_deletes(&InMemoryRepository::new()).await;
    }
}
