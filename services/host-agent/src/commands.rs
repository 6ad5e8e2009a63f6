//! Application commands the API layer calls.
//!
//! Commands only write the spec and announce the intent; every host-side
//! change is made by the controller once it sees the event.

use std::sync::Arc;

use kiln_events::{Event, EventBus};
use kiln_id::VmId;
use kiln_model::{MicroVm, MicroVmSpec};
use tracing::info;

use crate::error::{CommandError, PortError};
use crate::provider::{MachineMetrics, ProviderRegistry};
use crate::repository::MicroVmRepository;

pub struct MicroVmCommands {
    repo: Arc<dyn MicroVmRepository>,
    bus: EventBus,
    providers: ProviderRegistry,
    default_provider: String,
}

impl MicroVmCommands {
    pub fn new(
        repo: Arc<dyn MicroVmRepository>,
        bus: EventBus,
        providers: ProviderRegistry,
        default_provider: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            bus,
            providers,
            default_provider: default_provider.into(),
        }
    }

    /// Declare a new microVM at generation 1.
    pub async fn create(
        &self,
        namespace: &str,
        name: &str,
        mut spec: MicroVmSpec,
    ) -> Result<MicroVm, CommandError> {
        if spec.provider.trim().is_empty() {
            spec.provider = self.default_provider.clone();
        }
        spec.validate()?;

        let taken = self
            .repo
            .list(Some(namespace))
            .await?
            .iter()
            .any(|vm| vm.id.name() == name);
        if taken {
            return Err(CommandError::AlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        let vm = MicroVm::new(VmId::generate(namespace, name)?, spec);
        self.repo.save_spec(&vm.id, &vm.spec).await?;

        info!(vm_id = %vm.id, provider = %vm.spec.provider, "MicroVM declared");
        self.bus
            .publish_event(Event::MicroVmSpecCreated { id: vm.id.clone() })?;
        Ok(vm)
    }

    /// Replace the spec of an existing microVM, bumping its generation.
    pub async fn update(&self, id: &VmId, mut spec: MicroVmSpec) -> Result<MicroVm, CommandError> {
        let mut vm = self.load(id).await?;
        if vm.spec.is_deleted() {
            return Err(CommandError::Deleting(id.clone()));
        }

        if spec.provider.trim().is_empty() {
            spec.provider = vm.spec.provider.clone();
        }
        spec.validate()?;

        vm.update_spec(spec);
        self.repo.save_spec(&vm.id, &vm.spec).await?;

        info!(vm_id = %vm.id, generation = vm.spec.generation, "MicroVM updated");
        self.bus.publish_event(Event::MicroVmSpecUpdated {
            id: vm.id.clone(),
            generation: vm.spec.generation,
        })?;
        Ok(vm)
    }

    /// Request deletion. Repeating the request changes nothing but
    /// announces it again.
    pub async fn delete(&self, id: &VmId) -> Result<MicroVm, CommandError> {
        let mut vm = self.load(id).await?;
        if !vm.spec.is_deleted() {
            vm.mark_deleted();
            self.repo.save_spec(&vm.id, &vm.spec).await?;
            info!(vm_id = %vm.id, generation = vm.spec.generation, "MicroVM deletion requested");
        }

        self.bus.publish_event(Event::MicroVmSpecDeleted {
            id: vm.id.clone(),
            generation: vm.spec.generation,
        })?;
        Ok(vm)
    }

    pub async fn get(&self, id: &VmId) -> Result<MicroVm, CommandError> {
        self.load(id).await
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<MicroVm>, CommandError> {
        Ok(self.repo.list(namespace).await?)
    }

    /// Current metrics from the VM's provider.
    pub async fn metrics(&self, id: &VmId) -> Result<MachineMetrics, CommandError> {
        let vm = self.load(id).await?;
        let provider = self
            .providers
            .get(&vm.spec.provider)
            .ok_or_else(|| {
                PortError::Unsupported(format!("provider '{}' is not registered", vm.spec.provider))
            })?;
        Ok(provider.metrics(id).await?)
    }

    async fn load(&self, id: &VmId) -> Result<MicroVm, CommandError> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| CommandError::NotFound(id.clone()))
    }
}
