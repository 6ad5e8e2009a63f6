//! Runs a [`Plan`] against the host adapters.
//!
//! Steps run in order and stop at the first error. Each step observes before
//! it acts, so re-running a partially applied plan never creates a resource
//! twice and tearing down something already gone is not an error. The VM's
//! status is updated in place as steps complete; the caller decides what to
//! persist.

use std::future::Future;
use std::sync::Arc;

use kiln_model::{IfaceStatus, ImageMountStatus, LogicalState, MicroVm, ProviderState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PortError, PortResult, ReconcileStepError};
use crate::machine::{MountSlot, Plan, Step, Target};
use crate::ports::{
    DiskCreateInput, DiskService, IfaceCreateInput, ImageMountSpec, ImageService, NetworkService,
};
use crate::provider::MicroVmProvider;

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The provider confirmed the VM is running.
    Running,
    /// Started, but not yet confirmed running.
    Created,
    /// Already converged; nothing was changed.
    Unchanged,
    /// A converged VM was found not running and demoted to `Pending`.
    Drifted,
    /// Every resource released.
    Deleted,
}

/// The host adapters a plan runs against.
#[derive(Clone)]
pub struct Executor {
    network: Arc<dyn NetworkService>,
    images: Arc<dyn ImageService>,
    disks: Arc<dyn DiskService>,
}

impl Executor {
    pub fn new(
        network: Arc<dyn NetworkService>,
        images: Arc<dyn ImageService>,
        disks: Arc<dyn DiskService>,
    ) -> Self {
        Self {
            network,
            images,
            disks,
        }
    }

    /// Apply `plan` to `vm`, returning how the pass ended.
    ///
    /// On error `vm.status` still reflects every step that completed.
    pub async fn execute(
        &self,
        provider: &dyn MicroVmProvider,
        vm: &mut MicroVm,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome, ReconcileStepError> {
        let id = vm.id.clone();

        if plan.target == Target::Deleted {
            vm.status.state = LogicalState::Deleting;
        }

        for step in &plan.steps {
            debug!(vm_id = %id, step = step.name(), "Running step");
            self.run_step(provider, vm, step, cancel)
                .await
                .map_err(|e| ReconcileStepError::new(&id, step.name(), e))?;
        }

        let generation = vm.spec.generation;
        let status = &mut vm.status;
        let outcome = match plan.target {
            Target::Running => {
                status.state = if status.provider_state == ProviderState::Running {
                    LogicalState::Running
                } else {
                    LogicalState::Created
                };
                status.record_success(generation);
                match status.state {
                    LogicalState::Running => PassOutcome::Running,
                    _ => PassOutcome::Created,
                }
            }
            Target::Deleted => {
                status.clear_resources();
                status.state = LogicalState::Deleted;
                status.record_success(generation);
                PassOutcome::Deleted
            }
            Target::Observe if status.provider_state == ProviderState::Running => {
                PassOutcome::Unchanged
            }
            Target::Observe => {
                info!(
                    vm_id = %id,
                    provider_state = %status.provider_state,
                    "MicroVM no longer running, demoting to pending"
                );
                status.state = LogicalState::Pending;
                PassOutcome::Drifted
            }
        };

        Ok(outcome)
    }

    async fn run_step(
        &self,
        provider: &dyn MicroVmProvider,
        vm: &mut MicroVm,
        step: &Step,
        cancel: &CancellationToken,
    ) -> PortResult<()> {
        match step {
            Step::MountImage { slot, spec } => self.mount_image(vm, slot, spec, cancel).await,
            Step::CreateIface {
                guest_device,
                index,
                input,
            } => self.create_iface(vm, guest_device, *index, input, cancel).await,
            Step::CreateMetadataDisk(input) => self.create_metadata_disk(vm, input, cancel).await,
            Step::CreateVm => {
                let state = guarded(cancel, provider.state(&vm.id)).await?;
                if state == ProviderState::Unknown {
                    info!(vm_id = %vm.id, provider = provider.name(), "Creating microVM");
                    guarded(cancel, provider.create(vm)).await?;
                    vm.status.provider_state = ProviderState::Configured;
                } else {
                    vm.status.provider_state = state;
                }
                vm.status.applied_shape = Some(vm.spec.shape());
                Ok(())
            }
            Step::StartVm => {
                let state = guarded(cancel, provider.state(&vm.id)).await?;
                match state {
                    ProviderState::Running | ProviderState::Pending => {
                        debug!(vm_id = %vm.id, state = %state, "MicroVM already started");
                    }
                    ProviderState::Configured | ProviderState::Unknown => {
                        info!(vm_id = %vm.id, "Starting microVM");
                        guarded(cancel, provider.start(vm)).await?;
                    }
                }
                Ok(())
            }
            Step::ConfirmRunning => {
                vm.status.provider_state = guarded(cancel, provider.state(&vm.id)).await?;
                Ok(())
            }
            Step::DeleteVm => {
                match guarded(cancel, provider.delete(&vm.id)).await {
                    Ok(()) => info!(vm_id = %vm.id, "Deleted microVM"),
                    Err(e) if e.is_not_found() => debug!(vm_id = %vm.id, "MicroVM already gone"),
                    Err(e) => return Err(e),
                }
                vm.status.applied_shape = None;
                vm.status.provider_state = ProviderState::Unknown;
                Ok(())
            }
            Step::DeleteIface {
                guest_device,
                device_name,
            } => {
                if guarded(cancel, self.network.iface_exists(device_name)).await? {
                    ignore_not_found(guarded(cancel, self.network.iface_delete(device_name)).await)?;
                }
                vm.status.network_interfaces.remove(guest_device);
                Ok(())
            }
            Step::ReleaseImage { slot, spec } => {
                ignore_not_found(guarded(cancel, self.images.release(spec)).await)?;
                slot.set(&mut vm.status, None);
                Ok(())
            }
            Step::DeleteMetadataDisk { path } => {
                ignore_not_found(guarded(cancel, self.disks.delete(path)).await)?;
                vm.status.metadata_disk = None;
                Ok(())
            }
        }
    }

    async fn mount_image(
        &self,
        vm: &mut MicroVm,
        slot: &MountSlot,
        spec: &ImageMountSpec,
        cancel: &CancellationToken,
    ) -> PortResult<()> {
        let recorded = slot
            .get(&vm.status)
            .is_some_and(|mounted| mounted.image == spec.image);
        if recorded && guarded(cancel, self.images.is_mounted(spec)).await? {
            return Ok(());
        }

        let image = spec.image_spec();
        if !guarded(cancel, self.images.exists(&image)).await? {
            info!(image = %spec.image, "Pulling image");
            guarded(cancel, self.images.pull(&image)).await?;
        }

        let mount = guarded(cancel, self.images.pull_and_mount(spec))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PortError::Failed(format!("image {} produced no mount", spec.image)))?;
        debug!(usage = %spec.owner_usage_id, source = %mount.source, "Image mounted");

        slot.set(
            &mut vm.status,
            Some(ImageMountStatus {
                image: spec.image.clone(),
                mount,
            }),
        );
        Ok(())
    }

    async fn create_iface(
        &self,
        vm: &mut MicroVm,
        guest_device: &str,
        index: u32,
        input: &IfaceCreateInput,
        cancel: &CancellationToken,
    ) -> PortResult<()> {
        let details = if guarded(cancel, self.network.iface_exists(&input.device_name)).await? {
            guarded(cancel, self.network.iface_details(&input.device_name)).await?
        } else {
            info!(
                vm_id = %vm.id,
                device = %input.device_name,
                guest = guest_device,
                "Creating interface"
            );
            guarded(cancel, self.network.iface_create(input)).await?
        };

        vm.status.network_interfaces.insert(
            guest_device.to_string(),
            IfaceStatus {
                host_device_name: details.device_name,
                index,
                mac: details.mac,
            },
        );
        Ok(())
    }

    /// The disk is rewritten unless a defined provider VM already uses it.
    async fn create_metadata_disk(
        &self,
        vm: &mut MicroVm,
        input: &DiskCreateInput,
        cancel: &CancellationToken,
    ) -> PortResult<()> {
        let path = input.path.display().to_string();
        let in_use = vm.status.applied_shape.is_some()
            && vm.status.metadata_disk.as_deref() == Some(path.as_str());
        if in_use && guarded(cancel, self.disks.exists(&input.path)).await? {
            return Ok(());
        }

        debug!(vm_id = %vm.id, path = %path, files = input.files.len(), "Writing metadata disk");
        guarded(cancel, self.disks.create(input)).await?;
        vm.status.metadata_disk = Some(path);
        Ok(())
    }
}

/// Race an adapter call against cancellation.
async fn guarded<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = PortResult<T>>,
) -> PortResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PortError::Cancelled),
        result = call => result,
    }
}

fn ignore_not_found(result: PortResult<()>) -> PortResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
