//! The microVM state machine.
//!
//! [`plan`] is pure: from a VM's spec and status it decides which steps a
//! pass must run and what the VM should look like when they all succeed. It
//! never talks to an adapter; the [`crate::executor`] runs the steps, each of
//! which checks for existing work before acting.
//!
//! ```text
//!  desired   status                       steps
//!  ───────   ──────────────────────────   ───────────────────────────────────────────────
//!  deleted   any                          DeleteVm, DeleteIface*, ReleaseImage*, DeleteMetadataDisk
//!  present   Pending / Failed / Deleting  MountImage*, CreateIface*, CreateMetadataDisk?,
//!                                         CreateVm, StartVm, ConfirmRunning
//!  present   Created, same generation     CreateVm, StartVm, ConfirmRunning
//!  present   Running, same generation     ConfirmRunning (drift check)
//!  present   Running, new generation      CreateIface* for added interfaces, ConfirmRunning
//!  present   shape changed / iface gone   DeleteVm, teardown of what went away, full create
//!            (checked before the rows above, except a converged Running VM)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use kiln_id::VmUid;
use kiln_model::{
    IfaceType, ImageMountStatus, ImageUse, LogicalState, MicroVm, MicroVmStatus,
    NetworkInterfaceSpec,
};

use crate::error::PlanError;
use crate::ports::{DiskCreateInput, DiskFile, DiskType, IfaceCreateInput, ImageMountSpec};
use crate::provider::Capability;

/// Volume label cloud-init looks for.
pub const METADATA_VOLUME_NAME: &str = "cidata";

/// Size of the generated metadata disk.
pub const METADATA_DISK_SIZE: u64 = 8 * 1024 * 1024;

/// Host facts the planner needs.
#[derive(Debug, Clone)]
pub struct PlanContext {
    /// Root for per-VM files such as the metadata disk.
    pub data_dir: PathBuf,
    /// Bridge new TAP devices are attached to.
    pub bridge_name: Option<String>,
}

/// Where an image mount is recorded in the status.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MountSlot {
    Kernel,
    Initrd,
    Volume(String),
}

impl MountSlot {
    pub fn get<'a>(&self, status: &'a MicroVmStatus) -> Option<&'a ImageMountStatus> {
        match self {
            Self::Kernel => status.kernel_mount.as_ref(),
            Self::Initrd => status.initrd_mount.as_ref(),
            Self::Volume(id) => status.volumes.get(id),
        }
    }

    pub fn set(&self, status: &mut MicroVmStatus, mount: Option<ImageMountStatus>) {
        match self {
            Self::Kernel => status.kernel_mount = mount,
            Self::Initrd => status.initrd_mount = mount,
            Self::Volume(id) => match mount {
                Some(mount) => {
                    status.volumes.insert(id.clone(), mount);
                }
                None => {
                    status.volumes.remove(id);
                }
            },
        }
    }

    fn usage_suffix(&self) -> &str {
        match self {
            Self::Kernel => "kernel",
            Self::Initrd => "initrd",
            Self::Volume(id) => id,
        }
    }

    fn image_use(&self) -> ImageUse {
        match self {
            Self::Kernel => ImageUse::Kernel,
            Self::Initrd => ImageUse::Initrd,
            Self::Volume(_) => ImageUse::Volume,
        }
    }
}

/// One idempotent action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    MountImage {
        slot: MountSlot,
        spec: ImageMountSpec,
    },
    CreateIface {
        guest_device: String,
        index: u32,
        input: IfaceCreateInput,
    },
    CreateMetadataDisk(DiskCreateInput),
    CreateVm,
    StartVm,
    /// Poll the provider and record its state.
    ConfirmRunning,
    DeleteVm,
    DeleteIface {
        guest_device: String,
        device_name: String,
    },
    ReleaseImage {
        slot: MountSlot,
        spec: ImageMountSpec,
    },
    DeleteMetadataDisk {
        path: PathBuf,
    },
}

impl Step {
    /// Name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MountImage { .. } => "image.mount",
            Self::CreateIface { .. } => "network.create",
            Self::CreateMetadataDisk(_) => "disk.create",
            Self::CreateVm => "provider.create",
            Self::StartVm => "provider.start",
            Self::ConfirmRunning => "provider.state",
            Self::DeleteVm => "provider.delete",
            Self::DeleteIface { .. } => "network.delete",
            Self::ReleaseImage { .. } => "image.release",
            Self::DeleteMetadataDisk { .. } => "disk.delete",
        }
    }
}

/// What the VM becomes once every step has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// `Running` if the provider confirms it, otherwise `Created`.
    Running,
    /// Every resource released.
    Deleted,
    /// Nothing to change; a provider state other than running is drift.
    Observe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub target: Target,
}

impl Plan {
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(Step::name).collect()
    }
}

/// Decide the steps for one pass over `vm`.
pub fn plan(
    vm: &MicroVm,
    provider: &str,
    capabilities: &[Capability],
    ctx: &PlanContext,
) -> Result<Plan, PlanError> {
    if vm.spec.is_deleted() {
        return Ok(Plan {
            steps: delete_steps(vm, ctx),
            target: Target::Deleted,
        });
    }

    vm.spec.validate()?;
    check_capabilities(vm, provider, capabilities)?;

    let status = &vm.status;
    let same_generation = status.observed_generation == vm.spec.generation;

    let plan = match status.state {
        LogicalState::Running if same_generation => Plan {
            steps: vec![Step::ConfirmRunning],
            target: Target::Observe,
        },
        _ if needs_recreate(vm) => Plan {
            steps: recreate_steps(vm, ctx),
            target: Target::Running,
        },
        LogicalState::Running => {
            let mut steps: Vec<Step> = iface_steps(vm, ctx)
                .into_iter()
                .filter(|step| match step {
                    Step::CreateIface { guest_device, .. } => {
                        !status.network_interfaces.contains_key(guest_device)
                    }
                    _ => true,
                })
                .collect();
            steps.push(Step::ConfirmRunning);
            Plan {
                steps,
                target: Target::Running,
            }
        }
        LogicalState::Created if same_generation => Plan {
            steps: vec![Step::CreateVm, Step::StartVm, Step::ConfirmRunning],
            target: Target::Running,
        },
        _ => Plan {
            steps: create_steps(vm, ctx),
            target: Target::Running,
        },
    };

    Ok(plan)
}

fn check_capabilities(
    vm: &MicroVm,
    provider: &str,
    capabilities: &[Capability],
) -> Result<(), PlanError> {
    let missing = |capability| PlanError::MissingCapability {
        provider: provider.to_string(),
        capability,
    };

    for iface in &vm.spec.network_interfaces {
        let needed = Capability::for_iface(iface.iface_type);
        if !capabilities.contains(&needed) {
            return Err(missing(needed));
        }
        if iface.allow_metadata_requests && !capabilities.contains(&Capability::MetadataService) {
            return Err(missing(Capability::MetadataService));
        }
    }
    Ok(())
}

/// The provider VM must be rebuilt for the spec to take effect.
fn needs_recreate(vm: &MicroVm) -> bool {
    let shape_changed = vm
        .status
        .applied_shape
        .as_ref()
        .is_some_and(|applied| *applied != vm.spec.shape());
    let iface_removed = vm.status.network_interfaces.keys().any(|guest| {
        !vm.spec
            .network_interfaces
            .iter()
            .any(|i| i.guest_device_name == *guest)
    });
    shape_changed || iface_removed
}

fn create_steps(vm: &MicroVm, ctx: &PlanContext) -> Vec<Step> {
    let mut steps: Vec<Step> = desired_mounts(vm)
        .into_iter()
        .map(|(slot, image)| Step::MountImage {
            spec: mount_spec(vm, &slot, image),
            slot,
        })
        .collect();

    steps.extend(iface_steps(vm, ctx));

    if !vm.spec.metadata.is_empty() {
        steps.push(Step::CreateMetadataDisk(metadata_disk(vm, ctx)));
    }

    steps.extend([Step::CreateVm, Step::StartVm, Step::ConfirmRunning]);
    steps
}

fn recreate_steps(vm: &MicroVm, ctx: &PlanContext) -> Vec<Step> {
    let mut steps = vec![Step::DeleteVm];

    for (guest, iface) in &vm.status.network_interfaces {
        if !vm
            .spec
            .network_interfaces
            .iter()
            .any(|i| i.guest_device_name == *guest)
        {
            steps.push(Step::DeleteIface {
                guest_device: guest.clone(),
                device_name: iface.host_device_name.clone(),
            });
        }
    }

    let desired = desired_mounts(vm);
    for (slot, mounted) in recorded_mounts(&vm.status) {
        let still_wanted = desired
            .iter()
            .any(|(s, image)| *s == slot && *image == mounted.image);
        if !still_wanted {
            steps.push(Step::ReleaseImage {
                spec: mount_spec(vm, &slot, &mounted.image),
                slot,
            });
        }
    }

    steps.extend(create_steps(vm, ctx));
    steps
}

fn delete_steps(vm: &MicroVm, ctx: &PlanContext) -> Vec<Step> {
    let mut steps = vec![Step::DeleteVm];

    let mut ifaces: BTreeMap<String, String> = vm
        .status
        .network_interfaces
        .iter()
        .map(|(guest, iface)| (guest.clone(), iface.host_device_name.clone()))
        .collect();
    for (iface, index) in assign_indices(vm) {
        ifaces
            .entry(iface.guest_device_name.clone())
            .or_insert_with(|| host_device_name(vm.id.uid(), iface.iface_type, index));
    }
    steps.extend(
        ifaces
            .into_iter()
            .map(|(guest_device, device_name)| Step::DeleteIface {
                guest_device,
                device_name,
            }),
    );

    let mut mounts: BTreeMap<MountSlot, String> = recorded_mounts(&vm.status)
        .into_iter()
        .map(|(slot, mounted)| (slot, mounted.image.clone()))
        .collect();
    for (slot, image) in desired_mounts(vm) {
        mounts.entry(slot).or_insert_with(|| image.to_string());
    }
    steps.extend(mounts.into_iter().map(|(slot, image)| Step::ReleaseImage {
        spec: mount_spec(vm, &slot, &image),
        slot,
    }));

    steps.push(Step::DeleteMetadataDisk {
        path: metadata_disk_path(vm, &ctx.data_dir),
    });
    steps
}

fn iface_steps(vm: &MicroVm, ctx: &PlanContext) -> Vec<Step> {
    assign_indices(vm)
        .into_iter()
        .map(|(iface, index)| {
            let device_name = vm
                .status
                .network_interfaces
                .get(&iface.guest_device_name)
                .map(|s| s.host_device_name.clone())
                .unwrap_or_else(|| host_device_name(vm.id.uid(), iface.iface_type, index));
            let attach = iface.iface_type == IfaceType::Tap && ctx.bridge_name.is_some();
            Step::CreateIface {
                guest_device: iface.guest_device_name.clone(),
                index,
                input: IfaceCreateInput {
                    device_name,
                    iface_type: iface.iface_type,
                    mac: iface.guest_mac.clone(),
                    attach,
                    bridge_name: attach.then(|| ctx.bridge_name.clone()).flatten(),
                },
            }
        })
        .collect()
}

/// Pair each desired interface with a stable index. Interfaces already
/// recorded keep theirs; new ones take the lowest free index.
fn assign_indices(vm: &MicroVm) -> Vec<(&NetworkInterfaceSpec, u32)> {
    let recorded = &vm.status.network_interfaces;
    let mut used: BTreeSet<u32> = recorded.values().map(|s| s.index).collect();
    let mut next = 0u32;

    vm.spec
        .network_interfaces
        .iter()
        .map(|iface| {
            if let Some(status) = recorded.get(&iface.guest_device_name) {
                return (iface, status.index);
            }
            while used.contains(&next) {
                next += 1;
            }
            used.insert(next);
            (iface, next)
        })
        .collect()
}

/// Host device name: type prefix, short uid, index. At most 15 bytes.
pub fn host_device_name(uid: VmUid, iface_type: IfaceType, index: u32) -> String {
    let prefix = match iface_type {
        IfaceType::Tap => 't',
        IfaceType::Macvtap => 'v',
    };
    format!("{prefix}{}{index}", uid.short())
}

fn desired_mounts(vm: &MicroVm) -> Vec<(MountSlot, &str)> {
    let spec = &vm.spec;
    let mut mounts = Vec::new();
    if let Some(kernel) = &spec.kernel {
        mounts.push((MountSlot::Kernel, kernel.image.as_str()));
    }
    if let Some(initrd) = &spec.initrd {
        mounts.push((MountSlot::Initrd, initrd.image.as_str()));
    }
    for volume in spec.volumes() {
        mounts.push((MountSlot::Volume(volume.id.clone()), volume.image.as_str()));
    }
    mounts
}

fn recorded_mounts(status: &MicroVmStatus) -> Vec<(MountSlot, &ImageMountStatus)> {
    let mut mounts = Vec::new();
    if let Some(kernel) = &status.kernel_mount {
        mounts.push((MountSlot::Kernel, kernel));
    }
    if let Some(initrd) = &status.initrd_mount {
        mounts.push((MountSlot::Initrd, initrd));
    }
    for (id, volume) in &status.volumes {
        mounts.push((MountSlot::Volume(id.clone()), volume));
    }
    mounts
}

fn mount_spec(vm: &MicroVm, slot: &MountSlot, image: &str) -> ImageMountSpec {
    ImageMountSpec {
        image: image.to_string(),
        owner: format!("{}/{}", vm.id.namespace(), vm.id.name()),
        image_use: slot.image_use(),
        owner_usage_id: format!("{}-{}", vm.id.uid(), slot.usage_suffix()),
    }
}

/// `{data_dir}/vm/{namespace}/{name}/{uid}/cloud-init.img`
pub fn metadata_disk_path(vm: &MicroVm, data_dir: &Path) -> PathBuf {
    data_dir
        .join("vm")
        .join(vm.id.namespace())
        .join(vm.id.name())
        .join(vm.id.uid().to_string())
        .join("cloud-init.img")
}

fn metadata_disk(vm: &MicroVm, ctx: &PlanContext) -> DiskCreateInput {
    DiskCreateInput {
        path: metadata_disk_path(vm, &ctx.data_dir),
        size_bytes: METADATA_DISK_SIZE,
        volume_name: METADATA_VOLUME_NAME.to_string(),
        disk_type: DiskType::Iso9660,
        files: vm
            .spec
            .metadata
            .iter()
            .map(|(key, value)| DiskFile {
                path: format!("/{key}"),
                content_base64: BASE64.encode(value),
            })
            .collect(),
        overwrite: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_id::VmId;
    use kiln_model::{IfaceStatus, KernelSpec, MicroVmSpec, Mount, MountType, VolumeSpec};
    use rstest::rstest;

    const ALL: &[Capability] = &[Capability::Tap, Capability::Macvtap, Capability::MetadataService];

    fn ctx() -> PlanContext {
        PlanContext {
            data_dir: PathBuf::from("/var/lib/kiln"),
            bridge_name: Some("br0".into()),
        }
    }

    fn vm(spec: MicroVmSpec) -> MicroVm {
        MicroVm::new(VmId::generate("default", "web").unwrap(), spec)
    }

    fn base() -> MicroVmSpec {
        MicroVmSpec::new("fc", 1, 128, "alpine:latest")
    }

    fn running(mut vm: MicroVm) -> MicroVm {
        vm.status.state = LogicalState::Running;
        vm.status.observed_generation = vm.spec.generation;
        vm.status.applied_shape = Some(vm.spec.shape());
        vm.status.volumes.insert(
            "root".into(),
            ImageMountStatus {
                image: "alpine:latest".into(),
                mount: Mount {
                    mount_type: MountType::Block,
                    source: "/dev/kiln/root".into(),
                },
            },
        );
        for (i, iface) in vm.spec.network_interfaces.clone().iter().enumerate() {
            vm.status.network_interfaces.insert(
                iface.guest_device_name.clone(),
                IfaceStatus {
                    host_device_name: host_device_name(vm.id.uid(), iface.iface_type, i as u32),
                    index: i as u32,
                    mac: "02:00:00:00:00:01".into(),
                },
            );
        }
        vm
    }

    fn plan_for(vm: &MicroVm) -> Plan {
        plan(vm, "fc", ALL, &ctx()).unwrap()
    }

    #[test]
    fn test_new_vm_full_create_sequence() {
        let plan = plan_for(&vm(base()));
        assert_eq!(
            plan.step_names(),
            vec!["image.mount", "provider.create", "provider.start", "provider.state"]
        );
        assert_eq!(plan.target, Target::Running);

        let Step::MountImage { spec, slot } = &plan.steps[0] else {
            panic!("expected mount step");
        };
        assert_eq!(*slot, MountSlot::Volume("root".into()));
        assert_eq!(spec.owner, "default/web");
        assert_eq!(spec.image_use, ImageUse::Volume);
        assert!(spec.owner_usage_id.ends_with("-root"));
    }

    #[test]
    fn test_full_spec_step_order() {
        let spec = base()
            .with_kernel(KernelSpec {
                image: "kernel:6.1".into(),
                filename: "vmlinux".into(),
                cmdline: String::new(),
                add_network_config: true,
            })
            .with_volume(VolumeSpec::new("data", "data:1"))
            .with_interface(NetworkInterfaceSpec::tap("eth0"))
            .with_metadata("user-data", "#cloud-config");
        let plan = plan_for(&vm(spec));

        assert_eq!(
            plan.step_names(),
            vec![
                "image.mount",
                "image.mount",
                "image.mount",
                "network.create",
                "disk.create",
                "provider.create",
                "provider.start",
                "provider.state",
            ]
        );
    }

    #[test]
    fn test_converged_vm_only_observes() {
        let plan = plan_for(&running(vm(base())));
        assert_eq!(plan.steps, vec![Step::ConfirmRunning]);
        assert_eq!(plan.target, Target::Observe);
    }

    #[test]
    fn test_added_interface_on_running_vm() {
        let mut vm = running(vm(base().with_interface(NetworkInterfaceSpec::tap("eth0"))));
        vm.update_spec(
            base()
                .with_interface(NetworkInterfaceSpec::tap("eth0"))
                .with_interface(NetworkInterfaceSpec::tap("eth1")),
        );

        let plan = plan_for(&vm);
        assert_eq!(plan.step_names(), vec!["network.create", "provider.state"]);
        let Step::CreateIface { guest_device, index, input } = &plan.steps[0] else {
            panic!("expected iface step");
        };
        assert_eq!(guest_device, "eth1");
        assert_eq!(*index, 1);
        assert_eq!(input.device_name, host_device_name(vm.id.uid(), IfaceType::Tap, 1));
        assert!(input.attach);
        assert_eq!(input.bridge_name.as_deref(), Some("br0"));
    }

    #[rstest]
    #[case::vcpu(MicroVmSpec { vcpu: 2, ..base() })]
    #[case::memory(MicroVmSpec { memory_mb: 256, ..base() })]
    #[case::root_image(MicroVmSpec::new("fc", 1, 128, "alpine:3.20"))]
    fn test_shape_change_recreates(#[case] updated: MicroVmSpec) {
        let mut vm = running(vm(base()));
        vm.update_spec(updated);

        let names = plan_for(&vm).step_names();
        assert_eq!(names[0], "provider.delete");
        assert!(names.ends_with(&["provider.create", "provider.start", "provider.state"]));
    }

    #[test]
    fn test_changed_root_image_releases_old_mount() {
        let mut vm = running(vm(base()));
        vm.update_spec(MicroVmSpec::new("fc", 1, 128, "alpine:3.20"));

        let plan = plan_for(&vm);
        assert!(plan.steps.iter().any(|s| matches!(
            s,
            Step::ReleaseImage { spec, .. } if spec.image == "alpine:latest"
        )));
    }

    #[test]
    fn test_removed_interface_recreates() {
        let mut vm = running(vm(base()
            .with_interface(NetworkInterfaceSpec::tap("eth0"))
            .with_interface(NetworkInterfaceSpec::tap("eth1"))));
        vm.update_spec(base().with_interface(NetworkInterfaceSpec::tap("eth0")));

        let plan = plan_for(&vm);
        assert_eq!(plan.steps[0], Step::DeleteVm);
        assert!(matches!(
            &plan.steps[1],
            Step::DeleteIface { guest_device, .. } if guest_device == "eth1"
        ));
    }

    #[test]
    fn test_delete_order_and_identifiers() {
        let mut vm = running(vm(base().with_interface(NetworkInterfaceSpec::tap("eth0"))));
        vm.mark_deleted();

        let plan = plan_for(&vm);
        assert_eq!(plan.target, Target::Deleted);
        assert_eq!(
            plan.step_names(),
            vec!["provider.delete", "network.delete", "image.release", "disk.delete"]
        );
        let Step::DeleteMetadataDisk { path } = plan.steps.last().unwrap() else {
            panic!("expected disk step");
        };
        assert_eq!(
            *path,
            PathBuf::from(format!("/var/lib/kiln/vm/default/web/{}/cloud-init.img", vm.id.uid()))
        );
    }

    #[test]
    fn test_delete_covers_resources_missing_from_status() {
        let mut vm = vm(base().with_interface(NetworkInterfaceSpec::tap("eth0")));
        vm.mark_deleted();

        let plan = plan_for(&vm);
        assert!(plan.steps.iter().any(|s| matches!(
            s,
            Step::DeleteIface { device_name, .. }
                if *device_name == host_device_name(vm.id.uid(), IfaceType::Tap, 0)
        )));
        assert!(plan
            .steps
            .iter()
            .any(|s| matches!(s, Step::ReleaseImage { slot: MountSlot::Volume(id), .. } if id == "root")));
    }

    #[test]
    fn test_delete_skips_validation() {
        let mut vm = vm(MicroVmSpec { vcpu: 0, ..base() });
        vm.mark_deleted();
        assert!(plan(&vm, "fc", &[], &ctx()).is_ok());
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let vm = vm(MicroVmSpec { memory_mb: 1, ..base() });
        assert!(matches!(
            plan(&vm, "fc", ALL, &ctx()),
            Err(PlanError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_capability_rejected() {
        let mut iface = NetworkInterfaceSpec::tap("eth0");
        iface.iface_type = IfaceType::Macvtap;
        let vm = vm(base().with_interface(iface));

        assert_eq!(
            plan(&vm, "fc", &[Capability::Tap], &ctx()),
            Err(PlanError::MissingCapability {
                provider: "fc".into(),
                capability: Capability::Macvtap,
            })
        );
    }

    #[test]
    fn test_created_vm_only_starts() {
        let mut vm = vm(base());
        vm.status.state = LogicalState::Created;
        vm.status.observed_generation = 1;
        vm.status.applied_shape = Some(vm.spec.shape());

        assert_eq!(
            plan_for(&vm).steps,
            vec![Step::CreateVm, Step::StartVm, Step::ConfirmRunning]
        );
    }

    #[test]
    fn test_host_device_name_fits_ifnamsiz() {
        let uid = VmUid::new();
        let name = host_device_name(uid, IfaceType::Macvtap, 12);
        assert!(name.starts_with('v'));
        assert!(name.len() <= crate::network::MAX_DEVICE_NAME_LEN);
        assert_eq!(name, format!("v{}12", uid.short()));
    }

    #[test]
    fn test_metadata_disk_contents() {
        let vm = vm(base().with_metadata("meta-data", "instance-id: web"));
        let disk = metadata_disk(&vm, &ctx());

        assert_eq!(disk.volume_name, "cidata");
        assert_eq!(disk.disk_type, DiskType::Iso9660);
        assert_eq!(disk.files.len(), 1);
        assert_eq!(disk.files[0].path, "/meta-data");
        assert_eq!(
            BASE64.decode(&disk.files[0].content_base64).unwrap(),
            b"instance-id: web"
        );
    }
}
