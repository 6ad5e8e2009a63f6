//! In-memory adapters for tests and development.
//!
//! All mocks write to a shared [`CallLog`] so the order of actions across
//! services can be asserted, and each accepts injected [`Fault`]s per
//! operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_id::VmId;
use kiln_model::{MicroVm, Mount, MountType, ProviderState};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{PortError, PortResult};
use crate::ports::{
    DiskCreateInput, DiskService, IfaceCreateInput, IfaceDetails, ImageMountSpec, ImageService,
    ImageSpec, NetworkService,
};
use crate::provider::{Capability, MachineMetrics, MicroVmProvider};

/// One adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub service: &'static str,
    pub op: &'static str,
    pub subject: String,
    /// False for pure queries (`state`, `exists`, ...).
    pub mutating: bool,
}

impl Call {
    /// `service.op`
    pub fn label(&self) -> String {
        format!("{}.{}", self.service, self.op)
    }
}

impl std::fmt::Display for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{} {}", self.service, self.op, self.subject)
    }
}

/// Ordered record of calls shared between mocks.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, service: &'static str, op: &'static str, subject: impl Into<String>, mutating: bool) {
        self.0.lock().push(Call {
            service,
            op,
            subject: subject.into(),
            mutating,
        });
    }

    pub fn entries(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    /// Labels of the calls that change something, in order.
    pub fn mutating_ops(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|c| c.mutating)
            .map(Call::label)
            .collect()
    }

    /// Like [`CallLog::mutating_ops`] but with subjects.
    pub fn mutations(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|c| c.mutating)
            .map(ToString::to_string)
            .collect()
    }

    /// Number of calls with the given `service.op` label.
    pub fn count(&self, label: &str) -> usize {
        self.0.lock().iter().filter(|c| c.label() == label).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Injected misbehaviour for one operation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail every call.
    Fail(String),
    /// Fail the next `n` calls, then behave.
    FailTimes(u32, String),
    /// Never complete.
    Hang,
}

#[derive(Debug, Default)]
struct Faults(Mutex<HashMap<&'static str, Fault>>);

enum FaultAction {
    Proceed,
    Fail(String),
    Hang,
}

impl Faults {
    fn inject(&self, op: &'static str, fault: Fault) {
        self.0.lock().insert(op, fault);
    }

    fn clear(&self, op: &str) {
        self.0.lock().remove(op);
    }

    async fn check(&self, op: &str) -> PortResult<()> {
        let action = {
            let mut faults = self.0.lock();
            match faults.get_mut(op) {
                None => FaultAction::Proceed,
                Some(Fault::Fail(message)) => FaultAction::Fail(message.clone()),
                Some(Fault::Hang) => FaultAction::Hang,
                Some(Fault::FailTimes(remaining, message)) => {
                    let message = message.clone();
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        faults.remove(op);
                    }
                    FaultAction::Fail(message)
                }
            }
        };

        match action {
            FaultAction::Proceed => Ok(()),
            FaultAction::Fail(message) => Err(PortError::Failed(message)),
            FaultAction::Hang => std::future::pending().await,
        }
    }
}

macro_rules! fault_methods {
    () => {
        /// Fail every call to `op`.
        pub fn fail(&self, op: &'static str, message: impl Into<String>) {
            self.faults.inject(op, Fault::Fail(message.into()));
        }

        /// Fail the next `times` calls to `op`.
        pub fn fail_times(&self, op: &'static str, times: u32, message: impl Into<String>) {
            if times > 0 {
                self.faults.inject(op, Fault::FailTimes(times, message.into()));
            }
        }

        /// Make calls to `op` never complete.
        pub fn hang(&self, op: &'static str) {
            self.faults.inject(op, Fault::Hang);
        }

        pub fn clear_fault(&self, op: &str) {
            self.faults.clear(op);
        }
    };
}

/// Provider keeping VM states in a map.
pub struct MockProvider {
    name: String,
    capabilities: Vec<Capability>,
    log: CallLog,
    faults: Faults,
    vms: Mutex<HashMap<VmId, ProviderState>>,
    state_after_start: Mutex<ProviderState>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            capabilities: vec![Capability::Tap, Capability::Macvtap, Capability::MetadataService],
            log,
            faults: Faults::default(),
            vms: Mutex::new(HashMap::new()),
            state_after_start: Mutex::new(ProviderState::Running),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    fault_methods!();

    /// State `start` leaves a VM in; `Pending` simulates a slow boot.
    pub fn set_state_after_start(&self, state: ProviderState) {
        *self.state_after_start.lock() = state;
    }

    /// Overwrite the state of an existing VM, e.g. to simulate a crash.
    pub fn set_state(&self, id: &VmId, state: ProviderState) {
        if let Some(current) = self.vms.lock().get_mut(id) {
            *current = state;
        }
    }

    /// Forget a VM as if its process vanished.
    pub fn remove(&self, id: &VmId) {
        self.vms.lock().remove(id);
    }

    pub fn vm_state(&self, id: &VmId) -> Option<ProviderState> {
        self.vms.lock().get(id).copied()
    }

    pub fn vm_count(&self) -> usize {
        self.vms.lock().len()
    }
}

#[async_trait]
impl MicroVmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn create(&self, vm: &MicroVm) -> PortResult<()> {
        self.log.record("provider", "create", vm.id.to_string(), true);
        self.faults.check("create").await?;
        info!(
            vm_id = %vm.id,
            vcpu = vm.spec.vcpu,
            memory_mb = vm.spec.memory_mb,
            "[MOCK] Creating microVM"
        );
        self.vms
            .lock()
            .entry(vm.id.clone())
            .or_insert(ProviderState::Configured);
        Ok(())
    }

    async fn start(&self, vm: &MicroVm) -> PortResult<()> {
        self.log.record("provider", "start", vm.id.to_string(), true);
        self.faults.check("start").await?;
        let next = *self.state_after_start.lock();
        match self.vms.lock().get_mut(&vm.id) {
            Some(state) => {
                info!(vm_id = %vm.id, "[MOCK] Starting microVM");
                *state = next;
                Ok(())
            }
            None => Err(PortError::NotFound(vm.id.to_string())),
        }
    }

    async fn delete(&self, id: &VmId) -> PortResult<()> {
        self.log.record("provider", "delete", id.to_string(), true);
        self.faults.check("delete").await?;
        match self.vms.lock().remove(id) {
            Some(_) => {
                info!(vm_id = %id, "[MOCK] Deleted microVM");
                Ok(())
            }
            None => Err(PortError::NotFound(id.to_string())),
        }
    }

    async fn state(&self, id: &VmId) -> PortResult<ProviderState> {
        self.log.record("provider", "state", id.to_string(), false);
        self.faults.check("state").await?;
        Ok(self.vm_state(id).unwrap_or(ProviderState::Unknown))
    }

    async fn metrics(&self, id: &VmId) -> PortResult<MachineMetrics> {
        self.log.record("provider", "metrics", id.to_string(), false);
        self.faults.check("metrics").await?;
        if self.vm_state(id).is_none() {
            return Err(PortError::NotFound(id.to_string()));
        }
        Ok(MachineMetrics::new(id.clone())
            .with_value("cpu_time_us", 0)
            .with_value("memory_bytes", 0))
    }
}

/// Network service keeping devices in a map.
pub struct MockNetworkService {
    log: CallLog,
    faults: Faults,
    devices: Mutex<BTreeMap<String, IfaceDetails>>,
    next_index: AtomicU32,
}

impl MockNetworkService {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            faults: Faults::default(),
            devices: Mutex::new(BTreeMap::new()),
            next_index: AtomicU32::new(2),
        }
    }

    fault_methods!();

    pub fn devices(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl NetworkService for MockNetworkService {
    async fn iface_create(&self, input: &IfaceCreateInput) -> PortResult<IfaceDetails> {
        self.log.record("network", "iface_create", &input.device_name, true);
        self.faults.check("iface_create").await?;

        let mut devices = self.devices.lock();
        if let Some(existing) = devices.get(&input.device_name) {
            return Ok(existing.clone());
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let details = IfaceDetails {
            device_name: input.device_name.clone(),
            iface_type: input.iface_type,
            mac: input
                .mac
                .clone()
                .unwrap_or_else(|| format!("02:00:00:00:{:02x}:{:02x}", index >> 8, index & 0xff)),
            index,
        };
        debug!(device = %details.device_name, mac = %details.mac, "[MOCK] Created interface");
        devices.insert(input.device_name.clone(), details.clone());
        Ok(details)
    }

    async fn iface_delete(&self, device_name: &str) -> PortResult<()> {
        self.log.record("network", "iface_delete", device_name, true);
        self.faults.check("iface_delete").await?;
        self.devices
            .lock()
            .remove(device_name)
            .map(|_| ())
            .ok_or_else(|| PortError::NotFound(device_name.to_string()))
    }

    async fn iface_exists(&self, device_name: &str) -> PortResult<bool> {
        self.log.record("network", "iface_exists", device_name, false);
        self.faults.check("iface_exists").await?;
        Ok(self.devices.lock().contains_key(device_name))
    }

    async fn iface_details(&self, device_name: &str) -> PortResult<IfaceDetails> {
        self.log.record("network", "iface_details", device_name, false);
        self.faults.check("iface_details").await?;
        self.devices
            .lock()
            .get(device_name)
            .cloned()
            .ok_or_else(|| PortError::NotFound(device_name.to_string()))
    }
}

/// Image service tracking pulls and mounts by owner usage id.
pub struct MockImageService {
    log: CallLog,
    faults: Faults,
    pulled: Mutex<HashSet<String>>,
    /// owner usage id -> (image, mount)
    mounts: Mutex<BTreeMap<String, (String, Mount)>>,
}

impl MockImageService {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            faults: Faults::default(),
            pulled: Mutex::new(HashSet::new()),
            mounts: Mutex::new(BTreeMap::new()),
        }
    }

    fault_methods!();

    /// Owner usage ids with a live mount.
    pub fn mounted(&self) -> Vec<String> {
        self.mounts.lock().keys().cloned().collect()
    }

    /// Drop a mount behind the reconciler's back.
    pub fn unmount(&self, owner_usage_id: &str) {
        self.mounts.lock().remove(owner_usage_id);
    }
}

#[async_trait]
impl ImageService for MockImageService {
    async fn exists(&self, spec: &ImageSpec) -> PortResult<bool> {
        self.log.record("image", "exists", &spec.image, false);
        self.faults.check("exists").await?;
        Ok(self.pulled.lock().contains(&spec.image))
    }

    async fn pull(&self, spec: &ImageSpec) -> PortResult<()> {
        self.log.record("image", "pull", &spec.image, true);
        self.faults.check("pull").await?;
        self.pulled.lock().insert(spec.image.clone());
        Ok(())
    }

    async fn pull_and_mount(&self, spec: &ImageMountSpec) -> PortResult<Vec<Mount>> {
        self.log.record(
            "image",
            "pull_and_mount",
            format!("{} {}", spec.image, spec.owner_usage_id),
            true,
        );
        self.faults.check("pull_and_mount").await?;
        self.pulled.lock().insert(spec.image.clone());

        let mount = Mount {
            mount_type: MountType::Block,
            source: format!("/dev/kiln/{}", spec.owner_usage_id),
        };
        self.mounts
            .lock()
            .insert(spec.owner_usage_id.clone(), (spec.image.clone(), mount.clone()));
        Ok(vec![mount])
    }

    async fn is_mounted(&self, spec: &ImageMountSpec) -> PortResult<bool> {
        self.log.record("image", "is_mounted", &spec.owner_usage_id, false);
        self.faults.check("is_mounted").await?;
        Ok(self
            .mounts
            .lock()
            .get(&spec.owner_usage_id)
            .is_some_and(|(image, _)| *image == spec.image))
    }

    async fn release(&self, spec: &ImageMountSpec) -> PortResult<()> {
        self.log.record(
            "image",
            "release",
            format!("{} {}", spec.image, spec.owner_usage_id),
            true,
        );
        self.faults.check("release").await?;
        self.mounts
            .lock()
            .remove(&spec.owner_usage_id)
            .map(|_| ())
            .ok_or_else(|| PortError::NotFound(spec.owner_usage_id.clone()))
    }
}

/// Disk service keeping created images in a map.
pub struct MockDiskService {
    log: CallLog,
    faults: Faults,
    disks: Mutex<HashMap<PathBuf, DiskCreateInput>>,
}

impl MockDiskService {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            faults: Faults::default(),
            disks: Mutex::new(HashMap::new()),
        }
    }

    fault_methods!();

    pub fn disk(&self, path: &Path) -> Option<DiskCreateInput> {
        self.disks.lock().get(path).cloned()
    }
}

#[async_trait]
impl DiskService for MockDiskService {
    async fn create(&self, input: &DiskCreateInput) -> PortResult<()> {
        self.log
            .record("disk", "create", input.path.display().to_string(), true);
        self.faults.check("create").await?;
        let mut disks = self.disks.lock();
        if input.overwrite || !disks.contains_key(&input.path) {
            disks.insert(input.path.clone(), input.clone());
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> PortResult<bool> {
        self.log
            .record("disk", "exists", path.display().to_string(), false);
        self.faults.check("exists").await?;
        Ok(self.disks.lock().contains_key(path))
    }

    async fn delete(&self, path: &Path) -> PortResult<()> {
        self.log
            .record("disk", "delete", path.display().to_string(), true);
        self.faults.check("delete").await?;
        self.disks
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| PortError::NotFound(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_model::MicroVmSpec;

    fn vm() -> MicroVm {
        let id = VmId::generate("default", "web").unwrap();
        MicroVm::new(id, MicroVmSpec::new("mock", 1, 128, "alpine:latest"))
    }

    #[tokio::test]
    async fn test_mock_provider_lifecycle() {
        let log = CallLog::new();
        let provider = MockProvider::new("mock", log.clone());
        let vm = vm();

        assert_eq!(provider.state(&vm.id).await.unwrap(), ProviderState::Unknown);
        provider.create(&vm).await.unwrap();
        assert_eq!(provider.state(&vm.id).await.unwrap(), ProviderState::Configured);
        provider.start(&vm).await.unwrap();
        assert_eq!(provider.state(&vm.id).await.unwrap(), ProviderState::Running);
        provider.delete(&vm.id).await.unwrap();
        assert!(provider.delete(&vm.id).await.unwrap_err().is_not_found());

        assert_eq!(
            log.mutating_ops(),
            vec!["provider.create", "provider.start", "provider.delete", "provider.delete"]
        );
        assert_eq!(log.count("provider.state"), 3);
    }

    #[tokio::test]
    async fn test_fail_times_recovers() {
        let provider = MockProvider::new("mock", CallLog::new());
        let vm = vm();
        provider.fail_times("create", 2, "disk full");

        assert!(provider.create(&vm).await.is_err());
        assert!(provider.create(&vm).await.is_err());
        assert!(provider.create(&vm).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_completes() {
        let provider = MockProvider::new("mock", CallLog::new());
        provider.hang("delete");
        let id = VmId::generate("default", "web").unwrap();

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(5), provider.delete(&id)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_network_assigns_mac_and_index() {
        let network = MockNetworkService::new(CallLog::new());
        let input = IfaceCreateInput {
            device_name: "tabcd12340".into(),
            iface_type: kiln_model::IfaceType::Tap,
            mac: None,
            attach: false,
            bridge_name: None,
        };

        let first = network.iface_create(&input).await.unwrap();
        let again = network.iface_create(&input).await.unwrap();
        assert_eq!(first, again);
        assert!(network.iface_exists("tabcd12340").await.unwrap());
        network.iface_delete("tabcd12340").await.unwrap();
        assert!(network.iface_delete("tabcd12340").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mock_images_track_usage() {
        let images = MockImageService::new(CallLog::new());
        let spec = ImageMountSpec {
            image: "alpine:latest".into(),
            owner: "default/web".into(),
            image_use: kiln_model::ImageUse::Volume,
            owner_usage_id: "vm_x-root".into(),
        };

        assert!(!images.is_mounted(&spec).await.unwrap());
        let mounts = images.pull_and_mount(&spec).await.unwrap();
        assert_eq!(mounts[0].source, "/dev/kiln/vm_x-root");
        assert!(images.exists(&spec.image_spec()).await.unwrap());
        assert!(images.is_mounted(&spec).await.unwrap());

        images.release(&spec).await.unwrap();
        assert!(images.mounted().is_empty());
    }
}
