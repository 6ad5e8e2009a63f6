//! Hypervisor provider interface and registry.
//!
//! A provider realises a [`MicroVm`] on some virtualization engine. Several
//! may be registered at once; each VM names the one it wants in its spec.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_id::VmId;
use kiln_model::{IfaceType, MicroVm, ProviderState};
use serde::{Deserialize, Serialize};

use crate::error::PortResult;

/// Optional features a provider may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Guests can reach an instance metadata endpoint.
    MetadataService,
    /// Interfaces backed by macvtap devices.
    Macvtap,
    /// Interfaces backed by TAP devices.
    Tap,
}

impl Capability {
    /// Capability needed to attach an interface of `iface_type`.
    pub fn for_iface(iface_type: IfaceType) -> Self {
        match iface_type {
            IfaceType::Tap => Self::Tap,
            IfaceType::Macvtap => Self::Macvtap,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MetadataService => "metadata-service",
            Self::Macvtap => "macvtap",
            Self::Tap => "tap",
        };
        f.write_str(s)
    }
}

/// Point-in-time resource counters for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMetrics {
    pub vm_id: VmId,
    pub collected_at: DateTime<Utc>,
    /// Counter name -> value, e.g. `cpu_time_us`.
    pub values: BTreeMap<String, u64>,
}

impl MachineMetrics {
    pub fn new(vm_id: VmId) -> Self {
        Self {
            vm_id,
            collected_at: Utc::now(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: u64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let labels = format!(
            "namespace=\"{}\",name=\"{}\",uid=\"{}\"",
            self.vm_id.namespace(),
            self.vm_id.name(),
            self.vm_id.uid()
        );
        let mut out = String::new();
        for (name, value) in &self.values {
            let _ = writeln!(out, "kiln_microvm_{name}{{{labels}}} {value}");
        }
        out
    }
}

/// A hypervisor backend.
///
/// Every operation must be idempotent: creating an existing VM, starting a
/// running one, or deleting a missing one may not corrupt anything. Delete of
/// an absent VM reports [`crate::PortError::NotFound`]; `state` of an absent
/// VM is [`ProviderState::Unknown`].
#[async_trait]
pub trait MicroVmProvider: Send + Sync {
    /// Registry name, e.g. `firecracker`.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Define the VM. Mounts, interfaces and the metadata disk recorded in
    /// `vm.status` already exist on the host.
    async fn create(&self, vm: &MicroVm) -> PortResult<()>;

    async fn start(&self, vm: &MicroVm) -> PortResult<()>;

    async fn delete(&self, id: &VmId) -> PortResult<()>;

    async fn state(&self, id: &VmId) -> PortResult<ProviderState>;

    async fn metrics(&self, id: &VmId) -> PortResult<MachineMetrics>;
}

/// Providers keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn MicroVmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn MicroVmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn MicroVmProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MicroVmProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
