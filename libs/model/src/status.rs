//! Observed state of a microVM. Written only by the reconciler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::MachineShape;

/// Lifecycle state as seen by the reconciler.
///
/// ```text
/// Pending -> Created -> Running
///    \          \         \
///     +----------+---------+--> Deleting -> Deleted
///
/// Failed may be entered from any state and is left by a new pass.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogicalState {
    #[default]
    Pending,
    /// Started, but the provider has not yet confirmed it is running.
    Created,
    Running,
    Failed,
    Deleting,
    Deleted,
}

impl LogicalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Created => "created",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for LogicalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the VM as reported by its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    #[default]
    Unknown,
    Pending,
    Configured,
    Running,
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Configured => "configured",
            Self::Running => "running",
        };
        f.write_str(s)
    }
}

/// How a mounted image is exposed to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountType {
    /// A block device path.
    Block,
    /// A directory on the host.
    HostPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub mount_type: MountType,
    pub source: String,
}

/// An image that has been pulled and mounted for this VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMountStatus {
    /// Image reference the mount was made from.
    pub image: String,
    pub mount: Mount,
}

/// Host side of a guest network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceStatus {
    pub host_device_name: String,
    pub index: u32,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MicroVmStatus {
    pub state: LogicalState,
    pub provider_state: ProviderState,
    /// Failed attempts since the last successful pass.
    pub retry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Spec generation last reconciled successfully.
    pub observed_generation: u64,
    /// Generation at which the VM was marked terminally failed. Automatic
    /// retries stay off until the spec moves past it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_mount: Option<ImageMountStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd_mount: Option<ImageMountStatus>,
    /// Volume id -> mount.
    #[serde(default)]
    pub volumes: BTreeMap<String, ImageMountStatus>,
    /// Guest device name -> host device.
    #[serde(default)]
    pub network_interfaces: BTreeMap<String, IfaceStatus>,
    /// Path of the cloud-init disk when one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_disk: Option<String>,
    /// Shape the provider VM was created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_shape: Option<MachineShape>,
}

impl MicroVmStatus {
    /// Record a complete, successful pass at `generation`.
    pub fn record_success(&mut self, generation: u64) {
        self.retry = 0;
        self.last_error = None;
        self.failed_generation = None;
        self.observed_generation = self.observed_generation.max(generation);
    }

    /// Record a failed pass that will be retried.
    pub fn record_failure(&mut self, attempt: u32, error: impl Into<String>) {
        self.retry = attempt;
        self.last_error = Some(error.into());
    }

    /// Mark the VM terminally failed at `generation`.
    pub fn mark_failed(&mut self, generation: u64, attempt: u32, error: impl Into<String>) {
        self.state = LogicalState::Failed;
        self.retry = attempt;
        self.last_error = Some(error.into());
        self.failed_generation = Some(generation);
    }

    /// Forget every host resource; the provider VM is gone.
    pub fn clear_resources(&mut self) {
        self.kernel_mount = None;
        self.initrd_mount = None;
        self.volumes.clear();
        self.network_interfaces.clear();
        self.metadata_disk = None;
        self.applied_shape = None;
        self.provider_state = ProviderState::Unknown;
    }

    /// Fields an observer cares about changed between `self` and `other`.
    pub fn differs_observably(&self, other: &MicroVmStatus) -> bool {
        self.state != other.state
            || self.provider_state != other.provider_state
            || self.observed_generation != other.observed_generation
            || self.retry != other.retry
            || self.last_error != other.last_error
    }
}
