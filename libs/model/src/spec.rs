//! Desired configuration of a microVM.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Smallest memory size a guest can be booted with.
pub const MIN_MEMORY_MB: u32 = 64;

/// Whether the owner wants the VM to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Present,
    Deleted,
}

/// Kind of host network device backing a guest interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IfaceType {
    /// TAP device, optionally attached to a bridge.
    #[default]
    Tap,
    /// macvtap device on top of a parent interface.
    Macvtap,
}

/// What a pulled image will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageUse {
    Kernel,
    Initrd,
    Volume,
}

impl std::fmt::Display for ImageUse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageUse::Kernel => write!(f, "kernel"),
            ImageUse::Initrd => write!(f, "initrd"),
            ImageUse::Volume => write!(f, "volume"),
        }
    }
}

/// Kernel to boot, sourced from a container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub image: String,
    /// Path of the kernel binary inside the image.
    pub filename: String,
    #[serde(default)]
    pub cmdline: String,
    /// Whether network configuration should be appended to the kernel cmdline.
    #[serde(default)]
    pub add_network_config: bool,
}

/// Optional initial ramdisk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitrdSpec {
    pub image: String,
    pub filename: String,
}

/// A block device whose content comes from a container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

impl VolumeSpec {
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            read_only: false,
            mount_point: None,
        }
    }
}

/// A guest network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    /// Device name inside the guest (e.g. `eth0`). Unique per VM.
    pub guest_device_name: String,
    #[serde(default)]
    pub iface_type: IfaceType,
    /// Explicit guest MAC; generated by the host when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    /// Static address in CIDR form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub allow_metadata_requests: bool,
}

impl NetworkInterfaceSpec {
    pub fn tap(guest_device_name: impl Into<String>) -> Self {
        Self {
            guest_device_name: guest_device_name.into(),
            iface_type: IfaceType::Tap,
            guest_mac: None,
            address: None,
            allow_metadata_requests: false,
        }
    }
}

/// The parts of a spec that can only take effect by recreating the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineShape {
    pub vcpu: u32,
    pub memory_mb: u32,
    pub kernel_image: Option<String>,
    pub initrd_image: Option<String>,
    /// `(volume id, image, read only)` for the root and additional volumes.
    pub volumes: Vec<(String, String, bool)>,
}

/// Desired configuration. Mutated only by the owning client; every mutation
/// bumps `generation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroVmSpec {
    /// Name of the registered provider that realises this VM.
    pub provider: String,
    pub vcpu: u32,
    pub memory_mb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<InitrdSpec>,
    pub root_volume: VolumeSpec,
    #[serde(default)]
    pub additional_volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    /// Instance metadata, materialised into a cloud-init disk.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub desired_state: DesiredState,
    #[serde(default)]
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MicroVmSpec {
    /// A minimal spec booting `root_image` on `provider`.
    pub fn new(provider: impl Into<String>, vcpu: u32, memory_mb: u32, root_image: &str) -> Self {
        let now = Utc::now();
        Self {
            provider: provider.into(),
            vcpu,
            memory_mb,
            kernel: None,
            initrd: None,
            root_volume: VolumeSpec::new("root", root_image),
            additional_volumes: Vec::new(),
            network_interfaces: Vec::new(),
            metadata: BTreeMap::new(),
            labels: BTreeMap::new(),
            desired_state: DesiredState::Present,
            generation: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_kernel(mut self, kernel: KernelSpec) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn with_interface(mut self, iface: NetworkInterfaceSpec) -> Self {
        self.network_interfaces.push(iface);
        self
    }

    pub fn with_volume(mut self, volume: VolumeSpec) -> Self {
        self.additional_volumes.push(volume);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.desired_state == DesiredState::Deleted
    }

    /// Root volume followed by additional volumes, in attach order.
    pub fn volumes(&self) -> impl Iterator<Item = &VolumeSpec> {
        std::iter::once(&self.root_volume).chain(self.additional_volumes.iter())
    }

    pub fn shape(&self) -> MachineShape {
        MachineShape {
            vcpu: self.vcpu,
            memory_mb: self.memory_mb,
            kernel_image: self.kernel.as_ref().map(|k| k.image.clone()),
            initrd_image: self.initrd.as_ref().map(|i| i.image.clone()),
            volumes: self
                .volumes()
                .map(|v| (v.id.clone(), v.image.clone(), v.read_only))
                .collect(),
        }
    }

    /// Check the spec is internally consistent.
    ///
    /// Provider registration and capability checks need the provider set and
    /// happen in the reconciler.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.provider.trim().is_empty() {
            return Err(ModelError::MissingProvider);
        }
        if self.vcpu == 0 {
            return Err(ModelError::InvalidVcpu);
        }
        if self.memory_mb < MIN_MEMORY_MB {
            return Err(ModelError::InvalidMemory {
                min: MIN_MEMORY_MB,
                actual: self.memory_mb,
            });
        }

        if let Some(kernel) = &self.kernel {
            if kernel.image.trim().is_empty() {
                return Err(ModelError::EmptyImage {
                    field: "kernel".to_string(),
                });
            }
        }
        if let Some(initrd) = &self.initrd {
            if initrd.image.trim().is_empty() {
                return Err(ModelError::EmptyImage {
                    field: "initrd".to_string(),
                });
            }
        }

        let mut volume_ids = HashSet::new();
        for volume in self.volumes() {
            if volume.image.trim().is_empty() {
                return Err(ModelError::EmptyImage {
                    field: format!("volume {}", volume.id),
                });
            }
            if !volume_ids.insert(volume.id.as_str()) {
                return Err(ModelError::DuplicateVolume(volume.id.clone()));
            }
        }

        let mut devices = HashSet::new();
        for iface in &self.network_interfaces {
            if !devices.insert(iface.guest_device_name.as_str()) {
                return Err(ModelError::DuplicateInterface(
                    iface.guest_device_name.clone(),
                ));
            }
            if let Some(mac) = &iface.guest_mac {
                if !is_valid_mac(mac) {
                    return Err(ModelError::InvalidMac(mac.clone()));
                }
            }
        }

        if self.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(ModelError::EmptyMetadataKey);
        }

        Ok(())
    }
}

/// Six colon-separated hex octets.
fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}
