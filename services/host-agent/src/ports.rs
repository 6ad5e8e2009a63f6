//! Host services the reconciler orchestrates besides the provider.
//!
//! Each trait is a seam: production adapters shell out to the host, the
//! mocks in [`crate::mock`] record calls for tests.

use std::path::PathBuf;

use async_trait::async_trait;
use kiln_model::{IfaceType, ImageUse, Mount};
use serde::{Deserialize, Serialize};

use crate::error::PortResult;

/// Request for a host network device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceCreateInput {
    pub device_name: String,
    pub iface_type: IfaceType,
    /// Explicit MAC; the service picks one when absent.
    pub mac: Option<String>,
    /// Enslave the device to `bridge_name`.
    pub attach: bool,
    pub bridge_name: Option<String>,
}

/// A host network device as it exists now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceDetails {
    pub device_name: String,
    pub iface_type: IfaceType,
    pub mac: String,
    /// Kernel interface index.
    pub index: u32,
}

#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn iface_create(&self, input: &IfaceCreateInput) -> PortResult<IfaceDetails>;

    /// Remove a device. Missing devices report `NotFound`.
    async fn iface_delete(&self, device_name: &str) -> PortResult<()>;

    async fn iface_exists(&self, device_name: &str) -> PortResult<bool>;

    async fn iface_details(&self, device_name: &str) -> PortResult<IfaceDetails>;
}

/// An image reference and who pulled it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSpec {
    pub image: String,
    /// `{namespace}/{name}` of the VM.
    pub owner: String,
}

/// An image mounted for one use by one VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageMountSpec {
    pub image: String,
    pub owner: String,
    pub image_use: ImageUse,
    /// Tag used to find the mount again at cleanup, e.g. `{uid}-kernel`.
    pub owner_usage_id: String,
}

impl ImageMountSpec {
    pub fn image_spec(&self) -> ImageSpec {
        ImageSpec {
            image: self.image.clone(),
            owner: self.owner.clone(),
        }
    }
}

#[async_trait]
pub trait ImageService: Send + Sync {
    /// The image content is present locally.
    async fn exists(&self, spec: &ImageSpec) -> PortResult<bool>;

    async fn pull(&self, spec: &ImageSpec) -> PortResult<()>;

    /// Pull if needed and mount for `spec.image_use`. Mounting an already
    /// mounted image returns the existing mounts.
    async fn pull_and_mount(&self, spec: &ImageMountSpec) -> PortResult<Vec<Mount>>;

    async fn is_mounted(&self, spec: &ImageMountSpec) -> PortResult<bool>;

    /// Unmount and drop the owner's usage tag. Missing mounts report
    /// `NotFound`.
    async fn release(&self, spec: &ImageMountSpec) -> PortResult<()>;
}

/// Filesystem to format a disk image with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    Fat32,
    Iso9660,
}

/// A file to place inside a created disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskFile {
    pub path: String,
    pub content_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCreateInput {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub volume_name: String,
    pub disk_type: DiskType,
    pub files: Vec<DiskFile>,
    /// Replace an existing image at `path`.
    pub overwrite: bool,
}

#[async_trait]
pub trait DiskService: Send + Sync {
    async fn create(&self, input: &DiskCreateInput) -> PortResult<()>;

    async fn exists(&self, path: &std::path::Path) -> PortResult<bool>;

    /// Remove a disk image. Missing images report `NotFound`.
    async fn delete(&self, path: &std::path::Path) -> PortResult<()>;
}
