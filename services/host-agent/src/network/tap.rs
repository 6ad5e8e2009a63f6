//! TAP device management through `ip`.
//!
//! Host-side setup per interface:
//! - TAP device with the name the planner chose (at most 15 bytes)
//! - Optional explicit MAC
//! - Optional enslavement to a bridge
//! - Link brought up
//!
//! Existence and details are read from sysfs (`/sys/class/net/{name}`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_model::IfaceType;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{PortError, PortResult};
use crate::ports::{IfaceCreateInput, IfaceDetails, NetworkService};

/// Linux caps interface names at IFNAMSIZ - 1 bytes.
pub const MAX_DEVICE_NAME_LEN: usize = 15;

/// Network service creating TAP devices with iproute2.
#[derive(Debug, Clone)]
pub struct TapNetworkService {
    sysfs_root: PathBuf,
}

impl TapNetworkService {
    pub fn new() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class/net"),
        }
    }

    /// Read device state from another directory (tests).
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    fn device_dir(&self, device_name: &str) -> PathBuf {
        self.sysfs_root.join(device_name)
    }

    async fn read_details(&self, device_name: &str) -> PortResult<IfaceDetails> {
        let dir = self.device_dir(device_name);
        if !dir.exists() {
            return Err(PortError::NotFound(device_name.to_string()));
        }

        let mac = read_sysfs(&dir.join("address")).await?;
        let index = read_sysfs(&dir.join("ifindex"))
            .await?
            .parse::<u32>()
            .map_err(|e| PortError::Failed(format!("{device_name}: bad ifindex: {e}")))?;

        Ok(IfaceDetails {
            device_name: device_name.to_string(),
            iface_type: IfaceType::Tap,
            mac,
            index,
        })
    }
}

impl Default for TapNetworkService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkService for TapNetworkService {
    async fn iface_create(&self, input: &IfaceCreateInput) -> PortResult<IfaceDetails> {
        if input.iface_type != IfaceType::Tap {
            return Err(PortError::Unsupported(format!(
                "{} interfaces are not supported by the TAP adapter",
                match input.iface_type {
                    IfaceType::Tap => "tap",
                    IfaceType::Macvtap => "macvtap",
                }
            )));
        }
        validate_device_name(&input.device_name)?;

        let name = input.device_name.as_str();
        if self.device_dir(name).exists() {
            debug!(tap = %name, "TAP device already exists");
            return self.read_details(name).await;
        }

        info!(
            tap = %name,
            mac = ?input.mac,
            bridge = ?input.bridge_name,
            "Creating TAP device"
        );

        run_ip(&["tuntap", "add", "dev", name, "mode", "tap"]).await?;

        if let Err(e) = configure(input).await {
            return Err(remove_half_created(name, e).await);
        }

        debug!(tap = %name, "TAP device created and configured");
        self.read_details(name).await
    }

    async fn iface_delete(&self, device_name: &str) -> PortResult<()> {
        if !self.device_dir(device_name).exists() {
            return Err(PortError::NotFound(device_name.to_string()));
        }

        info!(tap = %device_name, "Deleting TAP device");
        run_ip(&["link", "delete", device_name]).await
    }

    async fn iface_exists(&self, device_name: &str) -> PortResult<bool> {
        Ok(self.device_dir(device_name).exists())
    }

    async fn iface_details(&self, device_name: &str) -> PortResult<IfaceDetails> {
        self.read_details(device_name).await
    }
}

async fn configure(input: &IfaceCreateInput) -> PortResult<()> {
    let name = input.device_name.as_str();

    if let Some(mac) = &input.mac {
        run_ip(&["link", "set", "dev", name, "address", mac]).await?;
    }

    if input.attach {
        let Some(bridge) = &input.bridge_name else {
            return Err(PortError::Failed(format!(
                "{name}: attach requested without a bridge"
            )));
        };
        run_ip(&["link", "set", "dev", name, "master", bridge]).await?;
    }

    run_ip(&["link", "set", "dev", name, "up"]).await
}

fn validate_device_name(name: &str) -> PortResult<()> {
    if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN || name.contains('/') {
        return Err(PortError::Unsupported(format!(
            "invalid device name '{name}'"
        )));
    }
    Ok(())
}

async fn read_sysfs(path: &Path) -> PortResult<String> {
    Ok(tokio::fs::read_to_string(path).await?.trim().to_string())
}

/// Run an `ip` command.
/// Delete a TAP device whose configuration failed, handing back the
/// configuration error.
async fn remove_half_created(name: &str, cause: PortError) -> PortError {
    if let Err(e) = run_ip(&["link", "delete", name]).await {
        warn!(
            tap = %name,
            error = %e,
            cause = %cause,
            "Failed to remove TAP device after failed configuration"
        );
    }
    cause
}

async fn run_ip(args: &[&str]) -> PortResult<()> {
    let output = Command::new("ip").args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PortError::Failed(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(())
}
