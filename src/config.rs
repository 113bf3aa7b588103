//! Host configuration and declarative VM specs, both YAML.
//!
//! The host config is optional (defaults cover a stock libvirt install); a
//! machine spec is the unit handed to the Create workflow and is validated
//! here, before any hypervisor call.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ForgeError;
use crate::naming;
use crate::storage::PoolLayout;

/// Volume ownership applied to created volumes, resolved once at startup
/// and threaded through as an explicit dependency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolumeOwner {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub name: String,
    pub path: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name: String::new(),
            path: String::new(),
        }
    }
}

/// Host-level configuration, loaded from `--config` or
/// `~/.config/vmforge/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub libvirt_uri: String,
    pub connect_timeout_secs: u64,
    pub images_pool: PoolConfig,
    pub vms_pool: PoolConfig,
    pub volume_owner: Option<VolumeOwner>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let layout = PoolLayout::default();
        HostConfig {
            libvirt_uri: "qemu:///system".into(),
            connect_timeout_secs: 10,
            images_pool: PoolConfig {
                name: layout.images_pool,
                path: layout.images_path,
            },
            vms_pool: PoolConfig {
                name: layout.vms_pool,
                path: layout.vms_path,
            },
            volume_owner: None,
        }
    }
}

impl HostConfig {
    pub fn pool_layout(&self) -> PoolLayout {
        PoolLayout {
            images_pool: self.images_pool.name.clone(),
            images_path: self.images_pool.path.clone(),
            vms_pool: self.vms_pool.name.clone(),
            vms_path: self.vms_pool.path.clone(),
        }
    }
}

/// Load the host config. An absent default config file falls back to
/// defaults; an explicitly passed path must exist.
pub fn load_host_config(path: Option<&Path>) -> Result<HostConfig, ForgeError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path(), false),
    };

    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            return Ok(HostConfig::default());
        }
        Err(e) => {
            return Err(ForgeError::SpecLoad {
                what: "config",
                path: path.display().to_string(),
                source: e,
            });
        }
    };

    let config: HostConfig = serde_yaml::from_str(&text).map_err(|e| ForgeError::SpecParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let layout = config.pool_layout();
    if layout.images_pool.is_empty() || layout.vms_pool.is_empty() {
        return Err(ForgeError::validation("pool names must not be empty"));
    }
    if layout.images_path.is_empty() || layout.vms_path.is_empty() {
        return Err(ForgeError::validation("pool paths must not be empty"));
    }
    if layout.images_pool == layout.vms_pool {
        return Err(ForgeError::validation(
            "images pool and vms pool must have distinct names",
        ));
    }
    Ok(config)
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vmforge")
        .join("config.yaml")
}

// ── Machine spec ────────────────────────────────────────────────────

/// Boot disk image source: `empty`, a named image in the images pool, or an
/// absolute filesystem path.
pub const EMPTY_IMAGE: &str = "empty";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootDisk {
    /// `empty`, an image name in the images pool, or an absolute path.
    pub image: String,
    pub size_gb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDisk {
    /// Guest device name, e.g. `vdb`.
    pub device: String,
    pub size_gb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Pre-existing host bridge to attach to.
    pub bridge: String,
    /// IPv4 address, optionally with a CIDR suffix.
    pub ip: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudInitSpec {
    pub hostname: Option<String>,
    pub ssh_keys: Vec<String>,
    /// Verbatim `#cloud-config` payload; overrides the generated one.
    pub user_data: Option<String>,
}

/// A declarative VM specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub resources: Resources,
    pub boot: BootDisk,
    #[serde(default)]
    pub disks: Vec<DataDisk>,
    pub network: NetworkSpec,
    #[serde(default)]
    pub cloud_init: Option<CloudInitSpec>,
}

impl MachineSpec {
    pub fn boot_image_is_path(&self) -> bool {
        self.boot.image.starts_with('/')
    }

    pub fn boot_image_is_empty(&self) -> bool {
        self.boot.image == EMPTY_IMAGE
    }

    pub fn validate(&self) -> Result<(), ForgeError> {
        if self.name.is_empty() {
            return Err(ForgeError::validation("vm name must not be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ForgeError::validation(format!(
                "vm name '{}' may only contain alphanumerics and '-'",
                self.name
            )));
        }
        if self.resources.cpus == 0 {
            return Err(ForgeError::validation("cpus must be greater than zero"));
        }
        if self.resources.memory_mb == 0 {
            return Err(ForgeError::validation("memory_mb must be greater than zero"));
        }
        if self.boot.image.is_empty() {
            return Err(ForgeError::validation(
                "boot.image must be set ('empty', an image name, or an absolute path)",
            ));
        }
        if self.boot.size_gb == 0 {
            return Err(ForgeError::validation("boot.size_gb must be greater than zero"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for disk in &self.disks {
            if disk.device.is_empty() || disk.device == "vda" {
                return Err(ForgeError::validation(format!(
                    "data disk device '{}' is invalid (vda is the boot disk)",
                    disk.device
                )));
            }
            if disk.size_gb == 0 {
                return Err(ForgeError::validation(format!(
                    "data disk '{}': size_gb must be greater than zero",
                    disk.device
                )));
            }
            if !seen.insert(disk.device.as_str()) {
                return Err(ForgeError::validation(format!(
                    "duplicate data disk device '{}'",
                    disk.device
                )));
            }
        }
        if self.network.bridge.is_empty() {
            return Err(ForgeError::validation("network.bridge must be set"));
        }
        // Also rejects IPv6 — MAC/tap derivation is IPv4-only.
        naming::mac_for_ip(&self.network.ip)?;
        Ok(())
    }
}

/// Load and validate a machine spec from a YAML file.
pub fn load_machine_spec(path: &Path) -> Result<MachineSpec, ForgeError> {
    let text = std::fs::read_to_string(path).map_err(|e| ForgeError::SpecLoad {
        what: "machine spec",
        path: path.display().to_string(),
        source: e,
    })?;
    let spec: MachineSpec = serde_yaml::from_str(&text).map_err(|e| ForgeError::SpecParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    spec.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_spec() -> MachineSpec {
        MachineSpec {
            name: "myvm".into(),
            resources: Resources {
                cpus: 2,
                memory_mb: 2048,
            },
            boot: BootDisk {
                image: "ubuntu-24.04.qcow2".into(),
                size_gb: 20,
            },
            disks: vec![DataDisk {
                device: "vdb".into(),
                size_gb: 50,
            }],
            network: NetworkSpec {
                bridge: "br0".into(),
                ip: "10.20.30.40/24".into(),
                gateway: Some("10.20.30.1".into()),
            },
            cloud_init: Some(CloudInitSpec {
                hostname: None,
                ssh_keys: vec!["ssh-ed25519 AAAA test@host".into()],
                user_data: None,
            }),
        }
    }

    #[test]
    fn sample_spec_is_valid() {
        sample_spec().validate().unwrap();
    }

    #[test]
    fn spec_roundtrips_through_yaml() {
        let spec = sample_spec();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back: MachineSpec = serde_yaml::from_str(&yaml).unwrap();
        back.validate().unwrap();
        assert_eq!(back.name, "myvm");
    }

    #[test]
    fn rejects_bad_names() {
        let mut spec = sample_spec();
        spec.name = "".into();
        assert!(spec.validate().is_err());
        spec.name = "has spaces".into();
        assert!(spec.validate().is_err());
        spec.name = "under_score".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_devices() {
        let mut spec = sample_spec();
        spec.disks.push(DataDisk {
            device: "vdb".into(),
            size_gb: 10,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_vda_data_disk() {
        let mut spec = sample_spec();
        spec.disks[0].device = "vda".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_ipv6() {
        let mut spec = sample_spec();
        spec.network.ip = "fd00::1/64".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn boot_image_classification() {
        let mut spec = sample_spec();
        assert!(!spec.boot_image_is_path());
        assert!(!spec.boot_image_is_empty());
        spec.boot.image = "/var/lib/images/base.qcow2".into();
        assert!(spec.boot_image_is_path());
        spec.boot.image = EMPTY_IMAGE.into();
        assert!(spec.boot_image_is_empty());
    }

    #[test]
    fn host_config_defaults_when_absent() {
        let config = load_host_config(None).unwrap();
        assert_eq!(config.libvirt_uri, "qemu:///system");
        assert_eq!(config.images_pool.name, "vmforge-images");
    }

    #[test]
    fn host_config_parses_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "libvirt_uri: qemu:///session\nvolume_owner:\n  uid: 107\n  gid: 107\n",
        )
        .unwrap();
        let config = load_host_config(Some(&path)).unwrap();
        assert_eq!(config.libvirt_uri, "qemu:///session");
        let owner = config.volume_owner.unwrap();
        assert_eq!((owner.uid, owner.gid), (107, 107));
        // Unset sections keep their defaults.
        assert_eq!(config.vms_pool.name, "vmforge-vms");
    }

    #[test]
    fn host_config_rejects_colliding_pool_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "images_pool: {name: same, path: /a}\nvms_pool: {name: same, path: /b}\n",
        )
        .unwrap();
        assert!(load_host_config(Some(&path)).is_err());
    }
}
