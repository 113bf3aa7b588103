//! Pool and volume lifecycle on top of a [`StorageBackend`].
//!
//! Validation happens here, before any backend call; the backend only ever
//! sees specs that passed. Two pools are reserved by convention — the images
//! pool (read-mostly base images) and the VMs pool (per-instance volumes) —
//! and are never deletable through [`StorageManager::delete_pool`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::StorageBackend;
use crate::error::ForgeError;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// QCOW2 magic: ASCII `QFI` followed by 0xFB.
const QCOW2_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xFB];

/// MBR boot signature at byte offset 510 of a raw disk image.
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_SIGNATURE_OFFSET: usize = 510;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    Boot,
    Data,
    CloudInit,
    BaseImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeFormat {
    Qcow2,
    Raw,
}

impl VolumeFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Raw => "raw",
        }
    }
}

/// Declares a volume to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Unique within its pool.
    pub name: String,
    pub kind: VolumeKind,
    pub format: VolumeFormat,
    pub capacity_bytes: u64,
    /// Filesystem path of a copy-on-write parent. Only valid for qcow2.
    pub backing_volume: Option<String>,
}

impl VolumeSpec {
    pub fn capacity_gb(&self) -> u64 {
        self.capacity_bytes.div_ceil(GIB)
    }

    /// Reject malformed specs before any hypervisor call.
    pub fn validate(&self) -> Result<(), ForgeError> {
        if self.name.is_empty() {
            return Err(ForgeError::validation("volume name must not be empty"));
        }
        if let Some(backing) = &self.backing_volume {
            if backing.is_empty() {
                return Err(ForgeError::validation(format!(
                    "volume '{}': backing volume path must not be empty",
                    self.name
                )));
            }
            if self.format == VolumeFormat::Raw {
                return Err(ForgeError::validation(format!(
                    "volume '{}': raw volumes cannot have a backing volume",
                    self.name
                )));
            }
        }
        // Cloud-init seed ISOs are size-inferred from their content.
        if self.capacity_bytes == 0 && self.kind != VolumeKind::CloudInit {
            return Err(ForgeError::validation(format!(
                "volume '{}': capacity must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    Inactive,
    Building,
    Running,
    Degraded,
    Inaccessible,
}

/// Observed state of a storage pool. Only directory-backed pools are managed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub path: String,
    pub state: PoolState,
    pub capacity: u64,
    pub allocation: u64,
    pub available: u64,
}

/// Observed state of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub path: String,
    pub pool: String,
    pub capacity: u64,
    pub allocation: u64,
}

/// Names and backing paths of the two reserved pools.
#[derive(Debug, Clone)]
pub struct PoolLayout {
    pub images_pool: String,
    pub images_path: String,
    pub vms_pool: String,
    pub vms_path: String,
}

impl Default for PoolLayout {
    fn default() -> Self {
        PoolLayout {
            images_pool: "vmforge-images".into(),
            images_path: "/var/lib/vmforge/images".into(),
            vms_pool: "vmforge-vms".into(),
            vms_path: "/var/lib/vmforge/vms".into(),
        }
    }
}

impl PoolLayout {
    pub fn is_reserved(&self, pool: &str) -> bool {
        pool == self.images_pool || pool == self.vms_pool
    }
}

/// CRUD over pools and volumes, with validation and idempotent pool
/// provisioning.
pub struct StorageManager<B: StorageBackend> {
    backend: B,
    layout: PoolLayout,
}

impl<B: StorageBackend> StorageManager<B> {
    pub fn new(backend: B, layout: PoolLayout) -> Self {
        StorageManager { backend, layout }
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Idempotent pool provisioning: a second call with the same arguments
    /// is a no-op. The pool is looked up fresh, not cached.
    ///
    /// Failure after define rolls back the definition before returning.
    pub fn ensure_pool(&self, name: &str, path: &str) -> Result<(), ForgeError> {
        if self.backend.lookup_pool(name)?.is_some() {
            tracing::debug!(pool = name, "pool already exists");
            return Ok(());
        }
        self.provision_pool(name, path)
    }

    /// Define, build, start, and mark autostart on both reserved pools.
    pub fn ensure_default_pools(&self) -> Result<(), ForgeError> {
        self.ensure_pool(&self.layout.images_pool, &self.layout.images_path)?;
        self.ensure_pool(&self.layout.vms_pool, &self.layout.vms_path)
    }

    /// Create a pool; fails if a pool with `name` already exists.
    pub fn create_pool(&self, name: &str, path: &str) -> Result<(), ForgeError> {
        if self.backend.lookup_pool(name)?.is_some() {
            return Err(ForgeError::validation(format!(
                "pool '{name}' already exists"
            )));
        }
        self.provision_pool(name, path)
    }

    fn provision_pool(&self, name: &str, path: &str) -> Result<(), ForgeError> {
        self.backend.define_pool(name, path)?;

        // Local rollback of this single operation: a pool that failed to
        // build or start must not stay defined.
        let steps = || -> Result<(), ForgeError> {
            self.backend.build_pool(name)?;
            self.backend.start_pool(name)?;
            self.backend.set_pool_autostart(name, true)
        };
        if let Err(err) = steps() {
            if let Err(undef_err) = self.backend.undefine_pool(name) {
                tracing::warn!(pool = name, error = %undef_err, "failed to undefine pool during rollback");
            }
            return Err(err);
        }

        tracing::info!(pool = name, path, "pool provisioned");
        Ok(())
    }

    pub fn get_pool(&self, name: &str) -> Result<PoolInfo, ForgeError> {
        self.backend
            .lookup_pool(name)?
            .ok_or_else(|| ForgeError::not_found("pool", name))
    }

    /// Delete a pool. The reserved pools are refused unconditionally,
    /// regardless of `force`. With `force`, every volume in the pool is
    /// deleted first, each best-effort.
    pub fn delete_pool(&self, name: &str, force: bool) -> Result<(), ForgeError> {
        if self.layout.is_reserved(name) {
            return Err(ForgeError::validation(format!(
                "pool '{name}' is reserved and cannot be deleted"
            )));
        }
        let info = self.get_pool(name)?;

        if force {
            match self.backend.list_volumes(name) {
                Ok(volumes) => {
                    for vol in volumes {
                        if let Err(err) = self.backend.delete_volume(name, &vol.name) {
                            tracing::warn!(pool = name, volume = %vol.name, error = %err, "failed to delete volume during forced pool delete");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(pool = name, error = %err, "failed to list volumes during forced pool delete");
                }
            }
        }

        if info.state == PoolState::Running {
            self.backend.stop_pool(name)?;
        }
        self.backend.undefine_pool(name)?;
        tracing::info!(pool = name, "pool deleted");
        Ok(())
    }

    pub fn list_pools(&self, names: &[String]) -> Result<Vec<PoolInfo>, ForgeError> {
        let mut pools = Vec::new();
        for name in names {
            if let Some(info) = self.backend.lookup_pool(name)? {
                pools.push(info);
            }
        }
        Ok(pools)
    }

    /// Create a volume after validating its spec. Validation failures are a
    /// distinct error class and happen before any backend call.
    pub fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo, ForgeError> {
        spec.validate()?;
        let info = self.backend.create_volume(pool, spec)?;
        tracing::info!(pool, volume = %spec.name, format = spec.format.as_str(), "volume created");
        Ok(info)
    }

    pub fn delete_volume(&self, pool: &str, name: &str) -> Result<(), ForgeError> {
        self.backend.delete_volume(pool, name)?;
        tracing::info!(pool, volume = name, "volume deleted");
        Ok(())
    }

    pub fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, ForgeError> {
        self.backend.list_volumes(pool)
    }

    pub fn volume_path(&self, pool: &str, name: &str) -> Result<String, ForgeError> {
        self.backend.volume_path(pool, name)
    }

    /// Existence checks never propagate "not found" as an error.
    pub fn volume_exists(&self, pool: &str, name: &str) -> Result<bool, ForgeError> {
        Ok(self.backend.lookup_volume(pool, name)?.is_some())
    }

    /// Upload raw bytes into an existing volume.
    pub fn write_volume(&self, pool: &str, name: &str, data: &[u8]) -> Result<(), ForgeError> {
        self.backend.upload_volume(pool, name, data)
    }

    /// Import a disk image file into the images pool.
    ///
    /// `name` must carry an explicit `.qcow2` or `.raw` extension, and the
    /// file's magic bytes must match the format the extension implies. On
    /// upload failure the just-created volume is deleted.
    pub fn import_image(&self, source: &Path, name: &str) -> Result<VolumeInfo, ForgeError> {
        let format = format_from_extension(name)?;

        let data = std::fs::read(source).map_err(|e| ForgeError::Io {
            context: format!("reading image file {}", source.display()),
            source: e,
        })?;
        validate_image_magic(&data, format, name)?;

        let spec = VolumeSpec {
            name: name.to_string(),
            kind: VolumeKind::BaseImage,
            format,
            capacity_bytes: data.len() as u64,
            backing_volume: None,
        };
        let pool = self.layout.images_pool.as_str();
        let info = self.create_volume(pool, &spec)?;

        if let Err(err) = self.backend.upload_volume(pool, name, &data) {
            if let Err(del_err) = self.backend.delete_volume(pool, name) {
                tracing::warn!(volume = name, error = %del_err, "failed to delete volume after upload failure");
            }
            return Err(err);
        }

        tracing::info!(volume = name, bytes = data.len(), "image imported");
        Ok(info)
    }
}

/// Map an image name's extension to its volume format. Names without an
/// explicit `.qcow2`/`.raw` extension are rejected.
pub fn format_from_extension(name: &str) -> Result<VolumeFormat, ForgeError> {
    if name.ends_with(".qcow2") {
        Ok(VolumeFormat::Qcow2)
    } else if name.ends_with(".raw") {
        Ok(VolumeFormat::Raw)
    } else {
        Err(ForgeError::validation(format!(
            "image name '{name}' must end in .qcow2 or .raw"
        )))
    }
}

/// Check the on-disk magic bytes against the format implied by the image
/// name. A mismatch is a hard validation error, independent of hypervisor
/// state.
pub fn validate_image_magic(
    data: &[u8],
    format: VolumeFormat,
    name: &str,
) -> Result<(), ForgeError> {
    match format {
        VolumeFormat::Qcow2 => {
            if data.len() < 4 || data[..4] != QCOW2_MAGIC {
                return Err(ForgeError::validation(format!(
                    "'{name}' does not look like a qcow2 image (bad magic header)"
                )));
            }
        }
        VolumeFormat::Raw => {
            if data.len() < MBR_SIGNATURE_OFFSET + 2
                || data[MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2] != MBR_SIGNATURE
            {
                return Err(ForgeError::validation(format!(
                    "'{name}' does not look like a raw disk image (missing MBR boot signature)"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn manager() -> StorageManager<MemoryBackend> {
        StorageManager::new(MemoryBackend::new(), PoolLayout::default())
    }

    fn qcow2_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 1024];
        data[..4].copy_from_slice(&QCOW2_MAGIC);
        data
    }

    fn raw_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 1024];
        data[510] = 0x55;
        data[511] = 0xAA;
        data
    }

    fn vol_spec(name: &str) -> VolumeSpec {
        VolumeSpec {
            name: name.into(),
            kind: VolumeKind::Data,
            format: VolumeFormat::Qcow2,
            capacity_bytes: 10 * GIB,
            backing_volume: None,
        }
    }

    #[test]
    fn ensure_pool_is_idempotent() {
        let m = manager();
        m.ensure_pool("scratch", "/tmp/scratch").unwrap();
        m.ensure_pool("scratch", "/tmp/scratch").unwrap();
        assert_eq!(m.backend().pool_count(), 1);
        let info = m.get_pool("scratch").unwrap();
        assert_eq!(info.state, PoolState::Running);
        assert_eq!(m.backend().pool_autostart("scratch"), Some(true));
    }

    #[test]
    fn ensure_pool_undefines_on_start_failure() {
        let backend = MemoryBackend::new();
        backend.fail_start_pool("scratch");
        let m = StorageManager::new(backend, PoolLayout::default());
        assert!(m.ensure_pool("scratch", "/tmp/scratch").is_err());
        // The failed pool must not stay defined.
        assert!(m.backend().lookup_pool("scratch").unwrap().is_none());
    }

    #[test]
    fn create_pool_rejects_duplicate() {
        let m = manager();
        m.create_pool("scratch", "/tmp/scratch").unwrap();
        let err = m.create_pool("scratch", "/tmp/scratch").unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));
    }

    #[test]
    fn reserved_pools_survive_forced_delete() {
        let m = manager();
        m.ensure_default_pools().unwrap();
        for pool in ["vmforge-images", "vmforge-vms"] {
            let err = m.delete_pool(pool, true).unwrap_err();
            assert!(matches!(err, ForgeError::Validation { .. }), "{pool}");
            assert!(m.backend().lookup_pool(pool).unwrap().is_some());
        }
    }

    #[test]
    fn forced_delete_removes_volumes_best_effort() {
        let m = manager();
        m.create_pool("scratch", "/tmp/scratch").unwrap();
        m.create_volume("scratch", &vol_spec("a.qcow2")).unwrap();
        m.create_volume("scratch", &vol_spec("b.qcow2")).unwrap();
        m.backend().fail_delete_volume("a.qcow2");
        m.delete_pool("scratch", true).unwrap();
        assert!(m.backend().lookup_pool("scratch").unwrap().is_none());
    }

    #[test]
    fn delete_pool_not_found() {
        let m = manager();
        let err = m.delete_pool("ghost", false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn backing_volume_with_raw_format_fails_before_backend() {
        let m = manager();
        m.create_pool("scratch", "/tmp/scratch").unwrap();
        let calls_before = m.backend().call_count();
        let spec = VolumeSpec {
            name: "bad.raw".into(),
            kind: VolumeKind::Boot,
            format: VolumeFormat::Raw,
            capacity_bytes: GIB,
            backing_volume: Some("/var/lib/vmforge/images/base.qcow2".into()),
        };
        let err = m.create_volume("scratch", &spec).unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));
        assert_eq!(m.backend().call_count(), calls_before, "no backend call on validation failure");
    }

    #[test]
    fn zero_capacity_rejected_except_cloudinit() {
        let mut spec = vol_spec("zero.qcow2");
        spec.capacity_bytes = 0;
        assert!(spec.validate().is_err());

        spec.kind = VolumeKind::CloudInit;
        spec.format = VolumeFormat::Raw;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn volume_exists_maps_not_found_to_false() {
        let m = manager();
        m.create_pool("scratch", "/tmp/scratch").unwrap();
        assert!(!m.volume_exists("scratch", "ghost.qcow2").unwrap());
        m.create_volume("scratch", &vol_spec("real.qcow2")).unwrap();
        assert!(m.volume_exists("scratch", "real.qcow2").unwrap());
    }

    #[test]
    fn import_rejects_missing_extension() {
        let m = manager();
        m.ensure_default_pools().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk");
        std::fs::write(&path, qcow2_bytes()).unwrap();
        let err = m.import_image(&path, "disk").unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));
    }

    #[test]
    fn import_rejects_magic_mismatch() {
        let m = manager();
        m.ensure_default_pools().unwrap();
        let dir = tempfile::tempdir().unwrap();

        // raw bytes behind a .qcow2 name
        let path = dir.path().join("disk.img");
        std::fs::write(&path, raw_bytes()).unwrap();
        let err = m.import_image(&path, "disk.qcow2").unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));

        // qcow2 bytes behind a .raw name
        std::fs::write(&path, qcow2_bytes()).unwrap();
        let err = m.import_image(&path, "disk.raw").unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));
    }

    #[test]
    fn import_uploads_matching_image() {
        let m = manager();
        m.ensure_default_pools().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.qcow2");
        std::fs::write(&path, qcow2_bytes()).unwrap();

        let info = m.import_image(&path, "base.qcow2").unwrap();
        assert_eq!(info.name, "base.qcow2");
        assert!(m.volume_exists("vmforge-images", "base.qcow2").unwrap());
        assert_eq!(
            m.backend().volume_content("vmforge-images", "base.qcow2"),
            Some(qcow2_bytes())
        );
    }

    #[test]
    fn import_deletes_volume_on_upload_failure() {
        let m = manager();
        m.ensure_default_pools().unwrap();
        m.backend().fail_upload("base.qcow2");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.qcow2");
        std::fs::write(&path, qcow2_bytes()).unwrap();

        assert!(m.import_image(&path, "base.qcow2").is_err());
        assert!(!m.volume_exists("vmforge-images", "base.qcow2").unwrap());
    }

    #[test]
    fn raw_import_accepts_mbr_image() {
        let m = manager();
        m.ensure_default_pools().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.raw");
        std::fs::write(&path, raw_bytes()).unwrap();
        m.import_image(&path, "boot.raw").unwrap();
    }
}
