//! Capability interfaces over the hypervisor.
//!
//! Each consumer declares only the handful of operations it actually calls,
//! so the real libvirt client and the in-memory test double are freely
//! substitutable and each component's blast radius stays visible in its
//! trait bound.

pub mod libvirt;
pub mod memory;

use crate::error::ForgeError;
use crate::storage::{PoolInfo, VolumeInfo, VolumeSpec};

/// Pool and volume operations consumed by `StorageManager`.
///
/// Lookups that target an absent pool return `ForgeError::NotFound`;
/// `lookup_*` variants map that miss to `None` instead.
pub trait StorageBackend {
    fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>, ForgeError>;
    fn define_pool(&self, name: &str, path: &str) -> Result<(), ForgeError>;
    /// Materialize the pool's backing directory.
    fn build_pool(&self, name: &str) -> Result<(), ForgeError>;
    fn start_pool(&self, name: &str) -> Result<(), ForgeError>;
    fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<(), ForgeError>;
    fn stop_pool(&self, name: &str) -> Result<(), ForgeError>;
    fn undefine_pool(&self, name: &str) -> Result<(), ForgeError>;

    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo, ForgeError>;
    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), ForgeError>;
    fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, ForgeError>;
    fn volume_path(&self, pool: &str, name: &str) -> Result<String, ForgeError>;
    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, ForgeError>;
    /// Write raw bytes into an existing volume, starting at offset zero.
    fn upload_volume(&self, pool: &str, name: &str, data: &[u8]) -> Result<(), ForgeError>;
}

/// Domain operations consumed by the Create workflow (`Provisioner`).
pub trait DomainOps {
    fn domain_exists(&self, name: &str) -> Result<bool, ForgeError>;
    /// Define a persistent domain from XML; returns its UUID.
    fn define_domain(&self, xml: &str) -> Result<String, ForgeError>;
    fn set_autostart(&self, name: &str) -> Result<(), ForgeError>;
    fn start_domain(&self, name: &str) -> Result<(), ForgeError>;
    /// Persist operator metadata (the original spec) on the domain.
    fn set_domain_metadata(&self, name: &str, metadata: &str) -> Result<(), ForgeError>;
    /// Forced stop; used by rollback only. "not running" is not an error.
    fn destroy_domain(&self, name: &str) -> Result<(), ForgeError>;
    fn undefine_domain(&self, name: &str) -> Result<(), ForgeError>;
}

/// Coarse run-state of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRunState {
    Running,
    Paused,
    ShutOff,
    Other,
}

/// Domain operations consumed by the Destroy workflow (`Decommissioner`).
pub trait TeardownDomains {
    /// Look up a domain by name; `None` when it does not exist.
    fn lookup_domain(&self, name: &str) -> Result<Option<String>, ForgeError>;
    fn domain_state(&self, name: &str) -> Result<DomainRunState, ForgeError>;
    /// Request a graceful (ACPI) shutdown.
    fn shutdown_domain(&self, name: &str) -> Result<(), ForgeError>;
    /// Forced stop.
    fn destroy_domain(&self, name: &str) -> Result<(), ForgeError>;
    /// Undefine including firmware/NVRAM cleanup.
    fn undefine_domain(&self, name: &str) -> Result<(), ForgeError>;
}
