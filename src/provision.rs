//! The Create workflow: preflight, storage, domain definition, and boot,
//! with cumulative compensating rollback.
//!
//! Once preflight passes, every completed step adds its undo action to a
//! rollback set, so a failure at any later step undoes exactly what has been
//! done so far — never more, never less. Rollback itself never raises; the
//! original error is what the caller sees.

use crate::backend::{DomainOps, StorageBackend};
use crate::cloudinit;
use crate::config::MachineSpec;
use crate::domain_xml::{self, DomainDisks};
use crate::error::ForgeError;
use crate::naming;
use crate::phase::{InterfaceStatus, Phase, VmStatus};
use crate::storage::{GIB, StorageManager, VolumeFormat, VolumeKind, VolumeSpec};

/// Accumulator of compensating actions. Volumes and the domain are undone
/// by separate sub-procedures, invoked together on any failure once the
/// domain exists.
#[derive(Default)]
struct Rollback {
    /// `(pool, volume)` pairs in creation order.
    volumes: Vec<(String, String)>,
    /// Name of the defined domain, once step 6 has run.
    domain: Option<String>,
}

impl Rollback {
    fn execute<D: DomainOps, B: StorageBackend>(
        &self,
        domains: &D,
        storage: &StorageManager<B>,
    ) {
        if let Some(name) = &self.domain {
            // A domain that failed between define and start may or may not
            // be running; destroy first and ignore "not running".
            if let Err(err) = domains.destroy_domain(name) {
                tracing::debug!(domain = %name, error = %err, "rollback destroy skipped");
            }
            if let Err(err) = domains.undefine_domain(name) {
                tracing::warn!(domain = %name, error = %err, "rollback failed to undefine domain");
            } else {
                tracing::info!(domain = %name, "rolled back domain definition");
            }
        }

        for (pool, volume) in &self.volumes {
            if let Err(err) = storage.delete_volume(pool, volume) {
                tracing::warn!(pool, volume, error = %err, "rollback failed to delete volume");
            } else {
                tracing::info!(pool, volume, "rolled back volume");
            }
        }
    }
}

/// Sequences the Create workflow against narrow domain and storage
/// capabilities.
pub struct Provisioner<D: DomainOps, B: StorageBackend> {
    domains: D,
    storage: StorageManager<B>,
}

impl<D: DomainOps, B: StorageBackend> Provisioner<D, B> {
    pub fn new(domains: D, storage: StorageManager<B>) -> Self {
        Provisioner { domains, storage }
    }

    pub fn storage(&self) -> &StorageManager<B> {
        &self.storage
    }

    /// Provision a VM from its spec. On failure, everything created so far
    /// is rolled back and the original error is returned.
    pub fn create(&self, spec: &MachineSpec) -> Result<VmStatus, ForgeError> {
        spec.validate()?;

        let mut status = VmStatus::new();
        status.transition_to(Phase::Creating)?;

        let mut rollback = Rollback::default();
        match self.run(spec, &mut status, &mut rollback) {
            Ok(()) => {
                status.transition_to(Phase::Running)?;
                tracing::info!(vm = %spec.name, "provisioned");
                Ok(status)
            }
            Err(err) => {
                tracing::warn!(vm = %spec.name, error = %err, "provisioning failed, rolling back");
                rollback.execute(&self.domains, &self.storage);
                status.transition_to_failed("ProvisioningFailed", &err.to_string());
                Err(err)
            }
        }
    }

    fn run(
        &self,
        spec: &MachineSpec,
        status: &mut VmStatus,
        rollback: &mut Rollback,
    ) -> Result<(), ForgeError> {
        let vm = &spec.name;
        let layout = self.storage.layout();
        let vms_pool = layout.vms_pool.clone();
        let images_pool = layout.images_pool.clone();
        let boot_name = naming::boot_volume(vm);

        // Preflight: abort with nothing to undo.
        if self.domains.domain_exists(vm)? {
            return Err(ForgeError::validation(format!(
                "domain '{vm}' already exists"
            )));
        }
        if self.storage.volume_exists(&vms_pool, &boot_name)? {
            return Err(ForgeError::validation(format!(
                "boot volume '{boot_name}' already exists in pool '{vms_pool}'"
            )));
        }
        let backing = self.resolve_boot_backing(spec, &images_pool)?;

        // Boot volume.
        self.storage.create_volume(
            &vms_pool,
            &VolumeSpec {
                name: boot_name.clone(),
                kind: VolumeKind::Boot,
                format: VolumeFormat::Qcow2,
                capacity_bytes: spec.boot.size_gb * GIB,
                backing_volume: backing,
            },
        )?;
        rollback.volumes.push((vms_pool.clone(), boot_name.clone()));

        // Data volumes, one at a time, in spec order.
        for disk in &spec.disks {
            let name = naming::data_volume(vm, &disk.device);
            self.storage.create_volume(
                &vms_pool,
                &VolumeSpec {
                    name: name.clone(),
                    kind: VolumeKind::Data,
                    format: VolumeFormat::Qcow2,
                    capacity_bytes: disk.size_gb * GIB,
                    backing_volume: None,
                },
            )?;
            rollback.volumes.push((vms_pool.clone(), name));
        }

        // Cloud-init seed: the volume joins the rollback set as soon as it
        // exists, so a failed ISO write still reclaims it.
        let seed_name = if spec.cloud_init.is_some() {
            let iso = cloudinit::build_seed_iso(spec)?;
            let name = naming::cloudinit_volume(vm);
            self.storage.create_volume(
                &vms_pool,
                &VolumeSpec {
                    name: name.clone(),
                    kind: VolumeKind::CloudInit,
                    format: VolumeFormat::Raw,
                    capacity_bytes: iso.len() as u64,
                    backing_volume: None,
                },
            )?;
            rollback.volumes.push((vms_pool.clone(), name.clone()));
            self.storage.write_volume(&vms_pool, &name, &iso)?;
            Some(name)
        } else {
            None
        };

        // Domain definition from generated XML.
        let mac = naming::mac_for_ip(&spec.network.ip)?;
        let tap = naming::tap_for_ip(&spec.network.ip)?;
        let disks = DomainDisks {
            boot_path: self.storage.volume_path(&vms_pool, &boot_name)?,
            data: spec
                .disks
                .iter()
                .map(|d| {
                    let name = naming::data_volume(vm, &d.device);
                    Ok((d.device.clone(), self.storage.volume_path(&vms_pool, &name)?))
                })
                .collect::<Result<Vec<_>, ForgeError>>()?,
            seed_path: match &seed_name {
                Some(name) => Some(self.storage.volume_path(&vms_pool, name)?),
                None => None,
            },
        };
        let xml = domain_xml::render(spec, &disks, &mac, &tap);
        let uuid = self.domains.define_domain(&xml)?;
        rollback.domain = Some(vm.clone());
        status.domain_uuid = Some(uuid);
        status.interfaces.push(InterfaceStatus { mac, tap });

        // Autostart is mandatory for the VM to count as provisioned; a
        // failure here rolls back the domain and all storage.
        self.domains.set_autostart(vm)?;
        self.domains.start_domain(vm)?;

        // The one deliberately non-fatal step: keep the original spec on the
        // domain for operators, but never fail the create over it.
        match serde_yaml::to_string(spec) {
            Ok(yaml) => {
                if let Err(err) = self.domains.set_domain_metadata(vm, &yaml) {
                    tracing::warn!(vm = %vm, error = %err, "failed to persist spec metadata on domain");
                }
            }
            Err(err) => {
                tracing::warn!(vm = %vm, error = %err, "failed to serialize spec metadata");
            }
        }

        Ok(())
    }

    /// Resolve the boot disk's backing path: `None` for an empty disk, the
    /// path itself for absolute paths, or the volume path of a named image
    /// which must already exist in the images pool.
    fn resolve_boot_backing(
        &self,
        spec: &MachineSpec,
        images_pool: &str,
    ) -> Result<Option<String>, ForgeError> {
        if spec.boot_image_is_empty() {
            return Ok(None);
        }
        if spec.boot_image_is_path() {
            return Ok(Some(spec.boot.image.clone()));
        }
        if !self.storage.volume_exists(images_pool, &spec.boot.image)? {
            return Err(ForgeError::not_found("base image", &spec.boot.image));
        }
        Ok(Some(self.storage.volume_path(images_pool, &spec.boot.image)?))
    }
}
