//! The Destroy workflow: stop, undefine, reclaim storage.
//!
//! Undefine is the single hard gate. Everything before it (graceful
//! shutdown, forced stop) and everything after it (volume reclamation) is
//! best-effort: a VM whose guest wedges or whose volumes resist deletion
//! still gets removed from the hypervisor, and whatever could not be
//! reclaimed is reported rather than silently dropped.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::backend::{DomainRunState, StorageBackend, TeardownDomains};
use crate::error::ForgeError;
use crate::naming;
use crate::storage::StorageManager;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// What a destroy actually did, for operator output.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// The domain needed a forced stop after the graceful window.
    pub forced_off: bool,
    /// `pool/name` of each reclaimed volume.
    pub volumes_deleted: Vec<String>,
    /// `pool/name` of each volume that resisted deletion.
    pub volumes_failed: Vec<String>,
}

/// Sequences the Destroy workflow against narrow teardown and storage
/// capabilities.
pub struct Decommissioner<D: TeardownDomains, B: StorageBackend> {
    domains: D,
    storage: StorageManager<B>,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl<D: TeardownDomains, B: StorageBackend> Decommissioner<D, B> {
    pub fn new(domains: D, storage: StorageManager<B>) -> Self {
        Decommissioner {
            domains,
            storage,
            poll_interval: SHUTDOWN_POLL_INTERVAL,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timing(mut self, poll: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll;
        self.shutdown_timeout = timeout;
        self
    }

    /// Destroy a VM: stop it, undefine it, reclaim its volumes.
    ///
    /// An unknown name is fatal. An undefine failure is fatal and stops the
    /// workflow before storage cleanup, so the volumes of a still-defined
    /// domain are never pulled out from under it.
    pub async fn destroy(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TeardownReport, ForgeError> {
        if self.domains.lookup_domain(name)?.is_none() {
            return Err(ForgeError::not_found("domain", name));
        }

        let mut report = TeardownReport::default();

        let state = self.domains.domain_state(name)?;
        if state != DomainRunState::ShutOff {
            self.stop_domain(name, state, cancel, &mut report).await;
        }

        self.domains.undefine_domain(name)?;
        tracing::info!(vm = name, "domain undefined");

        self.reclaim_volumes(name, &mut report);
        Ok(report)
    }

    /// Bring a non-shut-off domain down: graceful ACPI request with a
    /// bounded poll, then a forced stop if the guest did not comply. This
    /// step cannot fail; the worst outcome is a forced stop.
    async fn stop_domain(
        &self,
        name: &str,
        state: DomainRunState,
        cancel: &CancellationToken,
        report: &mut TeardownReport,
    ) {
        // A paused guest cannot process ACPI; skip straight to the forced
        // stop. Running guests get the graceful window.
        if state == DomainRunState::Running {
            match self.domains.shutdown_domain(name) {
                Ok(()) => {
                    if self.wait_for_shutoff(name, cancel).await {
                        tracing::info!(vm = name, "guest shut down gracefully");
                        return;
                    }
                    tracing::warn!(vm = name, "guest did not shut down in time");
                }
                Err(err) => {
                    tracing::warn!(vm = name, error = %err, "graceful shutdown request failed");
                }
            }
        }

        report.forced_off = true;
        if let Err(err) = self.domains.destroy_domain(name) {
            tracing::warn!(vm = name, error = %err, "forced stop failed, continuing to undefine");
        }
    }

    /// Poll until the domain reports shut off, the window elapses, or the
    /// token fires. Cancellation and a state read failure both end the wait
    /// early; the caller escalates to a forced stop either way.
    async fn wait_for_shutoff(&self, name: &str, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.shutdown_timeout;
        loop {
            match self.domains.domain_state(name) {
                Ok(DomainRunState::ShutOff) => return true,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(vm = name, error = %err, "failed to read domain state while waiting");
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(vm = name, "cancelled while waiting for shutdown, forcing stop");
                    return false;
                }
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// Delete every volume in the reserved pools whose name starts with the
    /// VM's `<vm>_` prefix. Each pool and each volume fails independently.
    fn reclaim_volumes(&self, name: &str, report: &mut TeardownReport) {
        let prefix = naming::volume_prefix(name);
        let layout = self.storage.layout();

        for pool in [layout.vms_pool.clone(), layout.images_pool.clone()] {
            let volumes = match self.storage.list_volumes(&pool) {
                Ok(volumes) => volumes,
                Err(err) => {
                    tracing::warn!(pool = %pool, error = %err, "failed to list volumes, skipping pool");
                    continue;
                }
            };
            for vol in volumes {
                if !vol.name.starts_with(&prefix) {
                    continue;
                }
                let qualified = format!("{pool}/{}", vol.name);
                match self.storage.delete_volume(&pool, &vol.name) {
                    Ok(()) => report.volumes_deleted.push(qualified),
                    Err(err) => {
                        tracing::warn!(pool = %pool, volume = %vol.name, error = %err, "failed to delete volume");
                        report.volumes_failed.push(qualified);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryDomains};
    use crate::storage::{GIB, PoolLayout, VolumeFormat, VolumeKind, VolumeSpec};

    fn storage_with_volumes(names: &[&str]) -> StorageManager<MemoryBackend> {
        let storage = StorageManager::new(MemoryBackend::new(), PoolLayout::default());
        storage.ensure_default_pools().unwrap();
        for name in names {
            storage
                .create_volume(
                    "vmforge-vms",
                    &VolumeSpec {
                        name: (*name).into(),
                        kind: VolumeKind::Data,
                        format: VolumeFormat::Qcow2,
                        capacity_bytes: GIB,
                        backing_volume: None,
                    },
                )
                .unwrap();
        }
        storage
    }

    fn decommissioner(
        domains: MemoryDomains,
        storage: StorageManager<MemoryBackend>,
    ) -> Decommissioner<MemoryDomains, MemoryBackend> {
        Decommissioner::new(domains, storage)
    }

    fn count(calls: &[String], prefix: &str) -> usize {
        calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    #[tokio::test]
    async fn unknown_domain_is_fatal() {
        let d = decommissioner(MemoryDomains::new(), storage_with_volumes(&[]));
        let err = d.destroy("ghost", &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn shutoff_domain_skips_shutdown_and_destroy() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::ShutOff);
        let d = decommissioner(domains, storage_with_volumes(&["myvm_boot.qcow2"]));

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        assert!(!report.forced_off);
        let calls = d.domains.calls();
        assert_eq!(count(&calls, "shutdown_domain:"), 0);
        assert_eq!(count(&calls, "destroy_domain:"), 0);
        assert_eq!(count(&calls, "undefine_domain:"), 1);
        assert!(!d.domains.is_defined("myvm"));
    }

    #[tokio::test(start_paused = true)]
    async fn running_guest_shuts_down_gracefully() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::Running);
        let d = decommissioner(domains, storage_with_volumes(&["myvm_boot.qcow2"]));

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        assert!(!report.forced_off);
        let calls = d.domains.calls();
        assert_eq!(count(&calls, "shutdown_domain:"), 1);
        assert_eq!(count(&calls, "destroy_domain:"), 0);
        assert_eq!(report.volumes_deleted, vec!["vmforge-vms/myvm_boot.qcow2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn acpi_ignoring_guest_is_forced_off_after_timeout() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::Running);
        domains.ignore_acpi();
        let d = decommissioner(domains, storage_with_volumes(&["myvm_boot.qcow2"]));

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        assert!(report.forced_off);
        let calls = d.domains.calls();
        assert_eq!(count(&calls, "shutdown_domain:"), 1);
        assert_eq!(count(&calls, "destroy_domain:"), 1);
        // 5s window at 500ms cadence: 11 reads (initial + one per tick).
        assert_eq!(count(&calls, "domain_state:") - 1, 11);
        assert!(!d.domains.is_defined("myvm"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_request_failure_falls_through_to_destroy() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::Running);
        domains.fail_shutdown();
        let d = decommissioner(domains, storage_with_volumes(&[]));

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        assert!(report.forced_off);
        assert_eq!(count(&d.domains.calls(), "destroy_domain:"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_failure_does_not_block_undefine() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::Running);
        domains.ignore_acpi();
        domains.fail_destroy();
        let d = decommissioner(domains, storage_with_volumes(&["myvm_boot.qcow2"]));

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        assert!(report.forced_off);
        assert!(!d.domains.is_defined("myvm"));
        assert_eq!(report.volumes_deleted.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_guest_skips_acpi_and_is_forced_off() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::Paused);
        let d = decommissioner(domains, storage_with_volumes(&[]));

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        assert!(report.forced_off);
        let calls = d.domains.calls();
        assert_eq!(count(&calls, "shutdown_domain:"), 0);
        assert_eq!(count(&calls, "destroy_domain:"), 1);
    }

    #[tokio::test]
    async fn undefine_failure_is_fatal_and_blocks_storage_cleanup() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::ShutOff);
        domains.fail_undefine();
        let d = decommissioner(domains, storage_with_volumes(&["myvm_boot.qcow2"]));

        assert!(d.destroy("myvm", &CancellationToken::new()).await.is_err());
        assert_eq!(count(&d.storage.backend().calls(), "delete_volume:"), 0);
        assert_eq!(
            d.storage.backend().volume_names("vmforge-vms"),
            vec!["myvm_boot.qcow2"]
        );
    }

    #[tokio::test]
    async fn state_read_failure_is_fatal_before_any_stop() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::Running);
        domains.fail_get_state();
        let d = decommissioner(domains, storage_with_volumes(&["myvm_boot.qcow2"]));

        assert!(d.destroy("myvm", &CancellationToken::new()).await.is_err());
        let calls = d.domains.calls();
        assert_eq!(count(&calls, "shutdown_domain:"), 0);
        assert_eq!(count(&calls, "undefine_domain:"), 0);
        assert!(d.domains.is_defined("myvm"));
    }

    #[tokio::test]
    async fn prefix_matching_spares_neighbours() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::ShutOff);
        let storage = storage_with_volumes(&[
            "myvm_boot.qcow2",
            "myvm_data-vdb.qcow2",
            "myvm_cloudinit.iso",
            "myvm-backup_boot.qcow2",
            "other-vm_boot.qcow2",
        ]);
        let d = decommissioner(domains, storage);

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.volumes_deleted.len(), 3);
        assert_eq!(
            d.storage.backend().volume_names("vmforge-vms"),
            vec!["myvm-backup_boot.qcow2", "other-vm_boot.qcow2"]
        );
    }

    #[tokio::test]
    async fn stuck_volume_is_reported_not_fatal() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::ShutOff);
        let storage = storage_with_volumes(&["myvm_boot.qcow2", "myvm_data-vdb.qcow2"]);
        storage.backend().fail_delete_volume("myvm_boot.qcow2");
        let d = decommissioner(domains, storage);

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.volumes_failed, vec!["vmforge-vms/myvm_boot.qcow2"]);
        assert_eq!(report.volumes_deleted, vec!["vmforge-vms/myvm_data-vdb.qcow2"]);
    }

    #[tokio::test]
    async fn list_failure_skips_that_pool_only() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::ShutOff);
        let storage = storage_with_volumes(&["myvm_boot.qcow2"]);
        storage.backend().fail_list_volumes("vmforge-vms");
        let d = decommissioner(domains, storage);

        let report = d.destroy("myvm", &CancellationToken::new()).await.unwrap();
        // The VMs pool could not be listed; its volume survives, the images
        // pool sweep still ran.
        assert!(report.volumes_deleted.is_empty());
        assert_eq!(
            d.storage.backend().volume_names("vmforge-vms"),
            vec!["myvm_boot.qcow2"]
        );
        assert_eq!(
            count(&d.storage.backend().calls(), "list_volumes:vmforge-images"),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_the_wait_short_and_forces_stop() {
        let domains = MemoryDomains::new();
        domains.insert_domain("myvm", DomainRunState::Running);
        domains.ignore_acpi();
        let d = decommissioner(domains, storage_with_volumes(&["myvm_boot.qcow2"]))
            .with_timing(Duration::from_millis(500), Duration::from_secs(60));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = d.destroy("myvm", &cancel).await.unwrap();
        // Cancellation behaves like a timeout: forced stop, then teardown
        // completes without waiting out the window.
        assert!(report.forced_off);
        let calls = d.domains.calls();
        assert_eq!(count(&calls, "shutdown_domain:"), 1);
        // Initial state read plus a single in-wait read before the token won.
        assert_eq!(count(&calls, "domain_state:"), 2);
        assert!(!d.domains.is_defined("myvm"));
        assert_eq!(report.volumes_deleted, vec!["vmforge-vms/myvm_boot.qcow2"]);
    }
}
