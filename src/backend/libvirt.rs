//! The real hypervisor client: a thin mapping from the capability traits
//! onto libvirt, with no workflow logic of its own.
//!
//! Lookup misses surface as `None`/`NotFound` rather than raw libvirt
//! errors; everything else is wrapped with a hint an operator can act on.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;
use virt::sys;

use crate::backend::{DomainOps, DomainRunState, StorageBackend, TeardownDomains};
use crate::config::VolumeOwner;
use crate::error::ForgeError;
use crate::storage::{PoolInfo, PoolState, VolumeInfo, VolumeSpec};

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// A live libvirt connection plus the volume ownership to stamp onto
/// created volumes. Clones share the connection; the last one dropped
/// closes it.
#[derive(Clone)]
pub struct LibvirtClient {
    conn: Arc<ConnGuard>,
    owner: Option<VolumeOwner>,
}

impl LibvirtClient {
    /// Connect with a timeout, cancellable. `Connect::open` blocks in the C
    /// library, so it runs on the blocking pool while the timer and the
    /// token race it.
    pub async fn connect(
        uri: &str,
        timeout: Duration,
        owner: Option<VolumeOwner>,
        cancel: &CancellationToken,
    ) -> Result<Self, ForgeError> {
        // Suppress libvirt's default error handler that prints to stderr;
        // errors are only surfaced through Result.
        virt_error::clear_error_callback();

        let uri_owned = uri.to_string();
        let handle = tokio::task::spawn_blocking(move || Connect::open(Some(&uri_owned)));

        let uri_hint = uri.to_string();
        tokio::select! {
            joined = handle => {
                let conn = joined
                    .map_err(|e| ForgeError::Libvirt {
                        message: format!("connect task failed: {e}"),
                        hint: "this is a bug in the connection handling".into(),
                    })?
                    .map_err(|e| ForgeError::Libvirt {
                        message: format!("failed to connect to libvirt: {e}"),
                        hint: format!("ensure libvirtd is running and you have access to {uri_hint}"),
                    })?;
                Ok(LibvirtClient {
                    conn: Arc::new(ConnGuard(conn)),
                    owner,
                })
            }
            _ = sleep(timeout) => Err(ForgeError::Timeout {
                operation: format!("connecting to {uri}"),
                seconds: timeout.as_secs(),
            }),
            _ = cancel.cancelled() => Err(ForgeError::Cancelled {
                operation: format!("connecting to {uri}"),
            }),
        }
    }

    fn pool(&self, name: &str) -> Result<Option<StoragePool>, ForgeError> {
        // Lookup failure means "no such pool"; real connection trouble
        // resurfaces on the next operation.
        Ok(StoragePool::lookup_by_name(&self.conn, name).ok())
    }

    fn pool_required(&self, name: &str) -> Result<StoragePool, ForgeError> {
        self.pool(name)?
            .ok_or_else(|| ForgeError::not_found("pool", name))
    }

    fn volume(&self, pool: &str, name: &str) -> Result<Option<StorageVol>, ForgeError> {
        let pool = self.pool_required(pool)?;
        Ok(StorageVol::lookup_by_name(&pool, name).ok())
    }

    fn volume_required(&self, pool: &str, name: &str) -> Result<StorageVol, ForgeError> {
        self.volume(pool, name)?
            .ok_or_else(|| ForgeError::not_found("volume", name))
    }

    fn domain(&self, name: &str) -> Option<Domain> {
        Domain::lookup_by_name(&self.conn, name).ok()
    }

    fn domain_required(&self, name: &str) -> Result<Domain, ForgeError> {
        self.domain(name)
            .ok_or_else(|| ForgeError::not_found("domain", name))
    }
}

fn libvirt_err(message: String, hint: &str) -> ForgeError {
    ForgeError::Libvirt {
        message,
        hint: hint.into(),
    }
}

fn pool_xml(name: &str, path: &str) -> String {
    format!(
        r#"<pool type='dir'>
  <name>{name}</name>
  <target>
    <path>{path}</path>
  </target>
</pool>
"#
    )
}

fn volume_xml(spec: &VolumeSpec, owner: Option<VolumeOwner>) -> String {
    let name = &spec.name;
    let capacity = spec.capacity_bytes;
    let format = spec.format.as_str();

    let permissions = match owner {
        Some(o) => format!(
            "    <permissions>\n      <mode>0644</mode>\n      <owner>{}</owner>\n      <group>{}</group>\n    </permissions>\n",
            o.uid, o.gid
        ),
        None => String::new(),
    };

    let backing = match &spec.backing_volume {
        Some(path) => format!(
            "  <backingStore>\n    <path>{path}</path>\n    <format type='qcow2'/>\n  </backingStore>\n"
        ),
        None => String::new(),
    };

    format!(
        r#"<volume>
  <name>{name}</name>
  <capacity unit='bytes'>{capacity}</capacity>
  <target>
    <format type='{format}'/>
{permissions}  </target>
{backing}</volume>
"#
    )
}

/// Pull `<path>` out of a dir pool's XML description.
fn path_from_pool_xml(xml: &str) -> String {
    xml.split("<path>")
        .nth(1)
        .and_then(|rest| rest.split("</path>").next())
        .unwrap_or("")
        .to_string()
}

fn map_pool_state(state: u32) -> PoolState {
    match state {
        sys::VIR_STORAGE_POOL_BUILDING => PoolState::Building,
        sys::VIR_STORAGE_POOL_RUNNING => PoolState::Running,
        sys::VIR_STORAGE_POOL_DEGRADED => PoolState::Degraded,
        sys::VIR_STORAGE_POOL_INACCESSIBLE => PoolState::Inaccessible,
        _ => PoolState::Inactive,
    }
}

fn pool_info(name: &str, pool: &StoragePool) -> Result<PoolInfo, ForgeError> {
    let info = pool
        .get_info()
        .map_err(|e| libvirt_err(format!("failed to query pool '{name}': {e}"), "check pool health with `virsh pool-info`"))?;
    let xml = pool
        .get_xml_desc(0)
        .map_err(|e| libvirt_err(format!("failed to read pool '{name}' XML: {e}"), "check libvirt permissions"))?;
    Ok(PoolInfo {
        name: name.to_string(),
        path: path_from_pool_xml(&xml),
        state: map_pool_state(info.state),
        capacity: info.capacity,
        allocation: info.allocation,
        available: info.available,
    })
}

fn vol_info(pool_name: &str, vol: &StorageVol) -> Result<VolumeInfo, ForgeError> {
    let name = vol
        .get_name()
        .map_err(|e| libvirt_err(format!("failed to read volume name: {e}"), "check libvirt permissions"))?;
    let path = vol
        .get_path()
        .map_err(|e| libvirt_err(format!("failed to read path of volume '{name}': {e}"), "check libvirt permissions"))?;
    let info = vol
        .get_info()
        .map_err(|e| libvirt_err(format!("failed to query volume '{name}': {e}"), "check libvirt permissions"))?;
    Ok(VolumeInfo {
        name,
        path,
        pool: pool_name.to_string(),
        capacity: info.capacity,
        allocation: info.allocation,
    })
}

impl StorageBackend for LibvirtClient {
    fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>, ForgeError> {
        match self.pool(name)? {
            Some(pool) => Ok(Some(pool_info(name, &pool)?)),
            None => Ok(None),
        }
    }

    fn define_pool(&self, name: &str, path: &str) -> Result<(), ForgeError> {
        StoragePool::define_xml(&self.conn, &pool_xml(name, path), 0)
            .map_err(|e| libvirt_err(format!("failed to define pool '{name}': {e}"), "check the pool path and libvirt permissions"))?;
        Ok(())
    }

    fn build_pool(&self, name: &str) -> Result<(), ForgeError> {
        self.pool_required(name)?
            .build(0)
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to build pool '{name}': {e}"), "check that the parent directory exists and is writable"))
    }

    fn start_pool(&self, name: &str) -> Result<(), ForgeError> {
        self.pool_required(name)?
            .create(0)
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to start pool '{name}': {e}"), "check `virsh pool-start` for details"))
    }

    fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<(), ForgeError> {
        self.pool_required(name)?
            .set_autostart(autostart)
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to set autostart on pool '{name}': {e}"), "check libvirt permissions"))
    }

    fn stop_pool(&self, name: &str) -> Result<(), ForgeError> {
        self.pool_required(name)?
            .destroy()
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to stop pool '{name}': {e}"), "check for volumes still in use"))
    }

    fn undefine_pool(&self, name: &str) -> Result<(), ForgeError> {
        self.pool_required(name)?
            .undefine()
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to undefine pool '{name}': {e}"), "a running pool must be stopped first"))
    }

    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo, ForgeError> {
        let handle = self.pool_required(pool)?;
        let xml = volume_xml(spec, self.owner);
        let vol = StorageVol::create_xml(&handle, &xml, 0).map_err(|e| {
            libvirt_err(
                format!("failed to create volume '{}' in pool '{pool}': {e}", spec.name),
                "check pool free space with `virsh pool-info`",
            )
        })?;
        vol_info(pool, &vol)
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), ForgeError> {
        self.volume_required(pool, name)?
            .delete(0)
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to delete volume '{name}': {e}"), "check libvirt permissions"))
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, ForgeError> {
        let handle = self.pool_required(pool)?;
        let vols = handle
            .list_all_volumes(0)
            .map_err(|e| libvirt_err(format!("failed to list volumes in pool '{pool}': {e}"), "try `virsh pool-refresh` first"))?;
        vols.iter().map(|v| vol_info(pool, v)).collect()
    }

    fn volume_path(&self, pool: &str, name: &str) -> Result<String, ForgeError> {
        self.volume_required(pool, name)?
            .get_path()
            .map_err(|e| libvirt_err(format!("failed to read path of volume '{name}': {e}"), "check libvirt permissions"))
    }

    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, ForgeError> {
        match self.volume(pool, name)? {
            Some(vol) => Ok(Some(vol_info(pool, &vol)?)),
            None => Ok(None),
        }
    }

    fn upload_volume(&self, pool: &str, name: &str, data: &[u8]) -> Result<(), ForgeError> {
        let vol = self.volume_required(pool, name)?;
        let stream = Stream::new(&self.conn, 0)
            .map_err(|e| libvirt_err(format!("failed to open stream: {e}"), "check the libvirt connection"))?;
        vol.upload(&stream, 0, data.len() as u64, 0)
            .map_err(|e| libvirt_err(format!("failed to start upload to volume '{name}': {e}"), "check pool free space"))?;

        let mut sent = 0;
        while sent < data.len() {
            match stream.send(&data[sent..]) {
                Ok(n) => sent += n,
                Err(e) => {
                    stream.abort().ok();
                    return Err(libvirt_err(
                        format!("upload to volume '{name}' failed after {sent} bytes: {e}"),
                        "check pool free space and libvirtd logs",
                    ));
                }
            }
        }
        stream
            .finish()
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to finish upload to volume '{name}': {e}"), "check libvirtd logs"))
    }
}

impl DomainOps for LibvirtClient {
    fn domain_exists(&self, name: &str) -> Result<bool, ForgeError> {
        Ok(self.domain(name).is_some())
    }

    fn define_domain(&self, xml: &str) -> Result<String, ForgeError> {
        let dom = Domain::define_xml(&self.conn, xml)
            .map_err(|e| libvirt_err(format!("failed to define domain: {e}"), "check the generated domain XML for errors"))?;
        dom.get_uuid_string()
            .map_err(|e| libvirt_err(format!("failed to read domain UUID: {e}"), "check libvirt permissions"))
    }

    fn set_autostart(&self, name: &str) -> Result<(), ForgeError> {
        self.domain_required(name)?
            .set_autostart(true)
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to set autostart on '{name}': {e}"), "check libvirt permissions"))
    }

    fn start_domain(&self, name: &str) -> Result<(), ForgeError> {
        self.domain_required(name)?
            .create()
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to start domain '{name}': {e}"), "check `virsh start` for details"))
    }

    fn set_domain_metadata(&self, name: &str, metadata: &str) -> Result<(), ForgeError> {
        self.domain_required(name)?
            .set_metadata(
                sys::VIR_DOMAIN_METADATA_DESCRIPTION as i32,
                Some(metadata),
                None,
                None,
                0,
            )
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to set metadata on '{name}': {e}"), "check libvirt permissions"))
    }

    fn destroy_domain(&self, name: &str) -> Result<(), ForgeError> {
        TeardownDomains::destroy_domain(self, name)
    }

    fn undefine_domain(&self, name: &str) -> Result<(), ForgeError> {
        TeardownDomains::undefine_domain(self, name)
    }
}

impl TeardownDomains for LibvirtClient {
    fn lookup_domain(&self, name: &str) -> Result<Option<String>, ForgeError> {
        match self.domain(name) {
            Some(dom) => {
                let uuid = dom
                    .get_uuid_string()
                    .map_err(|e| libvirt_err(format!("failed to read UUID of '{name}': {e}"), "check libvirt permissions"))?;
                Ok(Some(uuid))
            }
            None => Ok(None),
        }
    }

    fn domain_state(&self, name: &str) -> Result<DomainRunState, ForgeError> {
        let (state, _reason) = self
            .domain_required(name)?
            .get_state()
            .map_err(|e| libvirt_err(format!("failed to read state of '{name}': {e}"), "check libvirt permissions"))?;
        Ok(match state {
            sys::VIR_DOMAIN_RUNNING => DomainRunState::Running,
            sys::VIR_DOMAIN_PAUSED => DomainRunState::Paused,
            sys::VIR_DOMAIN_SHUTOFF => DomainRunState::ShutOff,
            _ => DomainRunState::Other,
        })
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), ForgeError> {
        self.domain_required(name)?
            .shutdown()
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("shutdown of '{name}' failed: {e}"), "the guest may not support ACPI shutdown"))
    }

    fn destroy_domain(&self, name: &str) -> Result<(), ForgeError> {
        let dom = self.domain_required(name)?;
        // Destroying an already-off domain is a no-op, not an error.
        if !dom.is_active().unwrap_or(false) {
            return Ok(());
        }
        dom.destroy()
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("force stop of '{name}' failed: {e}"), "check libvirt permissions"))
    }

    fn undefine_domain(&self, name: &str) -> Result<(), ForgeError> {
        // NVRAM, managed save, and snapshot metadata all go with the domain;
        // a plain undefine refuses UEFI guests.
        let flags = sys::VIR_DOMAIN_UNDEFINE_NVRAM
            | sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE
            | sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA;
        self.domain_required(name)?
            .undefine_flags(flags)
            .map(|_| ())
            .map_err(|e| libvirt_err(format!("failed to undefine domain '{name}': {e}"), "check libvirt permissions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{VolumeFormat, VolumeKind};

    fn spec(backing: Option<&str>) -> VolumeSpec {
        VolumeSpec {
            name: "myvm_boot.qcow2".into(),
            kind: VolumeKind::Boot,
            format: VolumeFormat::Qcow2,
            capacity_bytes: 20 * crate::storage::GIB,
            backing_volume: backing.map(String::from),
        }
    }

    #[test]
    fn volume_xml_without_owner_has_no_permissions() {
        let xml = volume_xml(&spec(None), None);
        assert!(xml.contains("<name>myvm_boot.qcow2</name>"));
        assert!(xml.contains("<capacity unit='bytes'>21474836480</capacity>"));
        assert!(xml.contains("<format type='qcow2'/>"));
        assert!(!xml.contains("<permissions>"));
        assert!(!xml.contains("<backingStore>"));
    }

    #[test]
    fn volume_xml_with_owner_and_backing() {
        let owner = VolumeOwner { uid: 107, gid: 107 };
        let xml = volume_xml(&spec(Some("/var/lib/vmforge/images/base.qcow2")), Some(owner));
        assert!(xml.contains("<owner>107</owner>"));
        assert!(xml.contains("<group>107</group>"));
        assert!(xml.contains("<path>/var/lib/vmforge/images/base.qcow2</path>"));
    }

    #[test]
    fn pool_xml_is_dir_backed() {
        let xml = pool_xml("vmforge-vms", "/var/lib/vmforge/vms");
        assert!(xml.contains("<pool type='dir'>"));
        assert!(xml.contains("<path>/var/lib/vmforge/vms</path>"));
    }

    #[test]
    fn pool_path_extraction() {
        let xml = "<pool><target><path>/srv/pool</path></target></pool>";
        assert_eq!(path_from_pool_xml(xml), "/srv/pool");
        assert_eq!(path_from_pool_xml("<pool/>"), "");
    }

    #[test]
    fn pool_state_mapping() {
        assert_eq!(map_pool_state(sys::VIR_STORAGE_POOL_RUNNING), PoolState::Running);
        assert_eq!(map_pool_state(sys::VIR_STORAGE_POOL_INACTIVE), PoolState::Inactive);
        assert_eq!(map_pool_state(999), PoolState::Inactive);
    }
}
