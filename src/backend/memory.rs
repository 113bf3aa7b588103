//! In-memory hypervisor double.
//!
//! Backs the unit tests for the storage manager and both workflows: records
//! every call, supports per-name failure injection, and models just enough
//! pool/volume/domain state to exercise rollback and teardown ordering.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::backend::{DomainOps, DomainRunState, StorageBackend, TeardownDomains};
use crate::error::ForgeError;
use crate::storage::{PoolInfo, PoolState, VolumeInfo, VolumeSpec};

struct PoolEntry {
    path: String,
    state: PoolState,
    autostart: bool,
    volumes: BTreeMap<String, VolumeEntry>,
}

struct VolumeEntry {
    spec: VolumeSpec,
    content: Option<Vec<u8>>,
}

#[derive(Default)]
struct StorageState {
    pools: BTreeMap<String, PoolEntry>,
    calls: Vec<String>,
    fail_build: Vec<String>,
    fail_start: Vec<String>,
    fail_create_volume: Vec<String>,
    fail_delete_volume: Vec<String>,
    fail_upload: Vec<String>,
    fail_list: Vec<String>,
}

/// In-memory [`StorageBackend`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<StorageState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_count(&self) -> usize {
        self.state.lock().unwrap().pools.len()
    }

    /// Total number of backend calls made so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_build_pool(&self, name: &str) {
        self.state.lock().unwrap().fail_build.push(name.into());
    }

    pub fn fail_start_pool(&self, name: &str) {
        self.state.lock().unwrap().fail_start.push(name.into());
    }

    pub fn fail_create_volume(&self, name: &str) {
        self.state.lock().unwrap().fail_create_volume.push(name.into());
    }

    pub fn fail_delete_volume(&self, name: &str) {
        self.state.lock().unwrap().fail_delete_volume.push(name.into());
    }

    pub fn fail_upload(&self, name: &str) {
        self.state.lock().unwrap().fail_upload.push(name.into());
    }

    pub fn fail_list_volumes(&self, pool: &str) {
        self.state.lock().unwrap().fail_list.push(pool.into());
    }

    pub fn pool_autostart(&self, name: &str) -> Option<bool> {
        self.state.lock().unwrap().pools.get(name).map(|p| p.autostart)
    }

    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pools
            .get(pool)
            .map(|p| p.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn volume_content(&self, pool: &str, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .pools
            .get(pool)
            .and_then(|p| p.volumes.get(name))
            .and_then(|v| v.content.clone())
    }

    fn backend_error(op: &str, name: &str) -> ForgeError {
        ForgeError::Libvirt {
            message: format!("injected {op} failure for '{name}'"),
            hint: "in-memory backend failure injection".into(),
        }
    }
}

fn volume_info(pool: &str, path: &str, entry: &VolumeEntry) -> VolumeInfo {
    VolumeInfo {
        name: entry.spec.name.clone(),
        path: format!("{path}/{}", entry.spec.name),
        pool: pool.to_string(),
        capacity: entry.spec.capacity_bytes,
        allocation: entry.content.as_ref().map(|c| c.len() as u64).unwrap_or(0),
    }
}

impl StorageBackend for MemoryBackend {
    fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("lookup_pool:{name}"));
        Ok(state.pools.get(name).map(|p| PoolInfo {
            name: name.to_string(),
            path: p.path.clone(),
            state: p.state,
            capacity: 100 * crate::storage::GIB,
            allocation: 0,
            available: 100 * crate::storage::GIB,
        }))
    }

    fn define_pool(&self, name: &str, path: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("define_pool:{name}"));
        state.pools.insert(
            name.to_string(),
            PoolEntry {
                path: path.to_string(),
                state: PoolState::Inactive,
                autostart: false,
                volumes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn build_pool(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("build_pool:{name}"));
        if state.fail_build.iter().any(|n| n == name) {
            return Err(Self::backend_error("build", name));
        }
        Ok(())
    }

    fn start_pool(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start_pool:{name}"));
        if state.fail_start.iter().any(|n| n == name) {
            return Err(Self::backend_error("start", name));
        }
        match state.pools.get_mut(name) {
            Some(pool) => {
                pool.state = PoolState::Running;
                Ok(())
            }
            None => Err(ForgeError::not_found("pool", name)),
        }
    }

    fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("set_pool_autostart:{name}"));
        match state.pools.get_mut(name) {
            Some(pool) => {
                pool.autostart = autostart;
                Ok(())
            }
            None => Err(ForgeError::not_found("pool", name)),
        }
    }

    fn stop_pool(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop_pool:{name}"));
        match state.pools.get_mut(name) {
            Some(pool) => {
                pool.state = PoolState::Inactive;
                Ok(())
            }
            None => Err(ForgeError::not_found("pool", name)),
        }
    }

    fn undefine_pool(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("undefine_pool:{name}"));
        match state.pools.remove(name) {
            Some(_) => Ok(()),
            None => Err(ForgeError::not_found("pool", name)),
        }
    }

    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeInfo, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create_volume:{pool}/{}", spec.name));
        if state.fail_create_volume.iter().any(|n| n == &spec.name) {
            return Err(Self::backend_error("create_volume", &spec.name));
        }
        let entry = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| ForgeError::not_found("pool", pool))?;
        if entry.volumes.contains_key(&spec.name) {
            return Err(ForgeError::Libvirt {
                message: format!("volume '{}' already exists in pool '{pool}'", spec.name),
                hint: "volume names must be unique within a pool".into(),
            });
        }
        let path = entry.path.clone();
        let vol = VolumeEntry {
            spec: spec.clone(),
            content: None,
        };
        let info = volume_info(pool, &path, &vol);
        entry.volumes.insert(spec.name.clone(), vol);
        Ok(info)
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete_volume:{pool}/{name}"));
        if state.fail_delete_volume.iter().any(|n| n == name) {
            return Err(Self::backend_error("delete_volume", name));
        }
        let entry = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| ForgeError::not_found("pool", pool))?;
        match entry.volumes.remove(name) {
            Some(_) => Ok(()),
            None => Err(ForgeError::not_found("volume", name)),
        }
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("list_volumes:{pool}"));
        if state.fail_list.iter().any(|n| n == pool) {
            return Err(Self::backend_error("list_volumes", pool));
        }
        let entry = state
            .pools
            .get(pool)
            .ok_or_else(|| ForgeError::not_found("pool", pool))?;
        Ok(entry
            .volumes
            .values()
            .map(|v| volume_info(pool, &entry.path, v))
            .collect())
    }

    fn volume_path(&self, pool: &str, name: &str) -> Result<String, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("volume_path:{pool}/{name}"));
        let entry = state
            .pools
            .get(pool)
            .ok_or_else(|| ForgeError::not_found("pool", pool))?;
        match entry.volumes.get(name) {
            Some(_) => Ok(format!("{}/{name}", entry.path)),
            None => Err(ForgeError::not_found("volume", name)),
        }
    }

    fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("lookup_volume:{pool}/{name}"));
        let entry = state
            .pools
            .get(pool)
            .ok_or_else(|| ForgeError::not_found("pool", pool))?;
        Ok(entry.volumes.get(name).map(|v| volume_info(pool, &entry.path, v)))
    }

    fn upload_volume(&self, pool: &str, name: &str, data: &[u8]) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("upload_volume:{pool}/{name}"));
        if state.fail_upload.iter().any(|n| n == name) {
            return Err(Self::backend_error("upload", name));
        }
        let entry = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| ForgeError::not_found("pool", pool))?;
        match entry.volumes.get_mut(name) {
            Some(vol) => {
                vol.content = Some(data.to_vec());
                Ok(())
            }
            None => Err(ForgeError::not_found("volume", name)),
        }
    }
}

// ── Domain double ───────────────────────────────────────────────────

struct DomainEntry {
    uuid: String,
    state: DomainRunState,
    autostart: bool,
    metadata: Option<String>,
    xml: String,
}

#[derive(Default)]
struct DomainState {
    domains: BTreeMap<String, DomainEntry>,
    calls: Vec<String>,
    fail_define: bool,
    fail_autostart: bool,
    fail_start: bool,
    fail_metadata: bool,
    fail_shutdown: bool,
    fail_destroy: bool,
    fail_undefine: bool,
    fail_get_state: bool,
    /// When false, a graceful shutdown request leaves the domain running
    /// (models a guest that ignores ACPI), forcing the timeout path.
    shutdown_completes: bool,
}

/// In-memory [`DomainOps`] + [`TeardownDomains`].
#[derive(Clone)]
pub struct MemoryDomains {
    state: Arc<Mutex<DomainState>>,
}

impl Default for MemoryDomains {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDomains {
    pub fn new() -> Self {
        MemoryDomains {
            state: Arc::new(Mutex::new(DomainState {
                shutdown_completes: true,
                ..DomainState::default()
            })),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn insert_domain(&self, name: &str, state: DomainRunState) {
        self.state.lock().unwrap().domains.insert(
            name.to_string(),
            DomainEntry {
                uuid: format!("uuid-{name}"),
                state,
                autostart: false,
                metadata: None,
                xml: String::new(),
            },
        );
    }

    pub fn run_state(&self, name: &str) -> Option<DomainRunState> {
        self.state.lock().unwrap().domains.get(name).map(|d| d.state)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.state.lock().unwrap().domains.contains_key(name)
    }

    pub fn domain_xml(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .map(|d| d.xml.clone())
    }

    pub fn autostart(&self, name: &str) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .map(|d| d.autostart)
    }

    pub fn metadata(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .and_then(|d| d.metadata.clone())
    }

    pub fn fail_define(&self) {
        self.state.lock().unwrap().fail_define = true;
    }

    pub fn fail_autostart(&self) {
        self.state.lock().unwrap().fail_autostart = true;
    }

    pub fn fail_start(&self) {
        self.state.lock().unwrap().fail_start = true;
    }

    pub fn fail_metadata(&self) {
        self.state.lock().unwrap().fail_metadata = true;
    }

    pub fn fail_shutdown(&self) {
        self.state.lock().unwrap().fail_shutdown = true;
    }

    pub fn fail_destroy(&self) {
        self.state.lock().unwrap().fail_destroy = true;
    }

    pub fn fail_undefine(&self) {
        self.state.lock().unwrap().fail_undefine = true;
    }

    pub fn fail_get_state(&self) {
        self.state.lock().unwrap().fail_get_state = true;
    }

    pub fn ignore_acpi(&self) {
        self.state.lock().unwrap().shutdown_completes = false;
    }

    fn err(op: &str) -> ForgeError {
        ForgeError::Libvirt {
            message: format!("injected {op} failure"),
            hint: "in-memory domain failure injection".into(),
        }
    }
}

impl DomainOps for MemoryDomains {
    fn domain_exists(&self, name: &str) -> Result<bool, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("domain_exists:{name}"));
        Ok(state.domains.contains_key(name))
    }

    fn define_domain(&self, xml: &str) -> Result<String, ForgeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_define {
            state.calls.push("define_domain:FAIL".into());
            return Err(Self::err("define"));
        }
        // Pull the domain name out of the XML the way libvirt would.
        let name = xml
            .split("<name>")
            .nth(1)
            .and_then(|rest| rest.split("</name>").next())
            .unwrap_or("unnamed")
            .to_string();
        state.calls.push(format!("define_domain:{name}"));
        let uuid = format!("uuid-{name}");
        state.domains.insert(
            name,
            DomainEntry {
                uuid: uuid.clone(),
                state: DomainRunState::ShutOff,
                autostart: false,
                metadata: None,
                xml: xml.to_string(),
            },
        );
        Ok(uuid)
    }

    fn set_autostart(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("set_autostart:{name}"));
        if state.fail_autostart {
            return Err(Self::err("set_autostart"));
        }
        match state.domains.get_mut(name) {
            Some(dom) => {
                dom.autostart = true;
                Ok(())
            }
            None => Err(ForgeError::not_found("domain", name)),
        }
    }

    fn start_domain(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start_domain:{name}"));
        if state.fail_start {
            return Err(Self::err("start"));
        }
        match state.domains.get_mut(name) {
            Some(dom) => {
                dom.state = DomainRunState::Running;
                Ok(())
            }
            None => Err(ForgeError::not_found("domain", name)),
        }
    }

    fn set_domain_metadata(&self, name: &str, metadata: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("set_metadata:{name}"));
        if state.fail_metadata {
            return Err(Self::err("set_metadata"));
        }
        match state.domains.get_mut(name) {
            Some(dom) => {
                dom.metadata = Some(metadata.to_string());
                Ok(())
            }
            None => Err(ForgeError::not_found("domain", name)),
        }
    }

    fn destroy_domain(&self, name: &str) -> Result<(), ForgeError> {
        TeardownDomains::destroy_domain(self, name)
    }

    fn undefine_domain(&self, name: &str) -> Result<(), ForgeError> {
        TeardownDomains::undefine_domain(self, name)
    }
}

impl TeardownDomains for MemoryDomains {
    fn lookup_domain(&self, name: &str) -> Result<Option<String>, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("lookup_domain:{name}"));
        Ok(state.domains.get(name).map(|d| d.uuid.clone()))
    }

    fn domain_state(&self, name: &str) -> Result<DomainRunState, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("domain_state:{name}"));
        if state.fail_get_state {
            return Err(Self::err("get_state"));
        }
        state
            .domains
            .get(name)
            .map(|d| d.state)
            .ok_or_else(|| ForgeError::not_found("domain", name))
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("shutdown_domain:{name}"));
        if state.fail_shutdown {
            return Err(Self::err("shutdown"));
        }
        let completes = state.shutdown_completes;
        match state.domains.get_mut(name) {
            Some(dom) => {
                if completes {
                    dom.state = DomainRunState::ShutOff;
                }
                Ok(())
            }
            None => Err(ForgeError::not_found("domain", name)),
        }
    }

    fn destroy_domain(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("destroy_domain:{name}"));
        if state.fail_destroy {
            return Err(Self::err("destroy"));
        }
        match state.domains.get_mut(name) {
            Some(dom) => {
                dom.state = DomainRunState::ShutOff;
                Ok(())
            }
            None => Err(ForgeError::not_found("domain", name)),
        }
    }

    fn undefine_domain(&self, name: &str) -> Result<(), ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("undefine_domain:{name}"));
        if state.fail_undefine {
            return Err(Self::err("undefine"));
        }
        match state.domains.remove(name) {
            Some(_) => Ok(()),
            None => Err(ForgeError::not_found("domain", name)),
        }
    }
}
