//! In-memory backends and fixtures shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::blob::BlobStore;
use crate::catalog::{Catalog, test_fixtures};
use crate::descriptor::DescriptorBuilder;
use crate::errors::{ProvisionError, ProvisionResult};
use crate::hypervisor::HypervisorBackend;
use crate::provision::{Provisioner, ProvisionerParts};
use crate::runtime::Timeouts;
use crate::workspace::Workspaces;

/// Trimmed-down libvirt domain template with every rewritten field.
pub const DOMAIN_TEMPLATE: &str = r#"<domain type="kvm">
  <name>template</name>
  <memory unit="KiB">1048576</memory>
  <currentMemory unit="KiB">1048576</currentMemory>
  <vcpu placement="static">1</vcpu>
  <os>
    <type arch="x86_64" machine="pc">hvm</type>
    <boot dev="hd"/>
  </os>
  <devices>
    <emulator>/usr/bin/kvm</emulator>
    <disk type="file" device="disk">
      <driver name="qemu" type="qcow2"/>
      <source file="/var/lib/libvirt/images/template.img"/>
      <target dev="vda" bus="virtio"/>
    </disk>
    <interface type="network">
      <mac address="52:54:00:00:00:00"/>
      <source network="default"/>
      <model type="virtio"/>
    </interface>
  </devices>
</domain>
"#;

/// Bytes stored under [`test_fixtures::IMAGE_ID`] by [`TestBed`].
pub const IMAGE_BYTES: &[u8] = b"QFI\xfb fake qcow2 payload";

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: HashMap<String, Vec<u8>>,
    delay: Option<Duration>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, key: &str, bytes: Vec<u8>) -> Self {
        self.objects.insert(key.to_string(), bytes);
        self
    }

    /// Sleep before every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn fetch(
        &self,
        key: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ProvisionResult<u64> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let bytes = self
            .objects
            .get(key)
            .ok_or_else(|| ProvisionError::ObjectNotFound(key.to_string()))?;
        dest.write_all(bytes)
            .await
            .map_err(|e| ProvisionError::TransientStoreError(e.to_string()))?;
        Ok(bytes.len() as u64)
    }
}

type DefineHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct FakeState {
    running: BTreeMap<String, String>,
    destroyed: Vec<String>,
    started: usize,
    reject: bool,
    fail_destroy: bool,
    fail_after_start: bool,
    fixed_id: Option<String>,
    on_define: Option<DefineHook>,
}

/// Hypervisor that keeps domains in a map.
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
    delay: Option<Duration>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every define.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report `id` for every started domain instead of a random UUID.
    pub fn with_fixed_id(self, id: &str) -> Self {
        self.state.lock().fixed_id = Some(id.to_string());
        self
    }

    /// Run `hook` at the start of every define.
    pub fn on_define(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.state.lock().on_define = Some(Arc::new(hook));
        self
    }

    pub fn reject_definitions(&self, reject: bool) {
        self.state.lock().reject = reject;
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state.lock().fail_destroy = fail;
    }

    /// Start the domain, then fail as if the connection dropped before its
    /// id was read back.
    pub fn fail_after_start(&self, fail: bool) {
        self.state.lock().fail_after_start = fail;
    }

    /// Names of running domains, sorted.
    pub fn running(&self) -> Vec<String> {
        self.state.lock().running.keys().cloned().collect()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    pub fn started_count(&self) -> usize {
        self.state.lock().started
    }
}

#[async_trait]
impl HypervisorBackend for FakeHypervisor {
    async fn define_and_start(
        &self,
        name: &str,
        descriptor_path: &Path,
    ) -> ProvisionResult<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let hook = self.state.lock().on_define.clone();
        if let Some(hook) = hook {
            hook();
        }

        if !descriptor_path.is_file() {
            return Err(ProvisionError::DomainDefinitionRejected(format!(
                "no descriptor at {}",
                descriptor_path.display()
            )));
        }

        let mut state = self.state.lock();
        if state.reject {
            return Err(ProvisionError::DomainDefinitionRejected(format!(
                "refusing to define {}",
                name
            )));
        }

        let id = state
            .fixed_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        state.running.insert(name.to_string(), id.clone());
        state.started += 1;
        if state.fail_after_start {
            return Err(ProvisionError::HypervisorUnavailable(
                "domuuid: connection reset by peer".into(),
            ));
        }
        Ok(id)
    }

    async fn destroy(&self, name: &str) -> ProvisionResult<()> {
        let mut state = self.state.lock();
        if state.fail_destroy {
            return Err(ProvisionError::HypervisorUnavailable(
                "control plane went away".into(),
            ));
        }
        if state.running.remove(name).is_some() {
            state.destroyed.push(name.to_string());
        }
        Ok(())
    }
}

/// A provisioner over a temp directory, a seeded catalog, an in-memory blob
/// store and a fake hypervisor.
pub struct TestBed {
    pub dir: TempDir,
    pub catalog_path: PathBuf,
    pub hypervisor: Arc<FakeHypervisor>,
    pub provisioner: Provisioner,
}

impl TestBed {
    /// Seeded catalog with `addresses` free addresses.
    pub fn new(addresses: usize) -> Self {
        Self::build(addresses, FakeHypervisor::new(), Duration::from_secs(5))
    }

    pub fn with_hypervisor(addresses: usize, hypervisor: FakeHypervisor) -> Self {
        Self::build(addresses, hypervisor, Duration::from_secs(5))
    }

    pub fn build(addresses: usize, hypervisor: FakeHypervisor, catalog_timeout: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let catalog_path = test_fixtures::create_with_addresses(dir.path(), addresses);
        let catalog = Catalog::open(&catalog_path, catalog_timeout).unwrap();
        let hypervisor = Arc::new(hypervisor);

        let provisioner = Provisioner::from_parts(ProvisionerParts {
            catalog,
            blob_store: Arc::new(
                MemoryBlobStore::new().with_object(test_fixtures::IMAGE_ID, IMAGE_BYTES.to_vec()),
            ),
            hypervisor: hypervisor.clone(),
            descriptors: DescriptorBuilder::parse(DOMAIN_TEMPLATE).unwrap(),
            workspaces: Workspaces::new(&dir.path().join("projects")).unwrap(),
            timeouts: Timeouts {
                catalog_ms: catalog_timeout.as_millis() as u64,
                blob_store_ms: 5_000,
                hypervisor_ms: 5_000,
            },
        });

        Self {
            dir,
            catalog_path,
            hypervisor,
            provisioner,
        }
    }

    /// `(address, is_free)` for every pool row, by id.
    pub fn pool(&self) -> Vec<(String, bool)> {
        self.provisioner
            .catalog()
            .list_addresses()
            .unwrap()
            .into_iter()
            .map(|a| (a.address, a.is_free))
            .collect()
    }

    pub fn free_count(&self) -> usize {
        self.pool().iter().filter(|(_, free)| *free).count()
    }

    pub fn instance_count(&self) -> i64 {
        let conn = rusqlite::Connection::open(&self.catalog_path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM instance", [], |row| row.get(0))
            .unwrap()
    }
}
