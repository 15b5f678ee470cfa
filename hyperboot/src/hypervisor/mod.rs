//! Hypervisor control client.
//!
//! ## Architecture
//!
//! - **HypervisorBackend**: talks to the control plane (define, start, stop)
//! - **HypervisorClient**: applies deadlines and keeps the registry of
//!   domains started through this process
//!
//! The registry is advisory bookkeeping. The catalog is the source of truth
//! for which domains exist.
//!
//! ## Registry slots
//!
//! ```text
//! (absent) ── define_and_start ──→ Starting ──→ Running ── destroy ──→ (absent)
//!                                     │  └──→ (absent)   definition rejected
//!                                     └─────→ Unsettled ── destroy ──→ (absent)
//! ```
//!
//! `Unsettled` means the start may have gone through but no id came back:
//! the backend failed mid-start, the deadline fired or the caller was
//! cancelled. Such a domain must be stopped by name before its resources
//! are reused.

mod virsh;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::descriptor::DomainDescriptor;
use crate::errors::{ProvisionError, ProvisionResult};

pub use virsh::VirshBackend;

/// A domain started through this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    /// Hypervisor-assigned UUID.
    pub id: String,
    pub name: String,
}

/// Result of [`HypervisorClient::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    /// Nothing was started under this name by this client in this process
    /// lifetime, or its start is still in flight.
    NotManaged,
}

/// Control-plane operations.
#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    /// Define a domain from the descriptor at `descriptor_path` and start it.
    ///
    /// Returns the hypervisor-assigned UUID.
    ///
    /// # Errors
    ///
    /// - `DomainDefinitionRejected` if the descriptor or the start is
    ///   refused. The domain is then known not to be running.
    /// - any other error if the domain may have started, e.g.
    ///   `HypervisorUnavailable` when the connection drops mid-start
    async fn define_and_start(&self, name: &str, descriptor_path: &Path)
    -> ProvisionResult<String>;

    /// Hard-stop the domain called `name`.
    ///
    /// A domain that does not exist or is not running counts as stopped.
    async fn destroy(&self, name: &str) -> ProvisionResult<()>;
}

#[derive(Debug, Clone)]
enum Slot {
    Starting,
    Running(DomainHandle),
    Unsettled,
}

pub struct HypervisorClient {
    backend: Arc<dyn HypervisorBackend>,
    domains: Mutex<HashMap<String, Slot>>,
    timeout: Duration,
}

impl HypervisorClient {
    /// `timeout` bounds every backend call.
    pub fn new(backend: Arc<dyn HypervisorBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            domains: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Define and start the domain described by `descriptor`.
    ///
    /// The name is reserved in the registry before the backend is called,
    /// so a second call for a name in any slot is rejected without reaching
    /// the backend. Exceeding the deadline is `HypervisorUnavailable` and
    /// leaves the name `Unsettled`, as does any failure other than
    /// `DomainDefinitionRejected`.
    pub async fn define_and_start(
        &self,
        descriptor: &DomainDescriptor,
    ) -> ProvisionResult<DomainHandle> {
        let name = descriptor.name.as_str();
        let pending = self.reserve(name)?;

        let result = tokio::time::timeout(
            self.timeout,
            self.backend.define_and_start(name, &descriptor.path),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ProvisionError::HypervisorUnavailable(format!(
                "starting {} exceeded {:?}",
                name, self.timeout
            )))
        });

        match result {
            Ok(id) => {
                let handle = DomainHandle {
                    id,
                    name: name.to_string(),
                };
                pending.settle(Some(Slot::Running(handle.clone())));
                tracing::info!(domain = %handle.name, domain_id = %handle.id, "Domain started");
                Ok(handle)
            }
            Err(e @ ProvisionError::DomainDefinitionRejected(_)) => {
                pending.settle(None);
                Err(e)
            }
            Err(e) => {
                pending.settle(Some(Slot::Unsettled));
                tracing::warn!(
                    domain = %name,
                    "Start failed with the domain possibly running: {}",
                    e
                );
                Err(e)
            }
        }
    }

    fn reserve(&self, name: &str) -> ProvisionResult<PendingStart<'_>> {
        let mut domains = self.domains.lock();
        if domains.contains_key(name) {
            return Err(ProvisionError::DomainDefinitionRejected(format!(
                "domain {} is already managed by this client",
                name
            )));
        }
        domains.insert(name.to_string(), Slot::Starting);
        Ok(PendingStart {
            client: self,
            name: name.to_string(),
            settled: false,
        })
    }

    /// Hard-stop a running or unsettled domain started by this client.
    ///
    /// The registry entry is removed only after the backend confirms the
    /// stop, so a failed destroy can be retried.
    pub async fn destroy(&self, name: &str) -> ProvisionResult<DestroyOutcome> {
        let domain_id = match self.domains.lock().get(name) {
            None | Some(Slot::Starting) => None,
            Some(Slot::Running(handle)) => Some(Some(handle.id.clone())),
            Some(Slot::Unsettled) => Some(None),
        };
        let Some(domain_id) = domain_id else {
            tracing::debug!(domain = %name, "Destroy skipped: domain not managed here");
            return Ok(DestroyOutcome::NotManaged);
        };

        tokio::time::timeout(self.timeout, self.backend.destroy(name))
            .await
            .map_err(|_| {
                ProvisionError::HypervisorUnavailable(format!(
                    "destroying {} exceeded {:?}",
                    name, self.timeout
                ))
            })??;

        self.domains.lock().remove(name);
        tracing::info!(domain = %name, domain_id = ?domain_id, "Domain destroyed");
        Ok(DestroyOutcome::Destroyed)
    }

    /// Handle of a running domain.
    pub fn get(&self, name: &str) -> Option<DomainHandle> {
        match self.domains.lock().get(name) {
            Some(Slot::Running(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Whether `name` holds any registry slot.
    pub fn is_managed(&self, name: &str) -> bool {
        self.domains.lock().contains_key(name)
    }

    /// Running domains, sorted by name.
    pub fn managed_domains(&self) -> Vec<DomainHandle> {
        let mut domains: Vec<_> = self
            .domains
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(handle) => Some(handle.clone()),
                _ => None,
            })
            .collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        domains
    }

    /// Names whose start may have gone through without reporting an id.
    pub fn unsettled_domains(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .domains
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Unsettled))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// A `Starting` slot. Dropped unsettled (the start future was cancelled),
/// the slot turns `Unsettled`.
struct PendingStart<'a> {
    client: &'a HypervisorClient,
    name: String,
    settled: bool,
}

impl PendingStart<'_> {
    /// Replace the slot, or remove it with `None`.
    fn settle(mut self, slot: Option<Slot>) {
        let mut domains = self.client.domains.lock();
        match slot {
            Some(slot) => {
                domains.insert(self.name.clone(), slot);
            }
            None => {
                domains.remove(&self.name);
            }
        }
        self.settled = true;
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(domain = %self.name, "Start abandoned mid-flight");
        if let Some(slot) = self.client.domains.lock().get_mut(&self.name) {
            *slot = Slot::Unsettled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorBuilder, DescriptorParams};
    use crate::testing::{DOMAIN_TEMPLATE, FakeHypervisor};
    use tempfile::TempDir;

    async fn descriptor(dir: &TempDir, name: &str) -> DomainDescriptor {
        DescriptorBuilder::parse(DOMAIN_TEMPLATE)
            .unwrap()
            .render(
                &DescriptorParams {
                    instance_name: name,
                    memory_kib: 524288,
                    vcpu: 1,
                    disk_path: &dir.path().join("disk.img"),
                    mac_address: "52:54:00:83:df:a1",
                },
                &dir.path().join(format!("{name}.xml")),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_registers_and_destroy_removes() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let client = HypervisorClient::new(fake.clone(), Duration::from_secs(5));

        let handle = client
            .define_and_start(&descriptor(&dir, "vm1").await)
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&handle.id).is_ok());
        assert_eq!(client.get("vm1"), Some(handle.clone()));
        assert_eq!(fake.running(), vec!["vm1".to_string()]);

        assert_eq!(client.destroy("vm1").await.unwrap(), DestroyOutcome::Destroyed);
        assert!(!client.is_managed("vm1"));
        assert!(fake.running().is_empty());
        assert_eq!(fake.destroyed(), vec!["vm1".to_string()]);
    }

    #[tokio::test]
    async fn test_destroy_unknown_is_not_managed() {
        let client = HypervisorClient::new(Arc::new(FakeHypervisor::new()), Duration::from_secs(5));
        assert_eq!(
            client.destroy("elsewhere").await.unwrap(),
            DestroyOutcome::NotManaged
        );
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let client = HypervisorClient::new(fake.clone(), Duration::from_secs(5));
        let desc = descriptor(&dir, "vm1").await;

        client.define_and_start(&desc).await.unwrap();
        let err = client.define_and_start(&desc).await.unwrap_err();

        assert!(matches!(err, ProvisionError::DomainDefinitionRejected(_)));
        assert_eq!(fake.started_count(), 1);
    }

    #[tokio::test]
    async fn test_deadline_leaves_domain_unsettled() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeHypervisor::new().with_delay(Duration::from_secs(60)));
        let client = HypervisorClient::new(fake.clone(), Duration::from_millis(50));

        let err = client
            .define_and_start(&descriptor(&dir, "slow").await)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::HypervisorUnavailable(_)));
        assert!(err.is_retriable());
        assert!(client.is_managed("slow"));
        assert_eq!(client.get("slow"), None);
        assert_eq!(client.unsettled_domains(), vec!["slow".to_string()]);

        assert_eq!(client.destroy("slow").await.unwrap(), DestroyOutcome::Destroyed);
        assert!(!client.is_managed("slow"));
        assert!(client.unsettled_domains().is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_start_leaves_domain_unsettled() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        fake.fail_after_start(true);
        let client = HypervisorClient::new(fake.clone(), Duration::from_secs(5));

        let err = client
            .define_and_start(&descriptor(&dir, "vm1").await)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::HypervisorUnavailable(_)));
        assert_eq!(fake.running(), vec!["vm1".to_string()]);
        assert_eq!(client.unsettled_domains(), vec!["vm1".to_string()]);
        assert!(client.managed_domains().is_empty());

        assert_eq!(client.destroy("vm1").await.unwrap(), DestroyOutcome::Destroyed);
        assert!(fake.running().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_definition_frees_name() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        fake.reject_definitions(true);
        let client = HypervisorClient::new(fake.clone(), Duration::from_secs(5));
        let desc = descriptor(&dir, "vm1").await;

        let err = client.define_and_start(&desc).await.unwrap_err();
        assert!(matches!(err, ProvisionError::DomainDefinitionRejected(_)));
        assert!(!client.is_managed("vm1"));

        fake.reject_definitions(false);
        client.define_and_start(&desc).await.unwrap();
        assert!(client.get("vm1").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_same_name_starts_once() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeHypervisor::new().with_delay(Duration::from_millis(100)));
        let client = Arc::new(HypervisorClient::new(fake.clone(), Duration::from_secs(5)));
        let desc = descriptor(&dir, "vm1").await;

        let (a, b) = tokio::join!(client.define_and_start(&desc), client.define_and_start(&desc));

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(fake.started_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_start_is_unsettled() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeHypervisor::new().with_delay(Duration::from_secs(60)));
        let client = HypervisorClient::new(fake, Duration::from_secs(120));
        let desc = descriptor(&dir, "vm1").await;

        let start = client.define_and_start(&desc);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), start)
                .await
                .is_err()
        );

        assert_eq!(client.unsettled_domains(), vec!["vm1".to_string()]);
        assert_eq!(client.destroy("vm1").await.unwrap(), DestroyOutcome::Destroyed);
    }

    #[tokio::test]
    async fn test_failed_destroy_keeps_registry_entry() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let client = HypervisorClient::new(fake.clone(), Duration::from_secs(5));
        client
            .define_and_start(&descriptor(&dir, "vm1").await)
            .await
            .unwrap();

        fake.fail_destroy(true);
        assert!(client.destroy("vm1").await.is_err());
        assert!(client.is_managed("vm1"));

        fake.fail_destroy(false);
        assert_eq!(client.destroy("vm1").await.unwrap(), DestroyOutcome::Destroyed);
    }
}
