//! CloudPool (spec §4.6): manages a pool of VMs on an IaaS cloud with an
//! EC2- or OpenStack-compatible API, wrapping each ready VM as a
//! [`ShellAdapter`].
//!
//! The concrete EC2/OpenStack HTTP client is left pluggable behind
//! [`CloudApi`] rather than pinned to one SDK, mirroring how `jakajancar
//! -fleeting`'s GCE provider (`other_examples/`) isolates cloud-specific
//! provisioning (list/delete terminated instances, firewall
//! get-then-insert-on-404 reconciliation, launch-then-poll-until-Running)
//! behind a small `VmProvider` trait — here widened so the same CloudPool
//! logic drives EC2, OpenStack, or a test double without change. A
//! production build plugs in a concrete `aws-sdk-ec2`/OpenStack client;
//! carrying one of those SDKs here with no EC2/OpenStack account to drive it
//! against would be a fabricated dependency, so this crate stops at the
//! trait boundary (documented in DESIGN.md).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::BackendError;
use crate::resource::shell::ShellAdapter;
use crate::resource::transport::{SshCredentials, SshTransport, Transport};
use crate::resource::{PollOutcome, ResourceAdapter};
use crate::task::Task;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VmLifecycle {
    Pending,
    Ready,
    Draining,
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct FirewallRule {
    pub protocol: String,
    pub port_range: String,
}

/// The minimal EC2/OpenStack-shaped surface a CloudPool needs. Implemented
/// once against a real cloud SDK in a deployment; implemented as an
/// in-memory fake in tests (spec §8 S4).
#[async_trait]
pub trait CloudApi: std::fmt::Debug + Send + Sync {
    async fn launch_instance(&self, image_id: &str, flavour: &str, keypair: &str, user_data: &str) -> Result<String, BackendError>;
    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus, BackendError>;
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), BackendError>;
    async fn keypair_fingerprint(&self, keypair: &str) -> Result<Option<String>, BackendError>;
    async fn security_group_rules(&self, group: &str) -> Result<Option<Vec<FirewallRule>>, BackendError>;
    async fn add_security_group_rule(&self, group: &str, rule: &FirewallRule) -> Result<(), BackendError>;
}

#[derive(Clone, Debug)]
pub struct InstanceStatus {
    pub provisioning: bool,
    pub running: bool,
    pub public_address: Option<String>,
}

#[derive(Debug)]
struct Vm {
    id: String,
    lifecycle: VmLifecycle,
    public_address: Option<String>,
    created_at: DateTime<Utc>,
    hosted_jobs: Vec<String>,
    adapter: Option<Arc<ShellAdapter>>,
    idle_since: Option<Instant>,
}

#[derive(Clone, Debug)]
pub struct CloudPoolConfig {
    pub endpoint: String,
    pub region: String,
    pub image_id: String,
    pub image_id_per_tag: HashMap<String, String>,
    pub flavour: String,
    pub flavour_per_tag: HashMap<String, String>,
    pub keypair: String,
    /// Fingerprint the operator expects `keypair` to have; `None` skips the
    /// comparison (reconciliation then only verifies the key exists). When
    /// set, a mismatch is fatal for the resource (§4.6).
    pub expected_keypair_fingerprint: Option<String>,
    pub security_group: String,
    pub required_rules: Vec<FirewallRule>,
    pub user_data: String,
    pub user_data_per_tag: HashMap<String, String>,
    pub pool_max_size: usize,
    pub idle_window: Duration,
    pub ssh_credentials: SshCredentials,
}

/// Dynamic Resource wrapping an IaaS VM pool (§4.6). Each ready VM is
/// wrapped as a [`ShellAdapter`] over an SSH [`Transport`]; submission picks
/// an existing VM with spare capacity or requests a new one up to
/// `pool_max_size`.
pub struct CloudPool {
    config: CloudPoolConfig,
    api: Arc<dyn CloudApi>,
    vms: Mutex<Vec<Vm>>,
    reconciled: Mutex<bool>,
    /// Set once a keypair fingerprint mismatch is observed (§4.6: fatal for
    /// the resource for the rest of the engine run); once set, every
    /// subsequent `submit` fails fast without re-querying the cloud API.
    keypair_mismatch: Mutex<bool>,
}

impl std::fmt::Debug for CloudPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudPool").field("endpoint", &self.config.endpoint).finish()
    }
}

impl CloudPool {
    pub fn new(config: CloudPoolConfig, api: Arc<dyn CloudApi>) -> Self {
        CloudPool {
            config,
            api,
            vms: Mutex::new(Vec::new()),
            reconciled: Mutex::new(false),
            keypair_mismatch: Mutex::new(false),
        }
    }

    fn image_for(&self, task: &Task) -> String {
        for tag in &task.spec.requirements.tags {
            if let Some(image) = self.config.image_id_per_tag.get(tag) {
                return image.clone();
            }
        }
        self.config.image_id.clone()
    }

    fn flavour_for(&self, task: &Task) -> String {
        for tag in &task.spec.requirements.tags {
            if let Some(f) = self.config.flavour_per_tag.get(tag) {
                return f.clone();
            }
        }
        self.config.flavour.clone()
    }

    fn user_data_for(&self, task: &Task) -> String {
        for tag in &task.spec.requirements.tags {
            if let Some(u) = self.config.user_data_per_tag.get(tag) {
                return u.clone();
            }
        }
        self.config.user_data.clone()
    }

    /// Keypair fingerprint check and security-group rule reconciliation
    /// (§4.6): mismatch on the keypair is fatal for the resource; missing
    /// security-group rules are added, extras are left alone.
    async fn reconcile(&self) -> Result<(), BackendError> {
        if *self.keypair_mismatch.lock().await {
            return Err(BackendError::Fatal(format!(
                "keypair {:?} fingerprint mismatch previously detected",
                self.config.keypair
            )));
        }

        let mut done = self.reconciled.lock().await;
        if *done {
            return Ok(());
        }

        if let Some(expected) = &self.config.expected_keypair_fingerprint {
            match self.api.keypair_fingerprint(&self.config.keypair).await? {
                Some(actual) if &actual == expected => {}
                Some(actual) => {
                    *self.keypair_mismatch.lock().await = true;
                    warn!(keypair = %self.config.keypair, %expected, %actual, "keypair fingerprint mismatch");
                    return Err(BackendError::Fatal(format!(
                        "keypair {:?} fingerprint {actual} does not match expected {expected}",
                        self.config.keypair
                    )));
                }
                None => {
                    *self.keypair_mismatch.lock().await = true;
                    warn!(keypair = %self.config.keypair, "keypair does not exist on the cloud endpoint");
                    return Err(BackendError::Fatal(format!("keypair {:?} does not exist", self.config.keypair)));
                }
            }
        } else {
            self.api.keypair_fingerprint(&self.config.keypair).await?;
        }

        let existing = self.api.security_group_rules(&self.config.security_group).await?;
        match existing {
            Some(rules) => {
                for required in &self.config.required_rules {
                    let present = rules
                        .iter()
                        .any(|r| r.protocol == required.protocol && r.port_range == required.port_range);
                    if !present {
                        self.api.add_security_group_rule(&self.config.security_group, required).await?;
                        info!(group = %self.config.security_group, ?required, "added missing security group rule");
                    }
                }
            }
            None => {
                for required in &self.config.required_rules {
                    self.api.add_security_group_rule(&self.config.security_group, required).await?;
                }
            }
        }

        *done = true;
        Ok(())
    }

    /// Try to find a ready VM with spare capacity for `task`; promote any
    /// pending VM whose SSH probe now succeeds.
    async fn place_on_existing(&self, task: &Task) -> Option<Arc<ShellAdapter>> {
        let mut vms = self.vms.lock().await;
        for vm in vms.iter_mut() {
            if vm.lifecycle == VmLifecycle::Pending {
                if let Ok(status) = self.api.instance_status(&vm.id).await {
                    if status.running {
                        if let Some(addr) = status.public_address.clone() {
                            let transport: Arc<dyn Transport> = Arc::new(SshTransport::new(
                                addr.clone(),
                                self.config.ssh_credentials.clone(),
                            ));
                            vm.public_address = Some(addr);
                            vm.adapter = Some(Arc::new(ShellAdapter::new(
                                transport,
                                PathBuf::from("/tmp/gc3pie"),
                                1,
                                None,
                            )));
                            vm.lifecycle = VmLifecycle::Ready;
                            info!(vm = %vm.id, "vm promoted pending -> ready");
                        }
                    }
                }
            }
            if vm.lifecycle == VmLifecycle::Ready {
                if let Some(adapter) = &vm.adapter {
                    if adapter.available_cores() >= task.spec.requirements.cores as i64 {
                        vm.hosted_jobs.push(task.id.0.clone());
                        vm.idle_since = None;
                        return Some(adapter.clone());
                    }
                }
            }
        }
        None
    }

    async fn pool_size(&self) -> usize {
        self.vms.lock().await.len()
    }

    async fn request_new_vm(&self, task: &Task) -> Result<(), BackendError> {
        if self.pool_size().await >= self.config.pool_max_size {
            return Err(BackendError::Transient("pool_max_size reached".into()));
        }
        let image = self.image_for(task);
        let flavour = self.flavour_for(task);
        let user_data = self.user_data_for(task);
        let instance_id = self
            .api
            .launch_instance(&image, &flavour, &self.config.keypair, &user_data)
            .await?;
        let mut vms = self.vms.lock().await;
        vms.push(Vm {
            id: instance_id,
            lifecycle: VmLifecycle::Pending,
            public_address: None,
            created_at: Utc::now(),
            hosted_jobs: Vec::new(),
            adapter: None,
            idle_since: None,
        });
        Ok(())
    }

    /// Terminate any VM idle (zero hosted tasks) for longer than
    /// `idle_window`, never one still hosting in-flight tasks (§4.6).
    pub async fn reap_idle(&self) -> Result<(), BackendError> {
        let mut vms = self.vms.lock().await;
        let mut keep = Vec::new();
        for mut vm in vms.drain(..) {
            if vm.hosted_jobs.is_empty() && vm.lifecycle == VmLifecycle::Ready {
                let idle_since = *vm.idle_since.get_or_insert_with(Instant::now);
                if idle_since.elapsed() >= self.config.idle_window {
                    self.api.terminate_instance(&vm.id).await?;
                    info!(vm = %vm.id, "vm terminated after idle window");
                    continue;
                }
            }
            keep.push(vm);
        }
        *vms = keep;
        Ok(())
    }

    /// Terminate every VM this pool created (engine shutdown, §4.6), then
    /// clear its bookkeeping.
    pub async fn shutdown(&self) -> Result<(), BackendError> {
        let mut vms = self.vms.lock().await;
        for vm in vms.drain(..) {
            self.api.terminate_instance(&vm.id).await?;
        }
        Ok(())
    }

    /// Remove a VM from bookkeeping without terminating it (operator
    /// "forget-VM" operation, §4.6).
    pub async fn forget_vm(&self, id: &str) {
        let mut vms = self.vms.lock().await;
        vms.retain(|vm| vm.id != id);
    }

    pub async fn vm_count(&self) -> usize {
        self.vms.lock().await.len()
    }
}

#[async_trait]
impl ResourceAdapter for CloudPool {
    async fn submit(&self, task: &Task) -> Result<String, BackendError> {
        self.reconcile().await?;

        if let Some(adapter) = self.place_on_existing(task).await {
            return adapter.submit(task).await;
        }

        self.request_new_vm(task).await?;
        // The task stays `new`; the scheduler retries it on a later tick
        // once the VM transitions to ready (§4.6 step 2).
        Err(BackendError::Transient("awaiting VM provisioning".into()))
    }

    async fn poll(&self, job_id: &str) -> Result<PollOutcome, BackendError> {
        let vms = self.vms.lock().await;
        for vm in vms.iter() {
            if vm.hosted_jobs.iter().any(|j| j == job_id) {
                if let Some(adapter) = &vm.adapter {
                    return adapter.poll(job_id).await;
                }
            }
        }
        Err(BackendError::NotFound(job_id.to_string()))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        let vms = self.vms.lock().await;
        for vm in vms.iter() {
            if vm.hosted_jobs.iter().any(|j| j == job_id) {
                if let Some(adapter) = &vm.adapter {
                    return adapter.cancel(job_id).await;
                }
            }
        }
        warn!(job_id, "cancel of job on unknown vm");
        Ok(())
    }

    async fn fetch_outputs(&self, task: &Task) -> Result<PathBuf, BackendError> {
        let mut vms = self.vms.lock().await;
        for vm in vms.iter_mut() {
            if vm.hosted_jobs.iter().any(|j| j == &task.id.0) {
                if let Some(adapter) = vm.adapter.clone() {
                    let dir = adapter.fetch_outputs(task).await?;
                    vm.hosted_jobs.retain(|j| j != &task.id.0);
                    if vm.hosted_jobs.is_empty() {
                        vm.idle_since = Some(Instant::now());
                    }
                    return Ok(dir);
                }
            }
        }
        Err(BackendError::NotFound(task.id.0.clone()))
    }

    fn load(&self) -> usize {
        // `ResourceAdapter::load` is synchronous (it backs the scheduler's
        // least-loaded tie-break, §4.4 step 3b) while the VM list lives
        // behind a `tokio::sync::Mutex` held across awaits elsewhere
        // (VM promotion polls the cloud API without releasing it). A busy
        // lock here just means another tick is already mutating the pool;
        // falling back to 0 costs at most one tie-break round, not
        // correctness.
        self.vms.try_lock().map(|vms| vms.iter().map(|vm| vm.hosted_jobs.len()).sum()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Requirements, Spec, Task};
    use gc3_common::{MemoryUnit, Quantity, TimeUnit};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default)]
    struct MockCloudApi {
        next_id: AtomicU32,
        existing_rules: Option<Vec<FirewallRule>>,
        added_rules: Mutex<Vec<FirewallRule>>,
        terminated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CloudApi for MockCloudApi {
        async fn launch_instance(&self, _image_id: &str, _flavour: &str, _keypair: &str, _user_data: &str) -> Result<String, BackendError> {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(format!("i-{n}"))
        }
        async fn instance_status(&self, _instance_id: &str) -> Result<InstanceStatus, BackendError> {
            // Never promotes: kept Pending forever so pool-size tests don't
            // race an SSH probe that would never succeed in this environment.
            Ok(InstanceStatus { provisioning: true, running: false, public_address: None })
        }
        async fn terminate_instance(&self, instance_id: &str) -> Result<(), BackendError> {
            self.terminated.lock().await.push(instance_id.to_string());
            Ok(())
        }
        async fn keypair_fingerprint(&self, _keypair: &str) -> Result<Option<String>, BackendError> {
            Ok(Some("aa:bb".into()))
        }
        async fn security_group_rules(&self, _group: &str) -> Result<Option<Vec<FirewallRule>>, BackendError> {
            Ok(self.existing_rules.clone())
        }
        async fn add_security_group_rule(&self, _group: &str, rule: &FirewallRule) -> Result<(), BackendError> {
            self.added_rules.lock().await.push(rule.clone());
            Ok(())
        }
    }

    fn sample_task() -> Task {
        Task::new(
            "t",
            Spec {
                command: "/bin/true".into(),
                arguments: vec![],
                inputs: BTreeMap::new(),
                outputs: vec![],
                stdin: None,
                stdout: None,
                stderr: None,
                join_stdout_stderr: false,
                environment: BTreeMap::new(),
                requirements: Requirements {
                    cores: 1,
                    memory_per_core: Quantity::memory(1, MemoryUnit::GiB),
                    walltime: Quantity::time(1, TimeUnit::Hours),
                    architecture: vec![],
                    tags: vec![],
                },
            },
        )
    }

    fn config(pool_max_size: usize, idle_window: Duration) -> CloudPoolConfig {
        CloudPoolConfig {
            endpoint: "https://example.invalid".into(),
            region: "eu-1".into(),
            image_id: "ami-base".into(),
            image_id_per_tag: HashMap::new(),
            flavour: "small".into(),
            flavour_per_tag: HashMap::new(),
            keypair: "kp".into(),
            expected_keypair_fingerprint: None,
            security_group: "sg".into(),
            required_rules: vec![FirewallRule { protocol: "tcp".into(), port_range: "22".into() }],
            user_data: String::new(),
            user_data_per_tag: HashMap::new(),
            pool_max_size,
            idle_window,
            ssh_credentials: SshCredentials {
                username: "gc3".into(),
                port: 22,
                keyfile: None,
                ssh_config: None,
                connect_timeout: Duration::from_secs(5),
            },
        }
    }

    #[tokio::test]
    async fn reconcile_adds_only_missing_security_group_rules() {
        let api = Arc::new(MockCloudApi {
            existing_rules: Some(vec![FirewallRule { protocol: "tcp".into(), port_range: "22".into() }]),
            ..Default::default()
        });
        let pool = CloudPool::new(config(2, Duration::from_secs(60)), api.clone());
        pool.reconcile().await.unwrap();
        assert!(api.added_rules.lock().await.is_empty());

        // A second reconcile is a no-op even if rules would otherwise differ.
        pool.reconcile().await.unwrap();
        assert!(api.added_rules.lock().await.is_empty());
    }

    #[tokio::test]
    async fn reconcile_fails_fatally_on_keypair_fingerprint_mismatch() {
        let api = Arc::new(MockCloudApi { existing_rules: Some(vec![]), ..Default::default() });
        let mut cfg = config(2, Duration::from_secs(60));
        cfg.expected_keypair_fingerprint = Some("zz:99".into());
        let pool = CloudPool::new(cfg, api);

        let err = pool.reconcile().await.unwrap_err();
        assert!(matches!(err, BackendError::Fatal(_)));
        assert!(!err.is_transient());

        // Once observed, the mismatch short-circuits every later call
        // without re-querying the cloud API (§4.6: fatal for the resource
        // for the rest of the engine run).
        let err = pool.reconcile().await.unwrap_err();
        assert!(matches!(err, BackendError::Fatal(_)));
    }

    #[tokio::test]
    async fn reconcile_succeeds_when_keypair_fingerprint_matches() {
        let api = Arc::new(MockCloudApi { existing_rules: Some(vec![]), ..Default::default() });
        let mut cfg = config(2, Duration::from_secs(60));
        cfg.expected_keypair_fingerprint = Some("aa:bb".into());
        let pool = CloudPool::new(cfg, api);
        pool.reconcile().await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_adds_rules_missing_from_an_existing_group() {
        let api = Arc::new(MockCloudApi {
            existing_rules: Some(vec![]),
            ..Default::default()
        });
        let pool = CloudPool::new(config(2, Duration::from_secs(60)), api.clone());
        pool.reconcile().await.unwrap();
        assert_eq!(api.added_rules.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn request_new_vm_is_capped_at_pool_max_size() {
        let api = Arc::new(MockCloudApi { existing_rules: Some(vec![]), ..Default::default() });
        let pool = CloudPool::new(config(2, Duration::from_secs(60)), api.clone());

        for _ in 0..2 {
            let err = pool.submit(&sample_task()).await.unwrap_err();
            assert!(matches!(err, BackendError::Transient(_)));
        }
        assert_eq!(pool.vm_count().await, 2);

        let err = pool.submit(&sample_task()).await.unwrap_err();
        assert!(err.to_string().contains("pool_max_size"));
        assert_eq!(pool.vm_count().await, 2);
    }

    #[tokio::test]
    async fn reap_idle_terminates_vms_with_no_hosted_jobs_past_the_idle_window() {
        let api = Arc::new(MockCloudApi { existing_rules: Some(vec![]), ..Default::default() });
        let pool = CloudPool::new(config(4, Duration::ZERO), api.clone());
        {
            let mut vms = pool.vms.lock().await;
            vms.push(Vm {
                id: "i-idle".into(),
                lifecycle: VmLifecycle::Ready,
                public_address: Some("10.0.0.1".into()),
                created_at: Utc::now(),
                hosted_jobs: Vec::new(),
                adapter: None,
                idle_since: None,
            });
            vms.push(Vm {
                id: "i-busy".into(),
                lifecycle: VmLifecycle::Ready,
                public_address: Some("10.0.0.2".into()),
                created_at: Utc::now(),
                hosted_jobs: vec!["job-1".into()],
                adapter: None,
                idle_since: None,
            });
        }

        pool.reap_idle().await.unwrap();

        assert_eq!(pool.vm_count().await, 1);
        assert_eq!(api.terminated.lock().await.as_slice(), ["i-idle".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_terminates_every_vm_and_clears_bookkeeping() {
        let api = Arc::new(MockCloudApi { existing_rules: Some(vec![]), ..Default::default() });
        let pool = CloudPool::new(config(4, Duration::from_secs(60)), api.clone());
        {
            let mut vms = pool.vms.lock().await;
            for id in ["i-a", "i-b"] {
                vms.push(Vm {
                    id: id.into(),
                    lifecycle: VmLifecycle::Ready,
                    public_address: None,
                    created_at: Utc::now(),
                    hosted_jobs: Vec::new(),
                    adapter: None,
                    idle_since: None,
                });
            }
        }

        pool.shutdown().await.unwrap();

        assert_eq!(pool.vm_count().await, 0);
        let mut terminated = api.terminated.lock().await.clone();
        terminated.sort();
        assert_eq!(terminated, vec!["i-a".to_string(), "i-b".to_string()]);
    }
}
