//! Resource abstraction (spec §3, §4.1-§4.6): the uniform surface the
//! Engine sees, with three concrete back-ends (Shell, Batch, Cloud).

pub mod batch;
pub mod cloud;
pub mod shell;
pub mod transport;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use gc3_common::Quantity;

use crate::error::BackendError;
use crate::task::{ReturnCode, State, Task};

/// Declared caps a Resource enforces during scheduling (§3, §4.4 step 3a).
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub max_cores_total: u32,
    pub max_cores_per_task: u32,
    pub max_memory_per_core: Quantity,
    pub max_walltime: Quantity,
    pub architecture: Vec<String>,
}

impl Capabilities {
    pub fn accommodates(&self, req: &crate::task::Requirements) -> bool {
        if req.cores > self.max_cores_per_task {
            return false;
        }
        if let Ok(ord) = req
            .memory_per_core
            .checked_div(&self.max_memory_per_core)
        {
            if ord > 1.0 {
                return false;
            }
        }
        if let Ok(ord) = req.walltime.checked_div(&self.max_walltime) {
            if ord > 1.0 {
                return false;
            }
        }
        if !req.architecture.is_empty()
            && !req.architecture.iter().any(|a| self.architecture.contains(a))
        {
            return false;
        }
        true
    }
}

/// Outcome of a `poll` (§4.2).
#[derive(Clone, Debug)]
pub struct PollOutcome {
    pub state: State,
    pub resource_usage: Option<crate::task::ResourceUsage>,
    pub exit_info: Option<ReturnCode>,
}

/// The capability set every concrete back-end implements (§4.2, §4.5, §4.6):
/// submit/poll/cancel/fetch. `Shell` and `Batch` adapters, and each VM a
/// `CloudPool` wraps, all implement this one trait; the Resource variant
/// discriminates on `type` the way the teacher's Application variants
/// discriminate on capability (spec §9's tagged-variant-plus-interface
/// design note).
#[async_trait]
pub trait ResourceAdapter: std::fmt::Debug + Send + Sync {
    async fn submit(&self, task: &Task) -> Result<String, BackendError>;
    async fn poll(&self, job_id: &str) -> Result<PollOutcome, BackendError>;
    async fn cancel(&self, job_id: &str) -> Result<(), BackendError>;
    async fn fetch_outputs(&self, task: &Task) -> Result<PathBuf, BackendError>;
    /// Currently queued-or-running jobs this adapter knows about, used for
    /// the Engine's least-loaded tie-break (§4.4 step 3b).
    fn load(&self) -> usize;
}

/// A named, configured back-end plus its declared caps and current
/// liveness (§3). Concrete adapter variants are boxed trait objects so the
/// Engine's resource map is homogeneous regardless of back-end kind.
#[derive(Debug)]
pub struct Resource {
    pub name: String,
    pub enabled: bool,
    /// Liveness flag (§3). An `AtomicBool` rather than a plain `bool`
    /// because the Engine shares `Resource`s behind an `Arc` across
    /// concurrently-dispatched operations and needs to flip this from a
    /// shared reference when a Transport reports a permanent failure
    /// (§4.1: "marks that resource unavailable").
    available: AtomicBool,
    pub capabilities: Capabilities,
    pub tags: Vec<String>,
    pub adapter: Box<dyn ResourceAdapter>,
}

impl Resource {
    pub fn new(
        name: impl Into<String>,
        enabled: bool,
        capabilities: Capabilities,
        tags: Vec<String>,
        adapter: Box<dyn ResourceAdapter>,
    ) -> Self {
        Resource {
            name: name.into(),
            enabled,
            available: AtomicBool::new(true),
            capabilities,
            tags,
            adapter,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Mark this resource unavailable for the rest of the engine run
    /// (§4.1: a permanent Transport failure is "fatal for the containing
    /// resource for the rest of the engine run").
    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    pub fn can_host(&self, task: &Task) -> bool {
        self.enabled && self.is_available() && self.capabilities.accommodates(&task.spec.requirements)
    }

    pub fn tag_match_score(&self, task: &Task) -> usize {
        task.spec
            .requirements
            .tags
            .iter()
            .filter(|t| self.tags.contains(t))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Requirements, Spec, Task};
    use gc3_common::{MemoryUnit, TimeUnit};
    use std::collections::BTreeMap;

    fn caps() -> Capabilities {
        Capabilities {
            max_cores_total: 16,
            max_cores_per_task: 4,
            max_memory_per_core: Quantity::memory(2, MemoryUnit::GiB),
            max_walltime: Quantity::time(2, TimeUnit::Hours),
            architecture: vec!["x86_64".into()],
        }
    }

    fn task_with(cores: u32, memory: Quantity, walltime: Quantity, arch: Vec<String>) -> Task {
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
                requirements: Requirements { cores, memory_per_core: memory, walltime, architecture: arch, tags: vec![] },
            },
        )
    }

    #[test]
    fn accommodates_rejects_too_many_cores() {
        let c = caps();
        let t = task_with(8, Quantity::memory(1, MemoryUnit::GiB), Quantity::time(1, TimeUnit::Hours), vec![]);
        assert!(!c.accommodates(&t.spec.requirements));
    }

    #[test]
    fn accommodates_rejects_excess_memory_or_walltime() {
        let c = caps();
        let over_mem = task_with(1, Quantity::memory(4, MemoryUnit::GiB), Quantity::time(1, TimeUnit::Hours), vec![]);
        assert!(!c.accommodates(&over_mem.spec.requirements));

        let over_wall = task_with(1, Quantity::memory(1, MemoryUnit::GiB), Quantity::time(3, TimeUnit::Hours), vec![]);
        assert!(!c.accommodates(&over_wall.spec.requirements));
    }

    #[test]
    fn accommodates_rejects_unmatched_architecture() {
        let c = caps();
        let t = task_with(
            1,
            Quantity::memory(1, MemoryUnit::GiB),
            Quantity::time(1, TimeUnit::Hours),
            vec!["arm64".into()],
        );
        assert!(!c.accommodates(&t.spec.requirements));
    }

    #[test]
    fn accommodates_accepts_within_declared_caps() {
        let c = caps();
        let t = task_with(2, Quantity::memory(1, MemoryUnit::GiB), Quantity::time(1, TimeUnit::Hours), vec![]);
        assert!(c.accommodates(&t.spec.requirements));
    }

    #[derive(Debug)]
    struct NeverAdapter;

    #[async_trait]
    impl ResourceAdapter for NeverAdapter {
        async fn submit(&self, _task: &Task) -> Result<String, BackendError> {
            Err(BackendError::NotFound("unused".into()))
        }
        async fn poll(&self, _job_id: &str) -> Result<PollOutcome, BackendError> {
            Err(BackendError::NotFound("unused".into()))
        }
        async fn cancel(&self, _job_id: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn fetch_outputs(&self, _task: &Task) -> Result<PathBuf, BackendError> {
            Err(BackendError::NotFound("unused".into()))
        }
        fn load(&self) -> usize {
            0
        }
    }

    #[test]
    fn mark_unavailable_prevents_hosting() {
        let r = Resource::new("r1", true, caps(), vec![], Box::new(NeverAdapter));
        let t = task_with(1, Quantity::memory(1, MemoryUnit::GiB), Quantity::time(1, TimeUnit::Hours), vec![]);
        assert!(r.can_host(&t));
        r.mark_unavailable();
        assert!(!r.is_available());
        assert!(!r.can_host(&t));
    }

    #[test]
    fn disabled_resource_cannot_host() {
        let r = Resource::new("r1", false, caps(), vec![], Box::new(NeverAdapter));
        let t = task_with(1, Quantity::memory(1, MemoryUnit::GiB), Quantity::time(1, TimeUnit::Hours), vec![]);
        assert!(!r.can_host(&t));
    }

    #[test]
    fn tag_match_score_counts_overlap() {
        let r = Resource::new("r1", true, caps(), vec!["gpu".into(), "fast".into()], Box::new(NeverAdapter));
        let mut t = task_with(1, Quantity::memory(1, MemoryUnit::GiB), Quantity::time(1, TimeUnit::Hours), vec![]);
        t.spec.requirements.tags = vec!["gpu".into(), "slow".into()];
        assert_eq!(r.tag_match_score(&t), 1);
    }
}
