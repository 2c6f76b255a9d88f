//! Task data model (spec §3, §4.3, §4.6).

pub mod code;
pub mod group;
pub mod state;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use gc3_common::Quantity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use code::{Outcome, PseudoSignal, ReturnCode};
pub use group::{GroupKind, TaskGroup};
pub use state::State;

/// Stable persistent id. Stringly-typed for storage friendliness (directory
/// names, SQL primary keys) but wrapped so a bare `String` can't be confused
/// with, say, a resource name.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource demands used for scheduling (§3, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Requirements {
    pub cores: u32,
    pub memory_per_core: Quantity,
    pub walltime: Quantity,
    pub architecture: Vec<String>,
    pub tags: Vec<String>,
}

/// Write-once specification of what to run (§3: "Specification fields are
/// write-once; any change requires constructing a new Task").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Spec {
    pub command: String,
    pub arguments: Vec<String>,
    /// Source URL -> destination name in the working directory.
    pub inputs: BTreeMap<String, String>,
    /// (source path in working directory, destination URL).
    pub outputs: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub join_stdout_stderr: bool,
    pub environment: BTreeMap<String, String>,
    pub requirements: Requirements,
}

/// One entry in a Task's bounded, append-only history log (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Resource-usage telemetry, populated once known (§3, parsed from a
/// time/usage wrapper per §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_time: Option<Quantity>,
    pub memory_high_water: Option<Quantity>,
    pub wall_clock: Option<Quantity>,
}

/// The mutable part of a Task (§3: "Run record").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub state: State,
    pub return_code: Option<ReturnCode>,
    pub backend_job_id: Option<String>,
    pub resource_name: Option<String>,
    pub transitions: Vec<(State, DateTime<Utc>)>,
    pub history: VecDeque<HistoryEvent>,
    pub usage: ResourceUsage,
    pub output_dir: Option<PathBuf>,
    /// Count of consecutive transient fetch failures (§4.4 fetch pass).
    pub fetch_retries: u32,
    /// Count of consecutive transient submission failures against the
    /// currently-attempted resource (§4.4 submission pass, §7).
    pub submit_retries: u32,
}

const HISTORY_CAPACITY: usize = 256;

impl RunRecord {
    fn new() -> Self {
        RunRecord {
            state: State::New,
            return_code: None,
            backend_job_id: None,
            resource_name: None,
            transitions: vec![(State::New, Utc::now())],
            history: VecDeque::new(),
            usage: ResourceUsage::default(),
            output_dir: None,
            fetch_retries: 0,
            submit_retries: 0,
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEvent {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Apply a state transition, recording the timestamp. Callers are
    /// expected to have checked `State::can_transition_to` first; this
    /// records unconditionally so the Engine's Unknown-recovery path (which
    /// restores a previously-observed state) doesn't need to re-derive
    /// whether that edge is "forward".
    pub fn transition(&mut self, to: State) {
        self.state = to;
        self.transitions.push((to, Utc::now()));
    }
}

#[gc3_macros::add_version(1)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub spec: Spec,
    pub run: RunRecord,
}

/// A top-level entry the Engine/Session handle uniformly: either a plain
/// Task or a TaskGroup. Grouped here rather than as a variant of `Task`
/// itself because only `TaskGroup` needs children and derived state/return
/// code (§3: "A TaskGroup is itself a Task whose 'run' *is* the coordinated
/// run of its children").
#[derive(Debug)]
pub enum Node {
    Leaf(Task),
    Group(TaskGroup),
}

impl Node {
    pub fn id(&self) -> &TaskId {
        match self {
            Node::Leaf(t) => &t.id,
            Node::Group(g) => &g.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Leaf(t) => &t.name,
            Node::Group(g) => &g.name,
        }
    }

    pub fn state(&self) -> State {
        match self {
            Node::Leaf(t) => t.state(),
            Node::Group(g) => g.derived_state(),
        }
    }

    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            Node::Leaf(t) => t.run.return_code,
            Node::Group(g) => g.derived_return_code(),
        }
    }
}

impl Task {
    pub fn new(name: impl Into<String>, spec: Spec) -> Self {
        Task {
            id: TaskId::new(),
            name: name.into(),
            spec,
            run: RunRecord::new(),
            schema_version: <Task as gc3_common::Versioned>::current_version(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn state(&self) -> State {
        self.run.state
    }

    /// Construct a fresh life-cycle instance from a terminated task (§4.3,
    /// §4.6 "redo"), preserving identity, specification and history but
    /// resetting the run record. The prior history log survives as the
    /// leading entries of the new one (§8 S6).
    pub fn redo(&self) -> Task {
        let mut run = RunRecord::new();
        run.history = self.run.history.clone();
        run.log(format!("redo: previous run ended in {}", self.run.state));
        Task {
            id: self.id.clone(),
            name: self.name.clone(),
            spec: self.spec.clone(),
            run,
            schema_version: self.schema_version,
            extra: self.extra.clone(),
        }
    }
}
