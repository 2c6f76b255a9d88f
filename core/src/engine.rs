//! The Engine: scheduler + event loop (spec §4.4, §5).
//!
//! Implemented as a single `ractor` actor (`EngineActor`), the same
//! message-passing shape the teacher's `actors::scheduler::SchedulerActor`
//! uses (a mode-gated `Tick` driving one pass of work, `RpcReplyPort`-backed
//! synchronous queries for everything else) generalized from "pull one job
//! off a queue and hand it to a runner factory" to the five-pass tick §4.4
//! specifies. Unlike the teacher, this crate keeps the whole tick inside one
//! actor's `handle()` rather than splitting queue/runner/results/stats into
//! separate actors: §5 only requires that state transitions and Store
//! writes be serialized through a single point, and one actor's mailbox
//! already guarantees that without the extra message plumbing. Resource
//! operations within a tick are still awaited with a per-operation timeout
//! (§5: "a single tick never blocks on I/O longer than a configurable
//! per-operation timeout"), so a slow back-end delays, rather than stalls,
//! the engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::{debug, info, instrument, warn};

use crate::error::{BackendError, EngineError};
use crate::resource::Resource;
use crate::store::Store;
use crate::task::group::SelectorDecision;
use crate::task::{Node, PseudoSignal, ReturnCode, State, Task, TaskId};

/// Engine tuning knobs (spec §4.4, §6).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Cap on tasks in {submitted, running}.
    pub max_in_flight: usize,
    /// Cap on tasks in {submitted} (not yet running).
    pub max_submitted: usize,
    pub poll_interval: Duration,
    /// Remove terminated top-level tasks from the active set once their
    /// outputs are fetched (§4.4).
    pub forget_terminated: bool,
    /// Restrict submission to these resource names, if set (§4.4).
    pub resource_filter: Option<Vec<String>>,
    /// Per-Resource-operation deadline (§5).
    pub operation_timeout: Duration,
    /// Consecutive transient fetch failures tolerated before a terminating
    /// task is declared terminated with data-staging-failed (§4.4 step 2).
    pub max_fetch_retries: u32,
    pub submit_backoff_base: Duration,
    pub submit_backoff_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_in_flight: 4,
            max_submitted: 4,
            poll_interval: Duration::from_secs(5),
            forget_terminated: false,
            resource_filter: None,
            operation_timeout: Duration::from_secs(30),
            max_fetch_retries: 5,
            submit_backoff_base: Duration::from_secs(2),
            submit_backoff_max: Duration::from_secs(120),
        }
    }
}

pub enum EngineMsg {
    AddNode(Box<Node>, RpcReplyPort<TaskId>),
    RemoveNode(TaskId, RpcReplyPort<()>),
    Progress(RpcReplyPort<()>),
    Kill(TaskId, RpcReplyPort<Result<(), EngineError>>),
    Fetch(TaskId, RpcReplyPort<Result<(), EngineError>>),
    Redo(TaskId, RpcReplyPort<Result<(), EngineError>>),
    Stats(RpcReplyPort<HashMap<State, usize>>),
    Snapshot(RpcReplyPort<Vec<(TaskId, String, State, Option<ReturnCode>)>>),
}

impl std::fmt::Debug for EngineMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EngineMsg")
    }
}

pub struct EngineArguments {
    pub config: EngineConfig,
    pub resources: Vec<Resource>,
    pub store: Arc<dyn Store>,
    pub session_name: String,
}

struct EngineState {
    config: EngineConfig,
    resources: HashMap<String, Arc<Resource>>,
    store: Arc<dyn Store>,
    session_name: String,
    nodes: BTreeMap<TaskId, Node>,
    resource_backoff_until: HashMap<String, Instant>,
    resource_submit_failures: HashMap<String, u32>,
    round_robin: usize,
}

impl EngineState {
    fn leaf_states(&self) -> impl Iterator<Item = State> + '_ {
        self.nodes.values().flat_map(|n| match n {
            Node::Leaf(t) => vec![t.state()],
            Node::Group(g) => g.all_children().iter().map(|t| t.state()).collect(),
        })
    }

    fn count(&self, pred: impl Fn(State) -> bool) -> usize {
        self.leaf_states().filter(|s| pred(*s)).count()
    }
}

pub struct EngineActor;

#[ractor::async_trait]
impl Actor for EngineActor {
    type Msg = EngineMsg;
    type State = EngineState;
    type Arguments = EngineArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let resources = args
            .resources
            .into_iter()
            .map(|r| (r.name.clone(), Arc::new(r)))
            .collect();
        Ok(EngineState {
            config: args.config,
            resources,
            store: args.store,
            session_name: args.session_name,
            nodes: BTreeMap::new(),
            resource_backoff_until: HashMap::new(),
            resource_submit_failures: HashMap::new(),
            round_robin: 0,
        })
    }

    #[instrument(skip(self, _myself, state))]
    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EngineMsg::AddNode(node, reply) => {
                let node = *node;
                let id = node.id().clone();
                state.store.index_in_session(&state.session_name, &id).await?;
                match &node {
                    Node::Leaf(t) => state.store.save_task(t).await?,
                    Node::Group(g) => state.store.save_group(g).await?,
                };
                state.nodes.insert(id.clone(), node);
                info!(task = %id, "node added to engine");
                reply.send(id)?;
            }
            EngineMsg::RemoveNode(id, reply) => {
                state.nodes.remove(&id);
                reply.send(())?;
            }
            EngineMsg::Progress(reply) => {
                progress_tick(state).await?;
                reply.send(())?;
            }
            EngineMsg::Kill(id, reply) => {
                reply.send(kill_node(state, &id).await)?;
            }
            EngineMsg::Fetch(id, reply) => {
                reply.send(fetch_node(state, &id).await)?;
            }
            EngineMsg::Redo(id, reply) => {
                reply.send(redo_node(state, &id).await)?;
            }
            EngineMsg::Stats(reply) => {
                let mut out: HashMap<State, usize> = HashMap::new();
                for s in state.leaf_states() {
                    *out.entry(s).or_insert(0) += 1;
                }
                reply.send(out)?;
            }
            EngineMsg::Snapshot(reply) => {
                let snap = state
                    .nodes
                    .values()
                    .map(|n| (n.id().clone(), n.name().to_string(), n.state(), n.return_code()))
                    .collect();
                reply.send(snap)?;
            }
        }
        Ok(())
    }
}

/// One engine tick (§4.4): observation, fetch, submission, group,
/// persistence passes, in that order.
async fn progress_tick(state: &mut EngineState) -> Result<(), crate::error::StoreError> {
    let mut dirty: BTreeSet<TaskId> = BTreeSet::new();

    observation_pass(state, &mut dirty).await;
    fetch_pass(state, &mut dirty).await;
    submission_pass(state, &mut dirty).await;
    group_pass(state, &mut dirty);
    persistence_pass(state, &dirty).await?;

    if state.config.forget_terminated {
        let done: Vec<TaskId> = state
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n, Node::Leaf(t) if t.state() == State::Terminated))
            .map(|(id, _)| id.clone())
            .collect();
        for id in done {
            state.nodes.remove(&id);
        }
    }

    Ok(())
}

async fn observation_pass(state: &mut EngineState, dirty: &mut BTreeSet<TaskId>) {
    let resources = state.resources.clone();
    let timeout = state.config.operation_timeout;
    for task in all_leaf_tasks_mut(&mut state.nodes) {
        if !task.state().is_active() {
            continue;
        }
        let (Some(rname), Some(job_id)) = (task.run.resource_name.clone(), task.run.backend_job_id.clone()) else {
            continue;
        };
        let Some(resource) = resources.get(&rname) else { continue };

        let outcome = tokio::time::timeout(timeout, resource.adapter.poll(&job_id)).await;
        match outcome {
            Err(_elapsed) => {
                debug!(task = %task.id, "poll timed out this tick");
            }
            Ok(Err(e)) => {
                handle_backend_error(task, resource, &e, dirty);
            }
            Ok(Ok(poll)) => {
                apply_poll_outcome(task, poll, dirty);
            }
        }
    }
}

fn apply_poll_outcome(task: &mut Task, poll: crate::resource::PollOutcome, dirty: &mut BTreeSet<TaskId>) {
    let current = task.state();
    if poll.state == State::Unknown {
        if current != State::Unknown {
            task.run.transition(State::Unknown);
            task.run.log("observation failed transiently, marked unknown");
            dirty.insert(task.id.clone());
        }
        return;
    }

    // Recovering from Unknown: the fresh observation is authoritative
    // regardless of which prior state it returns to (§4.3: "unknown ->
    // previous state when observation recovers").
    let transitionable = current == State::Unknown || current.can_transition_to(poll.state) || current == poll.state;
    if !transitionable {
        warn!(task = %task.id, from = %current, to = %poll.state, "ignoring implausible state edge from poll");
        return;
    }
    if poll.state != current {
        task.run.transition(poll.state);
        task.run.log(format!("observed state {}", poll.state));
        dirty.insert(task.id.clone());
    }
    if let Some(usage) = poll.resource_usage {
        task.run.usage = usage;
        dirty.insert(task.id.clone());
    }
    if let Some(rc) = poll.exit_info {
        task.run.return_code = Some(rc);
        dirty.insert(task.id.clone());
    }
}

fn handle_backend_error(task: &mut Task, resource: &Arc<Resource>, e: &BackendError, dirty: &mut BTreeSet<TaskId>) {
    if e.is_transient() {
        if task.state() != State::Unknown {
            task.run.transition(State::Unknown);
            task.run.log(format!("transient observation failure: {e}"));
            dirty.insert(task.id.clone());
        }
    } else {
        warn!(resource = %resource.name, error = %e, "permanent backend failure observing job, marking resource unavailable");
        resource.mark_unavailable();
        if task.state() != State::Unknown {
            task.run.transition(State::Unknown);
            dirty.insert(task.id.clone());
        }
    }
}

async fn fetch_pass(state: &mut EngineState, dirty: &mut BTreeSet<TaskId>) {
    let resources = state.resources.clone();
    let timeout = state.config.operation_timeout;
    let max_retries = state.config.max_fetch_retries;
    for task in all_leaf_tasks_mut(&mut state.nodes) {
        if task.state() != State::Terminating {
            continue;
        }
        let Some(rname) = task.run.resource_name.clone() else { continue };
        let Some(resource) = resources.get(&rname) else { continue };

        match tokio::time::timeout(timeout, resource.adapter.fetch_outputs(task)).await {
            Ok(Ok(dir)) => {
                task.run.output_dir = Some(dir);
                task.run.transition(State::Terminated);
                task.run.log("outputs fetched");
                dirty.insert(task.id.clone());
            }
            Ok(Err(e)) if e.is_transient() => {
                task.run.fetch_retries += 1;
                if task.run.fetch_retries > max_retries {
                    task.run.return_code = Some(ReturnCode::from_pseudo(PseudoSignal::DataStagingFailed));
                    task.run.transition(State::Terminated);
                    task.run.log(format!("giving up on output fetch after {max_retries} retries: {e}"));
                    dirty.insert(task.id.clone());
                } else {
                    task.run.log(format!("output fetch failed transiently (attempt {}): {e}", task.run.fetch_retries));
                }
            }
            Ok(Err(e)) => {
                task.run.return_code = Some(ReturnCode::from_pseudo(PseudoSignal::DataStagingFailed));
                task.run.transition(State::Terminated);
                task.run.log(format!("output fetch failed permanently: {e}"));
                dirty.insert(task.id.clone());
            }
            Err(_elapsed) => {
                debug!(task = %task.id, "fetch timed out this tick, retrying next tick");
            }
        }
    }
}

async fn submission_pass(state: &mut EngineState, dirty: &mut BTreeSet<TaskId>) {
    let mut in_flight = state.count(|s| matches!(s, State::Submitted | State::Running));
    let mut submitted_only = state.count(|s| s == State::Submitted);

    let candidate_ids: Vec<TaskId> = {
        let mut ids: Vec<TaskId> = candidate_new_tasks_mut(&mut state.nodes).into_iter().map(|t| t.id.clone()).collect();
        ids.sort();
        ids
    };

    for id in candidate_ids {
        if in_flight >= state.config.max_in_flight || submitted_only >= state.config.max_submitted {
            break;
        }
        let Some(task) = find_leaf_mut(&mut state.nodes, &id) else { continue };
        if task.state() != State::New {
            continue;
        }
        match attempt_submit(state, task).await {
            SubmitOutcome::Submitted => {
                in_flight += 1;
                submitted_only += 1;
                dirty.insert(id);
            }
            SubmitOutcome::Failed => {
                dirty.insert(id);
            }
            SubmitOutcome::Retry => {}
        }
    }
}

enum SubmitOutcome {
    Submitted,
    Failed,
    Retry,
}

async fn attempt_submit(state: &mut EngineState, task: &mut Task) -> SubmitOutcome {
    let requirements = task.spec.requirements.clone();
    let capable: Vec<&Arc<Resource>> = state
        .resources
        .values()
        .filter(|r| r.capabilities.accommodates(&requirements))
        .collect();
    if capable.is_empty() {
        task.run.transition(State::Terminated);
        task.run.return_code = Some(ReturnCode::from_pseudo(PseudoSignal::SubmissionFailed));
        task.run.log("no resource declares capabilities wide enough for this task's requirements");
        return SubmitOutcome::Failed;
    }

    let now = Instant::now();
    let mut usable: Vec<Arc<Resource>> = capable
        .into_iter()
        .filter(|r| r.can_host(task))
        .filter(|r| state.config.resource_filter.as_ref().map(|allow| allow.contains(&r.name)).unwrap_or(true))
        .filter(|r| state.resource_backoff_until.get(&r.name).map(|t| *t <= now).unwrap_or(true))
        .cloned()
        .collect();
    if usable.is_empty() {
        return SubmitOutcome::Retry;
    }

    usable.sort_by(|a, b| {
        b.tag_match_score(task)
            .cmp(&a.tag_match_score(task))
            .then(a.adapter.load().cmp(&b.adapter.load()))
            .then(a.name.cmp(&b.name))
    });
    let rotate = state.round_robin % usable.len();
    usable.rotate_left(rotate);
    state.round_robin = state.round_robin.wrapping_add(1);

    for resource in &usable {
        let outcome = tokio::time::timeout(state.config.operation_timeout, resource.adapter.submit(task)).await;
        match outcome {
            Err(_elapsed) => continue,
            Ok(Ok(job_id)) => {
                task.run.backend_job_id = Some(job_id);
                task.run.resource_name = Some(resource.name.clone());
                task.run.transition(State::Submitted);
                task.run.log(format!("submitted to {}", resource.name));
                state.resource_submit_failures.remove(&resource.name);
                return SubmitOutcome::Submitted;
            }
            Ok(Err(e)) if e.is_transient() => {
                let failures = state.resource_submit_failures.entry(resource.name.clone()).or_insert(0);
                *failures += 1;
                let backoff = (state.config.submit_backoff_base * 2u32.saturating_pow(*failures)).min(state.config.submit_backoff_max);
                state.resource_backoff_until.insert(resource.name.clone(), Instant::now() + backoff);
                task.run.log(format!("transient submission failure on {}: {e}", resource.name));
                continue;
            }
            Ok(Err(e)) => {
                task.run.transition(State::Terminated);
                task.run.return_code = Some(ReturnCode::from_pseudo(PseudoSignal::SubmissionFailed));
                task.run.log(format!("submission permanently rejected by {}: {e}", resource.name));
                return SubmitOutcome::Failed;
            }
        }
    }
    SubmitOutcome::Retry
}

fn group_pass(state: &mut EngineState, dirty: &mut BTreeSet<TaskId>) {
    for node in state.nodes.values_mut() {
        let Node::Group(g) = node else { continue };

        for id in g.propagate_dependency_failures() {
            dirty.insert(id);
        }
        if let Some(decision) = g.advance_sequential() {
            debug!(group = %g.id, ?decision, "sequential selector decided");
            if matches!(decision, SelectorDecision::Stop) {
                debug!(group = %g.id, "sequential group will not extend further");
            }
        }
        if g.advance_staged() {
            debug!(group = %g.id, "staged group advanced to next stage");
        }
    }
}

/// Group records are small structural pointers, so it's cheap to rewrite
/// them (and, through `Store::save_group`, every one of their children)
/// every tick rather than tracking fine-grained group dirtiness. Top-level
/// leaf tasks are gated on `dirty` to honour "written on every observable
/// state change" precisely for the common single-task case.
async fn persistence_pass(state: &EngineState, dirty: &BTreeSet<TaskId>) -> Result<(), crate::error::StoreError> {
    for node in state.nodes.values() {
        match node {
            Node::Leaf(task) if dirty.contains(&task.id) => {
                state.store.save_task(task).await?;
            }
            Node::Leaf(_) => {}
            Node::Group(g) => {
                state.store.save_group(g).await?;
            }
        }
    }
    Ok(())
}

fn all_leaf_tasks_mut(nodes: &mut BTreeMap<TaskId, Node>) -> Vec<&mut Task> {
    nodes
        .values_mut()
        .flat_map(|n| match n {
            Node::Leaf(t) => vec![t],
            Node::Group(g) => g.all_children_mut(),
        })
        .collect()
}

fn candidate_new_tasks_mut(nodes: &mut BTreeMap<TaskId, Node>) -> Vec<&mut Task> {
    nodes
        .values_mut()
        .flat_map(|n| match n {
            Node::Leaf(t) if t.state() == State::New => vec![t],
            Node::Leaf(_) => vec![],
            Node::Group(g) => g.active_children_mut().into_iter().filter(|t| t.state() == State::New).collect(),
        })
        .collect()
}

fn find_leaf_mut<'a>(nodes: &'a mut BTreeMap<TaskId, Node>, id: &TaskId) -> Option<&'a mut Task> {
    all_leaf_tasks_mut(nodes).into_iter().find(|t| &t.id == id)
}

async fn kill_task(resources: &HashMap<String, Arc<Resource>>, task: &mut Task) {
    match task.state() {
        State::New => {
            task.run.return_code = Some(ReturnCode::from_pseudo(PseudoSignal::CancelledByUser));
            task.run.transition(State::Terminated);
            task.run.log("cancelled before submission");
        }
        s if s.is_active() => {
            if let (Some(rname), Some(job_id)) = (task.run.resource_name.clone(), task.run.backend_job_id.clone()) {
                if let Some(resource) = resources.get(&rname) {
                    if let Err(e) = resource.adapter.cancel(&job_id).await {
                        warn!(task = %task.id, error = %e, "cancel request failed, will retry via next poll");
                    }
                }
            }
            task.run.transition(State::Terminating);
            task.run.log("cancel requested");
        }
        _ => {}
    }
}

async fn kill_node(state: &mut EngineState, id: &TaskId) -> Result<(), EngineError> {
    let resources = state.resources.clone();
    let Some(node) = state.nodes.get_mut(id) else {
        return Err(EngineError::NodeNotFound(id.to_string()));
    };
    match node {
        Node::Leaf(task) => kill_task(&resources, task).await,
        Node::Group(g) => {
            for child in g.all_children_mut() {
                kill_task(&resources, child).await;
            }
        }
    }
    Ok(())
}

async fn fetch_node(state: &mut EngineState, id: &TaskId) -> Result<(), EngineError> {
    let resources = state.resources.clone();
    let Some(task) = find_leaf_mut(&mut state.nodes, id) else {
        return Err(EngineError::NodeNotFound(id.to_string()));
    };
    let Some(rname) = task.run.resource_name.clone() else {
        return Err(EngineError::NodeNotFound(id.to_string()));
    };
    let Some(resource) = resources.get(&rname) else {
        return Err(EngineError::NodeNotFound(id.to_string()));
    };
    let dir = resource.adapter.fetch_outputs(task).await.map_err(|e| EngineError::Backend(e))?;
    task.run.output_dir = Some(dir);
    task.run.log("outputs fetched (manual request)");
    Ok(())
}

async fn redo_node(state: &mut EngineState, id: &TaskId) -> Result<(), EngineError> {
    let Some(node) = state.nodes.get_mut(id) else {
        return Err(EngineError::NodeNotFound(id.to_string()));
    };
    let Node::Leaf(task) = node else {
        return Err(EngineError::NodeNotFound(id.to_string()));
    };
    if task.state() != State::Terminated {
        return Err(EngineError::NotTerminated(id.to_string()));
    }
    let fresh = task.redo();
    state.store.save_task(&fresh).await.map_err(EngineError::Store)?;
    *task = fresh;
    Ok(())
}

/// Handle to a running [`EngineActor`]: the public surface the rest of the
/// crate (and a `Session`) drives (§4.4).
pub struct Engine {
    actor: ActorRef<EngineMsg>,
    poll_interval: Duration,
}

impl Engine {
    pub async fn start(
        config: EngineConfig,
        resources: Vec<Resource>,
        store: Arc<dyn Store>,
        session_name: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let poll_interval = config.poll_interval;
        let (actor, _handle) = Actor::spawn(
            None,
            EngineActor,
            EngineArguments { config, resources, store, session_name: session_name.into() },
        )
        .await
        .map_err(|e| EngineError::Actor(e.to_string()))?;
        Ok(Engine { actor, poll_interval })
    }

    pub async fn add(&self, node: Node) -> Result<TaskId, EngineError> {
        self.actor
            .call(|port| EngineMsg::AddNode(Box::new(node), port), None)
            .await
            .map_err(|e| EngineError::Actor(e.to_string()))?
            .success_or(EngineError::Actor("add: actor did not reply".into()))
    }

    pub async fn remove(&self, id: TaskId) -> Result<(), EngineError> {
        self.actor
            .call(|port| EngineMsg::RemoveNode(id, port), None)
            .await
            .map_err(|e| EngineError::Actor(e.to_string()))?
            .success_or(EngineError::Actor("remove: actor did not reply".into()))
    }

    /// Run exactly one tick (§4.4).
    pub async fn progress(&self) -> Result<(), EngineError> {
        self.actor
            .call(|port| EngineMsg::Progress(port), None)
            .await
            .map_err(|e| EngineError::Actor(e.to_string()))?
            .success_or(EngineError::Actor("progress: actor did not reply".into()))
    }

    /// Repeated ticks with sleep, until every managed node is terminal
    /// (§4.4).
    pub async fn run_until_done(&self) -> Result<(), EngineError> {
        loop {
            self.progress().await?;
            let stats = self.stats().await?;
            let outstanding: usize = stats
                .iter()
                .filter(|(s, _)| **s != State::Terminated)
                .map(|(_, n)| n)
                .sum();
            if outstanding == 0 {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn kill(&self, id: TaskId) -> Result<(), EngineError> {
        self.actor
            .call(|port| EngineMsg::Kill(id, port), None)
            .await
            .map_err(|e| EngineError::Actor(e.to_string()))?
            .success_or(EngineError::Actor("kill: actor did not reply".into()))?
    }

    pub async fn fetch(&self, id: TaskId) -> Result<(), EngineError> {
        self.actor
            .call(|port| EngineMsg::Fetch(id, port), None)
            .await
            .map_err(|e| EngineError::Actor(e.to_string()))?
            .success_or(EngineError::Actor("fetch: actor did not reply".into()))?
    }

    pub async fn redo(&self, id: TaskId) -> Result<(), EngineError> {
        self.actor
            .call(|port| EngineMsg::Redo(id, port), None)
            .await
            .map_err(|e| EngineError::Actor(e.to_string()))?
            .success_or(EngineError::Actor("redo: actor did not reply".into()))?
    }

    pub async fn stats(&self) -> Result<HashMap<State, usize>, EngineError> {
        self.actor
            .call(|port| EngineMsg::Stats(port), None)
            .await
            .map_err(|e| EngineError::Actor(e.to_string()))?
            .success_or(EngineError::Actor("stats: actor did not reply".into()))
    }

    pub async fn snapshot(&self) -> Result<Vec<(TaskId, String, State, Option<ReturnCode>)>, EngineError> {
        self.actor
            .call(|port| EngineMsg::Snapshot(port), None)
            .await
            .map_err(|e| EngineError::Actor(e.to_string()))?
            .success_or(EngineError::Actor("snapshot: actor did not reply".into()))
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }

    /// Human-facing status table over the current snapshot, the way
    /// `Storage::list()`/`Sources::list()` render through `tabled` elsewhere
    /// in the ambient stack. Presentation only: no front-end command maps
    /// onto it (see spec.md's `gstat` Non-goal).
    pub async fn stats_table(&self) -> Result<String, EngineError> {
        let mut builder = Builder::default();
        builder.push_record(["task", "state", "return code"]);
        for (_, name, state, rc) in self.snapshot().await? {
            let rc = rc.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
            builder.push_record([name, state.to_string(), rc]);
        }
        Ok(builder.build().with(Style::modern()).to_string())
    }
}

/// Small adapter over `ractor::CallResult` so call sites read as a
/// plain `Result` instead of matching `Success`/`Timeout`/`SenderError`
/// every time.
trait CallResultExt<T> {
    fn success_or(self, err: EngineError) -> Result<T, EngineError>;
}

impl<T> CallResultExt<T> for ractor::CallResult<T> {
    fn success_or(self, err: EngineError) -> Result<T, EngineError> {
        match self {
            ractor::CallResult::Success(v) => Ok(v),
            _ => Err(err),
        }
    }
}
