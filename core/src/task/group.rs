//! TaskGroup combinators (spec §3, §4.3, §5): Sequential, Parallel, Staged,
//! Dependency. A TaskGroup is itself a Task whose "run" *is* the coordinated
//! run of its children; its state and return code are derived, never set
//! directly by the Engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{PseudoSignal, ReturnCode, State, Task, TaskId};

/// Edge set for a Dependency group: child id -> ids that must terminate
/// successfully first.
pub type DependencyEdges = BTreeMap<TaskId, Vec<TaskId>>;

/// What a Sequential group's selector decides after a child terminates.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SelectorDecision {
    /// Append no further children; the group is done once the current
    /// child terminates.
    Stop,
    /// Keep going; the group isn't finished yet even though the currently
    /// known child list is exhausted (a lazy/adaptive sequence).
    Continue,
}

/// Decides, for a Sequential group, whether more children should be appended
/// once the last one has terminated. Boxed so a group can carry an adaptive
/// policy (e.g. "keep resubmitting until a convergence criterion holds")
/// without the group type itself being generic.
pub trait SequentialSelector: std::fmt::Debug {
    fn decide(&mut self, completed: &Task) -> SelectorDecision;
}

/// A selector that always stops after the fixed list is exhausted — the
/// common case (spec §8 S2's two-element sequence).
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedSelector;

impl SequentialSelector for FixedSelector {
    fn decide(&mut self, _completed: &Task) -> SelectorDecision {
        SelectorDecision::Stop
    }
}

/// Constructs the next stage of a Staged group lazily, once the previous
/// stage has terminated successfully (§3: "fixed sequence of stages, each
/// stage constructed lazily when reached"). Boxed for the same reason
/// `SequentialSelector` is: the policy can close over campaign-specific
/// state without the group type itself being generic.
pub trait StageFactory: std::fmt::Debug {
    /// Build the next stage, or `None` if there are no more (the group is
    /// then done once `current` terminates).
    fn next_stage(&mut self, completed: &Task) -> Option<Task>;
}

#[derive(Debug)]
pub enum GroupKind {
    Sequential {
        children: Vec<Task>,
        cursor: usize,
        selector: Box<dyn SequentialSelector + Send>,
    },
    Parallel {
        children: Vec<Task>,
    },
    Staged {
        /// Stages not yet constructed; `factory` is consulted lazily when
        /// the previous stage terminates successfully. `None` once the
        /// factory has reported there are no more stages, or when a group
        /// was reloaded from the Store (§4.7: stage factories aren't
        /// serializable, so a resumed Staged group completes with whatever
        /// stage it had in flight and constructs no further ones).
        factory: Option<Box<dyn StageFactory + Send>>,
        current: Option<Task>,
        completed: Vec<Task>,
    },
    Dependency {
        children: BTreeMap<TaskId, Task>,
        edges: DependencyEdges,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct GroupTimestamps {
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct TaskGroup {
    pub id: TaskId,
    pub name: String,
    pub kind: GroupKind,
    pub timestamps: GroupTimestamps,
}

impl TaskGroup {
    pub fn sequential(name: impl Into<String>, children: Vec<Task>) -> Self {
        Self::sequential_with_selector(name, children, Box::new(FixedSelector))
    }

    pub fn sequential_with_selector(
        name: impl Into<String>,
        children: Vec<Task>,
        selector: Box<dyn SequentialSelector + Send>,
    ) -> Self {
        TaskGroup {
            id: TaskId::new(),
            name: name.into(),
            kind: GroupKind::Sequential {
                children,
                cursor: 0,
                selector,
            },
            timestamps: GroupTimestamps { started: None, ended: None },
        }
    }

    pub fn parallel(name: impl Into<String>, children: Vec<Task>) -> Self {
        TaskGroup {
            id: TaskId::new(),
            name: name.into(),
            kind: GroupKind::Parallel { children },
            timestamps: GroupTimestamps { started: None, ended: None },
        }
    }

    pub fn staged(name: impl Into<String>, first: Task, factory: Box<dyn StageFactory + Send>) -> Self {
        TaskGroup {
            id: TaskId::new(),
            name: name.into(),
            kind: GroupKind::Staged {
                factory: Some(factory),
                current: Some(first),
                completed: Vec::new(),
            },
            timestamps: GroupTimestamps { started: None, ended: None },
        }
    }

    pub fn dependency(name: impl Into<String>, children: Vec<Task>, edges: DependencyEdges) -> Self {
        let children = children.into_iter().map(|t| (t.id.clone(), t)).collect();
        TaskGroup {
            id: TaskId::new(),
            name: name.into(),
            kind: GroupKind::Dependency { children, edges },
            timestamps: GroupTimestamps { started: None, ended: None },
        }
    }

    /// All Tasks the Engine should currently consider "belonging to" this
    /// group, in a stable order (by persistent id, per §4.4's submission
    /// ordering guarantee).
    pub fn active_children_mut(&mut self) -> Vec<&mut Task> {
        match &mut self.kind {
            GroupKind::Sequential { children, cursor, .. } => {
                // Only the child at `cursor` is ever submittable: later
                // children must wait for it to terminate and the selector to
                // run (§5: "child N+1 is never submitted before child N is
                // terminated").
                children.get_mut(*cursor..=*cursor).into_iter().flatten().collect()
            }
            GroupKind::Parallel { children } => children.iter_mut().collect(),
            GroupKind::Staged { current, .. } => current.iter_mut().collect(),
            GroupKind::Dependency { children, edges } => {
                // Only children whose predecessors have all terminated
                // successfully are eligible for submission (§5 Dependency
                // ordering guarantee); callers filter further by state.
                let ready_ids: Vec<TaskId> = children
                    .iter()
                    .filter(|(id, _)| {
                        edges
                            .get(*id)
                            .map(|preds| {
                                preds.iter().all(|p| {
                                    children
                                        .get(p)
                                        .map(|t| t.state() == State::Terminated && t.run.return_code.map(|rc| rc.is_success()).unwrap_or(false))
                                        .unwrap_or(false)
                                })
                            })
                            .unwrap_or(true)
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                children
                    .iter_mut()
                    .filter(|(id, _)| ready_ids.contains(id))
                    .map(|(_, t)| t)
                    .collect()
            }
        }
    }

    /// Every child regardless of eligibility, mutable (used by the Engine's
    /// observation/fetch passes, which must see every in-flight child, not
    /// just the ones `active_children_mut` currently considers submittable).
    pub fn all_children_mut(&mut self) -> Vec<&mut Task> {
        match &mut self.kind {
            GroupKind::Sequential { children, .. } => children.iter_mut().collect(),
            GroupKind::Parallel { children } => children.iter_mut().collect(),
            GroupKind::Staged { current, completed, .. } => {
                completed.iter_mut().chain(current.iter_mut()).collect()
            }
            GroupKind::Dependency { children, .. } => children.values_mut().collect(),
        }
    }

    pub fn all_children(&self) -> Vec<&Task> {
        match &self.kind {
            GroupKind::Sequential { children, .. } => children.iter().collect(),
            GroupKind::Parallel { children } => children.iter().collect(),
            GroupKind::Staged { current, completed, .. } => {
                completed.iter().chain(current.iter()).collect()
            }
            GroupKind::Dependency { children, .. } => children.values().collect(),
        }
    }

    /// Derived state (§4.3): new iff all children new, terminated iff all
    /// children terminated, running otherwise.
    pub fn derived_state(&self) -> State {
        let children = self.all_children();
        let pending_more = matches!(
            &self.kind,
            GroupKind::Staged { factory: Some(_), current, .. } if current.is_some()
        ) || matches!(
            &self.kind,
            GroupKind::Sequential { cursor, children, .. } if *cursor < children.len()
        );

        if children.is_empty() {
            return if pending_more { State::New } else { State::Terminated };
        }
        if children.iter().all(|t| t.state() == State::New) && !pending_more {
            return State::New;
        }
        if children.iter().all(|t| t.state() == State::Terminated) && !pending_more {
            return State::Terminated;
        }
        State::Running
    }

    /// Derived return code: success iff all children succeeded, otherwise
    /// the first non-success child's code in child order (§4.3).
    pub fn derived_return_code(&self) -> Option<ReturnCode> {
        let children = self.all_children();
        if children.iter().any(|t| t.state() != State::Terminated) {
            return None;
        }
        for child in &children {
            if let Some(rc) = child.run.return_code {
                if !rc.is_success() {
                    return Some(rc);
                }
            }
        }
        Some(ReturnCode::from_exit(0))
    }

    /// Advance a Sequential group's cursor past a terminated child,
    /// consulting the selector to decide whether the sequence is done.
    pub fn advance_sequential(&mut self) -> Option<SelectorDecision> {
        match &mut self.kind {
            GroupKind::Sequential { children, cursor, selector } => {
                let child = children.get(*cursor)?;
                if child.state() != State::Terminated {
                    return None;
                }
                let decision = selector.decide(child);
                *cursor += 1;
                Some(decision)
            }
            _ => None,
        }
    }

    /// Advance a Staged group once its current stage has terminated:
    /// move it into `completed` and consult the factory for the next stage
    /// (§3, §4.4 group pass step 4: "construct the next stage"). Returns
    /// `true` if a new stage was constructed, `false` if the group is done.
    /// A `None` factory (always the case for a group reloaded from the
    /// Store) means no further stage is ever constructed.
    pub fn advance_staged(&mut self) -> bool {
        match &mut self.kind {
            GroupKind::Staged { factory, current, completed } => {
                let Some(finished) = current.take() else { return false };
                if finished.state() != State::Terminated {
                    *current = Some(finished);
                    return false;
                }
                let next = factory.as_mut().and_then(|f| f.next_stage(&finished));
                completed.push(finished);
                *current = next;
                current.is_some()
            }
            _ => false,
        }
    }

    /// For a Dependency group, transition every child whose predecessors
    /// have all terminated but at least one unsuccessfully straight to
    /// *terminated* with data-staging-failed (§5: "on predecessor failure,
    /// the dependent child immediately transitions to terminated with
    /// data-staging-failed, unless configured otherwise"). Returns the ids
    /// of children so failed, for the Engine's persistence pass.
    pub fn propagate_dependency_failures(&mut self) -> Vec<TaskId> {
        let GroupKind::Dependency { children, edges } = &mut self.kind else {
            return Vec::new();
        };
        let mut failed = Vec::new();
        for (id, preds) in edges.iter() {
            let Some(child) = children.get(id) else { continue };
            if child.state() == State::New {
                let any_failed_predecessor = preds.iter().any(|p| {
                    children
                        .get(p)
                        .map(|t| t.state() == State::Terminated && !t.run.return_code.map(|rc| rc.is_success()).unwrap_or(false))
                        .unwrap_or(false)
                });
                if any_failed_predecessor {
                    failed.push(id.clone());
                }
            }
        }
        for id in &failed {
            if let Some(child) = children.get_mut(id) {
                child.run.transition(State::Terminated);
                child.run.return_code = Some(ReturnCode::from_pseudo(PseudoSignal::DataStagingFailed));
                child.run.log("predecessor failed, skipping (data-staging-failed)");
            }
        }
        failed
    }
}
