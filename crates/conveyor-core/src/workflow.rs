//! Workflow definitions
//!
//! A workflow is a named, registered list of steps plus an execution
//! policy. Definitions are validated at registration: at least one step,
//! unique step names, dependency references that exist, an acyclic
//! dependency graph, and choice targets that resolve.

use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::run::JsonMap;
use crate::step::{Step, StepType};

/// How steps are ordered for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Steps run in list order on the calling context
    Sequential,

    /// Steps form a DAG via `depends_on`, executed with bounded parallelism
    Parallel,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Workflow-level execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub mode: ExecutionMode,

    /// Parallelism bound in DAG mode; 1 serializes topologically
    pub max_concurrency: usize,

    /// Whether a STOP-policy step failure cancels remaining running steps
    pub on_failure: crate::step::ErrorPolicy,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            max_concurrency: 4,
            on_failure: crate::step::ErrorPolicy::Stop,
        }
    }
}

impl ExecutionPolicy {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel(max_concurrency: usize) -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            max_concurrency: max_concurrency.max(1),
            on_failure: crate::step::ErrorPolicy::Stop,
        }
    }

    pub fn with_on_failure(mut self, policy: crate::step::ErrorPolicy) -> Self {
        self.on_failure = policy;
        self
    }
}

/// Concurrency-lock policy for a workflow.
///
/// When set, the runner acquires a lease keyed by
/// `workflow:<name>:<partition-hash>` before the first step, where the
/// partition hash is derived from the named params. A refused lease
/// cancels the run with a `lock_unavailable` reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockPolicy {
    /// Params whose values define the lock partition
    pub partition_params: Vec<String>,

    /// Lease TTL
    pub ttl_seconds: u64,
}

impl LockPolicy {
    pub fn new(partition_params: Vec<String>, ttl_seconds: u64) -> Self {
        Self {
            partition_params,
            ttl_seconds,
        }
    }
}

/// A registered workflow definition.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
    pub policy: ExecutionPolicy,

    /// Default params merged under submission params
    pub defaults: JsonMap,

    /// Optional per-partition mutual exclusion
    pub lock: Option<LockPolicy>,
}

impl Workflow {
    /// Create and validate a sequential workflow.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self, CoreError> {
        let wf = Self {
            name: name.into(),
            steps,
            policy: ExecutionPolicy::default(),
            defaults: JsonMap::new(),
            lock: None,
        };
        wf.validate()?;
        Ok(wf)
    }

    /// Create and validate a workflow with an explicit policy.
    pub fn with_policy(
        name: impl Into<String>,
        steps: Vec<Step>,
        policy: ExecutionPolicy,
    ) -> Result<Self, CoreError> {
        let wf = Self {
            name: name.into(),
            steps,
            policy,
            defaults: JsonMap::new(),
            lock: None,
        };
        wf.validate()?;
        Ok(wf)
    }

    pub fn with_defaults(mut self, defaults: JsonMap) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_lock(mut self, lock: LockPolicy) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Declaration index of a step.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::ValidationFailed(
                "workflow name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(CoreError::ValidationFailed(format!(
                "workflow {} has no steps",
                self.name
            )));
        }

        let mut names = std::collections::HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(CoreError::ValidationFailed(format!(
                    "duplicate step name: {}",
                    step.name
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(CoreError::ValidationFailed(format!(
                        "step {} depends on unknown step {}",
                        step.name, dep
                    )));
                }
                if dep == &step.name {
                    return Err(CoreError::ValidationFailed(format!(
                        "step {} depends on itself",
                        step.name
                    )));
                }
            }

            if let StepType::Choice {
                then_step,
                else_step,
                ..
            } = &step.step_type
            {
                if !names.contains(then_step.as_str()) {
                    return Err(CoreError::ValidationFailed(format!(
                        "choice step {} routes to unknown step {}",
                        step.name, then_step
                    )));
                }
                if let Some(else_step) = else_step {
                    if !names.contains(else_step.as_str()) {
                        return Err(CoreError::ValidationFailed(format!(
                            "choice step {} routes to unknown step {}",
                            step.name, else_step
                        )));
                    }
                }
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), CoreError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for step in &self.steps {
            let idx = graph.add_node(step.name.as_str());
            indices.insert(step.name.as_str(), idx);
        }
        for step in &self.steps {
            let to = indices[step.name.as_str()];
            for dep in &step.depends_on {
                let from = indices[dep.as_str()];
                graph.add_edge(from, to, ());
            }
        }
        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(CoreError::ValidationFailed(format!(
                "workflow {} has a dependency cycle",
                self.name
            )));
        }
        Ok(())
    }
}
