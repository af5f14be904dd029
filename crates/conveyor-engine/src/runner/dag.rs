//! Step dependency graph for parallel execution
//!
//! Builds adjacency maps from `depends_on` edges plus the implicit edges
//! a choice step contributes to its branch targets (branch activation is
//! an edge enabled by the decision, not a static dependency).

use std::collections::{HashMap, HashSet};

use conveyor_core::error::CoreError;
use conveyor_core::step::StepType;
use conveyor_core::workflow::Workflow;

/// Dependency structure over a workflow's steps.
pub struct StepDag {
    /// Incoming-edge counts by step name
    pub indegree: HashMap<String, usize>,

    /// step → steps that depend on it
    pub dependents: HashMap<String, Vec<String>>,

    /// step → its dependencies (static plus implicit choice edges)
    pub dependencies: HashMap<String, Vec<String>>,

    /// Declaration order, for stable ready-set tie-breaks
    pub order: HashMap<String, usize>,
}

impl StepDag {
    /// Build the graph. The workflow is assumed validated (acyclic,
    /// resolvable references); choice edges are added here and checked
    /// again for cycles.
    pub fn new(workflow: &Workflow) -> Result<Self, CoreError> {
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut order = HashMap::new();

        for (idx, step) in workflow.steps.iter().enumerate() {
            indegree.insert(step.name.clone(), 0);
            dependents.insert(step.name.clone(), Vec::new());
            dependencies.insert(step.name.clone(), Vec::new());
            order.insert(step.name.clone(), idx);
        }

        let mut add_edge = |from: &str, to: &str,
                            indegree: &mut HashMap<String, usize>,
                            dependents: &mut HashMap<String, Vec<String>>,
                            dependencies: &mut HashMap<String, Vec<String>>| {
            let already = dependencies
                .get(to)
                .is_some_and(|deps| deps.iter().any(|d| d == from));
            if already {
                return;
            }
            *indegree.entry(to.to_string()).or_default() += 1;
            dependents
                .entry(from.to_string())
                .or_default()
                .push(to.to_string());
            dependencies
                .entry(to.to_string())
                .or_default()
                .push(from.to_string());
        };

        for step in &workflow.steps {
            for dep in &step.depends_on {
                add_edge(dep, &step.name, &mut indegree, &mut dependents, &mut dependencies);
            }
            if let StepType::Choice {
                then_step,
                else_step,
                ..
            } = &step.step_type
            {
                add_edge(
                    &step.name,
                    then_step,
                    &mut indegree,
                    &mut dependents,
                    &mut dependencies,
                );
                if let Some(else_step) = else_step {
                    add_edge(
                        &step.name,
                        else_step,
                        &mut indegree,
                        &mut dependents,
                        &mut dependencies,
                    );
                }
            }
        }

        let dag = Self {
            indegree,
            dependents,
            dependencies,
            order,
        };
        dag.check_acyclic(workflow)?;
        Ok(dag)
    }

    /// Steps with no incoming edges, in declaration order.
    pub fn entry_steps(&self) -> Vec<String> {
        let mut entries: Vec<&String> = self
            .indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| name)
            .collect();
        entries.sort_by_key(|name| self.order.get(*name).copied().unwrap_or(usize::MAX));
        entries.into_iter().cloned().collect()
    }

    // Kahn's algorithm over the combined edge set; implicit choice edges
    // can introduce cycles that static validation could not see.
    fn check_acyclic(&self, workflow: &Workflow) -> Result<(), CoreError> {
        let mut indegree = self.indegree.clone();
        let mut queue: Vec<String> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| name.clone())
            .collect();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(name) = queue.pop() {
            visited.insert(name.clone());
            for dependent in self.dependents.get(&name).into_iter().flatten() {
                let count = indegree
                    .get_mut(dependent)
                    .ok_or_else(|| {
                        CoreError::ValidationFailed(format!("unknown step: {dependent}"))
                    })?;
                *count -= 1;
                if *count == 0 {
                    queue.push(dependent.clone());
                }
            }
        }

        if visited.len() != workflow.steps.len() {
            return Err(CoreError::ValidationFailed(format!(
                "workflow {} has a dependency cycle through choice branches",
                workflow.name
            )));
        }
        Ok(())
    }
}
