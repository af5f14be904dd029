//! Workflow steps and step results
//!
//! A step is the unit of work inside a workflow. Step behavior is a tagged
//! variant ([`StepType`]) rather than string dispatch: operations resolve
//! through the handler registry as child runs, lambdas run in-process,
//! choices route, waits suspend, maps fan out over a params list.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::error::{ErrorCategory, RunError};
use crate::run::JsonMap;

/// What the runner does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Halt the workflow (default)
    Stop,

    /// Record the failure and keep scheduling; the workflow ends `partial`
    Continue,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::Stop
    }
}

/// Value returned by a step handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepResult {
    /// Step succeeded
    Ok {
        /// Merged into `context.outputs[step_name]`
        #[serde(default)]
        output: JsonMap,

        /// Merged into `context.params` for downstream steps
        #[serde(default)]
        context_updates: JsonMap,
    },

    /// Step failed
    Fail { error: RunError },
}

impl StepResult {
    /// Success with no output.
    pub fn ok_empty() -> Self {
        Self::Ok {
            output: JsonMap::new(),
            context_updates: JsonMap::new(),
        }
    }

    /// Success with an output map.
    pub fn ok(output: JsonMap) -> Self {
        Self::Ok {
            output,
            context_updates: JsonMap::new(),
        }
    }

    /// Success with output and downstream parameter updates.
    pub fn ok_with_updates(output: JsonMap, context_updates: JsonMap) -> Self {
        Self::Ok {
            output,
            context_updates,
        }
    }

    /// Retryable failure with an unclassified category.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            error: RunError::new(message),
        }
    }

    /// Failure with an explicit category.
    pub fn fail_categorized(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self::Fail {
            error: RunError::categorized(message, category),
        }
    }

    /// Failure from a structured error.
    pub fn fail_with(error: RunError) -> Self {
        Self::Fail { error }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// The error, if this is a failure.
    pub fn error(&self) -> Option<&RunError> {
        match self {
            Self::Fail { error } => Some(error),
            Self::Ok { .. } => None,
        }
    }
}

/// In-process step handler: `(ctx, config) → StepResult`.
///
/// Handlers must be thread-safe; under a parallel DAG policy the runner
/// invokes them concurrently on context snapshots.
pub type StepHandler = dyn Fn(&WorkflowContext, &JsonMap) -> StepResult + Send + Sync;

/// Choice-step predicate over the workflow context.
pub type ChoiceCondition = dyn Fn(&WorkflowContext) -> bool + Send + Sync;

/// Behavior of a step.
#[derive(Clone)]
pub enum StepType {
    /// Submit a registered operation as a child run and await it
    Operation {
        operation_name: String,
        params: JsonMap,
    },

    /// Invoke an in-process handler synchronously
    Lambda { handler: Arc<StepHandler> },

    /// Route to one of two steps based on a predicate
    Choice {
        condition: Arc<ChoiceCondition>,
        then_step: String,
        else_step: Option<String>,
    },

    /// Suspend for a fixed duration (cancellation-aware)
    Wait { duration_seconds: u64 },

    /// Invoke a handler once per element of a params list
    Map {
        /// Params key holding the items array
        items_key: String,
        handler: Arc<StepHandler>,
    },
}

impl StepType {
    /// Snake-case type name used in events and step executions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Operation { .. } => "operation",
            Self::Lambda { .. } => "lambda",
            Self::Choice { .. } => "choice",
            Self::Wait { .. } => "wait",
            Self::Map { .. } => "map",
        }
    }
}

impl std::fmt::Debug for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operation { operation_name, .. } => f
                .debug_struct("Operation")
                .field("operation_name", operation_name)
                .finish(),
            Self::Lambda { .. } => f.debug_struct("Lambda").finish_non_exhaustive(),
            Self::Choice {
                then_step,
                else_step,
                ..
            } => f
                .debug_struct("Choice")
                .field("then_step", then_step)
                .field("else_step", else_step)
                .finish_non_exhaustive(),
            Self::Wait { duration_seconds } => f
                .debug_struct("Wait")
                .field("duration_seconds", duration_seconds)
                .finish(),
            Self::Map { items_key, .. } => f
                .debug_struct("Map")
                .field("items_key", items_key)
                .finish_non_exhaustive(),
        }
    }
}

/// A named step within a workflow.
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique within the workflow
    pub name: String,

    pub step_type: StepType,

    /// DAG edges; empty means list-position ordering in sequential mode
    pub depends_on: Vec<String>,

    pub on_error: ErrorPolicy,
}

impl Step {
    fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into(),
            step_type,
            depends_on: Vec::new(),
            on_error: ErrorPolicy::default(),
        }
    }

    /// An operation step resolved through the handler registry.
    pub fn operation(
        name: impl Into<String>,
        operation_name: impl Into<String>,
        params: JsonMap,
    ) -> Self {
        Self::new(
            name,
            StepType::Operation {
                operation_name: operation_name.into(),
                params,
            },
        )
    }

    /// An in-process lambda step.
    pub fn lambda<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&WorkflowContext, &JsonMap) -> StepResult + Send + Sync + 'static,
    {
        Self::new(
            name,
            StepType::Lambda {
                handler: Arc::new(handler),
            },
        )
    }

    /// A choice step routing to `then_step` or `else_step`.
    pub fn choice<F>(
        name: impl Into<String>,
        condition: F,
        then_step: impl Into<String>,
        else_step: Option<String>,
    ) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        Self::new(
            name,
            StepType::Choice {
                condition: Arc::new(condition),
                then_step: then_step.into(),
                else_step,
            },
        )
    }

    /// A wait step suspending for `duration_seconds`.
    pub fn wait(name: impl Into<String>, duration_seconds: u64) -> Self {
        Self::new(name, StepType::Wait { duration_seconds })
    }

    /// A map step fanning a handler out over `params[items_key]`.
    pub fn map<F>(name: impl Into<String>, items_key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&WorkflowContext, &JsonMap) -> StepResult + Send + Sync + 'static,
    {
        Self::new(
            name,
            StepType::Map {
                items_key: items_key.into(),
                handler: Arc::new(handler),
            },
        )
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_result_constructors() {
        assert!(StepResult::ok_empty().is_ok());

        let mut output = JsonMap::new();
        output.insert("records".into(), json!(120));
        let result = StepResult::ok(output);
        assert!(result.is_ok());
        assert!(result.error().is_none());

        let result = StepResult::fail("boom");
        assert!(!result.is_ok());
        assert!(result.error().unwrap().retryable);

        let result = StepResult::fail_categorized("bad row", ErrorCategory::Validation);
        assert!(!result.error().unwrap().retryable);
    }

    #[test]
    fn test_step_result_serialization() {
        let result = StepResult::fail_categorized("gate", ErrorCategory::QualityGate);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"outcome\":\"fail\""));

        let parsed: StepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, parsed);
    }

    #[test]
    fn test_step_builders() {
        let step = Step::lambda("greet", |_ctx, _cfg| StepResult::ok_empty())
            .with_depends_on(vec!["fetch".to_string()])
            .with_on_error(ErrorPolicy::Continue);

        assert_eq!(step.name, "greet");
        assert_eq!(step.step_type.kind(), "lambda");
        assert_eq!(step.depends_on, vec!["fetch".to_string()]);
        assert_eq!(step.on_error, ErrorPolicy::Continue);
    }

    #[test]
    fn test_step_type_kinds() {
        assert_eq!(
            Step::operation("s", "op.name", JsonMap::new()).step_type.kind(),
            "operation"
        );
        assert_eq!(Step::wait("w", 5).step_type.kind(), "wait");
        assert_eq!(
            Step::choice("c", |_| true, "a", None).step_type.kind(),
            "choice"
        );
        assert_eq!(
            Step::map("m", "items", |_ctx, _cfg| StepResult::ok_empty())
                .step_type
                .kind(),
            "map"
        );
    }
}
