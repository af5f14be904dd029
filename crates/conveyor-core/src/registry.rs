//! Process-wide handler and workflow registries
//!
//! Handlers are first-class async function values keyed by
//! `(kind, name)` — no string-typed dispatch beyond the lookup itself.
//! Both registries are initialized once at startup, shared behind `Arc`,
//! and safe to read from any thread.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{CoreError, RunError};
use crate::run::{JsonMap, RunKind};
use crate::workflow::Workflow;

/// Everything a handler gets about the run it is executing.
#[derive(Debug, Clone)]
pub struct OperationInvocation {
    pub run_id: Uuid,
    pub params: JsonMap,
    pub metadata: JsonMap,

    /// Flips to `true` when the run is cancelled; long handlers should
    /// poll this at suspension points and return promptly.
    pub cancelled: watch::Receiver<bool>,
}

impl OperationInvocation {
    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

/// Boxed handler future.
pub type OperationFuture = Pin<Box<dyn Future<Output = Result<JsonMap, RunError>> + Send>>;

/// Registered handler function.
pub type OperationHandler = Arc<dyn Fn(OperationInvocation) -> OperationFuture + Send + Sync>;

/// Handler metadata for listings.
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub kind: RunKind,
    pub name: String,
    pub description: String,
}

struct RegisteredHandler {
    handler: OperationHandler,
    description: String,
}

/// Registry of `(kind, name) → handler`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<(RunKind, String), RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler. Re-registering a key replaces the
    /// previous handler.
    pub fn register<F, Fut>(
        &self,
        kind: RunKind,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) where
        F: Fn(OperationInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonMap, RunError>> + Send + 'static,
    {
        let boxed: OperationHandler = Arc::new(move |inv| Box::pin(handler(inv)));
        self.handlers.write().insert(
            (kind, name.into()),
            RegisteredHandler {
                handler: boxed,
                description: description.into(),
            },
        );
    }

    /// Look up a handler.
    pub fn get(&self, kind: RunKind, name: &str) -> Option<OperationHandler> {
        self.handlers
            .read()
            .get(&(kind, name.to_string()))
            .map(|r| Arc::clone(&r.handler))
    }

    pub fn contains(&self, kind: RunKind, name: &str) -> bool {
        self.handlers.read().contains_key(&(kind, name.to_string()))
    }

    /// All registered handlers, sorted by kind then name.
    pub fn list(&self) -> Vec<HandlerInfo> {
        let mut infos: Vec<HandlerInfo> = self
            .handlers
            .read()
            .iter()
            .map(|((kind, name), reg)| HandlerInfo {
                kind: *kind,
                name: name.clone(),
                description: reg.description.clone(),
            })
            .collect();
        infos.sort_by(|a, b| (a.kind.to_string(), &a.name).cmp(&(b.kind.to_string(), &b.name)));
        infos
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .handlers
            .read()
            .keys()
            .map(|(k, n)| format!("{k}:{n}"))
            .collect();
        f.debug_struct("HandlerRegistry").field("handlers", &keys).finish()
    }
}

/// Registry of workflow definitions by name.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a workflow. Re-registering a name replaces
    /// the previous definition.
    pub fn register(&self, workflow: Workflow) -> Result<(), CoreError> {
        workflow.validate()?;
        self.workflows
            .write()
            .insert(workflow.name.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.read().contains_key(name)
    }

    /// Registered workflow names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().is_empty()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{Step, StepResult};
    use serde_json::json;

    fn invocation(params: JsonMap) -> OperationInvocation {
        let (_tx, rx) = watch::channel(false);
        OperationInvocation {
            run_id: Uuid::now_v7(),
            params,
            metadata: JsonMap::new(),
            cancelled: rx,
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = HandlerRegistry::new();
        registry.register(
            RunKind::Task,
            "echo",
            "echoes params back",
            |inv: OperationInvocation| async move { Ok(inv.params) },
        );

        assert!(registry.contains(RunKind::Task, "echo"));
        assert!(!registry.contains(RunKind::Workflow, "echo"));

        let handler = registry.get(RunKind::Task, "echo").unwrap();
        let mut params = JsonMap::new();
        params.insert("x".into(), json!(1));
        let result = handler(invocation(params.clone())).await.unwrap();
        assert_eq!(result, params);
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(RunKind::Task, "ghost").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handler_listing_sorted() {
        let registry = HandlerRegistry::new();
        registry.register(RunKind::Task, "b", "", |_| async { Ok(JsonMap::new()) });
        registry.register(RunKind::Task, "a", "", |_| async { Ok(JsonMap::new()) });

        let names: Vec<String> = registry.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_workflow_registry_validates() {
        let registry = WorkflowRegistry::new();

        // Construct an invalid workflow without going through Workflow::new
        let invalid = Workflow {
            name: "test.invalid".to_string(),
            steps: vec![],
            policy: Default::default(),
            defaults: JsonMap::new(),
            lock: None,
        };
        assert!(registry.register(invalid).is_err());
        assert!(!registry.contains("test.invalid"));

        let valid = Workflow::new(
            "test.valid",
            vec![Step::lambda("a", |_ctx, _cfg| StepResult::ok_empty())],
        )
        .unwrap();
        registry.register(valid).unwrap();
        assert!(registry.get("test.valid").is_some());
        assert_eq!(registry.names(), vec!["test.valid".to_string()]);
    }
}
