//! Per-run workflow context
//!
//! Mutable state scoped to a single workflow run: the immutable parameter
//! seed, per-step outputs, and lineage IDs. Output writes flow through the
//! runner only — handlers return outputs, the runner commits them — so the
//! context has exactly one writer even under a parallel DAG policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::run::JsonMap;

/// Execution context passed to step handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub run_id: Uuid,
    pub workflow_name: String,

    /// Parameter seed plus any committed `context_updates`
    params: JsonMap,

    /// Outputs keyed by step name
    outputs: std::collections::BTreeMap<String, JsonMap>,

    pub parent_run_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub batch_id: Option<String>,
    pub is_dry_run: bool,
}

impl WorkflowContext {
    pub fn new(run_id: Uuid, workflow_name: impl Into<String>, params: JsonMap) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            params,
            outputs: std::collections::BTreeMap::new(),
            parent_run_id: None,
            correlation_id: None,
            batch_id: None,
            is_dry_run: false,
        }
    }

    pub fn with_parent(mut self, parent_run_id: Option<Uuid>) -> Self {
        self.parent_run_id = parent_run_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_batch_id(mut self, batch_id: Option<String>) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.is_dry_run = dry_run;
        self
    }

    // =========================================================================
    // Params
    // =========================================================================

    /// Look up a parameter.
    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Boolean parameter with a default for absent or non-bool values.
    pub fn bool_param(&self, key: &str, default: bool) -> bool {
        self.params
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// String parameter, if present and a string.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// All params (seed plus committed updates).
    pub fn params(&self) -> &JsonMap {
        &self.params
    }

    /// Merge step `context_updates` into params. Runner-only write path;
    /// last writer wins on key collisions.
    pub fn merge_params(&mut self, updates: JsonMap) {
        for (key, value) in updates {
            self.params.insert(key, value);
        }
    }

    // =========================================================================
    // Outputs
    // =========================================================================

    /// Commit a step's output map. Runner-only write path.
    pub fn record_output(&mut self, step: impl Into<String>, output: JsonMap) {
        self.outputs.insert(step.into(), output);
    }

    /// Whether a step has committed output.
    pub fn has_output(&self, step: &str) -> bool {
        self.outputs.contains_key(step)
    }

    /// A step's full output map.
    pub fn output(&self, step: &str) -> Option<&JsonMap> {
        self.outputs.get(step)
    }

    /// A single key from a step's output.
    pub fn get_output(&self, step: &str, key: &str) -> Option<&Value> {
        self.outputs.get(step).and_then(|o| o.get(key))
    }

    /// Outputs for all steps, keyed by step name.
    pub fn outputs(&self) -> &std::collections::BTreeMap<String, JsonMap> {
        &self.outputs
    }

    /// Serializable snapshot for `WorkflowResult.context_snapshot`.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(params: JsonMap) -> WorkflowContext {
        WorkflowContext::new(Uuid::now_v7(), "test.wf", params)
    }

    #[test]
    fn test_param_access() {
        let mut params = JsonMap::new();
        params.insert("tier".into(), json!("OTC"));
        params.insert("force".into(), json!(true));
        let ctx = ctx_with(params);

        assert_eq!(ctx.str_param("tier"), Some("OTC"));
        assert!(ctx.bool_param("force", false));
        assert!(!ctx.bool_param("absent", false));
        assert!(ctx.get_param("absent").is_none());
    }

    #[test]
    fn test_output_round_trip() {
        let mut ctx = ctx_with(JsonMap::new());
        assert!(!ctx.has_output("ingest"));

        let mut output = JsonMap::new();
        output.insert("records".into(), json!(120));
        ctx.record_output("ingest", output);

        assert!(ctx.has_output("ingest"));
        assert_eq!(ctx.get_output("ingest", "records"), Some(&json!(120)));
        assert_eq!(ctx.get_output("ingest", "missing"), None);
        assert_eq!(ctx.get_output("other", "records"), None);
    }

    #[test]
    fn test_merge_params_last_writer_wins() {
        let mut params = JsonMap::new();
        params.insert("n".into(), json!(1));
        let mut ctx = ctx_with(params);

        let mut updates = JsonMap::new();
        updates.insert("n".into(), json!(2));
        updates.insert("extra".into(), json!("x"));
        ctx.merge_params(updates);

        assert_eq!(ctx.get_param("n"), Some(&json!(2)));
        assert_eq!(ctx.get_param("extra"), Some(&json!("x")));
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut ctx = ctx_with(JsonMap::new());
        let mut output = JsonMap::new();
        output.insert("ok".into(), json!(true));
        ctx.record_output("a", output);

        let snap = ctx.snapshot();
        assert_eq!(snap["workflow_name"], json!("test.wf"));
        assert_eq!(snap["outputs"]["a"]["ok"], json!(true));

        // Snapshot round-trips back into a context
        let restored: WorkflowContext = serde_json::from_value(snap).unwrap();
        assert!(restored.has_output("a"));
    }
}
