//! Workflow operations

use conveyor_core::run::WorkSpec;

use crate::app::App;
use crate::envelope::OpResult;
use crate::requests::RunWorkflowRequest;
use crate::responses::{RunAccepted, WorkflowDetail, WorkflowSummary};

pub async fn list_workflows(app: &App) -> OpResult<Vec<WorkflowSummary>> {
    let summaries = app
        .workflows
        .names()
        .into_iter()
        .filter_map(|name| app.workflows.get(&name))
        .map(|workflow| WorkflowSummary {
            name: workflow.name.clone(),
            mode: workflow.policy.mode,
            step_count: workflow.steps.len(),
        })
        .collect();
    OpResult::ok(summaries)
}

pub async fn get_workflow(app: &App, name: &str) -> OpResult<WorkflowDetail> {
    match app.workflows.get(name) {
        Some(workflow) => OpResult::ok(WorkflowDetail::from(workflow.as_ref())),
        None => OpResult::err("not_found", format!("workflow not found: {name}")),
    }
}

/// Submit a registered workflow for execution.
pub async fn run_workflow(app: &App, req: RunWorkflowRequest) -> OpResult<RunAccepted> {
    if !app.workflows.contains(&req.name) {
        return OpResult::err("not_found", format!("workflow not found: {}", req.name));
    }

    let mut spec = WorkSpec::workflow(req.name)
        .with_params(req.params)
        .with_max_retries(app.config.dlq_max_retries);
    if let Some(key) = req.idempotency_key {
        spec = spec.with_idempotency_key(key);
    }
    if req.dry_run {
        spec.metadata
            .insert("dry_run".to_string(), serde_json::Value::Bool(true));
    }
    if let Some(start_from) = req.start_from {
        spec.metadata.insert(
            "start_from".to_string(),
            serde_json::Value::String(start_from),
        );
    }

    match app.dispatcher.submit(spec).await {
        Ok(run_id) => match app.dispatcher.get(run_id).await {
            Ok(Some(run)) => OpResult::ok(RunAccepted {
                run_id,
                status: run.status,
            }),
            Ok(None) => OpResult::err("not_found", format!("run not found: {run_id}")),
            Err(err) => err.into(),
        },
        Err(err) => err.into(),
    }
}
