//! Dead-letter operations

use uuid::Uuid;

use conveyor_core::dead_letter::DeadLetter;
use conveyor_storage::{DeadLetterFilter, Pagination};

use crate::app::App;
use crate::envelope::{OpResult, Paging};
use crate::requests::ListDeadLettersRequest;
use crate::responses::RunAccepted;

pub async fn list_dead_letters(
    app: &App,
    req: ListDeadLettersRequest,
) -> OpResult<Vec<DeadLetter>> {
    let filter = DeadLetterFilter {
        name: req.name,
        replayed: req.replayed,
    };
    let pagination = Pagination::new(req.limit, req.offset);
    match app.dlq.list(&filter, pagination).await {
        Ok(page) => {
            let paging = Paging::from_page(&page, pagination);
            OpResult::ok_paged(page.items, paging)
        }
        Err(err) => err.into(),
    }
}

pub async fn get_dead_letter(app: &App, dlq_id: Uuid) -> OpResult<DeadLetter> {
    match app.dlq.get(dlq_id).await {
        Ok(Some(entry)) => OpResult::ok(entry),
        Ok(None) => OpResult::err("not_found", format!("dead letter not found: {dlq_id}")),
        Err(err) => err.into(),
    }
}

/// Replay a dead-letter entry as a fresh run. The entry is retained
/// with `replayed_as_run_id` set.
pub async fn replay_dead_letter(app: &App, dlq_id: Uuid) -> OpResult<RunAccepted> {
    match app.dlq.replay(dlq_id).await {
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
