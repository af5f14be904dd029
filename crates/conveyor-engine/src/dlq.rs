//! Dead-letter queue service
//!
//! Read and replay terminal failures captured by the dispatcher. Replay
//! resubmits the original params as a new run linked via
//! `retry_of_run_id`; the entry stays in the queue as an audit record
//! with `replayed_as_run_id` set.

use std::sync::Arc;

use uuid::Uuid;

use conveyor_core::dead_letter::DeadLetter;
use conveyor_core::error::CoreError;
use conveyor_storage::{CoreStore, DeadLetterFilter, Page, Pagination};

use crate::dispatcher::Dispatcher;

/// Operator-facing dead-letter queue.
pub struct DeadLetterQueue {
    store: Arc<dyn CoreStore>,
    dispatcher: Arc<Dispatcher>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn CoreStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub async fn get(&self, dlq_id: Uuid) -> Result<Option<DeadLetter>, CoreError> {
        Ok(self.store.get_dead_letter(dlq_id).await?)
    }

    pub async fn list(
        &self,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Page<DeadLetter>, CoreError> {
        Ok(self.store.list_dead_letters(filter, page).await?)
    }

    /// Replay an entry. Returns the new run's ID; the entry is kept.
    pub async fn replay(&self, dlq_id: Uuid) -> Result<Uuid, CoreError> {
        self.dispatcher.replay_dead_letter(dlq_id).await
    }
}
