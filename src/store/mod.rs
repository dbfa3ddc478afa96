//! Durable storage (spec §4.1): one operation set, two backends.

pub mod memory;
pub mod sql;

use crate::error::Result;
use crate::models::{Bot, BotEvent, Key, TaskRequest, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStateQuery {
    All,
    Pending,
    Running,
    PendingRunning,
    Completed,
    CompletedSuccess,
    CompletedFailure,
    Expired,
    Timedout,
    BotDied,
    Canceled,
    Deduped,
    Killed,
    NoResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Created,
    Modified,
    Completed,
    Abandoned,
    Started,
}

#[derive(Debug, Clone, Default)]
pub struct TaskRequestFilter {
    pub cursor: Option<Key>,
    pub limit: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TaskResultFilter {
    pub cursor: Option<Key>,
    pub limit: usize,
    pub state: TaskStateQuery,
    pub sort: SortField,
}

impl Default for TaskResultFilter {
    fn default() -> Self {
        TaskResultFilter {
            cursor: None,
            limit: 100,
            state: TaskStateQuery::All,
            sort: SortField::Created,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BotEventFilter {
    pub cursor: Option<Key>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BotCounts {
    pub total: u64,
    pub quarantined: u64,
    pub maintenance: u64,
    pub dead: u64,
    pub busy: u64,
}

/// The operation set spec §4.1 requires, identical in semantics across
/// backends. Every read returns a deep copy: callers are free to mutate
/// what they get back without corrupting the store's own state.
#[async_trait]
pub trait Store: Send + Sync {
    /// `r.key` must be 0 on entry. Assigns the next monotonic key into `r`
    /// and persists it. Fails with `Conflict` if `r.key != 0`.
    async fn task_request_add(&self, r: &mut TaskRequest) -> Result<()>;
    async fn task_request_get(&self, key: Key) -> Result<Option<TaskRequest>>;
    async fn task_request_slice(&self, filter: &TaskRequestFilter) -> Result<Vec<TaskRequest>>;
    async fn task_request_count(&self) -> Result<u64>;

    async fn task_result_get(&self, key: Key) -> Result<Option<TaskResult>>;
    /// Upsert; preserves `key`. Callers are expected to hold the scheduling
    /// invariants described in spec §5 before calling this.
    async fn task_result_set(&self, result: &TaskResult) -> Result<()>;
    async fn task_result_slice(
        &self,
        bot_id: &str,
        filter: &TaskResultFilter,
    ) -> Result<Vec<TaskResult>>;

    async fn bot_get(&self, id: &str) -> Result<Option<Bot>>;
    async fn bot_set(&self, bot: &Bot) -> Result<()>;
    async fn bot_count(&self, dimensions: &std::collections::BTreeMap<String, String>) -> Result<BotCounts>;
    async fn bot_get_slice(&self, cursor: Option<String>, limit: usize) -> Result<Vec<Bot>>;

    /// `e.key` must be 0 on entry. Assigns the next globally monotonic key.
    async fn bot_event_add(&self, e: &mut BotEvent) -> Result<()>;
    async fn bot_event_get_slice(
        &self,
        bot_id: &str,
        filter: &BotEventFilter,
    ) -> Result<Vec<BotEvent>>;

    /// Durably persists current state. Fatal on failure (spec §4.1, §7).
    async fn snapshot(&self) -> Result<()>;
    /// Final snapshot semantics, then releases any backend resources.
    async fn close(&self) -> Result<()>;
}

fn matches_state(state: crate::models::TaskState, query: TaskStateQuery) -> bool {
    use crate::models::TaskState as S;
    use TaskStateQuery as Q;
    match query {
        Q::All => true,
        Q::Pending => state == S::Pending,
        Q::Running => state == S::Running,
        Q::PendingRunning => matches!(state, S::Pending | S::Running),
        Q::Completed => state == S::Completed,
        Q::CompletedSuccess => state == S::Completed,
        Q::CompletedFailure => state == S::Completed,
        Q::Expired => state == S::Expired,
        Q::Timedout => state == S::Timedout,
        Q::BotDied => state == S::BotDied,
        Q::Canceled => state == S::Canceled,
        Q::Deduped => false,
        Q::Killed => state == S::Killed,
        Q::NoResource => state == S::NoResource,
    }
}

pub(crate) fn matches_task_result_state(result: &TaskResult, query: TaskStateQuery) -> bool {
    match query {
        TaskStateQuery::CompletedSuccess => {
            result.state == crate::models::TaskState::Completed
                && result.exit_code == Some(0)
                && !result.internal_failure
        }
        TaskStateQuery::CompletedFailure => {
            result.state == crate::models::TaskState::Completed
                && (result.exit_code != Some(0) || result.internal_failure)
        }
        TaskStateQuery::Deduped => result.deduped_from.is_some(),
        other => matches_state(result.state, other),
    }
}
