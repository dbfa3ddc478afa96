//! Client-facing HTTP surface (spec §4.6). Read-oriented mirror over Store
//! plus the administrative mutations clients are allowed to make.

use crate::error::{MessError, Result};
use crate::lifecycle::AppState;
use crate::models::{Key, TaskId, TaskProperties, TaskRequest, TaskResult, TaskSlice, TaskState};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct NewTaskRequest {
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub parent_task: Option<Key>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub task_slices: Vec<TaskSliceDto>,
}

#[derive(Debug, Deserialize)]
pub struct TaskSliceDto {
    pub properties: TaskProperties,
    pub expiration_secs: u64,
    #[serde(default)]
    pub wait_for_capacity: bool,
}

#[derive(Debug, Serialize)]
pub struct NewTaskResponse {
    pub task_id: String,
}

pub async fn tasks_new(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewTaskRequest>,
) -> Result<Json<NewTaskResponse>> {
    let mut request = TaskRequest {
        schema_version: 1,
        key: 0,
        created: chrono::Utc::now(),
        priority: payload.priority.unwrap_or(crate::constants::PRIORITY_DEFAULT),
        parent_task: payload.parent_task,
        tags: payload.tags,
        task_slices: payload
            .task_slices
            .into_iter()
            .map(|s| TaskSlice {
                properties: s.properties,
                expiration: s.expiration_secs,
                wait_for_capacity: s.wait_for_capacity,
            })
            .collect(),
    };
    request.finalize_tags();

    crate::validation::validate_task_request(&request)?;

    state.store.task_request_add(&mut request).await?;
    state.scheduler.enqueue(&request).await?;

    Ok(Json(NewTaskResponse {
        task_id: TaskId::to_wire(request.key),
    }))
}

fn parse_task_id(raw: &str) -> Result<Key> {
    let key = TaskId::from_wire(raw);
    if key == 0 {
        return Err(MessError::Validation(format!("malformed task id '{raw}'")));
    }
    Ok(key)
}

pub async fn task_cancel(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let key = parse_task_id(&task_id)?;
    let mut result = state
        .store
        .task_result_get(key)
        .await?
        .ok_or_else(|| MessError::NotFound(format!("task {key} unknown")))?;

    match result.state {
        TaskState::Running => {
            result.killing = true;
            result.modified = chrono::Utc::now();
        }
        TaskState::Pending => {
            result.state = TaskState::Canceled;
            result.modified = chrono::Utc::now();
        }
        _ => {}
    }
    state.store.task_result_set(&result).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

pub async fn tasks_count(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let count = state.store.task_request_count().await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// `tasks.list`: the TaskResult mirror (spec §4.6), grounded in
/// `original_source/cmd/mess/webserver_client.go`'s `/tasks/list`, which
/// returns `messapi.TaskResult` items rather than requests.
pub async fn tasks_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskResult>>> {
    let filter = crate::store::TaskResultFilter {
        cursor: query.cursor.and_then(|c| c.parse().ok()),
        limit: query.limit.unwrap_or(100),
        state: crate::store::TaskStateQuery::All,
        sort: crate::store::SortField::Created,
    };
    Ok(Json(state.store.task_result_slice("", &filter).await?))
}

/// `tasks.requests`: the TaskRequest mirror (spec §4.6) — distinct from
/// `tasks.list`, which returns results. Not present in the distilled
/// original (`webserver_client.go` only ever implemented `/tasks/list` and
/// `/tasks/count`), but named explicitly in the expanded operation set.
pub async fn tasks_requests(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskRequest>>> {
    let filter = crate::store::TaskRequestFilter {
        cursor: query.cursor.and_then(|c| c.parse().ok()),
        limit: query.limit.unwrap_or(100),
        start: None,
        end: None,
    };
    Ok(Json(state.store.task_request_slice(&filter).await?))
}

pub async fn task_get_request(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRequest>> {
    let key = parse_task_id(&task_id)?;
    let request = state
        .store
        .task_request_get(key)
        .await?
        .ok_or_else(|| MessError::NotFound(format!("task {key} unknown")))?;
    Ok(Json(request))
}

pub async fn task_get_result(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let key = parse_task_id(&task_id)?;
    match state.store.task_result_get(key).await? {
        Some(result) => Ok(Json(serde_json::to_value(result)?)),
        None => Ok(Json(serde_json::json!({}))),
    }
}

pub async fn task_get_stdout(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Vec<u8>> {
    let key = parse_task_id(&task_id)?;
    state.output_store.read_output(key, 0, 10 * 1024 * 1024).await
}

pub async fn bots_count(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Json<serde_json::Value>> {
    let mut dims = query;
    dims.remove("cursor");
    dims.remove("limit");
    let counts = state.store.bot_count(&dims).await?;
    Ok(Json(serde_json::json!({
        "count": counts.total,
        "quarantined": counts.quarantined,
        "maintenance": counts.maintenance,
        "dead": counts.dead,
        "busy": counts.busy,
    })))
}

pub async fn bots_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<crate::models::Bot>>> {
    Ok(Json(
        state
            .store
            .bot_get_slice(query.cursor, query.limit.unwrap_or(100))
            .await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct StringListPair {
    pub key: String,
    pub value: Vec<String>,
}

/// `bots.dimensions`: the set of dimension keys advertised across the fleet
/// and, per key, the union of values seen on any non-deleted bot. Grounded
/// in `original_source/cmd/mess/webserver_client.go`'s `/bots/dimensions`
/// (`messapi.BotsDimensionsResponse`), which the original left as a TODO
/// stub returning an empty list; this aggregates the live fleet instead.
pub async fn bots_dimensions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StringListPair>>> {
    let bots = state.store.bot_get_slice(None, 0).await?;
    let mut by_key: BTreeMap<String, std::collections::BTreeSet<String>> = BTreeMap::new();
    for bot in &bots {
        for (key, values) in &bot.dimensions {
            by_key.entry(key.clone()).or_default().extend(values.iter().cloned());
        }
    }
    Ok(Json(
        by_key
            .into_iter()
            .map(|(key, values)| StringListPair {
                key,
                value: values.into_iter().collect(),
            })
            .collect(),
    ))
}

pub async fn bot_get(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> Result<Json<crate::models::Bot>> {
    state
        .store
        .bot_get(&bot_id)
        .await?
        .map(Json)
        .ok_or_else(|| MessError::NotFound(format!("bot {bot_id} unknown")))
}

pub async fn bot_events(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<crate::models::BotEvent>>> {
    let filter = crate::store::BotEventFilter {
        cursor: query.cursor.and_then(|c| c.parse().ok()),
        limit: query.limit.unwrap_or(100),
    };
    Ok(Json(state.store.bot_event_get_slice(&bot_id, &filter).await?))
}

pub async fn bot_tasks(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<crate::models::TaskResult>>> {
    let filter = crate::store::TaskResultFilter {
        cursor: query.cursor.and_then(|c| c.parse().ok()),
        limit: query.limit.unwrap_or(100),
        state: crate::store::TaskStateQuery::All,
        sort: crate::store::SortField::Created,
    };
    Ok(Json(state.store.task_result_slice(&bot_id, &filter).await?))
}

pub async fn bot_delete(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let mut bot = state
        .store
        .bot_get(&bot_id)
        .await?
        .ok_or_else(|| MessError::NotFound(format!("bot {bot_id} unknown")))?;
    bot.deleted = true;
    bot.dead = true;
    state.store.bot_set(&bot).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Injects a synthetic terminate task the target bot will pick up on its
/// next poll and use to exit (spec §4.6).
pub async fn bot_terminate(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> Result<Json<NewTaskResponse>> {
    state
        .store
        .bot_get(&bot_id)
        .await?
        .ok_or_else(|| MessError::NotFound(format!("bot {bot_id} unknown")))?;

    let mut request = TaskRequest {
        schema_version: 1,
        key: 0,
        created: chrono::Utc::now(),
        priority: crate::constants::PRIORITY_MIN,
        parent_task: None,
        tags: vec![format!("terminate:{bot_id}")],
        task_slices: vec![TaskSlice {
            properties: TaskProperties {
                command: vec!["__terminate__".to_string()],
                relative_wd: String::new(),
                caches: vec![],
                cas_host: String::new(),
                input: None,
                cipd_host: String::new(),
                cipd_client: String::new(),
                cipd_packages: vec![],
                dimensions: BTreeMap::from([("id".to_string(), bot_id.clone())]),
                env: BTreeMap::new(),
                env_prefixes: BTreeMap::new(),
                hard_timeout: 60,
                grace_period: 5,
                io_timeout: 60,
                secret_bytes: vec![],
                idempotent: false,
                outputs: vec![],
                containment: None,
            },
            expiration: 60,
            wait_for_capacity: false,
        }],
    };
    request.finalize_tags();

    state.store.task_request_add(&mut request).await?;
    state.scheduler.enqueue(&request).await?;

    Ok(Json(NewTaskResponse {
        task_id: TaskId::to_wire(request.key),
    }))
}
