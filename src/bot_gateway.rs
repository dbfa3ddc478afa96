//! Bot-facing HTTP surface (spec §4.5). BotGateway is the sole writer of
//! Bot, BotEvent, and in-flight TaskResult records.

use crate::error::{MessError, Result};
use crate::lifecycle::AppState;
use crate::models::{Bot, BotEvent, Digest, Key, TaskId, TaskResult, TaskState};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const BOT_ID_HEADER: &str = "x-luci-swarming-bot-id";

fn bot_id_from_header(headers: &HeaderMap) -> Result<String> {
    headers
        .get(BOT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| MessError::Validation(format!("missing {BOT_ID_HEADER} header")))
}

pub async fn server_ping() -> &'static str {
    "Server Up"
}

pub async fn bot_code_redirect(State(state): State<Arc<AppState>>) -> Result<Response> {
    let built = state.bot_bundle.get_bot_zip(&state.external_url)?;
    Ok(Redirect::to(&format!("bot_code/{}", built.version)).into_response())
}

pub async fn bot_code_get(
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
) -> Result<Response> {
    let built = state.bot_bundle.get_bot_zip(&state.external_url)?;
    if version != built.version {
        return Ok(Redirect::to(&format!("../bot_code/{}", built.version)).into_response());
    }
    Ok((
        StatusCode::OK,
        [("content-type", "application/octet-stream")],
        built.bytes.clone(),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct HandshakeRequest {
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub state: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct HandshakeResponse {
    pub server_version: String,
    pub bot_version: String,
    pub bot_group_cfg_version: String,
}

fn resolve_bot_id(headers: &HeaderMap, handshake: Option<&HandshakeRequest>) -> Result<String> {
    if let Ok(id) = bot_id_from_header(headers) {
        return Ok(id);
    }
    if let Some(h) = handshake {
        if let Some(values) = h.dimensions.get("id") {
            if values.len() == 1 {
                return Ok(values[0].clone());
            }
        }
    }
    Err(MessError::Validation(
        "bot id not present in header or handshake dimensions".to_string(),
    ))
}

pub async fn handshake(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>> {
    let bot_id = resolve_bot_id(&headers, Some(&payload))?;
    let now = chrono::Utc::now();

    let mut bot = state
        .store
        .bot_get(&bot_id)
        .await?
        .unwrap_or_else(|| Bot {
            schema_version: 1,
            id: bot_id.clone(),
            created: now,
            last_seen: now,
            version: String::new(),
            authenticated_as: String::new(),
            external_ip: String::new(),
            dimensions: BTreeMap::new(),
            state: serde_json::Value::Null,
            task_id: 0,
            quarantined_msg: String::new(),
            maintenance_msg: String::new(),
            dead: false,
            deleted: false,
        });

    bot.last_seen = now;
    bot.version = payload.version.clone();
    bot.dimensions = payload.dimensions.clone();
    bot.state = payload.state.clone();
    state.store.bot_set(&bot).await?;

    let mut event = BotEvent::snapshot_from(&bot, "handshake", "");
    state.store.bot_event_add(&mut event).await?;

    Ok(Json(HandshakeResponse {
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        bot_version: payload.version,
        bot_group_cfg_version: state.config_version.clone(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PollRequest {
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub state: serde_json::Value,
    #[serde(default)]
    pub external_ip: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd")]
pub enum PollResponse {
    #[serde(rename = "run")]
    Run { manifest: TaskManifest },
    #[serde(rename = "sleep")]
    Sleep { duration: u64 },
    #[serde(rename = "update")]
    Update,
}

#[derive(Debug, Serialize)]
pub struct TaskManifest {
    pub task_id: String,
    pub command: Vec<String>,
    pub relative_cwd: String,
    pub dimensions: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub hard_timeout: u64,
    pub grace_period: u64,
    pub io_timeout: u64,
    pub caches: Vec<crate::models::Cache>,
    pub cipd_packages: Vec<crate::models::CipdPackage>,
    pub cas_root: Option<Digest>,
    pub outputs: Vec<String>,
}

pub async fn poll(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PollRequest>,
) -> Result<Json<PollResponse>> {
    let bot_id = bot_id_from_header(&headers)?;
    let now = chrono::Utc::now();

    let mut bot = state
        .store
        .bot_get(&bot_id)
        .await?
        .ok_or_else(|| MessError::NotFound(format!("bot {bot_id} unknown; handshake first")))?;

    let current_version = state.bot_bundle.get_bot_zip(&state.external_url)?.version.clone();
    let bot_stale = payload.version != current_version;

    bot.last_seen = now;
    bot.version = payload.version;
    bot.dimensions = payload.dimensions;
    bot.state = payload.state;
    bot.external_ip = payload.external_ip;
    state.store.bot_set(&bot).await?;

    // A bot running a stale bundle is told to self-update before it's ever
    // handed work, matching spec §4.5/§6's `cmd=update` branch; it does not
    // enter the scheduler's waiting set for this poll.
    if bot_stale {
        return Ok(Json(PollResponse::Update));
    }

    let dispatched = state.scheduler.poll(&bot, &state.shutdown_token).await;

    match dispatched {
        Some(request) => {
            bot.task_id = request.key;
            state.store.bot_set(&bot).await?;
            let slice = &request.task_slices[0];
            Ok(Json(PollResponse::Run {
                manifest: TaskManifest {
                    task_id: TaskId::to_wire(request.key),
                    command: slice.properties.command.clone(),
                    relative_cwd: slice.properties.relative_wd.clone(),
                    dimensions: slice.properties.dimensions.clone(),
                    env: slice.properties.env.clone(),
                    env_prefixes: slice.properties.env_prefixes.clone(),
                    hard_timeout: slice.properties.hard_timeout,
                    grace_period: slice.properties.grace_period,
                    io_timeout: slice.properties.io_timeout,
                    caches: slice.properties.caches.clone(),
                    cipd_packages: slice.properties.cipd_packages.clone(),
                    cas_root: slice.properties.input.clone(),
                    outputs: slice.properties.outputs.clone(),
                },
            }))
        }
        None => Ok(Json(PollResponse::Sleep { duration: 10 })),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub event: String,
    #[serde(default)]
    pub message: String,
}

pub async fn event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<EventRequest>,
) -> Result<Json<serde_json::Value>> {
    let bot_id = bot_id_from_header(&headers)?;
    let bot = state
        .store
        .bot_get(&bot_id)
        .await?
        .ok_or_else(|| MessError::NotFound(format!("bot {bot_id} unknown")))?;
    let mut ev = BotEvent::snapshot_from(&bot, payload.event, payload.message);
    state.store.bot_event_add(&mut ev).await?;
    Ok(Json(serde_json::json!({})))
}

pub async fn oauth_token() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "service_account": "none", "access_token": "", "expires_in": 0 }))
}

#[derive(Debug, Deserialize)]
pub struct TaskUpdateRequest {
    pub task_id: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub output_chunk_start: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub cas_output_root: Option<Digest>,
    #[serde(default)]
    pub cipd_pins: Vec<crate::models::CipdPackage>,
    #[serde(default)]
    pub finished: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskUpdateResponse {
    pub ok: bool,
    pub must_stop: bool,
}

pub async fn task_update(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TaskUpdateRequest>,
) -> Result<Json<TaskUpdateResponse>> {
    let key: Key = TaskId::from_wire(&payload.task_id);
    if key == 0 {
        return Err(MessError::Validation("malformed task_id".to_string()));
    }

    if let Some(chunk) = &payload.output {
        state
            .output_store
            .set_output(key, payload.output_chunk_start, chunk.as_bytes())
            .await?;
    }

    let mut result = state
        .store
        .task_result_get(key)
        .await?
        .ok_or_else(|| MessError::NotFound(format!("task {key} unknown")))?;

    let now = chrono::Utc::now();
    result.modified = now;
    result.cost = payload.cost_usd;
    if let Some(exit_code) = payload.exit_code {
        result.exit_code = Some(exit_code);
    }
    if let Some(duration) = payload.duration {
        result.duration = Some(duration);
    }
    if let Some(digest) = payload.cas_output_root {
        result.output = Some(digest);
    }
    if !payload.cipd_pins.is_empty() {
        result.cipd_pins = payload.cipd_pins;
    }

    let must_stop = result.killing;

    if payload.finished {
        result.completed = Some(now);
        result.state = if result.killing {
            TaskState::Killed
        } else {
            TaskState::Completed
        };
    }

    state.store.task_result_set(&result).await?;

    Ok(Json(TaskUpdateResponse { ok: true, must_stop }))
}

#[derive(Debug, Deserialize)]
pub struct TaskErrorRequest {
    pub task_id: String,
    #[serde(default)]
    pub message: String,
}

pub async fn task_error(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<TaskErrorRequest>,
) -> Result<Json<serde_json::Value>> {
    let bot_id = bot_id_from_header(&headers)?;
    let bot = state
        .store
        .bot_get(&bot_id)
        .await?
        .ok_or_else(|| MessError::NotFound(format!("bot {bot_id} unknown")))?;
    let mut ev = BotEvent::snapshot_from(&bot, "task_error", payload.message.clone());
    state.store.bot_event_add(&mut ev).await?;

    let key = TaskId::from_wire(&payload.task_id);
    if key != 0 {
        if let Some(mut result) = state.store.task_result_get(key).await? {
            if result.state == TaskState::Running {
                result.state = TaskState::BotDied;
                result.modified = chrono::Utc::now();
                state.store.task_result_set(&result).await?;
            }
        }
    }

    Ok(Json(serde_json::json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_bot_id_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(BOT_ID_HEADER, "bot-1".parse().unwrap());
        assert_eq!(resolve_bot_id(&headers, None).unwrap(), "bot-1");
    }

    #[test]
    fn resolve_bot_id_falls_back_to_handshake_dimensions() {
        let headers = HeaderMap::new();
        let mut dims = BTreeMap::new();
        dims.insert("id".to_string(), vec!["bot-2".to_string()]);
        let handshake = HandshakeRequest {
            dimensions: dims,
            version: String::new(),
            state: serde_json::Value::Null,
        };
        assert_eq!(resolve_bot_id(&headers, Some(&handshake)).unwrap(), "bot-2");
    }

    #[test]
    fn resolve_bot_id_rejects_ambiguous_dimensions() {
        let headers = HeaderMap::new();
        let mut dims = BTreeMap::new();
        dims.insert("id".to_string(), vec!["bot-2".to_string(), "bot-3".to_string()]);
        let handshake = HandshakeRequest {
            dimensions: dims,
            version: String::new(),
            state: serde_json::Value::Null,
        };
        assert!(resolve_bot_id(&headers, Some(&handshake)).is_err());
    }
}
