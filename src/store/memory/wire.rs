//! On-disk shape of the memory-backend snapshot (spec §6).
//!
//! Top-level entity fields use short, stable single-letter JSON names to
//! keep `db.json.zst` small; nested substructures (TaskProperties, TaskSlice,
//! Bot dimensions, ...) keep their descriptive names since they dominate a
//! task's encoded size far less than the entity-to-entity overhead the
//! short tags are aimed at. Unknown fields are rejected on load (`deny
//! unknown_fields`) so a stray or renamed field fails loudly at startup
//! instead of silently vanishing.

use crate::models::{Bot, BotEvent, Key, TaskRequest, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireTaskRequest {
    pub v: u32,
    pub k: Key,
    pub c: chrono::DateTime<chrono::Utc>,
    pub p: u8,
    pub pt: Option<Key>,
    pub t: Vec<String>,
    pub s: Vec<crate::models::TaskSlice>,
}

impl From<&TaskRequest> for WireTaskRequest {
    fn from(r: &TaskRequest) -> Self {
        WireTaskRequest {
            v: r.schema_version,
            k: r.key,
            c: r.created,
            p: r.priority,
            pt: r.parent_task,
            t: r.tags.clone(),
            s: r.task_slices.clone(),
        }
    }
}

impl From<WireTaskRequest> for TaskRequest {
    fn from(w: WireTaskRequest) -> Self {
        TaskRequest {
            schema_version: w.v,
            key: w.k,
            created: w.c,
            priority: w.p,
            parent_task: w.pt,
            tags: w.t,
            task_slices: w.s,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireTaskResult {
    pub v: u32,
    pub k: Key,
    pub b: String,
    pub st: crate::models::TaskState,
    pub cs: usize,
    pub ec: Option<i32>,
    pub ifl: bool,
    pub df: Option<Key>,
    pub ch: Vec<Key>,
    pub o: Option<crate::models::Digest>,
    pub cu: String,
    pub cp: Vec<crate::models::CipdPackage>,
    pub rdb: crate::models::ResultDb,
    pub d: Option<f64>,
    pub sta: Option<chrono::DateTime<chrono::Utc>>,
    pub com: Option<chrono::DateTime<chrono::Utc>>,
    pub ab: Option<chrono::DateTime<chrono::Utc>>,
    pub m: chrono::DateTime<chrono::Utc>,
    pub cost: f64,
    pub kil: bool,
    pub da: Option<chrono::DateTime<chrono::Utc>>,
    pub bd: std::collections::BTreeMap<String, Vec<String>>,
    pub bis: Option<chrono::DateTime<chrono::Utc>>,
    pub sv: Vec<String>,
}

impl From<&TaskResult> for WireTaskResult {
    fn from(r: &TaskResult) -> Self {
        WireTaskResult {
            v: r.schema_version,
            k: r.key,
            b: r.bot_id.clone(),
            st: r.state,
            cs: r.current_task_slice,
            ec: r.exit_code,
            ifl: r.internal_failure,
            df: r.deduped_from,
            ch: r.children.clone(),
            o: r.output.clone(),
            cu: r.cipd_client_used.clone(),
            cp: r.cipd_pins.clone(),
            rdb: r.result_db.clone(),
            d: r.duration,
            sta: r.started,
            com: r.completed,
            ab: r.abandoned,
            m: r.modified,
            cost: r.cost,
            kil: r.killing,
            da: r.dead_after,
            bd: r.bot_dimensions.clone(),
            bis: r.bot_idle_since,
            sv: r.server_versions.clone(),
        }
    }
}

impl From<WireTaskResult> for TaskResult {
    fn from(w: WireTaskResult) -> Self {
        TaskResult {
            schema_version: w.v,
            key: w.k,
            bot_id: w.b,
            state: w.st,
            current_task_slice: w.cs,
            exit_code: w.ec,
            internal_failure: w.ifl,
            deduped_from: w.df,
            children: w.ch,
            output: w.o,
            cipd_client_used: w.cu,
            cipd_pins: w.cp,
            result_db: w.rdb,
            duration: w.d,
            started: w.sta,
            completed: w.com,
            abandoned: w.ab,
            modified: w.m,
            cost: w.cost,
            killing: w.kil,
            dead_after: w.da,
            bot_dimensions: w.bd,
            bot_idle_since: w.bis,
            server_versions: w.sv,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireBot {
    pub v: u32,
    pub id: String,
    pub c: chrono::DateTime<chrono::Utc>,
    pub ls: chrono::DateTime<chrono::Utc>,
    pub ver: String,
    pub auth: String,
    pub ip: String,
    pub dim: std::collections::BTreeMap<String, Vec<String>>,
    pub st: serde_json::Value,
    pub tid: Key,
    pub qm: String,
    pub mm: String,
    pub dead: bool,
    pub del: bool,
}

impl From<&Bot> for WireBot {
    fn from(b: &Bot) -> Self {
        WireBot {
            v: b.schema_version,
            id: b.id.clone(),
            c: b.created,
            ls: b.last_seen,
            ver: b.version.clone(),
            auth: b.authenticated_as.clone(),
            ip: b.external_ip.clone(),
            dim: b.dimensions.clone(),
            st: b.state.clone(),
            tid: b.task_id,
            qm: b.quarantined_msg.clone(),
            mm: b.maintenance_msg.clone(),
            dead: b.dead,
            del: b.deleted,
        }
    }
}

impl From<WireBot> for Bot {
    fn from(w: WireBot) -> Self {
        Bot {
            schema_version: w.v,
            id: w.id,
            created: w.c,
            last_seen: w.ls,
            version: w.ver,
            authenticated_as: w.auth,
            external_ip: w.ip,
            dimensions: w.dim,
            state: w.st,
            task_id: w.tid,
            quarantined_msg: w.qm,
            maintenance_msg: w.mm,
            dead: w.dead,
            deleted: w.del,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireBotEvent {
    pub v: u32,
    pub k: Key,
    pub b: String,
    pub t: chrono::DateTime<chrono::Utc>,
    pub e: String,
    pub msg: String,
    pub ver: String,
    pub auth: String,
    pub dim: std::collections::BTreeMap<String, Vec<String>>,
    pub st: serde_json::Value,
    pub ip: String,
    pub tid: Key,
    pub qm: String,
    pub mm: String,
}

impl From<&BotEvent> for WireBotEvent {
    fn from(e: &BotEvent) -> Self {
        WireBotEvent {
            v: e.schema_version,
            k: e.key,
            b: e.bot_id.clone(),
            t: e.time,
            e: e.event.clone(),
            msg: e.message.clone(),
            ver: e.version.clone(),
            auth: e.authenticated_as.clone(),
            dim: e.dimensions.clone(),
            st: e.state.clone(),
            ip: e.external_ip.clone(),
            tid: e.task_id,
            qm: e.quarantined_msg.clone(),
            mm: e.maintenance_msg.clone(),
        }
    }
}

impl From<WireBotEvent> for BotEvent {
    fn from(w: WireBotEvent) -> Self {
        BotEvent {
            schema_version: w.v,
            key: w.k,
            bot_id: w.b,
            time: w.t,
            event: w.e,
            message: w.msg,
            version: w.ver,
            authenticated_as: w.auth,
            dimensions: w.dim,
            state: w.st,
            external_ip: w.ip,
            task_id: w.tid,
            quarantined_msg: w.qm,
            maintenance_msg: w.mm,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotDoc {
    #[serde(rename = "TasksRequest")]
    pub tasks_request: HashMap<Key, WireTaskRequest>,
    #[serde(rename = "TasksResult")]
    pub tasks_result: HashMap<Key, WireTaskResult>,
    #[serde(rename = "Bots")]
    pub bots: HashMap<String, WireBot>,
    #[serde(rename = "BotEvents")]
    pub bot_events: HashMap<String, Vec<WireBotEvent>>,
}
