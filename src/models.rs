//! Persistent entities (spec §3). Field shapes here are the in-process
//! representation shared by both Store backends; the on-disk single-letter
//! tags used by the memory backend's JSON snapshot live in
//! `store::memory::wire`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Key = u64;

/// Content digest for CAS-addressed blobs (spec §3 Properties.Input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub size: u64,
    /// 32-byte hash, hex-encoded.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipdPackage {
    pub path: String,
    pub package_name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainmentType {
    None,
    Auto,
    Job,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Containment {
    pub containment_type: ContainmentType,
    pub limit_processes: u32,
    pub limit_total_committed_memory: u64,
}

/// Opaque build-provenance token, carried through unmodified.
///
/// Present in the original schema this spec was distilled from; not
/// exercised by any operation here beyond round-tripping through the Store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildToken {
    pub bucket: String,
    pub build_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProperties {
    pub command: Vec<String>,
    #[serde(default)]
    pub relative_wd: String,
    #[serde(default)]
    pub caches: Vec<Cache>,
    #[serde(default)]
    pub cas_host: String,
    pub input: Option<Digest>,
    #[serde(default)]
    pub cipd_host: String,
    #[serde(default)]
    pub cipd_client: String,
    #[serde(default)]
    pub cipd_packages: Vec<CipdPackage>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    /// seconds, [1, 7d+10s]
    pub hard_timeout: u64,
    pub grace_period: u64,
    pub io_timeout: u64,
    /// write-only: never echoed back by any read operation.
    #[serde(default, skip_serializing)]
    pub secret_bytes: Vec<u8>,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub containment: Option<Containment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSlice {
    pub properties: TaskProperties,
    /// seconds, [1, 3d+1m]
    pub expiration: u64,
    #[serde(default)]
    pub wait_for_capacity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub schema_version: u32,
    /// 0 until admitted by Store::task_request_add, which assigns it.
    pub key: Key,
    pub created: chrono::DateTime<chrono::Utc>,
    pub priority: u8,
    pub parent_task: Option<Key>,
    /// sorted, deduplicated `k:v` strings.
    pub tags: Vec<String>,
    pub task_slices: Vec<TaskSlice>,
}

impl TaskRequest {
    /// Augments `tags` with every slice's dimensions, sorted and deduplicated,
    /// per spec §3 ("augmented on validation").
    pub fn finalize_tags(&mut self) {
        let mut tags: std::collections::BTreeSet<String> = self.tags.drain(..).collect();
        for slice in &self.task_slices {
            for (k, v) in &slice.properties.dimensions {
                tags.insert(format!("{k}:{v}"));
            }
        }
        self.tags = tags.into_iter().collect();
    }

    pub fn total_expiration_through(&self, slice_index: usize) -> u64 {
        self.task_slices[..=slice_index]
            .iter()
            .map(|s| s.expiration)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Pending,
    Expired,
    Timedout,
    BotDied,
    Canceled,
    Completed,
    Killed,
    NoResource,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Expired
                | TaskState::Timedout
                | TaskState::BotDied
                | TaskState::Canceled
                | TaskState::Completed
                | TaskState::Killed
                | TaskState::NoResource
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultDb {
    pub host: String,
    pub invocation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub schema_version: u32,
    pub key: Key,
    #[serde(default)]
    pub bot_id: String,
    pub state: TaskState,
    pub current_task_slice: usize,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub internal_failure: bool,
    pub deduped_from: Option<Key>,
    #[serde(default)]
    pub children: Vec<Key>,
    pub output: Option<Digest>,
    #[serde(default)]
    pub cipd_client_used: String,
    #[serde(default)]
    pub cipd_pins: Vec<CipdPackage>,
    #[serde(default)]
    pub result_db: ResultDb,
    pub duration: Option<f64>,
    pub started: Option<chrono::DateTime<chrono::Utc>>,
    pub completed: Option<chrono::DateTime<chrono::Utc>>,
    pub abandoned: Option<chrono::DateTime<chrono::Utc>>,
    pub modified: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub killing: bool,
    pub dead_after: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub bot_dimensions: BTreeMap<String, Vec<String>>,
    pub bot_idle_since: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub server_versions: Vec<String>,
}

impl TaskResult {
    pub fn new_pending(key: Key) -> Self {
        let now = chrono::Utc::now();
        TaskResult {
            schema_version: 1,
            key,
            bot_id: String::new(),
            state: TaskState::Pending,
            current_task_slice: 0,
            exit_code: None,
            internal_failure: false,
            deduped_from: None,
            children: Vec::new(),
            output: None,
            cipd_client_used: String::new(),
            cipd_pins: Vec::new(),
            result_db: ResultDb::default(),
            duration: None,
            started: None,
            completed: None,
            abandoned: None,
            modified: now,
            cost: 0.0,
            killing: false,
            dead_after: None,
            bot_dimensions: BTreeMap::new(),
            bot_idle_since: None,
            server_versions: Vec::new(),
        }
    }
}

pub const BOT_DEAD_AFTER_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub schema_version: u32,
    pub id: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub authenticated_as: String,
    #[serde(default)]
    pub external_ip: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub state: serde_json::Value,
    /// 0 means unassigned.
    #[serde(default)]
    pub task_id: Key,
    #[serde(default)]
    pub quarantined_msg: String,
    #[serde(default)]
    pub maintenance_msg: String,
    #[serde(default)]
    pub dead: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Bot {
    pub fn is_dead(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        (now - self.last_seen).num_seconds() > BOT_DEAD_AFTER_SECS
    }

    pub fn is_busy(&self) -> bool {
        self.task_id != 0
    }

    pub fn is_quarantined(&self) -> bool {
        !self.quarantined_msg.is_empty()
    }

    pub fn is_in_maintenance(&self) -> bool {
        !self.maintenance_msg.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEvent {
    pub schema_version: u32,
    /// 0 until admitted by Store::bot_event_add.
    pub key: Key,
    pub bot_id: String,
    pub time: chrono::DateTime<chrono::Utc>,
    pub event: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub authenticated_as: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub state: serde_json::Value,
    #[serde(default)]
    pub external_ip: String,
    #[serde(default)]
    pub task_id: Key,
    #[serde(default)]
    pub quarantined_msg: String,
    #[serde(default)]
    pub maintenance_msg: String,
}

impl BotEvent {
    pub fn snapshot_from(bot: &Bot, event: impl Into<String>, message: impl Into<String>) -> Self {
        BotEvent {
            schema_version: 1,
            key: 0,
            bot_id: bot.id.clone(),
            time: chrono::Utc::now(),
            event: event.into(),
            message: message.into(),
            version: bot.version.clone(),
            authenticated_as: bot.authenticated_as.clone(),
            dimensions: bot.dimensions.clone(),
            state: bot.state.clone(),
            external_ip: bot.external_ip.clone(),
            task_id: bot.task_id,
            quarantined_msg: bot.quarantined_msg.clone(),
            maintenance_msg: bot.maintenance_msg.clone(),
        }
    }
}

/// External string form of a task Key (spec §3 TaskID).
///
/// Wire form is the decimal Key followed by the fixed suffix `"20"`.
/// Parsing is lenient: anything that doesn't fit the shape decodes to 0
/// rather than erroring, matching the upstream ecosystem's historical
/// behavior of treating a malformed TaskID as simply "not found".
pub struct TaskId;

impl TaskId {
    const SUFFIX: &'static str = "20";

    pub fn to_wire(key: Key) -> String {
        format!("{key}{}", Self::SUFFIX)
    }

    pub fn from_wire(s: &str) -> Key {
        if let Some(prefix) = s.strip_suffix(Self::SUFFIX) {
            if !prefix.is_empty() && !prefix.starts_with('0') {
                if let Ok(key) = prefix.parse::<Key>() {
                    if key > 0 {
                        return key;
                    }
                }
            }
        }
        0
    }
}
