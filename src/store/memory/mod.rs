pub mod wire;

use super::{
    matches_task_result_state, BotCounts, BotEventFilter, SortField, Store, TaskRequestFilter,
    TaskResultFilter,
};
use crate::error::{MessError, Result};
use crate::models::{Bot, BotEvent, Key, TaskRequest, TaskResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

struct Tables {
    task_requests: HashMap<Key, TaskRequest>,
    task_results: HashMap<Key, TaskResult>,
    bots: HashMap<String, Bot>,
    bot_events: HashMap<String, Vec<BotEvent>>,
}

/// In-memory Store backend, durably snapshotted to a compressed JSON file.
///
/// Writes serialize on `tables`; `Snapshot` deep-copies while holding the
/// lock only long enough to clone, then encodes and writes off-lock so a
/// slow fsync doesn't stall concurrent callers.
pub struct MemStore {
    path: PathBuf,
    tables: Mutex<Tables>,
    next_task_key: AtomicU64,
    next_event_key: AtomicU64,
}

impl MemStore {
    /// Opens (or creates) the snapshot at `path`. A missing file starts
    /// empty; a present-but-corrupt file aborts startup (spec §4.1 "Failure
    /// model: corruption on load aborts startup").
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let compressed = std::fs::read(&path)?;
            let decompressed = zstd::stream::decode_all(compressed.as_slice())
                .map_err(|e| MessError::Storage(format!("snapshot decompress failed: {e}")))?;
            serde_json::from_slice::<wire::SnapshotDoc>(&decompressed)
                .map_err(|e| MessError::Storage(format!("snapshot corrupt: {e}")))?
        } else {
            wire::SnapshotDoc::default()
        };

        let mut task_requests = HashMap::new();
        let mut max_task_key = 0u64;
        for (k, w) in doc.tasks_request {
            max_task_key = max_task_key.max(k);
            task_requests.insert(k, TaskRequest::from(w));
        }

        let mut task_results = HashMap::new();
        for (k, w) in doc.tasks_result {
            task_results.insert(k, TaskResult::from(w));
        }

        let mut bots = HashMap::new();
        for (id, w) in doc.bots {
            bots.insert(id, Bot::from(w));
        }

        let mut bot_events = HashMap::new();
        let mut max_event_key = 0u64;
        for (id, events) in doc.bot_events {
            let converted: Vec<BotEvent> = events
                .into_iter()
                .map(|w| {
                    max_event_key = max_event_key.max(w.k);
                    BotEvent::from(w)
                })
                .collect();
            bot_events.insert(id, converted);
        }

        Ok(MemStore {
            path,
            tables: Mutex::new(Tables {
                task_requests,
                task_results,
                bots,
                bot_events,
            }),
            next_task_key: AtomicU64::new(max_task_key + 1),
            next_event_key: AtomicU64::new(max_event_key + 1),
        })
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let tables = self.tables.lock();
        let doc = wire::SnapshotDoc {
            tasks_request: tables
                .task_requests
                .iter()
                .map(|(k, v)| (*k, wire::WireTaskRequest::from(v)))
                .collect(),
            tasks_result: tables
                .task_results
                .iter()
                .map(|(k, v)| (*k, wire::WireTaskResult::from(v)))
                .collect(),
            bots: tables
                .bots
                .iter()
                .map(|(id, v)| (id.clone(), wire::WireBot::from(v)))
                .collect(),
            bot_events: tables
                .bot_events
                .iter()
                .map(|(id, events)| {
                    (
                        id.clone(),
                        events.iter().map(wire::WireBotEvent::from).collect(),
                    )
                })
                .collect(),
        };
        drop(tables);
        let json = serde_json::to_vec(&doc)?;
        zstd::stream::encode_all(json.as_slice(), 0)
            .map_err(|e| MessError::Storage(format!("snapshot compress failed: {e}")))
    }
}

#[async_trait]
impl Store for MemStore {
    async fn task_request_add(&self, r: &mut TaskRequest) -> Result<()> {
        if r.key != 0 {
            return Err(MessError::Conflict(
                "task_request_add called with non-zero key".to_string(),
            ));
        }
        let key = self.next_task_key.fetch_add(1, Ordering::SeqCst);
        r.key = key;
        let mut tables = self.tables.lock();
        if tables.task_requests.contains_key(&key) {
            return Err(MessError::Conflict(format!("key {key} already present")));
        }
        tables.task_requests.insert(key, r.clone());
        Ok(())
    }

    async fn task_request_get(&self, key: Key) -> Result<Option<TaskRequest>> {
        Ok(self.tables.lock().task_requests.get(&key).cloned())
    }

    async fn task_request_slice(&self, filter: &TaskRequestFilter) -> Result<Vec<TaskRequest>> {
        let tables = self.tables.lock();
        let mut rows: Vec<&TaskRequest> = tables
            .task_requests
            .values()
            .filter(|r| match (filter.start, filter.end) {
                (Some(start), Some(end)) => r.created >= start && r.created <= end,
                (Some(start), None) => r.created >= start,
                (None, Some(end)) => r.created <= end,
                (None, None) => true,
            })
            .filter(|r| filter.cursor.map(|c| r.key < c).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| b.key.cmp(&a.key));
        let limit = if filter.limit == 0 { rows.len() } else { filter.limit };
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn task_request_count(&self) -> Result<u64> {
        Ok(self.tables.lock().task_requests.len() as u64)
    }

    async fn task_result_get(&self, key: Key) -> Result<Option<TaskResult>> {
        Ok(self.tables.lock().task_results.get(&key).cloned())
    }

    async fn task_result_set(&self, result: &TaskResult) -> Result<()> {
        self.tables
            .lock()
            .task_results
            .insert(result.key, result.clone());
        Ok(())
    }

    async fn task_result_slice(
        &self,
        bot_id: &str,
        filter: &TaskResultFilter,
    ) -> Result<Vec<TaskResult>> {
        let tables = self.tables.lock();
        let mut rows: Vec<&TaskResult> = tables
            .task_results
            .values()
            .filter(|r| bot_id.is_empty() || r.bot_id == bot_id)
            .filter(|r| matches_task_result_state(r, filter.state))
            .filter(|r| filter.cursor.map(|c| r.key < c).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| {
            let key_of = |r: &&TaskResult| match filter.sort {
                SortField::Created => r.key,
                SortField::Modified => r.modified.timestamp_micros() as u64,
                SortField::Completed => r
                    .completed
                    .map(|t| t.timestamp_micros() as u64)
                    .unwrap_or(0),
                SortField::Abandoned => r
                    .abandoned
                    .map(|t| t.timestamp_micros() as u64)
                    .unwrap_or(0),
                SortField::Started => r.started.map(|t| t.timestamp_micros() as u64).unwrap_or(0),
            };
            key_of(b).cmp(&key_of(a))
        });
        let limit = if filter.limit == 0 { rows.len() } else { filter.limit };
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn bot_get(&self, id: &str) -> Result<Option<Bot>> {
        Ok(self.tables.lock().bots.get(id).cloned())
    }

    async fn bot_set(&self, bot: &Bot) -> Result<()> {
        self.tables.lock().bots.insert(bot.id.clone(), bot.clone());
        Ok(())
    }

    async fn bot_count(
        &self,
        dimensions: &std::collections::BTreeMap<String, String>,
    ) -> Result<BotCounts> {
        let now = chrono::Utc::now();
        let tables = self.tables.lock();
        let mut counts = BotCounts::default();
        for bot in tables.bots.values() {
            if bot.deleted {
                continue;
            }
            let superset = dimensions.iter().all(|(k, v)| {
                bot.dimensions
                    .get(k)
                    .map(|vals| vals.iter().any(|v2| v2 == v))
                    .unwrap_or(false)
            });
            if !superset {
                continue;
            }
            counts.total += 1;
            if bot.is_quarantined() {
                counts.quarantined += 1;
            }
            if bot.is_in_maintenance() {
                counts.maintenance += 1;
            }
            if bot.is_dead(now) {
                counts.dead += 1;
            }
            if bot.is_busy() {
                counts.busy += 1;
            }
        }
        Ok(counts)
    }

    async fn bot_get_slice(&self, cursor: Option<String>, limit: usize) -> Result<Vec<Bot>> {
        let tables = self.tables.lock();
        let mut rows: Vec<&Bot> = tables
            .bots
            .values()
            .filter(|b| !b.deleted)
            .filter(|b| cursor.as_deref().map(|c| b.id.as_str() > c).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let limit = if limit == 0 { rows.len() } else { limit };
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn bot_event_add(&self, e: &mut BotEvent) -> Result<()> {
        if e.key != 0 {
            return Err(MessError::Conflict(
                "bot_event_add called with non-zero key".to_string(),
            ));
        }
        e.key = self.next_event_key.fetch_add(1, Ordering::SeqCst);
        self.tables
            .lock()
            .bot_events
            .entry(e.bot_id.clone())
            .or_default()
            .push(e.clone());
        Ok(())
    }

    async fn bot_event_get_slice(
        &self,
        bot_id: &str,
        filter: &BotEventFilter,
    ) -> Result<Vec<BotEvent>> {
        let tables = self.tables.lock();
        let mut rows: Vec<&BotEvent> = tables
            .bot_events
            .get(bot_id)
            .into_iter()
            .flatten()
            .filter(|e| filter.cursor.map(|c| e.key < c).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| b.key.cmp(&a.key));
        let limit = if filter.limit == 0 { rows.len() } else { filter.limit };
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn snapshot(&self) -> Result<()> {
        let bytes = self.encode()?;
        let new_path = new_path_for(&self.path);
        {
            let mut file = std::fs::File::create(&new_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&new_path, &self.path)?;
        tracing::info!(path = %self.path.display(), "snapshot written");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.snapshot().await
    }
}

/// `<base>.new.<ext>`, matching the original's `dbjson.go` naming so the
/// live file is never observed in a half-written state.
fn new_path_for(path: &Path) -> PathBuf {
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("db");
    let new_name = match file_name.split_once('.') {
        Some((base, rest)) => format!("{base}.new.{rest}"),
        None => format!("{file_name}.new"),
    };
    path.with_file_name(new_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskProperties, TaskSlice};
    use std::collections::BTreeMap;

    fn sample_request() -> TaskRequest {
        TaskRequest {
            schema_version: 1,
            key: 0,
            created: chrono::Utc::now(),
            priority: 200,
            parent_task: None,
            tags: vec![],
            task_slices: vec![TaskSlice {
                properties: TaskProperties {
                    command: vec!["/bin/true".into()],
                    relative_wd: String::new(),
                    caches: vec![],
                    cas_host: String::new(),
                    input: None,
                    cipd_host: String::new(),
                    cipd_client: String::new(),
                    cipd_packages: vec![],
                    dimensions: BTreeMap::new(),
                    env: BTreeMap::new(),
                    env_prefixes: BTreeMap::new(),
                    hard_timeout: 60,
                    grace_period: 30,
                    io_timeout: 60,
                    secret_bytes: vec![],
                    idempotent: false,
                    outputs: vec![],
                    containment: None,
                },
                expiration: 60,
                wait_for_capacity: false,
            }],
        }
    }

    #[tokio::test]
    async fn keys_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemStore::open(dir.path().join("db.json.zst")).unwrap();
        let mut r1 = sample_request();
        let mut r2 = sample_request();
        store.task_request_add(&mut r1).await.unwrap();
        store.task_request_add(&mut r2).await.unwrap();
        assert!(r2.key > r1.key);
        assert!(r1.key > 0);
    }

    #[tokio::test]
    async fn add_rejects_preset_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemStore::open(dir.path().join("db.json.zst")).unwrap();
        let mut r = sample_request();
        r.key = 5;
        assert!(store.task_request_add(&mut r).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json.zst");
        let store = MemStore::open(&path).unwrap();
        let mut r = sample_request();
        store.task_request_add(&mut r).await.unwrap();
        let mut bot = Bot {
            schema_version: 1,
            id: "bot-1".to_string(),
            created: chrono::Utc::now(),
            last_seen: chrono::Utc::now(),
            version: "1".to_string(),
            authenticated_as: String::new(),
            external_ip: String::new(),
            dimensions: BTreeMap::new(),
            state: serde_json::Value::Null,
            task_id: 0,
            quarantined_msg: String::new(),
            maintenance_msg: String::new(),
            dead: false,
            deleted: false,
        };
        store.bot_set(&bot).await.unwrap();
        bot.version = "2".to_string();
        store.close().await.unwrap();

        let reopened = MemStore::open(&path).unwrap();
        let got = reopened.task_request_get(r.key).await.unwrap().unwrap();
        assert_eq!(got.key, r.key);
        assert_eq!(got.task_slices[0].properties.command, r.task_slices[0].properties.command);
        let count = reopened.task_request_count().await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn no_new_file_left_behind_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json.zst");
        let store = MemStore::open(&path).unwrap();
        store.snapshot().await.unwrap();
        assert!(path.exists());
        assert!(!new_path_for(&path).exists());
    }
}
