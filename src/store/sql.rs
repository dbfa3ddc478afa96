//! Relational Store backend (spec §4.1, §6): one table per entity, explicit
//! indexed columns for the fields callers filter/sort by, plus one opaque
//! BLOB column holding the remainder as compact JSON — mirroring
//! `schemaBot`/`schemaBotEvent` in the Go original this was distilled from.

use super::{matches_task_result_state, BotCounts, BotEventFilter, SortField, Store, TaskRequestFilter, TaskResultFilter};
use crate::error::{MessError, Result};
use crate::models::{Bot, BotEvent, Key, TaskRequest, TaskResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

pub struct SqlStore {
    conn: Mutex<Connection>,
}

impl SqlStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS task_request (
                key INTEGER PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                created TEXT NOT NULL,
                priority INTEGER NOT NULL,
                tags TEXT NOT NULL,
                blob BLOB NOT NULL
            ) STRICT;
            CREATE TABLE IF NOT EXISTS task_result (
                key INTEGER PRIMARY KEY,
                bot_id TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL,
                modified TEXT NOT NULL,
                completed TEXT,
                started TEXT,
                abandoned TEXT,
                blob BLOB NOT NULL
            ) STRICT;
            CREATE TABLE IF NOT EXISTS bot (
                id TEXT PRIMARY KEY,
                last_seen TEXT NOT NULL,
                task_id INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                blob BLOB NOT NULL
            ) STRICT;
            CREATE TABLE IF NOT EXISTS bot_event (
                key INTEGER PRIMARY KEY,
                bot_id TEXT NOT NULL,
                time TEXT NOT NULL,
                blob BLOB NOT NULL
            ) STRICT;
            ",
        )?;
        Ok(SqlStore {
            conn: Mutex::new(conn),
        })
    }

    fn next_task_key(conn: &Connection) -> rusqlite::Result<Key> {
        conn.query_row(
            "SELECT COALESCE(MAX(key), 0) + 1 FROM task_request",
            [],
            |row| row.get(0),
        )
    }

    fn next_event_key(conn: &Connection) -> rusqlite::Result<Key> {
        conn.query_row(
            "SELECT COALESCE(MAX(key), 0) + 1 FROM bot_event",
            [],
            |row| row.get(0),
        )
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn task_request_add(&self, r: &mut TaskRequest) -> Result<()> {
        if r.key != 0 {
            return Err(MessError::Conflict(
                "task_request_add called with non-zero key".to_string(),
            ));
        }
        let conn = self.conn.lock();
        let key = Self::next_task_key(&conn)?;
        r.key = key;
        let tags = format!(";{};", r.tags.join(";"));
        let blob = serde_json::to_vec(&r)?;
        conn.execute(
            "INSERT INTO task_request (key, schema_version, created, priority, tags, blob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key,
                r.schema_version,
                r.created.to_rfc3339(),
                r.priority,
                tags,
                blob
            ],
        )?;
        Ok(())
    }

    async fn task_request_get(&self, key: Key) -> Result<Option<TaskRequest>> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT blob FROM task_request WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .ok();
        Ok(match blob {
            Some(b) => Some(serde_json::from_slice(&b)?),
            None => None,
        })
    }

    async fn task_request_slice(&self, filter: &TaskRequestFilter) -> Result<Vec<TaskRequest>> {
        let conn = self.conn.lock();
        let mut sql = "SELECT blob, key, created FROM task_request WHERE 1=1".to_string();
        if let Some(start) = filter.start {
            sql.push_str(&format!(" AND created >= '{}'", start.to_rfc3339()));
        }
        if let Some(end) = filter.end {
            sql.push_str(&format!(" AND created <= '{}'", end.to_rfc3339()));
        }
        if let Some(cursor) = filter.cursor {
            sql.push_str(&format!(" AND key < {cursor}"));
        }
        sql.push_str(" ORDER BY key DESC");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let blob: Vec<u8> = row.get(0)?;
            Ok(blob)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_slice(&row?)?);
        }
        Ok(out)
    }

    async fn task_request_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM task_request", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn task_result_get(&self, key: Key) -> Result<Option<TaskResult>> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT blob FROM task_result WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .ok();
        Ok(match blob {
            Some(b) => Some(serde_json::from_slice(&b)?),
            None => None,
        })
    }

    async fn task_result_set(&self, result: &TaskResult) -> Result<()> {
        let conn = self.conn.lock();
        let blob = serde_json::to_vec(result)?;
        let state = format!("{:?}", result.state);
        conn.execute(
            "INSERT INTO task_result (key, bot_id, state, modified, completed, started, abandoned, blob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(key) DO UPDATE SET
                bot_id=excluded.bot_id, state=excluded.state, modified=excluded.modified,
                completed=excluded.completed, started=excluded.started, abandoned=excluded.abandoned,
                blob=excluded.blob",
            params![
                result.key,
                result.bot_id,
                state,
                result.modified.to_rfc3339(),
                result.completed.map(|t| t.to_rfc3339()),
                result.started.map(|t| t.to_rfc3339()),
                result.abandoned.map(|t| t.to_rfc3339()),
                blob
            ],
        )?;
        Ok(())
    }

    async fn task_result_slice(
        &self,
        bot_id: &str,
        filter: &TaskResultFilter,
    ) -> Result<Vec<TaskResult>> {
        let conn = self.conn.lock();
        let mut sql = "SELECT blob FROM task_result WHERE 1=1".to_string();
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if !bot_id.is_empty() {
            sql.push_str(" AND bot_id = ?");
            bind.push(Box::new(bot_id.to_string()));
        }
        if let Some(cursor) = filter.cursor {
            sql.push_str(" AND key < ?");
            bind.push(Box::new(cursor));
        }
        let sort_col = match filter.sort {
            SortField::Created => "key",
            SortField::Modified => "modified",
            SortField::Completed => "completed",
            SortField::Abandoned => "abandoned",
            SortField::Started => "started",
        };
        sql.push_str(&format!(" ORDER BY {sort_col} DESC"));
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), |row| {
            let blob: Vec<u8> = row.get(0)?;
            Ok(blob)
        })?;
        let mut out = Vec::new();
        for row in rows {
            let result: TaskResult = serde_json::from_slice(&row?)?;
            if matches_task_result_state(&result, filter.state) {
                out.push(result);
            }
            if filter.limit > 0 && out.len() >= filter.limit {
                break;
            }
        }
        Ok(out)
    }

    async fn bot_get(&self, id: &str) -> Result<Option<Bot>> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row("SELECT blob FROM bot WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .ok();
        Ok(match blob {
            Some(b) => Some(serde_json::from_slice(&b)?),
            None => None,
        })
    }

    async fn bot_set(&self, bot: &Bot) -> Result<()> {
        let conn = self.conn.lock();
        let blob = serde_json::to_vec(bot)?;
        conn.execute(
            "INSERT INTO bot (id, last_seen, task_id, deleted, blob) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                last_seen=excluded.last_seen, task_id=excluded.task_id,
                deleted=excluded.deleted, blob=excluded.blob",
            params![
                bot.id,
                bot.last_seen.to_rfc3339(),
                bot.task_id,
                bot.deleted as i64,
                blob
            ],
        )?;
        Ok(())
    }

    async fn bot_count(
        &self,
        dimensions: &std::collections::BTreeMap<String, String>,
    ) -> Result<BotCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT blob FROM bot WHERE deleted = 0")?;
        let rows = stmt.query_map([], |row| {
            let blob: Vec<u8> = row.get(0)?;
            Ok(blob)
        })?;
        let now = chrono::Utc::now();
        let mut counts = BotCounts::default();
        for row in rows {
            let bot: Bot = serde_json::from_slice(&row?)?;
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
        let conn = self.conn.lock();
        let mut sql = "SELECT blob FROM bot WHERE deleted = 0".to_string();
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(cursor) = &cursor {
            sql.push_str(" AND id > ?");
            bind.push(Box::new(cursor.clone()));
        }
        sql.push_str(" ORDER BY id ASC");
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), |row| {
            let blob: Vec<u8> = row.get(0)?;
            Ok(blob)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_slice(&row?)?);
        }
        Ok(out)
    }

    async fn bot_event_add(&self, e: &mut BotEvent) -> Result<()> {
        if e.key != 0 {
            return Err(MessError::Conflict(
                "bot_event_add called with non-zero key".to_string(),
            ));
        }
        let conn = self.conn.lock();
        let key = Self::next_event_key(&conn)?;
        e.key = key;
        let blob = serde_json::to_vec(&e)?;
        conn.execute(
            "INSERT INTO bot_event (key, bot_id, time, blob) VALUES (?1, ?2, ?3, ?4)",
            params![key, e.bot_id, e.time.to_rfc3339(), blob],
        )?;
        Ok(())
    }

    async fn bot_event_get_slice(
        &self,
        bot_id: &str,
        filter: &BotEventFilter,
    ) -> Result<Vec<BotEvent>> {
        let conn = self.conn.lock();
        let mut sql = "SELECT blob FROM bot_event WHERE bot_id = ?1".to_string();
        if let Some(cursor) = filter.cursor {
            sql.push_str(&format!(" AND key < {cursor}"));
        }
        sql.push_str(" ORDER BY key DESC");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![bot_id], |row| {
            let blob: Vec<u8> = row.get(0)?;
            Ok(blob)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_slice(&row?)?);
        }
        Ok(out)
    }

    async fn snapshot(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.snapshot().await
    }
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
        let store = SqlStore::open(":memory:").unwrap();
        let mut r1 = sample_request();
        let mut r2 = sample_request();
        store.task_request_add(&mut r1).await.unwrap();
        store.task_request_add(&mut r2).await.unwrap();
        assert!(r2.key > r1.key);
    }

    #[tokio::test]
    async fn get_returns_none_for_absent_key() {
        let store = SqlStore::open(":memory:").unwrap();
        assert!(store.task_request_get(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn task_result_set_upserts() {
        let store = SqlStore::open(":memory:").unwrap();
        let mut result = TaskResult::new_pending(1);
        store.task_result_set(&result).await.unwrap();
        result.state = crate::models::TaskState::Running;
        store.task_result_set(&result).await.unwrap();
        let got = store.task_result_get(1).await.unwrap().unwrap();
        assert_eq!(got.state, crate::models::TaskState::Running);
    }
}
