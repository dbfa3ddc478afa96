//! Task/bot matching and dispatch (spec §4.4).

use crate::constants::{POLL_HANG_SECS, SCHEDULER_TICK_MS};
use crate::models::{Bot, TaskRequest, TaskResult, TaskState};
use crate::store::Store;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct WaitingBot {
    bot: Bot,
    tx: oneshot::Sender<TaskRequest>,
}

struct SchedulerState {
    bots: HashMap<String, WaitingBot>,
}

/// Maintains waiting bots, matching them against requests either inline at
/// `enqueue` time or on the periodic re-scan. The pending-task side of the
/// match (spec §4.4's `queues`) is the Store itself: `rescan` re-queries
/// `TaskResultFilter { state: Pending }` every tick rather than mirroring
/// pending keys into a second in-process structure that would need its own
/// cleanup on dispatch/expiry/cancel.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    store: Arc<dyn Store>,
}

/// A request's properties match a bot iff every `(k, v)` in the request has
/// a corresponding value in the bot's `k -> [v]` multimap. Unconstrained
/// keys are ignored; a key missing on the bot side fails the match.
pub fn dimensions_match(
    request: &BTreeMap<String, String>,
    bot: &BTreeMap<String, Vec<String>>,
) -> bool {
    request.iter().all(|(k, v)| {
        bot.get(k)
            .map(|values| values.iter().any(|v2| v2 == v))
            .unwrap_or(false)
    })
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Scheduler {
            state: Mutex::new(SchedulerState {
                bots: HashMap::new(),
            }),
            store,
        }
    }

    /// Registers a task and tries to assign it to a waiting bot inline.
    /// Returns the freshly admitted TaskResult (Running if dispatched,
    /// Pending otherwise).
    pub async fn enqueue(&self, request: &TaskRequest) -> crate::Result<TaskResult> {
        let slice = &request.task_slices[0];
        let dispatched_bot_id = {
            let mut state = self.state.lock();
            let mut candidates: Vec<&String> = state
                .bots
                .iter()
                .filter(|(_, w)| dimensions_match(&slice.properties.dimensions, &w.bot.dimensions))
                .map(|(id, _)| id)
                .collect();
            candidates.sort();
            candidates.first().map(|s| (*s).clone())
        };

        let mut result = TaskResult::new_pending(request.key);

        if let Some(bot_id) = dispatched_bot_id {
            let mut state = self.state.lock();
            if let Some(waiting) = state.bots.remove(&bot_id) {
                if waiting.tx.send(request.clone()).is_ok() {
                    result.state = TaskState::Running;
                    result.bot_id = bot_id;
                    result.started = Some(chrono::Utc::now());
                    result.bot_dimensions = waiting.bot.dimensions.clone();
                } else {
                    tracing::warn!(bot_id = %bot_id, "dispatch channel closed, dropping match");
                }
            }
        }

        self.store.task_result_set(&result).await?;
        Ok(result)
    }

    /// Registers `bot` as waiting and suspends until a task is dispatched
    /// to it or the hang timeout/cancellation elapses.
    pub async fn poll(&self, bot: &Bot, token: &CancellationToken) -> Option<TaskRequest> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.bots.insert(
                bot.id.clone(),
                WaitingBot {
                    bot: bot.clone(),
                    tx,
                },
            );
        }

        let result = tokio::select! {
            res = rx => res.ok(),
            _ = tokio::time::sleep(std::time::Duration::from_secs(POLL_HANG_SECS)) => None,
            _ = token.cancelled() => None,
        };

        self.state.lock().bots.remove(&bot.id);
        result
    }

    /// Background re-scan: walks pending tasks in ascending-Priority then
    /// ascending-Key order, expires what's timed out, matches the rest
    /// against currently-waiting bots, and marks exhausted slices
    /// NoResource. Required behavior per spec §4.4/§9 (the source only
    /// blocks on cancellation; this is the conforming extension).
    pub async fn run_loop(&self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("scheduler loop stopping");
                    return;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(SCHEDULER_TICK_MS)) => {}
            }
            if let Err(e) = self.rescan().await {
                tracing::error!(error = %e, "scheduler re-scan failed");
            }
        }
    }

    pub(crate) async fn rescan(&self) -> crate::Result<()> {
        let filter = crate::store::TaskResultFilter {
            cursor: None,
            limit: 0,
            state: crate::store::TaskStateQuery::Pending,
            sort: crate::store::SortField::Created,
        };
        let mut pending = self.store.task_result_slice("", &filter).await?;

        let mut requests = HashMap::new();
        for result in &pending {
            if let Some(req) = self.store.task_request_get(result.key).await? {
                requests.insert(result.key, req);
            }
        }

        pending.sort_by(|a, b| {
            let pa = requests.get(&a.key).map(|r| r.priority).unwrap_or(255);
            let pb = requests.get(&b.key).map(|r| r.priority).unwrap_or(255);
            pa.cmp(&pb).then(a.key.cmp(&b.key))
        });

        let now = chrono::Utc::now();
        for mut result in pending {
            let Some(request) = requests.get(&result.key) else {
                continue;
            };
            let slice_index = result.current_task_slice;
            let slice = &request.task_slices[slice_index];
            let expires_at = request.created
                + chrono::Duration::seconds(request.total_expiration_through(slice_index) as i64);

            if now > expires_at {
                result.state = TaskState::Expired;
                result.modified = now;
                self.store.task_result_set(&result).await?;
                continue;
            }

            let dispatched_bot_id = {
                let mut state = self.state.lock();
                let mut candidates: Vec<&String> = state
                    .bots
                    .iter()
                    .filter(|(_, w)| {
                        dimensions_match(&slice.properties.dimensions, &w.bot.dimensions)
                    })
                    .map(|(id, _)| id)
                    .collect();
                candidates.sort();
                candidates.first().map(|s| (*s).clone())
            };

            if let Some(bot_id) = dispatched_bot_id {
                let mut state = self.state.lock();
                if let Some(waiting) = state.bots.remove(&bot_id) {
                    drop(state);
                    if waiting.tx.send(request.clone()).is_ok() {
                        result.state = TaskState::Running;
                        result.bot_id = bot_id;
                        result.started = Some(now);
                        result.modified = now;
                        result.bot_dimensions = waiting.bot.dimensions.clone();
                        self.store.task_result_set(&result).await?;
                    }
                }
            } else if !slice.wait_for_capacity
                && slice_index + 1 >= request.task_slices.len()
                && !self
                    .any_alive_bot_matches(&slice.properties.dimensions, now)
                    .await?
            {
                result.state = TaskState::NoResource;
                result.modified = now;
                self.store.task_result_set(&result).await?;
            }
        }
        Ok(())
    }

    /// Whether any non-deleted, non-dead bot in the fleet advertises
    /// dimensions satisfying `dimensions` — independent of whether such a
    /// bot happens to be idle (suspended in `poll`) at this instant. A task
    /// with no *waiting* match but a live, capable bot still in the fleet
    /// (busy, or between poll hangs) must stay `Pending`, not `NoResource`.
    async fn any_alive_bot_matches(
        &self,
        dimensions: &BTreeMap<String, String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> crate::Result<bool> {
        let bots = self.store.bot_get_slice(None, 0).await?;
        Ok(bots
            .iter()
            .any(|bot| !bot.is_dead(now) && dimensions_match(dimensions, &bot.dimensions)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_match_requires_every_key() {
        let mut req = BTreeMap::new();
        req.insert("pool".to_string(), "main".to_string());
        let mut bot = BTreeMap::new();
        bot.insert("pool".to_string(), vec!["main".to_string(), "ci".to_string()]);
        assert!(dimensions_match(&req, &bot));

        req.insert("os".to_string(), "Linux".to_string());
        assert!(!dimensions_match(&req, &bot));
    }

    #[test]
    fn dimensions_match_ignores_unconstrained_bot_keys() {
        let req = BTreeMap::new();
        let mut bot = BTreeMap::new();
        bot.insert("os".to_string(), vec!["Linux".to_string()]);
        assert!(dimensions_match(&req, &bot));
    }

    #[tokio::test]
    async fn poll_times_out_when_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> =
            Arc::new(crate::store::memory::MemStore::open(dir.path().join("db.json.zst")).unwrap());
        let scheduler = Scheduler::new(store);
        let bot = Bot {
            schema_version: 1,
            id: "bot-2".to_string(),
            created: chrono::Utc::now(),
            last_seen: chrono::Utc::now(),
            version: "1".to_string(),
            authenticated_as: String::new(),
            external_ip: String::new(),
            dimensions: BTreeMap::from([("os".to_string(), vec!["Windows".to_string()])]),
            state: serde_json::Value::Null,
            task_id: 0,
            quarantined_msg: String::new(),
            maintenance_msg: String::new(),
            dead: false,
            deleted: false,
        };
        let token = CancellationToken::new();
        token.cancel();
        let result = scheduler.poll(&bot, &token).await;
        assert!(result.is_none());
    }
}
