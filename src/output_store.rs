//! Append-only per-task output storage (spec §4.2).
//!
//! Each task key maps to at most one file under `root`. Handles are opened
//! lazily and cached so a quiet task doesn't hold a descriptor forever; the
//! top-level handle map is guarded by one lock, but each handle carries its
//! own lock taken after the top-level lock is released, so concurrent
//! writers to different tasks don't contend on a single mutex (spec §5
//! shared-resource policy).

use crate::error::{MessError, Result};
use crate::models::Key;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct Handle {
    file: tokio::fs::File,
    last_touched: std::time::Instant,
    /// sticky once set; subsequent calls on this handle keep failing until
    /// it's evicted and reopened.
    error: Option<String>,
}

pub struct OutputStore {
    root: PathBuf,
    handles: Mutex<HashMap<Key, Arc<Mutex<Handle>>>>,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        OutputStore {
            root: root.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, key: Key) -> PathBuf {
        self.root.join(key.to_string())
    }

    async fn handle_for(&self, key: Key) -> Result<Arc<Mutex<Handle>>> {
        let mut handles = self.handles.lock().await;
        if let Some(h) = handles.get(&key) {
            return Ok(h.clone());
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.path_for(key))
            .await?;
        let handle = Arc::new(Mutex::new(Handle {
            file,
            last_touched: std::time::Instant::now(),
            error: None,
        }));
        handles.insert(key, handle.clone());
        Ok(handle)
    }

    pub async fn set_output(&self, key: Key, offset: u64, bytes: &[u8]) -> Result<()> {
        let handle = self.handle_for(key).await?;
        let mut guard = handle.lock().await;
        if let Some(err) = &guard.error {
            return Err(MessError::Storage(err.clone()));
        }
        let result = async {
            guard.file.seek(SeekFrom::Start(offset)).await?;
            guard.file.write_all(bytes).await?;
            guard.file.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        match result {
            Ok(()) => {
                guard.last_touched = std::time::Instant::now();
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                guard.error = Some(msg.clone());
                Err(MessError::Storage(msg))
            }
        }
    }

    pub async fn read_output(&self, key: Key, offset: u64, max: usize) -> Result<Vec<u8>> {
        let handle = self.handle_for(key).await?;
        let mut guard = handle.lock().await;
        if let Some(err) = &guard.error {
            return Err(MessError::Storage(err.clone()));
        }
        guard.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; max];
        let mut total = 0;
        loop {
            let n = guard.file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
            if total >= max {
                break;
            }
        }
        buf.truncate(total);
        guard.last_touched = std::time::Instant::now();
        Ok(buf)
    }

    /// Evicts handles idle for longer than `cutoff`, and if more than
    /// `max_open` remain, keeps evicting (in arbitrary order) until within
    /// budget. Runs every ~1 minute, jittered by ±5s, until `token` fires.
    pub async fn run_loop(
        &self,
        cutoff: std::time::Duration,
        max_open: usize,
        token: CancellationToken,
    ) {
        loop {
            let jitter = (rand::random::<u64>() % (2 * crate::constants::OUTPUT_STORE_LOOP_JITTER_SECS))
                as i64
                - crate::constants::OUTPUT_STORE_LOOP_JITTER_SECS as i64;
            let sleep_secs =
                (crate::constants::OUTPUT_STORE_LOOP_SECS as i64 + jitter).max(1) as u64;
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("output store loop stopping");
                    return;
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {}
            }
            self.evict_idle(cutoff, max_open).await;
        }
    }

    async fn evict_idle(&self, cutoff: std::time::Duration, max_open: usize) {
        let mut handles = self.handles.lock().await;
        let now = std::time::Instant::now();
        let mut stale = Vec::new();
        for (key, handle) in handles.iter() {
            let guard = handle.lock().await;
            if now.duration_since(guard.last_touched) > cutoff {
                stale.push(*key);
            }
        }
        for key in &stale {
            handles.remove(key);
        }
        if handles.len() > max_open {
            let excess = handles.len() - max_open;
            let keys: Vec<Key> = handles.keys().take(excess).cloned().collect();
            for key in keys {
                handles.remove(&key);
            }
        }
        if !stale.is_empty() {
            tracing::debug!(evicted = stale.len(), "output store evicted idle handles");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_reads_contiguous_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        store.set_output(1, 0, b"hello ").await.unwrap();
        store.set_output(1, 6, b"world").await.unwrap();
        let data = store.read_output(1, 0, 100).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn short_read_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        store.set_output(1, 0, b"abc").await.unwrap();
        let data = store.read_output(1, 0, 100).await.unwrap();
        assert_eq!(data, b"abc");
    }

    #[tokio::test]
    async fn separate_keys_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        store.set_output(1, 0, b"one").await.unwrap();
        store.set_output(2, 0, b"two").await.unwrap();
        assert_eq!(store.read_output(1, 0, 10).await.unwrap(), b"one");
        assert_eq!(store.read_output(2, 0, 10).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn eviction_respects_max_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        for key in 1..=5 {
            store.set_output(key, 0, b"x").await.unwrap();
        }
        assert_eq!(store.handles.lock().await.len(), 5);
        store
            .evict_idle(std::time::Duration::from_secs(3600), 2)
            .await;
        assert!(store.handles.lock().await.len() <= 2);
    }
}
