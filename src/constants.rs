//! System-wide tunables. Values follow the bounds stated in spec §3/§4.

/// Priority range, spec §3 TaskRequest.Priority.
pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 255;
pub const PRIORITY_DEFAULT: u8 = 200;

/// Slice expiration bounds in seconds: [1s, 3d + 1m].
pub const SLICE_EXPIRATION_MIN_SECS: u64 = 1;
pub const SLICE_EXPIRATION_MAX_SECS: u64 = 3 * 24 * 3600 + 60;

/// HardTimeout bounds in seconds: [1s, 7d + 10s].
pub const HARD_TIMEOUT_MIN_SECS: u64 = 1;
pub const HARD_TIMEOUT_MAX_SECS: u64 = 7 * 24 * 3600 + 10;

/// A bot is considered dead after this many seconds without a poll/handshake.
pub const BOT_DEAD_AFTER_SECS: i64 = 10 * 60;

/// Scheduler.poll initial hang window, per spec §4.4.
pub const POLL_HANG_SECS: u64 = 10;

/// Scheduler background re-scan tick.
pub const SCHEDULER_TICK_MS: u64 = 1000;

/// Default Store snapshot ticker interval.
pub const SNAPSHOT_INTERVAL_SECS: u64 = 5;

/// OutputStore.Loop base interval; actual sleep is jittered by ±5s.
pub const OUTPUT_STORE_LOOP_SECS: u64 = 60;
pub const OUTPUT_STORE_LOOP_JITTER_SECS: u64 = 5;

/// Default idle cutoff for OutputStore file handles.
pub const OUTPUT_STORE_DEFAULT_CUTOFF_SECS: u64 = 5 * 60;

/// Default cap on concurrently open OutputStore handles.
pub const OUTPUT_STORE_DEFAULT_MAX_OPEN: usize = 256;

/// Default name of the memory-backend snapshot file.
pub const DEFAULT_SNAPSHOT_FILENAME: &str = "db.json.zst";

/// 32-byte CAS digest hash, hex-encoded length.
pub const DIGEST_HASH_HEX_LEN: usize = 64;

/// Bulk retention horizon, spec §3 TaskRequest lifecycle.
pub const TASK_RETENTION_DAYS: i64 = 550;
