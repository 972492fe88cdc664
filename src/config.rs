//! Server configuration.
//!
//! Every option has a default suitable for a small deployment and can be
//! overridden through a `COWRITE_*` environment variable. Values that fail
//! to parse are logged and fall back to the default.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind host and port.
    pub listen_addr: String,
    /// Directory for room snapshot files.
    pub persist_dir: PathBuf,
    /// Interval between server heartbeats. A session with no inbound
    /// traffic for twice this long is closed as dead; clients apply the
    /// symmetric rule.
    pub heartbit_interval: Duration,
    /// Max characters a client lets the document grow to before refusing
    /// the edit locally.
    pub document_limit: usize,
    /// Serialized log size that triggers compaction.
    pub log_bytes_threshold: usize,
    /// Event count that triggers compaction.
    pub log_ops_threshold: usize,
    /// Hard ceiling: an append pushing the log past this closes the session.
    pub log_hard_limit: usize,
    /// Max concurrent sessions per room.
    pub sites_limit: usize,
    /// A room idle longer than this is eligible for eviction.
    pub room_idle_ttl: Duration,
    /// A room older than this is eligible for eviction. Both bounds must be
    /// exceeded before a room is actually removed.
    pub room_max_age: Duration,
    /// Sweeper period: dead-session GC, flush, offload, eviction.
    pub sweep_interval: Duration,
    /// Length of generated room names.
    pub room_name_length: usize,
    /// Text seeded into every new room, typically a retention notice.
    pub greeting: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5000".to_string(),
            persist_dir: PathBuf::from("./data"),
            heartbit_interval: Duration::from_secs(5),
            document_limit: 100_000,
            log_bytes_threshold: 256 * 1024,
            log_ops_threshold: 10_000,
            log_hard_limit: 200_000,
            sites_limit: 20,
            room_idle_ttl: Duration::from_secs(60 * 60),
            room_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(10),
            room_name_length: 14,
            greeting: None,
        }
    }
}

impl Settings {
    /// Defaults overridden by `COWRITE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env_var("COWRITE_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            persist_dir: env_var("COWRITE_PERSIST_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.persist_dir),
            heartbit_interval: env_secs("COWRITE_HEARTBIT_INTERVAL")
                .unwrap_or(defaults.heartbit_interval),
            document_limit: env_parsed("COWRITE_DOCUMENT_LIMIT")
                .unwrap_or(defaults.document_limit),
            log_bytes_threshold: env_parsed("COWRITE_LOG_BYTES_THRESHOLD")
                .unwrap_or(defaults.log_bytes_threshold),
            log_ops_threshold: env_parsed("COWRITE_LOG_OPS_THRESHOLD")
                .unwrap_or(defaults.log_ops_threshold),
            log_hard_limit: env_parsed("COWRITE_LOG_HARD_LIMIT")
                .unwrap_or(defaults.log_hard_limit),
            sites_limit: env_parsed("COWRITE_SITES_LIMIT").unwrap_or(defaults.sites_limit),
            room_idle_ttl: env_secs("COWRITE_ROOM_IDLE_TTL").unwrap_or(defaults.room_idle_ttl),
            room_max_age: env_secs("COWRITE_ROOM_MAX_AGE").unwrap_or(defaults.room_max_age),
            sweep_interval: env_secs("COWRITE_SWEEP_INTERVAL")
                .unwrap_or(defaults.sweep_interval),
            room_name_length: env_parsed("COWRITE_ROOM_NAME_LENGTH")
                .unwrap_or(defaults.room_name_length),
            greeting: env_var("COWRITE_GREETING").or(defaults.greeting),
        }
    }

    pub fn heartbit_secs(&self) -> u64 {
        self.heartbit_interval.as_secs()
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_var(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring unparsable {key}={raw}");
            None
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parsed::<u64>(key).map(Duration::from_secs)
}
