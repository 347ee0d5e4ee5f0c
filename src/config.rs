use serde::Deserialize;

/// Interval between heartbeat reconciliation ticks.
pub const HEARTBEAT_INTERVAL_MS: u64 = 50;

/// How many cells beyond the visible range are considered for download.
pub const PROBE_AHEAD_OR_BEHIND: usize = 8;

/// Sweep batches never shrink below this many cells per wave.
pub const BATCH_CHUNK_MIN: usize = 4;

/// Sweep batches never grow beyond this many cells per wave.
pub const BATCH_CHUNK_MAX: usize = 8;

/// Pause between sweep batches, long enough for a UI update to trickle through.
pub const BATCH_SLEEP_MS: u64 = 15;

/// Disk reads per wave in a batched cache lookup.
pub const CACHE_READ_WAVE_SIZE: usize = 4;

/// Cool-down after a cache index save before a trailing save may run.
pub const CACHE_SAVE_COOLDOWN_MS: u64 = 3_000;

/// Minimum seconds between repeated fetches of the same page.
pub const FETCH_THROTTLE_SECS: u64 = 120;

/// Window in which two fetches of the same page mark that page as stuck.
pub const FETCH_REPEAT_WINDOW_SECS: u64 = 10;

/// Spin-wait budget (1 ms steps) before a refresh gives up on a locked flag.
pub const REFRESH_SPIN_BUDGET: u32 = 2048;

/// Pause before a forced restart fires, for perceived feedback.
pub const FORCE_RESTART_DELAY_MS: u64 = 1_000;

/// Pause while a refresh stages cells, so the reset reads as deliberate.
pub const REFRESH_SETTLE_MS: u64 = 250;

/// Top-level configuration for the grid engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of concurrent thumbnail downloads.
    pub max_concurrent_downloads: usize,
    /// Number of image slots the disk cache may occupy.
    pub cache_capacity: usize,
    /// Directory used for cache image files and the cache index.
    pub cache_dir: String,
    /// Name distinguishing this cache instance's files from any other's.
    pub cache_name: String,
    /// Heartbeat tick interval in milliseconds.
    pub heartbeat_ms: u64,
    /// Cells beyond the visible range considered for download.
    pub lookahead: usize,
    /// Pause between sweep batches in milliseconds.
    pub batch_sleep_ms: u64,
    /// Width thumbnails are resampled to.
    pub thumb_width: u32,
    /// Height thumbnails are resampled to.
    pub thumb_height: u32,
    /// Prefix prepended to a record's poster path to form its fetch URL.
    pub image_url_base: String,
    /// Probability in [0, 1] that a completed download is failed on purpose.
    /// Zero in production; raised by fault-tolerance tests.
    pub failure_injection_rate: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            cache_capacity: 4096,
            cache_dir: String::new(),
            cache_name: "thumbs".to_string(),
            heartbeat_ms: HEARTBEAT_INTERVAL_MS,
            lookahead: PROBE_AHEAD_OR_BEHIND,
            batch_sleep_ms: BATCH_SLEEP_MS,
            thumb_width: 200,
            thumb_height: 300,
            image_url_base: "https://image.tmdb.org/t/p/w342".to_string(),
            failure_injection_rate: 0.0,
        }
    }
}
