//! Runtime-configurable parameters for tenax.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `TENAX_`) or by constructing a custom `TenaxConfig`.

/// Tuning parameters for the engine and its recovery machinery.
#[derive(Debug, Clone)]
pub struct TenaxConfig {
    /// Address of the rendezvous tracker, e.g. `127.0.0.1:9090`.
    pub tracker_addr: String,

    /// Local address the worker's peer listener binds to. Port 0 picks an
    /// ephemeral port; the chosen address is reported to the tracker.
    pub bind_addr: String,

    /// Retention period R of the result buffer: a worker permanently keeps
    /// results whose sequence number is congruent to its rank mod R.
    pub result_buffer_round: u32,

    /// Desired replication factor k of cached results. When set, overrides
    /// `result_buffer_round` with `max(world_size / k, 1)` once the world
    /// size is known.
    pub result_replicate: Option<u32>,

    /// Size of each link's ring buffer, used by pass-through nodes during
    /// data recovery to decouple read and write rates.
    pub ring_buffer_bytes: usize,
}

impl Default for TenaxConfig {
    fn default() -> Self {
        Self {
            tracker_addr: "127.0.0.1:9090".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            result_buffer_round: 1,
            result_replicate: None,
            ring_buffer_bytes: 64 * 1024, // 64 KiB
        }
    }
}

impl TenaxConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `TENAX_TRACKER`
    /// - `TENAX_BIND`
    /// - `TENAX_RESULT_BUFFER_ROUND`
    /// - `TENAX_RESULT_REPLICATE`
    /// - `TENAX_RING_BUFFER_BYTES`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("TENAX_TRACKER") {
            cfg.tracker_addr = v;
        }
        if let Ok(v) = std::env::var("TENAX_BIND") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = std::env::var("TENAX_RESULT_BUFFER_ROUND") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.result_buffer_round = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("TENAX_RESULT_REPLICATE") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.result_replicate = Some(n.max(1));
            }
        }
        if let Ok(v) = std::env::var("TENAX_RING_BUFFER_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.ring_buffer_bytes = n.max(1);
            }
        }

        cfg
    }

    /// Convenience constructor for a worker pointed at a known tracker.
    pub fn for_tracker(tracker_addr: impl Into<String>) -> Self {
        Self {
            tracker_addr: tracker_addr.into(),
            ..Self::default()
        }
    }
}
