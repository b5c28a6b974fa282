use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scroll offset (in the front end's units, usually pixels) under which the viewer is "near top".
pub const NEAR_TOP_THRESHOLD: f64 = 100.0;

/// Tunables of the timeline engine. Every field has a default, so a partial JSON object is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineSettings {
    /// The `limit` sent to each source per page.
    pub page_limit: usize,
    /// If set, merged pages are truncated to this many items.
    pub combined_limit: Option<usize>,
    /// Cut merged pages at the newest tail among sources that still have more,
    /// so the shared next cursor never skips a source's items.
    pub align_source_boundaries: bool,
    pub near_top_threshold: f64,
    /// How long an optimistic write may wait for the backing store.
    pub write_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Fraction of the backoff delay added as random jitter, in `0.0..=1.0`.
    pub reconnect_jitter: f64,
    /// Fetch the following page in the background after each page load.
    pub prefetch_next_page: bool,
    pub prefetch_ttl_secs: u64,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            page_limit: 20,
            combined_limit: None,
            align_source_boundaries: false,
            near_top_threshold: NEAR_TOP_THRESHOLD,
            write_timeout_ms: 15_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_jitter: 0.2,
            prefetch_next_page: false,
            prefetch_ttl_secs: 30,
        }
    }
}

impl TimelineSettings {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn prefetch_ttl(&self) -> Duration {
        Duration::from_secs(self.prefetch_ttl_secs)
    }
}
