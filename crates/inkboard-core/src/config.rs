//! Tunables for the canvas, picture cache and collaboration layers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Width of the logical canvas all stored geometry lives in.
pub const LOGICAL_WIDTH: f64 = 1920.0;
/// Height of the logical canvas all stored geometry lives in.
pub const LOGICAL_HEIGHT: f64 = 1080.0;
/// Maximum number of undoable commands kept.
pub const MAX_UNDO_HISTORY: usize = 50;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InkboardConfig {
    pub canvas: CanvasConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
}

impl InkboardConfig {
    /// Parse a (possibly partial) JSON configuration; missing fields keep defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Canvas and interaction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CanvasConfig {
    pub logical_width: f64,
    pub logical_height: f64,
    pub max_history: usize,
    /// Offset applied to pasted images when no pointer position is known.
    pub paste_offset: f64,
    pub nudge_small: f64,
    pub nudge_large: f64,
    /// Hit radius around resize/rotate handles, in logical units.
    pub handle_radius: f64,
    /// Distance of the rotate handle above the top edge.
    pub rotate_handle_offset: f64,
    /// Smallest extent an image may be resized to.
    pub min_image_extent: f64,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            logical_width: LOGICAL_WIDTH,
            logical_height: LOGICAL_HEIGHT,
            max_history: MAX_UNDO_HISTORY,
            paste_offset: 20.0,
            nudge_small: 1.0,
            nudge_large: 10.0,
            handle_radius: 10.0,
            rotate_handle_offset: 30.0,
            min_image_extent: 1.0,
        }
    }
}

/// Picture cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub capacity: usize,
    #[serde(with = "millis")]
    pub ttl: Duration,
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(2 * 60),
        }
    }
}

/// Collaboration timing and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(with = "millis")]
    pub stroke_batch_window: Duration,
    #[serde(with = "millis")]
    pub presence_throttle: Duration,
    pub rate_limit_per_window: usize,
    #[serde(with = "millis")]
    pub rate_limit_window: Duration,
    #[serde(with = "millis")]
    pub reconnect_base_delay: Duration,
    pub reconnect_max_attempts: u32,
    pub offline_queue_capacity: usize,
    pub recent_id_capacity: usize,
    pub token_retries: u32,
    #[serde(with = "millis")]
    pub token_retry_delay: Duration,
    #[serde(with = "millis")]
    pub token_timeout: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stroke_batch_window: Duration::from_millis(30),
            presence_throttle: Duration::from_millis(50),
            rate_limit_per_window: 50,
            rate_limit_window: Duration::from_secs(1),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_attempts: 5,
            offline_queue_capacity: 256,
            recent_id_capacity: 1024,
            token_retries: 3,
            token_retry_delay: Duration::from_millis(500),
            token_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
