use clap::Parser;

use crate::cache::{DEFAULT_MAX_BYTES, DEFAULT_MAX_ENTRIES};
use crate::gate::{UpdateGate, DEFAULT_MIN_DISTANCE_M, DEFAULT_MIN_INTERVAL_S};
use crate::store::DEFAULT_COORD_EPSILON_M;

/// Presence Sync Configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// User id whose presence this client publishes.
    #[arg(long, default_value = "demo-user")]
    pub user: String,

    /// Minimum movement in meters before a presence write is worthwhile.
    #[arg(long, value_name = "METERS", default_value_t = DEFAULT_MIN_DISTANCE_M)]
    pub min_distance: f64,

    /// Minimum interval in seconds between presence writes.
    #[arg(long, value_name = "SECONDS", default_value_t = DEFAULT_MIN_INTERVAL_S)]
    pub min_interval: f64,

    /// Epsilon in meters under which a friend's coordinate-only move is
    /// treated as noise.
    #[arg(long, value_name = "METERS", default_value_t = DEFAULT_COORD_EPSILON_M)]
    pub coord_epsilon: f64,

    /// Maximum number of cached images.
    #[arg(long, default_value_t = DEFAULT_MAX_ENTRIES)]
    pub cache_max_entries: usize,

    /// Maximum aggregate image cache cost in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
    pub cache_max_bytes: usize,

    /// Demo sampling period in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub sample_interval_ms: u64,

    /// Status logging interval in seconds, -1 to disable
    #[arg(long, default_value_t = 15)]
    pub status_interval: i32,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    pub fn gate(&self) -> UpdateGate {
        UpdateGate::new(self.min_distance, self.min_interval)
    }
}
