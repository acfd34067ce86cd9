// Update gate - decides which position samples are worth a remote write.
//
// Local consumers (the self-marker on the map) see every sample; the remote
// store only sees samples that moved far enough or waited long enough. This
// bounds write volume to roughly one write per min_interval under any
// sampling frequency.

use crate::entity::{PositionSample, PresenceRecord};

/// Default minimum movement before a new write is worthwhile, in meters.
pub const DEFAULT_MIN_DISTANCE_M: f64 = 10.0;

/// Default minimum interval between writes, in seconds.
pub const DEFAULT_MIN_INTERVAL_S: f64 = 5.0;

/// Pure decision function for presence write throttling.
#[derive(Debug, Clone, Copy)]
pub struct UpdateGate {
    pub min_distance_m: f64,
    pub min_interval_s: f64,
}

impl Default for UpdateGate {
    fn default() -> Self {
        UpdateGate {
            min_distance_m: DEFAULT_MIN_DISTANCE_M,
            min_interval_s: DEFAULT_MIN_INTERVAL_S,
        }
    }
}

impl UpdateGate {
    pub fn new(min_distance_m: f64, min_interval_s: f64) -> Self {
        UpdateGate { min_distance_m, min_interval_s }
    }

    /// Should `candidate` be forwarded to the presence writer?
    ///
    /// Rejects only when a previous write exists and the candidate is both
    /// closer than `min_distance_m` to it and sooner than `min_interval_s`
    /// after it. The first sample is always accepted.
    pub fn should_send(
        &self,
        last: Option<&PresenceRecord>,
        candidate: &PositionSample,
        now: f64,
    ) -> bool {
        let last = match last {
            Some(l) => l,
            None => return true,
        };

        let moved = last.coordinate.distance_to(&candidate.coordinate);
        let elapsed = now - last.timestamp;

        !(moved < self.min_distance_m && elapsed < self.min_interval_s)
    }
}
