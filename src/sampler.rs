// Position sampling pipeline: platform samples in, gated presence writes out.
//
// Every sample is published to the local "current position" observable
// immediately; only gate-accepted samples reach the remote store. The loop
// runs as a background task and ends when the sample channel closes; a fresh
// spawn restarts the sequence with no replay of missed samples.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::entity::{PositionSample, PresenceRecord};
use crate::gate::UpdateGate;
use crate::remote::RemoteStore;

/// Fire-and-forget presence writes. Never blocks the sampling loop; a failed
/// write is logged and superseded by the next accepted sample.
pub struct PresenceWriter {
    remote: Arc<dyn RemoteStore>,
}

impl PresenceWriter {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        PresenceWriter { remote }
    }

    pub fn write(&self, record: PresenceRecord) {
        let remote = self.remote.clone();
        tokio::spawn(async move {
            if let Err(e) = remote.write_presence(record).await {
                warn!(error = %e, "presence write dropped");
            }
        });
    }
}

/// Handle to a running sampler task.
pub struct SamplerHandle {
    task: JoinHandle<()>,
    current: watch::Receiver<Option<PositionSample>>,
}

impl SamplerHandle {
    /// Observable of the latest raw sample, gated or not, for the map's
    /// self-marker.
    pub fn current_position(&self) -> watch::Receiver<Option<PositionSample>> {
        self.current.clone()
    }

    /// Stop sampling. Resumption is a fresh spawn, never a replay.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Spawn the sampling loop over a platform sample channel.
pub fn spawn_sampler(
    user_id: String,
    samples: mpsc::Receiver<PositionSample>,
    gate: UpdateGate,
    remote: Arc<dyn RemoteStore>,
) -> SamplerHandle {
    let (current_tx, current_rx) = watch::channel(None);
    let writer = PresenceWriter::new(remote);
    let task = tokio::spawn(sample_loop(user_id, samples, gate, writer, current_tx));
    SamplerHandle { task, current: current_rx }
}

async fn sample_loop(
    user_id: String,
    mut samples: mpsc::Receiver<PositionSample>,
    gate: UpdateGate,
    writer: PresenceWriter,
    current_tx: watch::Sender<Option<PositionSample>>,
) {
    let mut last_sent: Option<PresenceRecord> = None;

    while let Some(sample) = samples.recv().await {
        // Local consumers see every sample, unconditionally.
        let _ = current_tx.send(Some(sample));

        // Samples carry the platform timestamp; the gate compares against
        // the last *sent* record, not the last sample.
        let now = sample.timestamp;
        if gate.should_send(last_sent.as_ref(), &sample, now) {
            let record = PresenceRecord {
                user_id: user_id.clone(),
                coordinate: sample.coordinate,
                timestamp: sample.timestamp,
            };
            writer.write(record.clone());
            last_sent = Some(record);
        } else {
            debug!(t = sample.timestamp, "sample gated");
        }
    }

    debug!("position sampling stopped");
}
