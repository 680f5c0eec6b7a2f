//! Periodic publication of statistics snapshots.
//!
//! A single ticker task assembles a [`Snapshot`] on a fixed cadence and
//! offers it to the bounded snapshot channel without blocking: if the
//! consumer has fallen behind, the snapshot is dropped; a late snapshot
//! has no value, and the next tick will carry fresher numbers anyway.
//! When told to stop, the ticker publishes one final snapshot so the
//! consumer always sees the end-of-run counters.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::stats::{Snapshot, Stats};

/// How often snapshots are published.
pub(crate) const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(100);

/// Run the ticker until a stop message arrives, then emit the final
/// snapshot and return.
pub(crate) async fn ticker_main(
    stats: Arc<Stats>,
    in_flight: Arc<AtomicI64>,
    started: Instant,
    snapshots: flume::Sender<Snapshot>,
    stop: flume::Receiver<()>,
) {
    debug!("snapshot ticker started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SNAPSHOT_INTERVAL) => {
                let snapshot = stats.snapshot(
                    in_flight.load(Ordering::SeqCst),
                    started.elapsed(),
                );
                if snapshots.try_send(snapshot).is_err() {
                    trace!("snapshot channel full, dropping snapshot");
                }
            }
            _ = stop.recv_async() => {
                break;
            }
        }
    }

    // The run is over and drained; deliver the final counters even if the
    // consumer is slow. A dropped receiver just ends the stream.
    let snapshot = stats.snapshot(in_flight.load(Ordering::SeqCst), started.elapsed());
    if snapshots.send_async(snapshot).await.is_err() {
        debug!("snapshot consumer went away before the final snapshot");
    }
    debug!("snapshot ticker stopped");
}
