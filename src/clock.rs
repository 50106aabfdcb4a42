/// Node clock synchronization state
use log::{debug, info};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tokio::time::{sleep, Duration, Instant};

use crate::models::CaptureTime;
use crate::utils::{now_ticks, TICKS_PER_SECOND};

const SYNC_POLL_SECS: u64 = 5;

/// Output of the external time synchronization service
///
/// Captures taken before the first sync carry the unsynchronized flag. The
/// offset measured at the first sync is kept for the lifetime of the
/// process and is the only one used to correct those captures.
#[derive(Debug, Default)]
pub struct ClockSync {
    synchronized: AtomicBool,
    first_offset: OnceLock<i64>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    /// Offset (ticks) to add to an unsynchronized capture
    pub fn first_offset(&self) -> Option<i64> {
        self.first_offset.get().copied()
    }

    /// Record a completed sync; later offsets never replace the first one
    pub fn mark_synchronized(&self, offset_ticks: i64) {
        if self.first_offset.set(offset_ticks).is_ok() {
            info!(
                "Clock synchronized, offset {:.3} s",
                offset_ticks as f64 / TICKS_PER_SECOND as f64
            );
        } else {
            debug!("Clock re-synchronized, keeping first offset");
        }
        self.synchronized.store(true, Ordering::Release);
    }

    pub fn capture(&self) -> CaptureTime {
        // Flag first: a sync landing in between must not mark a pre-step tick
        let synchronized = self.is_synchronized();
        CaptureTime {
            ticks: now_ticks(),
            synchronized,
        }
    }
}

/// Wait for the host time service to report a sync and derive the step it
/// applied to the wall clock
///
/// `marker` is a file the time daemon creates once synchronized (for
/// systemd-timesyncd, `/run/systemd/timesync/synchronized`). The offset is
/// the difference between the wall clock and where it would be had it kept
/// running from the start of the watch at the monotonic rate.
pub async fn watch_host_sync(clock: std::sync::Arc<ClockSync>, marker: PathBuf) {
    let base_ticks = now_ticks();
    let base = Instant::now();

    loop {
        if tokio::fs::metadata(&marker).await.is_ok() {
            let elapsed = base.elapsed();
            let expected = base_ticks + (elapsed.as_nanos() / 100) as i64;
            clock.mark_synchronized(now_ticks() - expected);
            return;
        }
        debug!("Waiting for clock sync marker {}", marker.display());
        sleep(Duration::from_secs(SYNC_POLL_SECS)).await;
    }
}
