//! Periodic lease reclamation.
//!
//! Sweeps the job store on a fixed interval: expired READING leases and
//! stale PROCESSING jobs go back to PENDING, and registrations that have
//! not been seen for the expiry window are purged. The sweep takes the
//! same lock as the request handlers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::store::JobStore;
use tokio_util::sync::CancellationToken;

/// Run the reaper loop until `cancel` is triggered.
pub async fn run(store: Arc<JobStore>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        read_lease_secs = store.config().read_lease.as_secs(),
        processing_stale_secs = store.config().processing_stale_after.as_secs(),
        "Reaper started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Reaper stopping");
                break;
            }
            _ = ticker.tick() => {
                let report = store.reap(Utc::now()).await;
                if report.is_empty() {
                    tracing::debug!("Reaper: nothing to reclaim");
                } else {
                    tracing::info!(
                        expired_reads = report.expired_reads.len(),
                        stale_processing = report.stale_processing.len(),
                        purged_workers = report.purged_workers.len(),
                        "Reaper: sweep reclaimed work"
                    );
                }
            }
        }
    }
}
