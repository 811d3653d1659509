use std::{sync::Arc, time::Duration};

use autobook_core::worker::{ReconciliationWorker, RunOptions, RunStatus};
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Starts a run every `period` until `shutdown` fires. The first run starts
/// immediately. A tick that lands while a run is still going is skipped;
/// the global lock already keeps other instances out.
///
/// Shutdown is only observed between runs: a run in flight finishes and
/// releases its locks before the task exits.
pub fn spawn_interval_runs(
    worker: Arc<ReconciliationWorker>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval = %humantime::format_duration(period),
            "monitor schedule started"
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = worker.run(RunOptions::default()).await;

            match outcome.status {
                RunStatus::Completed => debug!(
                    run_id = %outcome.run_id,
                    processed = outcome.processed(),
                    "scheduled run finished"
                ),
                RunStatus::LockBusy => {
                    debug!("scheduled run skipped; monitor lock held elsewhere")
                }
                status => warn!(
                    run_id = %outcome.run_id,
                    ?status,
                    "scheduled run did not complete"
                ),
            }
        }

        info!("monitor schedule stopped");
    })
}
