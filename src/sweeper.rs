use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::{ActorContext, AwardOutcome};
use crate::trigger::{self, RetryPolicy};

/// Award every booking that sits in a qualifying state without its award,
/// e.g. because the trigger lagged or the process restarted between the
/// status change and the award. Returns how many awards were applied.
pub async fn sweep_once(engine: &Engine, policy: RetryPolicy) -> usize {
    let ctx = ActorContext::system("sweeper");
    let mut applied = 0;
    for booking_id in engine.unawarded_terminal_bookings().await {
        let result = trigger::award_with_retry(engine, &ctx, booking_id, policy).await;
        if matches!(result, Ok(AwardOutcome::Applied { .. })) {
            applied += 1;
        }
        trigger::report(booking_id, &result);
    }
    applied
}

/// Background task that periodically reconciles missed awards.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, policy: RetryPolicy) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let applied = sweep_once(&engine, policy).await;
        if applied > 0 {
            info!("sweeper applied {applied} missed award(s)");
        }
    }
}

/// Background task that compacts the WAL when appends exceed threshold.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            info!("compacting WAL ({appends} appends since last compact)");
            if let Err(e) = engine.compact_wal().await {
                tracing::error!("WAL compaction failed: {e}");
            }
        }
    }
}
