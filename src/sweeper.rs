use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Retry queued waitlist promotions and post due reminders, forever.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

pub async fn sweep_once(engine: &Engine) {
    if engine.pending_promotion_count().await > 0 {
        let done = engine.retry_pending_promotions().await;
        debug!(done, "retried pending promotions");
    }
    if let Err(e) = engine.send_due_reminders().await {
        warn!("reminder sweep failed: {e}");
    }
}

/// Compact the shop's WAL whenever it grows past `threshold` commits.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
