use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const REAP_EVERY: Duration = Duration::from_secs(5);
const COMPACT_EVERY: Duration = Duration::from_secs(60);

/// Expire every pending hold past its `expires_at`. Returns how many went.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = engine.now_ms();
    let mut reaped = 0;
    for id in engine.collect_expired_holds(now) {
        match engine.expire_hold(id, now).await {
            Ok(_) => {
                reaped += 1;
                info!("reaped expired hold {id}");
            }
            // Confirmed, cancelled or ticked out since collection.
            Err(e) => debug!("reaper skip {id}: {e}"),
        }
    }
    reaped
}

/// Background task: sweep expired holds every few seconds, so holds whose
/// session went away still get released.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REAP_EVERY);
    loop {
        interval.tick().await;
        reap_once(&engine).await;
    }
}

/// Background task: compact the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_EVERY);
    loop {
        interval.tick().await;
        engine.notify.prune();
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
