use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that reconciles keys with expired holds on a fixed
/// interval. Requests reconcile lazily on their own; this only keeps the
/// cached counters fresh for keys nobody is touching.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let released = reap_once(&engine).await;
        if released > 0 {
            info!("reaper released {released} expired holds");
        }
    }
}

/// One reaper pass. Returns how many holds were released.
pub async fn reap_once(engine: &Engine) -> usize {
    let mut released = 0;
    for key in engine.keys_with_expired_holds(engine.now_ms()) {
        match engine.reconcile_key(key).await {
            Ok(n) => released += n,
            // Busy keys get reconciled by whoever holds them.
            Err(e) => tracing::debug!("reaper skip {key}: {e}"),
        }
    }
    released
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` records were appended since the last
/// rewrite. Returns whether a rewrite happened.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}
