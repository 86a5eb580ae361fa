//! Idle session reaper
//!
//! Retires sessions that have been idle longer than a threshold and shuts
//! their backends down. Runs on demand (`xlang/shutDownIdleSessions`) and
//! periodically from the daemon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::session::SessionRegistry;

/// Outcome of one reap pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Sessions listed as idle
    pub candidates: usize,
    /// Sessions retired and shut down
    pub reaped: usize,
    /// Candidates that picked up work before they could be retired
    pub skipped: usize,
    /// Sessions left in the registry
    pub remaining: usize,
}

/// Retire every session idle longer than `older_than`
///
/// A zero threshold reaps every idle session. Busy sessions are never
/// reaped; a session that receives a request between listing and
/// retirement is skipped.
pub async fn reap(registry: &SessionRegistry, older_than: Duration) -> ReapStats {
    let started = Instant::now();
    let candidates = registry.list_idle_older_than(older_than);

    let mut retired = Vec::with_capacity(candidates.len());
    for session in &candidates {
        if registry.retire_idle(session, older_than) {
            retired.push(session.clone());
        }
    }

    join_all(retired.iter().map(|session| session.shutdown())).await;

    let stats = ReapStats {
        candidates: candidates.len(),
        reaped: retired.len(),
        skipped: candidates.len() - retired.len(),
        remaining: registry.len(),
    };
    if stats.candidates > 0 {
        tracing::info!(
            "Reaped {} idle sessions ({} skipped, {} remaining) in {:?}",
            stats.reaped,
            stats.skipped,
            stats.remaining,
            started.elapsed()
        );
    }
    stats
}

/// Run [`reap`] every `interval`, retiring sessions idle past `idle_timeout`
pub fn spawn_reaper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = reap(&registry, idle_timeout).await;
            tracing::debug!("Reaper pass: {:?}, registry {:?}", stats, registry.stats());
        }
    })
}
