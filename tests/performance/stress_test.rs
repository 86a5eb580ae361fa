//! Stress tests for concurrent clients
//!
//! Many clients on a few workspaces, with slow backends, while the reaper
//! runs. Every query must succeed and each (mode, root) must be served by a
//! single backend at a time.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;

use xlang_proxy::protocol::{DEFINITION, HOVER, REFERENCES};
use xlang_proxy::testing::FakeLauncher;
use xlang_proxy::{spawn_reaper, ProxyOptions};

use crate::common::ProxyFixture;

#[derive(Debug)]
struct StressTestResults {
    total_operations: usize,
    successful_operations: usize,
    failed_operations: usize,
    duration_ms: u128,
}

impl fmt::Display for StressTestResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {} | Success: {} | Failed: {} | Duration: {}ms",
            self.total_operations,
            self.successful_operations,
            self.failed_operations,
            self.duration_ms
        )
    }
}

async fn run_clients(
    fixture: &ProxyFixture,
    clients: usize,
    queries: usize,
    pause: Duration,
) -> StressTestResults {
    let ok = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    join_all((0..clients).map(|n| {
        let ok = ok.clone();
        let failed = failed.clone();
        let mode = if n % 2 == 0 { "go" } else { "typescript" };
        async move {
            let client = fixture.client_for(&fixture.root, mode).await;
            let document = fixture.document(if n % 3 == 0 { "mux.go" } else { "route.go" });
            for q in 0..queries {
                let method = [HOVER, DEFINITION, REFERENCES][q % 3];
                match client.position(method, &document, 0, (q % 8) as u32).await {
                    Ok(_) => ok.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        eprintln!("client {} query {} failed: {}", n, q, e);
                        failed.fetch_add(1, Ordering::Relaxed)
                    }
                };
                if !pause.is_zero() && q % 5 == 4 {
                    tokio::time::sleep(pause).await;
                }
            }
            client.close().await;
        }
    }))
    .await;

    StressTestResults {
        total_operations: clients * queries,
        successful_operations: ok.load(Ordering::Relaxed),
        failed_operations: failed.load(Ordering::Relaxed),
        duration_ms: start.elapsed().as_millis(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_clients_two_sessions() {
    let fixture = ProxyFixture::with_launcher(FakeLauncher::with_latency(Duration::from_millis(5)));

    let results = run_clients(&fixture, 24, 12, Duration::ZERO).await;
    println!("{}", results);

    assert_eq!(results.failed_operations, 0);
    assert_eq!(results.successful_operations, results.total_operations);
    assert_eq!(fixture.launcher.launches(), 2);
    assert_eq!(fixture.launcher.queries(), results.total_operations);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clients_survive_aggressive_reaping() {
    let fixture = ProxyFixture::build(
        FakeLauncher::with_latency(Duration::from_millis(2)),
        xlang_proxy::testing::MemorySource::new(),
        ProxyOptions::default(),
    );
    // Clients pause longer than the idle timeout, so sessions get reaped
    // between their queries
    let reaper = spawn_reaper(
        fixture.proxy.registry().clone(),
        Duration::from_millis(10),
        Duration::from_millis(25),
    );

    let results = run_clients(&fixture, 8, 20, Duration::from_millis(60)).await;
    println!("{}", results);
    reaper.abort();

    assert_eq!(results.failed_operations, 0, "{}", results);
    // At most one live backend per (mode, root) at any time
    assert!(fixture.launcher.live_backends() <= 2);

    fixture.proxy.shutdown().await;
    assert_eq!(fixture.launcher.live_backends(), 0);
}
