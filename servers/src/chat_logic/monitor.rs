use lib_common::core::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Follows the room's message stream and logs a traffic summary every
/// `report_every`. A read-only consumer: falling behind only skips messages.
pub async fn run(dispatcher: Arc<Dispatcher>, report_every: Duration, shutdown: CancellationToken) {
    let mut stream = dispatcher.subscribe();
    let mut report_interval = interval(report_every);
    report_interval.tick().await;
    let mut seen: u64 = 0;
    let mut skipped: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Traffic monitor received shutdown signal.");
                break;
            }
            received = stream.recv() => match received {
                Ok(_) => seen += 1,
                Err(RecvError::Lagged(n)) => skipped += n,
                Err(RecvError::Closed) => break,
            },
            _ = report_interval.tick() => {
                let stats = dispatcher.room_stats();
                log::info!(
                    "Traffic: {} message(s) in the last {:?} ({} skipped), {} member(s), {} delivered / {} failed overall.",
                    seen,
                    report_every,
                    skipped,
                    stats.member_count,
                    stats.counters.delivered,
                    stats.counters.failed
                );
                seen = 0;
                skipped = 0;
            }
        }
    }
}
