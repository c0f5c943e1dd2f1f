use std::sync::Arc;
use std::time::Duration;

use lib_livedata::core::LiveContext;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Periodically reports queue length and owner statistics.
pub async fn run(ctx: Arc<LiveContext>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut check_interval = interval(period);
    let high_water = ctx.settings().high_water;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let queued = ctx.queue_length();
                let owners = ctx.owners();
                log::info!(
                    "Queue: {} pending | owners: {} members, {} users | data sources: {} | trees: {}",
                    queued,
                    owners.member_count(),
                    owners.user_count(),
                    owners.data_source_count(),
                    ctx.trees().len()
                );
                if queued > high_water {
                    log::warn!("Broadcast queue above high-water mark ({} > {}).", queued, high_water);
                }
            }
        }
    }
}
