use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::ConfigCell;
use crate::supervisor::Supervisor;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Runs the 1s tick loop until `shutdown` reports `true`: reaps dead
/// workers, rolls the cluster rate forward, then applies the scale-up and
/// scale-down rules.
pub async fn run(supervisor: Arc<Supervisor>, config: ConfigCell, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick(&supervisor, &config).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("control loop shutting down");
                    return;
                }
            }
        }
    }
}

async fn tick(supervisor: &Arc<Supervisor>, config: &ConfigCell) {
    let config = config.current();

    reap_and_replace(supervisor, &config).await;
    supervisor.tick_cluster_rate(config.predictive_rps_window).await;
    let trend = supervisor.trend().await;

    let snapshot = supervisor.enumerate();
    scale_up(supervisor, &config, &snapshot, trend).await;
    scale_down(supervisor, &config, &snapshot).await;
}

/// Drops workers whose process has exited and, if they were not disabled,
/// immediately replaces them so the pool does not shrink on its own.
async fn reap_and_replace(supervisor: &Arc<Supervisor>, config: &crate::config::Config) {
    for worker in supervisor.enumerate() {
        if worker.is_alive() {
            continue;
        }
        let port = worker.port;
        let disabled = worker.is_disabled();
        supervisor.remove_dead(port);
        tracing::warn!(port, "reaped dead worker");
        if !disabled {
            supervisor.start_instance(config).await;
        }
    }
}

/// Reactive scaling fires when the busiest eligible worker's load or the
/// cluster's smoothed RPS crosses its threshold. Predictive scaling fires
/// independently when the short-horizon RPS trend is accelerating; both
/// may trigger in the same tick. Neither rule fires when the eligible set
/// is empty (e.g. every worker is operator-disabled) — an empty eligible
/// set means the operator does not want the pool serving right now, and
/// spawning fresh enabled workers would override that intent.
async fn scale_up(
    supervisor: &Arc<Supervisor>,
    config: &crate::config::Config,
    snapshot: &[Arc<crate::worker::Worker>],
    trend: f64,
) {
    let eligible: Vec<_> = snapshot.iter().filter(|w| w.is_eligible()).collect();
    if eligible.is_empty() {
        return;
    }

    let max_load = eligible.iter().map(|w| w.composite_load()).fold(0.0_f64, f64::max);

    let reactive = max_load >= config.scale_up_load_threshold
        || supervisor.cluster_rps() >= config.scale_up_rps;
    if reactive {
        tracing::info!(max_load, cluster_rps = supervisor.cluster_rps(), "scaling up (reactive)");
        supervisor.start_instance(config).await;
    }

    if trend > config.predictive_rps_trend_threshold {
        tracing::info!(trend, "scaling up (predictive)");
        supervisor.start_instance(config).await;
    }
}

/// Kills idle, lightly loaded workers down to `minInstances`. Iterates the
/// snapshot taken at the start of the tick so killing one worker does not
/// change the iteration; the pool-size guard re-reads the live pool size
/// so a single tick cannot breach `minInstances`.
async fn scale_down(
    supervisor: &Arc<Supervisor>,
    config: &crate::config::Config,
    snapshot: &[Arc<crate::worker::Worker>],
) {
    let idle_timeout = Duration::from_secs(config.idle_timeout_seconds);
    for worker in snapshot {
        if supervisor.len() <= config.min_instances {
            break;
        }
        if worker.is_disabled() {
            continue;
        }
        if worker.idle_for() >= idle_timeout && worker.composite_load() <= config.scale_down_load_threshold {
            tracing::info!(port = worker.port, "scaling down");
            supervisor.kill_instance(worker.port).await;
        }
    }
}
