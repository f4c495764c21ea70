use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Config;
use crate::port::allocate_port;
use crate::worker::Worker;

const CLUSTER_RPS_EMA_ALPHA: f64 = 0.2;

/// Owns the pool of workers, the cluster-wide smoothed request rate, and
/// the per-user request counters. Shared behind an `Arc` by the control
/// loop, dispatcher and HTTP plane.
pub struct Supervisor {
    workers: DashMap<u16, Arc<Worker>>,
    cluster_rps_bits: AtomicU64,
    rps_history: tokio::sync::Mutex<VecDeque<f64>>,
    user_requests: DashMap<String, u64>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: DashMap::new(),
            cluster_rps_bits: AtomicU64::new(0f64.to_bits()),
            rps_history: tokio::sync::Mutex::new(VecDeque::new()),
            user_requests: DashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub async fn initial_fill(&self, config: &Config) {
        for _ in 0..config.min_instances {
            self.start_instance(config).await;
        }
    }

    /// Spawns and registers a new worker, unless the pool is already at
    /// `maxInstances`. The worker is inserted into the map before it is
    /// started so concurrent readers never see a port without a `Worker`.
    pub async fn start_instance(&self, config: &Config) {
        if self.workers.len() >= config.max_instances {
            return;
        }
        let port = match allocate_port() {
            Ok(port) => port,
            Err(error) => {
                tracing::warn!(%error, "could not allocate a port for a new worker");
                return;
            }
        };
        let worker = Worker::new(port, config.model.clone(), config.max_concurrency);
        self.workers.insert(port, Arc::clone(&worker));
        if let Err(error) = worker.start().await {
            tracing::warn!(port, %error, "failed to start worker, removing from pool");
            self.workers.remove(&port);
        }
    }

    pub async fn kill_instance(&self, port: u16) {
        if let Some((_, worker)) = self.workers.remove(&port) {
            worker.kill().await;
        }
    }

    /// Drops a dead worker from the pool without attempting to kill it
    /// (its process has already exited; killing it again only produces a
    /// spurious warning log).
    pub fn remove_dead(&self, port: u16) {
        self.workers.remove(&port);
    }

    pub fn get(&self, port: u16) -> Option<Arc<Worker>> {
        self.workers.get(&port).map(|entry| Arc::clone(entry.value()))
    }

    pub fn enumerate(&self) -> Vec<Arc<Worker>> {
        self.workers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn eligible(&self) -> Vec<Arc<Worker>> {
        self.enumerate().into_iter().filter(|w| w.is_eligible()).collect()
    }

    pub fn cluster_rps(&self) -> f64 {
        f64::from_bits(self.cluster_rps_bits.load(Ordering::Relaxed))
    }

    pub async fn rps_history_snapshot(&self) -> Vec<f64> {
        self.rps_history.lock().await.iter().copied().collect()
    }

    /// Sums the current per-worker RPS, folds it into the cluster-wide EMA,
    /// then pushes the new EMA value into the bounded trend history.
    pub async fn tick_cluster_rate(&self, window: usize) {
        let raw: f64 = self.enumerate().iter().map(|w| w.rps()).sum();
        let prev = self.cluster_rps();
        let ema = CLUSTER_RPS_EMA_ALPHA * raw + (1.0 - CLUSTER_RPS_EMA_ALPHA) * prev;
        self.cluster_rps_bits.store(ema.to_bits(), Ordering::Relaxed);

        let mut history = self.rps_history.lock().await;
        history.push_back(ema);
        while history.len() > window {
            history.pop_front();
        }
    }

    /// Short-horizon trend: the change between the oldest and newest
    /// samples in the history window. Zero until at least two samples
    /// have accumulated.
    pub async fn trend(&self) -> f64 {
        let history = self.rps_history.lock().await;
        if history.len() < 2 {
            return 0.0;
        }
        history.back().copied().unwrap_or(0.0) - history.front().copied().unwrap_or(0.0)
    }

    pub fn record_user_request(&self, user: &str) {
        self.user_requests
            .entry(user.to_string())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    pub fn user_requests_snapshot(&self) -> Vec<(String, u64)> {
        self.user_requests.iter().map(|entry| (entry.key().clone(), *entry.value())).collect()
    }

    pub fn reset_users(&self) {
        self.user_requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tick_cluster_rate_is_zero_with_no_workers() {
        let supervisor = Supervisor::new();
        supervisor.tick_cluster_rate(5).await;
        assert_eq!(supervisor.cluster_rps(), 0.0);
    }

    #[tokio::test]
    async fn trend_is_zero_until_two_samples_exist() {
        let supervisor = Supervisor::new();
        assert_eq!(supervisor.trend().await, 0.0);
        supervisor.tick_cluster_rate(5).await;
        assert_eq!(supervisor.trend().await, 0.0);
    }

    #[tokio::test]
    async fn history_is_bounded_by_window() {
        let supervisor = Supervisor::new();
        for _ in 0..10 {
            supervisor.tick_cluster_rate(3).await;
        }
        assert_eq!(supervisor.rps_history_snapshot().await.len(), 3);
    }

    #[test]
    fn user_requests_accumulate_and_reset() {
        let supervisor = Supervisor::new();
        supervisor.record_user_request("alice");
        supervisor.record_user_request("alice");
        supervisor.record_user_request("bob");
        let snapshot = supervisor.user_requests_snapshot();
        assert_eq!(snapshot.len(), 2);
        supervisor.reset_users();
        assert!(supervisor.user_requests_snapshot().is_empty());
    }
}
