use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;

const METRICS_INTERVAL: Duration = Duration::from_secs(2);
const CPU_SAMPLE_GAP: Duration = Duration::from_millis(100);
const LOAD_EMA_ALPHA: f64 = 0.2;

/// A single `ollama serve` subprocess bound to a loopback port, and the
/// live metrics the control loop and dispatcher read to make decisions.
///
/// Numeric fields are stored as atomics (floats bit-packed via
/// `f64::to_bits`/`from_bits`) so readers never block behind the process
/// lock. The lock only serializes the start/kill lifecycle and counting
/// in-flight requests against it.
pub struct Worker {
    pub port: u16,
    model: String,
    max_concurrency: u32,

    disabled: AtomicBool,
    inflight: AtomicI64,
    requests_in_window: AtomicI64,

    rps_bits: AtomicU64,
    moving_average_load_bits: AtomicU64,
    cpu_percent_bits: AtomicU64,
    memory_bytes: AtomicU64,
    last_used_millis: AtomicI64,

    process: Mutex<Option<Child>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub port: u16,
    pub model: String,
    pub disabled: bool,
    pub alive: bool,
    pub inflight: i64,
    pub rps: f64,
    pub moving_average_load: f64,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub composite_load: f64,
    pub idle_seconds: i64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Worker {
    pub fn new(port: u16, model: String, max_concurrency: u32) -> Arc<Self> {
        Arc::new(Self {
            port,
            model,
            max_concurrency,
            disabled: AtomicBool::new(false),
            inflight: AtomicI64::new(0),
            requests_in_window: AtomicI64::new(0),
            rps_bits: AtomicU64::new(0f64.to_bits()),
            moving_average_load_bits: AtomicU64::new(0f64.to_bits()),
            cpu_percent_bits: AtomicU64::new(0f64.to_bits()),
            memory_bytes: AtomicU64::new(0),
            last_used_millis: AtomicI64::new(now_millis()),
            process: Mutex::new(None),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn is_eligible(&self) -> bool {
        !self.is_disabled() && self.is_alive()
    }

    /// Best-effort liveness check. If the process lock is contended (a
    /// start or kill is in flight) the worker is reported alive rather
    /// than blocking the caller.
    pub fn is_alive(&self) -> bool {
        let Ok(mut guard) = self.process.try_lock() else {
            return true;
        };
        match guard.as_mut() {
            None => false,
            Some(child) => !matches!(child.try_wait(), Ok(Some(_))),
        }
    }

    /// Spawns the `ollama serve` process for this worker if one is not
    /// already running. Idempotent.
    pub async fn start(self: &Arc<Self>) -> crate::error::Result<()> {
        let mut guard = self.process.lock().await;
        if let Some(child) = guard.as_mut() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                return Ok(());
            }
        }

        let mut child = tokio::process::Command::new("ollama")
            .arg("serve")
            .env("OLLAMA_HOST", format!("127.0.0.1:{}", self.port))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(crate::error::ClusterError::SpawnFailed)?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(self.port, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(self.port, "stderr", stderr);
        }

        tracing::info!(port = self.port, model = %self.model, "worker started");
        *guard = Some(child);
        drop(guard);

        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run_metrics_ticker().await });
        Ok(())
    }

    /// Kills the underlying process if one is running. Idempotent.
    pub async fn kill(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(error) = child.kill().await {
                tracing::warn!(port = self.port, %error, "failed to kill worker process");
            } else {
                tracing::info!(port = self.port, "worker killed");
            }
        }
    }

    /// Brackets a forwarded request: increments in-flight/window counters
    /// before `call`; in an always-run finalizer after, decrements
    /// in-flight, stamps `lastUsed`, and folds the concurrency term into
    /// `movingAverageLoad`.
    pub async fn execute<F, Fut, T>(&self, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        self.requests_in_window.fetch_add(1, Ordering::Relaxed);
        let result = call().await;

        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.last_used_millis.store(now_millis(), Ordering::Relaxed);
        let concurrency_term = self.inflight() as f64 / self.max_concurrency.max(1) as f64;
        let prev = self.moving_average_load();
        let ema = LOAD_EMA_ALPHA * concurrency_term + (1.0 - LOAD_EMA_ALPHA) * prev;
        self.moving_average_load_bits.store(ema.to_bits(), Ordering::Relaxed);

        result
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn rps(&self) -> f64 {
        f64::from_bits(self.rps_bits.load(Ordering::Relaxed))
    }

    pub fn moving_average_load(&self) -> f64 {
        f64::from_bits(self.moving_average_load_bits.load(Ordering::Relaxed))
    }

    pub fn cpu_percent(&self) -> f64 {
        f64::from_bits(self.cpu_percent_bits.load(Ordering::Relaxed))
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    /// `(inflight / maxConcurrency + cpuPercent / 100) / 2`
    pub fn composite_load(&self) -> f64 {
        let concurrency_term = self.inflight() as f64 / self.max_concurrency.max(1) as f64;
        let cpu_term = self.cpu_percent() / 100.0;
        (concurrency_term + cpu_term) / 2.0
    }

    pub fn idle_for(&self) -> Duration {
        let elapsed = now_millis().saturating_sub(self.last_used_millis.load(Ordering::Relaxed));
        Duration::from_millis(elapsed.max(0) as u64)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            port: self.port,
            model: self.model.clone(),
            disabled: self.is_disabled(),
            alive: self.is_alive(),
            inflight: self.inflight(),
            rps: self.rps(),
            moving_average_load: self.moving_average_load(),
            cpu_percent: self.cpu_percent(),
            memory_bytes: self.memory_bytes(),
            composite_load: self.composite_load(),
            idle_seconds: self.idle_for().as_secs() as i64,
        }
    }

    /// Every `METRICS_INTERVAL`, samples CPU/memory (if alive) and rolls
    /// the request-count window over into an RPS figure. `movingAverageLoad`
    /// is not touched here — it is recomputed in `execute` as each request
    /// completes.
    ///
    /// The first tick is skipped so a freshly spawned process gets one
    /// full interval to come up before its first sample is taken.
    async fn run_metrics_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.is_alive() {
                let (cpu_percent, memory_bytes) = self.sample_usage().await;
                self.cpu_percent_bits.store(cpu_percent.to_bits(), Ordering::Relaxed);
                self.memory_bytes.store(memory_bytes, Ordering::Relaxed);
            }

            let window_count = self.requests_in_window.swap(0, Ordering::Relaxed);
            let rps = window_count as f64 / METRICS_INTERVAL.as_secs_f64();
            self.rps_bits.store(rps.to_bits(), Ordering::Relaxed);
        }
    }

    /// Samples CPU usage via two `refresh_process` calls separated by
    /// `CPU_SAMPLE_GAP`, normalized by core count and rounded to two
    /// decimals, plus the process's resident memory. Robust to a process
    /// that exits mid-sample.
    async fn sample_usage(&self) -> (f64, u64) {
        let Ok(mut guard) = self.process.try_lock() else {
            return (self.cpu_percent(), self.memory_bytes());
        };
        let Some(child) = guard.as_mut() else {
            return (0.0, 0);
        };
        let Some(pid) = child.id() else {
            return (0.0, 0);
        };
        let pid = Pid::from_u32(pid);

        let refresh_kind = ProcessRefreshKind::everything();
        let mut system = System::new_with_specifics(RefreshKind::nothing().with_processes(refresh_kind));
        system.refresh_processes_specifics(sysinfo::ProcessesToUpdate::Some(&[pid]), true, refresh_kind);
        tokio::time::sleep(CPU_SAMPLE_GAP).await;
        system.refresh_processes_specifics(sysinfo::ProcessesToUpdate::Some(&[pid]), true, refresh_kind);

        let Some(process) = system.process(pid) else {
            return (0.0, 0);
        };
        let cpu_percent = process.cpu_usage() as f64 / num_cpus::get().max(1) as f64;
        ((cpu_percent * 100.0).round() / 100.0, process.memory())
    }
}

fn forward_lines(port: u16, stream: &'static str, reader: impl tokio::io::AsyncRead + Unpin + Send + 'static) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(port, stream, "{line}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_load_averages_concurrency_and_cpu_terms() {
        let worker = Worker::new(1234, "llama3".to_string(), 4);
        worker.inflight.store(2, Ordering::Relaxed);
        worker.cpu_percent_bits.store(50f64.to_bits(), Ordering::Relaxed);
        // concurrency term 0.5, cpu term 0.5 -> average 0.5
        assert!((worker.composite_load() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn fresh_worker_has_no_process_and_is_not_eligible() {
        let worker = Worker::new(1235, "llama3".to_string(), 4);
        assert!(!worker.is_alive());
        assert!(!worker.is_eligible());
        assert!(worker.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn execute_folds_concurrency_term_into_moving_average() {
        let worker = Worker::new(1238, "llama3".to_string(), 2);
        // Hold one call in flight while a second completes, so the second
        // call's finalizer observes inflight == 1 and folds 1/2 into the EMA.
        let held = Arc::clone(&worker);
        let handle = tokio::spawn(async move {
            held.execute(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        worker.execute(|| async {}).await;
        let ema = worker.moving_average_load();
        assert!(ema > 0.0, "expected a nonzero EMA with a call still in flight, got {ema}");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn execute_tracks_inflight_count() {
        let worker = Worker::new(1236, "llama3".to_string(), 4);
        assert_eq!(worker.inflight(), 0);
        worker
            .execute(|| async {
                assert_eq!(worker.inflight(), 1);
            })
            .await;
        assert_eq!(worker.inflight(), 0);
    }

    #[test]
    fn disabling_a_worker_makes_it_ineligible() {
        let worker = Worker::new(1237, "llama3".to_string(), 4);
        worker.set_disabled(true);
        assert!(!worker.is_eligible());
    }
}
