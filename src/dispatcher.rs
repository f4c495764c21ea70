use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{ClusterError, Result};
use crate::supervisor::Supervisor;
use crate::worker::Worker;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Picks the least-loaded eligible worker and forwards JSON requests to it.
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .expect("reqwest client configuration is valid");
        Self { supervisor, client }
    }

    /// Returns the eligible worker with the lowest composite load, breaking
    /// ties by port so selection is deterministic.
    pub fn select(&self) -> Result<Arc<Worker>> {
        self.supervisor
            .eligible()
            .into_iter()
            .min_by(|a, b| {
                a.composite_load()
                    .partial_cmp(&b.composite_load())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.port.cmp(&b.port))
            })
            .ok_or(ClusterError::NoEligibleWorker)
    }

    pub async fn route(&self, user: Option<&str>, body: Value) -> Result<Value> {
        let user = user.unwrap_or("anonymous");
        self.supervisor.record_user_request(user);

        let worker = self.select()?;
        let port = worker.port;
        let client = self.client.clone();
        let url = format!("http://127.0.0.1:{port}/api/prompt");

        worker
            .execute(move || async move {
                let response = client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ClusterError::Upstream { port, reason: e.to_string() })?;

                if !response.status().is_success() {
                    return Err(ClusterError::Upstream {
                        port,
                        reason: format!("upstream returned status {}", response.status()),
                    });
                }

                response
                    .json::<Value>()
                    .await
                    .map_err(|e| ClusterError::Upstream { port, reason: e.to_string() })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_fails_with_no_workers() {
        let supervisor = Supervisor::new();
        let dispatcher = Dispatcher::new(supervisor);
        assert!(matches!(dispatcher.select(), Err(ClusterError::NoEligibleWorker)));
    }
}
