use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DrainTarget, OfflineQueue};
use crate::error::{ConnectorError, OrchestratorError};

/// Answers "can we reach the providers right now?".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the network is usable.
    async fn is_online(&self) -> bool;
}

/// Probe that issues a GET and treats any HTTP answer as online.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Create a probe for `url` with a per-request timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_online(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                debug!(url = %self.url, status = %response.status(), "Connectivity probe answered");
                true
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Connectivity probe failed");
                false
            }
        }
    }
}

/// Background task that tracks connectivity and drains the queue when it
/// comes back.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    online: Arc<AtomicBool>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Start probing every `interval`.
    ///
    /// `online` is shared with whoever decides between queueing and direct
    /// submission. The queue is drained on every offline to online edge and
    /// again on later ticks while entries remain.
    #[must_use]
    pub fn spawn(
        probe: Arc<dyn ConnectivityProbe>,
        queue: Arc<OfflineQueue>,
        target: Arc<dyn DrainTarget>,
        online: Arc<AtomicBool>,
        interval: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(
            probe,
            queue,
            target,
            online.clone(),
            interval,
            token.clone(),
        ));
        Self {
            online,
            token,
            handle,
        }
    }

    /// Last observed connectivity.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Stop the task and wait for it.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Connectivity monitor ended abnormally");
        }
    }
}

async fn run(
    probe: Arc<dyn ConnectivityProbe>,
    queue: Arc<OfflineQueue>,
    target: Arc<dyn DrainTarget>,
    online: Arc<AtomicBool>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        let now_online = probe.is_online().await;
        let was_online = online.swap(now_online, Ordering::SeqCst);

        if now_online != was_online {
            if now_online {
                info!("Connectivity restored");
            } else {
                warn!("Connectivity lost, submissions will be queued");
            }
        }

        if now_online && (!was_online || !queue.is_empty().await) {
            match queue.drain(target.as_ref()).await {
                Ok(report) => {
                    if !report.submitted.is_empty() || !report.rejected.is_empty() {
                        info!(
                            submitted = report.submitted.len(),
                            rejected = report.rejected.len(),
                            remaining = report.remaining,
                            "Offline queue drained"
                        );
                    }
                }
                Err(OrchestratorError::DrainInProgress) => debug!("Drain already running"),
                Err(e) => error!(error = %e, "Offline queue drain failed"),
            }
        }

        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobConfig, JobId};
    use crate::queue::{DrainDisposition, QueuedSubmission};

    struct Toggle(Arc<AtomicBool>);

    #[async_trait]
    impl ConnectivityProbe for Toggle {
        async fn is_online(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Accept;

    #[async_trait]
    impl DrainTarget for Accept {
        async fn submit_queued(
            &self,
            entry: &QueuedSubmission,
        ) -> crate::error::Result<DrainDisposition> {
            Ok(DrainDisposition::Submitted(JobId::new(entry.local_id.clone())))
        }
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OfflineQueue::open(dir.path().join("q.json")).await.unwrap());
        queue
            .enqueue(
                "mock",
                JobConfig::new("a", "gpu_1x_a100", "llama-3-8b", "s3://data/train.jsonl"),
            )
            .await
            .unwrap();

        let network = Arc::new(AtomicBool::new(false));
        let monitor = ConnectivityMonitor::spawn(
            Arc::new(Toggle(network.clone())),
            queue.clone(),
            Arc::new(Accept),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(5),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.is_online());
        assert_eq!(queue.len().await, 1);

        network.store(true, Ordering::SeqCst);
        for _ in 0..100 {
            if queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.is_empty().await);
        assert!(monitor.is_online());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_http_probe_unreachable_is_offline() {
        let probe = HttpProbe::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(!probe.is_online().await);
    }
}
