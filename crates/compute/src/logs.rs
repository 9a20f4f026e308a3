//! Resumable log streaming on top of [`Connector::read_logs`].
//!
//! The stream remembers the cursor of the last line it yielded. Lines at or
//! before that cursor are dropped, so a provider that re-sends a page never
//! produces duplicates, and a caller that reconnects with the
//! `next_offset` of the last line it saw resumes without gaps.
//!
//! [`StreamRegistry`] keeps at most one live stream per job: opening a new
//! one ends the previous stream.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::connectors::Connector;
use crate::error::ConnectorError;
use crate::models::LogLine;

/// Tunables for a log stream.
#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    /// Wait between reads when no new output is available.
    pub poll_interval: Duration,
    /// Backoff for transient read failures.
    pub retry: RetryPolicy,
    /// Timeout of each read.
    pub call_timeout: Duration,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

struct Cursor {
    connector: Arc<dyn Connector>,
    remote_id: String,
    offset: u64,
    buffer: VecDeque<LogLine>,
    finished: bool,
    failed: bool,
    failures: u32,
    options: LogStreamOptions,
}

impl Cursor {
    async fn read_page(&mut self) -> Result<(), ConnectorError> {
        let read = self.connector.read_logs(&self.remote_id, self.offset);
        let page = tokio::time::timeout(self.options.call_timeout, read)
            .await
            .map_err(|_| ConnectorError::Transient("log read timed out".into()))??;

        for line in page.lines {
            if line.next_offset > self.offset {
                self.offset = line.next_offset;
                self.buffer.push_back(line);
            }
        }
        self.offset = self.offset.max(page.next_offset);
        self.finished = page.finished;
        Ok(())
    }

    async fn next_line(mut self) -> Option<(Result<LogLine, ConnectorError>, Self)> {
        loop {
            if let Some(line) = self.buffer.pop_front() {
                return Some((Ok(line), self));
            }
            if self.finished || self.failed {
                return None;
            }

            match self.read_page().await {
                Ok(()) => {
                    self.failures = 0;
                    if self.buffer.is_empty() && !self.finished {
                        tokio::time::sleep(self.options.poll_interval).await;
                    }
                }
                Err(e) if e.is_retryable() && self.options.retry.should_retry(self.failures) => {
                    let delay = self.options.retry.delay_for_attempt(self.failures);
                    self.failures += 1;
                    debug!(
                        remote_id = %self.remote_id,
                        error = %e,
                        attempt = self.failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Log read failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(remote_id = %self.remote_id, error = %e, "Log stream ended with error");
                    self.failed = true;
                    return Some((Err(e), self));
                }
            }
        }
    }
}

/// Stream log lines of `remote_id` starting after cursor `from_offset`.
///
/// The stream ends once the provider reports the log finished and every
/// buffered line has been yielded, or after the first non-retryable error
/// (which is yielded as the last item).
#[must_use]
pub fn log_stream(
    connector: Arc<dyn Connector>,
    remote_id: impl Into<String>,
    from_offset: u64,
    options: LogStreamOptions,
) -> BoxStream<'static, Result<LogLine, ConnectorError>> {
    let cursor = Cursor {
        connector,
        remote_id: remote_id.into(),
        offset: from_offset,
        buffer: VecDeque::new(),
        finished: false,
        failed: false,
        failures: 0,
        options,
    };
    stream::unfold(cursor, Cursor::next_line).boxed()
}

type Streams<K> = Arc<Mutex<HashMap<K, (u64, CancellationToken)>>>;

fn lock_streams<K>(streams: &Streams<K>) -> MutexGuard<'_, HashMap<K, (u64, CancellationToken)>> {
    streams.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Live streams keyed by owner, one per key.
#[derive(Debug)]
pub struct StreamRegistry<K> {
    streams: Streams<K>,
    next_generation: AtomicU64,
}

impl<K> Default for StreamRegistry<K> {
    fn default() -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }
}

/// Deregisters its stream when the stream is dropped.
struct Lease<K: Eq + Hash> {
    streams: Streams<K>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash> Drop for Lease<K> {
    fn drop(&mut self) {
        let mut streams = lock_streams(&self.streams);
        if streams.get(&self.key).is_some_and(|(g, _)| *g == self.generation) {
            streams.remove(&self.key);
        }
    }
}

impl<K> StreamRegistry<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stream` as the live stream of `key`, ending any previous
    /// one at its next poll.
    pub fn attach<T: Send + 'static>(
        &self,
        key: K,
        stream: BoxStream<'static, T>,
    ) -> BoxStream<'static, T> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = lock_streams(&self.streams).insert(key.clone(), (generation, token.clone()));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }

        let lease = Lease {
            streams: self.streams.clone(),
            key,
            generation,
        };
        stream
            .take_until(token.cancelled_owned())
            .map(move |item| {
                let _lease = &lease;
                item
            })
            .boxed()
    }

    /// Whether `key` has a live stream.
    #[must_use]
    pub fn is_live(&self, key: &K) -> bool {
        lock_streams(&self.streams).contains_key(key)
    }

    /// End the live stream of `key`, if any.
    pub fn end(&self, key: &K) {
        if let Some((_, token)) = lock_streams(&self.streams).remove(key) {
            token.cancel();
        }
    }
}
