// Cross-request progress aggregation and callback delivery.
//
// One mutex-guarded map holds the latest status per request. Inserts keep
// terminal messages and non-regressing (stage-weighted) updates; a periodic
// flush delivers the survivors to their callback URLs, each in its own task,
// with the lock released before any HTTP happens.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use vod_types::StatusMessage;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Period on which all entries are flushed to their callbacks.
    pub flush_interval: Duration,
    /// Entries with no update for this long are evicted as stalled.
    pub max_quiet_interval: Duration,
    /// Deadline for a single callback POST attempt.
    pub callback_attempt_timeout: Duration,
    /// Retries after the first callback attempt.
    pub callback_retries: u32,
    /// Base backoff between callback attempts.
    pub callback_backoff: Duration,
    /// Backoff cap.
    pub callback_max_backoff: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(15),
            max_quiet_interval: Duration::from_secs(30 * 60),
            callback_attempt_timeout: Duration::from_secs(5),
            callback_retries: 2,
            callback_backoff: Duration::from_millis(200),
            callback_max_backoff: Duration::from_secs(1),
        }
    }
}

struct Entry {
    message: StatusMessage,
    updated_at: Instant,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    client: reqwest::Client,
    config: AggregatorConfig,
}

/// Shared, explicitly constructed progress sink. `new` → `start` → `stop`;
/// never a process-global.
pub struct ProgressAggregator {
    inner: Arc<Inner>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressAggregator {
    pub fn new(client: reqwest::Client, config: AggregatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                client,
                config,
            }),
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Ingest one status update.
    ///
    /// The stored entry is replaced when it is absent, the update is
    /// terminal, or the update's weighted completion does not regress.
    /// A stored terminal entry is never replaced by a non-terminal one.
    pub fn submit(&self, message: StatusMessage) {
        let mut entries = self.inner.entries.lock();
        let replace = match entries.get(&message.request_id) {
            None => true,
            Some(existing) if existing.message.is_terminal() => message.is_terminal(),
            Some(existing) => {
                message.is_terminal()
                    || message.weighted_completion() >= existing.message.weighted_completion()
            }
        };
        if replace {
            entries.insert(
                message.request_id.clone(),
                Entry {
                    message,
                    updated_at: Instant::now(),
                },
            );
        } else {
            debug!(
                request_id = %message.request_id,
                status = %message.status,
                ratio = message.completion_ratio,
                "Dropped regressing status update"
            );
        }
    }

    /// Latest stored message for a request, if any.
    pub fn latest(&self, request_id: &str) -> Option<StatusMessage> {
        self.inner
            .entries
            .lock()
            .get(request_id)
            .map(|e| e.message.clone())
    }

    /// Spawn the periodic flush task.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // The loop must survive anything a flush does.
                        if let Err(panic) = AssertUnwindSafe(Inner::flush(&inner)).catch_unwind().await {
                            error!(?panic, "Progress flush panicked");
                        }
                    }
                }
            }
            // Final drain so terminal statuses submitted late still go out.
            if let Err(panic) = AssertUnwindSafe(Inner::flush(&inner)).catch_unwind().await {
                error!(?panic, "Final progress flush panicked");
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Stop the flush task, draining once more before returning.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run one flush cycle immediately.
    pub async fn flush_once(&self) {
        Inner::flush(&self.inner).await;
    }
}

impl Inner {
    async fn flush(inner: &Arc<Inner>) {
        let flush_started = Instant::now();

        let snapshot: Vec<StatusMessage> = {
            let mut entries = inner.entries.lock();
            entries.retain(|request_id, entry| {
                let quiet = flush_started.duration_since(entry.updated_at);
                if quiet > inner.config.max_quiet_interval {
                    warn!(request_id, quiet_secs = quiet.as_secs(), "Evicting stalled job");
                    false
                } else {
                    true
                }
            });
            entries.values().map(|e| e.message.clone()).collect()
        };

        if snapshot.is_empty() {
            return;
        }

        let mut sends: JoinSet<()> = JoinSet::new();
        for message in snapshot {
            if message.callback_url.is_empty() {
                continue;
            }
            let client = inner.client.clone();
            let config = inner.config.clone();
            sends.spawn(async move {
                if let Err(reason) = send_callback(&client, &config, &message).await {
                    warn!(
                        request_id = %message.request_id,
                        callback = %message.callback_url,
                        reason,
                        "Callback delivery failed"
                    );
                }
            });
        }
        while sends.join_next().await.is_some() {}

        // Evict only entries this flush attempted; a terminal that arrived
        // mid-flush waits for the next cycle.
        let mut entries = inner.entries.lock();
        entries.retain(|_, entry| {
            !(entry.message.is_terminal() && entry.updated_at <= flush_started)
        });
    }
}

async fn send_callback(
    client: &reqwest::Client,
    config: &AggregatorConfig,
    message: &StatusMessage,
) -> Result<(), String> {
    let body = serde_json::to_vec(message).map_err(|e| e.to_string())?;
    let mut delay = config.callback_backoff;
    let mut last_failure = String::new();

    for attempt in 0..=config.callback_retries {
        let result = client
            .post(&message.callback_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .timeout(config.callback_attempt_timeout)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => last_failure = format!("HTTP {}", response.status()),
            Err(err) => last_failure = err.to_string(),
        }
        if attempt < config.callback_retries {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(config.callback_max_backoff);
        }
    }
    Err(last_failure)
}
