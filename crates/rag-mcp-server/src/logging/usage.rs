use crate::config::UsageLoggerConfig;
use crate::database::models::{ToolKind, UsageEvent};
use anyhow::Result;
use flume::{bounded, Receiver, Sender};
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Anything that accepts usage events off the request path.
#[cfg_attr(test, mockall::automock)]
pub trait UsageSink: Send + Sync {
    fn log(&self, event: UsageEvent);
}

impl UsageSink for UsageLogger {
    fn log(&self, event: UsageEvent) {
        UsageLogger::log(self, event);
    }
}

/// Async usage logger with queue mechanism.
///
/// Events are enqueued without blocking the request path and flushed to the
/// append-only log tables in batches. A full queue drops events with a
/// warning rather than applying backpressure.
#[derive(Clone)]
pub struct UsageLogger {
    sender: Sender<UsageEvent>,
}

impl UsageLogger {
    /// Initialize logger with background workers.
    pub fn new(pool: PgPool, config: UsageLoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Initializing UsageLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        for worker_id in 0..config.worker_count {
            let pool = pool.clone();
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, pool, receiver, config).await;
            });
        }

        Self { sender }
    }

    /// Enqueue an event (non-blocking, fire-and-forget).
    pub fn log(&self, event: UsageEvent) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Failed to enqueue usage event (queue full?): {}", e);
        }
    }

    /// Worker loop - collects events into batches and flushes them.
    async fn worker_loop(
        worker_id: usize,
        pool: PgPool,
        receiver: Receiver<UsageEvent>,
        config: UsageLoggerConfig,
    ) {
        info!("Usage logger worker {} started", worker_id);

        let mut batch: Vec<UsageEvent> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(event)) => {
                        batch.push(event);
                    }
                    Ok(Err(_)) => {
                        // Channel closed, flush and exit
                        if !batch.is_empty() {
                            Self::flush_batch(&pool, &batch, worker_id).await;
                        }
                        info!("Usage logger worker {} shutting down (channel closed)", worker_id);
                        return;
                    }
                    Err(_) => {
                        // Timeout, flush what we have
                        break;
                    }
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(&pool, &batch, worker_id).await;
                batch.clear();
            } else {
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn flush_batch(pool: &PgPool, batch: &[UsageEvent], worker_id: usize) {
        debug!("Worker {} flushing {} usage events", worker_id, batch.len());

        for kind in [ToolKind::Search, ToolKind::Fetch] {
            let events: Vec<&UsageEvent> = batch.iter().filter(|e| e.kind == kind).collect();
            if events.is_empty() {
                continue;
            }
            if let Err(e) = Self::insert_batch(pool, kind, &events).await {
                error!(
                    "Worker {} failed to insert {} {} events: {}",
                    worker_id,
                    events.len(),
                    kind.as_str(),
                    e
                );
            }
        }
    }

    async fn insert_batch(pool: &PgPool, kind: ToolKind, events: &[&UsageEvent]) -> Result<usize> {
        let table = match kind {
            ToolKind::Search => "search_logs",
            ToolKind::Fetch => "fetch_logs",
        };
        let payload_column = match kind {
            ToolKind::Search => "query",
            ToolKind::Fetch => "url",
        };

        let mut query_builder = sqlx::QueryBuilder::new(format!(
            "INSERT INTO {} (user_id, ip, token_prefix, {}, result_count, \
             response_time_ms, status_code, error_code, created_at) ",
            table, payload_column
        ));

        query_builder.push_values(events, |mut b, event| {
            b.push_bind(&event.user_id)
                .push_bind(&event.ip)
                .push_bind(&event.token_prefix)
                .push_bind(&event.payload)
                .push_bind(event.result_count)
                .push_bind(event.response_time_ms)
                .push_bind(event.status_code)
                .push_bind(&event.error_code)
                .push_bind(event.created_at);
        });

        query_builder.build().execute(pool).await?;

        Ok(events.len())
    }
}
