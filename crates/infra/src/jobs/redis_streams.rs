//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream**: `farmflow:queue:{name}`; one entry per job, payload under `job`
//! - **Consumer group**: `{name}:workers`; every worker process is a named consumer
//! - **Redelivery**: entries pending longer than the visibility timeout are
//!   claimed by the next consumer that polls (`XPENDING IDLE` + `XCLAIM`)
//! - **Dedup**: `farmflow:queue:{name}:dedup:{forecastId}` (`SET NX`) makes
//!   enqueue idempotent per forecast; marker and `XADD` are written by one
//!   script, so a marker never exists without its entry
//! - **Dead-letter queue**: `farmflow:queue:{name}:dlq`
//!
//! A failed delivery is left pending, so its retry delay is the visibility
//! timeout rather than the policy's backoff. An ack from a delivery that was
//! already reclaimed is not detected here; the record lease covers that case.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadReply};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use super::queue::{JobQueue, QueueError};
use super::types::{DeadLetterEntry, Delivery, EnqueueOutcome, FailOutcome, ForecastJob, QueueSettings};

const KEY_PREFIX: &str = "farmflow:queue";

/// Dedup markers outlive any realistic retry window.
const DEDUP_TTL_SECS: u64 = 24 * 60 * 60;

/// `SET NX` the dedup marker and `XADD` the job atomically. Returns the entry
/// id, or nil when the marker already exists. A failed `XADD` releases the marker.
const ENQUEUE_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[1], 1, 'NX', 'EX', ARGV[1]) then
  return false
end
local id = redis.pcall('XADD', KEYS[2], '*', 'forecast_id', ARGV[2], 'job', ARGV[3])
if type(id) == 'table' and id.err then
  redis.call('DEL', KEYS[1])
end
return id
"#;

/// Pending entries inspected per poll.
const PENDING_SCAN: usize = 10;

pub struct RedisJobQueue {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    settings: QueueSettings,
    stream_key: String,
    group: String,
    dlq_key: String,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("dlq_key", &self.dlq_key)
            .finish()
    }
}

impl RedisJobQueue {
    /// Create a queue client. No connection is made until first use.
    ///
    /// * `redis_url` - e.g. `redis://:password@localhost:6379`
    pub fn new(redis_url: impl AsRef<str>, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let stream_key = format!("{KEY_PREFIX}:{}", settings.name);
        Ok(Self {
            client,
            conn: OnceCell::new(),
            group: format!("{}:workers", settings.name),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            settings,
        })
    }

    fn dedup_key(&self, job: &ForecastJob) -> String {
        format!("{}:dedup:{}", self.stream_key, job.forecast_id)
    }

    fn visibility_ms(&self) -> u64 {
        self.settings.visibility_timeout.as_millis() as u64
    }

    /// Shared multiplexed connection; creates the consumer group on first use.
    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let mut conn = self
                    .client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;

                // BUSYGROUP means it already exists.
                let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(&self.stream_key)
                    .arg(&self.group)
                    .arg("0")
                    .arg("MKSTREAM")
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = created {
                    if e.code() != Some("BUSYGROUP") {
                        return Err(QueueError::Command(format!("XGROUP CREATE failed: {e}")));
                    }
                }

                Ok::<_, QueueError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    fn parse_entry(&self, entry: &StreamId) -> Result<ForecastJob, QueueError> {
        let raw: String = entry.get("job").ok_or_else(|| QueueError::Malformed {
            message_id: entry.id.clone(),
            reason: "missing job field".to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| QueueError::Malformed {
            message_id: entry.id.clone(),
            reason: e.to_string(),
        })
    }

    /// Move an entry to the DLQ and drop it from the stream.
    async fn send_to_dlq(
        &self,
        conn: &mut MultiplexedConnection,
        message_id: &str,
        job_json: &str,
        attempts: u32,
        reason: &str,
    ) -> Result<(), QueueError> {
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(message_id)
            .arg("attempts")
            .arg(attempts)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("job")
            .arg(job_json)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("DLQ XADD failed: {e}")))?;

        self.remove(conn, message_id).await?;

        warn!(
            queue = %self.settings.name,
            message_id = %message_id,
            attempts,
            reason = %reason,
            "job dead-lettered"
        );
        Ok(())
    }

    async fn remove(&self, conn: &mut MultiplexedConnection, message_id: &str) -> Result<(), QueueError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(message_id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(message_id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XDEL failed: {e}")))?;
        Ok(())
    }

    /// Claim the oldest entry whose delivery timed out, dead-lettering exhausted ones.
    async fn reclaim(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Option<Delivery>, QueueError> {
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.visibility_ms())
            .arg("-")
            .arg("+")
            .arg(PENDING_SCAN)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;

        for p in pending.ids {
            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(consumer)
                .arg(self.visibility_ms())
                .arg(&p.id)
                .query_async(conn)
                .await
                .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;

            // Another consumer won the claim, or the entry was deleted.
            let Some(entry) = claimed.ids.into_iter().next() else {
                continue;
            };

            let delivered = p.times_delivered as u32;
            let raw: String = entry.get("job").unwrap_or_default();
            if !self.settings.retry.should_retry(delivered) {
                self.send_to_dlq(conn, &entry.id, &raw, delivered, "visibility timeout expired")
                    .await?;
                continue;
            }

            let job = match self.parse_entry(&entry) {
                Ok(job) => job,
                Err(e) => {
                    self.send_to_dlq(conn, &entry.id, &raw, delivered, &e.to_string()).await?;
                    return Err(e);
                }
            };
            debug!(
                queue = %self.settings.name,
                message_id = %entry.id,
                attempt = delivered + 1,
                "reclaimed timed-out delivery"
            );
            return Ok(Some(Delivery {
                message_id: entry.id,
                attempt: delivered + 1,
                job,
            }));
        }

        Ok(None)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.settings.name
    }

    #[instrument(
        skip(self, job),
        fields(stream_key = %self.stream_key, forecast_id = %job.forecast_id),
        err
    )]
    async fn enqueue(&self, job: ForecastJob) -> Result<EnqueueOutcome, QueueError> {
        let payload = serde_json::to_string(&job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;

        let added: Option<String> = redis::Script::new(ENQUEUE_SCRIPT)
            .key(self.dedup_key(&job))
            .key(&self.stream_key)
            .arg(DEDUP_TTL_SECS)
            .arg(job.forecast_id.to_string())
            .arg(&payload)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("enqueue failed: {e}")))?;

        match added {
            Some(id) => {
                debug!(message_id = %id, "job added to stream");
                Ok(EnqueueOutcome::Enqueued)
            }
            None => Ok(EnqueueOutcome::Duplicate),
        }
    }

    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;

        if let Some(delivery) = self.reclaim(&mut conn, consumer).await? {
            return Ok(Some(delivery));
        }

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        let Some(entry) = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
        else {
            return Ok(None);
        };

        match self.parse_entry(&entry) {
            Ok(job) => Ok(Some(Delivery {
                message_id: entry.id,
                attempt: 1,
                job,
            })),
            Err(e) => {
                let raw: String = entry.get("job").unwrap_or_default();
                self.send_to_dlq(&mut conn, &entry.id, &raw, 1, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        self.remove(&mut conn, &delivery.message_id).await
    }

    #[instrument(
        skip(self, delivery),
        fields(message_id = %delivery.message_id, attempt = delivery.attempt),
        err
    )]
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailOutcome, QueueError> {
        if self.settings.retry.should_retry(delivery.attempt) {
            return Ok(FailOutcome::Retrying {
                after: self.settings.visibility_timeout,
            });
        }

        let job_json =
            serde_json::to_string(&delivery.job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;
        self.send_to_dlq(&mut conn, &delivery.message_id, &job_json, delivery.attempt, reason)
            .await?;
        Ok(FailOutcome::DeadLettered)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = self.connection().await?;
        let range: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.dlq_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XRANGE failed: {e}")))?;

        let mut entries = Vec::with_capacity(range.ids.len());
        for entry in range.ids {
            let job = match self.parse_entry(&entry) {
                Ok(job) => job,
                Err(e) => {
                    warn!(message_id = %entry.id, error = %e, "skipping unreadable dead letter");
                    continue;
                }
            };
            let failed_at: Option<String> = entry.get("failed_at");
            entries.push(DeadLetterEntry {
                message_id: entry.get("original_message_id").unwrap_or_else(|| entry.id.clone()),
                job,
                attempts: entry.get("attempts").unwrap_or(0),
                reason: entry.get("reason").unwrap_or_default(),
                dead_lettered_at: failed_at
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(entries)
    }
}
