//! Single-process job queue for tests/dev.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use farmflow_core::ForecastId;

use super::queue::{JobQueue, QueueError};
use super::types::{DeadLetterEntry, Delivery, EnqueueOutcome, FailOutcome, ForecastJob, QueueSettings};

/// Oldest dead letters are dropped beyond this many.
pub const MAX_DEAD_LETTERS: usize = 1000;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    job: ForecastJob,
    deliveries: u32,
    visible_at: Instant,
}

impl Entry {
    fn message_id(&self) -> String {
        self.seq.to_string()
    }
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    ready: Vec<Entry>,
    in_flight: HashMap<u64, (Entry, Instant)>,
    /// Forecasts with a job still queued or in flight.
    accepted: HashSet<ForecastId>,
    dead: VecDeque<DeadLetterEntry>,
}

/// In-memory at-least-once queue with visibility timeouts.
///
/// Delivery order is FIFO by enqueue order among visible entries; a redelivered
/// entry keeps its original position.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    settings: QueueSettings,
    state: Mutex<State>,
}

impl InMemoryJobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(State::default()),
        }
    }

    pub fn arc(settings: QueueSettings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Dead letters currently retained.
    pub fn dead_count(&self) -> usize {
        self.state().map(|s| s.dead.len()).unwrap_or(0)
    }

    /// Jobs waiting for delivery (including ones in backoff).
    pub fn waiting(&self) -> usize {
        self.state().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Deliveries handed out and not yet acked/failed.
    pub fn in_flight(&self) -> usize {
        self.state().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Command("queue state lock poisoned".to_string()))
    }

    fn dead_letter(&self, state: &mut State, entry: Entry, reason: String) {
        warn!(
            queue = %self.settings.name,
            message_id = %entry.message_id(),
            forecast_id = %entry.job.forecast_id,
            attempts = entry.deliveries,
            reason = %reason,
            "job dead-lettered"
        );
        state.accepted.remove(&entry.job.forecast_id);
        if state.dead.len() >= MAX_DEAD_LETTERS {
            state.dead.pop_front();
        }
        state.dead.push_back(DeadLetterEntry {
            message_id: entry.message_id(),
            job: entry.job,
            attempts: entry.deliveries,
            reason,
            dead_lettered_at: Utc::now(),
        });
    }

    /// Return timed-out deliveries to the ready list (or the DLQ when exhausted).
    fn reclaim_expired(&self, state: &mut State, now: Instant) {
        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in expired {
            let Some((mut entry, _)) = state.in_flight.remove(&seq) else {
                continue;
            };
            if self.settings.retry.should_retry(entry.deliveries) {
                debug!(
                    queue = %self.settings.name,
                    message_id = %entry.message_id(),
                    attempt = entry.deliveries,
                    "visibility timeout expired; redelivering"
                );
                entry.visible_at = now;
                state.ready.push(entry);
            } else {
                self.dead_letter(state, entry, "visibility timeout expired".to_string());
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn enqueue(&self, job: ForecastJob) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state()?;
        if !state.accepted.insert(job.forecast_id) {
            return Ok(EnqueueOutcome::Duplicate);
        }

        state.next_seq += 1;
        let entry = Entry {
            seq: state.next_seq,
            job,
            deliveries: 0,
            visible_at: Instant::now(),
        };
        state.ready.push(entry);
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state()?;
        self.reclaim_expired(&mut state, now);

        let next = state
            .ready
            .iter()
            .enumerate()
            .filter(|(_, e)| e.visible_at <= now)
            .min_by_key(|(_, e)| e.seq)
            .map(|(i, _)| i);

        let Some(index) = next else {
            return Ok(None);
        };

        let mut entry = state.ready.swap_remove(index);
        entry.deliveries += 1;

        let delivery = Delivery {
            message_id: entry.message_id(),
            attempt: entry.deliveries,
            job: entry.job.clone(),
        };
        debug!(
            queue = %self.settings.name,
            consumer,
            message_id = %delivery.message_id,
            attempt = delivery.attempt,
            "delivered job"
        );

        state
            .in_flight
            .insert(entry.seq, (entry, now + self.settings.visibility_timeout));
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let seq = parse_seq(&delivery.message_id)?;
        let mut state = self.state()?;

        match state.in_flight.get(&seq) {
            Some((entry, _)) if entry.deliveries == delivery.attempt => {
                let forecast_id = entry.job.forecast_id;
                state.in_flight.remove(&seq);
                state.accepted.remove(&forecast_id);
            }
            _ => debug!(
                queue = %self.settings.name,
                message_id = %delivery.message_id,
                attempt = delivery.attempt,
                "ack for superseded delivery ignored"
            ),
        }
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailOutcome, QueueError> {
        let seq = parse_seq(&delivery.message_id)?;
        let mut state = self.state()?;

        let current = matches!(
            state.in_flight.get(&seq),
            Some((entry, _)) if entry.deliveries == delivery.attempt
        );
        if !current {
            return Ok(FailOutcome::Superseded);
        }
        let Some((mut entry, _)) = state.in_flight.remove(&seq) else {
            return Ok(FailOutcome::Superseded);
        };

        if self.settings.retry.should_retry(entry.deliveries) {
            let after = self.settings.retry.delay_for_attempt(entry.deliveries);
            entry.visible_at = Instant::now() + after;
            state.ready.push(entry);
            Ok(FailOutcome::Retrying { after })
        } else {
            self.dead_letter(&mut state, entry, reason.to_string());
            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state()?;
        Ok(state.dead.iter().take(limit).cloned().collect())
    }
}

fn parse_seq(message_id: &str) -> Result<u64, QueueError> {
    message_id.parse().map_err(|_| QueueError::Malformed {
        message_id: message_id.to_string(),
        reason: "not an in-memory message id".to_string(),
    })
}
