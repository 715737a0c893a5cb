use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{DeadLetter, Delivery, JobQueue, TransformJob, DEFAULT_VISIBILITY_TIMEOUT};
use crate::error::QueueError;

#[derive(Debug, Clone)]
struct Message {
    attempts: u32,
    available_at: Instant,
    job: TransformJob,
}

#[derive(Debug)]
struct Lease {
    message: Message,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    leased: HashMap<String, Lease>,
    dead: Vec<DeadLetter>,
    closed: bool,
}

impl State {
    /// Put every expired lease back at the front of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in expired {
            if let Some(lease) = self.leased.remove(&tag) {
                let mut message = lease.message;
                message.available_at = now;
                self.ready.push_front(message);
            }
        }
    }

    /// Earliest future instant at which something may become receivable.
    fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        let ready = self
            .ready
            .iter()
            .map(|m| m.available_at)
            .filter(|at| *at > now);
        let leases = self.leased.values().map(|l| l.expires_at);
        ready.chain(leases).min()
    }

    fn take_lease(&mut self, tag: &str) -> Result<Lease, QueueError> {
        self.leased
            .remove(tag)
            .ok_or_else(|| QueueError::StaleDelivery(tag.to_string()))
    }
}

/// In-process queue with lease-based redelivery.
///
/// Not durable: jobs live only as long as the process. Suited to tests and
/// to running the API and workers in one process.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    visibility_timeout: Duration,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_visibility_timeout(name, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Stop accepting and delivering jobs; waiting receivers return `Closed`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Jobs currently leased to a consumer.
    pub async fn leased_len(&self) -> usize {
        self.state.lock().await.leased.len()
    }

    /// Jobs waiting for a consumer, including delayed retries.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: TransformJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.ready.push_back(Message {
            attempts: 0,
            available_at: Instant::now(),
            job,
        });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before releasing the lock so an enqueue in between is not missed
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(QueueError::Closed);
                }

                let now = Instant::now();
                state.reclaim_expired(now);

                let position = state.ready.iter().position(|m| m.available_at <= now);
                if let Some(mut message) = position.and_then(|i| state.ready.remove(i)) {
                    message.attempts += 1;
                    let tag = uuid::Uuid::new_v4().to_string();
                    let delivery = Delivery {
                        tag: tag.clone(),
                        attempt: message.attempts,
                        job: message.job.clone(),
                    };
                    state.leased.insert(
                        tag,
                        Lease {
                            message,
                            expires_at: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(delivery));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_wakeup(now)
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().await.take_lease(&delivery.tag)?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let mut message = state.take_lease(&delivery.tag)?.message;
        message.available_at = Instant::now() + delay;
        state.ready.push_back(message);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let message = state.take_lease(&delivery.tag)?.message;
        state.dead.push(DeadLetter {
            job: message.job,
            attempts: message.attempts,
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.state.lock().await.dead.clone())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.ready.len() + state.leased.len())
    }
}
