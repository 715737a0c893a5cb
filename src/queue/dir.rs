//! Durable queue backed by a directory tree.
//!
//! ```text
//! {root}/{name}/ready/{visible_at_ms}-{id}.json
//! {root}/{name}/leased/{lease_expires_ms}-{id}-{token}.json
//! {root}/{name}/dead/{id}.json
//! {root}/{name}/tmp/
//! ```
//!
//! Leasing, retrying and reclaiming are each a single `rename`, which is
//! atomic within one filesystem, so several processes can consume the same
//! queue: whoever renames a ready file into `leased/` first owns it. New
//! files are staged in `tmp/` and renamed into place. A message therefore
//! always sits in `ready/`, `leased/` or `dead/`; a dead letter is written
//! before its lease is removed. Lease and visibility deadlines are
//! encoded in the file names, which lets consumers find due work from a
//! directory listing alone. Timestamps are wall-clock milliseconds so they
//! survive restarts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DeadLetter, Delivery, JobQueue, TransformJob, DEFAULT_VISIBILITY_TIMEOUT};
use crate::error::QueueError;

/// Default pause between directory scans while waiting for work.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// On-disk message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    id: String,
    attempts: u32,
    payload: TransformJob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dead_at: Option<DateTime<Utc>>,
}

/// Directory-backed durable queue.
#[derive(Debug, Clone)]
pub struct DirQueue {
    name: String,
    ready: PathBuf,
    leased: PathBuf,
    dead: PathBuf,
    tmp: PathBuf,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl DirQueue {
    /// Open (creating if needed) queue `name` under `root`.
    pub fn open(root: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(QueueError::Io(format!("invalid queue name '{}'", name)));
        }
        let base = root.as_ref().join(&name);
        let queue = Self {
            ready: base.join("ready"),
            leased: base.join("leased"),
            dead: base.join("dead"),
            tmp: base.join("tmp"),
            name,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        for dir in [&queue.ready, &queue.leased, &queue.dead, &queue.tmp] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(queue)
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn write_atomic(&self, target: &Path, envelope: &Envelope) -> Result<(), QueueError> {
        let data = serde_json::to_vec(envelope)?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        self.tmp
            .join(format!("{}.json", uuid::Uuid::new_v4().simple()))
    }

    fn ready_path(&self, visible_at_ms: i64, id: &str) -> PathBuf {
        self.ready
            .join(format!("{:020}-{}.json", visible_at_ms.max(0), id))
    }

    /// Move leases whose deadline passed back to `ready/`.
    async fn reclaim_expired(&self, now_ms: i64) -> Result<(), QueueError> {
        for (deadline, file) in sorted_entries(&self.leased).await? {
            if deadline > now_ms {
                break;
            }
            let Some(id) = file.split('-').nth(1) else {
                continue;
            };
            let target = self.ready_path(now_ms, id);
            match tokio::fs::rename(self.leased.join(&file), &target).await {
                Ok(()) => {
                    debug!(queue = %self.name, id = %id, "Reclaimed expired lease");
                }
                // Settled or reclaimed by someone else in the meantime
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Try to lease one due message.
    async fn try_receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now_ms = now_millis();
        self.reclaim_expired(now_ms).await?;

        for (visible_at, file) in sorted_entries(&self.ready).await? {
            if visible_at > now_ms {
                break;
            }
            let Some(id) = file.strip_suffix(".json").and_then(|f| f.split_once('-')).map(|(_, id)| id) else {
                continue;
            };

            let token = uuid::Uuid::new_v4().simple().to_string();
            let expires_ms = now_ms + self.visibility_timeout.as_millis() as i64;
            let tag = format!("{:020}-{}-{}.json", expires_ms, id, token);
            let leased_path = self.leased.join(&tag);

            match tokio::fs::rename(self.ready.join(&file), &leased_path).await {
                Ok(()) => {}
                // Another consumer won the race
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let mut envelope = match read_envelope(&leased_path).await {
                Ok(envelope) => envelope,
                Err(QueueError::Serialization(message)) => {
                    warn!(queue = %self.name, file = %file, error = %message, "Dropping malformed message");
                    self.move_to_dead_raw(&leased_path, id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            envelope.attempts += 1;
            self.write_atomic(&leased_path, &envelope).await?;

            return Ok(Some(Delivery {
                tag,
                attempt: envelope.attempts,
                job: envelope.payload,
            }));
        }

        Ok(None)
    }

    async fn move_to_dead_raw(&self, path: &Path, id: &str) -> Result<(), QueueError> {
        let target = self.dead.join(format!("{}.raw", id));
        tokio::fs::rename(path, target).await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for DirQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: TransformJob) -> Result<(), QueueError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let envelope = Envelope {
            id: id.clone(),
            attempts: 0,
            payload: job,
            reason: None,
            dead_at: None,
        };
        self.write_atomic(&self.ready_path(now_millis(), &id), &envelope)
            .await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_receive().await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        match tokio::fs::remove_file(self.leased.join(&delivery.tag)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::StaleDelivery(delivery.tag.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let tag = &delivery.tag;
        let id = lease_id(tag).ok_or_else(|| QueueError::StaleDelivery(tag.clone()))?;
        let visible_at = now_millis() + delay.as_millis() as i64;

        // One rename, so the message is in `leased/` or `ready/` at every instant
        match tokio::fs::rename(self.leased.join(tag), self.ready_path(visible_at, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::StaleDelivery(tag.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let leased_path = self.leased.join(&delivery.tag);
        let mut envelope = match tokio::fs::read(&leased_path).await {
            Ok(data) => serde_json::from_slice::<Envelope>(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::StaleDelivery(delivery.tag.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        envelope.reason = Some(reason.to_string());
        envelope.dead_at = Some(Utc::now());

        // The lease stays in place until the dead letter is durable
        let target = self.dead.join(format!("{}.json", envelope.id));
        self.write_atomic(&target, &envelope).await?;
        match tokio::fs::remove_file(&leased_path).await {
            Ok(()) => {}
            // Reclaimed after we read it; the redelivery is a duplicate
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(queue = %self.name, id = %envelope.id, "Lease reclaimed during dead-lettering");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let mut entries = tokio::fs::read_dir(&self.dead).await?;
        let mut dead = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let envelope = read_envelope(&path).await?;
            dead.push(DeadLetter {
                job: envelope.payload,
                attempts: envelope.attempts,
                reason: envelope.reason.unwrap_or_default(),
                dead_at: envelope.dead_at.unwrap_or_else(Utc::now),
            });
        }
        dead.sort_by_key(|d| d.dead_at);
        Ok(dead)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(sorted_entries(&self.ready).await?.len() + sorted_entries(&self.leased).await?.len())
    }
}

/// Message id from a `{expires}-{id}-{token}.json` lease tag.
fn lease_id(tag: &str) -> Option<&str> {
    tag.split('-').nth(1).filter(|id| !id.is_empty())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

async fn read_envelope(path: &Path) -> Result<Envelope, QueueError> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// `.json` files in `dir` with their leading timestamp, oldest first.
async fn sorted_entries(dir: &Path) -> Result<Vec<(i64, String)>, QueueError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(file) = entry.file_name().into_string() else {
            continue;
        };
        if !file.ends_with(".json") {
            continue;
        }
        let Some(stamp) = file.split('-').next().and_then(|s| s.parse::<i64>().ok()) else {
            continue;
        };
        files.push((stamp, file));
    }
    files.sort();
    Ok(files)
}
