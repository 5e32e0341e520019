//! Ingestion boundary: validates entity keys and queues events for the raw
//! log without ever blocking the writer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::export::health::HealthMetrics;
use crate::store::{EntityKey, RawEvent, Store};

/// Events moved from the queue into the raw log per wakeup.
pub const BATCH_SIZE: usize = 256;

/// Normalize a domain-style entity key.
///
/// Trims surrounding whitespace, lower-cases ASCII and drops one trailing
/// dot. Rejects empty keys, keys over `max_len` bytes and keys with inner
/// whitespace or control characters.
pub fn normalize_key(raw: &str, max_len: usize) -> Result<EntityKey, IngestError> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Err(IngestError::EmptyKey);
    }
    if trimmed.len() > max_len {
        return Err(IngestError::KeyTooLong {
            len: trimmed.len(),
            max: max_len,
        });
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(IngestError::InvalidKey);
    }

    Ok(EntityKey::from(trimmed.to_ascii_lowercase()))
}

/// Cloneable writer side of the ingest queue.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<RawEvent>,
    max_key_length: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl IngestHandle {
    /// Validate and enqueue one event. Accept or reject, never block.
    pub fn submit(&self, time: DateTime<Utc>, entity_key: &str) -> Result<(), IngestError> {
        let result = normalize_key(entity_key, self.max_key_length).and_then(|key| {
            self.tx
                .try_send(RawEvent {
                    time,
                    entity_key: key,
                })
                .map_err(|e| match e {
                    TrySendError::Full(_) => IngestError::QueueFull,
                    TrySendError::Closed(_) => IngestError::Closed,
                })
        });

        if let Some(health) = &self.health {
            match &result {
                Ok(()) => health.ingest_accepted.inc(),
                Err(e) => health.ingest_rejected.with_label_values(&[e.reason()]).inc(),
            }
        }

        if let Err(IngestError::QueueFull) = &result {
            warn!("ingest queue full, rejecting event");
        }

        result
    }

    /// Events currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Create the bounded ingest queue.
pub fn channel(
    cfg: &IngestConfig,
    health: Option<Arc<HealthMetrics>>,
) -> (IngestHandle, mpsc::Receiver<RawEvent>) {
    let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));

    if let Some(health) = &health {
        health.ingest_queue_capacity.set(cfg.channel_capacity as f64);
    }

    (
        IngestHandle {
            tx,
            max_key_length: cfg.max_key_length,
            health,
        },
        rx,
    )
}

/// Move queued events into the raw log until cancelled, then drain what
/// is left.
pub async fn run(
    mut rx: mpsc::Receiver<RawEvent>,
    store: Arc<Store>,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) {
    let mut batch: Vec<RawEvent> = Vec::with_capacity(BATCH_SIZE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                rx.close();
                let mut drained = 0;
                while rx.recv_many(&mut batch, BATCH_SIZE).await > 0 {
                    drained += store.raw().append_batch(batch.drain(..));
                }
                info!(drained, "ingest loop stopped");
                break;
            }

            received = rx.recv_many(&mut batch, BATCH_SIZE) => {
                if received == 0 {
                    debug!("ingest queue closed");
                    break;
                }
                store.raw().append_batch(batch.drain(..));
            }
        }

        if let Some(health) = &health {
            health.raw_events.set(store.raw().len() as f64);
            health.ingest_queue_length.set(rx.len() as f64);
        }
    }

    if let Some(health) = &health {
        health.raw_events.set(store.raw().len() as f64);
        health.ingest_queue_length.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(&*normalize_key("  Example.COM. ", 253).expect("valid"), "example.com");
        assert_eq!(normalize_key("   ", 253), Err(IngestError::EmptyKey));
        assert_eq!(normalize_key(".", 253), Err(IngestError::EmptyKey));
        assert_eq!(normalize_key("bad key.com", 253), Err(IngestError::InvalidKey));
        assert_eq!(normalize_key("tab\tkey", 253), Err(IngestError::InvalidKey));
        assert_eq!(
            normalize_key("abcdef", 5),
            Err(IngestError::KeyTooLong { len: 6, max: 5 })
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_when_full() {
        let cfg = IngestConfig {
            channel_capacity: 2,
            max_key_length: 253,
        };
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let (handle, _rx) = channel(&cfg, Some(Arc::clone(&health)));
        let now = at("2024-05-01T10:00:00Z");

        handle.submit(now, "a.com").expect("first");
        handle.submit(now, "b.com").expect("second");
        assert_eq!(handle.submit(now, "c.com"), Err(IngestError::QueueFull));
        assert_eq!(handle.queued(), 2);

        assert_eq!(health.ingest_accepted.get() as u64, 2);
        assert_eq!(
            health
                .ingest_rejected
                .with_label_values(&["queue_full"])
                .get() as u64,
            1
        );
    }

    #[tokio::test]
    async fn test_submit_after_close_is_rejected() {
        let (handle, rx) = channel(&IngestConfig::default(), None);
        drop(rx);
        assert_eq!(
            handle.submit(at("2024-05-01T10:00:00Z"), "a.com"),
            Err(IngestError::Closed)
        );
    }

    #[tokio::test]
    async fn test_run_drains_on_cancel() {
        let cfg = Config::default();
        let store = Arc::new(Store::new(cfg.levels.clone(), None, None).expect("store"));
        let (handle, rx) = channel(&cfg.ingest, None);
        let cancel = CancellationToken::new();

        for i in 0..1000 {
            let time = at("2024-05-01T10:00:00Z") + chrono::TimeDelta::milliseconds(i);
            handle.submit(time, "example.com").expect("queued");
        }

        cancel.cancel();
        run(rx, Arc::clone(&store), None, cancel).await;

        assert_eq!(store.raw().len(), 1000);
        let counts = store
            .raw()
            .count_range(at("2024-05-01T10:00:00Z"), at("2024-05-01T10:01:00Z"));
        assert_eq!(counts.get("example.com"), Some(&1000));
    }
}
