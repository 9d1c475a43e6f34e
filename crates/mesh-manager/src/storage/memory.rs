//! In-process mesh storage
//!
//! A process-local [`MeshStorage`] implementation. A single write lock over
//! the map makes every mutation linearizable, and subscriber notifications
//! are enqueued while the lock is held so delivery order matches commit
//! order per subscriber.

use super::{MeshStorage, StorageEvent, SubscribeFn, SubscriptionHandle};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

struct Subscriber {
    id: Uuid,
    prefix: String,
    tx: mpsc::UnboundedSender<StorageEvent>,
}

/// In-memory linearizable key-value store with prefix iteration and
/// change subscriptions. Expired values are dropped lazily on read.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<BTreeMap<String, StoredValue>>>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(subscribers: &[Subscriber], event: StorageEvent) {
        for sub in subscribers {
            if event.key().starts_with(&sub.prefix) {
                // A closed receiver means the drain task is gone; the
                // subscriber is pruned on cancel, so ignore the send error.
                let _ = sub.tx.send(event.clone());
            }
        }
    }
}

#[async_trait]
impl MeshStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<String> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(stored) if !stored.is_expired() => Ok(stored.value.clone()),
            _ => Err(Error::KeyNotFound(key.to_string())),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".to_string()));
        }
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        trace!(key = %key, "stored value");
        // Notify while holding the write lock so subscribers observe
        // changes in commit order.
        let subscribers = self.subscribers.read();
        Self::notify(
            &subscribers,
            StorageEvent::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_none() {
            return Err(Error::KeyNotFound(key.to_string()));
        }
        let subscribers = self.subscribers.read();
        Self::notify(
            &subscribers,
            StorageEvent::Delete {
                key: key.to_string(),
            },
        );
        Ok(())
    }

    async fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| !v.is_expired())
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect())
    }

    fn subscribe(&self, prefix: &str, f: SubscribeFn) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<StorageEvent>();
        self.subscribers.write().push(Subscriber {
            id,
            prefix: prefix.to_string(),
            tx,
        });
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                f(event);
            }
        });
        let subscribers = Arc::downgrade(&self.subscribers);
        SubscriptionHandle::new(
            id,
            Box::new(move || {
                if let Some(subs) = subscribers.upgrade() {
                    subs.write().retain(|s| s.id != id);
                }
            }),
        )
    }
}
