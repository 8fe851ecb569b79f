//! Topic-based event bus
//!
//! Listeners subscribe with a topic pattern in the permission glob language
//! (`cdmf/module/*`, `app/?/ready`). `publish` delivers on the calling
//! thread; `post` hands delivery to the worker pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::concurrency::WorkerPool;
use crate::error::{CdmfError, Result};
use crate::properties::{Properties, PropertyValue};
use crate::security::glob_match;
use crate::utils::{contain_panic, current_timestamp_millis};
use crate::ListenerId;

/// Topic prefix of module lifecycle events
pub const MODULE_TOPIC_PREFIX: &str = "cdmf/module/";
/// Topic prefix of service registry events
pub const SERVICE_TOPIC_PREFIX: &str = "cdmf/service/";

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub properties: Properties,
    /// Publishing module, `None` for the framework itself
    pub source: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Event {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            properties: Properties::new(),
            source: None,
            timestamp: current_timestamp_millis(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.set(key, value);
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties.merge(&properties);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: ListenerId,
    owner: String,
    pattern: String,
    listener: EventListener,
}

struct BusShared {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    pool: Option<Arc<WorkerPool>>,
}

/// Event bus for one framework instance
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl EventBus {
    /// Bus without a pool; `post` degrades to `publish`
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_pool(pool: Arc<WorkerPool>) -> Self {
        Self::build(Some(pool))
    }

    fn build(pool: Option<Arc<WorkerPool>>) -> Self {
        Self {
            shared: Arc::new(BusShared {
                subscriptions: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                pool,
            }),
        }
    }

    /// Subscribe `owner` to topics matching `pattern`
    pub fn subscribe<F>(&self, owner: &str, pattern: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if pattern.is_empty() {
            return Err(CdmfError::invalid("topic pattern must not be empty"));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscriptions.write().push(Subscription {
            id,
            owner: owner.to_string(),
            pattern: pattern.to_string(),
            listener: Arc::new(listener),
        });
        debug!("{} subscribed to {} (listener {})", owner, pattern, id);
        Ok(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subs = self.shared.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Owner of a subscription
    pub fn owner_of(&self, id: ListenerId) -> Option<String> {
        self.shared
            .subscriptions
            .read()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.owner.clone())
    }

    /// Drop every subscription owned by `owner`
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut subs = self.shared.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.owner != owner);
        before - subs.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.read().len()
    }

    /// Deliver synchronously; returns the number of listeners reached
    pub fn publish(&self, event: &Event) -> usize {
        let listeners: Vec<EventListener> = self
            .shared
            .subscriptions
            .read()
            .iter()
            .filter(|s| glob_match(&s.pattern, &event.topic))
            .map(|s| s.listener.clone())
            .collect();

        let count = listeners.len();
        for listener in listeners {
            contain_panic(
                || listener(event),
                &format!("Event listener failed on {}", event.topic),
            );
        }
        count
    }

    /// Deliver on the worker pool
    pub fn post(&self, event: Event) -> Result<()> {
        match &self.shared.pool {
            Some(pool) => {
                let bus = self.clone();
                pool.execute(move || {
                    bus.publish(&event);
                })
                .map_err(|e| {
                    warn!("Cannot post event: {}", e);
                    CdmfError::from(e)
                })
            }
            None => {
                self.publish(&event);
                Ok(())
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
