//! Fan-out of [`WorkflowEvent`]s from the apply workflow to its observers
//! (UI progress, audit sinks).
//!
//! Delivery is sequential in registration order and best effort: a listener
//! that fails is reported back to the publisher but never blocks the rest.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, warn};
use safenet_core::WorkflowEvent;
use thiserror::Error;
use tokio::sync::RwLock;

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &WorkflowEvent) -> anyhow::Result<()>;
}

type Listeners = IndexMap<String, Arc<dyn EventListener>>;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("listener '{0}' already registered")]
    ListenerExists(String),
    #[error("listener '{0}' not found")]
    ListenerNotFound(String),
    #[error("event not delivered to {}: {}", .0.len(), DeliveryFailures(.0))]
    Undelivered(Vec<DeliveryFailure>),
}

impl EventBusError {
    /// Listeners that rejected a published event
    pub fn listener_failures(&self) -> Option<&[DeliveryFailure]> {
        match self {
            EventBusError::Undelivered(failures) => Some(failures),
            _ => None,
        }
    }
}

/// A listener that returned an error for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub listener: String,
    pub error: String,
}

struct DeliveryFailures<'a>(&'a [DeliveryFailure]);

impl fmt::Display for DeliveryFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} ({})", failure.listener, failure.error)?;
        }
        Ok(())
    }
}

/// Cloneable handle; clones share one listener table
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_listener<L>(
        &self,
        name: impl Into<String>,
        listener: L,
    ) -> Result<(), EventBusError>
    where
        L: EventListener + 'static,
    {
        let name = name.into();
        let mut listeners = self.listeners.write().await;
        if listeners.contains_key(&name) {
            return Err(EventBusError::ListenerExists(name));
        }
        debug!("Event listener {} registered", name);
        listeners.insert(name, Arc::new(listener));
        Ok(())
    }

    pub async fn unregister_listener(&self, name: &str) -> Result<(), EventBusError> {
        match self.listeners.write().await.shift_remove(name) {
            Some(_) => {
                debug!("Event listener {} removed", name);
                Ok(())
            }
            None => Err(EventBusError::ListenerNotFound(name.to_string())),
        }
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn publish(&self, event: WorkflowEvent) -> Result<(), EventBusError> {
        // Lock is not held across listener calls
        let targets: Vec<(String, Arc<dyn EventListener>)> = self
            .listeners
            .read()
            .await
            .iter()
            .map(|(name, listener)| (name.clone(), listener.clone()))
            .collect();

        let mut failures = Vec::new();
        for (listener, target) in targets {
            if let Err(e) = target.on_event(&event).await {
                warn!("Event listener {} failed: {}", listener, e);
                failures.push(DeliveryFailure {
                    listener,
                    error: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EventBusError::Undelivered(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safenet_core::WorkflowState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    struct CountingListener {
        counter: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventListener for CountingListener {
        async fn on_event(&self, _event: &WorkflowEvent) -> anyhow::Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingListener;

    #[async_trait]
    impl EventListener for FailingListener {
        async fn on_event(&self, _event: &WorkflowEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    struct OrderListener {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventListener for OrderListener {
        async fn on_event(&self, _event: &WorkflowEvent) -> anyhow::Result<()> {
            self.seen.lock().await.push(self.name);
            Ok(())
        }
    }

    fn testing_event() -> WorkflowEvent {
        WorkflowEvent::StateChanged {
            attempt_id: Uuid::new_v4(),
            state: WorkflowState::Testing,
        }
    }

    #[tokio::test]
    async fn test_listener_registration_and_publish() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register_listener(
            "counter",
            CountingListener {
                counter: Arc::clone(&counter),
            },
        )
        .await
        .unwrap();

        bus.publish(testing_event()).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_listeners() {
        let bus = EventBus::new();
        bus.register_listener("audit", FailingListener).await.unwrap();
        assert!(matches!(
            bus.register_listener("audit", FailingListener).await,
            Err(EventBusError::ListenerExists(_))
        ));

        bus.unregister_listener("audit").await.unwrap();
        assert!(matches!(
            bus.unregister_listener("audit").await,
            Err(EventBusError::ListenerNotFound(_))
        ));
        assert_eq!(bus.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_delivery() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register_listener("broken", FailingListener).await.unwrap();
        bus.register_listener(
            "counter",
            CountingListener {
                counter: Arc::clone(&counter),
            },
        )
        .await
        .unwrap();

        let err = bus.publish(testing_event()).await.unwrap_err();
        let failures = err.listener_failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].listener, "broken");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_message_names_listeners() {
        let bus = EventBus::new();
        bus.register_listener("audit", FailingListener).await.unwrap();
        bus.register_listener("ui", FailingListener).await.unwrap();

        let err = bus.publish(testing_event()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "event not delivered to 2: audit (sink unavailable); ui (sink unavailable)"
        );
    }

    #[tokio::test]
    async fn test_registration_order_is_delivery_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["ui", "audit", "journal"] {
            bus.register_listener(
                name,
                OrderListener {
                    name,
                    seen: Arc::clone(&seen),
                },
            )
            .await
            .unwrap();
        }

        bus.publish(testing_event()).await.unwrap();
        assert_eq!(*seen.lock().await, vec!["ui", "audit", "journal"]);
    }
}
