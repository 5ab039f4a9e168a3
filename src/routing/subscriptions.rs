//! Subscriptions and the replay registry

use super::filter::TopicFilter;
use super::router::TopicHandler;
use rumqttc::QoS;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A filter, the QoS to request, and the handler that receives matches
#[derive(Clone)]
pub struct TopicSubscription {
    pub filter: TopicFilter,
    pub qos: QoS,
    pub handler: Arc<dyn TopicHandler>,
}

impl TopicSubscription {
    pub fn new(filter: TopicFilter, handler: Arc<dyn TopicHandler>) -> Self {
        Self {
            filter,
            qos: QoS::AtLeastOnce,
            handler,
        }
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Subscriptions made this session, in the order they were first made.
///
/// Replayed verbatim after every reconnect. Recording a filter twice keeps
/// its original position and takes the newer QoS and handler.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<TopicSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the filter was not recorded before.
    pub fn record(&self, subscription: TopicSubscription) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries
            .iter_mut()
            .find(|entry| entry.filter == subscription.filter)
        {
            Some(entry) => {
                *entry = subscription;
                false
            }
            None => {
                entries.push(subscription);
                true
            }
        }
    }

    pub fn snapshot(&self) -> Vec<TopicSubscription> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn filters(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| entry.filter.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use async_trait::async_trait;

    struct Noop(&'static str);

    #[async_trait]
    impl TopicHandler for Noop {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _topic: &str, _payload: &[u8]) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn sub(filter: &str, name: &'static str) -> TopicSubscription {
        TopicSubscription::new(TopicFilter::new(filter).unwrap(), Arc::new(Noop(name)))
    }

    #[test]
    fn test_insertion_order_kept() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.record(sub("/devices/d/config", "config")));
        assert!(registry.record(sub("/devices/d/state", "state")));
        assert!(registry.record(sub("/devices/d/commands/#", "commands")));

        assert_eq!(
            registry.filters(),
            vec!["/devices/d/config", "/devices/d/state", "/devices/d/commands/#"]
        );
    }

    #[test]
    fn test_duplicate_filter_keeps_position() {
        let registry = SubscriptionRegistry::new();
        registry.record(sub("/devices/d/config", "old"));
        registry.record(sub("/devices/d/state", "state"));
        assert!(!registry.record(sub("/devices/d/config", "new")));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].handler.name(), "new");
        assert_eq!(snapshot[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_debug_shows_handler_name() {
        let printed = format!("{:?}", sub("/devices/d/config", "config-logger"));
        assert!(printed.contains("config-logger"));
    }
}
