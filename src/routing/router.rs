//! Handler table and in-order dispatch of inbound messages

use super::filter::TopicFilter;
use crate::error::AgentError;
use crate::protocol::payload_summary;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// Receives messages whose topic matches the filter it was registered for
#[async_trait]
pub trait TopicHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<(), AgentError>;
}

struct Route {
    filter: TopicFilter,
    handler: Arc<dyn TopicHandler>,
}

/// Maps topic filters to handlers.
///
/// Dispatch is sequential: the caller feeds messages one at a time, so the
/// order the broker delivered them in is the order handlers see them.
#[derive(Default)]
pub struct TopicRouter {
    routes: RwLock<Vec<Route>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `filter`, replacing any handler already bound
    /// to the same filter.
    pub fn register(&self, filter: TopicFilter, handler: Arc<dyn TopicHandler>) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        match routes.iter_mut().find(|route| route.filter == filter) {
            Some(route) => {
                debug!(filter = %filter, handler = handler.name(), "Replacing topic handler");
                route.handler = handler;
            }
            None => {
                debug!(filter = %filter, handler = handler.name(), "Registering topic handler");
                routes.push(Route { filter, handler });
            }
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn matching_handlers(&self, topic: &str) -> Vec<Arc<dyn TopicHandler>> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|route| route.filter.matches(topic))
            .map(|route| route.handler.clone())
            .collect()
    }

    /// Invoke every handler matching `topic`, returning how many ran.
    ///
    /// Handler errors and panics are logged and never propagate.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let handlers = self.matching_handlers(topic);

        if handlers.is_empty() {
            warn!(
                topic = %topic,
                size = payload.len(),
                "No handler registered for inbound message"
            );
            return 0;
        }

        for handler in &handlers {
            let outcome = AssertUnwindSafe(handler.handle(topic, payload))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        handler = handler.name(),
                        topic = %topic,
                        size = payload.len(),
                        payload = %payload_summary(payload),
                        error = %e.sanitized(),
                        "Topic handler failed"
                    );
                }
                Err(_) => {
                    error!(
                        handler = handler.name(),
                        topic = %topic,
                        size = payload.len(),
                        "Topic handler panicked"
                    );
                }
            }
        }

        handlers.len()
    }
}
