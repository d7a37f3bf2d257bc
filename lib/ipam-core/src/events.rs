//! Domain event subscription

use crate::Result;
use async_trait::async_trait;
use ipam_api::DomainEvent;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Subscriber to domain events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str {
        "UnnamedHandler"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

/// Dispatches each event to every subscriber in subscription order
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        debug!("Subscribed {} to domain events", handler.name());
        self.handlers.write().await.push(handler);
    }

    /// Every handler runs even if an earlier one fails; the first error is returned
    pub async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let handlers = self.handlers.read().await.clone();
        let mut first_error = None;

        for handler in handlers {
            debug!("Dispatching {} to {}", event.name(), handler.name());
            if let Err(e) = handler.handle(event).await {
                error!("{} failed to handle {}: {}", handler.name(), event.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}
