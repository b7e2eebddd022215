use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use messenger_core::events::{EventKind, SendPushQueueMessage};

use crate::handlers::{
    new_message::NewMessagePushHandler,
    tickets::{TicketCreatedPushHandler, TicketStatusChangedPushHandler},
    PushContext, PushHandler,
};
use crate::sender::PreparedPushNotification;

/// Mirror of the update registry, but independent: push payloads are richer
/// than realtime ones and only some events ever reach this queue.
pub struct PushRegistry {
    handlers: HashMap<EventKind, Arc<dyn PushHandler>>,
}

impl PushRegistry {
    pub fn build(handlers: Vec<Arc<dyn PushHandler>>) -> Result<Self> {
        let mut map: HashMap<EventKind, Arc<dyn PushHandler>> = HashMap::new();
        for handler in handlers {
            let kind = handler.event_kind();
            if map.insert(kind, handler).is_some() {
                return Err(anyhow!("Duplicate push handler registered for {}", kind));
            }
        }
        Ok(Self { handlers: map })
    }

    pub fn with_default_handlers() -> Result<Self> {
        Self::build(vec![
            Arc::new(NewMessagePushHandler),
            Arc::new(TicketCreatedPushHandler),
            Arc::new(TicketStatusChangedPushHandler),
        ])
    }

    pub async fn dispatch(
        &self,
        ctx: &PushContext,
        message: &SendPushQueueMessage,
    ) -> Result<Vec<PreparedPushNotification>> {
        let kind = message.source_event.event.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| anyhow!("No push handler registered for event {}", kind))?;
        handler.build(ctx, message).await
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_has_three_handlers() {
        let registry = PushRegistry::with_default_handlers().unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = PushRegistry::build(vec![
            Arc::new(TicketCreatedPushHandler),
            Arc::new(TicketCreatedPushHandler),
        ]);
        assert!(result.is_err());
    }
}
