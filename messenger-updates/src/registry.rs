use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use messenger_core::events::{EventKind, UpdateEnvelope};

use crate::handlers::{
    chat::{ChatCreatedHandler, UserDataChangedHandler},
    delivery_status::DeliveryStatusHandler,
    matches::{
        MatchCreatedHandler, MatchDataChangedHandler, MatchScoutsChangedHandler,
        MatchStateChangedHandler,
    },
    message::{
        MessageDeletedHandler, MessageEditedHandler, MessageSentHandler, ReactionUpdatedHandler,
        UserIsTypingHandler,
    },
    presence::PresenceStatusHandler,
    tickets::{TicketCreatedHandler, TicketStatusChangedHandler},
    HandlerContext, UpdateHandler,
};

/// Dispatch table, built once at startup from an explicit handler list. Two
/// handlers claiming the same event kind is a wiring bug and fails the
/// process before it consumes anything.
pub struct Registry {
    handlers: HashMap<EventKind, Arc<dyn UpdateHandler>>,
}

impl Registry {
    pub fn build(handlers: Vec<Arc<dyn UpdateHandler>>) -> Result<Self> {
        let mut map: HashMap<EventKind, Arc<dyn UpdateHandler>> = HashMap::new();
        for handler in handlers {
            let kind = handler.event_kind();
            if map.insert(kind, handler).is_some() {
                return Err(anyhow!("Duplicate handler registered for {}", kind));
            }
        }
        Ok(Self { handlers: map })
    }

    /// The full production handler set.
    pub fn with_default_handlers() -> Result<Self> {
        Self::build(vec![
            Arc::new(MessageSentHandler),
            Arc::new(MessageEditedHandler),
            Arc::new(MessageDeletedHandler),
            Arc::new(ReactionUpdatedHandler),
            Arc::new(UserIsTypingHandler),
            Arc::new(DeliveryStatusHandler),
            Arc::new(PresenceStatusHandler),
            Arc::new(TicketCreatedHandler),
            Arc::new(TicketStatusChangedHandler),
            Arc::new(MatchCreatedHandler),
            Arc::new(MatchDataChangedHandler),
            Arc::new(MatchStateChangedHandler),
            Arc::new(MatchScoutsChangedHandler),
            Arc::new(ChatCreatedHandler),
            Arc::new(UserDataChangedHandler),
        ])
    }

    pub async fn dispatch(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let kind = envelope.event.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| anyhow!("No handler registered for event {}", kind))?;
        handler.handle(ctx, envelope).await
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
