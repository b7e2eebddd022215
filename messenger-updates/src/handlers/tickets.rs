use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::connections::BroadcastOptions;
use messenger_core::events::{
    EventKind, Role, SendPushQueueMessage, SourceEvent, TicketStatus, UpdateEnvelope,
};
use messenger_core::protocol::ServerUpdate;
use tracing;

use super::{HandlerContext, UpdateHandler};

/// The only status transitions that produce a push; everything else is
/// broadcast-only.
pub fn is_pushed_transition(old: TicketStatus, new: TicketStatus) -> bool {
    matches!(
        (old, new),
        (TicketStatus::New, TicketStatus::InProgress)
            | (TicketStatus::InProgress, TicketStatus::Solved)
    )
}

async fn online_supervisors(ctx: &HandlerContext) -> Result<Vec<i64>> {
    let supervisors = ctx.storage.users.search_by_role(Role::Supervisor).await?;
    let ids: Vec<i64> = supervisors.iter().map(|u| u.id).collect();
    ctx.filter_online(&ids).await
}

pub struct TicketCreatedHandler;

#[async_trait]
impl UpdateHandler for TicketCreatedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::TicketCreated
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::TicketCreated {
            created_by_user_id,
            ticket_id,
            match_id,
            chat_id,
        } = &envelope.event
        else {
            return Err(anyhow!("TicketCreatedHandler received a foreign event"));
        };

        let mut audience = online_supervisors(ctx).await?;
        if !audience.contains(created_by_user_id) {
            audience.push(*created_by_user_id);
        }

        let update = ServerUpdate::TicketCreated {
            ticket_id: *ticket_id,
            chat_id: *chat_id,
            match_id: *match_id,
            created_by_user_id: *created_by_user_id,
        };
        ctx.broadcaster
            .broadcast(
                &audience,
                &update,
                BroadcastOptions {
                    skip_connection: envelope.cid.clone(),
                    skip_user: None,
                },
            )
            .await?;

        ctx.push_queue
            .enqueue(&SendPushQueueMessage::new(envelope.clone()))
            .await?;

        // Side channel is fire-and-forget: nothing in the dispatch path
        // waits on it, the spawned task owns the failure log.
        let notifier = ctx.notifier.clone();
        let (ticket_id, chat_id, creator) = (*ticket_id, *chat_id, *created_by_user_id);
        tokio::spawn(async move {
            if let Err(e) = notifier.ticket_created(ticket_id, chat_id, creator).await {
                tracing::warn!("Ticket {} side-channel notification failed: {}", ticket_id, e);
            }
        });

        Ok(())
    }
}

pub struct TicketStatusChangedHandler;

#[async_trait]
impl UpdateHandler for TicketStatusChangedHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::TicketStatusChanged
    }

    async fn handle(&self, ctx: &HandlerContext, envelope: &UpdateEnvelope) -> Result<()> {
        let SourceEvent::TicketStatusChanged {
            changed_by_user_id,
            ticket_id,
            old_status,
            new_status,
        } = &envelope.event
        else {
            return Err(anyhow!("TicketStatusChangedHandler received a foreign event"));
        };

        let ticket = ctx
            .storage
            .tickets
            .get_ticket_by_id(*ticket_id)
            .await?
            .ok_or_else(|| anyhow!("Ticket {} not found", ticket_id))?;

        let mut audience = online_supervisors(ctx).await?;
        for extra in [ticket.created_by_user_id, *changed_by_user_id] {
            if !audience.contains(&extra) {
                audience.push(extra);
            }
        }

        let update = ServerUpdate::TicketStatusChanged {
            ticket_id: *ticket_id,
            old_status: *old_status,
            new_status: *new_status,
            changed_by_user_id: *changed_by_user_id,
        };
        ctx.broadcaster
            .broadcast(
                &audience,
                &update,
                BroadcastOptions {
                    skip_connection: envelope.cid.clone(),
                    skip_user: None,
                },
            )
            .await?;

        if is_pushed_transition(*old_status, *new_status) {
            ctx.push_queue
                .enqueue(&SendPushQueueMessage::new(envelope.clone()))
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_two_transitions_are_pushed() {
        assert!(is_pushed_transition(
            TicketStatus::New,
            TicketStatus::InProgress
        ));
        assert!(is_pushed_transition(
            TicketStatus::InProgress,
            TicketStatus::Solved
        ));
        assert!(!is_pushed_transition(TicketStatus::New, TicketStatus::Solved));
        assert!(!is_pushed_transition(
            TicketStatus::Solved,
            TicketStatus::InProgress
        ));
        assert!(!is_pushed_transition(
            TicketStatus::InProgress,
            TicketStatus::New
        ));
    }
}
