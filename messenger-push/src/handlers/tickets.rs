use anyhow::{anyhow, Result};
use async_trait::async_trait;
use messenger_core::events::{EventKind, Role, SendPushQueueMessage, SourceEvent};
use messenger_core::protocol::{
    NotificationMatchData, NotificationUserData, PushNotificationBody, PushNotificationContent,
};
use tracing;

use super::{prepare_for_devices, PushContext, PushHandler};
use crate::sender::{PreparedPushNotification, PushUrgency};

pub struct TicketCreatedPushHandler;

#[async_trait]
impl PushHandler for TicketCreatedPushHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::TicketCreated
    }

    async fn build(
        &self,
        ctx: &PushContext,
        message: &SendPushQueueMessage,
    ) -> Result<Vec<PreparedPushNotification>> {
        let SourceEvent::TicketCreated {
            created_by_user_id,
            ticket_id,
            match_id,
            chat_id,
        } = &message.source_event.event
        else {
            return Err(anyhow!("TicketCreatedPushHandler received a foreign event"));
        };

        let match_data = match match_id {
            Some(match_id) => ctx
                .storage
                .matches
                .get_match_by_id(*match_id)
                .await?
                .map(|m| NotificationMatchData {
                    id: m.id,
                    team_a_name: m.team_a_name,
                    team_b_name: m.team_b_name,
                }),
            None => None,
        };
        let created_by = ctx
            .storage
            .users
            .get_by_id(*created_by_user_id)
            .await?
            .map(|user| NotificationUserData {
                id: user.id,
                name: user.name,
                role: user.role,
                scout_number: user.scout_number,
            });

        let payload = PushNotificationContent {
            created_at: message.created_at,
            body: PushNotificationBody::TicketCreated {
                ticket_id: *ticket_id,
                chat_id: *chat_id,
                match_data,
                created_by,
            },
        };

        // Every supervisor is on call for new tickets, except whoever filed
        // this one.
        let supervisors = ctx.storage.users.search_by_role(Role::Supervisor).await?;
        let mut notifications = Vec::new();
        for supervisor in supervisors {
            if supervisor.id == *created_by_user_id {
                continue;
            }
            let configs = ctx.get_active_configs_for_user(supervisor.id).await?;
            if configs.is_empty() {
                continue;
            }
            notifications.extend(prepare_for_devices(
                supervisor.id,
                &configs,
                &payload,
                PushUrgency::High,
                None,
            )?);
        }
        Ok(notifications)
    }
}

pub struct TicketStatusChangedPushHandler;

#[async_trait]
impl PushHandler for TicketStatusChangedPushHandler {
    fn event_kind(&self) -> EventKind {
        EventKind::TicketStatusChanged
    }

    async fn build(
        &self,
        ctx: &PushContext,
        message: &SendPushQueueMessage,
    ) -> Result<Vec<PreparedPushNotification>> {
        let SourceEvent::TicketStatusChanged {
            changed_by_user_id,
            ticket_id,
            old_status,
            new_status,
        } = &message.source_event.event
        else {
            return Err(anyhow!(
                "TicketStatusChangedPushHandler received a foreign event"
            ));
        };

        let ticket = ctx
            .storage
            .tickets
            .get_ticket_by_id(*ticket_id)
            .await?
            .ok_or_else(|| anyhow!("Ticket {} not found", ticket_id))?;

        // The creator tracks their own ticket; no point pushing their own
        // status change back at them.
        if ticket.created_by_user_id == *changed_by_user_id {
            tracing::debug!("Ticket {} status changed by its creator, no push", ticket_id);
            return Ok(Vec::new());
        }

        let configs = ctx
            .get_active_configs_for_user(ticket.created_by_user_id)
            .await?;
        if configs.is_empty() {
            return Ok(Vec::new());
        }

        let payload = PushNotificationContent {
            created_at: message.created_at,
            body: PushNotificationBody::TicketStatusChanged {
                ticket_id: *ticket_id,
                old_status: *old_status,
                new_status: *new_status,
            },
        };
        prepare_for_devices(
            ticket.created_by_user_id,
            &configs,
            &payload,
            PushUrgency::Normal,
            None,
        )
    }
}
