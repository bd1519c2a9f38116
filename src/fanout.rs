use std::collections::HashSet;

use tracing::debug;

use crate::{
    model::{ConversationId, Message, UserId},
    presence::{ConnectionId, Presence},
    protocol::ServerEvent,
};

/// Best-effort push of events to live connections.
///
/// Publishing never waits: each target gets the event queued or misses it.
/// A miss is logged and otherwise ignored, the durable history is how
/// a client catches up.
#[derive(Clone)]
pub struct Fanout {
    presence: Presence,
}

impl Fanout {
    pub fn new(presence: Presence) -> Self {
        Self { presence }
    }

    /// Delivers to every connection in the conversation's room.
    pub fn message_appended(&self, conversation: &ConversationId, message: &Message) -> usize {
        let event = ServerEvent::NewMessage {
            conversation_id: conversation.clone(),
            message: message.clone(),
        };
        self.publish(self.presence.members_of(conversation), &event)
    }

    /// Delivers to every connection of both participants, in a room or not.
    pub fn conversation_touched(&self, conversation: &ConversationId) -> usize {
        let event = ServerEvent::ConversationsUpdated {
            conversation_id: conversation.clone(),
        };
        let targets = conversation
            .participants()
            .into_iter()
            .flat_map(|user| self.presence.connections_of(user))
            .collect();
        self.publish(targets, &event)
    }

    /// Delivers to the room, except the connection that is typing.
    pub fn typing(
        &self,
        origin: ConnectionId,
        conversation: &ConversationId,
        user: &UserId,
        started: bool,
    ) -> usize {
        let conversation_id = conversation.clone();
        let user_id = user.clone();
        let event = match started {
            true => ServerEvent::UserTyping { conversation_id, user_id },
            false => ServerEvent::UserStopTyping { conversation_id, user_id },
        };

        let mut targets = self.presence.members_of(conversation);
        targets.remove(&origin);
        self.publish(targets, &event)
    }

    fn publish(&self, targets: HashSet<ConnectionId>, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for connection in targets {
            match self.presence.deliver(connection, event.clone()) {
                Ok(()) => delivered += 1,
                Err(miss) => debug!(
                    %connection,
                    conversation_id = %event.conversation_id(),
                    ?miss,
                    "event not delivered, connection evicted"
                ),
            }
        }
        delivered
    }
}
