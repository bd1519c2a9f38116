use thiserror::Error;
use uuid::Uuid;

use crate::{
    model::{ConversationId, Message, SendMessage},
    protocol::ServerEvent,
};

/// Where an outgoing message stands.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Pending,
    Confirmed { id: Uuid },
    RolledBack { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub local_id: LocalId,
    pub request: SendMessage,
    pub delivery: Delivery,
}

#[derive(Debug, Error, PartialEq)]
pub enum TimelineError {
    #[error("no outgoing message {0:?}")]
    UnknownLocalId(LocalId),
    #[error("cannot move {local_id:?} from {from:?}")]
    InvalidTransition { local_id: LocalId, from: Delivery },
}

/// What to draw, in order.
#[derive(Debug, PartialEq)]
pub enum TimelineItem<'a> {
    Sent(&'a Message),
    Outgoing(&'a Outgoing),
}

/// The one ordered message list of an open conversation.
///
/// History loads replace it, `new-message` events and send confirmations
/// insert into it, and a message id appears at most once no matter how
/// many of those paths report it.
#[derive(Debug)]
pub struct Timeline {
    conversation: ConversationId,
    messages: Vec<Message>,
    outgoing: Vec<Outgoing>,
    next_local: u64,
}

impl Timeline {
    pub fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            outgoing: Vec::new(),
            next_local: 0,
        }
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Initial load or resync after a reconnect.
    pub fn load_history(&mut self, history: Vec<Message>) {
        self.messages.clear();
        for message in history {
            self.insert(message);
        }
    }

    /// Returns whether the timeline changed.
    pub fn apply_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::NewMessage { conversation_id, message } if *conversation_id == self.conversation => {
                self.insert(message.clone())
            }
            _ => false,
        }
    }

    fn insert(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|known| known.id == message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|known| (known.created_at, known.id) <= (message.created_at, message.id));
        self.messages.insert(at, message);
        true
    }

    pub fn begin_send(&mut self, request: SendMessage) -> LocalId {
        let local_id = LocalId(self.next_local);
        self.next_local += 1;
        self.outgoing.push(Outgoing {
            local_id,
            request,
            delivery: Delivery::Pending,
        });
        local_id
    }

    pub fn confirm(&mut self, local_id: LocalId, message: Message) -> Result<(), TimelineError> {
        let id = message.id;
        self.transition(local_id, Delivery::Confirmed { id })?;
        self.insert(message);
        Ok(())
    }

    /// The message list is left as it was before the send began.
    pub fn roll_back(&mut self, local_id: LocalId, reason: impl Into<String>) -> Result<(), TimelineError> {
        self.transition(local_id, Delivery::RolledBack { reason: reason.into() })
    }

    /// Puts a rolled-back message back to pending and returns what to resend.
    pub fn retry(&mut self, local_id: LocalId) -> Result<SendMessage, TimelineError> {
        let outgoing = self.outgoing_mut(local_id)?;
        if !matches!(outgoing.delivery, Delivery::RolledBack { .. }) {
            return Err(TimelineError::InvalidTransition {
                local_id,
                from: outgoing.delivery.clone(),
            });
        }
        outgoing.delivery = Delivery::Pending;
        Ok(outgoing.request.clone())
    }

    /// Drops a rolled-back message the user gave up on.
    pub fn discard(&mut self, local_id: LocalId) -> Result<(), TimelineError> {
        let outgoing = self.outgoing_mut(local_id)?;
        if !matches!(outgoing.delivery, Delivery::RolledBack { .. }) {
            return Err(TimelineError::InvalidTransition {
                local_id,
                from: outgoing.delivery.clone(),
            });
        }
        self.outgoing.retain(|o| o.local_id != local_id);
        Ok(())
    }

    pub fn delivery(&self, local_id: LocalId) -> Option<&Delivery> {
        self.outgoing
            .iter()
            .find(|o| o.local_id == local_id)
            .map(|o| &o.delivery)
    }

    /// Stored messages first, then anything not yet confirmed.
    pub fn items(&self) -> Vec<TimelineItem<'_>> {
        self.messages
            .iter()
            .map(TimelineItem::Sent)
            .chain(
                self.outgoing
                    .iter()
                    .filter(|o| !matches!(o.delivery, Delivery::Confirmed { .. }))
                    .map(TimelineItem::Outgoing),
            )
            .collect()
    }

    fn outgoing_mut(&mut self, local_id: LocalId) -> Result<&mut Outgoing, TimelineError> {
        self.outgoing
            .iter_mut()
            .find(|o| o.local_id == local_id)
            .ok_or(TimelineError::UnknownLocalId(local_id))
    }

    fn transition(&mut self, local_id: LocalId, to: Delivery) -> Result<(), TimelineError> {
        let outgoing = self.outgoing_mut(local_id)?;
        if outgoing.delivery != Delivery::Pending {
            return Err(TimelineError::InvalidTransition {
                local_id,
                from: outgoing.delivery.clone(),
            });
        }
        outgoing.delivery = to;
        Ok(())
    }
}
