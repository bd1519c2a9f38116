//! JSON shapes shared by the server and [`crate::client`].
//!
//! Realtime frames are objects tagged by `event`:
//!
//! ```json
//! {"event": "join-conversation", "conversationId": "0151852420-0197000000"}
//! {"event": "new-message", "conversationId": "0151852420-0197000000", "message": {"id": "…"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{ConversationId, ConversationSummary, Message, UserId};

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    NewMessage { conversation_id: ConversationId, message: Message },
    /// Sent on each participant's personal channel so conversation lists refresh.
    #[serde(rename_all = "camelCase")]
    ConversationsUpdated { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    UserTyping { conversation_id: ConversationId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    UserStopTyping { conversation_id: ConversationId, user_id: UserId },
}

impl ServerEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            ServerEvent::NewMessage { conversation_id, .. }
            | ServerEvent::ConversationsUpdated { conversation_id }
            | ServerEvent::UserTyping { conversation_id, .. }
            | ServerEvent::UserStopTyping { conversation_id, .. } => conversation_id,
        }
    }
}

/// Client to server. A `userId` sent along with typing events is accepted
/// for compatibility but the connection's owner is always used instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    LeaveConversation { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StopTyping {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub message: Message,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user_id: UserId,
}
