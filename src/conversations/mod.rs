mod list;
mod messages;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};

use crate::{AppState, auth::Identity, model::ConversationId, sync::SyncError};

pub use ws::conversations_ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list::conversations))
        .route("/{conversation_id}/messages", get(messages::history).post(messages::send))
        .route("/{conversation_id}/read", post(list::mark_read))
}

/// Parses the path id and checks the caller takes part in it.
fn participant_of(Identity(user): &Identity, conversation_id: &str) -> Result<ConversationId, SyncError> {
    let conversation = ConversationId::parse(conversation_id)?;
    if !conversation.contains(user) {
        return Err(SyncError::NotParticipant {
            user: user.clone(),
            conversation,
        });
    }
    Ok(conversation)
}
