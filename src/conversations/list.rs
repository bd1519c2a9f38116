use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
};

use crate::{
    AppResult, AppState,
    auth::Identity,
    model::ConversationSummary,
    protocol::ConversationsResponse,
    sync::SyncService,
};

use super::participant_of;

#[debug_handler(state = AppState)]
pub(crate) async fn conversations(
    State(sync): State<SyncService>,
    Identity(user): Identity,
) -> AppResult<Json<ConversationsResponse>> {
    let conversations = sync
        .list_conversations(&user)
        .await?
        .into_iter()
        .map(ConversationSummary::from)
        .collect();

    Ok(Json(ConversationsResponse { conversations }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn mark_read(
    State(sync): State<SyncService>,
    identity: Identity,
    Path(conversation_id): Path<String>,
) -> AppResult<StatusCode> {
    let conversation = participant_of(&identity, &conversation_id)?;
    sync.mark_read(&conversation, &identity.0).await?;

    Ok(StatusCode::NO_CONTENT)
}
