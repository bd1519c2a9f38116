use axum::{
    Json, debug_handler,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};

use crate::{
    AppResult, AppState,
    auth::Identity,
    model::SendMessage,
    protocol::{HistoryResponse, SendResponse},
    sync::SyncService,
};

use super::participant_of;

#[debug_handler(state = AppState)]
pub(crate) async fn history(
    State(sync): State<SyncService>,
    identity: Identity,
    Path(conversation_id): Path<String>,
) -> AppResult<Json<HistoryResponse>> {
    let conversation = participant_of(&identity, &conversation_id)?;
    let messages = sync.fetch_history(&conversation).await?;

    Ok(Json(HistoryResponse { messages }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn send(
    State(sync): State<SyncService>,
    identity: Identity,
    Path(conversation_id): Path<String>,
    body: Result<Json<SendMessage>, JsonRejection>,
) -> AppResult<(StatusCode, Json<SendResponse>)> {
    let conversation = participant_of(&identity, &conversation_id)?;
    let Json(request) = body?;
    let message = sync.send_message(&conversation, &identity.0, request).await?;

    Ok((StatusCode::CREATED, Json(SendResponse { message })))
}
