use axum::{debug_handler, http::StatusCode};
use tower_sessions::Session;

use crate::AppResult;

#[debug_handler]
pub(crate) async fn logout(session: Session) -> AppResult<StatusCode> {
    session.clear().await;
    Ok(StatusCode::NO_CONTENT)
}
