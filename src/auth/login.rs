use axum::{Json, debug_handler, extract::State};
use tower_sessions::Session;
use tracing::info;

use crate::{
    AppResult, AppState,
    protocol::{LoginRequest, LoginResponse},
    session::USER_ID,
};

use super::TokenAuthority;

/// Trades an auth-service token for a session cookie.
#[debug_handler(state = AppState)]
pub(crate) async fn login(
    State(tokens): State<TokenAuthority>,
    session: Session,
    Json(LoginRequest { token }): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let user_id = tokens.verify(&token)?;

    session.cycle_id().await?;
    session.insert(USER_ID, &user_id).await?;

    info!(%user_id, "signed in");
    Ok(Json(LoginResponse { user_id }))
}
