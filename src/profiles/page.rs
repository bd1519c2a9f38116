use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use sqlx::SqlitePool;

use crate::{AppResult, AppState, auth::Identity, model::{Profile, UserId}};

#[debug_handler(state = AppState)]
pub(crate) async fn profile(
    State(db_pool): State<SqlitePool>,
    _identity: Identity,
    Path(user_id): Path<String>,
) -> AppResult<Response> {
    let user_id = UserId::new(user_id)?;

    let profile: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT name,avatar FROM profiles WHERE user_id=?")
            .bind(user_id.as_str())
            .fetch_optional(&db_pool)
            .await?;

    let Some((name, avatar)) = profile else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no profile for {user_id}") })),
        )
            .into_response());
    };

    Ok(Json(Profile { name, avatar }).into_response())
}
