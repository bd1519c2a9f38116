use axum::{
    Json, debug_handler,
    extract::{State, rejection::JsonRejection},
};
use sqlx::SqlitePool;
use tracing::info;

use crate::{
    AppResult, AppState,
    auth::Identity,
    model::{Profile, ValidationError},
};

/// Upserts the caller's display profile, shown to their conversation partners.
#[debug_handler(state = AppState)]
pub(crate) async fn edit_profile(
    State(db_pool): State<SqlitePool>,
    Identity(user_id): Identity,
    body: Result<Json<Profile>, JsonRejection>,
) -> AppResult<Json<Profile>> {
    let Json(Profile { name, avatar }) = body?;
    let name = name.trim().to_owned();
    if name.is_empty() {
        return Err(ValidationError::EmptyProfileName.into());
    }
    let avatar = avatar.filter(|avatar| !avatar.trim().is_empty());

    sqlx::query(
        "INSERT INTO profiles (user_id,name,avatar) VALUES (?,?,?)
         ON CONFLICT(user_id) DO UPDATE SET name=excluded.name, avatar=excluded.avatar",
    )
    .bind(user_id.as_str())
    .bind(&name)
    .bind(&avatar)
    .execute(&db_pool)
    .await?;

    info!(%user_id, "profile updated");
    Ok(Json(Profile { name, avatar }))
}
