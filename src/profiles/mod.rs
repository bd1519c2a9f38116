mod edit;
mod page;

use axum::{
    Router,
    routing::{get, put},
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/me", put(edit::edit_profile))
        .route("/{user_id}", get(page::profile))
}
