mod login;
mod logout;
mod token;

use axum::{
    Router,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
    routing::post,
};
use thiserror::Error;
use tower_sessions::Session;

use crate::{AppError, AppState, model::UserId, session::USER_ID};

pub use token::TokenAuthority;

pub fn router() -> Router<AppState> {
    Router::new().route("/session", post(login::login).delete(logout::logout))
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing identity")]
    MissingIdentity,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("auth secret is unusable")]
    Secret,
    #[error("session store: {0}")]
    Session(#[from] tower_sessions::session::Error),
}

/// The caller's user id, from the session cookie or a bearer token.
#[derive(Debug, Clone)]
pub struct Identity(pub UserId);

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
    TokenAuthority: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Ok(session) = Session::from_request_parts(parts, state).await {
            if let Some(user) = session.get::<UserId>(USER_ID).await.map_err(AuthError::from)? {
                return Ok(Identity(user));
            }
        }

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingIdentity)?;

        Ok(Identity(TokenAuthority::from_ref(state).verify(token)?))
    }
}
