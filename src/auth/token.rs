use std::{fmt, sync::Arc};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::model::UserId;

use super::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Checks identity tokens minted by the auth service:
/// `<userId>.<hex(HMAC-SHA256(secret, userId))>`.
#[derive(Clone)]
pub struct TokenAuthority {
    secret: Arc<[u8]>,
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("secret", &"[redacted]")
            .finish()
    }
}

impl TokenAuthority {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    fn mac(&self, user: &UserId) -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::Secret)?;
        mac.update(user.as_str().as_bytes());
        Ok(mac)
    }

    pub fn issue(&self, user: &UserId) -> Result<String, AuthError> {
        let signature = self.mac(user)?.finalize().into_bytes();
        Ok(format!("{user}.{}", hex::encode(signature)))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let (user, signature) = token.rsplit_once('.').ok_or(AuthError::InvalidToken)?;
        let user = UserId::new(user).map_err(|_| AuthError::InvalidToken)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::InvalidToken)?;

        self.mac(&user)?
            .verify_slice(&signature)
            .map_err(|_| AuthError::InvalidToken)?;

        Ok(user)
    }
}
