mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Content, ConversationId, ConversationOverview, Message, UserId};

pub use sqlite::{SqliteStore, connect};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable, per-conversation ordered message log.
///
/// `append` creates the conversation on first use and bumps its activity
/// timestamp; `history` is always a fresh read in creation order.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn append(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        content: Content,
    ) -> Result<Message, StorageError>;

    async fn history(&self, conversation: &ConversationId) -> Result<Vec<Message>, StorageError>;

    /// Most recently active first.
    async fn conversations_for(&self, user: &UserId) -> Result<Vec<ConversationOverview>, StorageError>;

    /// Marks everything currently in the conversation as read by `user`.
    async fn mark_read(&self, conversation: &ConversationId, user: &UserId) -> Result<(), StorageError>;
}

#[cfg(test)]
pub(crate) use sqlite::tests::memory_store;
