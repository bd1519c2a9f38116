use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use time::{OffsetDateTime, UtcOffset};
use uuid::Uuid;

use crate::model::{
    Content, ConversationId, ConversationOverview, Location, Message, Profile, UserId,
};

use super::{MessageStore, StorageError};

const MESSAGE_COLUMNS: &str =
    "seq,id,sender_id,kind,text,media_url,lat,lng,audio_duration,time,created_at";

/// Opens a pool that keeps its connections alive, so `sqlite::memory:`
/// behaves like one database as long as `max_connections` is 1.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    Ok(SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?)
}

#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
    display_offset: UtcOffset,
}

#[derive(FromRow)]
struct MessageRow {
    seq: i64,
    id: String,
    sender_id: String,
    kind: String,
    text: Option<String>,
    media_url: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    audio_duration: Option<f64>,
    time: String,
    created_at: i64,
}

impl MessageRow {
    fn into_message(self) -> Result<(i64, Message), StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt { table: "messages", reason };

        let location = match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Location { lat, lng }),
            _ => None,
        };

        let message = Message {
            id: Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?,
            from: UserId::new(self.sender_id).map_err(|e| corrupt(e.to_string()))?,
            text: self.text,
            kind: self.kind.parse().map_err(corrupt)?,
            media_url: self.media_url,
            location,
            audio_duration: self.audio_duration,
            time: self.time,
            created_at: from_millis(self.created_at).ok_or_else(|| corrupt(format!("bad timestamp {}", self.created_at)))?,
        };

        Ok((self.seq, message))
    }
}

fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool, display_offset: UtcOffset) -> Self {
        Self { db_pool, display_offset }
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.db_pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    async fn last_message(&self, conversation: &ConversationId) -> Result<Option<(i64, Message)>, StorageError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id=? ORDER BY created_at DESC, seq DESC LIMIT 1"
        ))
        .bind(conversation.to_string())
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(MessageRow::into_message).transpose()
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        content: Content,
    ) -> Result<Message, StorageError> {
        let conversation_id = conversation.to_string();
        let [low, high] = conversation.participants();
        let mut tx = self.db_pool.begin().await?;

        // Write first so the transaction holds the write lock before it reads.
        let now = to_millis(OffsetDateTime::now_utc());
        sqlx::query(
            "INSERT INTO conversations (id,participant_a,participant_b,updated_at) VALUES (?,?,?,?)
             ON CONFLICT(id) DO UPDATE SET updated_at=MAX(updated_at, excluded.updated_at)",
        )
        .bind(&conversation_id)
        .bind(low.as_str())
        .bind(high.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Timestamps never go backwards within a conversation, even if the clock does.
        let newest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM messages WHERE conversation_id=?")
                .bind(&conversation_id)
                .fetch_one(&mut *tx)
                .await?;
        let created_millis = newest.map_or(now, |newest| newest.max(now));
        let created_at = from_millis(created_millis).ok_or_else(|| StorageError::Corrupt {
            table: "messages",
            reason: format!("bad timestamp {created_millis}"),
        })?;

        let message = Message::new(
            Uuid::now_v7(),
            sender.clone(),
            &content,
            created_at,
            self.display_offset,
        );

        sqlx::query(
            "INSERT INTO messages (id,conversation_id,sender_id,kind,text,media_url,lat,lng,audio_duration,time,created_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(message.id.to_string())
        .bind(&conversation_id)
        .bind(sender.as_str())
        .bind(message.kind.as_str())
        .bind(&message.text)
        .bind(&message.media_url)
        .bind(message.location.map(|l| l.lat))
        .bind(message.location.map(|l| l.lng))
        .bind(message.audio_duration)
        .bind(&message.time)
        .bind(created_millis)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at=MAX(updated_at, ?) WHERE id=?")
            .bind(created_millis)
            .bind(&conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(message)
    }

    async fn history(&self, conversation: &ConversationId) -> Result<Vec<Message>, StorageError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id=? ORDER BY created_at ASC, seq ASC"
        ))
        .bind(conversation.to_string())
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_message().map(|(_, message)| message))
            .collect()
    }

    async fn conversations_for(&self, user: &UserId) -> Result<Vec<ConversationOverview>, StorageError> {
        let rows: Vec<(String, i64, Option<String>, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT c.id, c.updated_at, p.name, p.avatar, r.last_read_seq
             FROM conversations c
             LEFT JOIN profiles p
                ON p.user_id = CASE WHEN c.participant_a = ? THEN c.participant_b ELSE c.participant_a END
             LEFT JOIN conversation_reads r
                ON r.conversation_id = c.id AND r.user_id = ?
             WHERE c.participant_a = ? OR c.participant_b = ?
             ORDER BY c.updated_at DESC, c.id ASC",
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(user.as_str())
        .fetch_all(&self.db_pool)
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for (id, updated_at, name, avatar, last_read_seq) in rows {
            let corrupt = |reason: String| StorageError::Corrupt { table: "conversations", reason };

            let id = ConversationId::parse(&id).map_err(|e| corrupt(e.to_string()))?;
            let Some(other) = id.other(user).cloned() else {
                continue;
            };
            let updated_at = from_millis(updated_at).ok_or_else(|| corrupt(format!("bad timestamp {updated_at}")))?;

            let last = self.last_message(&id).await?;
            let unread = match &last {
                Some((seq, message)) => message.from != *user && *seq > last_read_seq.unwrap_or(0),
                None => false,
            };

            let profile = match name {
                Some(name) => Profile { name, avatar },
                None => Profile::default(),
            };

            conversations.push(ConversationOverview {
                id,
                other_participant_id: other,
                profile,
                last_message: last.map(|(_, message)| message),
                updated_at,
                unread,
            });
        }

        Ok(conversations)
    }

    async fn mark_read(&self, conversation: &ConversationId, user: &UserId) -> Result<(), StorageError> {
        let conversation_id = conversation.to_string();
        sqlx::query(
            "INSERT INTO conversation_reads (conversation_id,user_id,last_read_seq)
             SELECT ?, ?, COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id=?
             ON CONFLICT(conversation_id,user_id) DO UPDATE SET last_read_seq=MAX(last_read_seq, excluded.last_read_seq)",
        )
        .bind(&conversation_id)
        .bind(user.as_str())
        .bind(&conversation_id)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{MessageKind, SendMessage};

    pub(crate) async fn memory_store() -> SqliteStore {
        let db_pool = connect("sqlite::memory:", 1).await.unwrap();
        let store = SqliteStore::new(db_pool, UtcOffset::UTC);
        store.migrate().await.unwrap();
        store
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn text(body: &str) -> Content {
        Content::try_from(SendMessage::text(body)).unwrap()
    }

    async fn add_profile(store: &SqliteStore, user_id: &str, name: &str) {
        sqlx::query("INSERT INTO profiles (user_id,name,avatar) VALUES (?,?,?)")
            .bind(user_id)
            .bind(name)
            .bind(format!("https://cdn.example/{user_id}.png"))
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn history_is_in_append_order() {
        let store = memory_store().await;
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let first = store.append(&conv, &a, text("one")).await.unwrap();
        let second = store.append(&conv, &b, text("two")).await.unwrap();
        let third = store.append(&conv, &a, text("three")).await.unwrap();

        let history = store.history(&conv).await.unwrap();
        assert_eq!(history, vec![first.clone(), second, third.clone()]);
        assert!(first.created_at <= third.created_at);
    }

    #[tokio::test]
    async fn unknown_conversation_has_empty_history() {
        let store = memory_store().await;
        let conv = ConversationId::parse("x-y").unwrap();
        assert!(store.history(&conv).await.unwrap().is_empty());
        assert!(store.conversations_for(&user("x")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn media_and_location_survive_storage() {
        let store = memory_store().await;
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let here = Content::try_from(SendMessage {
            kind: MessageKind::Location,
            location: Some(Location { lat: 5.35, lng: -4.0 }),
            ..Default::default()
        })
        .unwrap();
        let voice = Content::Audio { media_url: "blob:voice".to_owned(), duration: Some(12.0) };

        store.append(&conv, &a, here).await.unwrap();
        store.append(&conv, &b, voice).await.unwrap();

        let history = store.history(&conv).await.unwrap();
        assert_eq!(history[0].location, Some(Location { lat: 5.35, lng: -4.0 }));
        assert_eq!(history[1].kind, MessageKind::Audio);
        assert_eq!(history[1].audio_duration, Some(12.0));
        assert_eq!(history[1].media_url.as_deref(), Some("blob:voice"));
    }

    #[tokio::test]
    async fn conversation_list_is_most_recent_first() {
        let store = memory_store().await;
        let (me, old, new) = (user("m"), user("o"), user("z"));
        add_profile(&store, "o", "Olivier").await;

        let with_old = ConversationId::for_pair(&me, &old).unwrap();
        let with_new = ConversationId::for_pair(&me, &new).unwrap();
        store.append(&with_old, &old, text("first")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append(&with_new, &me, text("second")).await.unwrap();

        let list = store.conversations_for(&me).await.unwrap();
        let ids: Vec<_> = list.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![with_new.clone(), with_old.clone()]);

        assert_eq!(list[0].other_participant_id, new);
        assert_eq!(list[0].profile, Profile::default());
        assert_eq!(list[1].profile.name, "Olivier");
        assert_eq!(list[1].last_message.as_ref().unwrap().preview(), "first");

        // Activity on the older conversation moves it to the top.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append(&with_old, &me, text("bump")).await.unwrap();
        let list = store.conversations_for(&me).await.unwrap();
        assert_eq!(list[0].id, with_old);
    }

    #[tokio::test]
    async fn unread_tracks_read_marks() {
        let store = memory_store().await;
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        store.append(&conv, &a, text("coucou")).await.unwrap();

        let for_b = store.conversations_for(&b).await.unwrap();
        assert!(for_b[0].unread);
        let for_a = store.conversations_for(&a).await.unwrap();
        assert!(!for_a[0].unread, "own messages are never unread");

        store.mark_read(&conv, &b).await.unwrap();
        assert!(!store.conversations_for(&b).await.unwrap()[0].unread);

        store.append(&conv, &a, text("tu es là ?")).await.unwrap();
        assert!(store.conversations_for(&b).await.unwrap()[0].unread);
    }
}
