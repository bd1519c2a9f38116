use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    fanout::Fanout,
    model::{Content, ConversationId, ConversationOverview, Message, SendMessage, UserId, ValidationError},
    presence::{ConnectionId, Presence},
    protocol::ServerEvent,
    store::{MessageStore, StorageError},
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Retryable. Nothing was announced for the failed write.
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{user} is not a participant of {conversation}")]
    NotParticipant { user: UserId, conversation: ConversationId },
    #[error("send task failed: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

/// Entry point for everything a client does with conversations.
///
/// A successful [`SyncService::send_message`] means the message is stored
/// and has been handed to every live connection in the room; a failed
/// write is never announced.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn MessageStore>,
    presence: Presence,
    fanout: Fanout,
    // Serialises append + publish per conversation so that publish order
    // matches the store's append order.
    ordering: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl SyncService {
    pub fn new(store: Arc<dyn MessageStore>, presence: Presence) -> Self {
        Self {
            store,
            fanout: Fanout::new(presence.clone()),
            presence,
            ordering: Arc::default(),
        }
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        request: SendMessage,
    ) -> Result<Message, SyncError> {
        let content = Content::try_from(request)?;
        if !conversation.contains(sender) {
            return Err(SyncError::NotParticipant {
                user: sender.clone(),
                conversation: conversation.clone(),
            });
        }

        // Detached so a caller that goes away mid-request can't cancel a
        // write that has already started.
        let this = self.clone();
        let conversation = conversation.clone();
        let sender = sender.clone();
        tokio::spawn(async move { this.append_and_publish(conversation, sender, content).await })
            .await?
    }

    async fn append_and_publish(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: Content,
    ) -> Result<Message, SyncError> {
        let lock = self.ordering.entry(conversation.clone()).or_default().clone();

        let result = {
            let _turn = lock.lock().await;
            match self.store.append(&conversation, &sender, content).await {
                Ok(message) => {
                    let in_room = self.fanout.message_appended(&conversation, &message);
                    let sessions = self.fanout.conversation_touched(&conversation);
                    info!(
                        conversation_id = %conversation,
                        user_id = %sender,
                        message_id = %message.id,
                        in_room,
                        sessions,
                        "message sent"
                    );
                    Ok(message)
                }
                Err(e) => {
                    error!(conversation_id = %conversation, user_id = %sender, "append failed: {e}");
                    Err(SyncError::Storage(e))
                }
            }
        };

        drop(lock);
        self.ordering.remove_if(&conversation, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    pub async fn fetch_history(&self, conversation: &ConversationId) -> Result<Vec<Message>, SyncError> {
        Ok(self.store.history(conversation).await?)
    }

    pub async fn list_conversations(&self, user: &UserId) -> Result<Vec<ConversationOverview>, SyncError> {
        Ok(self.store.conversations_for(user).await?)
    }

    pub async fn mark_read(&self, conversation: &ConversationId, user: &UserId) -> Result<(), SyncError> {
        if !conversation.contains(user) {
            return Err(SyncError::NotParticipant {
                user: user.clone(),
                conversation: conversation.clone(),
            });
        }
        Ok(self.store.mark_read(conversation, user).await?)
    }

    /// Registers a live connection owned by `user`.
    pub fn connect(&self, user: &UserId) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (connection, inbox) = self.presence.register(user);
        debug!(%connection, user_id = %user, "connection opened");
        (connection, inbox)
    }

    pub fn disconnect(&self, connection: ConnectionId) {
        self.presence.on_connection_closed(connection);
        debug!(%connection, "connection closed");
    }

    /// Always succeeds. Joining a conversation the owner isn't part of
    /// does nothing.
    pub fn join_room(&self, connection: ConnectionId, conversation: &ConversationId) {
        let Some(user) = self.presence.user_of(connection) else {
            return;
        };
        if !conversation.contains(&user) {
            warn!(%connection, user_id = %user, conversation_id = %conversation, "join refused for non-participant");
            return;
        }
        self.presence.join(connection, conversation);
        debug!(%connection, conversation_id = %conversation, "joined room");
    }

    pub fn leave_room(&self, connection: ConnectionId, conversation: &ConversationId) {
        self.presence.leave(connection, conversation);
        debug!(%connection, conversation_id = %conversation, "left room");
    }

    /// Ignored unless `connection` is currently in the conversation's room.
    pub fn signal_typing(&self, connection: ConnectionId, conversation: &ConversationId, typing: bool) {
        if self.presence.room_of(connection).as_ref() != Some(conversation) {
            return;
        }
        let Some(user) = self.presence.user_of(connection) else {
            return;
        };
        self.fanout.typing(connection, conversation, &user, typing);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc::Receiver;

    use super::*;
    use crate::{model::MessageKind, store::memory_store};

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(&self, _: &ConversationId, _: &UserId, _: Content) -> Result<Message, StorageError> {
            Err(StorageError::Unavailable("disk full".to_owned()))
        }

        async fn history(&self, _: &ConversationId) -> Result<Vec<Message>, StorageError> {
            Err(StorageError::Unavailable("disk full".to_owned()))
        }

        async fn conversations_for(&self, _: &UserId) -> Result<Vec<ConversationOverview>, StorageError> {
            Ok(Vec::new())
        }

        async fn mark_read(&self, _: &ConversationId, _: &UserId) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    async fn service() -> SyncService {
        SyncService::new(Arc::new(memory_store().await), Presence::new(32))
    }

    fn drain(inbox: &mut Receiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| inbox.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let sync = service().await;
        let a = user("0197000000");
        let b = user("0151852420");
        let conv = ConversationId::for_pair(&a, &b).unwrap();
        assert_eq!(conv.to_string(), "0151852420-0197000000");

        let (conn_a, mut inbox_a) = sync.connect(&a);
        let (conn_b, mut inbox_b) = sync.connect(&b);
        sync.join_room(conn_a, &conv);
        sync.join_room(conn_b, &conv);

        assert!(sync.list_conversations(&a).await.unwrap().is_empty());

        let sent = sync.send_message(&conv, &a, SendMessage::text("Salut")).await.unwrap();

        for inbox in [&mut inbox_a, &mut inbox_b] {
            let events = drain(inbox);
            let new_messages: Vec<_> = events
                .iter()
                .filter_map(|event| match event {
                    ServerEvent::NewMessage { message, .. } => Some(message),
                    _ => None,
                })
                .collect();
            assert_eq!(new_messages.len(), 1);
            assert_eq!(new_messages[0].text.as_deref(), Some("Salut"));
            assert_eq!(new_messages[0].from, a);
            assert!(events.iter().any(|e| matches!(e, ServerEvent::ConversationsUpdated { .. })));
        }

        assert_eq!(sync.fetch_history(&conv).await.unwrap(), vec![sent]);

        for me in [&a, &b] {
            let list = sync.list_conversations(me).await.unwrap();
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].id, conv);
            assert_eq!(list[0].last_message.as_ref().unwrap().preview(), "Salut");
        }
    }

    #[tokio::test]
    async fn failed_append_publishes_nothing() {
        let presence = Presence::new(8);
        let sync = SyncService::new(Arc::new(FailingStore), presence);
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let (conn, mut inbox) = sync.connect(&b);
        sync.join_room(conn, &conv);

        let err = sync.send_message(&conv, &a, SendMessage::text("lost")).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(drain(&mut inbox).is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_writing() {
        let sync = service().await;
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let request = SendMessage { kind: MessageKind::Video, ..Default::default() };
        let err = sync.send_message(&conv, &a, request).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(sync.fetch_history(&conv).await.unwrap().is_empty());
        assert!(sync.list_conversations(&a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outsiders_cannot_send() {
        let sync = service().await;
        let conv = ConversationId::parse("a-b").unwrap();
        let err = sync.send_message(&conv, &user("c"), SendMessage::text("hi")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotParticipant { .. }));
        assert!(sync.mark_read(&conv, &user("c")).await.is_err());
    }

    #[tokio::test]
    async fn double_join_delivers_once() {
        let sync = service().await;
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let (conn, mut inbox) = sync.connect(&b);
        sync.join_room(conn, &conv);
        sync.join_room(conn, &conv);

        sync.send_message(&conv, &a, SendMessage::text("once")).await.unwrap();
        let new_messages = drain(&mut inbox)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::NewMessage { .. }))
            .count();
        assert_eq!(new_messages, 1);
    }

    #[tokio::test]
    async fn non_participants_cannot_join() {
        let sync = service().await;
        let conv = ConversationId::parse("a-b").unwrap();
        let (spy, mut inbox) = sync.connect(&user("c"));

        sync.join_room(spy, &conv);
        assert!(sync.presence().members_of(&conv).is_empty());

        sync.send_message(&conv, &user("a"), SendMessage::text("secret")).await.unwrap();
        assert!(drain(&mut inbox).is_empty());
    }

    #[tokio::test]
    async fn typing_requires_room_membership() {
        let sync = service().await;
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let (typist, _typist_inbox) = sync.connect(&a);
        let (reader, mut reader_inbox) = sync.connect(&b);
        sync.join_room(reader, &conv);

        sync.signal_typing(typist, &conv, true);
        assert!(drain(&mut reader_inbox).is_empty());

        sync.join_room(typist, &conv);
        sync.signal_typing(typist, &conv, true);
        sync.signal_typing(typist, &conv, false);
        assert_eq!(
            drain(&mut reader_inbox),
            vec![
                ServerEvent::UserTyping { conversation_id: conv.clone(), user_id: a.clone() },
                ServerEvent::UserStopTyping { conversation_id: conv.clone(), user_id: a.clone() },
            ]
        );

        sync.leave_room(typist, &conv);
        sync.signal_typing(typist, &conv, true);
        assert!(drain(&mut reader_inbox).is_empty());
    }

    #[tokio::test]
    async fn disconnected_connections_get_nothing() {
        let sync = service().await;
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let (conn, mut inbox) = sync.connect(&b);
        sync.join_room(conn, &conv);
        sync.disconnect(conn);

        sync.send_message(&conv, &a, SendMessage::text("anyone?")).await.unwrap();
        assert!(drain(&mut inbox).is_empty());
        assert_eq!(sync.fetch_history(&conv).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_reader_is_cut_off_instead_of_skipping_a_message() {
        let sync = SyncService::new(Arc::new(memory_store().await), Presence::new(2));
        let (a, b) = (user("0197000000"), user("0151852420"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let (typist, _typist_inbox) = sync.connect(&a);
        let (reader, mut reader_inbox) = sync.connect(&b);
        sync.join_room(typist, &conv);
        sync.join_room(reader, &conv);

        sync.signal_typing(typist, &conv, true);
        sync.signal_typing(typist, &conv, false);
        sync.send_message(&conv, &a, SendMessage::text("first")).await.unwrap();

        assert_eq!(sync.presence().user_of(reader), None);
        assert!(!sync.presence().members_of(&conv).contains(&reader));

        sync.send_message(&conv, &a, SendMessage::text("second")).await.unwrap();

        let delivered = drain(&mut reader_inbox);
        assert!(
            delivered.iter().all(|e| !matches!(e, ServerEvent::NewMessage { .. })),
            "reader saw a message after missing one: {delivered:?}"
        );
        assert!(reader_inbox.is_closed());

        let texts: Vec<_> = sync
            .fetch_history(&conv)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|m| m.text)
            .collect();
        assert_eq!(texts, ["first", "second"]);
    }

    /// Delays the first append so a later caller would overtake it without
    /// per-conversation ordering.
    struct SlowFirstAppend<S> {
        inner: S,
        delayed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl<S: MessageStore> MessageStore for SlowFirstAppend<S> {
        async fn append(&self, c: &ConversationId, u: &UserId, content: Content) -> Result<Message, StorageError> {
            if !self.delayed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.append(c, u, content).await
        }

        async fn history(&self, c: &ConversationId) -> Result<Vec<Message>, StorageError> {
            self.inner.history(c).await
        }

        async fn conversations_for(&self, u: &UserId) -> Result<Vec<ConversationOverview>, StorageError> {
            self.inner.conversations_for(u).await
        }

        async fn mark_read(&self, c: &ConversationId, u: &UserId) -> Result<(), StorageError> {
            self.inner.mark_read(c, u).await
        }
    }

    #[tokio::test]
    async fn concurrent_sends_publish_in_store_order() {
        let store = SlowFirstAppend {
            inner: memory_store().await,
            delayed: Default::default(),
        };
        let sync = SyncService::new(Arc::new(store), Presence::new(32));
        let (a, b) = (user("a"), user("b"));
        let conv = ConversationId::for_pair(&a, &b).unwrap();

        let (watcher, mut inbox) = sync.connect(&user("a"));
        sync.join_room(watcher, &conv);

        let slow = {
            let (sync, conv, a) = (sync.clone(), conv.clone(), a.clone());
            tokio::spawn(async move { sync.send_message(&conv, &a, SendMessage::text("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fast = sync.send_message(&conv, &b, SendMessage::text("fast"));
        let (slow, fast) = tokio::join!(slow, fast);
        slow.unwrap().unwrap();
        fast.unwrap();

        let history: Vec<_> = sync
            .fetch_history(&conv)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text.unwrap())
            .collect();
        assert_eq!(history, ["slow", "fast"]);

        let published: Vec<_> = drain(&mut inbox)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::NewMessage { message, .. } => message.text,
                _ => None,
            })
            .collect();
        assert_eq!(published, history);
    }

    #[tokio::test]
    async fn independent_conversations_do_not_block_each_other() {
        let sync = service().await;
        let a = user("a");
        let sends = ["b", "c", "d", "e"].map(|other| {
            let (sync, a) = (sync.clone(), a.clone());
            let conv = ConversationId::for_pair(&a, &user(other)).unwrap();
            tokio::spawn(async move { sync.send_message(&conv, &a, SendMessage::text("hey")).await })
        });

        for send in sends {
            send.await.unwrap().unwrap();
        }
        assert_eq!(sync.list_conversations(&a).await.unwrap().len(), 4);
        assert!(sync.ordering.is_empty());
    }
}
