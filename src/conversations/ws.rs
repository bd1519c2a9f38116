use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::{
    AppState,
    auth::Identity,
    model::UserId,
    presence::ConnectionId,
    protocol::ClientEvent,
    sync::SyncService,
};

#[debug_handler(state = AppState)]
pub async fn conversations_ws(
    State(sync): State<SyncService>,
    Identity(user): Identity,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |stream| handle_socket(stream, sync, user))
}

async fn handle_socket(stream: WebSocket, sync: SyncService, user: UserId) {
    let (connection, mut outbox) = sync.connect(&user);
    let (mut sender, mut receiver) = stream.split();

    let mut forward_task = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("could not encode {event:?}: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        // Evicted after a missed event: the client has to reconnect and resync.
        let _ = sender.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&sync, connection, text.as_str()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut forward_task => break,
        }
    }

    sync.disconnect(connection);
    forward_task.abort();
}

fn handle_frame(sync: &SyncService, connection: ConnectionId, frame: &str) {
    let event = match serde_json::from_str::<ClientEvent>(frame) {
        Ok(event) => event,
        Err(e) => {
            debug!(%connection, "skipping malformed frame: {e}");
            return;
        }
    };

    match event {
        ClientEvent::JoinConversation { conversation_id } => sync.join_room(connection, &conversation_id),
        ClientEvent::LeaveConversation { conversation_id } => sync.leave_room(connection, &conversation_id),
        ClientEvent::Typing { conversation_id, .. } => sync.signal_typing(connection, &conversation_id, true),
        ClientEvent::StopTyping { conversation_id, .. } => sync.signal_typing(connection, &conversation_id, false),
    }
}
