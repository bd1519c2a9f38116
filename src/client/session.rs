use futures_util::{SinkExt, StreamExt};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message as Frame,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::debug;

use crate::{
    model::{ConversationId, ConversationSummary, Message, SendMessage, UserId, ValidationError},
    protocol::{ClientEvent, ConversationsResponse, HistoryResponse, LoginRequest, LoginResponse, SendResponse, ServerEvent},
};

use super::timeline::{Timeline, TimelineError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("socket: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("bad url: {0}")]
    Url(String),
    #[error("server answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Timeline(#[from] TimelineError),
}

impl ClientError {
    /// Worth trying again later, as opposed to a request that will never work.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Status { status, .. } => status.is_server_error(),
            ClientError::Http(_) | ClientError::Socket(_) => true,
            _ => false,
        }
    }
}

/// One signed-in user's connection to the server.
///
/// Built once at login, it owns the HTTP client and the realtime socket;
/// [`ChatSession::logout`] tears both down. Which conversation receives
/// live messages is decided by explicit `open`/`close` calls.
pub struct ChatSession {
    http: reqwest::Client,
    base: Url,
    token: String,
    user: UserId,
    socket: Socket,
    open: Option<ConversationId>,
}

impl ChatSession {
    /// `base_url` is the server root, e.g. `http://localhost:5000/`.
    pub async fn connect(base_url: &str, token: &str) -> Result<Self, ClientError> {
        let base = Url::parse(base_url).map_err(|e| ClientError::Url(e.to_string()))?;
        let http = reqwest::Client::builder().cookie_store(true).build()?;

        let login = http
            .post(join(&base, "session")?)
            .json(&LoginRequest { token: token.to_owned() })
            .send()
            .await?;
        let LoginResponse { user_id } = success(login).await?.json().await?;

        let mut ws_url = join(&base, "ws")?;
        let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        ws_url
            .set_scheme(scheme)
            .map_err(|_| ClientError::Url(format!("cannot use {scheme} for {base}")))?;

        let mut request = ws_url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ClientError::Url("token is not a valid header value".to_owned()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        let (socket, _) = connect_async(request).await?;

        debug!(%user_id, "session connected");
        Ok(Self {
            http,
            base,
            token: token.to_owned(),
            user: user_id,
            socket,
            open: None,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn conversation_with(&self, other: &UserId) -> Result<ConversationId, ValidationError> {
        ConversationId::for_pair(&self.user, other)
    }

    pub fn open_conversation_id(&self) -> Option<&ConversationId> {
        self.open.as_ref()
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self
            .http
            .get(join(&self.base, path)?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(success(response).await?.json().await?)
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let ConversationsResponse { conversations } = self.get("conversations").await?;
        Ok(conversations)
    }

    pub async fn history(&self, conversation: &ConversationId) -> Result<Vec<Message>, ClientError> {
        let HistoryResponse { messages } = self.get(&format!("conversations/{conversation}/messages")).await?;
        Ok(messages)
    }

    pub async fn send(&self, conversation: &ConversationId, request: &SendMessage) -> Result<Message, ClientError> {
        let response = self
            .http
            .post(join(&self.base, &format!("conversations/{conversation}/messages"))?)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        let SendResponse { message } = success(response).await?.json().await?;
        Ok(message)
    }

    /// Sends through `timeline`: pending first, then confirmed or rolled back.
    pub async fn send_tracked(&self, timeline: &mut Timeline, request: SendMessage) -> Result<Message, ClientError> {
        let local_id = timeline.begin_send(request.clone());
        match self.send(timeline.conversation(), &request).await {
            Ok(message) => {
                timeline.confirm(local_id, message.clone())?;
                Ok(message)
            }
            Err(e) => {
                timeline.roll_back(local_id, e.to_string())?;
                Err(e)
            }
        }
    }

    pub async fn mark_read(&self, conversation: &ConversationId) -> Result<(), ClientError> {
        let response = self
            .http
            .post(join(&self.base, &format!("conversations/{conversation}/read"))?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        success(response).await?;
        Ok(())
    }

    async fn emit(&mut self, event: &ClientEvent) -> Result<(), ClientError> {
        self.socket.send(Frame::text(serde_json::to_string(event)?)).await?;
        Ok(())
    }

    /// Joins the conversation's room, then loads its history. Also the way
    /// to resync after a reconnect.
    pub async fn open_conversation(&mut self, conversation: &ConversationId) -> Result<Timeline, ClientError> {
        self.emit(&ClientEvent::JoinConversation { conversation_id: conversation.clone() })
            .await?;
        self.open = Some(conversation.clone());

        let mut timeline = Timeline::new(conversation.clone());
        timeline.load_history(self.history(conversation).await?);
        Ok(timeline)
    }

    pub async fn close_conversation(&mut self) -> Result<(), ClientError> {
        if let Some(conversation_id) = self.open.take() {
            self.emit(&ClientEvent::LeaveConversation { conversation_id }).await?;
        }
        Ok(())
    }

    /// Typing indicator for the open conversation, if any.
    pub async fn typing(&mut self, started: bool) -> Result<(), ClientError> {
        let Some(conversation_id) = self.open.clone() else {
            return Ok(());
        };
        let user_id = Some(self.user.to_string());
        let event = match started {
            true => ClientEvent::Typing { conversation_id, user_id },
            false => ClientEvent::StopTyping { conversation_id, user_id },
        };
        self.emit(&event).await
    }

    /// Next pushed event, or `None` once the server closed the socket.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, ClientError> {
        while let Some(frame) = self.socket.next().await {
            match frame? {
                Frame::Text(text) => return Ok(Some(serde_json::from_str(text.as_str())?)),
                Frame::Close(_) => break,
                _ => {}
            }
        }
        Ok(None)
    }

    pub async fn logout(mut self) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(join(&self.base, "session")?)
            .send()
            .await?;
        success(response).await?;

        self.socket.close(None).await?;
        debug!(user_id = %self.user, "session closed");
        Ok(())
    }
}

fn join(base: &Url, path: &str) -> Result<Url, ClientError> {
    base.join(path).map_err(|e| ClientError::Url(e.to_string()))
}

async fn success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status { status, body })
}
