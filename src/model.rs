use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset, macros::format_description};
use uuid::Uuid;

/// Joins the two participant ids of a conversation.
pub const SEPARATOR: char = '-';

pub const DEFAULT_PROFILE_NAME: &str = "Utilisateur UP";
pub const EMPTY_PREVIEW: &str = "Aucun message";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("user id must not be empty")]
    EmptyUserId,
    #[error("user id {0:?} must not contain '{SEPARATOR}'")]
    UserIdSeparator(String),
    #[error("a conversation needs two distinct participants")]
    SameParticipants,
    #[error("malformed conversation id {0:?}")]
    MalformedConversationId(String),
    #[error("conversation id {given:?} is not canonical, expected {expected:?}")]
    NonCanonicalConversationId { given: String, expected: String },
    #[error("{kind} message requires {field}")]
    MissingField { kind: MessageKind, field: &'static str },
    #[error("{kind} message does not accept {field}")]
    UnexpectedField { kind: MessageKind, field: &'static str },
    #[error("location ({lat}, {lng}) is out of range")]
    LocationOutOfRange { lat: f64, lng: f64 },
    #[error("duration {0} is not a valid number of seconds")]
    InvalidDuration(f64),
    #[error("profile name must not be empty")]
    EmptyProfileName,
}

/// Opaque identity handed to us by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::EmptyUserId);
        }
        if id.contains(SEPARATOR) {
            return Err(ValidationError::UserIdSeparator(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ValidationError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Two-party conversation key. The pair is always stored sorted, so the
/// id of `(x, y)` and `(y, x)` is the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId {
    low: UserId,
    high: UserId,
}

impl ConversationId {
    pub fn for_pair(x: &UserId, y: &UserId) -> Result<Self, ValidationError> {
        let (low, high) = match x.cmp(y) {
            std::cmp::Ordering::Less => (x, y),
            std::cmp::Ordering::Greater => (y, x),
            std::cmp::Ordering::Equal => return Err(ValidationError::SameParticipants),
        };

        Ok(Self {
            low: low.clone(),
            high: high.clone(),
        })
    }

    /// Accepts only the canonical `low-high` form.
    pub fn parse(id: &str) -> Result<Self, ValidationError> {
        let Some((x, y)) = id.split_once(SEPARATOR) else {
            return Err(ValidationError::MalformedConversationId(id.to_owned()));
        };
        let malformed = |_| ValidationError::MalformedConversationId(id.to_owned());
        let parsed = Self::for_pair(&UserId::new(x).map_err(malformed)?, &UserId::new(y).map_err(malformed)?)?;

        let expected = parsed.to_string();
        if expected != id {
            return Err(ValidationError::NonCanonicalConversationId {
                given: id.to_owned(),
                expected,
            });
        }

        Ok(parsed)
    }

    pub fn participants(&self) -> [&UserId; 2] {
        [&self.low, &self.high]
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `user`, if `user` takes part at all.
    pub fn other(&self, user: &UserId) -> Option<&UserId> {
        if &self.low == user {
            Some(&self.high)
        } else if &self.high == user {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.low, self.high)
    }
}

impl FromStr for ConversationId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = ValidationError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::parse(&id)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Location,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        use MessageKind::*;
        match self {
            Text => "text",
            Image => "image",
            Audio => "audio",
            Video => "video",
            Location => "location",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use MessageKind::*;
        Ok(match s {
            "text" => Text,
            "image" => Image,
            "audio" => Audio,
            "video" => Video,
            "location" => Location,
            other => return Err(format!("unknown message kind {other:?}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Body of `POST /conversations/{id}/messages`, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
}

impl SendMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// A message payload whose shape has been checked against its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Image { media_url: String, caption: Option<String> },
    Audio { media_url: String, duration: Option<f64> },
    Video { media_url: String, caption: Option<String>, duration: Option<f64> },
    Location(Location),
}

impl Content {
    pub fn kind(&self) -> MessageKind {
        match self {
            Content::Text(_) => MessageKind::Text,
            Content::Image { .. } => MessageKind::Image,
            Content::Audio { .. } => MessageKind::Audio,
            Content::Video { .. } => MessageKind::Video,
            Content::Location(_) => MessageKind::Location,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Image { caption, .. } | Content::Video { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }

    pub fn media_url(&self) -> Option<&str> {
        match self {
            Content::Image { media_url, .. }
            | Content::Audio { media_url, .. }
            | Content::Video { media_url, .. } => Some(media_url),
            _ => None,
        }
    }

    pub fn location(&self) -> Option<Location> {
        match self {
            Content::Location(location) => Some(*location),
            _ => None,
        }
    }

    pub fn duration(&self) -> Option<f64> {
        match self {
            Content::Audio { duration, .. } | Content::Video { duration, .. } => *duration,
            _ => None,
        }
    }
}

impl TryFrom<SendMessage> for Content {
    type Error = ValidationError;

    fn try_from(request: SendMessage) -> Result<Self, Self::Error> {
        let SendMessage { text, kind, media_url, location, audio_duration } = request;

        let text = text.filter(|text| !text.trim().is_empty());
        let media_url = media_url.filter(|url| !url.trim().is_empty());

        let missing = |field| ValidationError::MissingField { kind, field };
        let reject = |present: bool, field| match present {
            true => Err(ValidationError::UnexpectedField { kind, field }),
            false => Ok(()),
        };

        if let Some(duration) = audio_duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(ValidationError::InvalidDuration(duration));
            }
        }

        match kind {
            MessageKind::Text => {
                reject(media_url.is_some(), "mediaUrl")?;
                reject(location.is_some(), "location")?;
                reject(audio_duration.is_some(), "audioDuration")?;
                Ok(Content::Text(text.ok_or(missing("text"))?))
            }
            MessageKind::Image => {
                reject(location.is_some(), "location")?;
                reject(audio_duration.is_some(), "audioDuration")?;
                Ok(Content::Image {
                    media_url: media_url.ok_or(missing("mediaUrl"))?,
                    caption: text,
                })
            }
            MessageKind::Audio => {
                reject(text.is_some(), "text")?;
                reject(location.is_some(), "location")?;
                Ok(Content::Audio {
                    media_url: media_url.ok_or(missing("mediaUrl"))?,
                    duration: audio_duration,
                })
            }
            MessageKind::Video => {
                reject(location.is_some(), "location")?;
                Ok(Content::Video {
                    media_url: media_url.ok_or(missing("mediaUrl"))?,
                    caption: text,
                    duration: audio_duration,
                })
            }
            MessageKind::Location => {
                reject(text.is_some(), "text")?;
                reject(media_url.is_some(), "mediaUrl")?;
                reject(audio_duration.is_some(), "audioDuration")?;
                let location = location.ok_or(missing("location"))?;
                let in_range = (-90.0..=90.0).contains(&location.lat)
                    && (-180.0..=180.0).contains(&location.lng);
                if !in_range {
                    return Err(ValidationError::LocationOutOfRange {
                        lat: location.lat,
                        lng: location.lng,
                    });
                }
                Ok(Content::Location(location))
            }
        }
    }
}

/// A stored message as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub from: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    /// Display-only, rendered once when the message is written.
    pub time: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    pub fn new(
        id: Uuid,
        from: UserId,
        content: &Content,
        created_at: OffsetDateTime,
        display_offset: UtcOffset,
    ) -> Self {
        Self {
            id,
            from,
            text: content.text().map(str::to_owned),
            kind: content.kind(),
            media_url: content.media_url().map(str::to_owned),
            location: content.location(),
            audio_duration: content.duration(),
            time: render_time(created_at, display_offset),
            created_at,
        }
    }

    /// One-line summary shown in the conversation list.
    pub fn preview(&self) -> String {
        if let Some(text) = self.text.as_deref().filter(|text| !text.is_empty()) {
            return text.to_owned();
        }

        match self.kind {
            MessageKind::Image => "📷 Image",
            MessageKind::Audio => "🎤 Audio",
            MessageKind::Video => "🎬 Vidéo",
            MessageKind::Location => "📍 Position",
            MessageKind::Text => EMPTY_PREVIEW,
        }
        .to_owned()
    }
}

/// `HH:MM` in the given offset.
pub fn render_time(at: OffsetDateTime, offset: UtcOffset) -> String {
    at.to_offset(offset)
        .format(format_description!("[hour]:[minute]"))
        .unwrap_or_default()
}

/// Display profile owned by the profiles collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE_NAME.to_owned(),
            avatar: None,
        }
    }
}

/// What the store knows about one of a user's conversations.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationOverview {
    pub id: ConversationId,
    pub other_participant_id: UserId,
    pub profile: Profile,
    pub last_message: Option<Message>,
    pub updated_at: OffsetDateTime,
    pub unread: bool,
}

/// Conversation list entry as served by `GET /conversations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub other_participant_id: UserId,
    pub name: String,
    pub avatar: Option<String>,
    pub last_message_preview: String,
    pub last_message_time: String,
    pub unread: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<ConversationOverview> for ConversationSummary {
    fn from(overview: ConversationOverview) -> Self {
        let (last_message_preview, last_message_time) = match &overview.last_message {
            Some(message) => (message.preview(), message.time.clone()),
            None => (EMPTY_PREVIEW.to_owned(), String::new()),
        };

        Self {
            id: overview.id,
            other_participant_id: overview.other_participant_id,
            name: overview.profile.name,
            avatar: overview.profile.avatar,
            last_message_preview,
            last_message_time,
            unread: overview.unread,
            updated_at: overview.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn conversation_id_is_order_independent() {
        let a = user("0197000000");
        let b = user("0151852420");

        let ab = ConversationId::for_pair(&a, &b).unwrap();
        let ba = ConversationId::for_pair(&b, &a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.to_string(), "0151852420-0197000000");
        assert_eq!(ab.other(&a), Some(&b));
        assert_eq!(ab.other(&user("42")), None);
    }

    #[test]
    fn conversation_id_parse_requires_canonical_pair() {
        assert!(ConversationId::parse("0151852420-0197000000").is_ok());
        assert!(matches!(
            ConversationId::parse("0197000000-0151852420"),
            Err(ValidationError::NonCanonicalConversationId { .. })
        ));
        assert_eq!(
            ConversationId::parse("alice-alice"),
            Err(ValidationError::SameParticipants)
        );
        assert!(matches!(
            ConversationId::parse("alice"),
            Err(ValidationError::MalformedConversationId(_))
        ));
        assert!(matches!(
            ConversationId::parse("a-b-c"),
            Err(ValidationError::MalformedConversationId(_))
        ));
        assert!(matches!(
            ConversationId::parse("-bob"),
            Err(ValidationError::MalformedConversationId(_))
        ));
    }

    #[test]
    fn user_ids_reject_separator() {
        assert_eq!(UserId::new(""), Err(ValidationError::EmptyUserId));
        assert!(matches!(UserId::new("a-b"), Err(ValidationError::UserIdSeparator(_))));
        assert!(serde_json::from_str::<UserId>(r#""x-y""#).is_err());
    }

    #[test]
    fn text_message_needs_text() {
        let blank = SendMessage::text("   ");
        assert_eq!(
            Content::try_from(blank),
            Err(ValidationError::MissingField { kind: MessageKind::Text, field: "text" })
        );
        assert_eq!(
            Content::try_from(SendMessage::text("Salut")),
            Ok(Content::Text("Salut".to_owned()))
        );
    }

    #[test]
    fn payload_must_match_kind() {
        let image_without_url = SendMessage { kind: MessageKind::Image, ..Default::default() };
        assert!(matches!(
            Content::try_from(image_without_url),
            Err(ValidationError::MissingField { field: "mediaUrl", .. })
        ));

        let text_with_location = SendMessage {
            location: Some(Location { lat: 1.0, lng: 2.0 }),
            ..SendMessage::text("hi")
        };
        assert!(matches!(
            Content::try_from(text_with_location),
            Err(ValidationError::UnexpectedField { field: "location", .. })
        ));

        let far_away = SendMessage {
            kind: MessageKind::Location,
            location: Some(Location { lat: 91.0, lng: 0.0 }),
            ..Default::default()
        };
        assert!(matches!(
            Content::try_from(far_away),
            Err(ValidationError::LocationOutOfRange { .. })
        ));

        let negative = SendMessage {
            kind: MessageKind::Audio,
            media_url: Some("blob:1".to_owned()),
            audio_duration: Some(-3.0),
            ..Default::default()
        };
        assert_eq!(Content::try_from(negative), Err(ValidationError::InvalidDuration(-3.0)));

        let voice = SendMessage {
            kind: MessageKind::Audio,
            media_url: Some("blob:1".to_owned()),
            audio_duration: Some(4.5),
            ..Default::default()
        };
        assert_eq!(
            Content::try_from(voice),
            Ok(Content::Audio { media_url: "blob:1".to_owned(), duration: Some(4.5) })
        );
    }

    #[test]
    fn send_message_defaults_to_text() {
        let request: SendMessage = serde_json::from_str(r#"{"text":"yo"}"#).unwrap();
        assert_eq!(request.kind, MessageKind::Text);
        assert!(serde_json::from_str::<SendMessage>(r#"{"type":"sticker"}"#).is_err());
    }

    #[test]
    fn previews_fall_back_to_kind() {
        let at = OffsetDateTime::UNIX_EPOCH;
        let content = Content::Image { media_url: "blob:img".to_owned(), caption: None };
        let message = Message::new(Uuid::now_v7(), user("a"), &content, at, UtcOffset::UTC);
        assert_eq!(message.preview(), "📷 Image");
        assert_eq!(message.time, "00:00");

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["mediaUrl"], "blob:img");
        assert_eq!(json["createdAt"], "1970-01-01T00:00:00Z");
        assert!(json.get("text").is_none());
    }

    #[test]
    fn rendered_time_uses_display_offset() {
        let at = OffsetDateTime::from_unix_timestamp(13 * 3600 + 5 * 60).unwrap();
        let paris = UtcOffset::from_whole_seconds(3600).unwrap();
        assert_eq!(render_time(at, paris), "14:05");
    }
}
