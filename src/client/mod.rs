//! Client side of the messaging API.
//!
//! [`ChatSession`] is the connection a signed-in user holds; [`Timeline`]
//! is the message list of the conversation on screen.

mod session;
mod timeline;

pub use session::{ChatSession, ClientError};
pub use timeline::{Delivery, LocalId, Outgoing, Timeline, TimelineError, TimelineItem};
