//! Communication channels (Bluesky DMs, Telegram).
//!
//! Every adapter implements [`Channel`], turns its backend's events into [`InboundMessage`]s
//! handed to the registered callback, and sends plain text back by group id.

pub mod bluesky;
mod error;
mod inbound;
mod registry;
pub mod telegram;

pub use bluesky::BlueskyChannel;
pub use error::{AuthError, FetchError, SendError};
pub use inbound::{
    forward_to, group_id, native_conversation_id, InboundMessage, MessageCallback,
    NON_TEXT_PLACEHOLDER,
};
pub use registry::{Channel, ChannelRegistry};
pub use telegram::{TelegramChannel, TelegramUpdate};
