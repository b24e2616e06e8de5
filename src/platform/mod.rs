pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::FetchError;

/// Formatting style of a text span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Spoiler,
    Code,
    Pre { language: Option<String> },
    TextLink { url: String },
    /// Anything the relay does not reproduce on replies (mentions, hashtags, ...)
    Other(String),
}

/// A formatting annotation over `length` units of text starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEntity {
    pub offset: usize,
    pub length: usize,
    pub kind: EntityKind,
}

/// Opaque handle to a remote image, resolved by an [`ImageResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(pub String);

/// A chat event the relay has to answer
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingUpdate {
    pub chat_id: i64,
    /// Message text, or the caption for photos. May be empty.
    pub text: String,
    /// Attached images in platform order; the last is the largest.
    pub images: Vec<ImageRef>,
    pub entities: Vec<TextEntity>,
}

#[cfg(test)]
impl IncomingUpdate {
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            images: Vec::new(),
            entities: Vec::new(),
        }
    }
}

/// The single reply produced for an [`IncomingUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub chat_id: i64,
    pub body: String,
    pub markdown: bool,
    pub entities: Vec<TextEntity>,
}

/// Ordered stream of updates. `next` blocks until one is available and
/// returns `None` only when the source is exhausted.
#[async_trait]
pub trait UpdateSource: Send {
    async fn next(&mut self) -> Option<IncomingUpdate>;
}

/// Turns an [`ImageRef`] into raw bytes.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError>;
}

/// Delivers replies back to the chat platform.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> Result<()>;

    /// Best-effort "typing..." hint while the model works.
    async fn typing(&self, _chat_id: i64) {}
}
