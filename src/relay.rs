use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::RelayError;
use crate::llm::{ModelClient, Part};
use crate::platform::{ChatSink, ImageResolver, IncomingUpdate, OutgoingMessage, UpdateSource};

/// Format tag attached to photo parts. Telegram re-encodes every photo as JPEG.
const PHOTO_KIND: &str = "jpeg";

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub vision_model: String,
    pub text_model: String,
    pub vision_enabled: bool,
    pub echo_input_entities: bool,
    pub omit_empty_caption: bool,
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            vision_model: config.gemini.vision_model.clone(),
            text_model: config.gemini.text_model.clone(),
            vision_enabled: config.relay.vision_enabled,
            echo_input_entities: config.relay.echo_input_entities,
            omit_empty_caption: config.relay.omit_empty_caption,
        }
    }
}

/// A prompt ready for the model client.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub parts: Vec<Part>,
}

/// The dispatch loop: one update in, one reply out.
///
/// Holds the injected collaborators; nothing else is kept between updates.
pub struct Relay {
    model: Arc<dyn ModelClient>,
    images: Arc<dyn ImageResolver>,
    sink: Arc<dyn ChatSink>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(
        model: Arc<dyn ModelClient>,
        images: Arc<dyn ImageResolver>,
        sink: Arc<dyn ChatSink>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            model,
            images,
            sink,
            settings,
        }
    }

    /// Pull updates until the source is exhausted, handling each one fully
    /// before taking the next.
    pub async fn run<S: UpdateSource + ?Sized>(&self, source: &mut S) {
        info!("Relay loop started");
        while let Some(update) = source.next().await {
            self.handle(update).await;
        }
        info!("Update source closed, relay loop stopped");
    }

    /// Process one update and send exactly one reply. Never fails: errors
    /// become an `Error: ...` message and send failures are only logged.
    pub async fn handle(&self, update: IncomingUpdate) -> OutgoingMessage {
        debug!(
            chat_id = update.chat_id,
            text_len = update.text.len(),
            images = update.images.len(),
            "Handling update"
        );

        self.sink.typing(update.chat_id).await;

        let result = self.answer(&update).await;
        if let Err(e) = &result {
            error!(chat_id = update.chat_id, error = %e, "Failed to answer update");
        }

        let reply = self.format_reply(&update, result);
        if let Err(e) = self.sink.send(&reply).await {
            warn!(chat_id = reply.chat_id, error = %e, "Failed to send reply");
        }
        reply
    }

    async fn answer(&self, update: &IncomingUpdate) -> Result<String, RelayError> {
        let request = self.build_request(update).await?;
        self.invoke(&request).await
    }

    /// Pick the model and build the parts for `update`. Photo updates fetch
    /// the last (largest) image and put it before the text.
    pub async fn build_request(&self, update: &IncomingUpdate) -> Result<ModelRequest, RelayError> {
        let image = match update.images.last() {
            Some(image) if self.settings.vision_enabled => image,
            _ => {
                return Ok(ModelRequest {
                    model: self.settings.text_model.clone(),
                    parts: vec![Part::text(update.text.clone())],
                });
            }
        };

        let data = self.images.resolve(image).await?;
        debug!(chat_id = update.chat_id, bytes = data.len(), "Resolved photo");

        let mut parts = vec![Part::image(PHOTO_KIND, data)];
        if !(update.text.is_empty() && self.settings.omit_empty_caption) {
            parts.push(Part::text(update.text.clone()));
        }

        Ok(ModelRequest {
            model: self.settings.vision_model.clone(),
            parts,
        })
    }

    /// Call the model and render the first part of its first candidate.
    pub async fn invoke(&self, request: &ModelRequest) -> Result<String, RelayError> {
        let response = self.model.generate(&request.model, &request.parts).await?;
        Ok(response.first_text()?)
    }

    pub fn format_reply(
        &self,
        update: &IncomingUpdate,
        result: Result<String, RelayError>,
    ) -> OutgoingMessage {
        match result {
            Ok(body) => OutgoingMessage {
                chat_id: update.chat_id,
                body,
                markdown: true,
                entities: if self.settings.echo_input_entities {
                    update.entities.clone()
                } else {
                    Vec::new()
                },
            },
            Err(e) => OutgoingMessage {
                chat_id: update.chat_id,
                body: format!("Error: {}", e),
                markdown: false,
                entities: Vec::new(),
            },
        }
    }
}
