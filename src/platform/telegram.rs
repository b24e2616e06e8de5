use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    AllowedUpdate, ChatAction, FileId, MessageEntity, MessageEntityKind, ParseMode, UpdateKind,
};
use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::error::FetchError;
use crate::fetch::ImageFetcher;
use crate::platform::{
    ChatSink, EntityKind, ImageRef, ImageResolver, IncomingUpdate, OutgoingMessage, TextEntity,
    UpdateSource,
};

/// Pause before polling again after `getUpdates` fails.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

const GREETING: &str = "Hello! Send me a message or a photo with a question and I'll ask Gemini.";

/// Build a bot whose HTTP timeout outlives the long-poll timeout.
pub fn build_bot(config: &TelegramConfig) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(Duration::from_secs(u64::from(config.poll_timeout_secs) + 15))
        .build()
        .context("Failed to build Telegram HTTP client")?;
    Ok(Bot::with_client(&config.bot_token, client))
}

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        // A single character wider than max_len still has to make progress
        if end == start {
            end = start + 1;
            while !text.is_char_boundary(end) {
                end += 1;
            }
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

fn entity_from_telegram(entity: &MessageEntity) -> TextEntity {
    let kind = match &entity.kind {
        MessageEntityKind::Bold => EntityKind::Bold,
        MessageEntityKind::Italic => EntityKind::Italic,
        MessageEntityKind::Underline => EntityKind::Underline,
        MessageEntityKind::Strikethrough => EntityKind::Strikethrough,
        MessageEntityKind::Spoiler => EntityKind::Spoiler,
        MessageEntityKind::Code => EntityKind::Code,
        MessageEntityKind::Pre { language } => EntityKind::Pre {
            language: language.clone(),
        },
        MessageEntityKind::TextLink { url } => EntityKind::TextLink {
            url: url.to_string(),
        },
        other => EntityKind::Other(format!("{:?}", other)),
    };
    TextEntity {
        offset: entity.offset,
        length: entity.length,
        kind,
    }
}

fn entity_to_telegram(entity: &TextEntity) -> Option<MessageEntity> {
    let kind = match &entity.kind {
        EntityKind::Bold => MessageEntityKind::Bold,
        EntityKind::Italic => MessageEntityKind::Italic,
        EntityKind::Underline => MessageEntityKind::Underline,
        EntityKind::Strikethrough => MessageEntityKind::Strikethrough,
        EntityKind::Spoiler => MessageEntityKind::Spoiler,
        EntityKind::Code => MessageEntityKind::Code,
        EntityKind::Pre { language } => MessageEntityKind::Pre {
            language: language.clone(),
        },
        EntityKind::TextLink { url } => MessageEntityKind::TextLink {
            url: reqwest::Url::parse(url).ok()?,
        },
        EntityKind::Other(_) => return None,
    };
    Some(MessageEntity {
        kind,
        offset: entity.offset,
        length: entity.length,
    })
}

/// What to do with one inbound Telegram message.
#[derive(Debug, PartialEq)]
enum Inbound {
    Relay(IncomingUpdate),
    Greet,
    Unauthorized,
    Skip,
}

fn classify(msg: &Message, allowed_user_ids: &[u64]) -> Inbound {
    let allowed = allowed_user_ids.is_empty()
        || msg
            .from
            .as_ref()
            .is_some_and(|user| allowed_user_ids.contains(&user.id.0));
    if !allowed {
        return Inbound::Unauthorized;
    }

    if msg.text() == Some("/start") {
        return Inbound::Greet;
    }

    match to_incoming(msg) {
        Some(update) => Inbound::Relay(update),
        None => Inbound::Skip,
    }
}

/// Replace the bot token in error text that may reach users or logs.
fn redact_token(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }
    text.replace(token, "<redacted>")
}

/// Convert a Telegram message into an update, or `None` when there is
/// nothing to relay (stickers, service messages, ...).
fn to_incoming(msg: &Message) -> Option<IncomingUpdate> {
    let text = msg.text().or_else(|| msg.caption()).unwrap_or_default();
    let images: Vec<ImageRef> = msg
        .photo()
        .map(|sizes| sizes.iter().map(|ps| ImageRef(ps.file.id.0.clone())).collect())
        .unwrap_or_default();

    if text.is_empty() && images.is_empty() {
        return None;
    }

    let entities = msg
        .entities()
        .or_else(|| msg.caption_entities())
        .map(|list| list.iter().map(entity_from_telegram).collect())
        .unwrap_or_default();

    Some(IncomingUpdate {
        chat_id: msg.chat.id.0,
        text: text.to_string(),
        images,
        entities,
    })
}

/// Long-poll `getUpdates` source. Updates from one poll are buffered and
/// handed out one at a time in arrival order.
pub struct TelegramSource {
    bot: Bot,
    offset: i32,
    poll_timeout: u32,
    allowed_user_ids: Vec<u64>,
    pending: VecDeque<IncomingUpdate>,
}

impl TelegramSource {
    /// Verify the token and make sure no webhook steals our updates.
    pub async fn connect(bot: Bot, config: &TelegramConfig) -> Result<Self> {
        let me = bot.get_me().await.context("Failed to authorize Telegram bot")?;
        info!(
            "Authorized on account {}",
            me.username.as_deref().unwrap_or("<unknown>")
        );

        bot.delete_webhook()
            .send()
            .await
            .context("Failed to delete Telegram webhook")?;

        Ok(Self {
            bot,
            offset: config.start_offset,
            poll_timeout: config.poll_timeout_secs,
            allowed_user_ids: config.allowed_user_ids.clone(),
            pending: VecDeque::new(),
        })
    }

    async fn poll(&mut self) {
        let result = self
            .bot
            .get_updates()
            .offset(self.offset)
            .timeout(self.poll_timeout)
            .allowed_updates(vec![AllowedUpdate::Message])
            .await;

        let updates = match result {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "Failed to poll Telegram updates, retrying");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                return;
            }
        };

        debug!(count = updates.len(), "Got Telegram updates");

        for update in updates {
            self.offset = update.id.as_offset();
            let msg = match update.kind {
                UpdateKind::Message(msg) => msg,
                other => {
                    debug!("Ignoring non-message update: {:?}", other);
                    continue;
                }
            };

            match classify(&msg, &self.allowed_user_ids) {
                Inbound::Relay(incoming) => self.pending.push_back(incoming),
                Inbound::Greet => {
                    if let Err(e) = self.bot.send_message(msg.chat.id, GREETING).await {
                        warn!(chat_id = msg.chat.id.0, error = %e, "Failed to send greeting");
                    }
                }
                Inbound::Unauthorized => {
                    warn!(chat_id = msg.chat.id.0, "Ignoring message from unauthorized user");
                }
                Inbound::Skip => {
                    debug!(chat_id = msg.chat.id.0, "Ignoring message without text or photo");
                }
            }
        }
    }
}

#[async_trait]
impl UpdateSource for TelegramSource {
    async fn next(&mut self) -> Option<IncomingUpdate> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }
            self.poll().await;
        }
    }
}

/// Resolves photo file ids through `getFile` and downloads them.
pub struct TelegramResolver {
    bot: Bot,
    fetcher: ImageFetcher,
}

impl TelegramResolver {
    pub fn new(bot: Bot, fetcher: ImageFetcher) -> Self {
        Self { bot, fetcher }
    }
}

#[async_trait]
impl ImageResolver for TelegramResolver {
    async fn resolve(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        let token = self.bot.token();
        let file = self
            .bot
            .get_file(FileId(image.0.clone()))
            .await
            .map_err(|e| FetchError::Resolve(redact_token(&e.to_string(), token)))?;

        // https://api.telegram.org/file/bot<token>/<file_path>
        let url = self
            .bot
            .api_url()
            .join(&format!("file/bot{}/{}", token, file.path))
            .map_err(|e| FetchError::Resolve(redact_token(&e.to_string(), token)))?;

        self.fetcher.fetch(url.as_str()).await
    }
}

/// Sends replies with `bot.send_message`, chunked to Telegram's size limit.
pub struct TelegramSink {
    bot: Bot,
    max_len: usize,
}

impl TelegramSink {
    pub fn new(bot: Bot, max_len: usize) -> Self {
        Self { bot, max_len }
    }

    #[allow(deprecated)]
    async fn send_chunk(
        &self,
        chat_id: ChatId,
        chunk: &str,
        markdown: bool,
        entities: &[MessageEntity],
    ) -> Result<(), teloxide::RequestError> {
        let mut request = self.bot.send_message(chat_id, chunk);
        // Telegram ignores parse_mode once explicit entities are given, so
        // entities win and markdown is only requested without them.
        if !entities.is_empty() {
            request = request.entities(entities.to_vec());
        } else if markdown {
            request = request.parse_mode(ParseMode::Markdown);
        }
        request.await.map(|_| ())
    }
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send(&self, message: &OutgoingMessage) -> Result<()> {
        let chat_id = ChatId(message.chat_id);
        let chunks = split_message(&message.body, self.max_len);

        // Entity offsets only make sense against the whole, unsplit text.
        let entities: Vec<MessageEntity> = if chunks.len() == 1 {
            message.entities.iter().filter_map(entity_to_telegram).collect()
        } else {
            Vec::new()
        };

        for chunk in &chunks {
            if let Err(e) = self
                .send_chunk(chat_id, chunk, message.markdown, &entities)
                .await
            {
                if !message.markdown {
                    return Err(e).context("Failed to send message");
                }
                warn!(chat_id = message.chat_id, error = %e, "Markdown send failed, retrying as plain text");
                self.send_chunk(chat_id, chunk, false, &[])
                    .await
                    .context("Failed to send message as plain text")?;
            }
        }

        debug!(chat_id = message.chat_id, chunks = chunks.len(), "Sent reply");
        Ok(())
    }

    async fn typing(&self, chat_id: i64) {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::State,
        http::{StatusCode, Uri},
        routing::post,
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn message(extra: serde_json::Value) -> Message {
        let mut value = json!({
            "message_id": 1,
            "date": 1700000000,
            "chat": { "id": 42, "type": "private", "first_name": "Ada" },
            "from": { "id": 7, "is_bot": false, "first_name": "Ada" }
        });
        for (k, v) in extra.as_object().unwrap() {
            value[k] = v.clone();
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_text_message_becomes_update() {
        let msg = message(json!({
            "text": "hello world",
            "entities": [{ "type": "bold", "offset": 0, "length": 5 }]
        }));
        let update = to_incoming(&msg).unwrap();
        assert_eq!(update.chat_id, 42);
        assert_eq!(update.text, "hello world");
        assert!(update.images.is_empty());
        assert_eq!(
            update.entities,
            vec![TextEntity {
                offset: 0,
                length: 5,
                kind: EntityKind::Bold
            }]
        );
    }

    #[test]
    fn test_photo_message_keeps_size_order_and_caption() {
        let msg = message(json!({
            "caption": "what is this?",
            "photo": [
                { "file_id": "small", "file_unique_id": "s", "width": 90, "height": 90, "file_size": 1000 },
                { "file_id": "large", "file_unique_id": "l", "width": 1280, "height": 1280, "file_size": 90000 }
            ]
        }));
        let update = to_incoming(&msg).unwrap();
        assert_eq!(update.text, "what is this?");
        assert_eq!(
            update.images,
            vec![ImageRef("small".to_string()), ImageRef("large".to_string())]
        );
    }

    #[test]
    fn test_photo_without_caption_has_empty_text() {
        let msg = message(json!({
            "photo": [{ "file_id": "only", "file_unique_id": "o", "width": 90, "height": 90 }]
        }));
        let update = to_incoming(&msg).unwrap();
        assert_eq!(update.text, "");
        assert_eq!(update.images.len(), 1);
    }

    #[test]
    fn test_entity_conversion_drops_unsupported_kinds() {
        let link = TextEntity {
            offset: 1,
            length: 3,
            kind: EntityKind::TextLink {
                url: "https://example.com/".to_string(),
            },
        };
        let converted = entity_to_telegram(&link).unwrap();
        assert_eq!(converted.offset, 1);
        assert_eq!(entity_from_telegram(&converted), link);

        let mention = TextEntity {
            offset: 0,
            length: 4,
            kind: EntityKind::Other("Mention".to_string()),
        };
        assert!(entity_to_telegram(&mention).is_none());
    }

    #[test]
    fn test_classify_allow_list() {
        let msg = message(json!({ "text": "hi" }));
        assert!(matches!(classify(&msg, &[]), Inbound::Relay(_)));
        assert!(matches!(classify(&msg, &[7]), Inbound::Relay(_)));
        assert_eq!(classify(&msg, &[8, 9]), Inbound::Unauthorized);

        let mut anonymous = msg.clone();
        anonymous.from = None;
        assert_eq!(classify(&anonymous, &[7]), Inbound::Unauthorized);
        assert!(matches!(classify(&anonymous, &[]), Inbound::Relay(_)));
    }

    #[test]
    fn test_classify_start_and_empty_messages() {
        let start = message(json!({ "text": "/start" }));
        assert_eq!(classify(&start, &[]), Inbound::Greet);
        // Unauthorized users don't get the greeting either
        assert_eq!(classify(&start, &[8]), Inbound::Unauthorized);

        let location = message(json!({ "location": { "latitude": 52.5, "longitude": 13.4 } }));
        assert_eq!(classify(&location, &[]), Inbound::Skip);
    }

    #[test]
    fn test_redact_token() {
        let text = "error sending request for url (https://api.telegram.org/bot123:SECRET/GetFile)";
        let redacted = redact_token(text, "123:SECRET");
        assert!(!redacted.contains("SECRET"));
        assert!(redacted.contains("bot<redacted>/GetFile"));
        assert_eq!(redact_token("plain", ""), "plain");
    }

    #[test]
    fn test_split_message_short_text_is_single_chunk() {
        assert_eq!(split_message("hi there", 4000), vec!["hi there".to_string()]);
    }

    #[test]
    fn test_split_message_prefers_line_breaks() {
        let chunks = split_message("first line\nsecond line", 15);
        assert_eq!(chunks, vec!["first line\n".to_string(), "second line".to_string()]);
    }

    #[test]
    fn test_split_message_respects_char_boundaries() {
        let text = "ééééé";
        let chunks = split_message(text, 3);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.len() <= 3));
    }

    #[test]
    fn test_split_message_terminates_when_char_wider_than_limit() {
        let chunks = split_message("héllo", 1);
        assert_eq!(chunks.concat(), "héllo");
        assert_eq!(chunks, vec!["h", "é", "l", "l", "o"]);
    }

    // Minimal Bot API stand-in: records every call and rejects markdown
    // requests (or every request) on demand.
    #[derive(Clone, Default)]
    struct MockBotApi {
        reject_markdown: bool,
        reject_all: bool,
        requests: Arc<Mutex<Vec<(String, Value)>>>,
    }

    async fn bot_api_handler(
        State(api): State<MockBotApi>,
        uri: Uri,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let method = uri.path().rsplit('/').next().unwrap_or_default().to_string();
        let has_parse_mode = body.get("parse_mode").is_some();
        api.requests.lock().unwrap().push((method, body.clone()));

        if api.reject_all || (api.reject_markdown && has_parse_mode) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "ok": false,
                    "error_code": 400,
                    "description": "Bad Request: can't parse entities: Can't find end of the entity starting at byte offset 3"
                })),
            );
        }

        (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "result": {
                    "message_id": 1,
                    "date": 0,
                    "chat": { "id": body["chat_id"].clone(), "type": "private" },
                    "text": body["text"].clone()
                }
            })),
        )
    }

    async fn mock_sink(api: MockBotApi, max_len: usize) -> TelegramSink {
        let app = Router::new()
            .route("/{*path}", post(bot_api_handler))
            .with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let api_url = reqwest::Url::parse(&format!("http://{}/", addr)).unwrap();
        TelegramSink::new(Bot::new("test-token").set_api_url(api_url), max_len)
    }

    fn bold(offset: usize, length: usize) -> TextEntity {
        TextEntity {
            offset,
            length,
            kind: EntityKind::Bold,
        }
    }

    #[tokio::test]
    async fn test_sink_resends_plain_text_when_markdown_rejected() {
        let api = MockBotApi {
            reject_markdown: true,
            ..MockBotApi::default()
        };
        let sink = mock_sink(api.clone(), 4000).await;

        let reply = OutgoingMessage {
            chat_id: 42,
            body: "*unbalanced".to_string(),
            markdown: true,
            entities: Vec::new(),
        };
        sink.send(&reply).await.unwrap();

        let requests = api.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].1["parse_mode"], "Markdown");
        assert!(requests[1].1.get("parse_mode").is_none());
        assert_eq!(requests[1].1["text"], "*unbalanced");
        assert!(requests.iter().all(|(method, _)| method == "SendMessage"));
    }

    #[tokio::test]
    async fn test_sink_plain_failure_is_reported_without_retry() {
        let api = MockBotApi {
            reject_all: true,
            ..MockBotApi::default()
        };
        let sink = mock_sink(api.clone(), 4000).await;

        let reply = OutgoingMessage {
            chat_id: 42,
            body: "Error: HTTP error: 404 Not Found".to_string(),
            markdown: false,
            entities: Vec::new(),
        };
        assert!(sink.send(&reply).await.is_err());
        assert_eq!(api.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_entities_replace_parse_mode() {
        let api = MockBotApi::default();
        let sink = mock_sink(api.clone(), 4000).await;

        let reply = OutgoingMessage {
            chat_id: 42,
            body: "bold answer".to_string(),
            markdown: true,
            entities: vec![bold(0, 4)],
        };
        sink.send(&reply).await.unwrap();

        let requests = api.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].1.get("parse_mode").is_none());
        assert_eq!(requests[0].1["entities"][0]["type"], "bold");
        assert_eq!(requests[0].1["entities"][0]["length"], 4);
    }

    #[tokio::test]
    async fn test_sink_drops_entities_on_split_reply() {
        let api = MockBotApi::default();
        let sink = mock_sink(api.clone(), 15).await;

        let reply = OutgoingMessage {
            chat_id: 42,
            body: "first line\nsecond line".to_string(),
            markdown: true,
            entities: vec![bold(0, 5)],
        };
        sink.send(&reply).await.unwrap();

        let requests = api.requests.lock().unwrap();
        let texts: Vec<&str> = requests
            .iter()
            .map(|(_, body)| body["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["first line\n", "second line"]);
        assert!(requests.iter().all(|(_, body)| body.get("entities").is_none()));
        assert!(requests.iter().all(|(_, body)| body["parse_mode"] == "Markdown"));
    }
}
