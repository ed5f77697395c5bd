//! Telegram session over the Bot API.
//!
//! Inbound messages arrive by long-polling `getUpdates`; only messages and
//! channel posts from subscribed chats are forwarded to the event stream.
//! Relays re-send media by `file_id`, so nothing is re-uploaded.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::pipeline::types::{Attachment, AttachmentKind, EventStream, InboundEvent};
use crate::sessions::media_path;
use crate::sessions::registry::Session;
use crate::store::model::Platform;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout handed to `getUpdates`, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

const POLL_RETRY: Duration = Duration::from_secs(5);

const ALLOWED_UPDATES: [&str; 2] = ["message", "channel_post"];

pub struct TelegramSession {
    identity: String,
    bot_token: SecretString,
    client: reqwest::Client,
    /// Separate client whose timeout outlasts the long poll.
    poll_client: reqwest::Client,
    media_dir: PathBuf,
    connected: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramSession {
    pub fn new(
        identity: String,
        bot_token: SecretString,
        media_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let poll_client = reqwest::Client::builder()
            .timeout(timeout + Duration::from_secs(POLL_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            identity,
            bot_token,
            client,
            poll_client,
            media_dir,
            connected: AtomicBool::new(false),
            poller: Mutex::new(None),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(self.bot_token.expose_secret(), method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "https://api.telegram.org/file/bot{}/{file_path}",
            self.bot_token.expose_secret()
        )
    }

    fn send_error(&self, reason: impl Into<String>) -> SessionError {
        SessionError::SendFailed {
            identity: self.identity.clone(),
            reason: reason.into(),
        }
    }

    fn require_connected(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::NotConnected {
                identity: self.identity.clone(),
            })
        }
    }

    /// POST a Bot API method and return its `result` field.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, String> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        let data: Value = resp.json().await.map_err(|e| e.to_string())?;
        unwrap_result(method, status, data)
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), SessionError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            self.call("sendMessage", &body)
                .await
                .map_err(|e| self.send_error(e))?;
        }
        Ok(())
    }

    async fn send_media(
        &self,
        chat_id: &str,
        attachment: &Attachment,
        caption: &str,
    ) -> Result<(), SessionError> {
        let (method, field) = media_method(attachment.kind);
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            field: attachment.file_ref,
        });
        if !caption.is_empty() {
            body["caption"] = Value::String(caption.to_string());
        }
        self.call(method, &body)
            .await
            .map_err(|e| self.send_error(e))?;
        debug!(account = %self.identity, chat_id, method, "Telegram media relayed");
        Ok(())
    }
}

#[async_trait]
impl Session for TelegramSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), SessionError> {
        let me = self
            .call("getMe", &serde_json::json!({}))
            .await
            .map_err(|reason| SessionError::AuthFailed {
                identity: self.identity.clone(),
                reason,
            })?;
        let username = me.get("username").and_then(Value::as_str).unwrap_or("?");
        info!(account = %self.identity, bot = username, "Telegram session connected");
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = poller {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(account = %self.identity, "Telegram session disconnected");
        Ok(())
    }

    async fn subscribe(&self, source_ids: &[String]) -> Result<EventStream, SessionError> {
        self.require_connected()?;

        // Confirm whatever is still queued so only live traffic is delivered.
        let pending = self
            .call(
                "getUpdates",
                &serde_json::json!({
                    "offset": -1,
                    "timeout": 0,
                    "allowed_updates": ALLOWED_UPDATES
                }),
            )
            .await
            .map_err(|reason| SessionError::SubscribeFailed {
                identity: self.identity.clone(),
                reason,
            })?;
        let mut offset = next_offset(pending.as_array().map(Vec::as_slice).unwrap_or(&[]), 0);
        debug!(account = %self.identity, offset, "Skipped queued Telegram updates");

        let (tx, rx) = mpsc::unbounded_channel();
        let sources: HashSet<String> = source_ids.iter().cloned().collect();
        let identity = self.identity.clone();
        let url = self.api_url("getUpdates");
        let client = self.poll_client.clone();

        let handle = tokio::spawn(async move {
            info!(account = %identity, sources = sources.len(), "Telegram session listening");

            loop {
                if tx.is_closed() {
                    info!(account = %identity, "Telegram listener closed");
                    return;
                }
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ALLOWED_UPDATES
                });

                let data: Value = match client.post(&url).json(&body).send().await {
                    Ok(resp) => match resp.json().await {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(account = %identity, "Telegram parse error: {e}");
                            tokio::time::sleep(POLL_RETRY).await;
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!(account = %identity, "Telegram poll error: {e}");
                        tokio::time::sleep(POLL_RETRY).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    warn!(account = %identity, response = %data, "Telegram getUpdates returned no result");
                    tokio::time::sleep(POLL_RETRY).await;
                    continue;
                };

                offset = next_offset(results, offset);
                for update in results {
                    let Some(event) = parse_update(&identity, update, &sources) else {
                        continue;
                    };
                    if tx.send(event).is_err() {
                        info!(account = %identity, "Telegram listener closed");
                        return;
                    }
                }
            }
        });

        let previous = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(old) = previous {
            old.abort();
        }

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send_relay(
        &self,
        target_id: &str,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<(), SessionError> {
        self.require_connected()?;
        match attachment {
            Some(att) => self.send_media(target_id, att, text).await,
            None => self.send_message(target_id, text).await,
        }
    }

    async fn download(&self, attachment: &Attachment) -> Result<Option<PathBuf>, SessionError> {
        self.require_connected()?;
        let download_err = |reason: String| SessionError::DownloadFailed {
            identity: self.identity.clone(),
            reason,
        };

        let file = self
            .call("getFile", &serde_json::json!({ "file_id": attachment.file_ref }))
            .await
            .map_err(download_err)?;
        let Some(remote_path) = file.get("file_path").and_then(Value::as_str) else {
            return Ok(None);
        };

        let resp = self
            .client
            .get(self.file_url(remote_path))
            .send()
            .await
            .map_err(|e| download_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(download_err(format!("file fetch returned {}", resp.status())));
        }
        let bytes = resp.bytes().await.map_err(|e| download_err(e.to_string()))?;

        tokio::fs::create_dir_all(&self.media_dir).await?;
        let local = media_path(
            &self.media_dir,
            attachment.file_name.as_deref().or(Some(remote_path)),
        );
        tokio::fs::write(&local, &bytes).await?;
        debug!(account = %self.identity, path = %local.display(), size = bytes.len(), "Attachment downloaded");
        Ok(Some(local))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(token: &str, method: &str) -> String {
    format!("https://api.telegram.org/bot{token}/{method}")
}

/// Bot API method and payload field for relaying `kind` by file id.
fn media_method(kind: AttachmentKind) -> (&'static str, &'static str) {
    match kind {
        AttachmentKind::Photo => ("sendPhoto", "photo"),
        AttachmentKind::Video => ("sendVideo", "video"),
        AttachmentKind::Document => ("sendDocument", "document"),
        AttachmentKind::Audio => ("sendAudio", "audio"),
        AttachmentKind::Voice => ("sendVoice", "voice"),
        AttachmentKind::Animation => ("sendAnimation", "animation"),
    }
}

fn unwrap_result(method: &str, status: reqwest::StatusCode, data: Value) -> Result<Value, String> {
    if data.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(data.get("result").cloned().unwrap_or(Value::Null));
    }
    let description = data
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description");
    Err(format!("{method} failed ({status}): {description}"))
}

/// Turn one `getUpdates` entry into an event if it comes from a subscribed chat.
/// Offset that confirms every update in `updates`; `current` when empty.
fn next_offset(updates: &[Value], current: i64) -> i64 {
    updates
        .iter()
        .filter_map(|u| u.get("update_id").and_then(Value::as_i64))
        .map(|id| id + 1)
        .fold(current, i64::max)
}

fn parse_update(account: &str, update: &Value, sources: &HashSet<String>) -> Option<InboundEvent> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;
    let chat = message.get("chat")?;
    let chat_id = chat.get("id").and_then(Value::as_i64)?.to_string();
    if !sources.contains(&chat_id) {
        return None;
    }

    let mut event = InboundEvent::new(account, chat_id);
    event.source_username = chat
        .get("username")
        .and_then(Value::as_str)
        .map(String::from);
    event.message_id = message.get("message_id").and_then(Value::as_i64);
    event.text = message.get("text").and_then(Value::as_str).map(String::from);
    event.caption = message
        .get("caption")
        .and_then(Value::as_str)
        .map(String::from);
    event.attachments = parse_attachments(message);
    Some(event)
}

fn parse_attachments(message: &Value) -> Vec<Attachment> {
    let mut out = Vec::new();

    // Photos come as several sizes; the last is the largest.
    if let Some(file_id) = message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
        .and_then(|p| p.get("file_id"))
        .and_then(Value::as_str)
    {
        out.push(Attachment {
            file_ref: file_id.to_string(),
            kind: AttachmentKind::Photo,
            file_name: None,
        });
    }

    // `animation` messages also carry a `document`; check it first.
    let singles = [
        ("animation", AttachmentKind::Animation),
        ("video", AttachmentKind::Video),
        ("audio", AttachmentKind::Audio),
        ("voice", AttachmentKind::Voice),
        ("document", AttachmentKind::Document),
    ];
    for (field, kind) in singles {
        let Some(media) = message.get(field) else {
            continue;
        };
        if kind == AttachmentKind::Document
            && out.iter().any(|a| a.kind == AttachmentKind::Animation)
        {
            continue;
        }
        if let Some(file_id) = media.get("file_id").and_then(Value::as_str) {
            out.push(Attachment {
                file_ref: file_id.to_string(),
                kind,
                file_name: media
                    .get("file_name")
                    .and_then(Value::as_str)
                    .map(String::from),
            });
        }
    }
    out
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(0) | None => limit,
            Some(i) => i,
        };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TelegramSession {
        TelegramSession::new(
            "relay_bot".into(),
            SecretString::from("123:ABC"),
            std::env::temp_dir(),
            Duration::from_secs(2),
        )
    }

    fn sources(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn next_offset_confirms_latest_update() {
        let updates = vec![
            serde_json::json!({"update_id": 41, "message": {}}),
            serde_json::json!({"update_id": 43, "channel_post": {}}),
            serde_json::json!({"update_id": 42}),
        ];
        assert_eq!(next_offset(&updates, 0), 44);
    }

    #[test]
    fn next_offset_keeps_current_without_updates() {
        assert_eq!(next_offset(&[], 0), 0);
        assert_eq!(next_offset(&[], 17), 17);
        // Entries without an id do not move the offset.
        assert_eq!(next_offset(&[serde_json::json!({"message": {}})], 17), 17);
    }

    #[tokio::test]
    async fn subscribe_requires_connection() {
        let s = session();
        let err = s.subscribe(&["-100".to_string()]).await.err().unwrap();
        assert!(matches!(err, SessionError::NotConnected { .. }));
    }

    #[test]
    fn telegram_api_url() {
        let s = session();
        assert_eq!(s.api_url("getMe"), "https://api.telegram.org/bot123:ABC/getMe");
        assert_eq!(
            s.file_url("photos/file_1.jpg"),
            "https://api.telegram.org/file/bot123:ABC/photos/file_1.jpg"
        );
    }

    #[test]
    fn media_methods_by_kind() {
        assert_eq!(media_method(AttachmentKind::Photo), ("sendPhoto", "photo"));
        assert_eq!(media_method(AttachmentKind::Voice), ("sendVoice", "voice"));
        assert_eq!(
            media_method(AttachmentKind::Animation),
            ("sendAnimation", "animation")
        );
    }

    #[test]
    fn parses_channel_post_from_subscribed_chat() {
        let update = serde_json::json!({
            "update_id": 10,
            "channel_post": {
                "message_id": 42,
                "chat": { "id": -1001234567890_i64, "title": "Newsroom", "username": "newsroom", "type": "channel" },
                "caption": "breaking",
                "photo": [
                    { "file_id": "small", "width": 90 },
                    { "file_id": "large", "width": 1280 }
                ]
            }
        });
        let event = parse_update("relay_bot", &update, &sources(&["-1001234567890"])).unwrap();
        assert_eq!(event.account, "relay_bot");
        assert_eq!(event.source_id.as_deref(), Some("-1001234567890"));
        assert_eq!(event.source_username.as_deref(), Some("newsroom"));
        assert_eq!(event.message_id, Some(42));
        assert_eq!(event.body(), "breaking");
        assert_eq!(event.attachments.len(), 1);
        assert_eq!(event.attachments[0].file_ref, "large");
        assert_eq!(event.attachments[0].kind, AttachmentKind::Photo);
    }

    #[test]
    fn ignores_unsubscribed_chats() {
        let update = serde_json::json!({
            "update_id": 11,
            "message": { "message_id": 1, "chat": { "id": 555 }, "text": "hi" }
        });
        assert!(parse_update("relay_bot", &update, &sources(&["-100"])).is_none());
        assert!(parse_update("relay_bot", &serde_json::json!({ "update_id": 12 }), &sources(&["555"])).is_none());
    }

    #[test]
    fn animation_is_not_duplicated_as_document() {
        let message = serde_json::json!({
            "animation": { "file_id": "anim", "file_name": "cat.mp4" },
            "document": { "file_id": "anim", "file_name": "cat.mp4" }
        });
        let atts = parse_attachments(&message);
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].kind, AttachmentKind::Animation);
        assert_eq!(atts[0].file_name.as_deref(), Some("cat.mp4"));
    }

    #[test]
    fn unwrap_result_reports_description() {
        let err = unwrap_result(
            "sendMessage",
            reqwest::StatusCode::BAD_REQUEST,
            serde_json::json!({ "ok": false, "description": "chat not found" }),
        )
        .unwrap_err();
        assert!(err.contains("sendMessage"));
        assert!(err.contains("chat not found"));

        let ok = unwrap_result(
            "getMe",
            reqwest::StatusCode::OK,
            serde_json::json!({ "ok": true, "result": { "username": "bot" } }),
        )
        .unwrap();
        assert_eq!(ok["username"], "bot");
    }

    #[test]
    fn split_message_short_text_untouched() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
    }

    #[test]
    fn split_message_prefers_newlines() {
        let chunks = split_message("aaaa\nbbbb cccc", 8);
        assert_eq!(chunks, vec!["aaaa", "bbbb", "cccc"]);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let text = "é".repeat(10);
        let chunks = split_message(&text, 4);
        assert_eq!(chunks, vec!["éééé", "éééé", "éé"]);
    }

    #[tokio::test]
    async fn relay_requires_connection() {
        let s = session();
        let err = s.send_relay("-100", "hi", None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn post_is_unsupported() {
        let s = session();
        let err = s.post("hi", &[]).await.unwrap_err();
        assert!(matches!(err, SessionError::Unsupported { operation: "post", .. }));
    }
}
