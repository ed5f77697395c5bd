//! X (Twitter) session using the v2 API with an OAuth2 user access token.
//!
//! Post-only: media is uploaded first, then a single tweet references the
//! returned media ids.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::sessions::registry::Session;
use crate::store::model::Platform;

const DEFAULT_BASE_URL: &str = "https://api.x.com";

pub struct TwitterSession {
    identity: String,
    token: SecretString,
    client: reqwest::Client,
    base_url: String,
    connected: AtomicBool,
}

impl TwitterSession {
    pub fn new(identity: String, token: SecretString, timeout: Duration) -> Self {
        Self {
            identity,
            token,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            connected: AtomicBool::new(false),
        }
    }

    /// Point the session at another API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/2/{path}", self.base_url)
    }

    fn send_error(&self, reason: impl Into<String>) -> SessionError {
        SessionError::SendFailed {
            identity: self.identity.clone(),
            reason: reason.into(),
        }
    }

    async fn upload_media(&self, path: &Path) -> Result<String, SessionError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("media")
            .to_string();

        let form = Form::new()
            .text("media_category", media_category(path))
            .part("media", Part::bytes(bytes).file_name(file_name));

        let resp = self
            .client
            .post(self.api_url("media/upload"))
            .bearer_auth(self.token.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.send_error(format!("media upload: {e}")))?;

        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| self.send_error(format!("media upload response: {e}")))?;
        if !status.is_success() {
            return Err(self.send_error(format!("media upload returned {status}: {data}")));
        }

        let id = data
            .pointer("/data/id")
            .and_then(Value::as_str)
            .ok_or_else(|| self.send_error(format!("media upload returned no id: {data}")))?;
        debug!(account = %self.identity, media_id = id, "Media uploaded");
        Ok(id.to_string())
    }
}

#[async_trait]
impl Session for TwitterSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), SessionError> {
        let auth_err = |reason: String| SessionError::AuthFailed {
            identity: self.identity.clone(),
            reason,
        };

        let resp = self
            .client
            .get(self.api_url("users/me"))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| auth_err(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(auth_err(format!("users/me returned {status}: {body}")));
        }

        let me: Value = resp.json().await.map_err(|e| auth_err(e.to_string()))?;
        let username = me
            .pointer("/data/username")
            .and_then(Value::as_str)
            .unwrap_or("?");
        info!(account = %self.identity, username, "X session connected");
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn post(&self, text: &str, media: &[PathBuf]) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected {
                identity: self.identity.clone(),
            });
        }

        let mut media_ids = Vec::with_capacity(media.len());
        for path in media {
            media_ids.push(self.upload_media(path).await?);
        }

        let resp = self
            .client
            .post(self.api_url("tweets"))
            .bearer_auth(self.token.expose_secret())
            .json(&tweet_body(text, &media_ids))
            .send()
            .await
            .map_err(|e| self.send_error(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.send_error(format!("tweets returned {status}: {body}")));
        }

        info!(account = %self.identity, media = media_ids.len(), "Post published");
        Ok(())
    }
}

fn tweet_body(text: &str, media_ids: &[String]) -> Value {
    let mut body = serde_json::json!({ "text": text });
    if !media_ids.is_empty() {
        body["media"] = serde_json::json!({ "media_ids": media_ids });
    }
    body
}

fn media_category(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4" | "mov" | "m4v") => "tweet_video",
        Some("gif") => "tweet_gif",
        _ => "tweet_image",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TwitterSession {
        TwitterSession::new(
            "newsdesk".into(),
            SecretString::from("token"),
            Duration::from_secs(2),
        )
        // Nothing listens on port 9; requests fail fast.
        .with_base_url("http://127.0.0.1:9/")
    }

    #[test]
    fn api_url_joins_version_prefix() {
        let s = session();
        assert_eq!(s.api_url("tweets"), "http://127.0.0.1:9/2/tweets");
        let default = TwitterSession::new("x".into(), SecretString::from("t"), Duration::from_secs(1));
        assert_eq!(default.api_url("users/me"), "https://api.x.com/2/users/me");
    }

    #[test]
    fn tweet_body_omits_empty_media() {
        assert_eq!(tweet_body("hi", &[]), serde_json::json!({ "text": "hi" }));
        assert_eq!(
            tweet_body("hi", &["1".into(), "2".into()]),
            serde_json::json!({ "text": "hi", "media": { "media_ids": ["1", "2"] } })
        );
    }

    #[test]
    fn media_category_by_extension() {
        assert_eq!(media_category(Path::new("a.MP4")), "tweet_video");
        assert_eq!(media_category(Path::new("a.gif")), "tweet_gif");
        assert_eq!(media_category(Path::new("a.jpg")), "tweet_image");
        assert_eq!(media_category(Path::new("noext")), "tweet_image");
    }

    #[tokio::test]
    async fn post_requires_connection() {
        let err = session().post("hi", &[]).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn connect_fails_without_server() {
        let s = session();
        let err = s.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::AuthFailed { .. }));
        assert!(!s.is_connected());
    }

    #[tokio::test]
    async fn relay_is_unsupported() {
        let err = session().send_relay("-100", "hi", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Unsupported { operation: "relay", .. }));
    }
}
