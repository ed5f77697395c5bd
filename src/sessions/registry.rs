//! In-process registry of platform sessions built from stored accounts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::SessionError;
use crate::pipeline::types::{Attachment, EventStream};
use crate::sessions::telegram::TelegramSession;
use crate::sessions::twitter::TwitterSession;
use crate::sessions::{SessionInfo, SessionRegistry};
use crate::store::model::{Account, Platform, Role};

/// One authenticated platform session.
///
/// Operations a platform cannot perform keep the default body and fail
/// with [`SessionError::Unsupported`].
#[async_trait]
pub trait Session: Send + Sync {
    fn identity(&self) -> &str;

    fn platform(&self) -> Platform;

    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;

    async fn subscribe(&self, _source_ids: &[String]) -> Result<EventStream, SessionError> {
        Err(self.unsupported("subscribe"))
    }

    async fn send_relay(
        &self,
        _target_id: &str,
        _text: &str,
        _attachment: Option<&Attachment>,
    ) -> Result<(), SessionError> {
        Err(self.unsupported("relay"))
    }

    async fn download(&self, _attachment: &Attachment) -> Result<Option<PathBuf>, SessionError> {
        Err(self.unsupported("download"))
    }

    async fn post(&self, _text: &str, _media: &[PathBuf]) -> Result<(), SessionError> {
        Err(self.unsupported("post"))
    }

    fn unsupported(&self, operation: &'static str) -> SessionError {
        SessionError::Unsupported {
            platform: self.platform().to_string(),
            identity: self.identity().to_string(),
            operation,
        }
    }
}

struct Entry {
    role: Role,
    session: Arc<dyn Session>,
}

/// [`SessionRegistry`] over a fixed set of sessions.
#[derive(Default)]
pub struct AccountRegistry {
    sessions: HashMap<String, Entry>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one session per stored account.
    pub fn from_accounts(accounts: &[Account], media_dir: &Path, timeout: Duration) -> Self {
        let mut registry = Self::new();
        for account in accounts {
            let session: Arc<dyn Session> = match account.platform {
                Platform::Telegram => Arc::new(TelegramSession::new(
                    account.identity.clone(),
                    account.credentials.clone(),
                    media_dir.to_path_buf(),
                    timeout,
                )),
                Platform::Twitter => Arc::new(TwitterSession::new(
                    account.identity.clone(),
                    account.credentials.clone(),
                    timeout,
                )),
            };
            registry.insert(account.role, session);
        }
        info!(sessions = registry.sessions.len(), "Account registry built");
        registry
    }

    /// Register `session` under its identity, replacing any previous one.
    pub fn insert(&mut self, role: Role, session: Arc<dyn Session>) {
        self.sessions
            .insert(session.identity().to_string(), Entry { role, session });
    }

    fn get(&self, identity: &str) -> Result<&Arc<dyn Session>, SessionError> {
        self.sessions
            .get(identity)
            .map(|e| &e.session)
            .ok_or_else(|| SessionError::UnknownAccount(identity.to_string()))
    }
}

#[async_trait]
impl SessionRegistry for AccountRegistry {
    fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .sessions
            .values()
            .map(|e| SessionInfo {
                identity: e.session.identity().to_string(),
                platform: e.session.platform(),
                role: e.role,
            })
            .collect();
        list.sort_by(|a, b| a.identity.cmp(&b.identity));
        list
    }

    async fn is_connected(&self, identity: &str) -> bool {
        self.get(identity).is_ok_and(|s| s.is_connected())
    }

    async fn connect(&self, identity: &str) -> Result<(), SessionError> {
        self.get(identity)?.connect().await
    }

    async fn subscribe(
        &self,
        identity: &str,
        source_ids: &[String],
    ) -> Result<EventStream, SessionError> {
        self.get(identity)?.subscribe(source_ids).await
    }

    async fn disconnect(&self, identity: &str) -> Result<(), SessionError> {
        self.get(identity)?.disconnect().await
    }

    async fn send_relay(
        &self,
        identity: &str,
        target_id: &str,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<(), SessionError> {
        self.get(identity)?
            .send_relay(target_id, text, attachment)
            .await
    }

    async fn download_attachment(
        &self,
        identity: &str,
        attachment: &Attachment,
    ) -> Result<Option<PathBuf>, SessionError> {
        self.get(identity)?.download(attachment).await
    }

    async fn post(
        &self,
        identity: &str,
        text: &str,
        media: &[PathBuf],
    ) -> Result<(), SessionError> {
        self.get(identity)?.post(text, media).await
    }
}
