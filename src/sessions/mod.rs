//! Account sessions: connect, subscribe, relay, download and post.

pub mod registry;
pub mod telegram;
#[cfg(test)]
pub(crate) mod testing;
pub mod twitter;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::SessionError;
use crate::pipeline::types::{Attachment, EventStream};
use crate::store::model::{Platform, Role};

pub use registry::{AccountRegistry, Session};
pub use telegram::TelegramSession;
pub use twitter::TwitterSession;

/// A registered account session as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub identity: String,
    pub platform: Platform,
    pub role: Role,
}

/// Sessions keyed by account identity.
///
/// Every operation names the identity it acts through; unknown identities
/// fail with [`SessionError::UnknownAccount`].
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    fn list_sessions(&self) -> Vec<SessionInfo>;

    async fn is_connected(&self, identity: &str) -> bool;

    async fn connect(&self, identity: &str) -> Result<(), SessionError>;

    /// Start receiving messages from exactly `source_ids`.
    ///
    /// A later call replaces the previous subscription.
    async fn subscribe(
        &self,
        identity: &str,
        source_ids: &[String],
    ) -> Result<EventStream, SessionError>;

    async fn disconnect(&self, identity: &str) -> Result<(), SessionError>;

    /// Send `text` to `target_id`, as the caption of `attachment` when given.
    async fn send_relay(
        &self,
        identity: &str,
        target_id: &str,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<(), SessionError>;

    /// Fetch an attachment to a local file. `None` when the platform has no
    /// downloadable file for it. The caller owns and must delete the file.
    async fn download_attachment(
        &self,
        identity: &str,
        attachment: &Attachment,
    ) -> Result<Option<PathBuf>, SessionError>;

    async fn post(&self, identity: &str, text: &str, media: &[PathBuf])
    -> Result<(), SessionError>;
}

/// Local file name for a downloaded attachment, unique per download.
pub(crate) fn media_path(dir: &Path, file_name: Option<&str>) -> PathBuf {
    let ext = file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    dir.join(format!("{}{ext}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_path_keeps_extension() {
        let dir = Path::new("/tmp/media");
        let path = media_path(dir, Some("photos/file_12.jpg"));
        assert_eq!(path.parent(), Some(dir));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));

        let a = media_path(dir, None);
        let b = media_path(dir, None);
        assert_ne!(a, b);
        assert!(a.extension().is_none());
    }
}
