//! Recording session registry for adapter tests.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::pipeline::types::{Attachment, EventStream};
use crate::sessions::{SessionInfo, SessionRegistry};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Relay {
        identity: String,
        target: String,
        text: String,
        attachment: Option<String>,
    },
    Download {
        identity: String,
        file_ref: String,
    },
    Post {
        identity: String,
        text: String,
        media: Vec<PathBuf>,
        /// Whether each media file existed when the post was made.
        present: Vec<bool>,
    },
}

#[derive(Default)]
pub(crate) struct RecordingRegistry {
    pub calls: Mutex<Vec<Call>>,
    /// Downloads write a file here; `None` makes every download return `None`.
    pub download_dir: Option<PathBuf>,
    pub fail_post: bool,
    pub fail_relay: bool,
}

impl RecordingRegistry {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SessionRegistry for RecordingRegistry {
    fn list_sessions(&self) -> Vec<SessionInfo> {
        Vec::new()
    }

    async fn is_connected(&self, _identity: &str) -> bool {
        true
    }

    async fn connect(&self, _identity: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn subscribe(
        &self,
        identity: &str,
        _source_ids: &[String],
    ) -> Result<EventStream, SessionError> {
        Err(SessionError::SubscribeFailed {
            identity: identity.into(),
            reason: "not recorded".into(),
        })
    }

    async fn disconnect(&self, _identity: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn send_relay(
        &self,
        identity: &str,
        target_id: &str,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<(), SessionError> {
        self.push(Call::Relay {
            identity: identity.into(),
            target: target_id.into(),
            text: text.into(),
            attachment: attachment.map(|a| a.file_ref.clone()),
        });
        if self.fail_relay {
            return Err(SessionError::SendFailed {
                identity: identity.into(),
                reason: "relay refused".into(),
            });
        }
        Ok(())
    }

    async fn download_attachment(
        &self,
        identity: &str,
        attachment: &Attachment,
    ) -> Result<Option<PathBuf>, SessionError> {
        self.push(Call::Download {
            identity: identity.into(),
            file_ref: attachment.file_ref.clone(),
        });
        let Some(dir) = &self.download_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.bin", attachment.file_ref));
        std::fs::write(&path, attachment.file_ref.as_bytes())?;
        Ok(Some(path))
    }

    async fn post(
        &self,
        identity: &str,
        text: &str,
        media: &[PathBuf],
    ) -> Result<(), SessionError> {
        self.push(Call::Post {
            identity: identity.into(),
            text: text.into(),
            media: media.to_vec(),
            present: media.iter().map(|p| p.exists()).collect(),
        });
        if self.fail_post {
            return Err(SessionError::SendFailed {
                identity: identity.into(),
                reason: "post rejected".into(),
            });
        }
        Ok(())
    }
}
