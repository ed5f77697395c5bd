//! Post adapter: compose a short-form update and publish it on a social account.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::DispatchError;
use crate::outbound::media::TempMedia;
use crate::outbound::{Outbound, wrong_adapter};
use crate::pipeline::types::{ActiveRule, InboundEvent, RuleTarget};
use crate::sessions::SessionRegistry;
use crate::store::model::{PostSpec, TargetKind};

/// Maximum post length, in characters.
pub const MAX_POST_CHARS: usize = 280;

/// Attachments beyond this are dropped before download.
pub const MAX_POST_MEDIA: usize = 4;

const ELLIPSIS: &str = "...";

pub struct PostAdapter {
    sessions: Arc<dyn SessionRegistry>,
}

impl PostAdapter {
    pub fn new(sessions: Arc<dyn SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Outbound for PostAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Post
    }

    async fn send(&self, rule: &ActiveRule, event: &InboundEvent) -> Result<(), DispatchError> {
        let RuleTarget::Post { account, spec } = &rule.target else {
            return Err(wrong_adapter(rule, self.kind()));
        };

        let text = truncate(&compose_text(spec, event.body(), &message_link(event)));

        // Guards delete every download when this scope ends, on any path.
        let mut media: Vec<TempMedia> = Vec::new();
        if rule.rule.options.forward_media {
            for attachment in event.attachments.iter().take(MAX_POST_MEDIA) {
                if let Some(path) = self
                    .sessions
                    .download_attachment(&event.account, attachment)
                    .await?
                {
                    media.push(TempMedia::new(path));
                }
            }
        }

        if text.is_empty() && media.is_empty() {
            return Err(DispatchError::EmptyMessage);
        }

        let paths: Vec<_> = media.iter().map(|m| m.path().to_path_buf()).collect();
        debug!(rule = %rule.name(), account = %account.external_id, media = paths.len(), "Posting");
        self.sessions
            .post(&account.external_id, &text, &paths)
            .await?;
        Ok(())
    }
}

/// Apply the template and hashtags to `raw`.
///
/// Without a template the raw text is used unchanged. Unknown `{...}`
/// placeholders are left as-is.
pub fn compose_text(spec: &PostSpec, raw: &str, link: &str) -> String {
    let mut text = if spec.template.is_empty() {
        raw.to_string()
    } else {
        spec.template
            .replace("{link}", link)
            .replace("{text}", raw)
    };

    let hashtags = spec.hashtags.trim();
    if !hashtags.is_empty() {
        text.push_str("\n\n");
        text.push_str(hashtags);
    }
    text
}

/// Cap `text` at [`MAX_POST_CHARS`] characters, marking the cut with an ellipsis.
pub fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_POST_CHARS {
        return text.to_string();
    }
    let keep = MAX_POST_CHARS - ELLIPSIS.len();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

/// Public link back to the source message.
pub fn message_link(event: &InboundEvent) -> String {
    let source = event.source_id.as_deref().unwrap_or_default();
    match (event.source_username.as_deref(), event.message_id) {
        (Some(username), Some(msg)) if !username.is_empty() => {
            format!("https://t.me/{username}/{msg}")
        }
        (_, Some(msg)) if source.starts_with("-100") => {
            format!("https://t.me/c/{}/{msg}", &source["-100".len()..])
        }
        _ => format!("https://t.me/{source}"),
    }
}
