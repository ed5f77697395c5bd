//! Shared types for the forwarding pipeline.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::pipeline::filter::CompiledFilter;
use crate::store::model::{ForwardRule, Group, PostSpec, TargetKind};

// ── Inbound event ───────────────────────────────────────────────────

/// Media kinds a source session can hand us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Animation,
}

/// Opaque reference to media held by the source platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Platform file reference (Telegram `file_id`).
    pub file_ref: String,
    pub kind: AttachmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// One message observed on a subscribed source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Identity of the session that received the message.
    pub account: String,
    /// Chat id of the source; `None` when it could not be resolved.
    pub source_id: Option<String>,
    /// Public username of the source chat, if any.
    #[serde(default)]
    pub source_username: Option<String>,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(account: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            source_id: Some(source_id.into()),
            source_username: None,
            message_id: None,
            text: None,
            caption: None,
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_message_id(mut self, id: i64) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Message text, else caption, else empty.
    ///
    /// An empty text falls through to the caption as well.
    pub fn body(&self) -> &str {
        self.text
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(self.caption.as_deref())
            .unwrap_or("")
    }
}

/// Stream of inbound events from one subscribed session.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

// ── Rule snapshot ───────────────────────────────────────────────────

/// Resolved destination of an active rule.
#[derive(Debug, Clone)]
pub enum RuleTarget {
    /// Re-send into a group on the source platform.
    Relay { group: Group },
    /// Publish through a social account. `account.external_id` is the session identity.
    Post { account: Group, spec: PostSpec },
}

impl RuleTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Relay { .. } => TargetKind::Relay,
            Self::Post { .. } => TargetKind::Post,
        }
    }

    pub fn group(&self) -> &Group {
        match self {
            Self::Relay { group } => group,
            Self::Post { account, .. } => account,
        }
    }

    /// `"<kind>: <title>"` for attempt logs.
    pub fn descriptor(&self) -> String {
        format!("{}: {}", self.kind(), self.group().title)
    }
}

/// A rule validated and resolved for one engine run.
#[derive(Debug)]
pub struct ActiveRule {
    pub rule: ForwardRule,
    pub source: Group,
    pub target: RuleTarget,
    pub filter: CompiledFilter,
}

impl ActiveRule {
    pub fn id(&self) -> i64 {
        self.rule.id
    }

    pub fn name(&self) -> &str {
        &self.rule.name
    }
}

/// Immutable rule set for one run.
pub type RuleSnapshot = Arc<[Arc<ActiveRule>]>;

/// Unit of work for one (rule, event) pairing.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub rule: Arc<ActiveRule>,
    pub event: Arc<InboundEvent>,
}

// ── Engine state ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}
