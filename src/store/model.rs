//! Persisted data shapes: accounts, groups, forwarding rules and attempts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

// ── Enumerations ────────────────────────────────────────────────────

/// Platform an account session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Telegram,
    Twitter,
}

/// Whether an account/group feeds rules or receives their output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    Target,
}

/// What a group row points at on the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Channel,
    Group,
    SocialAccount,
}

/// Where a rule delivers: an in-platform relay or a cross-platform post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Relay,
    Post,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($ty), ": {}"), other)),
                }
            }
        }
    };
}

str_enum!(Platform { Telegram => "telegram", Twitter => "twitter" });
str_enum!(Role { Source => "source", Target => "target" });
str_enum!(GroupKind { Channel => "channel", Group => "group", SocialAccount => "social_account" });
str_enum!(TargetKind { Relay => "relay", Post => "post" });

// ── Accounts and groups ─────────────────────────────────────────────

/// An authenticated account. Read-only to the engine.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    /// Phone number, bot name or social handle; unique per platform.
    pub identity: String,
    pub platform: Platform,
    pub role: Role,
    /// Opaque credential bundle (bot token, OAuth2 user token).
    pub credentials: SecretString,
}

/// A channel, group or social account referenced by rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    /// Platform-native id (chat id, social handle).
    pub external_id: String,
    pub title: String,
    pub role: Role,
    pub kind: GroupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members_count: Option<i64>,
}

/// Fields needed to insert a group.
#[derive(Debug, Clone, Deserialize)]
pub struct NewGroup {
    pub external_id: String,
    pub title: String,
    pub role: Role,
    pub kind: GroupKind,
    #[serde(default)]
    pub members_count: Option<i64>,
}

// ── Rules ───────────────────────────────────────────────────────────

/// Message filter: keyword set (OR) AND optional regex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub regex: String,
}

/// Composition settings for cross-platform posts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostSpec {
    /// Template with `{text}` and `{link}` placeholders. Empty means raw text.
    #[serde(default)]
    pub template: String,
    /// Appended as its own paragraph when non-empty.
    #[serde(default)]
    pub hashtags: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayOption {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub seconds: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleOptions {
    #[serde(default)]
    pub delay: DelayOption,
    #[serde(default)]
    pub forward_media: bool,
}

/// A forwarding rule as stored.
///
/// `post` must be `Some` exactly when `target_kind` is `Post`; rows that
/// break this are rejected when the engine builds its snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRule {
    pub id: i64,
    pub name: String,
    /// Internal id of the source group.
    pub source_group_id: i64,
    pub target_kind: TargetKind,
    /// Internal id of the target group (a social account for posts).
    pub target_group_id: i64,
    pub filters: FilterSpec,
    pub post: Option<PostSpec>,
    pub options: RuleOptions,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert or replace a rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub source_group_id: i64,
    pub target_kind: TargetKind,
    pub target_group_id: i64,
    pub filters: FilterSpec,
    pub post: Option<PostSpec>,
    pub options: RuleOptions,
    pub enabled: bool,
}

// ── Attempts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
}

str_enum!(AttemptStatus { Success => "success", Failed => "failed" });

/// One dispatch attempt, as kept in the audit windows and the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardAttempt {
    pub timestamp: DateTime<Utc>,
    pub rule_id: i64,
    pub rule_name: String,
    pub source: String,
    /// `"<kind>: <title>"`, e.g. `"post: @newsdesk"`.
    pub target: String,
    pub status: AttemptStatus,
    /// At most [`EXCERPT_CHARS`] characters of the message text.
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub const EXCERPT_CHARS: usize = 100;

/// First [`EXCERPT_CHARS`] characters of `text`.
pub fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}
