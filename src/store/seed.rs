//! JSON seed file import — upserts accounts and rules on startup.
//!
//! ```json
//! {
//!   "accounts": [
//!     { "identity": "mirror_bot", "platform": "telegram", "role": "source", "credentials": "123:ABC" }
//!   ],
//!   "rules": [
//!     {
//!       "name": "breaking-to-x",
//!       "source": { "external_id": "-1001234", "title": "Newsroom", "kind": "channel" },
//!       "target_kind": "post",
//!       "target": { "external_id": "newsdesk", "title": "@newsdesk", "kind": "social_account" },
//!       "filters": { "keywords": ["breaking"], "regex": "" },
//!       "post": { "template": "{text}\n{link}", "hashtags": "#news" },
//!       "options": { "delay": { "enabled": true, "seconds": 10 }, "forward_media": true }
//!     }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ConfigError, Error};
use crate::store::model::{
    FilterSpec, GroupKind, NewGroup, NewRule, Platform, PostSpec, Role, RuleOptions, TargetKind,
};
use crate::store::traits::RuleStore;

#[derive(Debug, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub accounts: Vec<SeedAccount>,
    #[serde(default)]
    pub rules: Vec<SeedRule>,
}

#[derive(Debug, Deserialize)]
pub struct SeedAccount {
    pub identity: String,
    pub platform: Platform,
    pub role: Role,
    pub credentials: String,
}

#[derive(Debug, Deserialize)]
pub struct SeedGroup {
    pub external_id: String,
    pub title: String,
    pub kind: GroupKind,
}

#[derive(Debug, Deserialize)]
pub struct SeedRule {
    pub name: String,
    pub source: SeedGroup,
    pub target_kind: TargetKind,
    pub target: SeedGroup,
    #[serde(default)]
    pub filters: FilterSpec,
    #[serde(default)]
    pub post: Option<PostSpec>,
    #[serde(default)]
    pub options: RuleOptions,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// What a seed run changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub accounts: usize,
    pub rules: usize,
    pub skipped: usize,
}

impl SeedRule {
    /// Post spec must be present exactly for post targets.
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.target_kind, &self.post) {
            (TargetKind::Post, None) => Err(ConfigError::InvalidRule {
                rule: self.name.clone(),
                reason: "post target without a post spec".into(),
            }),
            (TargetKind::Relay, Some(_)) => Err(ConfigError::InvalidRule {
                rule: self.name.clone(),
                reason: "relay target with a post spec".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Parse a seed document.
pub fn parse(raw: &str) -> Result<SeedFile, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(format!("seed file: {e}")))
}

/// Read and apply a seed file.
pub async fn import_file(store: &dyn RuleStore, path: &Path) -> Result<SeedReport, Error> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(ConfigError::Io)?;
    let seed = parse(&raw)?;
    let report = apply(store, &seed).await?;
    info!(
        path = %path.display(),
        accounts = report.accounts,
        rules = report.rules,
        skipped = report.skipped,
        "Seed file imported"
    );
    Ok(report)
}

/// Upsert every account and rule in `seed`. Invalid rules are skipped.
pub async fn apply(store: &dyn RuleStore, seed: &SeedFile) -> Result<SeedReport, Error> {
    let mut report = SeedReport::default();

    for account in &seed.accounts {
        store
            .save_account(
                &account.identity,
                account.platform,
                account.role,
                &account.credentials,
            )
            .await?;
        report.accounts += 1;
    }

    for rule in &seed.rules {
        if let Err(e) = rule.validate() {
            warn!("Skipping seed rule: {e}");
            report.skipped += 1;
            continue;
        }

        let source = store
            .save_group(&NewGroup {
                external_id: rule.source.external_id.clone(),
                title: rule.source.title.clone(),
                role: Role::Source,
                kind: rule.source.kind,
                members_count: None,
            })
            .await?;
        let target = store
            .save_group(&NewGroup {
                external_id: rule.target.external_id.clone(),
                title: rule.target.title.clone(),
                role: Role::Target,
                kind: rule.target.kind,
                members_count: None,
            })
            .await?;

        store
            .save_rule(&NewRule {
                name: rule.name.clone(),
                source_group_id: source.id,
                target_kind: rule.target_kind,
                target_group_id: target.id,
                filters: rule.filters.clone(),
                post: rule.post.clone(),
                options: rule.options,
                enabled: rule.enabled,
            })
            .await?;
        report.rules += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;

    const SEED: &str = r##"{
        "accounts": [
            { "identity": "mirror_bot", "platform": "telegram", "role": "source", "credentials": "123:ABC" },
            { "identity": "newsdesk", "platform": "twitter", "role": "target", "credentials": "oauth-token" }
        ],
        "rules": [
            {
                "name": "breaking-to-x",
                "source": { "external_id": "-1001234", "title": "Newsroom", "kind": "channel" },
                "target_kind": "post",
                "target": { "external_id": "newsdesk", "title": "@newsdesk", "kind": "social_account" },
                "filters": { "keywords": ["breaking"] },
                "post": { "template": "{text}\n{link}", "hashtags": "#news" }
            },
            {
                "name": "mirror",
                "source": { "external_id": "-1001234", "title": "Newsroom", "kind": "channel" },
                "target_kind": "relay",
                "target": { "external_id": "-1009999", "title": "Mirror", "kind": "group" },
                "options": { "forward_media": true }
            },
            {
                "name": "broken",
                "source": { "external_id": "-1001234", "title": "Newsroom", "kind": "channel" },
                "target_kind": "post",
                "target": { "external_id": "newsdesk", "title": "@newsdesk", "kind": "social_account" }
            }
        ]
    }"##;

    #[tokio::test]
    async fn apply_upserts_and_skips_invalid_rules() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seed = parse(SEED).unwrap();

        let report = apply(&store, &seed).await.unwrap();
        assert_eq!(
            report,
            SeedReport {
                accounts: 2,
                rules: 2,
                skipped: 1
            }
        );

        let rules = store.list_rules(false).await.unwrap();
        assert_eq!(rules.len(), 2);
        // Both rules share one source group row.
        assert_eq!(rules[0].source_group_id, rules[1].source_group_id);
        assert!(store.get_rule_by_name("broken").await.unwrap().is_none());

        // Re-applying is idempotent.
        let again = apply(&store, &seed).await.unwrap();
        assert_eq!(again.rules, 2);
        assert_eq!(store.list_rules(false).await.unwrap().len(), 2);
    }

    #[test]
    fn parse_rejects_unknown_target_kind() {
        let raw = r#"{ "rules": [ {
            "name": "x",
            "source": { "external_id": "1", "title": "s", "kind": "group" },
            "target_kind": "fax",
            "target": { "external_id": "2", "title": "t", "kind": "group" }
        } ] }"#;
        assert!(matches!(parse(raw), Err(ConfigError::ParseError(_))));
    }

    #[tokio::test]
    async fn import_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, SEED).unwrap();

        let store = LibSqlStore::new_memory().await.unwrap();
        let report = import_file(&store, &path).await.unwrap();
        assert_eq!(report.accounts, 2);
    }
}
