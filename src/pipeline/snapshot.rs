//! Builds the immutable rule snapshot an engine run works from.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{ConfigError, DatabaseError};
use crate::pipeline::filter::CompiledFilter;
use crate::pipeline::types::{ActiveRule, RuleSnapshot, RuleTarget};
use crate::store::model::{ForwardRule, Group, GroupKind, TargetKind};
use crate::store::traits::RuleStore;

/// Load enabled rules and resolve their groups.
///
/// Rules with configuration errors are logged and left out; only store
/// failures are returned as errors.
pub async fn load_snapshot(store: &dyn RuleStore) -> Result<RuleSnapshot, DatabaseError> {
    let rules = store.list_rules(true).await?;
    let total = rules.len();
    let mut active = Vec::with_capacity(total);

    for rule in rules {
        let source = store.get_group(rule.source_group_id).await?;
        let target = store.get_group(rule.target_group_id).await?;
        match resolve(rule, source, target) {
            Ok(resolved) => {
                if let Some(error) = resolved.filter.regex_error() {
                    warn!(
                        rule = %resolved.name(),
                        error = %error,
                        "Rule regex is malformed; the rule will never match"
                    );
                }
                active.push(Arc::new(resolved));
            }
            Err(e) => warn!("Excluding rule from snapshot: {e}"),
        }
    }

    info!(loaded = active.len(), excluded = total - active.len(), "Rule snapshot built");
    Ok(active.into())
}

/// Validate one rule against its referenced groups.
pub fn resolve(
    rule: ForwardRule,
    source: Option<Group>,
    target: Option<Group>,
) -> Result<ActiveRule, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRule {
        rule: rule.name.clone(),
        reason,
    };

    let source =
        source.ok_or_else(|| invalid(format!("source group {} not found", rule.source_group_id)))?;
    let target =
        target.ok_or_else(|| invalid(format!("target group {} not found", rule.target_group_id)))?;

    let target = match (rule.target_kind, rule.post.clone()) {
        (TargetKind::Post, Some(spec)) => {
            if target.kind != GroupKind::SocialAccount {
                return Err(invalid(format!(
                    "post target {} is a {}, not a social account",
                    target.external_id, target.kind
                )));
            }
            RuleTarget::Post {
                account: target,
                spec,
            }
        }
        (TargetKind::Post, None) => return Err(invalid("post target without a post spec".into())),
        (TargetKind::Relay, Some(_)) => {
            return Err(invalid("relay target with a post spec".into()));
        }
        (TargetKind::Relay, None) => {
            if target.kind == GroupKind::SocialAccount {
                return Err(invalid(format!(
                    "relay target {} is a social account",
                    target.external_id
                )));
            }
            RuleTarget::Relay { group: target }
        }
    };

    let filter = CompiledFilter::new(&rule.filters);
    Ok(ActiveRule {
        rule,
        source,
        target,
        filter,
    })
}

/// Distinct source chat ids across the snapshot.
pub fn source_ids(rules: &[Arc<ActiveRule>]) -> BTreeSet<String> {
    rules
        .iter()
        .map(|r| r.source.external_id.clone())
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::model::{FilterSpec, PostSpec, Role, RuleOptions};

    pub(crate) fn group(id: i64, external_id: &str, role: Role, kind: GroupKind) -> Group {
        Group {
            id,
            external_id: external_id.into(),
            title: format!("group {external_id}"),
            role,
            kind,
            members_count: None,
        }
    }

    pub(crate) fn forward_rule(id: i64, name: &str, kind: TargetKind, post: Option<PostSpec>) -> ForwardRule {
        ForwardRule {
            id,
            name: name.into(),
            source_group_id: 10,
            target_kind: kind,
            target_group_id: 20,
            filters: FilterSpec::default(),
            post,
            options: RuleOptions::default(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Relay rule sourced from `source_id`, for tests across the pipeline.
    pub(crate) fn relay_rule(id: i64, name: &str, source_id: &str) -> ActiveRule {
        resolve(
            forward_rule(id, name, TargetKind::Relay, None),
            Some(group(10, source_id, Role::Source, GroupKind::Channel)),
            Some(group(20, "-1009", Role::Target, GroupKind::Group)),
        )
        .unwrap()
    }

    /// Post rule from `source_id` to the `newsdesk` social account.
    pub(crate) fn post_rule(id: i64, name: &str, source_id: &str, spec: PostSpec) -> ActiveRule {
        resolve(
            forward_rule(id, name, TargetKind::Post, Some(spec)),
            Some(group(10, source_id, Role::Source, GroupKind::Channel)),
            Some(group(20, "newsdesk", Role::Target, GroupKind::SocialAccount)),
        )
        .unwrap()
    }

    #[test]
    fn post_rule_without_spec_is_rejected() {
        let err = resolve(
            forward_rule(1, "x", TargetKind::Post, None),
            Some(group(10, "-100", Role::Source, GroupKind::Channel)),
            Some(group(20, "newsdesk", Role::Target, GroupKind::SocialAccount)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("without a post spec"));
    }

    #[test]
    fn relay_rule_with_spec_is_rejected() {
        let err = resolve(
            forward_rule(1, "x", TargetKind::Relay, Some(PostSpec::default())),
            Some(group(10, "-100", Role::Source, GroupKind::Channel)),
            Some(group(20, "-1009", Role::Target, GroupKind::Group)),
        );
        assert!(err.is_err());
    }

    #[test]
    fn dangling_group_is_rejected() {
        let err = resolve(
            forward_rule(1, "x", TargetKind::Relay, None),
            None,
            Some(group(20, "-1009", Role::Target, GroupKind::Group)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("source group 10 not found"));
    }

    #[test]
    fn post_rule_resolves_to_tagged_target() {
        let rule = resolve(
            forward_rule(1, "x", TargetKind::Post, Some(PostSpec::default())),
            Some(group(10, "-100", Role::Source, GroupKind::Channel)),
            Some(group(20, "newsdesk", Role::Target, GroupKind::SocialAccount)),
        )
        .unwrap();
        assert!(matches!(rule.target, RuleTarget::Post { ref account, .. } if account.external_id == "newsdesk"));
    }

    #[test]
    fn source_ids_are_distinct() {
        let rules = vec![
            Arc::new(relay_rule(1, "a", "-100")),
            Arc::new(relay_rule(2, "b", "-100")),
            Arc::new(relay_rule(3, "c", "-200")),
        ];
        let ids: Vec<String> = source_ids(&rules).into_iter().collect();
        assert_eq!(ids, vec!["-100".to_string(), "-200".to_string()]);
    }

    #[tokio::test]
    async fn load_snapshot_excludes_invalid_rules() {
        use crate::store::LibSqlStore;
        use crate::store::model::{NewGroup, NewRule};

        let store = LibSqlStore::new_memory().await.unwrap();
        let source = store
            .save_group(&NewGroup {
                external_id: "-100".into(),
                title: "Newsroom".into(),
                role: Role::Source,
                kind: GroupKind::Channel,
                members_count: None,
            })
            .await
            .unwrap();
        let social = store
            .save_group(&NewGroup {
                external_id: "newsdesk".into(),
                title: "@newsdesk".into(),
                role: Role::Target,
                kind: GroupKind::SocialAccount,
                members_count: None,
            })
            .await
            .unwrap();

        let base = NewRule {
            name: "good".into(),
            source_group_id: source.id,
            target_kind: TargetKind::Post,
            target_group_id: social.id,
            filters: FilterSpec::default(),
            post: Some(PostSpec::default()),
            options: RuleOptions::default(),
            enabled: true,
        };
        store.save_rule(&base).await.unwrap();
        store
            .save_rule(&NewRule {
                name: "missing-spec".into(),
                post: None,
                ..base.clone()
            })
            .await
            .unwrap();
        store
            .save_rule(&NewRule {
                name: "disabled".into(),
                enabled: false,
                ..base.clone()
            })
            .await
            .unwrap();

        let snapshot = load_snapshot(&store).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name(), "good");
    }
}
