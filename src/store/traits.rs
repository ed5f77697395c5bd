//! Storage traits consumed by the forward engine and the binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::model::{
    Account, ForwardAttempt, ForwardRule, Group, NewGroup, NewRule, Platform, Role,
};

/// Durable collection of forwarding rules and the groups/accounts they reference.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// List rules, optionally only the enabled ones, ordered by id.
    async fn list_rules(&self, enabled_only: bool) -> Result<Vec<ForwardRule>, DatabaseError>;

    async fn get_rule(&self, id: i64) -> Result<Option<ForwardRule>, DatabaseError>;

    async fn get_rule_by_name(&self, name: &str) -> Result<Option<ForwardRule>, DatabaseError>;

    /// Insert a rule, or replace the rule with the same name.
    async fn save_rule(&self, rule: &NewRule) -> Result<ForwardRule, DatabaseError>;

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<(), DatabaseError>;

    async fn delete_rule(&self, id: i64) -> Result<bool, DatabaseError>;

    async fn get_group(&self, id: i64) -> Result<Option<Group>, DatabaseError>;

    async fn get_group_by_external_id(
        &self,
        external_id: &str,
        role: Role,
    ) -> Result<Option<Group>, DatabaseError>;

    /// Insert a group, or return the existing one with the same external id and role.
    async fn save_group(&self, group: &NewGroup) -> Result<Group, DatabaseError>;

    async fn list_accounts(&self, role: Option<Role>) -> Result<Vec<Account>, DatabaseError>;

    /// Insert an account, or update credentials/role for an existing identity.
    async fn save_account(
        &self,
        identity: &str,
        platform: Platform,
        role: Role,
        credentials: &str,
    ) -> Result<Account, DatabaseError>;
}

/// Query for archived attempts.
#[derive(Debug, Clone, Default)]
pub struct AttemptQuery {
    pub rule_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub failed_only: bool,
    pub limit: Option<usize>,
}

/// Durable archive of dispatch attempts, newest first on read.
#[async_trait]
pub trait AttemptArchive: Send + Sync {
    async fn archive(&self, attempt: &ForwardAttempt) -> Result<(), DatabaseError>;

    async fn list_attempts(&self, query: &AttemptQuery)
    -> Result<Vec<ForwardAttempt>, DatabaseError>;
}
