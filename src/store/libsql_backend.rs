//! libSQL store — async `RuleStore` and `AttemptArchive` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    Account, AttemptStatus, FilterSpec, ForwardAttempt, ForwardRule, Group, NewGroup, NewRule,
    Platform, PostSpec, Role, RuleOptions,
};
use crate::store::traits::{AttemptArchive, AttemptQuery, RuleStore};

/// libSQL-backed store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(store.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(store.conn()).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Map every row, skipping malformed ones. An iteration error aborts.
async fn collect_rows<T>(
    op: &str,
    mut rows: libsql::Rows,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut items = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        match map(&row) {
            Ok(item) => items.push(item),
            Err(e) => warn!("{op}: skipping row: {e}"),
        }
    }
    Ok(items)
}

const RULE_COLUMNS: &str = "id, name, source_group_id, target_kind, target_group_id, filters, options, post_config, is_enabled, created_at, updated_at";

const GROUP_COLUMNS: &str = "id, external_id, title, role, kind, members_count";

const ACCOUNT_COLUMNS: &str = "id, identity, platform, role, credentials";

const ATTEMPT_COLUMNS: &str =
    "rule_id, rule_name, source, target, status, excerpt, error_message, created_at";

fn row_to_rule(row: &libsql::Row) -> Result<ForwardRule, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("rule row: {e}"));
    let filters: String = row.get(5).map_err(get)?;
    let options: String = row.get(6).map_err(get)?;
    let post_config: Option<String> = row.get(7).ok();
    let target_kind: String = row.get(3).map_err(get)?;
    let enabled: i64 = row.get(8).map_err(get)?;
    let created: String = row.get(9).map_err(get)?;
    let updated: String = row.get(10).map_err(get)?;

    let post = match post_config {
        Some(raw) => Some(
            serde_json::from_str::<PostSpec>(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("post_config: {e}")))?,
        ),
        None => None,
    };

    Ok(ForwardRule {
        id: row.get(0).map_err(get)?,
        name: row.get(1).map_err(get)?,
        source_group_id: row.get(2).map_err(get)?,
        target_kind: parse_enum(&target_kind)?,
        target_group_id: row.get(4).map_err(get)?,
        filters: serde_json::from_str::<FilterSpec>(&filters)
            .map_err(|e| DatabaseError::Serialization(format!("filters: {e}")))?,
        post,
        options: serde_json::from_str::<RuleOptions>(&options)
            .map_err(|e| DatabaseError::Serialization(format!("options: {e}")))?,
        enabled: enabled != 0,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_group(row: &libsql::Row) -> Result<Group, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("group row: {e}"));
    let role: String = row.get(3).map_err(get)?;
    let kind: String = row.get(4).map_err(get)?;
    Ok(Group {
        id: row.get(0).map_err(get)?,
        external_id: row.get(1).map_err(get)?,
        title: row.get(2).map_err(get)?,
        role: parse_enum(&role)?,
        kind: parse_enum(&kind)?,
        members_count: row.get::<i64>(5).ok(),
    })
}

fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("account row: {e}"));
    let platform: String = row.get(2).map_err(get)?;
    let role: String = row.get(3).map_err(get)?;
    let credentials: String = row.get(4).map_err(get)?;
    Ok(Account {
        id: row.get(0).map_err(get)?,
        identity: row.get(1).map_err(get)?,
        platform: parse_enum(&platform)?,
        role: parse_enum(&role)?,
        credentials: SecretString::from(credentials),
    })
}

fn row_to_attempt(row: &libsql::Row) -> Result<ForwardAttempt, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("attempt row: {e}"));
    let status: String = row.get(4).map_err(get)?;
    let created: String = row.get(7).map_err(get)?;
    Ok(ForwardAttempt {
        rule_id: row.get(0).map_err(get)?,
        rule_name: row.get(1).map_err(get)?,
        source: row.get(2).map_err(get)?,
        target: row.get(3).map_err(get)?,
        status: parse_enum::<AttemptStatus>(&status)?,
        excerpt: row.get(5).map_err(get)?,
        error: row.get::<String>(6).ok(),
        timestamp: parse_datetime(&created),
    })
}

impl LibSqlStore {
    async fn query_one<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self.conn().query(sql, params).await.map_err(query_err(op))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── RuleStore ───────────────────────────────────────────────────────

#[async_trait]
impl RuleStore for LibSqlStore {
    async fn list_rules(&self, enabled_only: bool) -> Result<Vec<ForwardRule>, DatabaseError> {
        let sql = if enabled_only {
            format!("SELECT {RULE_COLUMNS} FROM forward_rules WHERE is_enabled = 1 ORDER BY id")
        } else {
            format!("SELECT {RULE_COLUMNS} FROM forward_rules ORDER BY id")
        };
        let rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(query_err("list_rules"))?;

        collect_rows("list_rules", rows, row_to_rule).await
    }

    async fn get_rule(&self, id: i64) -> Result<Option<ForwardRule>, DatabaseError> {
        self.query_one(
            "get_rule",
            &format!("SELECT {RULE_COLUMNS} FROM forward_rules WHERE id = ?1"),
            params![id],
            row_to_rule,
        )
        .await
    }

    async fn get_rule_by_name(&self, name: &str) -> Result<Option<ForwardRule>, DatabaseError> {
        self.query_one(
            "get_rule_by_name",
            &format!("SELECT {RULE_COLUMNS} FROM forward_rules WHERE name = ?1"),
            params![name],
            row_to_rule,
        )
        .await
    }

    async fn save_rule(&self, rule: &NewRule) -> Result<ForwardRule, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let post_config = match &rule.post {
            Some(post) => Some(to_json(post)?),
            None => None,
        };
        self.conn()
            .execute(
                "INSERT INTO forward_rules (name, source_group_id, target_kind, target_group_id,
                    filters, options, post_config, is_enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(name) DO UPDATE SET
                    source_group_id = excluded.source_group_id,
                    target_kind = excluded.target_kind,
                    target_group_id = excluded.target_group_id,
                    filters = excluded.filters,
                    options = excluded.options,
                    post_config = excluded.post_config,
                    is_enabled = excluded.is_enabled,
                    updated_at = excluded.updated_at",
                params![
                    rule.name.as_str(),
                    rule.source_group_id,
                    rule.target_kind.as_str(),
                    rule.target_group_id,
                    to_json(&rule.filters)?,
                    to_json(&rule.options)?,
                    opt_text(post_config.as_deref()),
                    rule.enabled as i64,
                    now,
                ],
            )
            .await
            .map_err(query_err("save_rule"))?;

        debug!(rule = %rule.name, "Rule saved");
        self.get_rule_by_name(&rule.name)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "forward_rule".into(),
                id: rule.name.clone(),
            })
    }

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE forward_rules SET is_enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(query_err("set_rule_enabled"))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "forward_rule".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_rule(&self, id: i64) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM forward_rules WHERE id = ?1", params![id])
            .await
            .map_err(query_err("delete_rule"))?;
        Ok(deleted > 0)
    }

    async fn get_group(&self, id: i64) -> Result<Option<Group>, DatabaseError> {
        self.query_one(
            "get_group",
            &format!("SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?1"),
            params![id],
            row_to_group,
        )
        .await
    }

    async fn get_group_by_external_id(
        &self,
        external_id: &str,
        role: Role,
    ) -> Result<Option<Group>, DatabaseError> {
        self.query_one(
            "get_group_by_external_id",
            &format!("SELECT {GROUP_COLUMNS} FROM groups WHERE external_id = ?1 AND role = ?2"),
            params![external_id, role.as_str()],
            row_to_group,
        )
        .await
    }

    async fn save_group(&self, group: &NewGroup) -> Result<Group, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO groups (external_id, title, role, kind, members_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(external_id, role) DO UPDATE SET
                    title = excluded.title,
                    kind = excluded.kind,
                    members_count = COALESCE(excluded.members_count, groups.members_count),
                    updated_at = datetime('now')",
                params![
                    group.external_id.as_str(),
                    group.title.as_str(),
                    group.role.as_str(),
                    group.kind.as_str(),
                    opt_int(group.members_count),
                ],
            )
            .await
            .map_err(query_err("save_group"))?;

        self.get_group_by_external_id(&group.external_id, group.role)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "group".into(),
                id: group.external_id.clone(),
            })
    }

    async fn list_accounts(&self, role: Option<Role>) -> Result<Vec<Account>, DatabaseError> {
        let rows = match role {
            Some(role) => self
                .conn()
                .query(
                    &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE role = ?1 ORDER BY id"),
                    params![role.as_str()],
                )
                .await,
            None => self
                .conn()
                .query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"), ())
                .await,
        }
        .map_err(query_err("list_accounts"))?;

        collect_rows("list_accounts", rows, row_to_account).await
    }

    async fn save_account(
        &self,
        identity: &str,
        platform: Platform,
        role: Role,
        credentials: &str,
    ) -> Result<Account, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO accounts (identity, platform, role, credentials)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(identity) DO UPDATE SET
                    platform = excluded.platform,
                    role = excluded.role,
                    credentials = excluded.credentials,
                    updated_at = datetime('now')",
                params![identity, platform.as_str(), role.as_str(), credentials],
            )
            .await
            .map_err(query_err("save_account"))?;

        self.query_one(
            "save_account",
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE identity = ?1"),
            params![identity],
            row_to_account,
        )
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "account".into(),
            id: identity.to_string(),
        })
    }
}

// ── AttemptArchive ──────────────────────────────────────────────────

#[async_trait]
impl AttemptArchive for LibSqlStore {
    async fn archive(&self, attempt: &ForwardAttempt) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO forward_attempts (rule_id, rule_name, source, target, status,
                    excerpt, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    attempt.rule_id,
                    attempt.rule_name.as_str(),
                    attempt.source.as_str(),
                    attempt.target.as_str(),
                    attempt.status.as_str(),
                    attempt.excerpt.as_str(),
                    opt_text(attempt.error.as_deref()),
                    attempt.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("archive_attempt"))?;
        Ok(())
    }

    async fn list_attempts(
        &self,
        query: &AttemptQuery,
    ) -> Result<Vec<ForwardAttempt>, DatabaseError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(rule_id) = query.rule_id {
            values.push(libsql::Value::Integer(rule_id));
            conditions.push(format!("rule_id = ?{}", values.len()));
        }
        if let Some(since) = query.since {
            values.push(libsql::Value::Text(since.to_rfc3339()));
            conditions.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(until) = query.until {
            values.push(libsql::Value::Text(until.to_rfc3339()));
            conditions.push(format!("created_at <= ?{}", values.len()));
        }
        if query.failed_only {
            conditions.push("status = 'failed'".to_string());
        }

        let mut sql = format!("SELECT {ATTEMPT_COLUMNS} FROM forward_attempts");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = self
            .conn()
            .query(&sql, values)
            .await
            .map_err(query_err("list_attempts"))?;

        collect_rows("list_attempts", rows, row_to_attempt).await
    }
}
