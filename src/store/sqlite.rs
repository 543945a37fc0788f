use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{LogFilter, NewLogEntry, ProposalStore, ProposalUpdate, StoreTransaction};
use crate::error::StoreError;
use crate::workflow::types::{Proposal, ProposalState, WorkflowAction, WorkflowLogEntry};

const PROPOSAL_COLUMNS: &str = "id, code, title, state, owner_id, faculty_id, holder_unit, \
     holder_user, sla_start_date, sla_deadline, pre_pause_state, pre_pause_holder_unit, \
     pre_pause_holder_user, paused_at, created_at, updated_at";

const LOG_COLUMNS: &str = "id, proposal_id, action, from_state, to_state, actor_id, actor_name, \
     return_target_state, return_target_holder_unit, reason_code, comment, metadata, timestamp";

/// SQLite-backed store. Timestamps are fixed-width RFC 3339 text so they sort.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database and optionally runs migrations.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        auto_migrate: bool,
    ) -> Result<Self, StoreError> {
        if !Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        let store = Self { pool };

        if auto_migrate {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ProposalStore for SqliteStore {
    async fn find_proposal(&self, id: &str) -> Result<Option<Proposal>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_proposal(&mut conn, id).await
    }

    async fn find_latest_log_entry(
        &self,
        filter: &LogFilter,
    ) -> Result<Option<WorkflowLogEntry>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_latest_log(&mut conn, filter).await
    }

    async fn list_log_entries(&self, proposal_id: &str) -> Result<Vec<WorkflowLogEntry>, StoreError> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM workflow_logs WHERE proposal_id = ?1 \
             ORDER BY timestamp ASC, rowid ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(proposal_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn insert_proposal(&self, proposal: &Proposal) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO proposals ({PROPOSAL_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        );
        sqlx::query(&sql)
            .bind(&proposal.id)
            .bind(&proposal.code)
            .bind(&proposal.title)
            .bind(proposal.state.as_str())
            .bind(&proposal.owner_id)
            .bind(&proposal.faculty_id)
            .bind(&proposal.holder_unit)
            .bind(&proposal.holder_user)
            .bind(proposal.sla_start_date.map(format_ts))
            .bind(proposal.sla_deadline.map(format_ts))
            .bind(proposal.pre_pause_state.map(|s| s.as_str()))
            .bind(&proposal.pre_pause_holder_unit)
            .bind(&proposal.pre_pause_holder_user)
            .bind(proposal.paused_at.map(format_ts))
            .bind(format_ts(proposal.created_at))
            .bind(format_ts(proposal.updated_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn update_proposal(
        &mut self,
        id: &str,
        update: &ProposalUpdate,
    ) -> Result<Proposal, StoreError> {
        let mut proposal = fetch_proposal(&mut self.tx, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "Proposal",
                id: id.to_string(),
            })?;
        let stale = || StoreError::StaleState {
            proposal_id: id.to_string(),
            expected: update.expected_state,
        };
        if proposal.state != update.expected_state {
            return Err(stale());
        }

        update.apply_to(&mut proposal);
        let result = sqlx::query(
            r#"
            UPDATE proposals
            SET state = ?1, holder_unit = ?2, holder_user = ?3,
                sla_start_date = ?4, sla_deadline = ?5,
                pre_pause_state = ?6, pre_pause_holder_unit = ?7, pre_pause_holder_user = ?8,
                paused_at = ?9, updated_at = ?10
            WHERE id = ?11 AND state = ?12
            "#,
        )
        .bind(proposal.state.as_str())
        .bind(&proposal.holder_unit)
        .bind(&proposal.holder_user)
        .bind(proposal.sla_start_date.map(format_ts))
        .bind(proposal.sla_deadline.map(format_ts))
        .bind(proposal.pre_pause_state.map(|s| s.as_str()))
        .bind(&proposal.pre_pause_holder_unit)
        .bind(&proposal.pre_pause_holder_user)
        .bind(proposal.paused_at.map(format_ts))
        .bind(format_ts(proposal.updated_at))
        .bind(id)
        .bind(update.expected_state.as_str())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(stale());
        }
        Ok(proposal)
    }

    async fn create_log_entry(&mut self, entry: NewLogEntry) -> Result<WorkflowLogEntry, StoreError> {
        let entry = entry.into_entry(Uuid::new_v4().to_string());
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let sql = format!(
            "INSERT INTO workflow_logs ({LOG_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        );
        sqlx::query(&sql)
            .bind(&entry.id)
            .bind(&entry.proposal_id)
            .bind(entry.action.as_str())
            .bind(entry.from_state.as_str())
            .bind(entry.to_state.as_str())
            .bind(&entry.actor_id)
            .bind(&entry.actor_name)
            .bind(entry.return_target_state.map(|s| s.as_str()))
            .bind(&entry.return_target_holder_unit)
            .bind(&entry.reason_code)
            .bind(&entry.comment)
            .bind(metadata)
            .bind(format_ts(entry.timestamp))
            .execute(&mut *self.tx)
            .await?;
        Ok(entry)
    }

    async fn find_latest_log_entry(
        &mut self,
        filter: &LogFilter,
    ) -> Result<Option<WorkflowLogEntry>, StoreError> {
        fetch_latest_log(&mut self.tx, filter).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        debug!("Rolling back sqlite transaction");
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn fetch_proposal(conn: &mut SqliteConnection, id: &str) -> Result<Option<Proposal>, StoreError> {
    let sql = format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = ?1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(proposal_from_row).transpose()
}

async fn fetch_latest_log(
    conn: &mut SqliteConnection,
    filter: &LogFilter,
) -> Result<Option<WorkflowLogEntry>, StoreError> {
    let mut sql = format!("SELECT {LOG_COLUMNS} FROM workflow_logs WHERE proposal_id = ?");
    if filter.action.is_some() {
        sql.push_str(" AND action = ?");
    }
    if filter.to_state.is_some() {
        sql.push_str(" AND to_state = ?");
    }
    sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT 1");

    let mut query = sqlx::query(&sql).bind(&filter.proposal_id);
    if let Some(action) = filter.action {
        query = query.bind(action.as_str());
    }
    if let Some(state) = filter.to_state {
        query = query.bind(state.as_str());
    }
    let row = query.fetch_optional(&mut *conn).await?;
    row.as_ref().map(log_from_row).transpose()
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp {value:?}: {e}")))
}

fn parse_wire<T>(value: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StoreError::Backend(e.to_string()))
}

fn required_ts(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
    let value: String = row.try_get(column)?;
    parse_ts(&value)
}

fn optional_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    let value: Option<String> = row.try_get(column)?;
    value.as_deref().map(parse_ts).transpose()
}

fn optional_state(row: &SqliteRow, column: &str) -> Result<Option<ProposalState>, StoreError> {
    let value: Option<String> = row.try_get(column)?;
    value.as_deref().map(parse_wire).transpose()
}

fn proposal_from_row(row: &SqliteRow) -> Result<Proposal, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(Proposal {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        title: row.try_get("title")?,
        state: parse_wire(&state)?,
        owner_id: row.try_get("owner_id")?,
        faculty_id: row.try_get("faculty_id")?,
        holder_unit: row.try_get("holder_unit")?,
        holder_user: row.try_get("holder_user")?,
        sla_start_date: optional_ts(row, "sla_start_date")?,
        sla_deadline: optional_ts(row, "sla_deadline")?,
        pre_pause_state: optional_state(row, "pre_pause_state")?,
        pre_pause_holder_unit: row.try_get("pre_pause_holder_unit")?,
        pre_pause_holder_user: row.try_get("pre_pause_holder_user")?,
        paused_at: optional_ts(row, "paused_at")?,
        created_at: required_ts(row, "created_at")?,
        updated_at: required_ts(row, "updated_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<WorkflowLogEntry, StoreError> {
    let action: String = row.try_get("action")?;
    let from_state: String = row.try_get("from_state")?;
    let to_state: String = row.try_get("to_state")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata = metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| StoreError::Backend(format!("invalid log metadata: {e}")))?;

    Ok(WorkflowLogEntry {
        id: row.try_get("id")?,
        proposal_id: row.try_get("proposal_id")?,
        action: parse_wire::<WorkflowAction>(&action)?,
        from_state: parse_wire(&from_state)?,
        to_state: parse_wire(&to_state)?,
        actor_id: row.try_get("actor_id")?,
        actor_name: row.try_get("actor_name")?,
        return_target_state: optional_state(row, "return_target_state")?,
        return_target_holder_unit: row.try_get("return_target_holder_unit")?,
        reason_code: row.try_get("reason_code")?,
        comment: row.try_get("comment")?,
        metadata,
        timestamp: required_ts(row, "timestamp")?,
    })
}
