//! SQLite implementation of [`TmkStore`], [`AuditStore`] and [`JobStore`].
//!
//! Timestamps are stored as RFC 3339 text with fixed microsecond precision so
//! lexical order matches chronological order.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::{AuditStore, JobStore, NewTmk, Rotation, TmkRecord, TmkStore};
use crate::audit::KeyAuditEntry;
use crate::error::{KeyError, KeyResult};
use crate::rewrap::{ArtifactFailure, JobStatus, RewrapJob};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tenant_master_keys (
        id            TEXT PRIMARY KEY,
        tenant_id     TEXT NOT NULL,
        encrypted_key BLOB NOT NULL,
        kms_key_id    TEXT NOT NULL,
        key_version   INTEGER NOT NULL,
        is_active     INTEGER NOT NULL,
        created_at    TEXT NOT NULL,
        rotated_at    TEXT,
        created_by    TEXT NOT NULL,
        UNIQUE (tenant_id, key_version)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_tmk_one_active
        ON tenant_master_keys (tenant_id) WHERE is_active = 1
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS key_audit_log (
        id          TEXT PRIMARY KEY,
        tenant_id   TEXT NOT NULL,
        user_id     TEXT,
        key_type    TEXT NOT NULL,
        key_id      TEXT NOT NULL,
        operation   TEXT NOT NULL,
        success     INTEGER NOT NULL,
        error       TEXT,
        details     TEXT,
        duration_ms INTEGER NOT NULL,
        created_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_key_audit_tenant_time
        ON key_audit_log (tenant_id, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rewrap_jobs (
        id             TEXT PRIMARY KEY,
        tenant_id      TEXT NOT NULL,
        source_version INTEGER NOT NULL,
        target_version INTEGER NOT NULL,
        status         TEXT NOT NULL,
        started_at     TEXT NOT NULL,
        completed_at   TEXT,
        total          INTEGER NOT NULL,
        processed      INTEGER NOT NULL,
        succeeded      INTEGER NOT NULL,
        failed         INTEGER NOT NULL,
        skipped        INTEGER NOT NULL,
        cursor         TEXT,
        job_error      TEXT,
        errors         TEXT NOT NULL
    )
    "#,
];

const TMK_COLUMNS: &str = "id, tenant_id, encrypted_key, kms_key_id, key_version, is_active, \
                           created_at, rotated_at, created_by";

/// One pool serving TMK rows, the audit log and job snapshots.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` in WAL mode.
    #[tracing::instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> KeyResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(KeyError::storage("parse database url"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(KeyError::storage("connect"))?;

        debug!("database pool created");
        Ok(Self { pool })
    }

    /// A private in-memory database. One connection, never recycled, so
    /// every query sees the same database.
    pub async fn in_memory() -> KeyResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(KeyError::storage("parse database url"))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(KeyError::storage("connect"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> KeyResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(KeyError::storage("migrate"))?;
        }
        info!("database schema ready");
        Ok(())
    }

    pub async fn ping(&self) -> KeyResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(KeyError::storage("ping"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> KeyResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KeyError::Malformed(format!("timestamp {s:?}: {e}")))
}

fn parse_optional_timestamp(s: Option<String>) -> KeyResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_timestamp).transpose()
}

fn parse_uuid(s: &str) -> KeyResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| KeyError::Malformed(format!("uuid {s:?}: {e}")))
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> KeyResult<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(KeyError::storage("decode row"))
}

fn count_col(row: &SqliteRow, name: &str) -> KeyResult<u64> {
    let value: i64 = col(row, name)?;
    u64::try_from(value).map_err(|_| KeyError::Malformed(format!("negative {name}: {value}")))
}

fn version_col(row: &SqliteRow, name: &str) -> KeyResult<u32> {
    let value: i64 = col(row, name)?;
    u32::try_from(value).map_err(|_| KeyError::Malformed(format!("{name} out of range: {value}")))
}

fn count_param(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn tmk_from_row(row: &SqliteRow) -> KeyResult<TmkRecord> {
    let id: String = col(row, "id")?;
    let created_at: String = col(row, "created_at")?;
    Ok(TmkRecord {
        id: parse_uuid(&id)?,
        tenant_id: col(row, "tenant_id")?,
        encrypted_key: col(row, "encrypted_key")?,
        kms_key_id: col(row, "kms_key_id")?,
        key_version: version_col(row, "key_version")?,
        is_active: col(row, "is_active")?,
        created_at: parse_timestamp(&created_at)?,
        rotated_at: parse_optional_timestamp(col(row, "rotated_at")?)?,
        created_by: col(row, "created_by")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> KeyResult<KeyAuditEntry> {
    let id: String = col(row, "id")?;
    let key_type: String = col(row, "key_type")?;
    let operation: String = col(row, "operation")?;
    let created_at: String = col(row, "created_at")?;
    Ok(KeyAuditEntry {
        id: parse_uuid(&id)?,
        tenant_id: col(row, "tenant_id")?,
        user_id: col(row, "user_id")?,
        key_type: key_type.parse().map_err(KeyError::Malformed)?,
        key_id: col(row, "key_id")?,
        operation: operation.parse().map_err(KeyError::Malformed)?,
        success: col(row, "success")?,
        error: col(row, "error")?,
        details: col(row, "details")?,
        duration_ms: count_col(row, "duration_ms")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn job_from_row(row: &SqliteRow) -> KeyResult<RewrapJob> {
    let id: String = col(row, "id")?;
    let status: String = col(row, "status")?;
    let started_at: String = col(row, "started_at")?;
    let errors: String = col(row, "errors")?;
    let errors: Vec<ArtifactFailure> = serde_json::from_str(&errors)
        .map_err(|e| KeyError::Malformed(format!("job errors: {e}")))?;
    Ok(RewrapJob {
        id: parse_uuid(&id)?,
        tenant_id: col(row, "tenant_id")?,
        source_version: version_col(row, "source_version")?,
        target_version: version_col(row, "target_version")?,
        status: status.parse().map_err(KeyError::Malformed)?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: parse_optional_timestamp(col(row, "completed_at")?)?,
        total: count_col(row, "total")?,
        processed: count_col(row, "processed")?,
        succeeded: count_col(row, "succeeded")?,
        failed: count_col(row, "failed")?,
        skipped: count_col(row, "skipped")?,
        cursor: col(row, "cursor")?,
        job_error: col(row, "job_error")?,
        errors,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// TmkStore
// ---------------------------------------------------------------------------

async fn insert_tmk<'e, E>(executor: E, tmk: &NewTmk, version: u32) -> Result<TmkRecord, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let record = TmkRecord {
        id: Uuid::new_v4(),
        tenant_id: tmk.tenant_id.clone(),
        encrypted_key: tmk.encrypted_key.clone(),
        kms_key_id: tmk.kms_key_id.clone(),
        key_version: version,
        is_active: true,
        created_at: Utc::now(),
        rotated_at: None,
        created_by: tmk.created_by.clone(),
    };
    sqlx::query(
        "INSERT INTO tenant_master_keys \
         (id, tenant_id, encrypted_key, kms_key_id, key_version, is_active, created_at, rotated_at, created_by) \
         VALUES (?, ?, ?, ?, ?, 1, ?, NULL, ?)",
    )
    .bind(record.id.to_string())
    .bind(&record.tenant_id)
    .bind(&record.encrypted_key)
    .bind(&record.kms_key_id)
    .bind(i64::from(record.key_version))
    .bind(timestamp(&record.created_at))
    .bind(&record.created_by)
    .execute(executor)
    .await?;
    Ok(record)
}

#[async_trait]
impl TmkStore for SqliteStore {
    #[tracing::instrument(skip(self, tmk), fields(tenant = %tmk.tenant_id))]
    async fn insert_first(&self, tmk: NewTmk) -> KeyResult<TmkRecord> {
        let mut tx = self.pool.begin().await.map_err(KeyError::storage("begin"))?;

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tenant_master_keys WHERE tenant_id = ?")
                .bind(&tmk.tenant_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(KeyError::storage("count tmk versions"))?;
        if existing > 0 {
            return Err(KeyError::TmkAlreadyExists(tmk.tenant_id));
        }

        let record = match insert_tmk(&mut *tx, &tmk, 1).await {
            Ok(record) => record,
            Err(e) if is_unique_violation(&e) => {
                return Err(KeyError::TmkAlreadyExists(tmk.tenant_id))
            }
            Err(e) => return Err(KeyError::storage("insert tmk")(e)),
        };

        tx.commit().await.map_err(KeyError::storage("commit"))?;
        Ok(record)
    }

    #[tracing::instrument(skip(self, tmk), fields(tenant = %tmk.tenant_id))]
    async fn rotate(&self, tmk: NewTmk) -> KeyResult<Rotation> {
        let mut tx = self.pool.begin().await.map_err(KeyError::storage("begin"))?;

        let row = sqlx::query(&format!(
            "SELECT {TMK_COLUMNS} FROM tenant_master_keys WHERE tenant_id = ? AND is_active = 1"
        ))
        .bind(&tmk.tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(KeyError::storage("load active tmk"))?;
        let Some(row) = row else {
            return Err(KeyError::NoActiveTmk(tmk.tenant_id));
        };
        let mut previous = tmk_from_row(&row)?;

        let rotated_at = Utc::now();
        sqlx::query("UPDATE tenant_master_keys SET is_active = 0, rotated_at = ? WHERE id = ?")
            .bind(timestamp(&rotated_at))
            .bind(previous.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(KeyError::storage("deactivate tmk"))?;
        previous.is_active = false;
        previous.rotated_at = Some(rotated_at);

        let current = insert_tmk(&mut *tx, &tmk, previous.key_version + 1)
            .await
            .map_err(KeyError::storage("insert rotated tmk"))?;

        tx.commit().await.map_err(KeyError::storage("commit"))?;
        Ok(Rotation { previous, current })
    }

    async fn active(&self, tenant_id: &str) -> KeyResult<Option<TmkRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TMK_COLUMNS} FROM tenant_master_keys WHERE tenant_id = ? AND is_active = 1"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(KeyError::storage("load active tmk"))?;
        row.as_ref().map(tmk_from_row).transpose()
    }

    async fn version(&self, tenant_id: &str, version: u32) -> KeyResult<Option<TmkRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TMK_COLUMNS} FROM tenant_master_keys WHERE tenant_id = ? AND key_version = ?"
        ))
        .bind(tenant_id)
        .bind(i64::from(version))
        .fetch_optional(&self.pool)
        .await
        .map_err(KeyError::storage("load tmk version"))?;
        row.as_ref().map(tmk_from_row).transpose()
    }

    async fn versions(&self, tenant_id: &str) -> KeyResult<Vec<TmkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TMK_COLUMNS} FROM tenant_master_keys WHERE tenant_id = ? ORDER BY key_version"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(KeyError::storage("list tmk versions"))?;
        rows.iter().map(tmk_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditStore for SqliteStore {
    async fn append(&self, entry: &KeyAuditEntry) -> KeyResult<()> {
        sqlx::query(
            "INSERT INTO key_audit_log \
             (id, tenant_id, user_id, key_type, key_id, operation, success, error, details, duration_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.tenant_id)
        .bind(&entry.user_id)
        .bind(entry.key_type.as_str())
        .bind(&entry.key_id)
        .bind(entry.operation.as_str())
        .bind(entry.success)
        .bind(&entry.error)
        .bind(&entry.details)
        .bind(count_param(entry.duration_ms))
        .bind(timestamp(&entry.created_at))
        .execute(&self.pool)
        .await
        .map_err(KeyError::storage("append audit entry"))?;
        Ok(())
    }

    async fn recent(&self, tenant_id: &str, limit: u32) -> KeyResult<Vec<KeyAuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, user_id, key_type, key_id, operation, success, error, details, \
             duration_ms, created_at FROM key_audit_log WHERE tenant_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(tenant_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(KeyError::storage("query audit log"))?;
        rows.iter().map(audit_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

#[async_trait]
impl JobStore for SqliteStore {
    async fn save_job(&self, job: &RewrapJob) -> KeyResult<()> {
        let errors = serde_json::to_string(&job.errors)
            .map_err(|e| KeyError::Malformed(format!("job errors: {e}")))?;
        sqlx::query(
            "INSERT OR REPLACE INTO rewrap_jobs \
             (id, tenant_id, source_version, target_version, status, started_at, completed_at, \
              total, processed, succeeded, failed, skipped, cursor, job_error, errors) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.tenant_id)
        .bind(i64::from(job.source_version))
        .bind(i64::from(job.target_version))
        .bind(job.status.as_str())
        .bind(timestamp(&job.started_at))
        .bind(job.completed_at.as_ref().map(timestamp))
        .bind(count_param(job.total))
        .bind(count_param(job.processed))
        .bind(count_param(job.succeeded))
        .bind(count_param(job.failed))
        .bind(count_param(job.skipped))
        .bind(&job.cursor)
        .bind(&job.job_error)
        .bind(errors)
        .execute(&self.pool)
        .await
        .map_err(KeyError::storage("save rewrap job"))?;
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> KeyResult<Option<RewrapJob>> {
        let row = sqlx::query("SELECT * FROM rewrap_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(KeyError::storage("load rewrap job"))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn running_jobs(&self) -> KeyResult<Vec<RewrapJob>> {
        let rows = sqlx::query("SELECT * FROM rewrap_jobs WHERE status = ? ORDER BY started_at")
            .bind(JobStatus::Running.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(KeyError::storage("list running jobs"))?;
        rows.iter().map(job_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::KeyOperation;
    use crate::crypto::KeyType;

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn new_tmk(tenant: &str, blob: u8) -> NewTmk {
        NewTmk {
            tenant_id: tenant.into(),
            encrypted_key: vec![blob; 60],
            kms_key_id: "alias/root".into(),
            created_by: "alice".into(),
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = store().await;
        store.migrate().await.unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn insert_first_creates_version_one() {
        let store = store().await;
        let record = store.insert_first(new_tmk("acme", 1)).await.unwrap();
        assert_eq!(record.key_version, 1);
        assert!(record.is_active);

        let active = store.active("acme").await.unwrap().unwrap();
        assert_eq!(active, record);
        assert_eq!(active.label(), "tmk-acme-v1");
    }

    #[tokio::test]
    async fn second_insert_is_rejected() {
        let store = store().await;
        store.insert_first(new_tmk("acme", 1)).await.unwrap();
        let err = store.insert_first(new_tmk("acme", 2)).await.unwrap_err();
        assert!(matches!(err, KeyError::TmkAlreadyExists(t) if t == "acme"));
    }

    #[tokio::test]
    async fn rotate_keeps_exactly_one_active_version() {
        let store = store().await;
        store.insert_first(new_tmk("acme", 1)).await.unwrap();
        let r1 = store.rotate(new_tmk("acme", 2)).await.unwrap();
        let r2 = store.rotate(new_tmk("acme", 3)).await.unwrap();

        assert_eq!(r1.previous.key_version, 1);
        assert_eq!(r1.current.key_version, 2);
        assert!(r1.previous.rotated_at.is_some());
        assert_eq!(r2.current.key_version, 3);

        let versions = store.versions("acme").await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.key_version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(versions.iter().filter(|v| v.is_active).count(), 1);
        assert!(versions[2].is_active);
        assert!(versions[0].rotated_at.is_some());
        assert!(versions[2].rotated_at.is_none());

        let old = store.version("acme", 1).await.unwrap().unwrap();
        assert_eq!(old.encrypted_key, vec![1; 60]);
    }

    #[tokio::test]
    async fn rotate_without_active_fails() {
        let store = store().await;
        let err = store.rotate(new_tmk("ghost", 1)).await.unwrap_err();
        assert!(matches!(err, KeyError::NoActiveTmk(t) if t == "ghost"));
        assert!(store.versions("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = store().await;
        store.insert_first(new_tmk("acme", 1)).await.unwrap();
        store.insert_first(new_tmk("globex", 2)).await.unwrap();
        store.rotate(new_tmk("acme", 3)).await.unwrap();

        assert_eq!(store.active("acme").await.unwrap().unwrap().key_version, 2);
        assert_eq!(store.active("globex").await.unwrap().unwrap().key_version, 1);
        assert!(store.version("globex", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audit_entries_come_back_newest_first() {
        let store = store().await;
        let first = KeyAuditEntry::new("acme", KeyType::Tmk, "tmk-acme-v1", KeyOperation::Generate)
            .by("alice");
        let mut second =
            KeyAuditEntry::new("acme", KeyType::Tmk, "tmk-acme-v1", KeyOperation::Access)
                .failed("kms unavailable");
        second.created_at = first.created_at + chrono::Duration::milliseconds(5);
        let other = KeyAuditEntry::new("globex", KeyType::Tmk, "tmk-globex-v1", KeyOperation::Generate);

        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();
        store.append(&other).await.unwrap();

        let rows = store.recent("acme", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, second.id);
        assert!(!rows[0].success);
        assert_eq!(rows[0].error.as_deref(), Some("kms unavailable"));
        assert_eq!(rows[1].user_id.as_deref(), Some("alice"));

        assert_eq!(store.recent("acme", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn job_snapshots_round_trip() {
        let store = store().await;
        let mut job = RewrapJob::new("acme", 1, 2);
        job.total = 3;
        job.record_success("a1", 1);
        job.record_failure(
            ArtifactFailure {
                artifact_id: "a2".into(),
                error: "authentication failed".into(),
                retryable: false,
            },
            10,
        );
        store.save_job(&job).await.unwrap();

        let loaded = store.load_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.succeeded, 1);
        assert_eq!(loaded.errors, job.errors);
        assert_eq!(loaded.cursor.as_deref(), Some("a2"));
        assert_eq!(store.running_jobs().await.unwrap().len(), 1);

        job.finish();
        store.save_job(&job).await.unwrap();
        assert!(store.running_jobs().await.unwrap().is_empty());
        assert_eq!(
            store.load_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let store = store().await;
        assert!(store.load_job(Uuid::new_v4()).await.unwrap().is_none());
    }
}
