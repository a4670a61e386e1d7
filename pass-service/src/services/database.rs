//! Database service for pass-service.

use crate::lifecycle::state::validate_flags;
use crate::models::{AuditAction, Broker, BrokerRecord, LogEntry, Pass, Severity};
use crate::services::metrics::QueryTimer;
use crate::services::store::{AuditLog, BrokerDirectory, PassStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

macro_rules! select_passes {
    ($tail:literal) => {
        concat!(
            "SELECT pass_id, name, start_ts, end_ts, retention_ts, pass_object, ",
            "valid, subscribed, activated, activation_failed, expired, deactivating, ",
            "deactivated, deactivation_failed, purged, errors, created_on ",
            "FROM passes ",
            $tail
        )
    };
}

macro_rules! claim_pass {
    ($condition:literal) => {
        concat!(
            "UPDATE passes SET deactivating = TRUE WHERE name = $1 AND ",
            $condition,
            " RETURNING pass_id, name, start_ts, end_ts, retention_ts, pass_object, ",
            "valid, subscribed, activated, activation_failed, expired, deactivating, ",
            "deactivated, deactivation_failed, purged, errors, created_on"
        )
    };
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "pass-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Broker directory
    // -------------------------------------------------------------------------

    /// Register a broker connection. The directory is administered outside
    /// the lifecycle; this exists for provisioning scripts and tests.
    #[instrument(skip(self, password), fields(broker = %name))]
    pub async fn insert_broker(
        &self,
        name: &str,
        url: &str,
        vpn: &str,
        username: &str,
        password: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO brokers (name, url, vpn, username, password)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(name)
        .bind(url)
        .bind(vpn)
        .bind(username)
        .bind(password)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Broker '{}' already exists", name))
            }
            _ => db_error("Failed to insert broker", e),
        })?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Audit log maintenance
    // -------------------------------------------------------------------------

    /// Most recent audit entries first.
    #[instrument(skip(self))]
    pub async fn list_log_entries(&self, limit: i64) -> Result<Vec<LogEntry>, AppError> {
        let timer = QueryTimer::start("list_log_entries");
        let entries = sqlx::query_as::<_, LogEntry>(
            r#"
            SELECT entry_id, severity, action, message, entry_ts
            FROM log_entries
            ORDER BY entry_ts DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list log entries", e))?;
        timer.observe_duration();
        Ok(entries)
    }

    /// Delete audit entries older than `before`, or all of them.
    #[instrument(skip(self))]
    pub async fn purge_log_entries(
        &self,
        before: Option<DateTime<Utc>>,
    ) -> Result<u64, AppError> {
        let timer = QueryTimer::start("purge_log_entries");
        let result = match before {
            Some(ts) => {
                sqlx::query("DELETE FROM log_entries WHERE entry_ts < $1")
                    .bind(ts)
                    .execute(&self.pool)
                    .await
            }
            None => sqlx::query("DELETE FROM log_entries").execute(&self.pool).await,
        }
        .map_err(|e| db_error("Failed to purge log entries", e))?;
        timer.observe_duration();

        info!(removed = result.rows_affected(), "Audit log purged");
        Ok(result.rows_affected())
    }

    async fn append_log(&self, severity: Severity, action: AuditAction, message: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO log_entries (entry_id, severity, action, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(severity.as_str())
        .bind(action.as_str())
        .bind(message)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, action = %action, "Failed to write audit entry");
        }
    }
}

#[async_trait]
impl PassStore for Database {
    #[instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<Pass>, AppError> {
        let timer = QueryTimer::start("list_active");
        let passes = sqlx::query_as::<_, Pass>(select_passes!(
            "WHERE expired = FALSE ORDER BY start_ts"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list active passes", e))?;
        timer.observe_duration();
        Ok(passes)
    }

    #[instrument(skip(self))]
    async fn list_expired(&self) -> Result<Vec<Pass>, AppError> {
        let timer = QueryTimer::start("list_expired");
        let passes = sqlx::query_as::<_, Pass>(select_passes!(
            "WHERE expired = TRUE ORDER BY retention_ts"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list expired passes", e))?;
        timer.observe_duration();
        Ok(passes)
    }

    #[instrument(skip(self))]
    async fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<Pass>, AppError> {
        let timer = QueryTimer::start("list_pending");
        let passes = sqlx::query_as::<_, Pass>(select_passes!(
            "WHERE expired = FALSE AND start_ts > $1 ORDER BY start_ts"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list pending passes", e))?;
        timer.observe_duration();
        Ok(passes)
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<Option<Pass>, AppError> {
        let timer = QueryTimer::start("get_pass");
        let pass = sqlx::query_as::<_, Pass>(select_passes!("WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get pass", e))?;
        timer.observe_duration();
        Ok(pass)
    }

    #[instrument(skip(self, pass), fields(pass = %pass.name))]
    async fn create(&self, pass: &Pass) -> Result<(), AppError> {
        validate_flags(&pass.name, &pass.flags)?;
        let timer = QueryTimer::start("create_pass");

        sqlx::query(
            r#"
            INSERT INTO passes (
                pass_id, name, start_ts, end_ts, retention_ts, pass_object,
                valid, subscribed, activated, activation_failed, expired, deactivating,
                deactivated, deactivation_failed, purged, errors, created_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(pass.pass_id)
        .bind(&pass.name)
        .bind(pass.start_ts)
        .bind(pass.end_ts)
        .bind(pass.retention_ts)
        .bind(Json(&pass.pass_object))
        .bind(pass.flags.valid)
        .bind(pass.flags.subscribed)
        .bind(pass.flags.activated)
        .bind(pass.flags.activation_failed)
        .bind(pass.flags.expired)
        .bind(pass.flags.deactivating)
        .bind(pass.flags.deactivated)
        .bind(pass.flags.deactivation_failed)
        .bind(pass.flags.purged)
        .bind(Json(&pass.errors))
        .bind(pass.created_on)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Pass '{}' already exists", pass.name))
            }
            _ => db_error("Failed to create pass", e),
        })?;

        timer.observe_duration();
        info!(pass_id = %pass.pass_id, "Pass stored");
        Ok(())
    }

    #[instrument(skip(self, pass), fields(pass = %pass.name))]
    async fn save(&self, pass: &Pass) -> Result<(), AppError> {
        validate_flags(&pass.name, &pass.flags)?;
        let timer = QueryTimer::start("save_pass");

        let result = sqlx::query(
            r#"
            UPDATE passes SET
                start_ts = $2, end_ts = $3, retention_ts = $4, pass_object = $5,
                valid = $6, subscribed = $7, activated = $8, activation_failed = $9,
                expired = $10, deactivating = $11, deactivated = $12,
                deactivation_failed = $13, purged = $14, errors = $15
            WHERE name = $1
            "#,
        )
        .bind(&pass.name)
        .bind(pass.start_ts)
        .bind(pass.end_ts)
        .bind(pass.retention_ts)
        .bind(Json(&pass.pass_object))
        .bind(pass.flags.valid)
        .bind(pass.flags.subscribed)
        .bind(pass.flags.activated)
        .bind(pass.flags.activation_failed)
        .bind(pass.flags.expired)
        .bind(pass.flags.deactivating)
        .bind(pass.flags.deactivated)
        .bind(pass.flags.deactivation_failed)
        .bind(pass.flags.purged)
        .bind(Json(&pass.errors))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to save pass", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Pass '{}' not found",
                pass.name
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_purge(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Pass>, AppError> {
        let timer = QueryTimer::start("claim_purge");
        let pass = sqlx::query_as::<_, Pass>(claim_pass!(
            "deactivating = FALSE AND purged = FALSE AND expired = TRUE \
             AND (deactivated = TRUE OR deactivation_failed = TRUE) AND retention_ts <= $2"
        ))
        .bind(name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to claim pass for purge", e))?;
        timer.observe_duration();
        Ok(pass)
    }

    #[instrument(skip(self))]
    async fn claim_teardown(&self, name: &str) -> Result<Option<Pass>, AppError> {
        let timer = QueryTimer::start("claim_teardown");
        let pass = sqlx::query_as::<_, Pass>(claim_pass!(
            "deactivating = FALSE AND purged = FALSE"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to claim pass for teardown", e))?;
        timer.observe_duration();
        Ok(pass)
    }

    #[instrument(skip(self))]
    async fn release_claim(&self, name: &str) -> Result<(), AppError> {
        let timer = QueryTimer::start("release_claim");
        sqlx::query("UPDATE passes SET deactivating = FALSE WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to release pass claim", e))?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_all_claims(&self) -> Result<Vec<String>, AppError> {
        let timer = QueryTimer::start("release_all_claims");
        let names = sqlx::query_scalar::<_, String>(
            "UPDATE passes SET deactivating = FALSE WHERE deactivating = TRUE RETURNING name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to release pass claims", e))?;
        timer.observe_duration();
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> Result<bool, AppError> {
        let timer = QueryTimer::start("delete_pass");
        let result = sqlx::query("DELETE FROM passes WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete pass", e))?;
        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BrokerDirectory for Database {
    #[instrument(skip(self))]
    async fn resolve(&self, name: &str) -> Result<Option<Broker>, AppError> {
        let timer = QueryTimer::start("resolve_broker");
        let record = sqlx::query_as::<_, BrokerRecord>(
            r#"
            SELECT name, url, vpn, username, password, status, created_on, last_tested
            FROM brokers
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to resolve broker", e))?;
        timer.observe_duration();
        Ok(record.map(Broker::from))
    }
}

#[async_trait]
impl AuditLog for Database {
    async fn info(&self, message: &str, action: AuditAction) {
        self.append_log(Severity::Info, action, message).await;
    }

    async fn error(&self, message: &str, action: AuditAction) {
        self.append_log(Severity::Error, action, message).await;
    }
}
