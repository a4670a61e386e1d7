//! Collaborator interfaces used by the lifecycle orchestrator.
//!
//! `Database` implements all three against Postgres; tests substitute
//! in-memory versions.

use crate::models::{AuditAction, Broker, Pass};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

/// Persisted passes and their lifecycle flags.
#[async_trait]
pub trait PassStore: Send + Sync {
    /// Every pass that has not expired (pending and in-progress).
    async fn list_active(&self) -> Result<Vec<Pass>, AppError>;

    /// Every expired pass.
    async fn list_expired(&self) -> Result<Vec<Pass>, AppError>;

    /// Passes whose window has not opened yet.
    async fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<Pass>, AppError>;

    async fn get(&self, name: &str) -> Result<Option<Pass>, AppError>;

    /// Insert a new pass. `AppError::Conflict` if the name is taken.
    async fn create(&self, pass: &Pass) -> Result<(), AppError>;

    /// Overwrite window, validity and flags. `AppError::NotFound` if the
    /// pass no longer exists.
    async fn save(&self, pass: &Pass) -> Result<(), AppError>;

    /// Atomically set `deactivating` on a pass that is due for retention
    /// purge as of `now`: expired, torn down (successfully or not), not
    /// purged, unclaimed and past `retention_ts`. Returns the claimed pass, or
    /// `None` if it is held by someone else, no longer due, or gone.
    async fn claim_purge(&self, name: &str, now: DateTime<Utc>)
    -> Result<Option<Pass>, AppError>;

    /// Atomically set `deactivating` when it is clear and the pass has not
    /// been purged.
    async fn claim_teardown(&self, name: &str) -> Result<Option<Pass>, AppError>;

    /// Clear `deactivating` on one pass, leaving every other flag alone.
    async fn release_claim(&self, name: &str) -> Result<(), AppError>;

    /// Clear every `deactivating` claim. Only safe while no transition can be
    /// running, i.e. before the scheduler's first tick. Returns the names of
    /// the released passes.
    async fn release_all_claims(&self) -> Result<Vec<String>, AppError>;

    /// Remove the pass. Returns whether a row was deleted.
    async fn delete(&self, name: &str) -> Result<bool, AppError>;
}

/// Read-only broker lookup.
#[async_trait]
pub trait BrokerDirectory: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<Broker>, AppError>;
}

/// Append-only operator audit trail. Writes never fail the caller.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn info(&self, message: &str, action: AuditAction);
    async fn error(&self, message: &str, action: AuditAction);
}
