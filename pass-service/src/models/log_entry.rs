//! Audit log entries written by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Error => "error",
        }
    }
}

/// Action tag attached to every audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    Create,
    Activate,
    Subscribe,
    Unsubscribe,
    Expire,
    Deactivate,
    Purge,
    DeleteRestDelivery,
    DeleteQueue,
    DeleteClientProfile,
    DeleteQueueBinding,
    Delete,
    Reactivate,
    Validity,
    BrokerTest,
    Recover,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Activate => "activate",
            AuditAction::Subscribe => "subscribe",
            AuditAction::Unsubscribe => "unsubscribe",
            AuditAction::Expire => "expire",
            AuditAction::Deactivate => "deactivate",
            AuditAction::Purge => "purge",
            AuditAction::DeleteRestDelivery => "delete-rest-delivery",
            AuditAction::DeleteQueue => "delete-queue",
            AuditAction::DeleteClientProfile => "delete-client-profile",
            AuditAction::DeleteQueueBinding => "delete-queue-binding",
            AuditAction::Delete => "delete",
            AuditAction::Reactivate => "reactivate",
            AuditAction::Validity => "validity",
            AuditAction::BrokerTest => "broker-test",
            AuditAction::Recover => "recover",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: Uuid,
    pub severity: String,
    pub action: String,
    pub message: String,
    pub entry_ts: DateTime<Utc>,
}
