//! Pass model: a time-bound grant and its lifecycle flags.

use super::descriptor::PassObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle flags as persisted. The meaningful combinations are described by
/// [`crate::lifecycle::PassState`]; every write is validated against it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PassFlags {
    pub valid: bool,
    pub subscribed: bool,
    pub activated: bool,
    pub activation_failed: bool,
    pub expired: bool,
    /// Teardown or purge claimed by a running task.
    pub deactivating: bool,
    pub deactivated: bool,
    pub deactivation_failed: bool,
    /// Retained messages purged after the retention window.
    pub purged: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Pass {
    pub pass_id: Uuid,
    pub name: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub retention_ts: DateTime<Utc>,
    #[sqlx(json)]
    pub pass_object: PassObject,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub flags: PassFlags,
    #[sqlx(json)]
    pub errors: Vec<serde_json::Value>,
    pub created_on: DateTime<Utc>,
}

impl Pass {
    /// Build a fresh pass from a creation request. Only `valid` may be set.
    pub fn from_new(input: NewPass, now: DateTime<Utc>) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            name: input.name,
            start_ts: input.start_ts,
            end_ts: input.end_ts,
            retention_ts: input.retention_ts,
            pass_object: input.pass_object,
            flags: PassFlags {
                valid: input.valid,
                ..PassFlags::default()
            },
            errors: Vec::new(),
            created_on: now,
        }
    }

    pub fn retention_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.retention_ts
    }

    pub fn broker_name(&self) -> &str {
        &self.pass_object.broker
    }

    pub fn queue_name(&self) -> &str {
        &self.pass_object.queue.name
    }
}

/// Reject windows that do not satisfy `start < end <= retention`.
pub fn validate_window(
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
    retention_ts: DateTime<Utc>,
) -> Result<(), AppError> {
    if start_ts >= end_ts {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Pass start ({}) must be before its end ({})",
            start_ts,
            end_ts
        )));
    }
    if retention_ts < end_ts {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Pass retention ({}) must not be before its end ({})",
            retention_ts,
            end_ts
        )));
    }
    Ok(())
}

/// Input for creating a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPass {
    pub name: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub retention_ts: DateTime<Utc>,
    pub pass_object: PassObject,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl NewPass {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("Pass name is required")));
        }
        if self.pass_object.queue.name.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Pass '{}' names no queue",
                self.name
            )));
        }
        validate_window(self.start_ts, self.end_ts, self.retention_ts)
    }
}

/// Operator edit of the validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidityUpdate {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub retention_ts: DateTime<Utc>,
    pub valid: bool,
}

/// Which owned resources a forced expiry or deletion removes outright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFlags {
    #[serde(default, alias = "deleteRDP")]
    pub delete_rest_delivery: bool,
    #[serde(default, alias = "deleteQ")]
    pub delete_queue: bool,
    #[serde(default, alias = "deleteCP")]
    pub delete_client_profile: bool,
}

/// Result of a name availability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NameStatus {
    Available,
    /// A valid pass holds the name.
    InUse,
    /// An invalidated pass still holds the name; delete it to reuse.
    Retired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn window_must_be_ordered() {
        let now = Utc::now();
        assert!(validate_window(now, now + Duration::hours(1), now + Duration::hours(2)).is_ok());
        assert!(validate_window(now, now + Duration::hours(1), now + Duration::hours(1)).is_ok());
        assert!(validate_window(now, now, now + Duration::hours(1)).is_err());
        assert!(validate_window(now, now + Duration::hours(2), now + Duration::hours(1)).is_err());
    }

    #[test]
    fn delete_flags_accept_legacy_names() {
        let flags: DeleteFlags =
            serde_json::from_str(r#"{"deleteRDP": true, "deleteQ": false, "deleteCP": true}"#)
                .unwrap();
        assert!(flags.delete_rest_delivery);
        assert!(!flags.delete_queue);
        assert!(flags.delete_client_profile);
    }
}
