//! Explicit pass state, derived from persisted flags and the clock.
//!
//! The store keeps independent booleans; everything that decides what to do
//! with a pass goes through [`PassState`] instead of reading flags ad hoc,
//! and every write is checked by [`validate_flags`].

use crate::models::{Pass, PassFlags};
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    /// Window has not opened.
    Pending,
    /// Window open, activation not attempted yet.
    ActiveUnprovisioned,
    ActiveProvisioned,
    /// Terminal until an operator reactivates the pass.
    ActiveProvisionFailed,
    /// Teardown or purge claimed by a running task.
    Deprovisioning,
    /// Expired but teardown has no recorded outcome (never ran, or was
    /// interrupted). Resumed by the next tick.
    TeardownPending,
    /// Torn down and the retention window has elapsed.
    Deprovisioned,
    DeprovisionFailed,
    /// Torn down, retained messages kept until `retention_ts`.
    RetentionPending,
    CleanedUp,
}

impl PassState {
    pub fn of(pass: &Pass, now: DateTime<Utc>) -> Self {
        let f = &pass.flags;

        if f.purged {
            return PassState::CleanedUp;
        }
        if f.deactivating {
            return PassState::Deprovisioning;
        }
        if f.expired {
            return if f.deactivation_failed {
                PassState::DeprovisionFailed
            } else if f.deactivated {
                if pass.retention_elapsed(now) {
                    PassState::Deprovisioned
                } else {
                    PassState::RetentionPending
                }
            } else {
                PassState::TeardownPending
            };
        }
        if f.activated {
            PassState::ActiveProvisioned
        } else if f.activation_failed {
            PassState::ActiveProvisionFailed
        } else if now < pass.start_ts {
            PassState::Pending
        } else {
            PassState::ActiveUnprovisioned
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PassState::Pending => "pending",
            PassState::ActiveUnprovisioned => "active_unprovisioned",
            PassState::ActiveProvisioned => "active_provisioned",
            PassState::ActiveProvisionFailed => "active_provision_failed",
            PassState::Deprovisioning => "deprovisioning",
            PassState::TeardownPending => "teardown_pending",
            PassState::Deprovisioned => "deprovisioned",
            PassState::DeprovisionFailed => "deprovision_failed",
            PassState::RetentionPending => "retention_pending",
            PassState::CleanedUp => "cleaned_up",
        }
    }
}

impl std::fmt::Display for PassState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Pass {
    pub fn state(&self, now: DateTime<Utc>) -> PassState {
        PassState::of(self, now)
    }
}

/// Activation is due: window open, valid, never attempted.
pub fn activation_due(pass: &Pass, now: DateTime<Utc>) -> bool {
    pass.flags.valid && pass.state(now) == PassState::ActiveUnprovisioned
}

/// Time-based expiry is due: provisioned and past `end_ts`.
pub fn expiry_due(pass: &Pass, now: DateTime<Utc>) -> bool {
    now >= pass.end_ts && pass.state(now) == PassState::ActiveProvisioned
}

/// Teardown was started (expired=1 persisted) but never concluded.
pub fn teardown_resumable(pass: &Pass, now: DateTime<Utc>) -> bool {
    pass.state(now) == PassState::TeardownPending
}

/// Retention purge is due. Failed purges stay eligible for retry.
pub fn purge_due(pass: &Pass, now: DateTime<Utc>) -> bool {
    pass.retention_elapsed(now)
        && matches!(
            pass.state(now),
            PassState::Deprovisioned | PassState::DeprovisionFailed
        )
}

/// Reject flag combinations no transition can produce.
pub fn validate_flags(name: &str, flags: &PassFlags) -> Result<(), AppError> {
    let reject = |why: &str| Err(AppError::InvalidState(format!("pass '{}': {}", name, why)));

    if flags.activated && flags.activation_failed {
        return reject("activated and activation_failed are both set");
    }
    if flags.deactivated && flags.deactivation_failed {
        return reject("deactivated and deactivation_failed are both set");
    }
    if (flags.deactivated || flags.deactivation_failed) && !flags.expired {
        return reject("teardown outcome recorded on a pass that has not expired");
    }
    if flags.purged && !(flags.expired && flags.deactivated) {
        return reject("purged requires expired and deactivated");
    }
    if flags.purged && flags.deactivating {
        return reject("purged pass cannot be claimed for teardown");
    }
    Ok(())
}
