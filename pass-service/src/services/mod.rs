//! Services for pass-service.

pub mod database;
pub mod metrics;
pub mod semp;
pub mod store;

pub use database::Database;
pub use semp::{ProvisioningError, SempClient, SubscriptionReport};
pub use store::{AuditLog, BrokerDirectory, PassStore};
