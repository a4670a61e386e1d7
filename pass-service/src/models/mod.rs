//! Domain models for pass-service.

pub mod broker;
pub mod descriptor;
pub mod log_entry;
pub mod pass;

pub use broker::{Broker, BrokerRecord};
pub use descriptor::{
    AccessType, ClientProfileSpec, HttpMethod, Ownership, PassObject, Permission, QueueSpec,
    RestConsumerSpec, RestDeliverySpec, parse_subscriptions,
};
pub use log_entry::{AuditAction, LogEntry, Severity};
pub use pass::{
    DeleteFlags, NameStatus, NewPass, Pass, PassFlags, ValidityUpdate, validate_window,
};
