//! Pass Service - time-bound broker access passes with scheduled provisioning,
//! expiry and retention cleanup.

pub mod config;
pub mod lifecycle;
pub mod models;
pub mod services;
pub mod startup;
