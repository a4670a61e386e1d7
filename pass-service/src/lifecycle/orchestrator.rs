//! Pass lifecycle transitions and operator actions.
//!
//! Automatic transitions (activate, time-based expiry, retention purge) are
//! driven by the scheduler; they record failures in flags and the audit log
//! and never return provisioning errors. Operator actions return failures
//! to the caller as `AppError::BadGateway`.

use crate::lifecycle::clock::Clock;
use crate::lifecycle::state::{
    activation_due, expiry_due, purge_due, teardown_resumable, validate_flags, PassState,
};
use crate::models::{
    AuditAction, Broker, DeleteFlags, NameStatus, NewPass, Ownership, Pass, ValidityUpdate,
    validate_window,
};
use crate::services::metrics::record_transition;
use crate::services::semp::{ProvisioningError, SempClient};
use crate::services::store::{AuditLog, BrokerDirectory, PassStore};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;

/// Outcome of a best-effort teardown performed by [`Orchestrator::delete_pass`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub completed: Vec<String>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: String, result: Result<(), String>) {
        match result {
            Ok(()) => self.completed.push(step),
            Err(why) => self.failures.push(format!("{}: {}", step, why)),
        }
    }
}

/// Broker resource created while staging a new pass, in creation order.
#[derive(Debug, Clone)]
enum Staged {
    ClientProfile(String),
    Queue(String),
    RestDeliveryPoint(String),
    QueueBinding { rdp: String, queue: String },
    RestConsumer { rdp: String, name: String },
}

pub struct Orchestrator {
    store: Arc<dyn PassStore>,
    brokers: Arc<dyn BrokerDirectory>,
    audit: Arc<dyn AuditLog>,
    semp: SempClient,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn PassStore>,
        brokers: Arc<dyn BrokerDirectory>,
        audit: Arc<dyn AuditLog>,
        semp: SempClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            brokers,
            audit,
            semp,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn active_passes(&self) -> Result<Vec<Pass>, AppError> {
        self.store.list_active().await
    }

    pub async fn expired_passes(&self) -> Result<Vec<Pass>, AppError> {
        self.store.list_expired().await
    }

    pub async fn pending_passes(&self) -> Result<Vec<Pass>, AppError> {
        self.store.list_pending(self.clock.now()).await
    }

    /// Clear `deactivating` claims left behind by a process that stopped
    /// mid-transition, so the next tick can pick those passes up again. Must
    /// run before any transition is in flight.
    pub async fn release_interrupted_claims(&self) -> Result<usize, AppError> {
        let released = self.store.release_all_claims().await?;
        for name in &released {
            self.audit_info(
                AuditAction::Recover,
                format!("Pass '{}' interrupted teardown claim released", name),
            )
            .await;
        }
        Ok(released.len())
    }

    pub async fn get_pass(&self, name: &str) -> Result<Pass, AppError> {
        self.store
            .get(name)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Pass '{}' not found", name)))
    }

    // -------------------------------------------------------------------------
    // Automatic transitions
    // -------------------------------------------------------------------------

    /// Evaluate a pass from the active set: activate if due, then expire if
    /// the (possibly just activated) pass is past its end.
    #[instrument(skip(self, pass), fields(pass = %pass.name))]
    pub async fn evaluate_active(&self, pass: Pass) -> Result<(), AppError> {
        let now = self.clock.now();
        let mut pass = pass;

        if activation_due(&pass, now) {
            pass = self.activate(pass).await?;
        }
        if expiry_due(&pass, now) {
            self.expire_by_time(pass).await?;
        }
        Ok(())
    }

    /// Evaluate a pass from the expired set: resume an interrupted teardown,
    /// then purge retained messages once retention has elapsed.
    #[instrument(skip(self, pass), fields(pass = %pass.name))]
    pub async fn evaluate_expired(&self, pass: Pass) -> Result<(), AppError> {
        let now = self.clock.now();
        let mut pass = pass;

        if teardown_resumable(&pass, now) {
            tracing::info!(pass = %pass.name, "Resuming interrupted teardown");
            pass = self.teardown(pass).await?;
        }
        if purge_due(&pass, now) {
            self.purge_retained(&pass.name).await?;
        }
        Ok(())
    }

    async fn activate(&self, mut pass: Pass) -> Result<Pass, AppError> {
        let outcome = match self.resolve_broker(pass.broker_name()).await? {
            Some(broker) => match self
                .semp
                .activate_queue(
                    &broker,
                    &pass.pass_object.queue,
                    &pass.pass_object.subscriptions,
                )
                .await
            {
                Ok(report) => Ok(report),
                Err(e) => {
                    self.audit_subscription_failures(&pass, &e, AuditAction::Subscribe)
                        .await;
                    Err(e.to_string())
                }
            },
            None => Err(format!("broker '{}' not found", pass.broker_name())),
        };

        match outcome {
            Ok(report) => {
                pass.flags.activated = true;
                pass.flags.activation_failed = false;
                pass.flags.subscribed = true;
                self.persist(&pass).await?;
                self.audit_info(
                    AuditAction::Activate,
                    format!(
                        "Pass '{}' activated queue '{}' ({})",
                        pass.name,
                        pass.queue_name(),
                        report.summary()
                    ),
                )
                .await;
                record_transition("activate", "ok");
            }
            Err(why) => {
                pass.flags.activated = false;
                pass.flags.activation_failed = true;
                pass.flags.subscribed = false;
                self.persist(&pass).await?;
                self.audit_error(
                    AuditAction::Activate,
                    format!(
                        "Pass '{}' failed to activate queue '{}': {}",
                        pass.name,
                        pass.queue_name(),
                        why
                    ),
                )
                .await;
                record_transition("activate", "failed");
            }
        }
        Ok(pass)
    }

    async fn expire_by_time(&self, mut pass: Pass) -> Result<Pass, AppError> {
        // Persisted before any broker call so a restart resumes the teardown.
        pass.flags.expired = true;
        self.persist(&pass).await?;
        self.audit_info(
            AuditAction::Expire,
            format!("Pass '{}' reached its end, deactivating", pass.name),
        )
        .await;

        self.teardown(pass).await
    }

    /// Disable traffic on the pass queue and remove its subscriptions.
    async fn teardown(&self, mut pass: Pass) -> Result<Pass, AppError> {
        let outcome = match self.resolve_broker(pass.broker_name()).await? {
            Some(broker) => match self
                .semp
                .deactivate_queue(&broker, pass.queue_name(), &pass.pass_object.subscriptions)
                .await
            {
                Ok(report) => Ok(report),
                Err(e) => {
                    self.audit_subscription_failures(&pass, &e, AuditAction::Unsubscribe)
                        .await;
                    Err(e.to_string())
                }
            },
            None => Err(format!("broker '{}' not found", pass.broker_name())),
        };

        match outcome {
            Ok(_) => {
                pass.flags.deactivated = true;
                pass.flags.deactivation_failed = false;
                pass.flags.subscribed = false;
                self.persist(&pass).await?;
                self.audit_info(
                    AuditAction::Deactivate,
                    format!("Pass '{}' deactivated queue '{}'", pass.name, pass.queue_name()),
                )
                .await;
                record_transition("expire", "ok");
            }
            Err(why) => {
                pass.flags.deactivated = false;
                pass.flags.deactivation_failed = true;
                self.persist(&pass).await?;
                self.audit_error(
                    AuditAction::Deactivate,
                    format!(
                        "Pass '{}' failed to deactivate queue '{}': {}",
                        pass.name,
                        pass.queue_name(),
                        why
                    ),
                )
                .await;
                record_transition("expire", "failed");
            }
        }
        Ok(pass)
    }

    /// Claim the pass and purge its retained messages. A pass already claimed
    /// by another task is left alone.
    async fn purge_retained(&self, name: &str) -> Result<(), AppError> {
        let Some(mut pass) = self.store.claim_purge(name, self.clock.now()).await? else {
            tracing::debug!(pass = %name, "Purge already claimed or no longer due, skipping");
            return Ok(());
        };

        let outcome = match self.resolve_broker(pass.broker_name()).await {
            Ok(Some(broker)) => self
                .semp
                .purge_messages(&broker, pass.queue_name())
                .await
                .map_err(|e| e.to_string()),
            Ok(None) => Err(format!("broker '{}' not found", pass.broker_name())),
            Err(e) => Err(e.to_string()),
        };
        let purged = outcome.is_ok();

        pass.flags.deactivating = false;
        pass.flags.activated = false;
        pass.flags.activation_failed = false;
        pass.flags.subscribed = false;
        pass.flags.valid = true;
        pass.flags.purged = purged;
        pass.flags.deactivated = purged;
        pass.flags.deactivation_failed = !purged;
        self.persist_claimed(&pass).await?;

        match outcome {
            Ok(()) => {
                self.audit_info(
                    AuditAction::Purge,
                    format!(
                        "Pass '{}' retention elapsed, purged queue '{}'",
                        pass.name,
                        pass.queue_name()
                    ),
                )
                .await;
                record_transition("purge", "ok");
            }
            Err(why) => {
                self.audit_error(
                    AuditAction::Purge,
                    format!(
                        "Pass '{}' failed to purge queue '{}': {}",
                        pass.name,
                        pass.queue_name(),
                        why
                    ),
                )
                .await;
                record_transition("purge", "failed");
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Operator actions
    // -------------------------------------------------------------------------

    /// Create a pass, staging the broker resources it owns. Any failure rolls
    /// back what this call created and persists nothing.
    #[instrument(skip(self, input), fields(pass = %input.name))]
    pub async fn create_pass(&self, input: NewPass) -> Result<Pass, AppError> {
        input.validate()?;

        if self.store.get(&input.name).await?.is_some() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Pass '{}' already exists",
                input.name
            )));
        }

        let broker = self.require_broker(&input.pass_object.broker).await?;
        let pass = Pass::from_new(input, self.clock.now());
        validate_flags(&pass.name, &pass.flags)?;

        let mut staged = Vec::new();
        if let Err(e) = self.stage_resources(&broker, &pass, &mut staged).await {
            self.roll_back(&broker, staged).await;
            let why = format!("Pass '{}' could not be created: {}", pass.name, e);
            self.audit_error(AuditAction::Create, why.clone()).await;
            record_transition("create", "failed");
            return Err(AppError::BadGateway(why));
        }

        if let Err(e) = self.store.create(&pass).await {
            self.roll_back(&broker, staged).await;
            record_transition("create", "failed");
            return Err(e);
        }

        self.audit_info(
            AuditAction::Create,
            format!(
                "Pass '{}' created for queue '{}' on broker '{}'",
                pass.name,
                pass.queue_name(),
                broker.name
            ),
        )
        .await;
        record_transition("create", "ok");
        Ok(pass)
    }

    async fn stage_resources(
        &self,
        broker: &Broker,
        pass: &Pass,
        staged: &mut Vec<Staged>,
    ) -> Result<(), ProvisioningError> {
        let object = &pass.pass_object;

        if let Some(profile) = object.owned_client_profile() {
            self.semp.create_client_profile(broker, profile).await?;
            staged.push(Staged::ClientProfile(profile.name.clone()));
        }

        match object.queue.ownership {
            Ownership::Owned => {
                self.semp.create_queue(broker, &object.queue).await?;
                staged.push(Staged::Queue(object.queue.name.clone()));
            }
            Ownership::Referenced => {}
        }

        if let Some(rdp) = &object.rest_delivery {
            self.semp.create_rest_delivery_point(broker, rdp).await?;
            staged.push(Staged::RestDeliveryPoint(rdp.rdp_name.clone()));

            self.semp
                .create_queue_binding(
                    broker,
                    &rdp.rdp_name,
                    &object.queue.name,
                    &rdp.post_request_target,
                )
                .await?;
            staged.push(Staged::QueueBinding {
                rdp: rdp.rdp_name.clone(),
                queue: object.queue.name.clone(),
            });

            self.semp
                .create_rest_consumer(broker, &rdp.rdp_name, &rdp.consumer)
                .await?;
            staged.push(Staged::RestConsumer {
                rdp: rdp.rdp_name.clone(),
                name: rdp.consumer.name.clone(),
            });
        }
        Ok(())
    }

    async fn roll_back(&self, broker: &Broker, staged: Vec<Staged>) {
        for resource in staged.into_iter().rev() {
            let result = match &resource {
                Staged::ClientProfile(name) => self.semp.delete_client_profile(broker, name).await,
                Staged::Queue(name) => self.semp.delete_queue(broker, name).await,
                Staged::RestDeliveryPoint(name) => {
                    self.semp.delete_rest_delivery_point(broker, name).await
                }
                Staged::QueueBinding { rdp, queue } => {
                    self.semp.delete_queue_binding(broker, rdp, queue).await
                }
                Staged::RestConsumer { rdp, name } => {
                    self.semp.delete_rest_consumer(broker, rdp, name).await
                }
            };
            if let Err(e) = result {
                tracing::warn!(resource = ?resource, error = %e, "Rollback step failed");
            }
        }
    }

    pub async fn check_name(&self, name: &str) -> Result<NameStatus, AppError> {
        Ok(match self.store.get(name).await? {
            None => NameStatus::Available,
            Some(pass) if pass.flags.valid => NameStatus::InUse,
            Some(_) => NameStatus::Retired,
        })
    }

    /// Tear a pass down now, deleting the selected owned resources in the
    /// order RDP, queue, client profile. Deletes stop at the first failure;
    /// the pass is marked expired either way.
    #[instrument(skip(self), fields(pass = %name))]
    pub async fn force_expire(&self, name: &str, flags: DeleteFlags) -> Result<Pass, AppError> {
        let current = self.get_pass(name).await?;
        if current.state(self.clock.now()) == PassState::CleanedUp {
            return Err(AppError::InvalidState(format!(
                "pass '{}' has already been cleaned up",
                name
            )));
        }

        let Some(mut pass) = self.store.claim_teardown(name).await? else {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Pass '{}' is already being torn down",
                name
            )));
        };

        let failures = match self.resolve_broker(pass.broker_name()).await {
            Ok(Some(broker)) => self.forced_teardown(&broker, &pass, flags).await,
            Ok(None) => vec![format!("broker '{}' not found", pass.broker_name())],
            Err(e) => vec![e.to_string()],
        };
        let failed = !failures.is_empty();

        pass.flags.deactivating = false;
        pass.flags.expired = true;
        pass.flags.deactivated = !failed;
        pass.flags.deactivation_failed = failed;
        pass.flags.subscribed = false;
        self.persist_claimed(&pass).await?;

        if failed {
            let why = format!("Pass '{}' forced expiry failed: {}", pass.name, failures.join("; "));
            self.audit_error(AuditAction::Expire, why.clone()).await;
            record_transition("force_expire", "failed");
            return Err(AppError::BadGateway(why));
        }

        self.audit_info(
            AuditAction::Expire,
            format!("Pass '{}' expired by operator", pass.name),
        )
        .await;
        record_transition("force_expire", "ok");
        Ok(pass)
    }

    async fn forced_teardown(&self, broker: &Broker, pass: &Pass, flags: DeleteFlags) -> Vec<String> {
        let object = &pass.pass_object;
        let mut failures = Vec::new();
        let mut queue_deleted = false;

        let rdp_step = match (&object.rest_delivery, flags.delete_rest_delivery) {
            (Some(rdp), true) => Some(
                self.semp
                    .delete_rest_delivery_point(broker, &rdp.rdp_name)
                    .await
                    .map_err(|e| format!("delete REST delivery point '{}': {}", rdp.rdp_name, e)),
            ),
            _ => None,
        };
        if let Some(Err(why)) = rdp_step {
            failures.push(why);
        }

        if failures.is_empty() && flags.delete_queue {
            match object.queue.ownership {
                Ownership::Owned => match self.semp.delete_queue(broker, &object.queue.name).await {
                    Ok(()) => queue_deleted = true,
                    Err(e) => failures.push(format!("delete queue '{}': {}", object.queue.name, e)),
                },
                Ownership::Referenced => tracing::info!(
                    pass = %pass.name,
                    queue = %object.queue.name,
                    "Queue is referenced, detaching only"
                ),
            }
        }

        if failures.is_empty() && flags.delete_client_profile {
            if let Some(profile) = object.owned_client_profile() {
                if let Err(e) = self.semp.delete_client_profile(broker, &profile.name).await {
                    failures.push(format!("delete client profile '{}': {}", profile.name, e));
                }
            }
        }

        if !queue_deleted {
            if let Err(e) = self
                .semp
                .deactivate_queue(broker, &object.queue.name, &object.subscriptions)
                .await
            {
                self.audit_subscription_failures(pass, &e, AuditAction::Unsubscribe)
                    .await;
                failures.push(format!("deactivate queue '{}': {}", object.queue.name, e));
            }
        }

        failures
    }

    /// Best-effort teardown of the selected owned resources, then removal of
    /// the pass record. Teardown failures are reported but do not block the
    /// removal.
    #[instrument(skip(self), fields(pass = %name))]
    pub async fn delete_pass(
        &self,
        name: &str,
        flags: DeleteFlags,
    ) -> Result<TeardownReport, AppError> {
        let pass = self.get_pass(name).await?;
        let object = &pass.pass_object;
        let mut report = TeardownReport::default();

        match self.resolve_broker(pass.broker_name()).await? {
            None => report.failures.push(format!("broker '{}' not found", pass.broker_name())),
            Some(broker) => {
                if let Some(rdp) = &object.rest_delivery {
                    if flags.delete_rest_delivery {
                        let result = self
                            .semp
                            .delete_rest_delivery_point(&broker, &rdp.rdp_name)
                            .await
                            .map_err(|e| e.to_string());
                        report.record(format!("delete REST delivery point '{}'", rdp.rdp_name), result);
                    } else {
                        let result = self
                            .semp
                            .delete_queue_binding(&broker, &rdp.rdp_name, &object.queue.name)
                            .await
                            .map_err(|e| e.to_string());
                        report.record(
                            format!("remove queue binding '{}' from '{}'", object.queue.name, rdp.rdp_name),
                            result,
                        );
                    }
                }

                let delete_queue = flags.delete_queue && object.queue.ownership.is_owned();
                if delete_queue {
                    let result = self
                        .semp
                        .delete_queue(&broker, &object.queue.name)
                        .await
                        .map_err(|e| e.to_string());
                    report.record(format!("delete queue '{}'", object.queue.name), result);
                } else if !object.subscriptions.is_empty() {
                    let subs = self
                        .semp
                        .remove_subscriptions(&broker, &object.queue.name, &object.subscriptions)
                        .await;
                    for topic in &subs.applied {
                        report.completed.push(format!("remove subscription '{}'", topic));
                    }
                    for (topic, why) in &subs.failed {
                        report
                            .failures
                            .push(format!("remove subscription '{}': {}", topic, why));
                    }
                }

                if flags.delete_client_profile {
                    if let Some(profile) = object.owned_client_profile() {
                        let result = self
                            .semp
                            .delete_client_profile(&broker, &profile.name)
                            .await
                            .map_err(|e| e.to_string());
                        report.record(format!("delete client profile '{}'", profile.name), result);
                    }
                }
            }
        }

        for failure in &report.failures {
            self.audit_error(
                AuditAction::Delete,
                format!("Pass '{}' teardown step failed: {}", pass.name, failure),
            )
            .await;
        }

        self.store.delete(name).await?;
        self.audit_info(AuditAction::Delete, format!("Pass '{}' deleted", pass.name))
            .await;
        record_transition("delete", if report.is_clean() { "ok" } else { "failed" });
        Ok(report)
    }

    /// Edit the validity window; lifecycle flags are untouched.
    #[instrument(skip(self, update), fields(pass = %name))]
    pub async fn update_validity(&self, name: &str, update: ValidityUpdate) -> Result<Pass, AppError> {
        validate_window(update.start_ts, update.end_ts, update.retention_ts)?;

        let mut pass = self.get_pass(name).await?;
        pass.start_ts = update.start_ts;
        pass.end_ts = update.end_ts;
        pass.retention_ts = update.retention_ts;
        pass.flags.valid = update.valid;
        self.persist(&pass).await?;

        self.audit_info(
            AuditAction::Validity,
            format!(
                "Pass '{}' window set to {} - {} (retention {}), valid={}",
                pass.name, pass.start_ts, pass.end_ts, pass.retention_ts, pass.flags.valid
            ),
        )
        .await;
        Ok(pass)
    }

    /// Reset every lifecycle flag so the next tick evaluates activation again.
    #[instrument(skip(self), fields(pass = %name))]
    pub async fn reactivate(&self, name: &str) -> Result<Pass, AppError> {
        let mut pass = self.get_pass(name).await?;
        if pass.flags.deactivating {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Pass '{}' is being torn down",
                name
            )));
        }

        let previous = pass.state(self.clock.now());
        pass.flags = crate::models::PassFlags {
            valid: true,
            ..Default::default()
        };
        self.persist(&pass).await?;

        self.audit_info(
            AuditAction::Reactivate,
            format!("Pass '{}' reactivated (was {})", pass.name, previous),
        )
        .await;
        Ok(pass)
    }

    /// Check that a broker's management API accepts its credentials.
    #[instrument(skip(self))]
    pub async fn test_broker(&self, name: &str) -> Result<(), AppError> {
        let broker = self.require_broker(name).await?;
        match self.semp.test_connection(&broker).await {
            Ok(()) => {
                self.audit_info(
                    AuditAction::BrokerTest,
                    format!("Broker '{}' reachable", name),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                let why = format!("Broker '{}' test failed: {}", name, e);
                self.audit_error(AuditAction::BrokerTest, why.clone()).await;
                Err(AppError::BadGateway(why))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn resolve_broker(&self, name: &str) -> Result<Option<Broker>, AppError> {
        self.brokers.resolve(name).await
    }

    async fn require_broker(&self, name: &str) -> Result<Broker, AppError> {
        self.resolve_broker(name)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Broker '{}' not found", name)))
    }

    async fn persist(&self, pass: &Pass) -> Result<(), AppError> {
        validate_flags(&pass.name, &pass.flags)?;
        self.store.save(pass).await
    }

    /// Persist the outcome of a claimed transition. If that write fails the
    /// claim is released so the pass does not stay `deactivating` forever.
    async fn persist_claimed(&self, pass: &Pass) -> Result<(), AppError> {
        let Err(e) = self.persist(pass).await else {
            return Ok(());
        };
        tracing::error!(pass = %pass.name, error = %e, "Failed to record outcome, releasing claim");
        if let Err(release) = self.store.release_claim(&pass.name).await {
            tracing::error!(pass = %pass.name, error = %release, "Failed to release claim");
        }
        Err(e)
    }

    /// One audit row per failed topic of a subscription batch.
    async fn audit_subscription_failures(
        &self,
        pass: &Pass,
        err: &ProvisioningError,
        action: AuditAction,
    ) {
        if let ProvisioningError::Subscriptions(report) = err {
            for (topic, why) in &report.failed {
                self.audit_error(
                    action,
                    format!(
                        "Pass '{}': subscription '{}' on queue '{}' failed: {}",
                        pass.name,
                        topic,
                        pass.queue_name(),
                        why
                    ),
                )
                .await;
            }
        }
    }

    async fn audit_info(&self, action: AuditAction, message: String) {
        tracing::info!(action = %action, "{}", message);
        self.audit.info(&message, action).await;
    }

    async fn audit_error(&self, action: AuditAction, message: String) {
        tracing::error!(action = %action, "{}", message);
        self.audit.error(&message, action).await;
    }
}
