//! Common test utilities for pass-service integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pass_service::lifecycle::{Clock, Orchestrator};
use pass_service::models::{
    AccessType, AuditAction, Broker, ClientProfileSpec, HttpMethod, Ownership, Pass, PassFlags,
    PassObject, Permission, QueueSpec, RestConsumerSpec, RestDeliverySpec, Severity,
};
use pass_service::services::{AuditLog, BrokerDirectory, PassStore, SempClient};
use serde_json::{json, Value};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,pass_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const BROKER: &str = "edge";
pub const VPN: &str = "default";
pub const QUEUE: &str = "q1";
pub const CONFIG_PREFIX: &str = "/SEMP/v2/config/msgVpns/default";

// -----------------------------------------------------------------------------
// Collaborators
// -----------------------------------------------------------------------------

/// Pass store backed by a map. Counts every mutating call.
#[derive(Default)]
pub struct InMemoryStore {
    passes: Mutex<HashMap<String, Pass>>,
    writes: AtomicUsize,
    fail_saves: AtomicBool,
}

impl InMemoryStore {
    pub fn insert(&self, pass: Pass) {
        self.passes.lock().unwrap().insert(pass.name.clone(), pass);
    }

    pub fn snapshot(&self, name: &str) -> Option<Pass> {
        self.passes.lock().unwrap().get(name).cloned()
    }

    pub fn flags(&self, name: &str) -> PassFlags {
        self.snapshot(name).expect("pass should exist").flags
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every following `save` fail as if the database were down.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Same rule as the conditional UPDATE of the Postgres store: the check
    /// and the write happen under one lock.
    fn claim(&self, name: &str, eligible: impl Fn(&Pass) -> bool) -> Option<Pass> {
        let mut passes = self.passes.lock().unwrap();
        let pass = passes.get_mut(name)?;
        if pass.flags.deactivating || pass.flags.purged || !eligible(pass) {
            return None;
        }
        pass.flags.deactivating = true;
        self.bump();
        Some(pass.clone())
    }
}

#[async_trait]
impl PassStore for InMemoryStore {
    async fn list_active(&self) -> Result<Vec<Pass>, AppError> {
        Ok(self
            .passes
            .lock()
            .unwrap()
            .values()
            .filter(|p| !p.flags.expired)
            .cloned()
            .collect())
    }

    async fn list_expired(&self) -> Result<Vec<Pass>, AppError> {
        Ok(self
            .passes
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.flags.expired)
            .cloned()
            .collect())
    }

    async fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<Pass>, AppError> {
        Ok(self
            .passes
            .lock()
            .unwrap()
            .values()
            .filter(|p| !p.flags.expired && p.start_ts > now)
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Option<Pass>, AppError> {
        Ok(self.snapshot(name))
    }

    async fn create(&self, pass: &Pass) -> Result<(), AppError> {
        let mut passes = self.passes.lock().unwrap();
        if passes.contains_key(&pass.name) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Pass '{}' already exists",
                pass.name
            )));
        }
        passes.insert(pass.name.clone(), pass.clone());
        self.bump();
        Ok(())
    }

    async fn save(&self, pass: &Pass) -> Result<(), AppError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "connection reset while saving '{}'",
                pass.name
            )));
        }
        let mut passes = self.passes.lock().unwrap();
        match passes.get_mut(&pass.name) {
            Some(slot) => {
                *slot = pass.clone();
                self.bump();
                Ok(())
            }
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Pass '{}' not found",
                pass.name
            ))),
        }
    }

    async fn claim_purge(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Pass>, AppError> {
        Ok(self.claim(name, |p| {
            p.flags.expired
                && (p.flags.deactivated || p.flags.deactivation_failed)
                && p.retention_ts <= now
        }))
    }

    async fn claim_teardown(&self, name: &str) -> Result<Option<Pass>, AppError> {
        Ok(self.claim(name, |_| true))
    }

    async fn release_claim(&self, name: &str) -> Result<(), AppError> {
        if let Some(pass) = self.passes.lock().unwrap().get_mut(name) {
            pass.flags.deactivating = false;
            self.bump();
        }
        Ok(())
    }

    async fn release_all_claims(&self) -> Result<Vec<String>, AppError> {
        let mut released = Vec::new();
        for pass in self.passes.lock().unwrap().values_mut() {
            if pass.flags.deactivating {
                pass.flags.deactivating = false;
                released.push(pass.name.clone());
            }
        }
        if !released.is_empty() {
            self.bump();
        }
        Ok(released)
    }

    async fn delete(&self, name: &str) -> Result<bool, AppError> {
        let removed = self.passes.lock().unwrap().remove(name).is_some();
        if removed {
            self.bump();
        }
        Ok(removed)
    }
}

#[derive(Default)]
pub struct InMemoryBrokers {
    brokers: Mutex<HashMap<String, Broker>>,
}

impl InMemoryBrokers {
    pub fn insert(&self, broker: Broker) {
        self.brokers.lock().unwrap().insert(broker.name.clone(), broker);
    }
}

#[async_trait]
impl BrokerDirectory for InMemoryBrokers {
    async fn resolve(&self, name: &str) -> Result<Option<Broker>, AppError> {
        Ok(self.brokers.lock().unwrap().get(name).cloned())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<(Severity, AuditAction, String)>>,
}

impl RecordingAudit {
    pub fn entries(&self) -> Vec<(Severity, AuditAction, String)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, severity: Severity, action: AuditAction) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, a, _)| *s == severity && *a == action)
            .count()
    }
}

#[async_trait]
impl AuditLog for RecordingAudit {
    async fn info(&self, message: &str, action: AuditAction) {
        self.entries
            .lock()
            .unwrap()
            .push((Severity::Info, action, message.to_string()));
    }

    async fn error(&self, message: &str, action: AuditAction) {
        self.entries
            .lock()
            .unwrap()
            .push((Severity::Error, action, message.to_string()));
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// -----------------------------------------------------------------------------
// Fixtures
// -----------------------------------------------------------------------------

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn broker_for(server: &MockServer) -> Broker {
    Broker::new(
        BROKER,
        &format!("{}/SEMP/v2/config", server.uri()),
        VPN,
        "admin",
        "secret",
    )
}

pub fn descriptor(queue_ownership: Ownership) -> PassObject {
    PassObject {
        broker: BROKER.to_string(),
        queue: QueueSpec {
            name: QUEUE.to_string(),
            ownership: queue_ownership,
            access_type: AccessType::Exclusive,
            respect_ttl: true,
            max_ttl: 3600,
            permission: Permission::Consume,
        },
        client_profile: None,
        subscriptions: vec!["orders/created".to_string(), "orders/updated".to_string()],
        rest_delivery: None,
    }
}

/// Descriptor that owns every resource kind.
pub fn full_descriptor() -> PassObject {
    let mut object = descriptor(Ownership::Owned);
    object.client_profile = Some(ClientProfileSpec {
        name: "cp1".to_string(),
        ownership: Ownership::Owned,
        settings: serde_json::Map::new(),
    });
    object.rest_delivery = Some(RestDeliverySpec {
        rdp_name: "rdp1".to_string(),
        client_profile: Some("cp1".to_string()),
        post_request_target: "/hooks/orders".to_string(),
        consumer: RestConsumerSpec {
            name: "consumer1".to_string(),
            remote_host: "hooks.example.com".to_string(),
            remote_port: 443,
            tls_enabled: true,
            http_method: HttpMethod::Post,
        },
    });
    object
}

/// A pass whose window is given as offsets (seconds) from `now`.
pub fn pass(
    name: &str,
    now: DateTime<Utc>,
    start: i64,
    end: i64,
    retention: i64,
    flags: PassFlags,
    pass_object: PassObject,
) -> Pass {
    Pass {
        pass_id: Uuid::new_v4(),
        name: name.to_string(),
        start_ts: now + Duration::seconds(start),
        end_ts: now + Duration::seconds(end),
        retention_ts: now + Duration::seconds(retention),
        pass_object,
        flags,
        errors: Vec::new(),
        created_on: now - Duration::hours(1),
    }
}

pub fn valid() -> PassFlags {
    PassFlags {
        valid: true,
        ..Default::default()
    }
}

/// Invariants that must hold for every persisted pass.
pub fn assert_flag_invariants(flags: &PassFlags) {
    assert!(
        !(flags.activated && flags.activation_failed),
        "activated and activation_failed both set: {:?}",
        flags
    );
    assert!(
        !(flags.deactivated && flags.deactivation_failed),
        "deactivated and deactivation_failed both set: {:?}",
        flags
    );
}

// -----------------------------------------------------------------------------
// Broker stand-in
// -----------------------------------------------------------------------------

pub fn ok_body() -> Value {
    json!({ "meta": { "responseCode": 200 }, "data": {} })
}

pub fn error_body(description: &str) -> Value {
    json!({
        "meta": {
            "responseCode": 400,
            "error": { "code": 89, "description": description, "status": "INVALID_PARAMETER" }
        }
    })
}

pub fn not_found_body(what: &str) -> Value {
    json!({
        "meta": {
            "responseCode": 400,
            "error": {
                "code": 6,
                "description": format!("Could not find match for {}", what),
                "status": "NOT_FOUND"
            }
        }
    })
}

pub fn ok() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(ok_body())
}

pub fn failure(description: &str) -> ResponseTemplate {
    ResponseTemplate::new(400).set_body_json(error_body(description))
}

/// Answer every request not matched by an earlier mock with success.
/// Mount after the specific mocks of a test.
pub async fn mount_catch_all_ok(server: &MockServer) {
    Mock::given(any()).respond_with(ok()).mount(server).await;
}

/// `(METHOD, path)` of every request the broker stand-in received, in order.
pub async fn calls(server: &MockServer) -> Vec<(String, String)> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|r| (r.method.to_string(), r.url.path().to_string()))
        .collect()
}

pub async fn count_calls(server: &MockServer, method: &str, path: &str) -> usize {
    calls(server)
        .await
        .into_iter()
        .filter(|(m, p)| m == method && p == path)
        .count()
}

pub fn config_path(suffix: &str) -> String {
    format!("{}/{}", CONFIG_PREFIX, suffix)
}

// -----------------------------------------------------------------------------
// Harness
// -----------------------------------------------------------------------------

pub struct Harness {
    pub server: MockServer,
    pub store: Arc<InMemoryStore>,
    pub brokers: Arc<InMemoryBrokers>,
    pub audit: Arc<RecordingAudit>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    /// Orchestrator wired to in-memory collaborators and a broker stand-in
    /// registered as [`BROKER`].
    pub async fn new() -> Self {
        init_tracing();

        let server = MockServer::start().await;
        let store = Arc::new(InMemoryStore::default());
        let brokers = Arc::new(InMemoryBrokers::default());
        brokers.insert(broker_for(&server));
        let audit = Arc::new(RecordingAudit::default());
        let clock = Arc::new(ManualClock::new(t0()));

        let semp = SempClient::new(std::time::Duration::from_secs(5))
            .expect("Failed to build broker client");
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            brokers.clone(),
            audit.clone(),
            semp,
            clock.clone(),
        ));

        Self {
            server,
            store,
            brokers,
            audit,
            clock,
            orchestrator,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get(&self, name: &str) -> Pass {
        self.store.snapshot(name).expect("pass should exist")
    }
}
