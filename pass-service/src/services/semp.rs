//! Broker management API client.
//!
//! One request builder per resource kind. Every call either succeeds or
//! returns a [`ProvisioningError`] describing what the broker (or the
//! network) said. Nothing is retried here: the scheduler's next tick is the
//! retry mechanism. Deletes treat "resource not found" as success so that a
//! half-finished teardown can always be run again.

use crate::models::{Broker, ClientProfileSpec, QueueSpec, RestConsumerSpec, RestDeliverySpec};
use crate::services::metrics::{BROKER_REQUESTS_TOTAL, BROKER_REQUEST_DURATION};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::instrument;

/// Description prefix the broker uses when a named object does not exist.
const NOT_FOUND_PREFIX: &str = "Could not find match for";

#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The broker answered with an error envelope.
    #[error("{description}")]
    RemoteApi { description: String },

    /// The broker reported that the target object does not exist.
    #[error("{description}")]
    NotFound { description: String },

    /// The broker could not be reached or the exchange broke off.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Something answered, but not with a management API envelope.
    #[error("unexpected response (HTTP {status}): {body}")]
    UnexpectedResponse { status: u16, body: String },

    /// Queue configuration applied, but some subscriptions did not.
    #[error("{}", .0.summary())]
    Subscriptions(SubscriptionReport),
}

impl ProvisioningError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisioningError::NotFound { .. })
    }

    /// Metric label for the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisioningError::RemoteApi { .. } => "remote_api",
            ProvisioningError::NotFound { .. } => "not_found",
            ProvisioningError::Transport(_) => "transport",
            ProvisioningError::UnexpectedResponse { .. } => "unexpected_response",
            ProvisioningError::Subscriptions(_) => "subscriptions",
        }
    }
}

pub type ProvisioningResult<T = ()> = Result<T, ProvisioningError>;

/// Per-topic outcome of a subscription batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionReport {
    pub applied: Vec<String>,
    /// `(topic, failure description)`
    pub failed: Vec<(String, String)>,
}

impl SubscriptionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.failed.is_empty() {
            return format!("{} subscription(s) applied", self.applied.len());
        }
        let topics: Vec<&str> = self.failed.iter().map(|(t, _)| t.as_str()).collect();
        format!(
            "{} of {} subscription(s) failed: {}",
            self.failed.len(),
            self.failed.len() + self.applied.len(),
            topics.join(", ")
        )
    }

    fn into_result(self) -> ProvisioningResult<SubscriptionReport> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProvisioningError::Subscriptions(self))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SempResponse {
    meta: SempMeta,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SempMeta {
    #[serde(default)]
    error: Option<SempErrorBody>,
}

#[derive(Debug, Deserialize)]
struct SempErrorBody {
    description: String,
    #[serde(default)]
    status: Option<String>,
}

impl SempErrorBody {
    fn into_error(self) -> ProvisioningError {
        let not_found = self.status.as_deref() == Some("NOT_FOUND")
            || self.description.starts_with(NOT_FOUND_PREFIX);
        if not_found {
            ProvisioningError::NotFound {
                description: self.description,
            }
        } else {
            ProvisioningError::RemoteApi {
                description: self.description,
            }
        }
    }
}

/// Interpret a management API body. `meta.error` means failure whatever the
/// HTTP status said.
fn parse_envelope(status: u16, body: &str) -> ProvisioningResult<Option<Value>> {
    let envelope: SempResponse =
        serde_json::from_str(body).map_err(|_| ProvisioningError::UnexpectedResponse {
            status,
            body: body.chars().take(512).collect(),
        })?;

    match envelope.meta.error {
        Some(error) => Err(error.into_error()),
        None => Ok(envelope.data),
    }
}

/// Fold "not found" into success for delete-style calls.
fn ignore_missing(result: ProvisioningResult<Option<Value>>) -> ProvisioningResult {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            tracing::debug!(reason = %e, "Target already absent, treating as deleted");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Action API base derived from the configuration API base
/// (`.../SEMP/v2/config` becomes `.../SEMP/v2/action`).
pub fn action_base_url(config_url: &str) -> String {
    let trimmed = config_url.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((head, _)) => format!("{}/action", head),
        None => format!("{}/action", trimmed),
    }
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueActivation<'a> {
    msg_vpn_name: &'a str,
    queue_name: &'a str,
    access_type: &'a str,
    egress_enabled: bool,
    ingress_enabled: bool,
    respect_ttl_enabled: bool,
    max_ttl: u64,
    permission: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueDeactivation<'a> {
    msg_vpn_name: &'a str,
    queue_name: &'a str,
    egress_enabled: bool,
    ingress_enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionBody<'a> {
    msg_vpn_name: &'a str,
    queue_name: &'a str,
    subscription_topic: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RestDeliveryPointBody<'a> {
    msg_vpn_name: &'a str,
    rest_delivery_point_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_profile_name: Option<&'a str>,
    enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueBindingBody<'a> {
    msg_vpn_name: &'a str,
    rest_delivery_point_name: &'a str,
    queue_binding_name: &'a str,
    post_request_target: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RestConsumerBody<'a> {
    msg_vpn_name: &'a str,
    rest_delivery_point_name: &'a str,
    rest_consumer_name: &'a str,
    remote_host: &'a str,
    remote_port: u16,
    tls_enabled: bool,
    http_method: &'a str,
    enabled: bool,
}

/// Stateless client for the broker management API.
#[derive(Clone)]
pub struct SempClient {
    client: Client,
}

impl SempClient {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }

    fn config_url(&self, broker: &Broker, path: &str) -> String {
        format!("{}/msgVpns/{}/{}", broker.url, enc(&broker.vpn), path)
    }

    fn request(&self, broker: &Broker, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("accept", "application/json")
            .basic_auth(&broker.username, Some(broker.password()))
    }

    async fn send(
        &self,
        broker: &Broker,
        operation: &'static str,
        method: Method,
        url: String,
    ) -> ProvisioningResult<Option<Value>> {
        let request = self.request(broker, method.clone(), &url);
        self.execute(operation, method, url, request).await
    }

    /// Like [`SempClient::send`] with a JSON body. A body that fails to
    /// serialize surfaces as a request error before anything is sent.
    async fn send_json<B: Serialize + ?Sized>(
        &self,
        broker: &Broker,
        operation: &'static str,
        method: Method,
        url: String,
        body: &B,
    ) -> ProvisioningResult<Option<Value>> {
        let request = self.request(broker, method.clone(), &url).json(body);
        self.execute(operation, method, url, request).await
    }

    async fn execute(
        &self,
        operation: &'static str,
        method: Method,
        url: String,
        request: RequestBuilder,
    ) -> ProvisioningResult<Option<Value>> {
        let start = Instant::now();

        let result = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(text) => parse_envelope(status, &text),
                    Err(e) => Err(ProvisioningError::Transport(e)),
                }
            }
            Err(e) => Err(ProvisioningError::Transport(e)),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(BROKER_REQUESTS_TOTAL, "operation" => operation, "outcome" => outcome)
            .increment(1);
        metrics::histogram!(BROKER_REQUEST_DURATION, "operation" => operation)
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(_) => tracing::debug!(operation, %method, url = %url, "Broker call succeeded"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(operation, %method, url = %url, reason = %e, "Broker object not found")
            }
            Err(e) => {
                tracing::warn!(operation, %method, url = %url, error = %e, "Broker call failed")
            }
        }

        result
    }

    /// Check the credentials and VPN against the broker.
    #[instrument(skip(self, broker), fields(broker = %broker.name))]
    pub async fn test_connection(&self, broker: &Broker) -> ProvisioningResult {
        let url = format!("{}/about/user/msgVpns/{}", broker.url, enc(&broker.vpn));
        self.send(broker, "test_connection", Method::GET, url)
            .await
            .map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Client profiles
    // -------------------------------------------------------------------------

    #[instrument(skip(self, broker, profile), fields(broker = %broker.name, client_profile = %profile.name))]
    pub async fn create_client_profile(
        &self,
        broker: &Broker,
        profile: &ClientProfileSpec,
    ) -> ProvisioningResult {
        let mut body: Map<String, Value> = profile.settings.clone();
        body.insert("msgVpnName".into(), json!(broker.vpn));
        body.insert("clientProfileName".into(), json!(profile.name));

        let url = self.config_url(broker, "clientProfiles");
        self.send_json(broker, "create_client_profile", Method::POST, url, &body)
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, broker), fields(broker = %broker.name))]
    pub async fn delete_client_profile(&self, broker: &Broker, name: &str) -> ProvisioningResult {
        let url = self.config_url(broker, &format!("clientProfiles/{}", enc(name)));
        ignore_missing(
            self.send(broker, "delete_client_profile", Method::DELETE, url)
                .await,
        )
    }

    // -------------------------------------------------------------------------
    // Queues
    // -------------------------------------------------------------------------

    /// Create the queue with traffic disabled; activation turns it on later.
    #[instrument(skip(self, broker, queue), fields(broker = %broker.name, queue = %queue.name))]
    pub async fn create_queue(&self, broker: &Broker, queue: &QueueSpec) -> ProvisioningResult {
        let body = QueueActivation {
            msg_vpn_name: &broker.vpn,
            queue_name: &queue.name,
            access_type: queue.access_type.as_str(),
            egress_enabled: false,
            ingress_enabled: false,
            respect_ttl_enabled: queue.respect_ttl,
            max_ttl: queue.max_ttl,
            permission: queue.permission.as_str(),
        };
        let url = self.config_url(broker, "queues");
        self.send_json(broker, "create_queue", Method::POST, url, &body)
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, broker), fields(broker = %broker.name))]
    pub async fn delete_queue(&self, broker: &Broker, name: &str) -> ProvisioningResult {
        let url = self.config_url(broker, &format!("queues/{}", enc(name)));
        ignore_missing(self.send(broker, "delete_queue", Method::DELETE, url).await)
    }

    /// Enable traffic with the pass's TTL/permission settings, then apply the
    /// subscription list. Configuration is not rolled back when subscriptions
    /// fail; callers must treat activation as non-atomic.
    #[instrument(skip(self, broker, queue, subscriptions), fields(broker = %broker.name, queue = %queue.name))]
    pub async fn activate_queue(
        &self,
        broker: &Broker,
        queue: &QueueSpec,
        subscriptions: &[String],
    ) -> ProvisioningResult<SubscriptionReport> {
        let body = QueueActivation {
            msg_vpn_name: &broker.vpn,
            queue_name: &queue.name,
            access_type: queue.access_type.as_str(),
            egress_enabled: true,
            ingress_enabled: true,
            respect_ttl_enabled: queue.respect_ttl,
            max_ttl: queue.max_ttl,
            permission: queue.permission.as_str(),
        };
        let url = self.config_url(broker, &format!("queues/{}", enc(&queue.name)));
        self.send_json(broker, "activate_queue", Method::PATCH, url, &body)
        .await?;

        self.add_subscriptions(broker, &queue.name, subscriptions)
            .await
            .into_result()
    }

    /// Disable traffic on the queue, then remove the pass's subscriptions.
    #[instrument(skip(self, broker, subscriptions), fields(broker = %broker.name))]
    pub async fn deactivate_queue(
        &self,
        broker: &Broker,
        queue: &str,
        subscriptions: &[String],
    ) -> ProvisioningResult<SubscriptionReport> {
        let body = QueueDeactivation {
            msg_vpn_name: &broker.vpn,
            queue_name: queue,
            egress_enabled: false,
            ingress_enabled: false,
        };
        let url = self.config_url(broker, &format!("queues/{}", enc(queue)));
        self.send_json(broker, "deactivate_queue", Method::PATCH, url, &body)
        .await?;

        self.remove_subscriptions(broker, queue, subscriptions)
            .await
            .into_result()
    }

    /// Drop every retained message on the queue via the action API. A queue
    /// that no longer exists has nothing to purge.
    #[instrument(skip(self, broker), fields(broker = %broker.name))]
    pub async fn purge_messages(&self, broker: &Broker, queue: &str) -> ProvisioningResult {
        let url = format!(
            "{}/msgVpns/{}/queues/{}/deleteMsgs",
            action_base_url(&broker.url),
            enc(&broker.vpn),
            enc(queue)
        );
        ignore_missing(
            self.send_json(broker, "purge_messages", Method::PUT, url, &json!({}))
                .await,
        )
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    pub async fn add_subscription(
        &self,
        broker: &Broker,
        queue: &str,
        topic: &str,
    ) -> ProvisioningResult {
        let body = SubscriptionBody {
            msg_vpn_name: &broker.vpn,
            queue_name: queue,
            subscription_topic: topic,
        };
        let url = self.config_url(broker, &format!("queues/{}/subscriptions", enc(queue)));
        self.send_json(broker, "add_subscription", Method::POST, url, &body)
        .await
        .map(|_| ())
    }

    pub async fn remove_subscription(
        &self,
        broker: &Broker,
        queue: &str,
        topic: &str,
    ) -> ProvisioningResult {
        let url = self.config_url(
            broker,
            &format!("queues/{}/subscriptions/{}", enc(queue), enc(topic)),
        );
        ignore_missing(
            self.send(broker, "remove_subscription", Method::DELETE, url)
                .await,
        )
    }

    /// Apply topics in order. A failing topic is recorded and the batch
    /// carries on with the rest.
    pub async fn add_subscriptions(
        &self,
        broker: &Broker,
        queue: &str,
        topics: &[String],
    ) -> SubscriptionReport {
        let mut report = SubscriptionReport::default();
        for topic in topics {
            match self.add_subscription(broker, queue, topic).await {
                Ok(()) => report.applied.push(topic.clone()),
                Err(e) => {
                    tracing::warn!(queue, topic = %topic, error = %e, "Failed to add subscription");
                    report.failed.push((topic.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Remove topics in order, continuing past failures.
    pub async fn remove_subscriptions(
        &self,
        broker: &Broker,
        queue: &str,
        topics: &[String],
    ) -> SubscriptionReport {
        let mut report = SubscriptionReport::default();
        for topic in topics {
            match self.remove_subscription(broker, queue, topic).await {
                Ok(()) => report.applied.push(topic.clone()),
                Err(e) => {
                    tracing::warn!(queue, topic = %topic, error = %e, "Failed to remove subscription");
                    report.failed.push((topic.clone(), e.to_string()));
                }
            }
        }
        report
    }

    // -------------------------------------------------------------------------
    // REST delivery points
    // -------------------------------------------------------------------------

    #[instrument(skip(self, broker, rdp), fields(broker = %broker.name, rdp = %rdp.rdp_name))]
    pub async fn create_rest_delivery_point(
        &self,
        broker: &Broker,
        rdp: &RestDeliverySpec,
    ) -> ProvisioningResult {
        let body = RestDeliveryPointBody {
            msg_vpn_name: &broker.vpn,
            rest_delivery_point_name: &rdp.rdp_name,
            client_profile_name: rdp.client_profile.as_deref(),
            enabled: true,
        };
        let url = self.config_url(broker, "restDeliveryPoints");
        self.send_json(broker, "create_rest_delivery_point", Method::POST, url, &body)
        .await
        .map(|_| ())
    }

    /// Deleting the RDP also removes its bindings and consumers on the broker.
    #[instrument(skip(self, broker), fields(broker = %broker.name))]
    pub async fn delete_rest_delivery_point(
        &self,
        broker: &Broker,
        rdp_name: &str,
    ) -> ProvisioningResult {
        let url = self.config_url(broker, &format!("restDeliveryPoints/{}", enc(rdp_name)));
        ignore_missing(
            self.send(broker, "delete_rest_delivery_point", Method::DELETE, url)
                .await,
        )
    }

    /// Bind `queue` into the RDP; the binding is named after the queue.
    #[instrument(skip(self, broker), fields(broker = %broker.name))]
    pub async fn create_queue_binding(
        &self,
        broker: &Broker,
        rdp_name: &str,
        queue: &str,
        post_request_target: &str,
    ) -> ProvisioningResult {
        let body = QueueBindingBody {
            msg_vpn_name: &broker.vpn,
            rest_delivery_point_name: rdp_name,
            queue_binding_name: queue,
            post_request_target,
        };
        let url = self.config_url(
            broker,
            &format!("restDeliveryPoints/{}/queueBindings", enc(rdp_name)),
        );
        self.send_json(broker, "create_queue_binding", Method::POST, url, &body)
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, broker), fields(broker = %broker.name))]
    pub async fn delete_queue_binding(
        &self,
        broker: &Broker,
        rdp_name: &str,
        queue: &str,
    ) -> ProvisioningResult {
        let url = self.config_url(
            broker,
            &format!(
                "restDeliveryPoints/{}/queueBindings/{}",
                enc(rdp_name),
                enc(queue)
            ),
        );
        ignore_missing(
            self.send(broker, "delete_queue_binding", Method::DELETE, url)
                .await,
        )
    }

    #[instrument(skip(self, broker, consumer), fields(broker = %broker.name, consumer = %consumer.name))]
    pub async fn create_rest_consumer(
        &self,
        broker: &Broker,
        rdp_name: &str,
        consumer: &RestConsumerSpec,
    ) -> ProvisioningResult {
        let body = RestConsumerBody {
            msg_vpn_name: &broker.vpn,
            rest_delivery_point_name: rdp_name,
            rest_consumer_name: &consumer.name,
            remote_host: &consumer.remote_host,
            remote_port: consumer.remote_port,
            tls_enabled: consumer.tls_enabled,
            http_method: consumer.http_method.as_str(),
            enabled: true,
        };
        let url = self.config_url(
            broker,
            &format!("restDeliveryPoints/{}/restConsumers", enc(rdp_name)),
        );
        self.send_json(broker, "create_rest_consumer", Method::POST, url, &body)
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, broker), fields(broker = %broker.name))]
    pub async fn delete_rest_consumer(
        &self,
        broker: &Broker,
        rdp_name: &str,
        consumer: &str,
    ) -> ProvisioningResult {
        let url = self.config_url(
            broker,
            &format!(
                "restDeliveryPoints/{}/restConsumers/{}",
                enc(rdp_name),
                enc(consumer)
            ),
        );
        ignore_missing(
            self.send(broker, "delete_rest_consumer", Method::DELETE, url)
                .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_url_replaces_last_segment() {
        assert_eq!(
            action_base_url("https://broker:943/SEMP/v2/config"),
            "https://broker:943/SEMP/v2/action"
        );
        assert_eq!(
            action_base_url("https://broker:943/SEMP/v2/config/"),
            "https://broker:943/SEMP/v2/action"
        );
    }

    #[test]
    fn envelope_error_wins_over_http_status() {
        let body = r#"{"meta":{"responseCode":200,"error":{"code":11,"description":"Max TTL out of range","status":"INVALID_PARAMETER"}}}"#;
        let err = parse_envelope(200, body).unwrap_err();
        assert!(matches!(err, ProvisioningError::RemoteApi { .. }));
        assert_eq!(err.to_string(), "Max TTL out of range");
    }

    #[test]
    fn not_found_is_recognised_by_status_or_description() {
        let by_status = r#"{"meta":{"error":{"description":"No such queue","status":"NOT_FOUND"}}}"#;
        let by_text = r#"{"meta":{"error":{"description":"Could not find match for queue 'q1'"}}}"#;
        assert!(parse_envelope(400, by_status).unwrap_err().is_not_found());
        assert!(parse_envelope(400, by_text).unwrap_err().is_not_found());
        assert!(ignore_missing(parse_envelope(400, by_text)).is_ok());
    }

    #[test]
    fn non_envelope_body_is_unexpected() {
        let err = parse_envelope(502, "<html>Bad Gateway</html>").unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::UnexpectedResponse { status: 502, .. }
        ));
    }

    #[test]
    fn success_envelope_yields_data() {
        let data = parse_envelope(200, r#"{"meta":{"responseCode":200},"data":{"queueName":"q1"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(data["queueName"], "q1");
    }

    #[test]
    fn report_summary_lists_failed_topics() {
        let report = SubscriptionReport {
            applied: vec!["a/b".into()],
            failed: vec![("c/d".into(), "denied".into())],
        };
        assert!(!report.is_success());
        assert_eq!(report.summary(), "1 of 2 subscription(s) failed: c/d");
        assert!(matches!(
            report.into_result(),
            Err(ProvisioningError::Subscriptions(_))
        ));
    }
}
