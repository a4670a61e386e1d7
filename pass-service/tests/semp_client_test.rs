//! Broker management client against a stand-in broker.

mod common;

use common::*;
use pass_service::models::{Broker, ClientProfileSpec, Ownership};
use pass_service::services::{ProvisioningError, SempClient};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> SempClient {
    SempClient::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn delete_of_missing_resource_succeeds_every_time() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("DELETE"))
        .and(path(config_path("queues/q1")))
        .respond_with(ResponseTemplate::new(400).set_body_json(not_found_body("queue 'q1'")))
        .expect(2)
        .mount(&server)
        .await;

    let semp = client();
    semp.delete_queue(&broker, QUEUE).await.unwrap();
    semp.delete_queue(&broker, QUEUE).await.unwrap();
}

#[tokio::test]
async fn every_resource_delete_tolerates_not_found() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(400).set_body_json(not_found_body("object")))
        .mount(&server)
        .await;

    let semp = client();
    semp.delete_client_profile(&broker, "cp1").await.unwrap();
    semp.delete_rest_delivery_point(&broker, "rdp1").await.unwrap();
    semp.delete_queue_binding(&broker, "rdp1", QUEUE).await.unwrap();
    semp.delete_rest_consumer(&broker, "rdp1", "consumer1").await.unwrap();
    semp.remove_subscription(&broker, QUEUE, "orders/created").await.unwrap();
}

#[tokio::test]
async fn error_envelope_fails_even_with_http_200() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("POST"))
        .and(path(config_path("queues")))
        .respond_with(ResponseTemplate::new(200).set_body_json(error_body("Max TTL out of range")))
        .mount(&server)
        .await;

    let err = client()
        .create_queue(&broker, &descriptor(Ownership::Owned).queue)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::RemoteApi { .. }));
    assert_eq!(err.to_string(), "Max TTL out of range");
}

#[tokio::test]
async fn not_found_on_create_is_not_swallowed() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(not_found_body("client profile 'cp9'")))
        .mount(&server)
        .await;

    let err = client()
        .create_queue(&broker, &descriptor(Ownership::Owned).queue)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn requests_carry_basic_auth_and_vpn() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    // admin:secret
    Mock::given(method("POST"))
        .and(path(config_path("queues")))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .and(body_partial_json(json!({
            "msgVpnName": VPN,
            "queueName": QUEUE,
            "accessType": "exclusive",
            "ingressEnabled": false,
            "egressEnabled": false,
            "maxTtl": 3600
        })))
        .respond_with(ok())
        .expect(1)
        .mount(&server)
        .await;

    client()
        .create_queue(&broker, &descriptor(Ownership::Owned).queue)
        .await
        .unwrap();
}

#[tokio::test]
async fn client_profile_body_carries_settings_and_names() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("POST"))
        .and(path(config_path("clientProfiles")))
        .and(body_partial_json(json!({
            "msgVpnName": VPN,
            "clientProfileName": "cp1",
            "allowGuaranteedMsgSendEnabled": true
        })))
        .respond_with(ok())
        .expect(1)
        .mount(&server)
        .await;

    let mut settings = serde_json::Map::new();
    settings.insert("allowGuaranteedMsgSendEnabled".to_string(), json!(true));
    let profile = ClientProfileSpec {
        name: "cp1".to_string(),
        ownership: Ownership::Owned,
        settings,
    };

    client().create_client_profile(&broker, &profile).await.unwrap();
}

#[tokio::test]
async fn activation_enables_traffic_then_subscribes_each_topic() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("PATCH"))
        .and(path(config_path("queues/q1")))
        .and(body_partial_json(json!({
            "ingressEnabled": true,
            "egressEnabled": true,
            "respectTtlEnabled": true,
            "permission": "consume"
        })))
        .respond_with(ok())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(config_path("queues/q1/subscriptions")))
        .respond_with(ok())
        .expect(2)
        .mount(&server)
        .await;

    let object = descriptor(Ownership::Owned);
    let report = client()
        .activate_queue(&broker, &object.queue, &object.subscriptions)
        .await
        .unwrap();

    assert_eq!(report.applied, object.subscriptions);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn activation_reports_failed_topics_but_tries_them_all() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("POST"))
        .and(path(config_path("queues/q1/subscriptions")))
        .and(body_partial_json(json!({ "subscriptionTopic": "orders/created" })))
        .respond_with(failure("Subscription not permitted"))
        .mount(&server)
        .await;
    mount_catch_all_ok(&server).await;

    let object = descriptor(Ownership::Owned);
    let err = client()
        .activate_queue(&broker, &object.queue, &object.subscriptions)
        .await
        .unwrap_err();

    let ProvisioningError::Subscriptions(report) = err else {
        panic!("expected a subscription failure");
    };
    assert_eq!(report.applied, vec!["orders/updated".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "orders/created");
    assert_eq!(
        count_calls(&server, "POST", &config_path("queues/q1/subscriptions")).await,
        2
    );
}

#[tokio::test]
async fn activation_stops_when_queue_config_is_rejected() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("PATCH"))
        .respond_with(failure("Queue is shutdown"))
        .mount(&server)
        .await;
    mount_catch_all_ok(&server).await;

    let object = descriptor(Ownership::Owned);
    let err = client()
        .activate_queue(&broker, &object.queue, &object.subscriptions)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Queue is shutdown");
    assert_eq!(calls(&server).await.len(), 1);
}

#[tokio::test]
async fn subscription_topic_is_path_encoded_on_removal() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("DELETE"))
        .and(path(config_path("queues/q1/subscriptions/orders%2F%3E")))
        .respond_with(ok())
        .expect(1)
        .mount(&server)
        .await;

    client()
        .remove_subscription(&broker, QUEUE, "orders/>")
        .await
        .unwrap();
}

#[tokio::test]
async fn purge_goes_to_the_action_api() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("PUT"))
        .and(path("/SEMP/v2/action/msgVpns/default/queues/q1/deleteMsgs"))
        .respond_with(ok())
        .expect(1)
        .mount(&server)
        .await;

    client().purge_messages(&broker, QUEUE).await.unwrap();
}

#[tokio::test]
async fn broker_test_hits_about_user_endpoint() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("GET"))
        .and(path("/SEMP/v2/config/about/user/msgVpns/default"))
        .respond_with(ok())
        .expect(1)
        .mount(&server)
        .await;

    client().test_connection(&broker).await.unwrap();
}

#[tokio::test]
async fn non_envelope_response_is_unexpected() {
    init_tracing();
    let server = MockServer::start().await;
    let broker = broker_for(&server);

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>Bad Gateway</html>"))
        .mount(&server)
        .await;

    let err = client().test_connection(&broker).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisioningError::UnexpectedResponse { status: 502, .. }
    ));
}

#[tokio::test]
async fn unreachable_broker_is_a_transport_error() {
    init_tracing();
    let broker = Broker::new(BROKER, "http://127.0.0.1:1/SEMP/v2/config", VPN, "admin", "secret");

    let err = client().delete_queue(&broker, QUEUE).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::Transport(_)));
}
