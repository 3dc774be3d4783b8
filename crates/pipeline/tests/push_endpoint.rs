mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;

use common::*;
use datafeed_core::{DatasetDescriptor, FetchRequest, LandedObjectEvent, ObjectTarget, Principal};
use datafeed_pipeline::{FetcherRegistry, Pipeline, INGEST_SUBSCRIPTION};
use datafeed_queue::{mint_push_token, PushEnvelope, QueueMessage};
use datafeed_storage::LandingStore;

const TOPOLOGY: &str = r#"
[[datasets]]
id = "HOUSEHOLD_INCOME"
gcs_bucket = "landing"
filename = "SAIPE"
"#;

fn fixture() -> Pipeline {
    let registry = FetcherRegistry::default().register("HOUSEHOLD_INCOME", StaticFetcher::new(SAIPE_CSV));
    pipeline(fast_settings(), &topology(TOPOLOGY), registry)
}

fn token_for(p: &Pipeline, principal: &Principal) -> String {
    let auth = &p.settings().auth;
    let secret = auth.push_token_secret.as_deref().unwrap();
    mint_push_token(secret, &auth.push_audience, principal, Duration::minutes(5), Utc::now()).unwrap()
}

fn fetch_envelope() -> String {
    let request = FetchRequest(
        DatasetDescriptor::new("HOUSEHOLD_INCOME", None, "landing", ObjectTarget::Exact("SAIPE".into())).unwrap(),
    );
    let message = QueueMessage::new("fetch-requests", &request).unwrap();
    serde_json::to_string(&PushEnvelope::from_message(INGEST_SUBSCRIPTION, &message)).unwrap()
}

fn push(subscription: &str, token: Option<&str>, body: String) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/push/{subscription}"))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn push_from_ingest_identity_lands_object_and_notifies() {
    let p = fixture();
    let mut notifications = p.notifications.subscribe();
    let token = token_for(&p, &p.settings().identities.ingest);

    let response = p
        .router()
        .oneshot(push(INGEST_SUBSCRIPTION, Some(&token), fetch_envelope()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(
        p.landing.get("landing", "SAIPE").await.unwrap().as_ref(),
        SAIPE_CSV.as_bytes()
    );
    let event: LandedObjectEvent = notifications.recv().await.unwrap().decode().unwrap();
    assert_eq!(event.object_name, "SAIPE");
    assert_eq!(event.dataset_id, "HOUSEHOLD_INCOME");
}

#[tokio::test]
async fn missing_or_forged_token_is_unauthorized() {
    let p = fixture();
    let response = p
        .router()
        .oneshot(push(INGEST_SUBSCRIPTION, None, fetch_envelope()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = mint_push_token(
        "not-the-secret",
        "datafeed-push",
        &p.settings().identities.ingest,
        Duration::minutes(5),
        Utc::now(),
    )
    .unwrap();
    let response = p
        .router()
        .oneshot(push(INGEST_SUBSCRIPTION, Some(&forged), fetch_envelope()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(p.landing.list("landing", "").await.unwrap().is_empty());
}

#[tokio::test]
async fn wrong_principal_is_forbidden() {
    let p = fixture();
    let token = token_for(&p, &p.settings().identities.load);
    let response = p
        .router()
        .oneshot(push(INGEST_SUBSCRIPTION, Some(&token), fetch_envelope()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("load@datafeed"));
}

#[tokio::test]
async fn unknown_subscription_and_bad_envelope() {
    let p = fixture();
    let token = token_for(&p, &p.settings().identities.ingest);

    let response = p
        .router()
        .oneshot(push("nope", Some(&token), fetch_envelope()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = p
        .router()
        .oneshot(push(INGEST_SUBSCRIPTION, Some(&token), "{\"message\": 1}".into()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn undecodable_request_is_a_permanent_failure() {
    let p = fixture();
    let token = token_for(&p, &p.settings().identities.ingest);
    let message = QueueMessage::new("fetch-requests", &serde_json::json!({"id": "X"})).unwrap();
    let body = serde_json::to_string(&PushEnvelope::from_message(INGEST_SUBSCRIPTION, &message)).unwrap();

    let response = p
        .router()
        .oneshot(push(INGEST_SUBSCRIPTION, Some(&token), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn operator_endpoints_report_state() {
    let mut p = fixture();
    p.start();

    let response = p
        .router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["subscriptions"], 2);

    p.scheduler.trigger_now("HOUSEHOLD_INCOME").await.unwrap();
    wait_for_loads(&p, "HOUSEHOLD_INCOME", 1).await;

    let response = p
        .router()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let metrics: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metrics["datasets"]["HOUSEHOLD_INCOME"]["last_row_count"], 3);
    assert_eq!(metrics["subscriptions"]["ingest"]["attempts"], 1);
    assert_eq!(metrics["dead_letter_depth"], 0);

    let response = p
        .router()
        .oneshot(Request::builder().uri("/joins").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    p.shutdown();
}
