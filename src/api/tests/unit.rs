use super::{build_router_only, spawn_api};
use crate::{
    models::{AgentDescriptor, JobStatus},
    orchestrator::tests::wait_for_status,
    protocol::{Envelope, MessageType},
};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

#[tokio::test]
async fn router_answers_health_without_a_socket() {
    let (router, _dir) = build_router_only().await;

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn submit_then_fetch_round_trips_the_task_set() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    let body = json!({
        "intent": "portal-report",
        "tasks": {
            "open": {"action": "web_script", "target": "goto", "text": "https://portal.example.com"},
            "download": {"action": "web_script", "target": "click", "text": "#download-pdf",
                         "depends_on": ["open"]},
            "mail": {"action": "send_mail", "target": "boss@example.com",
                     "text": "Here is the report.", "depends_on": ["download"]}
        },
        "max_retries": 2
    });

    let response = client
        .post(format!("{}/jobs", h.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let created: Value = response.json().await.unwrap();
    assert_eq!(created["status"], json!("pending"));
    assert_eq!(created["task_count"], json!(3));
    assert_eq!(created["max_retries"], json!(2));

    let job_id = created["id"].as_str().unwrap();
    let response = client
        .get(format!("{}/jobs/{job_id}", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let fetched: Value = response.json().await.unwrap();
    assert_eq!(fetched["id"], created["id"]);
    assert_eq!(
        fetched["tasks"]["download"]["depends_on"],
        json!(["open"])
    );
    assert_eq!(fetched["tasks"]["mail"]["action"], json!("send_mail"));
}

#[tokio::test]
async fn submitting_the_same_body_twice_yields_two_jobs() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    let body = json!({"intent": "noop", "tasks": {}});
    let first: Value = client
        .post(format!("{}/jobs", h.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: Value = client
        .post(format!("{}/jobs", h.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_ne!(first["id"], second["id"]);

    let list: Value = client
        .get(format!("{}/jobs", h.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["total"], json!(2));
}

#[tokio::test]
async fn validation_failures_are_400() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    // Blank intent.
    let response = client
        .post(format!("{}/jobs", h.base_url))
        .json(&json!({"intent": "", "tasks": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("validation"));

    // Unknown dependency.
    let response = client
        .post(format!("{}/jobs", h.base_url))
        .json(&json!({
            "intent": "broken",
            "tasks": {"a": {"action": "click", "target": "#x", "depends_on": ["ghost"]}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Circular dependency.
    let response = client
        .post(format!("{}/jobs", h.base_url))
        .json(&json!({
            "intent": "cycle",
            "tasks": {
                "a": {"action": "click", "target": "#x", "depends_on": ["b"]},
                "b": {"action": "click", "target": "#y", "depends_on": ["a"]}
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Retry budget out of range.
    let response = client
        .post(format!("{}/jobs", h.base_url))
        .json(&json!({"intent": "x", "tasks": {}, "max_retries": 99}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn unknown_job_is_404_and_bad_filter_is_400() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/jobs/does-not-exist", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("not_found"));

    let response = client
        .get(format!("{}/jobs?status=bogus", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn list_filters_and_paginates() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        client
            .post(format!("{}/jobs", h.base_url))
            .json(&json!({"intent": format!("job-{i}"), "tasks": {}}))
            .send()
            .await
            .unwrap();
    }

    // Zero-task jobs complete immediately.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let list: Value = client
            .get(format!("{}/jobs?status=done", h.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if list["total"] == json!(3) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let page: Value = client
        .get(format!("{}/jobs?limit=2&offset=2", h.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], json!(3));
    assert_eq!(page["jobs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_transitions_and_conflicts_thereafter() {
    let mut server = mockito::Server::new_async().await;
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    // An agent that only acks keeps the job running until cancelled.
    h.registry
        .register(AgentDescriptor::new(
            "agent://slow/agent",
            server.url(),
            vec!["research".to_string()],
        ))
        .await
        .unwrap();
    let _mock = server
        .mock("POST", "/tasks")
        .with_status(202)
        .with_header("content-type", "application/json")
        .with_body(json!({"status": "accepted"}).to_string())
        .create_async()
        .await;

    let created: Value = client
        .post(format!("{}/jobs", h.base_url))
        .json(&json!({
            "intent": "slow-research",
            "tasks": {"slow": {"action": "call_agent", "target": "research"}}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = created["id"].as_str().unwrap().to_string();

    wait_for_status(&h.store, &job_id, JobStatus::Running, Duration::from_secs(5)).await;

    let response = client
        .delete(format!("{}/jobs/{job_id}", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    // A second cancel is an illegal transition.
    let response = client
        .delete(format!("{}/jobs/{job_id}", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("conflict"));

    // Retry of a cancelled (not failed) job conflicts too.
    let response = client
        .post(format!("{}/jobs/{job_id}/retry", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn malformed_envelope_is_422_and_duplicates_are_absorbed() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    // Missing sender.
    let response = client
        .post(format!("{}/messages", h.base_url))
        .json(&json!({
            "id": "m-1",
            "ts": "2026-01-15T10:30:00+00:00",
            "type": "inform",
            "intent": "calculate"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);

    // A well-formed reply with unknown correlation is accepted.
    let reply = Envelope::new(MessageType::Inform, "agent://calc/calc", "calculate")
        .with_conversation("job-unknown");
    let response = client
        .post(format!("{}/messages", h.base_url))
        .json(&serde_json::to_value(&reply).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["message_id"], json!(reply.id));

    // Replaying the same envelope is a no-op, still acknowledged.
    let response = client
        .post(format!("{}/messages", h.base_url))
        .json(&serde_json::to_value(&reply).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
}

#[tokio::test]
async fn offer_envelope_registers_an_agent() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    let mut offer = Envelope::new(MessageType::Offer, "agent://scraper/research", "discover");
    offer.payload.insert("endpoint".into(), json!("http://localhost:8010"));
    offer.payload.insert("capabilities".into(), json!(["research"]));

    let response = client
        .post(format!("{}/messages", h.base_url))
        .json(&serde_json::to_value(&offer).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let agent = h.registry.lookup_by_capability("research").await.unwrap();
    assert_eq!(agent.id, "agent://scraper/research");
}

#[tokio::test]
async fn health_reports_components() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["components"]["store"], json!("ok"));
    assert!(body["components"]["agents"].is_number());
}

#[tokio::test]
async fn api_key_is_enforced_when_configured() {
    let key = "test-secret-key-123456789012345678901234567890";
    let h = spawn_api(|config| {
        config.api.api_key = Some(key.to_string());
    })
    .await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(format!("{}/health", h.base_url))
        .header("x-api-key", "wrong-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(format!("{}/health", h.base_url))
        .header("x-api-key", key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/health", h.base_url))
        .header("authorization", format!("Bearer {key}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn planner_path_builds_calculator_pipeline() {
    let h = spawn_api(|_| {}).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/jobs", h.base_url))
        .json(&json!({
            "intent": "calculate",
            "params": {"num1": 45, "num2": 78, "op": "add", "locale": "de-DE", "decimals": 2}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(created["task_count"], json!(2));
    assert!(created["tasks"]["calc"].is_object());
    assert_eq!(created["tasks"]["format"]["depends_on"], json!(["calc"]));
}
