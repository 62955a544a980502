use super::{harness, wait_for_status};
use crate::{
    graph::TaskGraph,
    models::{ActionType, AgentDescriptor, JobStatus, PlanMode, Task},
    orchestrator::Orchestrator,
    protocol::{Envelope, MessageType},
};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn zero_task_job_goes_straight_to_done() {
    let h = harness().await;

    let job = Orchestrator::job_from_plan(
        "noop",
        TaskGraph::new(),
        PlanMode::Orchestrated,
        HashMap::new(),
        3,
        None,
    );
    let job_id = h.orchestrator.submit_job(job).await.unwrap();

    let done = wait_for_status(&h.store, &job_id, JobStatus::Done, Duration::from_secs(5)).await;
    assert!(done.tasks.is_empty());
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn submit_persists_before_enqueue() {
    let h = harness().await;

    let mut graph = TaskGraph::new();
    graph
        .add(Task::new("t1", ActionType::CallAgent, "calculate"))
        .unwrap();
    let job = Orchestrator::job_from_plan(
        "calculate",
        graph,
        PlanMode::Orchestrated,
        HashMap::new(),
        3,
        None,
    );
    let job_id = h.orchestrator.submit_job(job).await.unwrap();

    // Immediately fetchable with the exact submitted task set.
    let stored = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(stored.tasks.len(), 1);
    assert!(stored.tasks.contains_key("t1"));

    let entries = h.orchestrator.audit().entries_for_job(&job_id).await.unwrap();
    assert_eq!(entries[0].action, "job-submitted");
}

#[tokio::test]
async fn stale_queue_entry_for_terminal_job_is_ignored() {
    let h = harness().await;

    let job = Orchestrator::job_from_plan(
        "noop",
        TaskGraph::new(),
        PlanMode::Orchestrated,
        HashMap::new(),
        3,
        None,
    );
    let job_id = h.orchestrator.submit_job(job).await.unwrap();
    wait_for_status(&h.store, &job_id, JobStatus::Done, Duration::from_secs(5)).await;

    // Re-enqueueing a finished job must not disturb it.
    h.orchestrator.queue().enqueue(&job_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

#[tokio::test]
async fn job_deadline_forces_timeout_failure() {
    let mut server = mockito::Server::new_async().await;
    let h = harness().await;

    h.registry
        .register(AgentDescriptor::new(
            "agent://slow/agent",
            server.url(),
            vec!["research".to_string()],
        ))
        .await
        .unwrap();
    // Ack only; the reply never comes.
    let _mock = server
        .mock("POST", "/tasks")
        .with_status(202)
        .with_header("content-type", "application/json")
        .with_body(json!({"status": "accepted"}).to_string())
        .create_async()
        .await;

    let mut graph = TaskGraph::new();
    graph
        .add(Task::new("slow", ActionType::CallAgent, "research").with_timeout(60))
        .unwrap();
    let mut job = Orchestrator::job_from_plan(
        "research",
        graph,
        PlanMode::Orchestrated,
        HashMap::new(),
        3,
        None,
    );
    job.deadline_secs = Some(0);
    let job_id = h.orchestrator.submit_job(job).await.unwrap();

    let failed =
        wait_for_status(&h.store, &job_id, JobStatus::Failed, Duration::from_secs(10)).await;
    assert!(failed.error.as_deref().unwrap_or("").contains("deadline"));
}

#[tokio::test]
async fn reply_for_unknown_request_is_an_acknowledged_orphan() {
    let h = harness().await;

    let mut reply = Envelope::new(MessageType::Inform, "agent://stray/agent", "calculate");
    reply.correlation.in_reply_to = Some("never-sent".to_string());
    reply.correlation.conversation_id = Some("no-such-job".to_string());

    // Accepted without error, recorded, no state change.
    h.orchestrator.handle_reply(&reply).await.unwrap();
    assert!(h.store.get_message(&reply.id).await.unwrap().is_some());

    let entries = h
        .orchestrator
        .audit()
        .entries_for_job("no-such-job")
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.action == "orphan-reply"));
}

#[tokio::test]
async fn duplicate_reply_is_idempotent() {
    let h = harness().await;

    let mut reply = Envelope::new(MessageType::Inform, "agent://stray/agent", "calculate");
    reply.correlation.conversation_id = Some("job-x".to_string());

    h.orchestrator.handle_reply(&reply).await.unwrap();
    h.orchestrator.handle_reply(&reply).await.unwrap();

    // Only one inbound recording despite two deliveries.
    let entries = h.orchestrator.audit().entries_for_job("job-x").await.unwrap();
    let inbound = entries.iter().filter(|e| e.action == "message-inbound").count();
    assert_eq!(inbound, 1);
}
