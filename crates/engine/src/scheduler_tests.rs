//! Tests for the global task scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use db::{Collection, InMemoryRepository};
use handlers::mock::MockHandler;
use handlers::{HandlerError, TaskContext, TaskHandler};
use queue::{Task, TaskStatus};

use crate::config::{EngineConfig, QueueConfig};
use crate::coordinator::Coordinator;
use crate::error::OrchestratorError;
use crate::metrics::MetricsSnapshot;
use crate::runtime::AgentRuntime;
use crate::scheduler::TaskScheduler;
use crate::store::Store;
use crate::test_support::{eventually, runtime, started_agent};

/// Records the payloads it sees, in order, and the agent that ran each.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(Value, uuid::Uuid)>>,
}

#[async_trait]
impl TaskHandler for Recorder {
    fn task_type(&self) -> &str {
        "record"
    }

    async fn handle(&self, payload: Value, ctx: &TaskContext) -> Result<Value, HandlerError> {
        self.seen.lock().push((payload.clone(), ctx.agent_id));
        Ok(payload)
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        capacity: 16,
        promote_interval_ms: 10,
        dispatch_retry_interval_ms: 10,
    }
}

fn retry_config() -> EngineConfig {
    EngineConfig {
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
        ..EngineConfig::default()
    }
}

fn scheduler(rt: &Arc<AgentRuntime>) -> Arc<TaskScheduler> {
    Arc::new(TaskScheduler::new(
        queue_config(),
        retry_config(),
        Arc::clone(rt),
        Arc::new(Coordinator::default()),
    ))
}

// ============================================================
// Dispatch
// ============================================================

#[tokio::test]
async fn tasks_dispatch_in_priority_order() {
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(vec![recorder.clone()]);
    started_agent(&rt, "solo", &[]).await;
    let sched = scheduler(&rt);

    let mut tickets = Vec::new();
    for (label, priority) in [("a", 5), ("b", 1), ("c", 9), ("d", 5)] {
        let task = Task::new("record", json!(label)).with_priority(priority);
        tickets.push(sched.submit(task).await.unwrap());
    }
    sched.start();
    for ticket in tickets {
        assert_eq!(ticket.wait().await.unwrap().status, TaskStatus::Completed);
    }

    let order: Vec<Value> = recorder.seen.lock().iter().map(|(v, _)| v.clone()).collect();
    assert_eq!(order, vec![json!("c"), json!("a"), json!("d"), json!("b")]);
}

#[tokio::test]
async fn task_waits_for_an_eligible_agent() {
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(vec![recorder.clone()]);
    let sched = scheduler(&rt);
    sched.start();

    let ticket = sched.submit(Task::new("record", json!("held"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.seen.lock().is_empty());

    let agent = started_agent(&rt, "late", &[]).await;
    let result = tokio::time::timeout(Duration::from_secs(2), ticket.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.agent_id, agent.id);
}

#[tokio::test]
async fn capability_requirements_route_tasks() {
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(vec![recorder.clone()]);
    started_agent(&rt, "cpu", &["linux"]).await;
    let gpu = started_agent(&rt, "gpu", &["linux", "gpu"]).await;
    let sched = scheduler(&rt);
    sched.start();

    let task = Task::new("record", json!("render")).requiring(["gpu"]);
    let result = sched.submit(task).await.unwrap().wait().await.unwrap();
    assert_eq!(result.agent_id, gpu.id);
}

#[tokio::test]
async fn unroutable_task_does_not_hold_up_the_queue() {
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(vec![recorder.clone()]);
    let cpu = started_agent(&rt, "cpu", &["linux"]).await;
    let sched = scheduler(&rt);

    let render = Task::new("record", json!("render"))
        .with_priority(9)
        .requiring(["gpu"]);
    let render = sched.submit(render).await.unwrap();
    let plain = sched
        .submit(Task::new("record", json!("plain")).with_priority(1))
        .await
        .unwrap();
    sched.start();

    let result = tokio::time::timeout(Duration::from_secs(2), plain.wait())
        .await
        .expect("plain task runs while the gpu task waits")
        .unwrap();
    assert_eq!(result.agent_id, cpu.id);

    let gpu = started_agent(&rt, "gpu", &["gpu"]).await;
    let result = tokio::time::timeout(Duration::from_secs(2), render.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.agent_id, gpu.id);
    assert_eq!(result.status, TaskStatus::Completed);

    let order: Vec<Value> = recorder.seen.lock().iter().map(|(v, _)| v.clone()).collect();
    assert_eq!(order, vec![json!("plain"), json!("render")]);
}

// ============================================================
// Retries
// ============================================================

#[tokio::test]
async fn retryable_failures_are_requeued_with_backoff() {
    let flaky = Arc::new(MockHandler::flaky("flaky", 1, json!({ "ok": true })));
    let rt = runtime(vec![flaky.clone()]);
    started_agent(&rt, "a", &[]).await;
    let sched = scheduler(&rt);
    sched.start();

    let task = Task::new("flaky", json!(null)).with_max_retries(2);
    let result = sched.submit(task).await.unwrap().wait().await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.attempt, 2);
    assert_eq!(flaky.call_count(), 2);
}

#[tokio::test]
async fn retries_stop_at_max_retries() {
    let failing = Arc::new(MockHandler::failing_retryable("flaky", "nope"));
    let rt = runtime(vec![failing.clone()]);
    started_agent(&rt, "a", &[]).await;
    let sched = scheduler(&rt);
    sched.start();

    let task = Task::new("flaky", json!(null)).with_max_retries(1);
    let result = sched.submit(task).await.unwrap().wait().await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.attempt, 2);
    assert_eq!(failing.call_count(), 2);
}

// ============================================================
// Cancellation and rejection
// ============================================================

#[tokio::test]
async fn cancel_before_dispatch() {
    let rt = runtime(vec![Arc::new(Recorder::default())]);
    let sched = scheduler(&rt);

    let ticket = sched.submit(Task::new("record", json!(1))).await.unwrap();
    sched.cancel(ticket.task_id).await.unwrap();

    let result = ticket.wait().await.unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert_eq!(sched.queue_len(), 0);
    assert!(matches!(
        sched.cancel(uuid::Uuid::new_v4()).await,
        Err(OrchestratorError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn cancel_in_flight_is_not_retried() {
    let slow = Arc::new(MockHandler::sleeping("slow", Duration::from_secs(10)));
    let rt = runtime(vec![slow.clone()]);
    started_agent(&rt, "a", &[]).await;
    let sched = scheduler(&rt);
    sched.start();

    let ticket = sched
        .submit(Task::new("slow", json!(null)).with_max_retries(3))
        .await
        .unwrap();
    assert!(eventually(|| slow.call_count() == 1).await);
    sched.cancel(ticket.task_id).await.unwrap();

    let result = ticket.wait().await.unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert_eq!(slow.call_count(), 1);
}

#[tokio::test]
async fn duplicate_and_unknown_tasks_are_rejected() {
    let rt = runtime(vec![Arc::new(Recorder::default())]);
    let sched = scheduler(&rt);

    let task = Task::new("record", json!(null));
    sched.submit(task.clone()).await.unwrap();
    assert!(matches!(sched.submit(task).await, Err(OrchestratorError::Validation(_))));
    assert!(matches!(
        sched.submit(Task::new("nope", json!(null))).await,
        Err(OrchestratorError::Handler(_))
    ));
}

// ============================================================
// Shutdown and recovery
// ============================================================

#[tokio::test]
async fn shutdown_rejects_new_work_and_answers_waiters() {
    let rt = runtime(vec![Arc::new(Recorder::default())]);
    let sched = scheduler(&rt);
    sched.start();

    // No agent, so this one keeps getting parked in the queue.
    let held = sched.submit(Task::new("record", json!(1))).await.unwrap();
    sched.shutdown().await;

    assert!(matches!(held.wait().await, Err(OrchestratorError::SchedulerShutdown)));
    assert!(matches!(
        sched.submit(Task::new("record", json!(2))).await,
        Err(OrchestratorError::SchedulerShutdown)
    ));
}

#[tokio::test]
async fn persisted_tasks_are_requeued_on_recover() {
    let store = Store::new(Arc::new(InMemoryRepository::new()));
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(vec![recorder.clone()]);

    let first = TaskScheduler::new(
        queue_config(),
        retry_config(),
        Arc::clone(&rt),
        Arc::new(Coordinator::default()),
    )
    .with_store(store.clone());
    first.submit(Task::new("record", json!("survivor"))).await.unwrap();
    first.shutdown().await;
    assert_eq!(store.load_all::<Task>(Collection::Tasks).await.len(), 1);

    started_agent(&rt, "a", &[]).await;
    let second = Arc::new(
        TaskScheduler::new(
            queue_config(),
            retry_config(),
            Arc::clone(&rt),
            Arc::new(Coordinator::default()),
        )
        .with_store(store.clone()),
    );
    assert_eq!(second.recover().await, 1);
    second.start();

    assert!(eventually(|| recorder.seen.lock().len() == 1).await);
    assert_eq!(recorder.seen.lock()[0].0, json!("survivor"));
    second.shutdown().await;
}

#[tokio::test]
async fn queue_figures_feed_metrics() {
    let rt = runtime(vec![Arc::new(Recorder::default())]);
    let sched = scheduler(&rt);
    sched.submit(Task::new("record", json!(1))).await.unwrap();
    sched.submit(Task::new("record", json!(2))).await.unwrap();

    let mut snapshot = MetricsSnapshot::default();
    sched.fill_metrics(&mut snapshot);
    assert_eq!(snapshot.global_queue_depth, 2);
    assert!(snapshot.average_global_queue_depth > 0.0);
}
