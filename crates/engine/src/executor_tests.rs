//! Tests for the workflow engine.
//!
//! Workflows run end to end on a real `AgentRuntime` with `MockHandler`s and
//! an in-memory store, so no Postgres connection is required.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use db::{Collection, InMemoryRepository};
use handlers::mock::MockHandler;
use handlers::TaskHandler;
use queue::TaskStatus;

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::error::OrchestratorError;
use crate::events::{ChannelPublisher, EventPublisher, OrchestratorEvent};
use crate::executor::{ExecutionHandle, WorkflowEngine};
use crate::models::{
    Edge, EdgeCondition, ExecutionStatus, Node, NodeTask, TaskState, Workflow, WorkflowExecution,
    WorkflowStatus,
};
use crate::runtime::AgentRuntime;
use crate::store::Store;
use crate::test_support::{eventually, runtime, started_agent, SlowRepository};

fn engine_config() -> EngineConfig {
    EngineConfig {
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
        cancel_grace_period_ms: 100,
        ..EngineConfig::default()
    }
}

async fn setup(handlers: Vec<Arc<dyn TaskHandler>>, agents: usize) -> (Arc<WorkflowEngine>, Arc<AgentRuntime>) {
    setup_with(handlers, agents, engine_config()).await
}

async fn setup_with(
    handlers: Vec<Arc<dyn TaskHandler>>,
    agents: usize,
    config: EngineConfig,
) -> (Arc<WorkflowEngine>, Arc<AgentRuntime>) {
    let rt = runtime(handlers);
    for i in 0..agents {
        started_agent(&rt, &format!("agent-{i}"), &[]).await;
    }
    let engine = Arc::new(WorkflowEngine::new(config, Arc::clone(&rt), Arc::new(Coordinator::default())));
    (engine, rt)
}

fn work(id: &str, task_type: &str) -> Node {
    Node::work_item(id, NodeTask::new(task_type, Value::Null))
}

/// ids[0] → ids[1] → … → ids[n-1], all running `task_type`.
fn linear_workflow(ids: &[&str], task_type: &str) -> Workflow {
    let nodes = ids.iter().map(|id| work(id, task_type)).collect();
    let edges = ids.windows(2).map(|w| Edge::new(w[0], w[1])).collect();
    Workflow::new("test-linear", nodes, edges)
}

fn state_of(exec: &WorkflowExecution, node: &str) -> TaskState {
    exec.node(node).unwrap().state
}

fn ok(task_type: &str) -> Arc<dyn TaskHandler> {
    Arc::new(MockHandler::returning(task_type, json!({ "ok": true })))
}

// ============================================================
// Validation
// ============================================================

#[tokio::test]
async fn cyclic_workflow_is_rejected_before_running() {
    let (engine, _rt) = setup(vec![ok("step")], 1).await;
    let mut wf = linear_workflow(&["x", "y", "z"], "step");
    wf.edges.push(Edge::new("z", "x"));

    let err = engine.execute(wf).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkflowCyclic(path) if path.len() == 4));
    assert!(engine.list_executions().is_empty());
}

#[tokio::test]
async fn structural_problems_fail_validation() {
    let (engine, _rt) = setup(vec![ok("step")], 1).await;

    let empty = Workflow::new("empty", vec![], vec![]);
    assert!(matches!(
        engine.execute(empty).await,
        Err(OrchestratorError::WorkflowValidationFailed(_))
    ));

    let mut taskless = work("a", "step");
    taskless.task = None;
    let wf = Workflow::new("taskless", vec![taskless], vec![]);
    assert!(matches!(
        engine.execute(wf).await,
        Err(OrchestratorError::WorkflowValidationFailed(msg)) if msg.contains("no task")
    ));

    let wf = linear_workflow(&["a"], "unregistered");
    assert!(matches!(
        engine.execute(wf).await,
        Err(OrchestratorError::WorkflowValidationFailed(msg)) if msg.contains("unregistered")
    ));

    let wf = Workflow::new("dangling", vec![work("a", "step")], vec![Edge::new("a", "b")]);
    assert!(matches!(
        engine.execute(wf).await,
        Err(OrchestratorError::WorkflowValidationFailed(_))
    ));
}

// ============================================================
// Happy paths
// ============================================================

#[tokio::test]
async fn diamond_runs_batch_by_batch() {
    let events = Arc::new(ChannelPublisher::new(256));
    let mut rx = events.subscribe();
    let rt = runtime(vec![ok("step")]);
    for i in 0..2 {
        started_agent(&rt, &format!("agent-{i}"), &[]).await;
    }
    let engine = Arc::new(
        WorkflowEngine::new(engine_config(), Arc::clone(&rt), Arc::new(Coordinator::default()))
            .with_events(events.clone()),
    );

    let wf = Workflow::new(
        "diamond",
        vec![
            Node::start("start"),
            work("a", "step"),
            work("b", "step"),
            work("d", "step"),
            Node::end("end"),
        ],
        vec![
            Edge::new("start", "a"),
            Edge::new("start", "b"),
            Edge::new("a", "d"),
            Edge::new("b", "d"),
            Edge::new("d", "end"),
        ],
    );

    let exec = engine.execute(wf).await.unwrap().wait().await;
    assert_eq!(exec.status, ExecutionStatus::Completed, "{:?}", exec.error);
    for node in ["start", "a", "b", "d", "end"] {
        assert_eq!(state_of(&exec, node), TaskState::Succeeded, "node {node}");
    }

    // d only starts once both of its dependencies are done.
    let d_started = exec.node("d").unwrap().started_at.unwrap();
    for dep in ["a", "b"] {
        assert!(exec.node(dep).unwrap().completed_at.unwrap() <= d_started);
    }

    // Outputs land in the context under their node id.
    assert_eq!(exec.context["a"]["ok"], json!(true));
    assert_eq!(exec.node("d").unwrap().attempts.len(), 1);
    assert!(exec.node("d").unwrap().agent_id.is_some());

    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let OrchestratorEvent::ExecutionStatusChanged { status, .. } = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![ExecutionStatus::Running, ExecutionStatus::Completed]);
}

#[tokio::test]
async fn workflow_variables_seed_the_context() {
    let (engine, _rt) = setup(vec![ok("step")], 1).await;
    let wf = linear_workflow(&["only"], "step").with_variable("region", json!("eu"));

    let exec = engine.execute(wf).await.unwrap().wait().await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.lookup("region"), Some(&json!("eu")));
    assert_eq!(exec.lookup("only.ok"), Some(&json!(true)));
}

#[tokio::test]
async fn batch_concurrency_is_bounded() {
    let slow = Arc::new(MockHandler::sleeping("slow", Duration::from_millis(300)));
    let config = EngineConfig {
        max_concurrent_tasks_per_batch: 2,
        ..engine_config()
    };
    let (engine, _rt) = setup_with(vec![slow.clone()], 4, config).await;

    let wf = Workflow::new(
        "wide",
        vec![work("a", "slow"), work("b", "slow"), work("c", "slow"), work("d", "slow")],
        vec![],
    );
    let handle = engine.execute(wf).await.unwrap();

    assert!(eventually(|| slow.call_count() == 2).await);
    assert_eq!(slow.call_count(), 2);

    let exec = handle.wait().await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(slow.call_count(), 4);
}

// ============================================================
// Failures
// ============================================================

#[tokio::test]
async fn failure_blocks_dependents_but_not_siblings() {
    let (engine, _rt) = setup(
        vec![ok("step"), Arc::new(MockHandler::failing_fatal("boom", "broke irreparably"))],
        2,
    )
    .await;

    let wf = Workflow::new(
        "branches",
        vec![
            Node::start("start"),
            work("good", "step"),
            work("after_good", "step"),
            work("bad", "boom"),
            work("after_bad", "step"),
        ],
        vec![
            Edge::new("start", "good"),
            Edge::new("good", "after_good"),
            Edge::new("start", "bad"),
            Edge::new("bad", "after_bad"),
        ],
    );

    let exec = engine.execute(wf).await.unwrap().wait().await;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(state_of(&exec, "good"), TaskState::Succeeded);
    assert_eq!(state_of(&exec, "after_good"), TaskState::Succeeded);
    assert_eq!(state_of(&exec, "bad"), TaskState::Failed);
    assert_eq!(state_of(&exec, "after_bad"), TaskState::Cancelled);
    assert!(exec.node("after_bad").unwrap().error.as_ref().unwrap().contains("bad"));

    // Fatal errors are not retried.
    assert_eq!(exec.node("bad").unwrap().attempts.len(), 1);
    assert!(exec.error.unwrap().contains("bad"));
}

#[tokio::test]
async fn continue_on_failure_edge_lets_cleanup_run() {
    let (engine, _rt) = setup(
        vec![ok("step"), Arc::new(MockHandler::failing_fatal("boom", "nope"))],
        1,
    )
    .await;

    let wf = Workflow::new(
        "cleanup",
        vec![work("bad", "boom"), work("cleanup", "step")],
        vec![Edge::new("bad", "cleanup").with_condition(EdgeCondition::ContinueOnFailure)],
    );

    let exec = engine.execute(wf).await.unwrap().wait().await;
    assert_eq!(state_of(&exec, "cleanup"), TaskState::Succeeded);
    assert_eq!(exec.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn retryable_failures_are_retried_and_recorded() {
    let flaky = Arc::new(MockHandler::flaky("flaky", 2, json!({ "done": true })));
    let (engine, _rt) = setup(vec![flaky.clone()], 1).await;

    let exec = engine
        .execute(linear_workflow(&["n"], "flaky"))
        .await
        .unwrap()
        .wait()
        .await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let node = exec.node("n").unwrap();
    assert_eq!(node.state, TaskState::Succeeded);
    let statuses: Vec<TaskStatus> = node.attempts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Failed, TaskStatus::Failed, TaskStatus::Completed]
    );
    let numbers: Vec<u32> = node.attempts.iter().map(|a| a.attempt).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(flaky.call_count(), 3);

    let summary = engine.execution_summary(exec.id).unwrap();
    assert_eq!(summary.retried_nodes, 1);
    assert_eq!(summary.total_retries, 2);
    assert_eq!(summary.progress, 1.0);
    assert_eq!(summary.agents_used, 1);
    assert!(summary.elapsed_ms.is_some());
}

#[tokio::test]
async fn retries_stop_at_the_node_limit() {
    let failing = Arc::new(MockHandler::failing_retryable("flaky", "still broken"));
    let (engine, _rt) = setup(vec![failing.clone()], 1).await;

    let node = Node::work_item("n", NodeTask::new("flaky", Value::Null).with_max_retries(1));
    let exec = engine
        .execute(Workflow::new("limited", vec![node], vec![]))
        .await
        .unwrap()
        .wait()
        .await;

    let record = exec.node("n").unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempts.len(), 2);
    let error = record.error.as_ref().unwrap();
    assert!(error.contains("exhausted 2 attempt(s)"), "{error}");
    assert!(error.contains("still broken"), "{error}");
    assert_eq!(failing.call_count(), 2);
}

#[tokio::test]
async fn no_eligible_agent_counts_as_a_retryable_attempt() {
    let (engine, _rt) = setup(vec![ok("step")], 0).await;

    let node = Node::work_item("n", NodeTask::new("step", Value::Null).with_max_retries(1));
    let exec = engine
        .execute(Workflow::new("stranded", vec![node], vec![]))
        .await
        .unwrap()
        .wait()
        .await;

    let record = exec.node("n").unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempts.len(), 2);
    assert!(record.attempts.iter().all(|a| a.agent_id.is_none()));
    assert!(record.error.as_ref().unwrap().contains("no eligible agent"));
}

// ============================================================
// Decisions
// ============================================================

#[tokio::test]
async fn decision_branches_on_context_values() {
    let (engine, _rt) = setup(
        vec![
            Arc::new(MockHandler::returning("classify", json!({ "label": "spam" }))),
            ok("step"),
        ],
        1,
    )
    .await;

    let is = |label: &str| EdgeCondition::VariableEquals {
        variable: "classify.label".into(),
        equals: json!(label),
    };
    let wf = Workflow::new(
        "triage",
        vec![
            work("classify", "classify"),
            Node::decision("route"),
            work("quarantine", "step"),
            work("deliver", "step"),
            work("notify", "step"),
        ],
        vec![
            Edge::new("classify", "route"),
            Edge::new("route", "quarantine").with_condition(is("spam")),
            Edge::new("route", "deliver").with_condition(is("ham")),
            Edge::new("deliver", "notify"),
        ],
    );

    let exec = engine.execute(wf).await.unwrap().wait().await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(state_of(&exec, "quarantine"), TaskState::Succeeded);
    assert_eq!(state_of(&exec, "deliver"), TaskState::Skipped);
    // Skips propagate down an on_success chain.
    assert_eq!(state_of(&exec, "notify"), TaskState::Skipped);
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn cancel_stops_running_and_pending_nodes() {
    let slow = Arc::new(MockHandler::sleeping("slow", Duration::from_secs(10)));
    let (engine, _rt) = setup(vec![slow.clone(), ok("step")], 1).await;

    let wf = Workflow::new(
        "long",
        vec![work("wait", "slow"), work("after", "step")],
        vec![Edge::new("wait", "after")],
    );
    let handle = engine.execute(wf).await.unwrap();
    let id = handle.execution_id;
    assert!(eventually(|| slow.call_count() == 1).await);

    engine.cancel(id).unwrap();
    let exec = handle.wait().await;

    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(state_of(&exec, "wait"), TaskState::Cancelled);
    assert_eq!(state_of(&exec, "after"), TaskState::Cancelled);
    assert!(eventually(|| slow.cancelled_count() == 1).await);

    // Cancelling a terminal execution is a no-op.
    engine.cancel(id).unwrap();
    assert_eq!(engine.get_execution(id).unwrap().status, ExecutionStatus::Cancelled);

    assert!(matches!(
        engine.cancel(uuid::Uuid::new_v4()),
        Err(OrchestratorError::ExecutionNotFound(_))
    ));
}

/// Cancels the execution from inside the run, right as `node` succeeds.
struct CancelOnSuccess {
    node: &'static str,
    handle: OnceLock<ExecutionHandle>,
}

impl EventPublisher for CancelOnSuccess {
    fn publish(&self, event: OrchestratorEvent) {
        if let OrchestratorEvent::NodeStateChanged {
            node_id,
            state: TaskState::Succeeded,
            ..
        } = &event
        {
            if node_id == self.node {
                if let Some(handle) = self.handle.get() {
                    handle.cancel();
                }
            }
        }
    }
}

#[tokio::test]
async fn cancel_after_the_last_node_keeps_the_run_completed() {
    let slow = Arc::new(MockHandler::sleeping("slow", Duration::from_millis(50)));
    let rt = runtime(vec![slow]);
    started_agent(&rt, "a", &[]).await;
    let canceller = Arc::new(CancelOnSuccess {
        node: "last",
        handle: OnceLock::new(),
    });
    let engine = Arc::new(
        WorkflowEngine::new(engine_config(), rt, Arc::new(Coordinator::default()))
            .with_events(canceller.clone()),
    );

    let handle = engine
        .execute(linear_workflow(&["last"], "slow"))
        .await
        .unwrap();
    canceller.handle.set(handle.clone()).unwrap();
    let exec = handle.wait().await;

    assert_eq!(exec.status, ExecutionStatus::Completed, "{:?}", exec.error);
    assert_eq!(state_of(&exec, "last"), TaskState::Succeeded);
    assert_eq!(exec.error, None);
}

// ============================================================
// Progress, retention and storage
// ============================================================

#[tokio::test]
async fn progress_is_published_after_each_batch() {
    let events = Arc::new(ChannelPublisher::new(64));
    let mut rx = events.subscribe();
    let rt = runtime(vec![ok("step")]);
    started_agent(&rt, "a", &[]).await;
    let engine = Arc::new(
        WorkflowEngine::new(engine_config(), rt, Arc::new(Coordinator::default()))
            .with_events(events.clone()),
    );

    let exec = engine
        .execute(linear_workflow(&["a", "b"], "step"))
        .await
        .unwrap()
        .wait()
        .await;
    assert_eq!(exec.status, ExecutionStatus::Completed);

    let mut progress = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let OrchestratorEvent::ExecutionProgress { progress: p, .. } = event {
            progress.push(p);
        }
    }
    assert_eq!(progress, vec![0.5, 1.0]);
}

#[tokio::test]
async fn finished_executions_are_evicted_but_stay_loadable() {
    let slow = Arc::new(MockHandler::sleeping("slow", Duration::from_secs(10)));
    let (engine, _rt) = setup(vec![ok("step"), slow.clone()], 2).await;

    let done = engine
        .execute(linear_workflow(&["a"], "step"))
        .await
        .unwrap()
        .wait()
        .await;
    let running = engine.execute(linear_workflow(&["wait"], "slow")).await.unwrap();
    assert!(eventually(|| slow.call_count() == 1).await);

    assert_eq!(engine.evict_finished(Duration::from_secs(3_600)), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(engine.evict_finished(Duration::ZERO), 1);

    assert!(matches!(
        engine.get_execution(done.id),
        Err(OrchestratorError::ExecutionNotFound(_))
    ));
    assert_eq!(engine.list_executions().len(), 1);
    let stored = engine.load_execution(done.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);

    running.cancel();
    assert_eq!(running.wait().await.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn slow_storage_does_not_hold_up_batches() {
    let store = Store::new(Arc::new(SlowRepository::new(Duration::from_millis(300))));
    let rt = runtime(vec![ok("step")]);
    started_agent(&rt, "a", &[]).await;
    let engine = Arc::new(
        WorkflowEngine::new(engine_config(), rt, Arc::new(Coordinator::default()))
            .with_store(store.clone()),
    );

    let started = Instant::now();
    let handle = engine
        .execute(linear_workflow(&["a", "b"], "step"))
        .await
        .unwrap();
    let exec = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("batches advance without waiting on storage");
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(started.elapsed() < Duration::from_secs(1));

    // Every write still lands, in order.
    let stored: Vec<WorkflowExecution> = store.load_all(Collection::Executions).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ExecutionStatus::Completed);
}

// ============================================================
// Registered workflows and recovery
// ============================================================

#[tokio::test]
async fn registered_workflow_status_follows_its_execution() {
    let (engine, _rt) = setup(vec![ok("step")], 1).await;

    let id = engine
        .submit_workflow(linear_workflow(&["a", "b"], "step"))
        .await
        .unwrap();
    assert_eq!(engine.get_workflow(id).unwrap().status, WorkflowStatus::Active);

    let exec = engine.execute_by_id(id).await.unwrap().wait().await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.workflow_id, id);
    assert_eq!(engine.get_workflow(id).unwrap().status, WorkflowStatus::Completed);

    engine.set_workflow_status(id, WorkflowStatus::Paused).await.unwrap();
    assert!(matches!(
        engine.execute_by_id(id).await,
        Err(OrchestratorError::Validation(_))
    ));
    assert!(matches!(
        engine.execute_by_id(uuid::Uuid::new_v4()).await,
        Err(OrchestratorError::WorkflowNotFound(_))
    ));
}

#[tokio::test]
async fn recover_marks_interrupted_executions_failed() {
    let store = Store::new(Arc::new(InMemoryRepository::new()));
    let wf = linear_workflow(&["a", "b"], "step");
    let mut interrupted = WorkflowExecution::new(&wf);
    interrupted.status = ExecutionStatus::Running;
    interrupted.nodes[0].state = TaskState::Succeeded;
    interrupted.nodes[1].state = TaskState::Running;
    store.save(Collection::Workflows, wf.id, &wf);
    store.save(Collection::Executions, interrupted.id, &interrupted);

    let rt = runtime(vec![ok("step")]);
    let engine = WorkflowEngine::new(engine_config(), rt, Arc::new(Coordinator::default()))
        .with_store(store.clone());
    assert_eq!(engine.recover().await, 1);

    let exec = engine.get_execution(interrupted.id).unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error.as_deref(), Some("interrupted by restart"));
    assert_eq!(exec.nodes[0].state, TaskState::Succeeded);
    assert_eq!(exec.nodes[1].state, TaskState::Failed);
    assert_eq!(engine.get_workflow(wf.id).unwrap().name, "test-linear");

    // The corrected record was written back.
    let stored: Vec<WorkflowExecution> = store.load_all(Collection::Executions).await;
    assert_eq!(stored[0].status, ExecutionStatus::Failed);
}
