//! Workflow and execution models.
//!
//! A [`Workflow`] is the definition; a [`WorkflowExecution`] is one run of
//! it. Both serialise to the JSON documents kept by the repository.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use queue::{Task, TaskStatus};

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    WorkItem,
    Decision,
    Parallel,
    End,
}

impl NodeType {
    /// Structural nodes complete instantly without dispatching a task.
    pub fn is_structural(self) -> bool {
        !matches!(self, NodeType::WorkItem)
    }
}

/// Task template carried by a `WorkItem` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTask {
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides the engine's `max_retries` for this node.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl NodeTask {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: 0,
            timeout_ms: None,
            max_retries: None,
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Materialise the template as a queue task with a fixed identity.
    pub fn to_task(&self, task_id: Uuid) -> Task {
        let mut task = Task::new(self.task_type.clone(), self.payload.clone())
            .with_id(task_id)
            .with_priority(self.priority)
            .requiring(self.required_capabilities.iter().cloned());
        task.timeout_ms = self.timeout_ms;
        if let Some(max) = self.max_retries {
            task.max_retries = max;
        }
        task
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<NodeTask>,
}

impl Node {
    fn structural(id: impl Into<String>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type,
            task: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::structural(id, NodeType::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::structural(id, NodeType::End)
    }

    pub fn decision(id: impl Into<String>) -> Self {
        Self::structural(id, NodeType::Decision)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::structural(id, NodeType::Parallel)
    }

    pub fn work_item(id: impl Into<String>, task: NodeTask) -> Self {
        Self {
            task: Some(task),
            ..Self::structural(id, NodeType::WorkItem)
        }
    }
}

/// When the target of an edge may run, given the state of its source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    OnSuccess,
    ContinueOnFailure,
    /// Source succeeded and the dotted context path equals `equals`.
    VariableEquals { variable: String, equals: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "source")]
    pub from: String,
    #[serde(alias = "target")]
    pub to: String,
    #[serde(default)]
    pub condition: EdgeCondition,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnSuccess,
        }
    }

    pub fn with_condition(mut self, condition: EdgeCondition) -> Self {
        self.condition = condition;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Workflow {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: default_version(),
            status: WorkflowStatus::Draft,
            nodes,
            edges,
            variables: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One try at running a node's task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttempt {
    pub attempt: u32,
    pub agent_id: Option<Uuid>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub state: TaskState,
    pub agent_id: Option<Uuid>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Append-only.
    pub attempts: Vec<NodeAttempt>,
}

impl NodeRecord {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: TaskState::Pending,
            agent_id: None,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            attempts: Vec::new(),
        }
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        (self.attempts.len() as u32).saturating_sub(1)
    }

    /// Time spent inside attempts, summed. Back-off waits are not counted.
    pub fn busy_time(&self) -> Duration {
        self.attempts
            .iter()
            .map(|a| (a.completed_at - a.started_at).to_std().unwrap_or_default())
            .sum()
    }

    /// Move to a terminal state, stamping the completion time.
    pub fn finish(&mut self, state: TaskState, error: Option<String>) {
        self.state = state;
        if error.is_some() {
            self.error = error;
        }
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    /// In workflow declaration order.
    pub nodes: Vec<NodeRecord>,
    /// Workflow variables plus each succeeded node's output under its id.
    pub context: Map<String, Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(workflow: &Workflow) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            workflow_version: workflow.version,
            status: ExecutionStatus::Pending,
            nodes: workflow.nodes.iter().map(|n| NodeRecord::new(n.id.clone())).collect(),
            context: workflow.variables.clone(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeRecord> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    pub fn node_state(&self, node_id: &str) -> TaskState {
        self.node(node_id).map(|n| n.state).unwrap_or_default()
    }

    /// Resolve a dotted path such as `classify.label` against the context.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let head = self.context.get(parts.next()?)?;
        let pointer: String = parts.map(|p| format!("/{p}")).collect();
        if pointer.is_empty() {
            Some(head)
        } else {
            head.pointer(&pointer)
        }
    }

    /// Share of nodes in a terminal state, from 0.0 to 1.0.
    pub fn progress(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let done = self.nodes.iter().filter(|n| n.state.is_terminal()).count();
        done as f64 / self.nodes.len() as f64
    }

    /// Start to completion, or start to now while still running.
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        let until = self.completed_at.unwrap_or_else(Utc::now);
        Some((until - started).to_std().unwrap_or_default())
    }

    pub fn summary(&self) -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            execution_id: self.id,
            status: self.status,
            total: self.nodes.len(),
            progress: self.progress(),
            elapsed_ms: self.elapsed().map(|d| d.as_millis() as u64),
            ..ExecutionSummary::default()
        };
        let mut attempted = 0u64;
        let mut agents = HashSet::new();
        for node in &self.nodes {
            match node.state {
                TaskState::Pending | TaskState::Running => summary.pending += 1,
                TaskState::Succeeded => summary.succeeded += 1,
                TaskState::Failed => summary.failed += 1,
                TaskState::Cancelled => summary.cancelled += 1,
                TaskState::Skipped => summary.skipped += 1,
            }
            if node.retries() > 0 {
                summary.retried_nodes += 1;
                summary.total_retries += node.retries();
            }
            if !node.attempts.is_empty() {
                attempted += 1;
                summary.total_task_time_ms += node.busy_time().as_millis() as u64;
            }
            agents.extend(node.attempts.iter().filter_map(|a| a.agent_id));
        }
        if attempted > 0 {
            summary.average_task_time_ms = summary.total_task_time_ms / attempted;
        }
        summary.agents_used = agents.len();
        summary
    }
}

/// Counts, progress and timing for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub pending: usize,
    pub progress: f64,
    /// Nodes that needed more than one attempt.
    pub retried_nodes: usize,
    pub total_retries: u32,
    /// Time spent in handler attempts, across all nodes.
    pub total_task_time_ms: u64,
    /// Per node that made at least one attempt.
    pub average_task_time_ms: u64,
    pub elapsed_ms: Option<u64>,
    pub agents_used: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_json_accepts_source_target_aliases() {
        let raw = json!({
            "name": "ingest",
            "nodes": [
                { "id": "start", "node_type": "start" },
                { "id": "fetch", "node_type": "work_item", "task": { "task_type": "echo" } }
            ],
            "edges": [ { "source": "start", "target": "fetch" } ]
        });
        let workflow: Workflow = serde_json::from_value(raw).unwrap();
        assert_eq!(workflow.version, 1);
        assert_eq!(workflow.status, WorkflowStatus::Draft);
        assert_eq!(workflow.edges[0].from, "start");
        assert_eq!(workflow.edges[0].condition, EdgeCondition::OnSuccess);
        assert_eq!(workflow.nodes[1].task.as_ref().unwrap().payload, Value::Null);
    }

    #[test]
    fn edge_condition_is_tagged() {
        let edge: Edge = serde_json::from_value(json!({
            "from": "check",
            "to": "ship",
            "condition": { "type": "variable_equals", "variable": "check.ok", "equals": true }
        }))
        .unwrap();
        assert_eq!(
            edge.condition,
            EdgeCondition::VariableEquals {
                variable: "check.ok".into(),
                equals: json!(true)
            }
        );
    }

    #[test]
    fn context_lookup_follows_dotted_paths() {
        let workflow = Workflow::new("w", vec![Node::start("s")], vec![])
            .with_variable("env", json!("prod"));
        let mut exec = WorkflowExecution::new(&workflow);
        exec.context
            .insert("classify".into(), json!({ "label": "spam", "scores": [0.1, 0.9] }));

        assert_eq!(exec.lookup("env"), Some(&json!("prod")));
        assert_eq!(exec.lookup("classify.label"), Some(&json!("spam")));
        assert_eq!(exec.lookup("classify.scores.1"), Some(&json!(0.9)));
        assert_eq!(exec.lookup("classify.missing"), None);
        assert_eq!(exec.lookup("nope"), None);
    }

    #[test]
    fn node_task_becomes_queue_task() {
        let id = Uuid::new_v4();
        let task = NodeTask::new("render", json!({ "page": 3 }))
            .with_priority(7)
            .with_timeout(Duration::from_millis(1500))
            .with_max_retries(1)
            .requiring(["gpu"])
            .to_task(id);
        assert_eq!(task.id, id);
        assert_eq!(task.priority, 7);
        assert_eq!(task.timeout_ms, Some(1500));
        assert_eq!(task.max_retries, 1);
        assert_eq!(task.required_capabilities, vec!["gpu".to_string()]);
    }

    #[test]
    fn summary_counts_node_states() {
        let workflow = Workflow::new(
            "w",
            vec![Node::start("a"), Node::end("b"), Node::end("c")],
            vec![],
        );
        let mut exec = WorkflowExecution::new(&workflow);
        exec.node_mut("a").unwrap().finish(TaskState::Succeeded, None);
        exec.node_mut("b").unwrap().finish(TaskState::Skipped, None);

        let summary = exec.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pending, 1);
        assert!((summary.progress - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(summary.elapsed_ms, None);
    }

    #[test]
    fn summary_totals_retries_and_attempt_time() {
        let workflow = Workflow::new("w", vec![Node::end("a"), Node::end("b")], vec![]);
        let mut exec = WorkflowExecution::new(&workflow);
        let t0 = Utc::now();
        exec.started_at = Some(t0);
        exec.completed_at = Some(t0 + chrono::Duration::milliseconds(500));
        let agent = Uuid::new_v4();
        let attempt = |n: u32, from_ms: i64, to_ms: i64, status: TaskStatus| NodeAttempt {
            attempt: n,
            agent_id: Some(agent),
            status,
            error: None,
            started_at: t0 + chrono::Duration::milliseconds(from_ms),
            completed_at: t0 + chrono::Duration::milliseconds(to_ms),
        };

        let a = exec.node_mut("a").unwrap();
        a.attempts.push(attempt(1, 0, 100, TaskStatus::Failed));
        a.attempts.push(attempt(2, 150, 250, TaskStatus::Failed));
        a.attempts.push(attempt(3, 300, 400, TaskStatus::Completed));
        a.finish(TaskState::Succeeded, None);
        let b = exec.node_mut("b").unwrap();
        b.attempts.push(attempt(1, 0, 200, TaskStatus::Completed));
        b.finish(TaskState::Succeeded, None);

        assert_eq!(exec.node("a").unwrap().retries(), 2);
        assert_eq!(exec.node("a").unwrap().busy_time(), Duration::from_millis(300));

        let summary = exec.summary();
        assert_eq!(summary.progress, 1.0);
        assert_eq!(summary.retried_nodes, 1);
        assert_eq!(summary.total_retries, 2);
        assert_eq!(summary.total_task_time_ms, 500);
        assert_eq!(summary.average_task_time_ms, 250);
        assert_eq!(summary.elapsed_ms, Some(500));
        assert_eq!(summary.agents_used, 1);
    }
}
