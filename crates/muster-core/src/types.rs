use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A named, versioned contract an agent can fulfill.
///
/// Capabilities are declared at configuration time; agents advertise which
/// contracts they satisfy rather than generating new behavior at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    /// Contract name, e.g. `"vision.defect-check"`.
    pub name: String,
    /// Contract version. An advertised capability satisfies any required
    /// version less than or equal to its own.
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl Capability {
    /// Creates a capability with the given name and version.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Whether this advertised capability satisfies `required`.
    pub fn satisfies(&self, required: &Capability) -> bool {
        self.name == required.name && self.version >= required.version
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Liveness/availability state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered, alive, and free for assignment.
    Idle,
    /// Currently working on an assigned task.
    Busy,
    /// Heartbeat silence exceeded the timeout; out of rotation.
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Registration request for a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Caller-supplied identifier. Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Capability contracts the agent advertises.
    pub capabilities: Vec<Capability>,
}

/// A registered agent record, owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier.
    pub id: String,
    /// Advertised capability set.
    pub capabilities: Vec<Capability>,
    /// Current availability state.
    pub status: AgentStatus,
    /// Timestamp of the most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Timestamp of the most recent task assignment, for load spreading.
    pub last_assigned: Option<DateTime<Utc>>,
}

impl Agent {
    /// Creates an idle agent with a fresh heartbeat.
    pub fn new(id: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            status: AgentStatus::Idle,
            last_heartbeat: Utc::now(),
            last_assigned: None,
        }
    }

    /// Whether this agent's capability set satisfies every requirement.
    pub fn can_run(&self, required: &[Capability]) -> bool {
        required
            .iter()
            .all(|req| self.capabilities.iter().any(|cap| cap.satisfies(req)))
    }
}

/// Lifecycle state of a task.
///
/// Valid paths: `Queued → Assigned → Running → {Completed | Failed}`, with
/// `Queued`/`Assigned` also cancellable and `Assigned`/`Running` returnable
/// to `Queued` (offline reclaim, proposal conflict). `Completed`, `Failed`,
/// and `Cancelled` are terminal and immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the priority queue.
    Queued,
    /// Matched to an agent, not yet acknowledged as started.
    Assigned,
    /// The assigned agent reported it is executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// Explicitly cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// Short label for logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition(&self, next: &TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Queued, TaskStatus::Assigned)
            | (TaskStatus::Queued, TaskStatus::Cancelled)
            | (TaskStatus::Queued, TaskStatus::Failed { .. })
            | (TaskStatus::Assigned, TaskStatus::Running)
            | (TaskStatus::Assigned, TaskStatus::Queued)
            | (TaskStatus::Assigned, TaskStatus::Cancelled)
            | (TaskStatus::Assigned, TaskStatus::Failed { .. })
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed { .. })
            | (TaskStatus::Running, TaskStatus::Queued) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Submission request for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-supplied identifier. Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Capabilities an agent must advertise to be eligible. A task with no
    /// requirements can run on any agent.
    #[serde(default)]
    pub required: Vec<Capability>,
    /// Scheduling priority; higher values are served first.
    #[serde(default)]
    pub priority: u8,
    /// Optional hard deadline; expiry while queued or assigned fails the task.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Opaque work description handed to the assigned agent.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A unit of work, owned by the scheduler.
///
/// `assigned_to` is a weak back-reference: an identifier resolved through
/// the registry, never an owning handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Required capability set.
    pub required: Vec<Capability>,
    /// Scheduling priority; higher values are served first.
    pub priority: u8,
    /// Optional hard deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Opaque work description.
    pub payload: serde_json::Value,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Identifier of the agent the task is assigned to, if any.
    pub assigned_to: Option<String>,
    /// Result reported by the executing agent on completion.
    pub result: Option<serde_json::Value>,
    /// Submission timestamp; FIFO tie-break within a priority level.
    pub submitted_at: DateTime<Utc>,
    /// Timestamp of reaching a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Scheduling passes in which no eligible agent was found.
    #[serde(default)]
    pub unavailable_attempts: u32,
}

impl Task {
    /// Creates a queued task from a submission spec, generating an
    /// identifier when the caller supplied none.
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            required: spec.required,
            priority: spec.priority,
            deadline: spec.deadline,
            payload: spec.payload,
            status: TaskStatus::Queued,
            assigned_to: None,
            result: None,
            submitted_at: Utc::now(),
            completed_at: None,
            unavailable_attempts: 0,
        }
    }

    /// Whether the deadline has passed relative to `now`.
    pub fn deadline_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// An agent's candidate effect for a task, subject to conflict resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposal {
    /// Proposing agent.
    pub agent_id: String,
    /// Task the proposal belongs to.
    pub task_id: String,
    /// Priority of that task; the primary conflict-resolution key.
    /// Overwritten from the task record on submission, never trusted.
    #[serde(default)]
    pub priority: u8,
    /// Resource/claim identifiers the proposed effect touches.
    pub claims: BTreeSet<String>,
    /// Opaque proposed effect.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Submission timestamp; the secondary ordering key.
    #[serde(default = "Utc::now")]
    pub proposed_at: DateTime<Utc>,
}

impl ActionProposal {
    /// Creates a proposal timestamped now.
    pub fn new(
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
        priority: u8,
        claims: impl IntoIterator<Item = String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            priority,
            claims: claims.into_iter().collect(),
            payload,
            proposed_at: Utc::now(),
        }
    }
}

/// A single observed metric value pushed to the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Component that produced the sample, e.g. `"scheduler"`.
    pub component: String,
    /// Metric name, e.g. `"queue_depth"`.
    pub name: String,
    /// Observed value.
    pub value: f64,
    /// Observation timestamp.
    pub recorded_at: DateTime<Utc>,
}

impl MetricSample {
    /// Creates a sample timestamped now.
    pub fn new(component: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            component: component.into(),
            name: name.into(),
            value,
            recorded_at: Utc::now(),
        }
    }
}
