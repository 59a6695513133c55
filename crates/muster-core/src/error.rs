use thiserror::Error;

/// A convenience `Result` alias using [`MusterError`].
pub type MusterResult<T> = Result<T, MusterError>;

/// Top-level error type for the Muster orchestration core.
///
/// Identifier collisions and validation errors are returned synchronously to
/// the caller. [`MusterError::QueueFull`] and [`MusterError::ResourceTimeout`]
/// are transient and retryable by the caller with backoff; the core never
/// retries them silently.
#[derive(Debug, Error)]
pub enum MusterError {
    /// An agent with this identifier is already registered.
    #[error("agent '{0}' is already registered")]
    DuplicateAgent(String),

    /// A task with this identifier was already submitted.
    #[error("task '{0}' was already submitted")]
    DuplicateTask(String),

    /// No agent with this identifier is registered.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    /// No task with this identifier exists.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// No resource with this identifier was declared.
    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    /// A resource request for zero units or for more than total capacity.
    #[error("invalid amount {amount} for resource '{resource}' (capacity {capacity})")]
    InvalidAmount {
        /// Resource identifier.
        resource: String,
        /// Requested amount.
        amount: u64,
        /// Total capacity of the resource.
        capacity: u64,
    },

    /// A release of more units than the holder currently holds.
    #[error("holder '{holder}' released {amount} of '{resource}' but holds {held}")]
    OverRelease {
        /// Holder identifier.
        holder: String,
        /// Resource identifier.
        resource: String,
        /// Amount the caller tried to release.
        amount: u64,
        /// Amount actually held.
        held: u64,
    },

    /// A pending resource request waited past its timeout.
    #[error("resource request for '{0}' timed out")]
    ResourceTimeout(String),

    /// The recipient's mailbox is saturated and the overflow policy rejects.
    #[error("mailbox for '{0}' is full")]
    QueueFull(String),

    /// A task missed its deadline while queued or assigned.
    #[error("task '{0}' missed its deadline")]
    DeadlineExceeded(String),

    /// A proposal's declared claims overlap an already-accepted proposal.
    #[error("proposal by '{agent}' for task '{task}' conflicts on claim '{claim}'")]
    ProposalConflict {
        /// Proposing agent.
        agent: String,
        /// Task the proposal belongs to.
        task: String,
        /// First overlapping claim identifier.
        claim: String,
    },

    /// Capable agents exist but none was available within the retry budget.
    #[error("no eligible agent for task '{0}'")]
    AgentUnavailable(String),

    /// No registered agent advertises the task's required capabilities.
    #[error("no registered agent satisfies the capabilities required by task '{0}'")]
    CapabilityMismatch(String),

    /// A status change outside the task state machine.
    #[error("task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task identifier.
        task: String,
        /// Current status label.
        from: &'static str,
        /// Requested status label.
        to: &'static str,
    },

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MusterError {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MusterError::QueueFull(_)
                | MusterError::ResourceTimeout(_)
                | MusterError::AgentUnavailable(_)
        )
    }
}
