use chrono::{DateTime, Utc};
use muster_core::{MusterError, MusterResult, Task, TaskSpec, TaskStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Outcome of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was queued or assigned and is now cancelled.
    Cancelled {
        /// Agent whose assignment the cancellation revoked, if any.
        /// Captured under the same lock that flips the task state, so it
        /// is exact even against a concurrent scheduling pass.
        agent_id: Option<String>,
    },
    /// The task is running; cancellation is advisory and the executing
    /// agent is responsible for honoring it.
    Advisory {
        /// Agent currently executing the task.
        agent_id: Option<String>,
    },
    /// The task was already terminal; nothing changed.
    AlreadyTerminal,
}

/// Maintains the task table, enforces the task state machine, and orders
/// queued tasks for assignment.
///
/// The scheduler exclusively owns [`Task`] records. All mutations go through
/// its serialized entry points; reads are snapshots of the latest completed
/// mutation.
pub struct TaskScheduler {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Submits a task and returns its identifier.
    ///
    /// Reusing an identifier fails with [`MusterError::DuplicateTask`] and
    /// leaves the existing task untouched.
    pub async fn submit(&self, spec: TaskSpec) -> MusterResult<String> {
        let task = Task::from_spec(spec);
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(MusterError::DuplicateTask(task.id));
        }
        let id = task.id.clone();
        tracing::info!(task_id = %id, priority = task.priority, "Task submitted");
        tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Current record for a task.
    pub async fn status(&self, id: &str) -> MusterResult<Task> {
        let tasks = self.tasks.read().await;
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| MusterError::UnknownTask(id.to_string()))
    }

    /// Cancels a task. Immediate while queued or assigned, advisory while
    /// running, a no-op once terminal.
    pub async fn cancel(&self, id: &str) -> MusterResult<CancelOutcome> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownTask(id.to_string()))?;
        match task.status {
            TaskStatus::Queued | TaskStatus::Assigned => {
                let agent_id = task.assigned_to.take();
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                tracing::info!(task_id = %id, "Task cancelled");
                Ok(CancelOutcome::Cancelled { agent_id })
            }
            TaskStatus::Running => Ok(CancelOutcome::Advisory {
                agent_id: task.assigned_to.clone(),
            }),
            _ => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    fn apply(task: &mut Task, next: TaskStatus) -> MusterResult<()> {
        if !task.status.can_transition(&next) {
            return Err(MusterError::InvalidTransition {
                task: task.id.clone(),
                from: task.status.label(),
                to: next.label(),
            });
        }
        if next.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        task.status = next;
        Ok(())
    }

    /// Moves a queued task to assigned, recording the agent reference.
    pub async fn mark_assigned(&self, id: &str, agent_id: &str) -> MusterResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownTask(id.to_string()))?;
        Self::apply(task, TaskStatus::Assigned)?;
        task.assigned_to = Some(agent_id.to_string());
        task.unavailable_attempts = 0;
        Ok(())
    }

    /// Records that the assigned agent started executing.
    pub async fn mark_running(&self, id: &str) -> MusterResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownTask(id.to_string()))?;
        Self::apply(task, TaskStatus::Running)
    }

    /// Completes a running task with its result.
    pub async fn complete(&self, id: &str, result: serde_json::Value) -> MusterResult<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownTask(id.to_string()))?;
        Self::apply(task, TaskStatus::Completed)?;
        task.result = Some(result);
        tracing::info!(task_id = %id, "Task completed");
        Ok(task.clone())
    }

    /// Fails a task with a reason.
    pub async fn fail(&self, id: &str, reason: impl Into<String>) -> MusterResult<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownTask(id.to_string()))?;
        let reason = reason.into();
        Self::apply(task, TaskStatus::Failed { reason: reason.clone() })?;
        tracing::warn!(task_id = %id, %reason, "Task failed");
        Ok(task.clone())
    }

    /// Returns an assigned or running task to the queue for reassignment.
    pub async fn requeue(&self, id: &str) -> MusterResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownTask(id.to_string()))?;
        Self::apply(task, TaskStatus::Queued)?;
        task.assigned_to = None;
        tracing::info!(task_id = %id, "Task requeued");
        Ok(())
    }

    /// Requeues every task assigned to `agent_id`, returning the task
    /// identifiers reclaimed. Used when an agent goes offline.
    pub async fn reclaim_for_agent(&self, agent_id: &str) -> Vec<String> {
        let mut tasks = self.tasks.write().await;
        let mut reclaimed = Vec::new();
        for task in tasks.values_mut() {
            if task.assigned_to.as_deref() == Some(agent_id)
                && matches!(task.status, TaskStatus::Assigned | TaskStatus::Running)
            {
                task.status = TaskStatus::Queued;
                task.assigned_to = None;
                reclaimed.push(task.id.clone());
            }
        }
        reclaimed.sort();
        for id in &reclaimed {
            tracing::warn!(task_id = %id, agent_id, "Task reclaimed from offline agent");
        }
        reclaimed
    }

    /// Fails queued and assigned tasks whose deadline has passed, returning
    /// the newly-failed records.
    pub async fn expire_deadlines(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut tasks = self.tasks.write().await;
        let mut expired = Vec::new();
        for task in tasks.values_mut() {
            if matches!(task.status, TaskStatus::Queued | TaskStatus::Assigned)
                && task.deadline_expired(now)
            {
                task.status = TaskStatus::Failed {
                    reason: "deadline exceeded".to_string(),
                };
                task.completed_at = Some(now);
                expired.push(task.clone());
            }
        }
        expired.sort_by(|a, b| a.id.cmp(&b.id));
        for task in &expired {
            tracing::warn!(task_id = %task.id, "Task missed its deadline");
        }
        expired
    }

    /// Queued tasks in assignment order: priority descending, then
    /// submission time ascending, then identifier.
    pub async fn queued_in_order(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut queued: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.submitted_at.cmp(&b.submitted_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        queued
    }

    /// Notes a scheduling pass in which no eligible agent was found for a
    /// queued task. Past `budget` passes the task fails terminally:
    /// with a capability mismatch when no registered agent advertises the
    /// required set at all, otherwise as agent exhaustion. Returns the
    /// terminal error when one was applied.
    pub async fn note_unavailable(
        &self,
        id: &str,
        capable_exists: bool,
        budget: u32,
    ) -> MusterResult<Option<MusterError>> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| MusterError::UnknownTask(id.to_string()))?;
        if task.status != TaskStatus::Queued {
            return Ok(None);
        }
        task.unavailable_attempts += 1;
        if task.unavailable_attempts <= budget {
            return Ok(None);
        }
        let err = if capable_exists {
            MusterError::AgentUnavailable(id.to_string())
        } else {
            MusterError::CapabilityMismatch(id.to_string())
        };
        task.status = TaskStatus::Failed {
            reason: err.to_string(),
        };
        task.completed_at = Some(Utc::now());
        tracing::warn!(task_id = %id, error = %err, "Task failed: retry budget exhausted");
        Ok(Some(err))
    }

    /// Number of queued tasks.
    pub async fn queued_count(&self) -> usize {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count()
    }

    /// Total number of tasks, in any state.
    pub async fn total_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// All task records ordered by submission time, for persistence.
    pub async fn snapshot(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    /// Repopulates the table from persisted records. Assigned and running
    /// tasks return to the queue: their in-flight work is assumed lost.
    pub async fn restore(&self, records: Vec<Task>) {
        let mut tasks = self.tasks.write().await;
        tasks.clear();
        for mut task in records {
            if matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
                task.status = TaskStatus::Queued;
                task.assigned_to = None;
            }
            tasks.insert(task.id.clone(), task);
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use muster_core::Capability;

    fn spec(id: &str, priority: u8) -> TaskSpec {
        TaskSpec {
            id: Some(id.to_string()),
            required: vec![Capability::new("weld", 1)],
            priority,
            deadline: None,
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_submit_and_duplicate_is_not_mutating() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        scheduler.mark_assigned("t-1", "a-1").await.unwrap();

        let err = scheduler.submit(spec("t-1", 9)).await.unwrap_err();
        assert!(matches!(err, MusterError::DuplicateTask(_)));

        // The original record is untouched.
        let task = scheduler.status("t-1").await.unwrap();
        assert_eq!(task.priority, 5);
        assert_eq!(task.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        scheduler.mark_assigned("t-1", "a-1").await.unwrap();
        scheduler.mark_running("t-1").await.unwrap();
        let task = scheduler
            .complete("t-1", serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();

        // Queued → Running skips assignment.
        let err = scheduler.mark_running("t-1").await.unwrap_err();
        assert!(matches!(err, MusterError::InvalidTransition { .. }));

        // Queued → Completed skips everything.
        let err = scheduler
            .complete("t-1", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, MusterError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_terminal_states_are_immutable() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        scheduler.cancel("t-1").await.unwrap();

        assert!(scheduler.mark_assigned("t-1", "a-1").await.is_err());
        assert!(scheduler.fail("t-1", "late").await.is_err());
        assert!(scheduler.requeue("t-1").await.is_err());
        assert_eq!(
            scheduler.cancel("t-1").await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn test_cancel_assigned_reports_holding_agent() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        scheduler.mark_assigned("t-1", "a-1").await.unwrap();

        let outcome = scheduler.cancel("t-1").await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::Cancelled {
                agent_id: Some("a-1".to_string())
            }
        );
        let task = scheduler.status("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_cancel_queued_has_no_holder() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        assert_eq!(
            scheduler.cancel("t-1").await.unwrap(),
            CancelOutcome::Cancelled { agent_id: None }
        );
    }

    #[tokio::test]
    async fn test_cancel_running_is_advisory() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        scheduler.mark_assigned("t-1", "a-1").await.unwrap();
        scheduler.mark_running("t-1").await.unwrap();

        let outcome = scheduler.cancel("t-1").await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::Advisory {
                agent_id: Some("a-1".to_string())
            }
        );
        // Status did not change; the agent decides.
        assert_eq!(
            scheduler.status("t-1").await.unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_queue_order_priority_then_fifo() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        scheduler.submit(spec("t-2", 9)).await.unwrap();
        scheduler.submit(spec("t-3", 5)).await.unwrap();

        let order: Vec<String> = scheduler
            .queued_in_order()
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec!["t-2", "t-1", "t-3"]);
    }

    #[tokio::test]
    async fn test_reclaim_for_agent() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        scheduler.submit(spec("t-2", 5)).await.unwrap();
        scheduler.mark_assigned("t-1", "a-1").await.unwrap();
        scheduler.mark_assigned("t-2", "a-2").await.unwrap();
        scheduler.mark_running("t-2").await.unwrap();

        let reclaimed = scheduler.reclaim_for_agent("a-1").await;
        assert_eq!(reclaimed, vec!["t-1".to_string()]);
        let task = scheduler.status("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_expire_deadlines() {
        let scheduler = TaskScheduler::new();
        let mut expired_spec = spec("t-1", 5);
        expired_spec.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        scheduler.submit(expired_spec).await.unwrap();
        scheduler.submit(spec("t-2", 5)).await.unwrap();

        let expired = scheduler.expire_deadlines(Utc::now()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "t-1");
        assert!(matches!(
            scheduler.status("t-1").await.unwrap().status,
            TaskStatus::Failed { .. }
        ));
        assert_eq!(
            scheduler.status("t-2").await.unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_unavailable_budget_exhaustion() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();

        assert!(scheduler
            .note_unavailable("t-1", true, 2)
            .await
            .unwrap()
            .is_none());
        assert!(scheduler
            .note_unavailable("t-1", true, 2)
            .await
            .unwrap()
            .is_none());
        let err = scheduler
            .note_unavailable("t-1", true, 2)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, MusterError::AgentUnavailable(_)));
        assert!(scheduler.status("t-1").await.unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn test_unavailable_capability_mismatch() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        let err = scheduler
            .note_unavailable("t-1", false, 0)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, MusterError::CapabilityMismatch(_)));
    }

    #[tokio::test]
    async fn test_restore_resets_in_flight_tasks() {
        let scheduler = TaskScheduler::new();
        scheduler.submit(spec("t-1", 5)).await.unwrap();
        scheduler.submit(spec("t-2", 5)).await.unwrap();
        scheduler.mark_assigned("t-1", "a-1").await.unwrap();
        scheduler.mark_running("t-1").await.unwrap();
        scheduler.cancel("t-2").await.unwrap();

        let records = scheduler.snapshot().await;
        let restored = TaskScheduler::new();
        restored.restore(records).await;

        let t1 = restored.status("t-1").await.unwrap();
        assert_eq!(t1.status, TaskStatus::Queued);
        assert!(t1.assigned_to.is_none());
        // Terminal states survive a restart untouched.
        assert_eq!(
            restored.status("t-2").await.unwrap().status,
            TaskStatus::Cancelled
        );
    }
}
