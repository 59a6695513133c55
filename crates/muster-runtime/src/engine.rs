use crate::broker::MessageBroker;
use crate::config::RuntimeConfig;
use crate::coordinator::Coordinator;
use crate::monitor::{Alert, Monitor};
use crate::registry::AgentRegistry;
use crate::resources::ResourceManager;
use crate::scheduler::{CancelOutcome, TaskScheduler};
use crate::snapshot::Snapshot;
use chrono::Utc;
use muster_core::{
    ActionProposal, AgentSpec, Envelope, MetricSample, MusterResult, Task, TaskSpec,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The orchestration engine.
///
/// Owns every component behind an `Arc`, injected at construction — there is
/// no ambient global state. Runs three background loops: the scheduling pass,
/// the liveness sweep, and the reconciliation window tick. External callers
/// (the gateway, in-process agents in tests) drive it through the methods
/// below; each loop body is also callable directly for deterministic tests.
pub struct Engine {
    config: RuntimeConfig,
    registry: Arc<AgentRegistry>,
    scheduler: Arc<TaskScheduler>,
    broker: Arc<MessageBroker>,
    resources: Arc<ResourceManager>,
    coordinator: Arc<Coordinator>,
    monitor: Arc<Monitor>,
    actions: broadcast::Sender<Vec<ActionProposal>>,
    kick: Notify,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    /// Builds an engine from configuration, declaring the configured
    /// resources and installing the configured threshold rules.
    pub async fn new(config: RuntimeConfig) -> MusterResult<Self> {
        let resources = Arc::new(ResourceManager::new(config.promotion_after()));
        for decl in &config.resources {
            resources
                .declare(decl.id.clone(), decl.kind.clone(), decl.capacity)
                .await?;
        }
        let monitor = Arc::new(Monitor::new(config.rules.clone()));
        let broker = Arc::new(MessageBroker::new(
            config.mailbox_capacity,
            config.overflow_policy,
        ));
        let (actions, _) = broadcast::channel(32);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            registry: Arc::new(AgentRegistry::new()),
            scheduler: Arc::new(TaskScheduler::new()),
            broker,
            resources,
            coordinator: Arc::new(Coordinator::new()),
            monitor,
            actions,
            kick: Notify::new(),
            shutdown,
        })
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The task scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// The message broker.
    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    /// The resource manager.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// The monitor.
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // --- task surface ---

    /// Submits a task and kicks a scheduling pass.
    pub async fn submit_task(&self, spec: TaskSpec) -> MusterResult<String> {
        let id = self.scheduler.submit(spec).await?;
        self.monitor
            .record(MetricSample::new(
                "scheduler",
                "queue_depth",
                self.scheduler.queued_count().await as f64,
            ))
            .await;
        self.kick.notify_one();
        Ok(id)
    }

    /// Current record for a task.
    pub async fn task_status(&self, id: &str) -> MusterResult<Task> {
        self.scheduler.status(id).await
    }

    /// Cancels a task. A running task only gets an advisory signal; the
    /// executing agent decides whether to honor it.
    pub async fn cancel_task(&self, id: &str) -> MusterResult<CancelOutcome> {
        // The revoked agent comes out of the cancellation itself, never a
        // separate status read: a scheduling pass may assign the task
        // between two lock acquisitions.
        let outcome = self.scheduler.cancel(id).await?;
        match &outcome {
            CancelOutcome::Cancelled { agent_id } => {
                if let Some(agent_id) = agent_id {
                    // The agent was holding an assignment that no longer exists.
                    let _ = self.registry.mark(agent_id, muster_core::AgentStatus::Idle).await;
                    self.notify_agent(agent_id, "task.cancel", id).await;
                }
                self.kick.notify_one();
            }
            CancelOutcome::Advisory {
                agent_id: Some(agent_id),
            } => {
                self.notify_agent(agent_id, "task.cancel", id).await;
            }
            CancelOutcome::Advisory { agent_id: None } | CancelOutcome::AlreadyTerminal => {}
        }
        Ok(outcome)
    }

    // --- agent surface ---

    /// Registers an agent; a new agent may unblock queued tasks.
    pub async fn register_agent(&self, spec: AgentSpec) -> MusterResult<String> {
        let id = self.registry.register(spec).await?;
        self.kick.notify_one();
        Ok(id)
    }

    /// Deregisters an agent, closing its mailbox and requeuing its tasks.
    pub async fn deregister_agent(&self, id: &str) -> MusterResult<()> {
        self.registry.deregister(id).await?;
        self.broker.unsubscribe(id).await;
        let reclaimed = self.scheduler.reclaim_for_agent(id).await;
        if !reclaimed.is_empty() {
            self.kick.notify_one();
        }
        Ok(())
    }

    /// Records an agent liveness signal.
    pub async fn heartbeat(&self, id: &str) -> MusterResult<()> {
        self.registry.heartbeat(id).await?;
        self.kick.notify_one();
        Ok(())
    }

    /// Opens the mailbox for a registered agent and returns its receiving
    /// end; assignment and cancellation notifications arrive there.
    pub async fn attach_agent(&self, id: &str) -> MusterResult<mpsc::Receiver<Envelope>> {
        if self.registry.get(id).await.is_none() {
            return Err(muster_core::MusterError::UnknownAgent(id.to_string()));
        }
        Ok(self.broker.subscribe(id).await)
    }

    /// The assigned agent reports it started executing.
    pub async fn report_started(&self, task_id: &str) -> MusterResult<()> {
        self.scheduler.mark_running(task_id).await
    }

    /// The assigned agent reports successful completion.
    pub async fn report_completed(
        &self,
        task_id: &str,
        result: serde_json::Value,
    ) -> MusterResult<()> {
        let task = self.scheduler.complete(task_id, result).await?;
        self.finish_assignment(&task).await;
        Ok(())
    }

    /// The assigned agent reports failure.
    pub async fn report_failed(&self, task_id: &str, reason: &str) -> MusterResult<()> {
        let task = self.scheduler.fail(task_id, reason).await?;
        self.finish_assignment(&task).await;
        Ok(())
    }

    async fn finish_assignment(&self, task: &Task) {
        if let Some(agent_id) = &task.assigned_to {
            let _ = self
                .registry
                .mark(agent_id, muster_core::AgentStatus::Idle)
                .await;
        }
        if let Some(done) = task.completed_at {
            let latency = (done - task.submitted_at).num_milliseconds().max(0);
            self.monitor
                .record(MetricSample::new(
                    "scheduler",
                    "task_latency_ms",
                    latency as f64,
                ))
                .await;
        }
        self.kick.notify_one();
    }

    // --- coordination surface ---

    /// Submits an action proposal into the current reconciliation window.
    /// The proposal's priority is taken from its task's record, not trusted
    /// from the caller.
    pub async fn submit_proposal(&self, mut proposal: ActionProposal) -> MusterResult<()> {
        let task = self.scheduler.status(&proposal.task_id).await?;
        proposal.priority = task.priority;
        self.coordinator.submit(proposal).await;
        Ok(())
    }

    /// Subscribes to the conflict-free action sets emitted per window.
    pub fn subscribe_actions(&self) -> broadcast::Receiver<Vec<ActionProposal>> {
        self.actions.subscribe()
    }

    /// Subscribes to alert events.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.monitor.subscribe()
    }

    // --- resource surface ---

    /// Requests resource units on behalf of a holder; may suspend until
    /// capacity frees or `timeout` elapses.
    pub async fn request_resource(
        &self,
        holder: &str,
        resource: &str,
        amount: u64,
        priority: u8,
        timeout: Duration,
    ) -> MusterResult<()> {
        self.resources
            .request(holder, resource, amount, priority, timeout)
            .await
    }

    /// Releases resource units held by a holder.
    pub async fn release_resource(
        &self,
        holder: &str,
        resource: &str,
        amount: u64,
    ) -> MusterResult<()> {
        self.resources.release(holder, resource, amount).await
    }

    // --- background loops ---

    /// One scheduling pass: deadline expiry, then assignment in priority
    /// order, then metric pushes.
    pub async fn run_pass(&self) {
        let now = Utc::now();
        for task in self.scheduler.expire_deadlines(now).await {
            if let Some(agent_id) = &task.assigned_to {
                let _ = self
                    .registry
                    .mark(agent_id, muster_core::AgentStatus::Idle)
                    .await;
                self.notify_agent(agent_id, "task.cancel", &task.id).await;
            }
            self.monitor.raise(
                "scheduler",
                "deadline_exceeded",
                1.0,
                format!("task '{}' missed its deadline", task.id),
            );
        }

        for task in self.scheduler.queued_in_order().await {
            match self.registry.pick(&task.required).await {
                Some(agent_id) => {
                    if self.scheduler.mark_assigned(&task.id, &agent_id).await.is_err() {
                        // The task changed state under us; skip it this pass.
                        continue;
                    }
                    let _ = self.registry.record_assignment(&agent_id).await;
                    info!(task_id = %task.id, agent_id = %agent_id, "Task assigned");
                    let payload = serde_json::json!({
                        "kind": "task.assign",
                        "task_id": task.id,
                        "required": task.required,
                        "payload": task.payload,
                    });
                    if let Err(e) = self.broker.send("scheduler", &agent_id, payload, None).await {
                        // Notification is best-effort; the agent can still
                        // discover the assignment through a status query.
                        warn!(agent_id = %agent_id, error = %e, "Assignment notification failed");
                    }
                }
                None => {
                    let capable = self.registry.any_capable(&task.required).await;
                    if let Ok(Some(err)) = self
                        .scheduler
                        .note_unavailable(&task.id, capable, self.config.assignment_retry_budget)
                        .await
                    {
                        self.monitor
                            .raise("scheduler", "assignment_exhausted", 1.0, err.to_string());
                    }
                }
            }
        }

        self.push_metrics().await;
    }

    async fn push_metrics(&self) {
        self.monitor
            .record(MetricSample::new(
                "scheduler",
                "queue_depth",
                self.scheduler.queued_count().await as f64,
            ))
            .await;
        self.monitor
            .record(MetricSample::new(
                "registry",
                "active_agents",
                self.registry.active_count().await as f64,
            ))
            .await;
        for id in self.resources.resource_ids().await {
            if let Ok(utilization) = self.resources.utilization(&id).await {
                self.monitor
                    .record(MetricSample::new(
                        "resources",
                        format!("{id}.utilization"),
                        utilization,
                    ))
                    .await;
            }
        }
        for id in self.broker.subscribers().await {
            if let Some(saturation) = self.broker.saturation(&id).await {
                self.monitor
                    .record(MetricSample::new(
                        "broker",
                        format!("{id}.saturation"),
                        saturation,
                    ))
                    .await;
            }
        }
    }

    /// One liveness sweep: offline detection, task reclaim, exhaustion
    /// alerting. Offline agents are never fatal; their tasks just requeue.
    pub async fn run_sweep(&self) {
        let offline = self.registry.sweep(self.config.heartbeat_timeout()).await;
        if offline.is_empty() {
            return;
        }
        let mut reclaimed_any = false;
        for agent_id in &offline {
            let reclaimed = self.scheduler.reclaim_for_agent(agent_id).await;
            reclaimed_any |= !reclaimed.is_empty();
        }
        if self.registry.active_count().await == 0 {
            self.monitor.raise(
                "registry",
                "agents_exhausted",
                offline.len() as f64,
                "no agent in the registry is in rotation",
            );
        }
        if reclaimed_any {
            self.kick.notify_one();
        }
    }

    /// Closes one reconciliation window: applies starvation promotion,
    /// resolves the window, publishes the accepted action set, and requeues
    /// the tasks behind rejected proposals.
    pub async fn run_reconcile(&self) {
        self.resources.kick().await;
        let resolution = self.coordinator.resolve().await;
        if resolution.is_empty() {
            return;
        }
        self.monitor
            .record(MetricSample::new(
                "coordinator",
                "conflicts",
                resolution.rejected.len() as f64,
            ))
            .await;
        for (proposal, err) in &resolution.rejected {
            warn!(task_id = %proposal.task_id, error = %err, "Proposal rejected, requeuing task");
            if self.scheduler.requeue(&proposal.task_id).await.is_ok() {
                let _ = self
                    .registry
                    .mark(&proposal.agent_id, muster_core::AgentStatus::Idle)
                    .await;
                self.notify_agent(&proposal.agent_id, "proposal.rejected", &proposal.task_id)
                    .await;
                self.kick.notify_one();
            }
        }
        if !resolution.accepted.is_empty() {
            let _ = self.actions.send(resolution.accepted);
        }
    }

    async fn notify_agent(&self, agent_id: &str, kind: &str, task_id: &str) {
        let payload = serde_json::json!({"kind": kind, "task_id": task_id});
        if let Err(e) = self.broker.send("scheduler", agent_id, payload, None).await {
            warn!(agent_id, kind, error = %e, "Agent notification failed");
        }
    }

    /// Spawns the background loops. They stop on [`Engine::stop`].
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = self.clone();
        let mut stop = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = engine.kick.notified() => {}
                    () = tokio::time::sleep(engine.config.pass_interval()) => {}
                    _ = stop.changed() => break,
                }
                engine.run_pass().await;
            }
        }));

        let engine = self.clone();
        let mut stop = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(engine.config.sweep_interval()) => {}
                    _ = stop.changed() => break,
                }
                engine.run_sweep().await;
            }
        }));

        let engine = self.clone();
        let mut stop = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(engine.config.reconcile_interval()) => {}
                    _ = stop.changed() => break,
                }
                engine.run_reconcile().await;
            }
        }));

        handles
    }

    /// Signals the background loops to stop.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    // --- persistence ---

    /// Captures the task and agent tables.
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.scheduler.snapshot().await, self.registry.snapshot().await)
    }

    /// Restores a snapshot: in-flight tasks return to the queue, restored
    /// agents start offline until they heartbeat again.
    pub async fn restore(&self, snapshot: Snapshot) {
        self.scheduler.restore(snapshot.tasks).await;
        self.registry.restore(snapshot.agents).await;
        self.kick.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use muster_core::{Capability, TaskStatus};

    fn caps(names: &[&str]) -> Vec<Capability> {
        names.iter().map(|n| Capability::new(*n, 1)).collect()
    }

    fn agent_spec(id: &str, names: &[&str]) -> AgentSpec {
        AgentSpec {
            id: Some(id.to_string()),
            capabilities: caps(names),
        }
    }

    fn task_spec(id: &str, priority: u8, names: &[&str]) -> TaskSpec {
        TaskSpec {
            id: Some(id.to_string()),
            required: caps(names),
            priority,
            deadline: None,
            payload: serde_json::Value::Null,
        }
    }

    async fn engine() -> Engine {
        Engine::new(RuntimeConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_pass_assigns_and_notifies() {
        let engine = engine().await;
        engine.register_agent(agent_spec("a-1", &["weld"])).await.unwrap();
        let mut mailbox = engine.attach_agent("a-1").await.unwrap();
        engine.submit_task(task_spec("t-1", 5, &["weld"])).await.unwrap();

        engine.run_pass().await;

        let task = engine.task_status("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_to.as_deref(), Some("a-1"));

        let envelope = mailbox.recv().await.unwrap();
        assert_eq!(envelope.payload["kind"], "task.assign");
        assert_eq!(envelope.payload["task_id"], "t-1");

        // The agent is busy now; a second task stays queued.
        engine.submit_task(task_spec("t-2", 5, &["weld"])).await.unwrap();
        engine.run_pass().await;
        assert_eq!(
            engine.task_status("t-2").await.unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_cancel_of_assigned_task_frees_agent() {
        let engine = engine().await;
        engine.register_agent(agent_spec("a-1", &["weld"])).await.unwrap();
        let mut mailbox = engine.attach_agent("a-1").await.unwrap();
        engine.submit_task(task_spec("t-1", 5, &["weld"])).await.unwrap();
        engine.run_pass().await;
        assert_eq!(mailbox.recv().await.unwrap().payload["kind"], "task.assign");

        let outcome = engine.cancel_task("t-1").await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::Cancelled {
                agent_id: Some("a-1".to_string())
            }
        );
        assert_eq!(mailbox.recv().await.unwrap().payload["kind"], "task.cancel");

        // The agent is back in rotation for the next task.
        engine.submit_task(task_spec("t-2", 5, &["weld"])).await.unwrap();
        engine.run_pass().await;
        assert_eq!(
            engine.task_status("t-2").await.unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[tokio::test]
    async fn test_completion_frees_agent_for_next_task() {
        let engine = engine().await;
        engine.register_agent(agent_spec("a-1", &["weld"])).await.unwrap();
        engine.attach_agent("a-1").await.unwrap();
        engine.submit_task(task_spec("t-1", 5, &["weld"])).await.unwrap();
        engine.submit_task(task_spec("t-2", 5, &["weld"])).await.unwrap();

        engine.run_pass().await;
        engine.report_started("t-1").await.unwrap();
        engine
            .report_completed("t-1", serde_json::json!({"ok": true}))
            .await
            .unwrap();

        engine.run_pass().await;
        assert_eq!(
            engine.task_status("t-2").await.unwrap().status,
            TaskStatus::Assigned
        );
        assert_eq!(
            engine.monitor().latest("scheduler", "queue_depth").await,
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_capability_mismatch_exhausts_budget() {
        let mut config = RuntimeConfig::default();
        config.assignment_retry_budget = 1;
        let engine = Engine::new(config).await.unwrap();
        let mut alerts = engine.subscribe_alerts();
        engine.register_agent(agent_spec("a-1", &["paint"])).await.unwrap();
        engine.submit_task(task_spec("t-1", 5, &["weld"])).await.unwrap();

        engine.run_pass().await;
        engine.run_pass().await;

        let task = engine.task_status("t-1").await.unwrap();
        assert!(matches!(task.status, TaskStatus::Failed { .. }));
        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.metric, "assignment_exhausted");
    }

    #[tokio::test]
    async fn test_proposal_priority_comes_from_task() {
        let engine = engine().await;
        engine.register_agent(agent_spec("a-1", &["weld"])).await.unwrap();
        engine.submit_task(task_spec("t-1", 9, &["weld"])).await.unwrap();

        let proposal = ActionProposal::new("a-1", "t-1", 0, ["x".to_string()], serde_json::Value::Null);
        engine.submit_proposal(proposal).await.unwrap();
        // Unknown task is rejected outright.
        let stray = ActionProposal::new("a-1", "ghost", 0, ["x".to_string()], serde_json::Value::Null);
        assert!(engine.submit_proposal(stray).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_restore_requeues_in_flight() {
        let engine = engine().await;
        engine.register_agent(agent_spec("a-1", &["weld"])).await.unwrap();
        engine.submit_task(task_spec("t-1", 5, &["weld"])).await.unwrap();
        engine.run_pass().await;
        assert_eq!(
            engine.task_status("t-1").await.unwrap().status,
            TaskStatus::Assigned
        );

        let snapshot = engine.snapshot().await;
        let restored = Engine::new(RuntimeConfig::default()).await.unwrap();
        restored.restore(snapshot).await;

        let task = restored.task_status("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_to.is_none());
        assert_eq!(
            restored.registry().get("a-1").await.unwrap().status,
            muster_core::AgentStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_stop_ends_background_loops() {
        let engine = Arc::new(engine().await);
        let handles = engine.spawn();
        engine.stop();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
