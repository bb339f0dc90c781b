use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use loom_bridge::event_bus::{BusError, EventBus};
use loom_bridge::protocol::{subjects, BusMessage, DispatchEvent, ResultMessage, ResultOutcome, TaskMessage};
use loom_core::config::{clamp_max_dispatch_hops, DispatcherConfig};
use loom_core::context;
use loom_core::store::{Store, StoreError};
use loom_core::types::{estimate_complexity, Agent, AgentStatus, Bead, BeadStatus, BeadType, Priority};
use loom_providers::registry::ProviderRegistry;
use loom_workflow::definition::EdgeCondition;
use loom_workflow::engine::{EngineError, WorkflowEngine};
use loom_workflow::execution::ExecutionStatus;

use crate::escalation::{Escalator, EscalatorError};
use crate::loop_detector::LoopDetector;
use crate::provider_errors::bead_has_provider_errors;
use crate::shutdown::{ShutdownGuard, ShutdownSignal};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("workflow engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("escalator error: {0}")]
    Escalator(#[from] EscalatorError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ---------------------------------------------------------------------------
// Skip reasons
// ---------------------------------------------------------------------------

mod skip {
    pub const ESCALATED: &str = "escalated";
    pub const DEPENDENCIES_OPEN: &str = "dependencies_open";
    pub const HOP_LIMIT_ESCALATED: &str = "hop_limit_escalated";
    pub const ESCALATOR_ERROR: &str = "escalator_error";
    pub const WORKFLOW_ERROR: &str = "workflow_error";
    pub const WORKFLOW_NODE_NOT_READY: &str = "workflow_node_not_ready";
    pub const WORKFLOW_FAILED: &str = "workflow_failed";
    pub const WORKFLOW_ESCALATED: &str = "workflow_escalated";
    pub const WORKFLOW_COMPLETED: &str = "workflow_completed";
    pub const BEAD_IN_PROGRESS: &str = "bead_in_progress";
    pub const STUCK_REMEDIATED: &str = "stuck_remediated";
    pub const ROLE_NOT_AVAILABLE: &str = "workflow_role_not_available";
    pub const NO_PROVIDER: &str = "no_provider";
    pub const PUBLISH_FAILED: &str = "publish_failed";
    pub const STORE_ERROR: &str = "store_error";
}

// ---------------------------------------------------------------------------
// PassReport
// ---------------------------------------------------------------------------

/// Summary of one dispatcher pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub project_id: String,
    pub scanned: usize,
    pub dispatched: usize,
    pub skipped: BTreeMap<String, usize>,
    pub escalations: Vec<Uuid>,
    pub duration_ms: u64,
}

impl PassReport {
    fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            scanned: 0,
            dispatched: 0,
            skipped: BTreeMap::new(),
            escalations: Vec::new(),
            duration_ms: 0,
        }
    }

    fn skip(&mut self, reason: &str) {
        *self.skipped.entry(reason.to_string()).or_default() += 1;
    }

    fn into_event(self) -> DispatchEvent {
        DispatchEvent {
            project_id: self.project_id,
            scanned: self.scanned,
            dispatched: self.dispatched,
            skipped: self.skipped,
            escalations: self.escalations,
            duration_ms: self.duration_ms,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

struct Tunables {
    max_dispatch_hops: i64,
    tick_interval: Duration,
    pass_deadline: Duration,
    agent_staleness: chrono::Duration,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// The scheduling loop: matches open beads to idle agents under role,
/// workflow, and policy constraints, and reacts to agent results.
///
/// Passes are serialized; one runs at a time, bounded by a deadline.
pub struct Dispatcher {
    store: Arc<Store>,
    bus: EventBus,
    registry: Arc<ProviderRegistry>,
    engine: Arc<WorkflowEngine>,
    detector: Arc<LoopDetector>,
    escalator: Arc<dyn Escalator>,
    project_id: String,
    tunables: RwLock<Tunables>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        registry: Arc<ProviderRegistry>,
        engine: Arc<WorkflowEngine>,
        detector: Arc<LoopDetector>,
        escalator: Arc<dyn Escalator>,
        project_id: impl Into<String>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            engine,
            detector,
            escalator,
            project_id: project_id.into(),
            tunables: RwLock::new(Tunables {
                max_dispatch_hops: clamp_max_dispatch_hops(config.max_dispatch_hops),
                tick_interval: Duration::from_secs(config.tick_interval_secs),
                pass_deadline: Duration::from_secs(config.pass_deadline_secs),
                agent_staleness: chrono::Duration::minutes(5),
            }),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Live-tune the hop cap; out-of-range values fall back to the default.
    pub fn set_max_dispatch_hops(&self, hops: i64) {
        let mut tunables = self.tunables.write().expect("tunables lock poisoned");
        tunables.max_dispatch_hops = clamp_max_dispatch_hops(hops);
    }

    pub fn max_dispatch_hops(&self) -> i64 {
        self.tunables.read().expect("tunables lock poisoned").max_dispatch_hops
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// The tick loop. One pass per tick, serialized, bounded by the pass
    /// deadline so a runaway scan cannot block the next tick.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let _drain = ShutdownGuard::new(shutdown.clone());
        let mut rx = shutdown.subscribe();
        let tick = self.tunables.read().expect("tunables lock poisoned").tick_interval;
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(project_id = %self.project_id, tick_secs = tick.as_secs(), "dispatcher started");
        loop {
            tokio::select! {
                _ = rx.recv() => {
                    info!("dispatcher shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let deadline = self
                        .tunables
                        .read()
                        .expect("tunables lock poisoned")
                        .pass_deadline;
                    match tokio::time::timeout(deadline, self.run_pass()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "dispatch pass failed"),
                        Err(_) => warn!(deadline_secs = deadline.as_secs(), "dispatch pass exceeded deadline"),
                    }
                }
            }
        }
    }

    /// Result-message loop: consumes `loom.results.<project>` and applies
    /// each result to the bead's workflow and memory.
    pub async fn run_result_loop(&self, shutdown: ShutdownSignal) {
        let _drain = ShutdownGuard::new(shutdown.clone());
        let mut rx_shutdown = shutdown.subscribe();
        let rx = self.bus.subscribe(&subjects::results(&self.project_id));

        loop {
            tokio::select! {
                _ = rx_shutdown.recv() => {
                    info!("result loop shutting down");
                    break;
                }
                msg = rx.recv_async() => match msg {
                    Ok(BusMessage::Result(result)) => {
                        if let Err(e) = self.handle_result(result).await {
                            warn!(error = %e, "failed to handle agent result");
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // One pass
    // -----------------------------------------------------------------------

    /// Run a single dispatch pass and return its report.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let _serialized = self.pass_lock.lock().await;
        let started = Instant::now();
        let mut report = PassReport::new(&self.project_id);

        self.unblock_ready_beads().await?;

        let mut beads = self.store.list_dispatchable(&self.project_id).await?;
        // P0 first, oldest first within a priority.
        beads.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut agents = self
            .store
            .list_agents(Some(&self.project_id), None, Some(AgentStatus::Idle))
            .await?;

        for mut bead in beads {
            report.scanned += 1;
            let context_before = bead.context.clone();
            let status_before = bead.status;
            let assignee_before = bead.assignee;
            let deps_before = bead.depends_on.clone();

            if let Err(e) = self.process_bead(&mut bead, &mut agents, &mut report).await {
                warn!(bead_id = %bead.id, error = %e, "bead processing failed; retrying next tick");
                report.skip(skip::STORE_ERROR);
                continue;
            }

            let dirty = bead.context != context_before
                || bead.status != status_before
                || bead.assignee != assignee_before
                || bead.depends_on != deps_before;
            if dirty {
                if let Err(e) = self.store.upsert_bead(&bead).await {
                    warn!(bead_id = %bead.id, error = %e, "failed to persist bead; retrying next tick");
                    report.skip(skip::STORE_ERROR);
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            project_id = %self.project_id,
            scanned = report.scanned,
            dispatched = report.dispatched,
            skipped = %serde_json::to_string(&report.skipped).unwrap_or_default(),
            escalations = report.escalations.len(),
            duration_ms = report.duration_ms,
            "dispatch pass complete"
        );
        if let Err(e) = self
            .bus
            .publish(subjects::EVENTS_DISPATCH, BusMessage::Dispatch(report.clone().into_event()))
        {
            debug!(error = %e, "dispatch event publish failed");
        }
        Ok(report)
    }

    async fn process_bead(
        &self,
        bead: &mut Bead,
        agents: &mut [Agent],
        report: &mut PassReport,
    ) -> Result<()> {
        // Already parked for a human decision.
        if bead.context.contains_key(context::ESCALATED_TO_CEO_DECISION_ID) {
            report.skip(skip::ESCALATED);
            return Ok(());
        }

        // Unsatisfied dependencies.
        for dep in bead.depends_on.clone() {
            let dep_closed = self
                .store
                .get_bead(dep)
                .await?
                .map(|d| d.status == BeadStatus::Closed)
                .unwrap_or(false);
            if !dep_closed {
                report.skip(skip::DEPENDENCIES_OPEN);
                return Ok(());
            }
        }

        // Hop limit: force the bead in front of a human.
        let hops = context::get_counter(&bead.context, context::DISPATCH_COUNT);
        let max_hops = self.max_dispatch_hops();
        if hops >= max_hops as u64 {
            match self.escalate_hop_limit(bead, hops, max_hops).await {
                Ok(created) => {
                    if let Some(ceo_id) = created {
                        report.escalations.push(ceo_id);
                    }
                    report.skip(skip::HOP_LIMIT_ESCALATED);
                }
                Err(e) => {
                    // Retried next tick; the created-flag is only set on
                    // success, so no duplicate CEO bead can appear.
                    warn!(bead_id = %bead.id, error = %e, "hop-limit escalation failed");
                    report.skip(skip::ESCALATOR_ERROR);
                }
            }
            return Ok(());
        }

        // Workflow attachment and readiness.
        let exec_id = match self.engine.ensure_bead_has_workflow(bead) {
            Ok(id) => id,
            Err(e) => {
                warn!(bead_id = %bead.id, error = %e, "workflow routing disabled for bead");
                report.skip(skip::WORKFLOW_ERROR);
                return Ok(());
            }
        };

        if !self.engine.is_node_ready(exec_id).await? {
            self.handle_not_ready(bead, exec_id, report).await?;
            return Ok(());
        }

        // An in-progress bead already has an owner; nothing more this pass.
        if bead.status == BeadStatus::InProgress {
            report.skip(skip::BEAD_IN_PROGRESS);
            return Ok(());
        }

        let role = self
            .engine
            .required_role(exec_id)
            .unwrap_or_else(|_| bead.bead_type.default_role());

        // Loop detection. Provider-error loops are left alone; the
        // infrastructure recovers on its own.
        let (stuck, reason) = self.detector.is_stuck(bead);
        if stuck {
            if bead_has_provider_errors(&bead.context) {
                debug!(bead_id = %bead.id, "stuck on provider errors; skipping remediation");
            } else {
                self.remediate_stuck(bead, &reason).await?;
                report.skip(skip::STUCK_REMEDIATED);
                return Ok(());
            }
        }

        // Agent selection: healthy, right role, idle, unassigned; the list
        // is ordered oldest-activity-first so matches rotate.
        let staleness = self
            .tunables
            .read()
            .expect("tunables lock poisoned")
            .agent_staleness;
        let now = Utc::now();
        let slot = agents.iter().position(|a| {
            a.role == role
                && a.status == AgentStatus::Idle
                && a.current_bead.is_none()
                && now.signed_duration_since(a.last_heartbeat) < staleness
        });
        let Some(slot) = slot else {
            report.skip(skip::ROLE_NOT_AVAILABLE);
            return Ok(());
        };

        // Provider selection by estimated complexity.
        let providers = self
            .registry
            .list_active_for_complexity(estimate_complexity(bead))
            .await;
        let Some(provider) = providers.first() else {
            report.skip(skip::NO_PROVIDER);
            return Ok(());
        };

        let node = self.engine.get_current_node(exec_id)?;

        // Assign. The publish is the commit point for the hop: a failed
        // publish reverts the bead and does not count a dispatch.
        let agent_id = agents[slot].id;
        let hops_after = context::increment_counter(&mut bead.context, context::DISPATCH_COUNT);
        bead.context.insert(context::WORKFLOW_NODE.into(), node.key.clone());
        bead.context.insert(context::REQUIRED_ROLE.into(), role.to_string());
        bead.set_status(BeadStatus::InProgress);
        bead.assignee = Some(agent_id);

        let task = TaskMessage {
            bead_id: bead.id,
            correlation_id: Uuid::new_v4(),
            required_role: role,
            instructions: build_instructions(bead, &node.instructions),
            context_snapshot: bead.context.clone(),
            provider_hint: Some(provider.id.clone()),
        };
        if let Err(e) = self
            .bus
            .publish(&subjects::tasks(&self.project_id), BusMessage::Task(task))
        {
            warn!(bead_id = %bead.id, error = %e, "task publish failed; reverting dispatch");
            bead.set_status(BeadStatus::Open);
            bead.assignee = None;
            bead.context
                .insert(context::DISPATCH_COUNT.into(), (hops_after - 1).to_string());
            report.skip(skip::PUBLISH_FAILED);
            return Ok(());
        }

        let agent = &mut agents[slot];
        agent.status = AgentStatus::Working;
        agent.current_bead = Some(bead.id);
        agent.last_activity = now;
        self.store.upsert_agent(agent).await?;

        debug!(
            bead_id = %bead.id,
            agent_id = %agent_id,
            role = %role,
            provider = %provider.id,
            hop = hops_after,
            "bead dispatched"
        );
        report.dispatched += 1;
        Ok(())
    }

    /// A node that is not ready either timed out (the engine advanced it
    /// internally) or sits on a terminal execution; settle the bead state
    /// accordingly.
    async fn handle_not_ready(
        &self,
        bead: &mut Bead,
        exec_id: Uuid,
        report: &mut PassReport,
    ) -> Result<()> {
        let Some(exec) = self.engine.get_execution(exec_id) else {
            report.skip(skip::WORKFLOW_NODE_NOT_READY);
            return Ok(());
        };
        match exec.status {
            ExecutionStatus::Active => {
                // A timeout advanced the node under a silent agent; free the
                // bead so the new node can dispatch next pass.
                if bead.status == BeadStatus::InProgress {
                    self.release_agent(bead.assignee).await?;
                    bead.set_status(BeadStatus::Open);
                    bead.assignee = None;
                }
                report.skip(skip::WORKFLOW_NODE_NOT_READY);
            }
            ExecutionStatus::Failed => {
                self.release_agent(bead.assignee).await?;
                bead.set_status(BeadStatus::Blocked);
                bead.assignee = None;
                warn!(bead_id = %bead.id, "workflow failed; bead blocked pending intervention");
                report.skip(skip::WORKFLOW_FAILED);
            }
            ExecutionStatus::Escalated => {
                self.release_agent(bead.assignee).await?;
                bead.set_status(BeadStatus::Open);
                bead.assignee = None;
                match self.escalate_workflow(bead, exec_id).await {
                    Ok(Some(ceo_id)) => report.escalations.push(ceo_id),
                    Ok(None) => {}
                    Err(e) => warn!(bead_id = %bead.id, error = %e, "workflow escalation failed"),
                }
                report.skip(skip::WORKFLOW_ESCALATED);
            }
            ExecutionStatus::Completed => {
                self.release_agent(bead.assignee).await?;
                bead.set_status(BeadStatus::Closed);
                bead.assignee = None;
                report.skip(skip::WORKFLOW_COMPLETED);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Agent results
    // -----------------------------------------------------------------------

    /// Apply an agent result: advance the workflow on the matching edge
    /// condition, feed the loop detector, record provider metrics, and
    /// settle the bead. Replays of the same correlation id are ignored.
    pub async fn handle_result(&self, msg: ResultMessage) -> Result<()> {
        let mut bead = self.store.require_bead(msg.bead_id).await?;

        let correlation = msg.correlation_id.to_string();
        if bead.context.get(context::LAST_RESULT_CORRELATION_ID) == Some(&correlation) {
            debug!(bead_id = %bead.id, correlation_id = %correlation, "duplicate result ignored");
            return Ok(());
        }
        bead.context
            .insert(context::LAST_RESULT_CORRELATION_ID.into(), correlation);

        // Provider metrics are recorded for every result that names one.
        if let (Some(provider_id), Some(latency_ms)) = (&msg.provider_id, msg.latency_ms) {
            self.registry
                .record_request_metrics(
                    provider_id,
                    latency_ms as f64,
                    msg.outcome != ResultOutcome::ProviderError,
                )
                .await;
        }

        // Behavioral memory travels with the bead.
        for action in &msg.action_trace {
            self.detector
                .record_action(&mut bead, msg.agent_id, &action.action_type, action.data.clone());
        }

        self.release_agent(Some(msg.agent_id)).await?;

        let condition = match msg.outcome {
            ResultOutcome::ProviderError => {
                // Infrastructure failure: not a workflow attempt. The bead
                // goes back to open with its hop count untouched, and the
                // error trail suppresses spurious remediation.
                let error = msg.error.unwrap_or_else(|| "provider error".to_string());
                bead.context
                    .insert(context::LAST_RUN_ERROR.into(), error.clone());
                context::push_string_list(
                    &mut bead.context,
                    context::ERROR_HISTORY,
                    error,
                    context::ERROR_HISTORY_CAP,
                );
                bead.set_status(BeadStatus::Open);
                bead.assignee = None;
                self.store.upsert_bead(&bead).await?;
                return Ok(());
            }
            ResultOutcome::Success | ResultOutcome::Failure => {
                if let Some(error) = &msg.error {
                    bead.context
                        .insert(context::LAST_RUN_ERROR.into(), error.clone());
                    context::push_string_list(
                        &mut bead.context,
                        context::ERROR_HISTORY,
                        error.clone(),
                        context::ERROR_HISTORY_CAP,
                    );
                }
                if msg.outcome == ResultOutcome::Success {
                    EdgeCondition::Success
                } else {
                    EdgeCondition::Failure
                }
            }
            ResultOutcome::Approved => EdgeCondition::Approved,
            ResultOutcome::Rejected => EdgeCondition::Rejected,
        };

        let exec_id = self.engine.ensure_bead_has_workflow(&mut bead)?;
        let status = self
            .engine
            .advance_workflow(exec_id, condition, &msg.agent_id.to_string(), msg.result_data.clone())
            .await?;

        // Refresh the workflow pointers the bead carries.
        if let Ok(node) = self.engine.get_current_node(exec_id) {
            bead.context.insert(context::WORKFLOW_NODE.into(), node.key.clone());
            bead.context
                .insert(context::REQUIRED_ROLE.into(), node.effective_role().to_string());
        }

        match status {
            ExecutionStatus::Active => {
                bead.set_status(BeadStatus::Open);
                bead.assignee = None;
            }
            ExecutionStatus::Completed => {
                bead.set_status(BeadStatus::Closed);
                bead.assignee = None;
                info!(bead_id = %bead.id, "workflow completed; bead closed");
            }
            ExecutionStatus::Escalated => {
                bead.set_status(BeadStatus::Open);
                bead.assignee = None;
                match self.escalate_workflow(&mut bead, exec_id).await {
                    Ok(_) => {}
                    Err(e) => warn!(bead_id = %bead.id, error = %e, "workflow escalation failed"),
                }
            }
            ExecutionStatus::Failed => {
                bead.set_status(BeadStatus::Blocked);
                bead.assignee = None;
                warn!(bead_id = %bead.id, "workflow failed; bead blocked pending intervention");
            }
        }

        self.store.upsert_bead(&bead).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Escalation
    // -----------------------------------------------------------------------

    /// Create the hop-limit CEO bead and stamp the original. Returns the
    /// decision bead id, or `None` when one already exists.
    async fn escalate_hop_limit(
        &self,
        bead: &mut Bead,
        hops: u64,
        max_hops: i64,
    ) -> Result<Option<Uuid>> {
        if context::get_flag(&bead.context, context::ESCALATION_BEAD_CREATED) {
            return Ok(None);
        }

        let reason = format!("dispatch_count={hops} exceeded max_hops={max_hops}");
        let title = format!("[CEO-Escalation] Workflow stuck: {}", bead.id);
        let description = format!(
            "Bead '{}' was dispatched {} times without reaching a terminal state.\n\nReason: {}",
            bead.title, hops, reason
        );

        let ceo_id = self
            .escalator
            .create_ceo_decision_bead(bead, &title, &description)
            .await?;

        context::set_flag(&mut bead.context, context::ESCALATION_BEAD_CREATED);
        bead.context
            .insert(context::ESCALATED_TO_CEO_DECISION_ID.into(), ceo_id.to_string());
        context::set_timestamp(&mut bead.context, context::DISPATCH_ESCALATED_AT, Utc::now());
        bead.context
            .insert(context::DISPATCH_ESCALATION_REASON.into(), reason);
        info!(bead_id = %bead.id, ceo_bead_id = %ceo_id, hops, "bead escalated on hop limit");
        Ok(Some(ceo_id))
    }

    /// Create the workflow-guard CEO bead from the engine's rendering and
    /// stamp the original. Idempotent via the created-flag.
    async fn escalate_workflow(&self, bead: &mut Bead, exec_id: Uuid) -> Result<Option<Uuid>> {
        if context::get_flag(&bead.context, context::ESCALATION_BEAD_CREATED) {
            return Ok(None);
        }

        let info = self.engine.get_escalation_info(exec_id)?;
        let ceo_id = self
            .escalator
            .create_ceo_decision_bead(bead, &info.title, &info.description)
            .await?;

        context::set_flag(&mut bead.context, context::ESCALATION_BEAD_CREATED);
        bead.context
            .insert(context::ESCALATED_TO_CEO_DECISION_ID.into(), ceo_id.to_string());
        context::set_timestamp(&mut bead.context, context::DISPATCH_ESCALATED_AT, Utc::now());
        bead.context.insert(
            context::DISPATCH_ESCALATION_REASON.into(),
            "workflow guard tripped".into(),
        );
        info!(bead_id = %bead.id, ceo_bead_id = %ceo_id, "bead escalated on workflow guard");
        Ok(Some(ceo_id))
    }

    // -----------------------------------------------------------------------
    // Remediation
    // -----------------------------------------------------------------------

    /// Synthesize a P1 remediation bead for a stuck bead and block the
    /// original until it closes.
    async fn remediate_stuck(&self, bead: &mut Bead, reason: &str) -> Result<()> {
        let suggestions = self.detector.suggest_next_steps(bead, reason);
        let bullet_list = suggestions
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut remediation = Bead::new(
            format!("[remediation] {}", bead.title),
            &bead.project_id,
            BeadType::Task,
            Priority::P1,
        )
        .with_description(format!(
            "Bead {} appears stuck: {}\n\nSuggested next steps:\n{}",
            bead.id, reason, bullet_list
        ));
        remediation
            .context
            .insert("remediation_for".into(), bead.id.to_string());
        let remediation_id = self.store.create_bead(&remediation).await?;

        bead.context
            .insert(context::LOOP_DETECTION_REASON.into(), reason.to_string());
        bead.context
            .insert(context::REMEDIATION_BEAD_ID.into(), remediation_id.to_string());
        if !bead.depends_on.contains(&remediation_id) {
            bead.depends_on.push(remediation_id);
        }
        bead.set_status(BeadStatus::Blocked);
        bead.assignee = None;

        info!(
            bead_id = %bead.id,
            remediation_bead_id = %remediation_id,
            reason = %reason,
            "stuck bead blocked behind remediation"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Reopen blocked beads whose dependencies have all closed. A bead
    /// coming back from remediation gets its loop memory cleared so the
    /// detector judges the fresh attempts on their own.
    async fn unblock_ready_beads(&self) -> Result<usize> {
        let blocked = self.store.list_beads_by_status(BeadStatus::Blocked).await?;
        let mut reopened = 0usize;
        for mut bead in blocked {
            if bead.project_id != self.project_id || bead.depends_on.is_empty() {
                continue;
            }
            let mut all_closed = true;
            for dep in &bead.depends_on {
                let closed = self
                    .store
                    .get_bead(*dep)
                    .await?
                    .map(|d| d.status == BeadStatus::Closed)
                    .unwrap_or(false);
                if !closed {
                    all_closed = false;
                    break;
                }
            }
            if !all_closed {
                continue;
            }

            if bead.context.remove(context::REMEDIATION_BEAD_ID).is_some() {
                self.detector.reset_progress(&mut bead);
                bead.context.remove(context::LOOP_DETECTION_REASON);
            }
            bead.set_status(BeadStatus::Open);
            self.store.upsert_bead(&bead).await?;
            info!(bead_id = %bead.id, "blocked bead reopened; dependencies closed");
            reopened += 1;
        }
        Ok(reopened)
    }

    async fn release_agent(&self, agent_id: Option<Uuid>) -> Result<()> {
        let Some(agent_id) = agent_id else {
            return Ok(());
        };
        if let Some(mut agent) = self.store.get_agent(agent_id).await? {
            if agent.status == AgentStatus::Working {
                agent.status = AgentStatus::Idle;
            }
            agent.current_bead = None;
            self.store.upsert_agent(&agent).await?;
        }
        Ok(())
    }
}

/// Compose the task instructions an agent receives for a node.
fn build_instructions(bead: &Bead, node_instructions: &str) -> String {
    let description = bead.description.as_deref().unwrap_or("(no description)");
    format!(
        "{}\n\nBead: {}\nDescription: {}",
        node_instructions, bead.title, description
    )
}

// ---------------------------------------------------------------------------
// Tests (unit level; end-to-end scenarios live in tests/dispatcher_test.rs)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_instructions_includes_bead_context() {
        let bead = Bead::new("Fix crash", "loom", BeadType::Bug, Priority::P1)
            .with_description("Crashes on empty input");
        let text = build_instructions(&bead, "Reproduce the bug.");
        assert!(text.starts_with("Reproduce the bug."));
        assert!(text.contains("Fix crash"));
        assert!(text.contains("Crashes on empty input"));
    }

    #[test]
    fn pass_report_histogram_accumulates() {
        let mut report = PassReport::new("loom");
        report.skip(skip::NO_PROVIDER);
        report.skip(skip::NO_PROVIDER);
        report.skip(skip::ESCALATED);
        assert_eq!(report.skipped.get(skip::NO_PROVIDER), Some(&2));
        assert_eq!(report.skipped.get(skip::ESCALATED), Some(&1));

        let event = report.into_event();
        assert_eq!(event.project_id, "loom");
        assert_eq!(event.skipped.len(), 2);
    }
}
