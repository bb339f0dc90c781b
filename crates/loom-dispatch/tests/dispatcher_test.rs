//! End-to-end dispatcher scenarios over a real in-memory store, the real
//! workflow engine and loop detector, and a mock provider protocol.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use loom_bridge::event_bus::EventBus;
use loom_bridge::protocol::{subjects, BusMessage, ResultMessage, ResultOutcome, TaskMessage, TraceAction};
use loom_core::config::DispatcherConfig;
use loom_core::context;
use loom_core::store::Store;
use loom_core::types::{
    Agent, AgentRole, Bead, BeadStatus, BeadType, Priority, ProviderConfig, ProviderStatus,
    ProviderType,
};
use loom_dispatch::dispatcher::Dispatcher;
use loom_dispatch::escalation::StoreEscalator;
use loom_dispatch::loop_detector::LoopDetector;
use loom_providers::registry::ProviderRegistry;
use loom_providers::scorer::ScorerWeights;
use loom_workflow::definition::{
    EdgeCondition, NodeType, WorkflowDefinition, WorkflowEdge, WorkflowNode, WorkflowType,
};
use loom_workflow::engine::WorkflowEngine;

const PROJECT: &str = "p1";

struct Harness {
    store: Arc<Store>,
    bus: EventBus,
    registry: Arc<ProviderRegistry>,
    engine: Arc<WorkflowEngine>,
    detector: Arc<LoopDetector>,
    dispatcher: Dispatcher,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(Store::new_in_memory().await.unwrap());
        let bus = EventBus::new();
        let registry = Arc::new(ProviderRegistry::new(ScorerWeights::default()));
        let engine = Arc::new(WorkflowEngine::new(3));
        let detector = Arc::new(LoopDetector::new(3, Duration::minutes(5)));
        let escalator = Arc::new(StoreEscalator::new(store.clone()));

        let dispatcher = Dispatcher::new(
            store.clone(),
            bus.clone(),
            registry.clone(),
            engine.clone(),
            detector.clone(),
            escalator,
            PROJECT,
            &DispatcherConfig {
                tick_interval_secs: 1,
                pass_deadline_secs: 30,
                max_dispatch_hops: 20,
            },
        );

        Self {
            store,
            bus,
            registry,
            engine,
            detector,
            dispatcher,
        }
    }

    /// Register a project-scoped single-task workflow so the scenario
    /// controls exactly which role the entry node requires.
    fn with_single_node_workflow(&self, role: AgentRole, node_type: NodeType) {
        let def = WorkflowDefinition::new("single", WorkflowType::Feature)
            .with_project(PROJECT)
            .with_node(
                WorkflowNode::new("do_work", node_type, role)
                    .with_instructions("Do the work."),
            )
            .with_edge(WorkflowEdge::entry("do_work"));
        self.engine.register_definition(def).unwrap();
    }

    async fn add_agent(&self, role: AgentRole) -> Agent {
        let agent = Agent::new(format!("{role}-{}", Uuid::new_v4()), role, PROJECT);
        self.store.upsert_agent(&agent).await.unwrap();
        agent
    }

    async fn add_provider(&self) {
        let provider = ProviderConfig::new("mock-1", ProviderType::Mock, "http://mock", "mock-model")
            .with_model_size_b(32.0)
            .with_status(ProviderStatus::Healthy);
        self.registry.register(provider).await;
    }

    async fn add_bead(&self, bead_type: BeadType, priority: Priority) -> Bead {
        let bead = Bead::new("ship the thing", PROJECT, bead_type, priority)
            .with_description("make it work");
        self.store.upsert_bead(&bead).await.unwrap();
        bead
    }

    fn subscribe_tasks(&self) -> flume::Receiver<BusMessage> {
        self.bus.subscribe(&subjects::tasks(PROJECT))
    }

    fn recv_task(&self, rx: &flume::Receiver<BusMessage>) -> TaskMessage {
        match rx.try_recv().expect("expected a task message") {
            BusMessage::Task(task) => task,
            other => panic!("expected task, got {other:?}"),
        }
    }

    fn result(
        &self,
        task: &TaskMessage,
        agent_id: Uuid,
        outcome: ResultOutcome,
        error: Option<&str>,
    ) -> ResultMessage {
        ResultMessage {
            bead_id: task.bead_id,
            correlation_id: task.correlation_id,
            agent_id,
            outcome,
            action_trace: vec![],
            error: error.map(str::to_string),
            result_data: None,
            provider_id: None,
            latency_ms: None,
        }
    }

    /// All live CEO decision beads, dispatched or not.
    async fn decision_beads(&self) -> Vec<Bead> {
        self.store
            .list_dispatchable(PROJECT)
            .await
            .unwrap()
            .into_iter()
            .filter(|b| b.bead_type == BeadType::Decision)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// S1 — happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_dispatch_then_success_closes_bead() {
    let h = Harness::new().await;
    h.with_single_node_workflow(AgentRole::EngineeringManager, NodeType::Task);
    let agent = h.add_agent(AgentRole::EngineeringManager).await;
    h.add_provider().await;
    let bead = h.add_bead(BeadType::Feature, Priority::P1).await;

    let rx = h.subscribe_tasks();
    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 1);

    // The task carries the node instructions and the role.
    let task = h.recv_task(&rx);
    assert_eq!(task.bead_id, bead.id);
    assert_eq!(task.required_role, AgentRole::EngineeringManager);
    assert!(task.instructions.contains("Do the work."));
    assert_eq!(task.provider_hint.as_deref(), Some("mock-1"));

    // Hop counted, bead owned by the agent.
    let mid = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert_eq!(mid.status, BeadStatus::InProgress);
    assert_eq!(mid.assignee, Some(agent.id));
    assert_eq!(context::get_counter(&mid.context, context::DISPATCH_COUNT), 1);

    // Agent reports success; the single-node workflow completes and the
    // bead closes.
    h.dispatcher
        .handle_result(h.result(&task, agent.id, ResultOutcome::Success, None))
        .await
        .unwrap();

    let done = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert_eq!(done.status, BeadStatus::Closed);
    assert_eq!(done.assignee, None);
    assert_eq!(context::get_counter(&done.context, context::DISPATCH_COUNT), 1);

    // The agent is idle again.
    let released = h.store.get_agent(agent.id).await.unwrap().unwrap();
    assert_eq!(released.current_bead, None);
}

// ---------------------------------------------------------------------------
// S2 — provider storm
// ---------------------------------------------------------------------------

#[tokio::test]
async fn provider_storm_resets_bead_without_remediation() {
    let h = Harness::new().await;
    h.with_single_node_workflow(AgentRole::SoftwareEngineer, NodeType::Task);
    let agent = h.add_agent(AgentRole::SoftwareEngineer).await;
    h.add_provider().await;
    let bead = h.add_bead(BeadType::Task, Priority::P2).await;

    let rx = h.subscribe_tasks();
    for round in 1..=5u64 {
        let report = h.dispatcher.run_pass().await.unwrap();
        assert_eq!(report.dispatched, 1, "round {round} should dispatch");

        let task = h.recv_task(&rx);
        let mut result = h.result(
            &task,
            agent.id,
            ResultOutcome::ProviderError,
            Some("LLM call failed: status code 503"),
        );
        // The agent repeats the identical probe every round.
        result.action_trace = vec![TraceAction {
            action_type: "read_file".into(),
            data: BTreeMap::from([("file_path".into(), "src/lib.rs".into())]),
        }];
        h.dispatcher.handle_result(result).await.unwrap();

        let after = h.store.get_bead(bead.id).await.unwrap().unwrap();
        assert_eq!(after.status, BeadStatus::Open, "round {round}");
        assert_eq!(after.assignee, None);
        assert_eq!(
            context::get_counter(&after.context, context::DISPATCH_COUNT),
            round
        );
    }

    let after = h.store.get_bead(bead.id).await.unwrap().unwrap();
    let errors = context::get_string_list(&after.context, context::ERROR_HISTORY);
    assert_eq!(errors.len(), 5);
    assert!(errors.iter().all(|e| loom_dispatch::is_provider_error(e)));

    // The repetition qualifies as stuck, but the error trail points at the
    // provider, so no remediation bead is created and the bead dispatches
    // again.
    let (stuck, _) = h.detector.is_stuck(&after);
    assert!(stuck);
    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 1);

    let all_open = h.store.list_beads_by_status(BeadStatus::Open).await.unwrap();
    assert!(all_open.iter().all(|b| !b.title.starts_with("[remediation]")));
    assert!(h.decision_beads().await.is_empty());
}

// ---------------------------------------------------------------------------
// S3 — hop-limit escalation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hop_limit_creates_exactly_one_ceo_bead() {
    let h = Harness::new().await;
    h.with_single_node_workflow(AgentRole::SoftwareEngineer, NodeType::Task);
    h.add_agent(AgentRole::SoftwareEngineer).await;
    h.add_provider().await;

    let mut bead = h.add_bead(BeadType::Task, Priority::P2).await;
    bead.context
        .insert(context::DISPATCH_COUNT.into(), "20".into());
    h.store.upsert_bead(&bead).await.unwrap();

    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.escalations.len(), 1);

    let decisions = h.decision_beads().await;
    assert_eq!(decisions.len(), 1);
    let ceo = &decisions[0];
    assert_eq!(ceo.priority, Priority::P0);
    assert_eq!(
        ceo.title,
        format!("[CEO-Escalation] Workflow stuck: {}", bead.id)
    );

    let parked = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert!(context::get_flag(&parked.context, context::ESCALATION_BEAD_CREATED));
    assert_eq!(
        parked.context.get(context::ESCALATED_TO_CEO_DECISION_ID).unwrap(),
        &ceo.id.to_string()
    );
    assert!(context::get_timestamp(&parked.context, context::DISPATCH_ESCALATED_AT).is_some());
    assert_eq!(
        parked.context.get(context::DISPATCH_ESCALATION_REASON).unwrap(),
        "dispatch_count=20 exceeded max_hops=20"
    );

    // Next tick: the bead is parked and no duplicate CEO bead appears.
    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.escalations.len(), 0);
    assert_eq!(report.skipped.get("escalated"), Some(&1));
    assert_eq!(h.decision_beads().await.len(), 1);

    let unchanged = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert_eq!(
        context::get_counter(&unchanged.context, context::DISPATCH_COUNT),
        20
    );
}

// ---------------------------------------------------------------------------
// S5 — commit node role pinning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn commit_node_dispatches_only_to_engineering_manager() {
    let h = Harness::new().await;
    // The definition declares software-engineer, but commit nodes are
    // role-pinned to the engineering manager.
    h.with_single_node_workflow(AgentRole::SoftwareEngineer, NodeType::Commit);
    h.add_provider().await;
    h.add_bead(BeadType::Task, Priority::P2).await;

    let se = h.add_agent(AgentRole::SoftwareEngineer).await;
    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.skipped.get("workflow_role_not_available"), Some(&1));
    assert_eq!(
        h.store.get_agent(se.id).await.unwrap().unwrap().current_bead,
        None
    );

    let em = h.add_agent(AgentRole::EngineeringManager).await;
    let rx = h.subscribe_tasks();
    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 1);

    let task = h.recv_task(&rx);
    assert_eq!(task.required_role, AgentRole::EngineeringManager);
    let owner = h.store.get_agent(em.id).await.unwrap().unwrap();
    assert_eq!(owner.current_bead, Some(task.bead_id));
}

// ---------------------------------------------------------------------------
// Workflow guard escalation via failure results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attempt_guard_escalation_creates_ceo_bead() {
    let h = Harness::new().await;
    let def = WorkflowDefinition::new("retry", WorkflowType::Feature)
        .with_project(PROJECT)
        .with_node(
            WorkflowNode::new("work", NodeType::Task, AgentRole::SoftwareEngineer)
                .with_max_attempts(2),
        )
        .with_node(WorkflowNode::new("done", NodeType::Verify, AgentRole::QaEngineer))
        .with_edge(WorkflowEdge::entry("work"))
        .with_edge(WorkflowEdge::new("work", "work", EdgeCondition::Failure))
        .with_edge(WorkflowEdge::new("work", "done", EdgeCondition::Success));
    h.engine.register_definition(def).unwrap();

    let agent = h.add_agent(AgentRole::SoftwareEngineer).await;
    h.add_provider().await;
    let bead = h.add_bead(BeadType::Task, Priority::P2).await;

    let rx = h.subscribe_tasks();

    // First failure: attempt 2 of 2, still active.
    h.dispatcher.run_pass().await.unwrap();
    let task = h.recv_task(&rx);
    h.dispatcher
        .handle_result(h.result(&task, agent.id, ResultOutcome::Failure, Some("tests failed")))
        .await
        .unwrap();
    assert!(h.decision_beads().await.is_empty());

    // Second failure exceeds max_attempts; the guard escalates and the
    // dispatcher files the CEO bead.
    h.dispatcher.run_pass().await.unwrap();
    let task = h.recv_task(&rx);
    h.dispatcher
        .handle_result(h.result(&task, agent.id, ResultOutcome::Failure, Some("tests failed")))
        .await
        .unwrap();

    let decisions = h.decision_beads().await;
    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].title.starts_with("[CEO-Escalation] Workflow stuck:"));
    assert!(decisions[0]
        .description
        .as_deref()
        .unwrap()
        .contains("Current node: work"));

    let parked = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert!(parked.context.contains_key(context::ESCALATED_TO_CEO_DECISION_ID));

    // Parked beads are skipped on later passes.
    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.skipped.get("escalated"), Some(&1));
}

// ---------------------------------------------------------------------------
// P8 — result replay is idempotent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replayed_result_message_changes_nothing() {
    let h = Harness::new().await;
    h.with_single_node_workflow(AgentRole::SoftwareEngineer, NodeType::Task);
    let agent = h.add_agent(AgentRole::SoftwareEngineer).await;
    h.add_provider().await;
    let bead = h.add_bead(BeadType::Task, Priority::P2).await;

    let rx = h.subscribe_tasks();
    h.dispatcher.run_pass().await.unwrap();
    let task = h.recv_task(&rx);
    let result = h.result(&task, agent.id, ResultOutcome::Success, None);

    h.dispatcher.handle_result(result.clone()).await.unwrap();
    let first = h.store.get_bead(bead.id).await.unwrap().unwrap();
    let exec_id = Uuid::parse_str(first.context.get(context::WORKFLOW_EXEC_ID).unwrap()).unwrap();
    let history_len = h.engine.get_execution(exec_id).unwrap().history.len();

    // Replay of the same message: same history, same context.
    h.dispatcher.handle_result(result).await.unwrap();
    let second = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert_eq!(second.context, first.context);
    assert_eq!(
        h.engine.get_execution(exec_id).unwrap().history.len(),
        history_len
    );
    assert_eq!(h.decision_beads().await.len(), 0);
}

// ---------------------------------------------------------------------------
// Stuck beads get remediation, then recover when it closes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stuck_bead_is_blocked_behind_remediation_and_recovers() {
    let h = Harness::new().await;
    h.with_single_node_workflow(AgentRole::SoftwareEngineer, NodeType::Task);
    h.add_agent(AgentRole::SoftwareEngineer).await;
    h.add_provider().await;

    // Craft a bead that repeated the same read ten minutes ago with no
    // progress since.
    let mut bead = h.add_bead(BeadType::Task, Priority::P2).await;
    let agent_id = Uuid::new_v4();
    let past = Utc::now() - Duration::minutes(10);
    for i in 0..3 {
        h.detector.record_action_at(
            &mut bead,
            agent_id,
            "read_file",
            BTreeMap::from([("file_path".into(), "src/lib.rs".into())]),
            past + Duration::seconds(i),
        );
    }
    h.store.upsert_bead(&bead).await.unwrap();

    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.skipped.get("stuck_remediated"), Some(&1));

    // The original is blocked behind a fresh P1 remediation task.
    let blocked = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert_eq!(blocked.status, BeadStatus::Blocked);
    let remediation_id = Uuid::parse_str(
        blocked.context.get(context::REMEDIATION_BEAD_ID).unwrap(),
    )
    .unwrap();
    assert!(blocked.depends_on.contains(&remediation_id));
    assert!(blocked.context.contains_key(context::LOOP_DETECTION_REASON));

    let remediation = h.store.get_bead(remediation_id).await.unwrap().unwrap();
    assert_eq!(remediation.priority, Priority::P1);
    assert_eq!(remediation.bead_type, BeadType::Task);
    assert!(remediation.title.starts_with("[remediation]"));
    assert!(remediation.description.as_deref().unwrap().contains("stuck"));

    // Remediation closes; the next pass reopens the original with its loop
    // memory cleared, and it dispatches again.
    let mut remediation = remediation;
    remediation.set_status(BeadStatus::Closed);
    h.store.upsert_bead(&remediation).await.unwrap();

    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 1);
    let reopened = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert_eq!(reopened.status, BeadStatus::InProgress);
    assert!(!reopened.context.contains_key(context::REMEDIATION_BEAD_ID));
    assert!(!reopened.context.contains_key(context::ACTION_HISTORY));
}

// ---------------------------------------------------------------------------
// Domain skips: dependencies and providers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_dependencies_defer_dispatch() {
    let h = Harness::new().await;
    h.with_single_node_workflow(AgentRole::SoftwareEngineer, NodeType::Task);
    h.add_agent(AgentRole::SoftwareEngineer).await;
    h.add_provider().await;

    let mut blocker = h.add_bead(BeadType::Task, Priority::P2).await;
    let mut dependent = Bead::new("second step", PROJECT, BeadType::Task, Priority::P0);
    dependent.depends_on = vec![blocker.id];
    h.store.upsert_bead(&dependent).await.unwrap();

    // P0 scans first but its dependency is open: only the blocker runs.
    let rx = h.subscribe_tasks();
    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.skipped.get("dependencies_open"), Some(&1));
    assert_eq!(h.recv_task(&rx).bead_id, blocker.id);

    // Close the blocker; the dependent dispatches.
    blocker = h.store.get_bead(blocker.id).await.unwrap().unwrap();
    blocker.set_status(BeadStatus::Closed);
    blocker.assignee = None;
    h.store.upsert_bead(&blocker).await.unwrap();
    // Free the agent for the next pass.
    let agents = h.store.list_agents(None, None, None).await.unwrap();
    for mut agent in agents {
        agent.status = loom_core::types::AgentStatus::Idle;
        agent.current_bead = None;
        h.store.upsert_agent(&agent).await.unwrap();
    }

    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.recv_task(&rx).bead_id, dependent.id);
}

#[tokio::test]
async fn no_active_provider_defers_dispatch() {
    let h = Harness::new().await;
    h.with_single_node_workflow(AgentRole::SoftwareEngineer, NodeType::Task);
    h.add_agent(AgentRole::SoftwareEngineer).await;
    let bead = h.add_bead(BeadType::Task, Priority::P2).await;

    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.skipped.get("no_provider"), Some(&1));

    // The bead is untouched and retries next tick once a provider shows up.
    let untouched = h.store.get_bead(bead.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, BeadStatus::Open);
    assert_eq!(context::get_counter(&untouched.context, context::DISPATCH_COUNT), 0);

    h.add_provider().await;
    let report = h.dispatcher.run_pass().await.unwrap();
    assert_eq!(report.dispatched, 1);
}

// ---------------------------------------------------------------------------
// Live tuning clamps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hop_cap_tuning_clamps_to_default() {
    let h = Harness::new().await;
    assert_eq!(h.dispatcher.max_dispatch_hops(), 20);
    h.dispatcher.set_max_dispatch_hops(-5);
    assert_eq!(h.dispatcher.max_dispatch_hops(), 20);
    h.dispatcher.set_max_dispatch_hops(0);
    assert_eq!(h.dispatcher.max_dispatch_hops(), 20);
    h.dispatcher.set_max_dispatch_hops(7);
    assert_eq!(h.dispatcher.max_dispatch_hops(), 7);
}
