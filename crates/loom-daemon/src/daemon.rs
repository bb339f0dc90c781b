use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use loom_bridge::event_bus::EventBus;
use loom_core::config::LoomConfig;
use loom_core::store::Store;
use loom_dispatch::audit::{AuditRunner, ShellRunner};
use loom_dispatch::dispatcher::Dispatcher;
use loom_dispatch::escalation::StoreEscalator;
use loom_dispatch::loop_detector::LoopDetector;
use loom_dispatch::shutdown::ShutdownSignal;
use loom_providers::registry::ProviderRegistry;
use loom_providers::scorer::ScorerWeights;
use loom_workflow::definition::{default_bug_workflow, default_feature_workflow};
use loom_workflow::engine::WorkflowEngine;

/// How many background loops participate in drain accounting.
const DRAIN_PARTICIPANTS: usize = 3;

/// The loom control-plane daemon.
///
/// Owns the store, the in-process bus, the provider registry, the workflow
/// engine, the dispatcher, and the audit runner; spawns their loops and
/// shuts them down gracefully when signalled.
pub struct Daemon {
    config: LoomConfig,
    store: Arc<Store>,
    bus: EventBus,
    registry: Arc<ProviderRegistry>,
    dispatcher: Arc<Dispatcher>,
    audit: Arc<AuditRunner>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Construct a daemon from config, opening (or creating) the store.
    pub async fn new(mut config: LoomConfig) -> Result<Self> {
        config.clamp();

        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        if config.store.path.starts_with("~/") {
            config.store.path = config.store.path.replacen('~', &home, 1);
        }
        if let Some(parent) = std::path::Path::new(&config.store.path).parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let store = Arc::new(
            Store::new(&config.store.path)
                .await
                .context("failed to open store")?,
        );
        Self::with_store(config, store).await
    }

    /// Construct a daemon over an existing store (used by tests with the
    /// in-memory store).
    pub async fn with_store(config: LoomConfig, store: Arc<Store>) -> Result<Self> {
        let bus = EventBus::new();
        let project_id = config.general.project_id.clone();

        let weights = ScorerWeights {
            size: config.scorer.size,
            rtt: config.scorer.rtt,
            request_latency: config.scorer.request_latency,
            cost: config.scorer.cost,
        };
        let registry = Arc::new(ProviderRegistry::new(weights));
        for provider in store.list_providers().await? {
            registry.register(provider).await;
        }

        let engine = Arc::new(WorkflowEngine::new(config.workflow.max_cycles));
        engine
            .register_definition(default_bug_workflow())
            .context("invalid built-in bug workflow")?;
        engine
            .register_definition(default_feature_workflow())
            .context("invalid built-in feature workflow")?;

        let detector = Arc::new(LoopDetector::new(
            config.loop_detector.repeat_threshold as usize,
            chrono::Duration::seconds(config.loop_detector.stuck_idle_window_secs as i64),
        ));
        let escalator = Arc::new(StoreEscalator::new(store.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            bus.clone(),
            registry.clone(),
            engine.clone(),
            detector,
            escalator,
            project_id.clone(),
            &config.dispatcher,
        ));

        let audit = Arc::new(AuditRunner::new(
            Some(store.clone()),
            Arc::new(ShellRunner),
            config.audit.clone(),
            project_id,
        ));

        Ok(Self {
            config,
            store,
            bus,
            registry,
            dispatcher,
            audit,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &LoomConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// A handle that can trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Spawn the dispatcher tick loop, the result loop, and the audit loop,
    /// then wait for shutdown and drain.
    pub async fn run(&self) -> Result<()> {
        info!(project_id = %self.config.general.project_id, "loom daemon starting loops");

        // Subscribe before spawning so an early trigger is never missed.
        let mut rx = self.shutdown.subscribe();

        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await });

        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { dispatcher.run_result_loop(shutdown).await });

        let audit = self.audit.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { audit.run_loop(shutdown).await });

        // Park until shutdown, then give the loops a bounded drain window.
        let _ = rx.recv().await;

        let mut shutdown = self.shutdown.clone();
        let drained = shutdown
            .wait_for_drain(DRAIN_PARTICIPANTS, Duration::from_secs(10))
            .await;
        info!(drained, "loom daemon stopped");
        Ok(())
    }
}
