//! Engine handle
//!
//! Wires the store, hub, catalog, flow engine, and health supervisor into
//! one explicit dependency passed to every consumer; nothing here is a
//! singleton.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use strand_domain::{ExecutionPlan, Flow, Step};

use crate::catalog::{Catalog, CatalogError, EngineState};
use crate::event::{EventHub, EventStore, EventStoreError, MemoryEventStore};
use crate::flow::{FlowEngine, FlowError, FlowQuery, StartFlow};
use crate::health::{HealthConfig, HealthSupervisor};
use crate::invoke::{HttpInvoker, StepInvoker};

// =============================================================================
// Configuration
// =============================================================================

/// Engine-level configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Public base URL embedded in async webhook callback URLs
    pub callback_base: String,

    /// Health supervisor timing
    pub health: HealthConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            callback_base: "http://localhost:3000".to_string(),
            health: HealthConfig::default(),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The single handle over the orchestration core
pub struct Engine {
    hub: Arc<EventHub>,
    catalog: Arc<Catalog>,
    flows: Arc<FlowEngine>,
    client: reqwest::Client,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl Engine {
    /// Build an engine over an injected store and invoker.
    ///
    /// The store must publish its commits to `hub`.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        hub: Arc<EventHub>,
        invoker: Arc<dyn StepInvoker>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let catalog = Arc::new(Catalog::new(Arc::clone(&store)));
        let flows = Arc::new(FlowEngine::new(
            store,
            invoker,
            config.callback_base.clone(),
        ));

        Arc::new(Self {
            hub,
            catalog,
            flows,
            client: reqwest::Client::new(),
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Build an engine with the in-memory store and the HTTP invoker
    #[must_use]
    pub fn in_memory(config: EngineConfig) -> Arc<Self> {
        let hub = Arc::new(EventHub::new());
        let store = Arc::new(MemoryEventStore::new(Arc::clone(&hub)));
        let client = reqwest::Client::new();
        Self::new(
            store,
            hub,
            Arc::new(HttpInvoker::new(client)),
            config,
        )
    }

    /// The process-wide event hub, for subscription layers
    #[must_use]
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Cancellation token covering engine background work
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    // =========================================================================
    // Catalog operations
    // =========================================================================

    pub async fn register_step(&self, step: Step) -> Result<(), CatalogError> {
        self.catalog.register(step).await
    }

    pub async fn update_step(&self, step: Step) -> Result<(), CatalogError> {
        self.catalog.update(step).await
    }

    /// Unregister a step, refusing while an active flow references it
    pub async fn unregister_step(&self, step_id: &str) -> Result<(), CatalogError> {
        let in_use = self
            .flows
            .step_in_use(step_id)
            .await
            .map_err(|e| CatalogError::Store(EventStoreError::Unavailable(e.to_string())))?;
        if in_use {
            return Err(CatalogError::StepInUse(step_id.to_string()));
        }
        self.catalog.unregister(step_id).await
    }

    pub async fn get_step(&self, step_id: &str) -> Result<Step, CatalogError> {
        let (state, _) = self
            .catalog
            .state()
            .await
            .map_err(CatalogError::Store)?;
        state
            .steps
            .get(step_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(step_id.to_string()))
    }

    /// Catalog projection and its next sequence
    pub async fn engine_state(&self) -> Result<(EngineState, i64), EventStoreError> {
        self.catalog.state().await
    }

    // =========================================================================
    // Planning and flows
    // =========================================================================

    /// Derive a plan without starting a flow
    pub async fn plan_preview(
        &self,
        goals: &[String],
        init: &BTreeMap<String, serde_json::Value>,
    ) -> Result<ExecutionPlan, FlowError> {
        let (state, _) = self.catalog.state().await.map_err(FlowError::Store)?;
        Ok(crate::planner::plan(&state.steps, goals, init)?)
    }

    /// Start a flow against the current catalog
    pub async fn start_flow(&self, request: StartFlow) -> Result<Flow, FlowError> {
        let (state, _) = self.catalog.state().await.map_err(FlowError::Store)?;
        self.flows.start(&state.steps, request).await
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<Flow, FlowError> {
        self.flows.get(flow_id).await
    }

    /// Flow projection and next sequence for subscriptions
    pub async fn flow_snapshot(
        &self,
        flow_id: &str,
    ) -> Result<(Option<Flow>, i64), EventStoreError> {
        self.flows.snapshot(flow_id).await
    }

    pub async fn query_flows(&self, query: &FlowQuery) -> Result<Vec<Flow>, FlowError> {
        self.flows.query(query).await
    }

    /// Webhook completion path
    pub async fn complete_work(
        &self,
        flow_id: &str,
        step_id: &str,
        token: &str,
        outputs: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), FlowError> {
        self.flows
            .complete_work(flow_id, step_id, Some(token), outputs)
            .await
    }

    /// Webhook failure path
    pub async fn fail_work(
        &self,
        flow_id: &str,
        step_id: &str,
        token: &str,
        error: String,
    ) -> Result<(), FlowError> {
        self.flows
            .fail_work(flow_id, step_id, Some(token), error)
            .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the health supervisor; runs until shutdown
    pub fn spawn_health(&self) -> JoinHandle<()> {
        let supervisor = Arc::new(HealthSupervisor::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.hub),
            self.client.clone(),
            self.config.health.clone(),
        ));
        supervisor.spawn(self.cancel.child_token())
    }

    /// Cancel background work and close the hub; consumers observe closed
    /// channels and exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.hub.close();
    }
}
