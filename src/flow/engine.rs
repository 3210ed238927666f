use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::executor::ExecutorRegistry;
use crate::flow::definition::{ErrorHandling, FlowDefinition};
use crate::flow::registry::FlowRegistry;
use crate::flow::store::{SharedThreadStore, StoreError};
use crate::flow::thread::{ConversationStep, ConversationThread, StepInput, StepStatus, ThreadStatus};
use crate::node::{requires_input, NodeContext, NodeExecutor};
use crate::ports::Ports;
use crate::process::manager::register_builtins;

pub const DEFAULT_MAX_CHAIN_STEPS: usize = 100;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow `{0}` is not registered")]
    FlowNotFound(String),

    #[error("flow `{0}` has no start node")]
    StartNodeNotFound(String),

    #[error("thread `{0}` not found")]
    ThreadNotFound(String),

    #[error("thread `{thread_id}` is {status}, not active")]
    ThreadNotActive { thread_id: String, status: ThreadStatus },

    #[error("node `{node_id}` not found in flow `{flow_id}`")]
    NodeNotFound { flow_id: String, node_id: String },

    #[error("no executor registered for node type `{0}`")]
    ExecutorNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The registries an engine dispatches against.
#[derive(Debug, Default)]
pub struct EngineRuntime {
    pub executors: ExecutorRegistry,
    pub flows: FlowRegistry,
}

impl EngineRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime with every built-in executor wired to `ports`.
    pub fn with_builtins(ports: &Ports, config: &EngineConfig) -> Self {
        let runtime = Self::default();
        register_builtins(&runtime.executors, ports, config);
        runtime
    }
}

/// What the chain does after a failed step.
enum AfterFailure {
    Stop,
    Continue,
}

/// Drives conversation threads through their flows.
///
/// Calls for the same thread are serialised: a second message waits for the
/// first to finish, in arrival order.
pub struct FlowEngine {
    runtime: Arc<EngineRuntime>,
    store: SharedThreadStore,
    locks: DashMap<String, Arc<Mutex<()>>>,
    max_chain_steps: usize,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("runtime", &self.runtime)
            .field("store", &self.store)
            .field("max_chain_steps", &self.max_chain_steps)
            .finish()
    }
}

impl FlowEngine {
    pub fn new(runtime: Arc<EngineRuntime>, store: SharedThreadStore) -> Self {
        Self {
            runtime,
            store,
            locks: DashMap::new(),
            max_chain_steps: DEFAULT_MAX_CHAIN_STEPS,
        }
    }

    pub fn with_max_chain_steps(mut self, max: usize) -> Self {
        self.max_chain_steps = max.max(1);
        self
    }

    pub fn runtime(&self) -> &Arc<EngineRuntime> {
        &self.runtime
    }

    pub fn store(&self) -> &SharedThreadStore {
        &self.store
    }

    pub fn register_flow(&self, flow: FlowDefinition) -> Arc<FlowDefinition> {
        self.runtime.flows.register_flow(flow)
    }

    pub fn register_node_executor(&self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.runtime.executors.register(node_type, executor);
    }

    fn lock_for(&self, thread_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(thread_id.to_string()).or_default().clone()
    }

    /// Take the thread's lock, then load it. Ids the store does not know never
    /// leave an entry in the lock table.
    async fn lock_thread(&self, thread_id: &str) -> Result<(OwnedMutexGuard<()>, ConversationThread), EngineError> {
        if !self.locks.contains_key(thread_id) && self.store.load(thread_id).await?.is_none() {
            return Err(EngineError::ThreadNotFound(thread_id.to_string()));
        }
        let guard = self.lock_for(thread_id).lock_owned().await;
        match self.store.load(thread_id).await {
            Ok(Some(thread)) => Ok((guard, thread)),
            Ok(None) => {
                self.release(thread_id, guard);
                Err(EngineError::ThreadNotFound(thread_id.to_string()))
            }
            Err(e) => {
                self.release(thread_id, guard);
                Err(e.into())
            }
        }
    }

    /// Drop the lock entry of a thread that no longer exists. The entry stays
    /// while anyone besides the table and `guard` still holds the mutex.
    fn release(&self, thread_id: &str, guard: OwnedMutexGuard<()>) {
        self.locks.remove_if(thread_id, |_, lock| Arc::strong_count(lock) <= 2);
        drop(guard);
    }

    /// The definition a thread runs on: the version it started with, or the
    /// latest one when that version is no longer registered.
    fn flow_for(&self, thread: &mut ConversationThread) -> Result<Arc<FlowDefinition>, EngineError> {
        let flow_id = thread.flow_id().unwrap_or_default().to_string();
        let pinned = thread.flow_version();
        if let Some(flow) = pinned.and_then(|v| self.runtime.flows.get_version(&flow_id, v)) {
            return Ok(flow);
        }
        let latest = self
            .runtime
            .flows
            .get(&flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;
        warn!(thread_id = %thread.id, flow_id = %flow_id, pinned = ?pinned, latest = latest.version, "pinned flow version is gone, moving to latest");
        thread.metadata.insert("flowVersion".into(), json!(latest.version));
        Ok(latest)
    }

    /// Create a thread on `flow_id` and run it until it waits, completes or fails.
    #[tracing::instrument(name = "start_conversation", skip(self, initial_variables), fields(flow_id = %flow_id))]
    pub async fn start_conversation(
        &self,
        user_id: &str,
        address: &str,
        flow_id: &str,
        start_node_id: Option<&str>,
        initial_variables: Option<Map<String, Value>>,
    ) -> Result<ConversationThread, EngineError> {
        let started = Instant::now();
        let flow = self
            .runtime
            .flows
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;
        let start = flow
            .resolve_start_node(start_node_id)
            .ok_or_else(|| EngineError::StartNodeNotFound(flow_id.to_string()))?;
        if !self.runtime.executors.contains(&start.node_type) {
            return Err(EngineError::ExecutorNotFound(start.node_type.clone()));
        }

        let mut thread = ConversationThread::new(user_id, address, &start.id);
        let now = thread.started_at;
        thread.variables.set("userId", json!(user_id));
        thread.variables.set("address", json!(address));
        thread.variables.set("phoneNumber", json!(address));
        thread.variables.set("threadId", json!(thread.id));
        thread.variables.set("startTime", json!(now.to_rfc3339()));
        thread.variables.merge(flow.default_variables());
        if let Some(vars) = initial_variables {
            thread.variables.merge(vars);
        }
        thread.metadata.insert("flowId".into(), json!(flow.id));
        thread.metadata.insert("flowVersion".into(), json!(flow.version));
        thread.metadata.insert("flowName".into(), json!(flow.name));

        let lock = self.lock_for(&thread.id);
        let _guard = lock.lock().await;
        self.store.save(&thread).await?;
        info!(thread_id = %thread.id, user_id, start_node = %start.id, "conversation started");

        let outcome = self.execute_current_node(&flow, &mut thread, None, None).await;
        self.store.save(&thread).await?;
        let steps = outcome?;
        log_request("start_conversation", &thread, steps, started);
        Ok(thread)
    }

    /// Feed a user message into an active thread.
    #[tracing::instrument(name = "process_user_message", skip(self, message, input))]
    pub async fn process_user_message(
        &self,
        thread_id: &str,
        message: &str,
        input: Option<Value>,
    ) -> Result<ConversationThread, EngineError> {
        let started = Instant::now();
        let (_guard, mut thread) = self.lock_thread(thread_id).await?;
        if !thread.is_active() {
            return Err(EngineError::ThreadNotActive {
                thread_id: thread_id.to_string(),
                status: thread.status,
            });
        }
        let flow = self.flow_for(&mut thread)?;

        thread.last_activity = Utc::now();
        debug!(thread_id, node_id = %thread.current_node_id, "📨 user message");
        let outcome = self
            .execute_current_node(&flow, &mut thread, Some(message.to_string()), input)
            .await;
        self.store.save(&thread).await?;
        let steps = outcome?;
        log_request("process_user_message", &thread, steps, started);
        Ok(thread)
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<ConversationThread>, EngineError> {
        Ok(self.store.load(thread_id).await?)
    }

    /// Stop an active thread from taking further messages until it is reset.
    pub async fn pause_thread(&self, thread_id: &str) -> Result<ConversationThread, EngineError> {
        let (_guard, mut thread) = self.lock_thread(thread_id).await?;
        if !thread.is_active() {
            return Err(EngineError::ThreadNotActive {
                thread_id: thread_id.to_string(),
                status: thread.status,
            });
        }
        thread.status = ThreadStatus::Paused;
        thread.last_activity = Utc::now();
        self.store.save(&thread).await?;
        info!(thread_id, "thread paused");
        Ok(thread)
    }

    /// Make a thread active again, optionally moving it to `node_id`. Nothing
    /// runs until the next user message.
    pub async fn reset_thread(&self, thread_id: &str, node_id: Option<&str>) -> Result<ConversationThread, EngineError> {
        let (_guard, mut thread) = self.lock_thread(thread_id).await?;

        if let Some(node_id) = node_id {
            let flow = self.flow_for(&mut thread)?;
            if flow.node(node_id).is_none() {
                return Err(EngineError::NodeNotFound {
                    flow_id: flow.id.clone(),
                    node_id: node_id.to_string(),
                });
            }
            thread.current_node_id = node_id.to_string();
        }
        let previous = thread.status;
        thread.status = ThreadStatus::Active;
        thread.last_activity = Utc::now();
        self.store.save(&thread).await?;
        info!(thread_id, from = %previous, node_id = %thread.current_node_id, "thread reset");
        Ok(thread)
    }

    /// Remove threads that are no longer active and have been idle for longer
    /// than `max_age`. Returns how many were removed.
    ///
    /// Each candidate is re-read under its thread lock, so a call that revives
    /// a thread while the sweep waits keeps it alive.
    pub async fn sweep_inactive(&self, max_age: Duration) -> Result<usize, EngineError> {
        let max_age = ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::MAX);
        let cutoff = Utc::now().checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut removed = 0;
        for listed in self.store.list().await? {
            if !sweepable(&listed, cutoff) {
                continue;
            }
            let guard = self.lock_for(&listed.id).lock_owned().await;
            match self.store.load(&listed.id).await? {
                Some(thread) if sweepable(&thread, cutoff) => {
                    if self.store.remove(&thread.id).await? {
                        removed += 1;
                        trace!(thread_id = %thread.id, status = %thread.status, "swept thread");
                    }
                    self.release(&thread.id, guard);
                }
                Some(_) => trace!(thread_id = %listed.id, "thread touched since listing, kept"),
                None => self.release(&listed.id, guard),
            }
        }
        if removed > 0 {
            info!("Swept {} inactive threads", removed);
        }
        Ok(removed)
    }

    /// Run [`sweep_inactive`](Self::sweep_inactive) every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sweep_inactive(max_age).await {
                    warn!("thread sweep failed: {}", e);
                }
            }
        })
    }

    /// Execute the thread's current node and keep following silent successors.
    ///
    /// A missing node or executor is recorded as an error step and goes through
    /// the flow's error policy. If that leaves the thread in error before any
    /// node ran, the lookup error is also returned. Returns the number of nodes
    /// executed.
    async fn execute_current_node(
        &self,
        flow: &FlowDefinition,
        thread: &mut ConversationThread,
        message: Option<String>,
        input: Option<Value>,
    ) -> Result<usize, EngineError> {
        let limit = flow
            .settings
            .max_steps
            .filter(|n| *n > 0)
            .unwrap_or(self.max_chain_steps);
        let mut message = message;
        let mut input = input;
        let mut executed = 0usize;

        loop {
            let node_id = thread.current_node_id.clone();
            let Some(node) = flow.node(&node_id).cloned() else {
                let err = EngineError::NodeNotFound {
                    flow_id: flow.id.clone(),
                    node_id: node_id.clone(),
                };
                warn!(thread_id = %thread.id, "{}", err);
                match self.fail_lookup(flow, thread, &node_id, "unknown", &err) {
                    AfterFailure::Continue => continue,
                    AfterFailure::Stop if executed == 0 && thread.status == ThreadStatus::Error => return Err(err),
                    AfterFailure::Stop => break,
                }
            };
            let Some(executor) = self.runtime.executors.get(&node.node_type) else {
                let err = EngineError::ExecutorNotFound(node.node_type.clone());
                warn!(thread_id = %thread.id, node_id = %node.id, "{}", err);
                match self.fail_lookup(flow, thread, &node.id, &node.node_type, &err) {
                    AfterFailure::Continue => continue,
                    AfterFailure::Stop if executed == 0 && thread.status == ThreadStatus::Error => return Err(err),
                    AfterFailure::Stop => break,
                }
            };
            if executed >= limit {
                let step = ConversationStep::new(&node.id, &node.node_type, StepStatus::Error)
                    .with_error(format!("chain limit of {} steps reached", limit));
                warn!(thread_id = %thread.id, node_id = %node.id, limit, "chain limit reached");
                thread.history.push(step);
                thread.status = ThreadStatus::Error;
                break;
            }
            executed += 1;

            let step_input = StepInput {
                message: message.clone(),
                input: input.clone(),
            };
            let mut ctx = NodeContext::new(
                thread.id.clone(),
                thread.user_id.clone(),
                thread.address.clone(),
                node.clone(),
                thread.variables.clone(),
            )
            .with_message(message.take())
            .with_input(input.take())
            .with_previous_step(thread.last_step().cloned())
            .with_verbose(flow.settings.logging);

            let started = Instant::now();
            let outcome = executor.execute(&mut ctx).await;
            let duration = started.elapsed().as_millis() as u64;
            let (variables, scheduled, logs) = ctx.into_parts();
            thread.last_activity = Utc::now();

            let mut step = ConversationStep::new(&node.id, &node.node_type, StepStatus::Completed)
                .with_input(step_input)
                .with_duration(duration);
            if !logs.is_empty() {
                step = step.with_metadata("logs", json!(logs));
            }

            let result = match outcome {
                Err(e) => {
                    error!(thread_id = %thread.id, node_id = %node.id, executor = executor.name(), "node failed: {}", e);
                    step.status = StepStatus::Error;
                    step.error = Some(e.to_string());
                    match self.fail(flow, thread, step) {
                        AfterFailure::Stop => break,
                        AfterFailure::Continue => continue,
                    }
                }
                Ok(result) if !result.success => {
                    let reason = result.error.clone().unwrap_or_else(|| "node reported failure".to_string());
                    warn!(thread_id = %thread.id, node_id = %node.id, "node unsuccessful: {}", reason);
                    step.status = StepStatus::Error;
                    step.output = result.output;
                    step.error = Some(reason);
                    match self.fail(flow, thread, step) {
                        AfterFailure::Stop => break,
                        AfterFailure::Continue => continue,
                    }
                }
                Ok(result) => result,
            };

            thread.variables = variables;
            if let Some(patch) = result.variables {
                thread.variables.merge(patch);
            }
            step.output = result.output;
            if let Some(handle) = result.handle.as_deref() {
                step = step.with_metadata("handle", json!(handle));
            }

            if result.waiting_for_input {
                step.status = StepStatus::Pending;
                thread.history.push(step);
                thread.status = ThreadStatus::Active;
                trace!(thread_id = %thread.id, node_id = %node.id, "waiting for input");
                break;
            }

            let next = result
                .next_node_id
                .or(scheduled)
                .or_else(|| flow.next_node_for(&node.id, result.handle.as_deref()).map(str::to_string));
            let Some(next) = next else {
                thread.history.push(step);
                thread.status = ThreadStatus::Completed;
                debug!(thread_id = %thread.id, node_id = %node.id, "✅ flow completed");
                break;
            };

            step = step.with_metadata("nextNodeId", json!(next));
            thread.history.push(step);
            thread.current_node_id = next.clone();
            if flow.node(&next).map(requires_input).unwrap_or(false) {
                trace!(thread_id = %thread.id, node_id = %next, "next node needs input, stopping");
                break;
            }
        }
        Ok(executed)
    }

    /// Record a failed step and apply the flow's error policy. With a fallback
    /// the thread moves on (or stops before an input node); otherwise it errors.
    fn fail(&self, flow: &FlowDefinition, thread: &mut ConversationThread, step: ConversationStep) -> AfterFailure {
        thread.history.push(step);
        match &flow.settings.error_handling {
            ErrorHandling::Fallback { node_id } if flow.node(node_id).is_some() => {
                info!(thread_id = %thread.id, fallback = %node_id, "continuing at fallback node");
                thread.current_node_id = node_id.clone();
                thread.status = ThreadStatus::Active;
                if flow.node(node_id).map(requires_input).unwrap_or(false) {
                    AfterFailure::Stop
                } else {
                    AfterFailure::Continue
                }
            }
            _ => {
                thread.status = ThreadStatus::Error;
                AfterFailure::Stop
            }
        }
    }

    /// [`fail`](Self::fail) for a node that could not be resolved. A fallback
    /// that points back at the same node ends the thread instead of spinning.
    fn fail_lookup(
        &self,
        flow: &FlowDefinition,
        thread: &mut ConversationThread,
        node_id: &str,
        node_type: &str,
        err: &EngineError,
    ) -> AfterFailure {
        let step = ConversationStep::new(node_id, node_type, StepStatus::Error).with_error(err.to_string());
        match self.fail(flow, thread, step) {
            AfterFailure::Continue if thread.current_node_id == node_id => {
                thread.status = ThreadStatus::Error;
                AfterFailure::Stop
            }
            after => after,
        }
    }
}

fn sweepable(thread: &ConversationThread, cutoff: DateTime<Utc>) -> bool {
    !thread.is_active() && thread.last_activity < cutoff
}

fn log_request(operation: &str, thread: &ConversationThread, steps: usize, started: Instant) {
    info!(
        target: "request",
        operation,
        thread_id = %thread.id,
        flow_id = thread.flow_id().unwrap_or_default(),
        node_id = %thread.current_node_id,
        steps,
        status = %thread.status,
        latency_ms = started.elapsed().as_millis() as u64,
        "engine call"
    );
}
