//! Pipeline orchestrator
//!
//! Builds runs from declarative configs, drives them under a scheduling
//! mode, tracks live status, and keeps a bounded history of terminal runs.
//! Every run ends in a terminal state that is visible through
//! [`PipelineOrchestrator::get_pipeline_status`], including runs that fail
//! with an error.

use super::events::{EventEmitter, PipelineEvent};
use super::planner::plan_stages;
use super::types::{
    AgentDefinition, AgentRun, ExecutionMode, HistoryQuery, Pipeline, PipelineConfig,
    PipelineHistoryEntry, PipelineResult, PipelineState, PipelineStatus,
};
use crate::agent::contract::{AgentInput, AgentOutput, ManagedAgent};
use crate::agent::registry::AgentRegistry;
use crate::config::OrchestratorSection;
use crate::context::{ContextManager, ContextMetadata};
use crate::error::{AgentError, AgentResult, ErrorKind, PipelineError};
use crate::observability::metrics::metrics;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Context key holding the run input
pub const INPUT_KEY: &str = "input";

/// Context key holding a successful agent's output data
pub fn result_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:result")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunSignal {
    Run,
    Pause,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Critical,
    Cancelled,
}

#[derive(Debug)]
struct ActiveRun {
    run_id: String,
    mode: ExecutionMode,
    context_id: String,
    emit_events: bool,
    status: PipelineStatus,
    control: watch::Sender<RunSignal>,
}

#[derive(Debug, Default)]
struct RunOutcome {
    agent_results: Vec<AgentRun>,
    errors: Vec<AgentError>,
    stop: Option<StopReason>,
}

impl RunOutcome {
    /// Fold one agent's result in; returns whether it reported a critical error
    fn absorb(&mut self, agent_id: &str, result: AgentResult<AgentOutput>) -> bool {
        match result {
            Ok(output) => {
                let critical = output.errors.iter().any(|e| e.critical);
                self.errors.extend(output.errors.iter().cloned());
                self.agent_results.push(AgentRun {
                    agent_id: agent_id.to_string(),
                    output,
                });
                critical
            }
            Err(e) => {
                let critical = e.critical;
                self.errors.push(e);
                critical
            }
        }
    }
}

/// Block while paused; returns false once the run is cancelled
async fn wait_for_go(control: &mut watch::Receiver<RunSignal>) -> bool {
    loop {
        let signal = *control.borrow_and_update();
        match signal {
            RunSignal::Run => return true,
            RunSignal::Cancel => return false,
            RunSignal::Pause => {
                if control.changed().await.is_err() {
                    return false;
                }
            }
        }
    }
}

fn skipped_error(pipeline_id: &str, agent_id: &str) -> AgentError {
    AgentError::agent_failure(format!("Agent {agent_id} skipped after a critical failure"))
        .critical(false)
        .retryable(false)
        .with_agent(agent_id)
        .with_pipeline(pipeline_id)
        .with_metadata("skipped", json!(true))
}

fn cancelled_error(pipeline_id: &str) -> AgentError {
    AgentError::new(
        ErrorKind::AgentFailure,
        format!("Pipeline {pipeline_id} was cancelled"),
    )
    .critical(true)
    .retryable(false)
    .with_pipeline(pipeline_id)
    .with_metadata("cancelled", json!(true))
}

/// Coordinates pipeline runs
///
/// Cheap to clone; clones share active runs, history, and event subscribers.
#[derive(Debug, Clone)]
pub struct PipelineOrchestrator {
    registry: AgentRegistry,
    contexts: ContextManager,
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
    history: Arc<RwLock<VecDeque<PipelineHistoryEntry>>>,
    events: EventEmitter,
    settings: OrchestratorSection,
}

impl PipelineOrchestrator {
    pub fn new(registry: AgentRegistry, contexts: ContextManager) -> Self {
        Self::with_settings(registry, contexts, OrchestratorSection::default())
    }

    pub fn with_settings(
        registry: AgentRegistry,
        contexts: ContextManager,
        settings: OrchestratorSection,
    ) -> Self {
        Self {
            registry,
            contexts,
            active: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            events: EventEmitter::new(settings.event_buffer),
            settings,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// Lifecycle events of pipelines created with `notifications.emit_events`
    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Validate `config` and allocate an unstarted run with its own context
    pub async fn create_pipeline(&self, config: PipelineConfig) -> Result<Pipeline, PipelineError> {
        let mut violations = config.violations();
        if violations.is_empty() && config.mode == ExecutionMode::Hybrid {
            if let Err(stage_violations) = plan_stages(&config.agents, &config.connections) {
                violations.extend(stage_violations);
            }
        }
        if !violations.is_empty() {
            warn!(pipeline_id = %config.id, violations = ?violations, "Rejected pipeline config");
            return Err(PipelineError::InvalidConfig { violations });
        }

        let metadata = ContextMetadata::owned_by(config.id.as_str()).with_tag("pipeline");
        let context = self.contexts.create_context(&config.id, metadata).await;
        let agent_context = self.contexts.agent_context(&context.id).await?;

        let run_id = Uuid::new_v4().to_string();
        {
            let mut active = self.active.write().await;
            if active.contains_key(&config.id) {
                drop(active);
                self.contexts.delete_context(&context.id).await;
                return Err(PipelineError::InvalidConfig {
                    violations: vec![format!("pipeline '{}' is already active", config.id)],
                });
            }
            let (control, _) = watch::channel(RunSignal::Run);
            active.insert(
                config.id.clone(),
                ActiveRun {
                    run_id: run_id.clone(),
                    mode: config.mode,
                    context_id: context.id.clone(),
                    emit_events: config.notifications.emit_events,
                    status: PipelineStatus::pending(&config.id, config.agents.len()),
                    control,
                },
            );
        }

        info!(
            pipeline_id = %config.id,
            context_id = %context.id,
            mode = ?config.mode,
            agents = config.agents.len(),
            "Pipeline created"
        );
        Ok(Pipeline {
            id: config.id.clone(),
            run_id,
            config,
            context: agent_context,
        })
    }

    /// Run a created pipeline to a terminal state
    ///
    /// A critical agent error ends the run as `failed` but still returns the
    /// partial result. Failures outside any single agent (missing agents,
    /// limits, the run deadline, a vanished context) return
    /// [`PipelineError::Execution`] after the failed status is recorded.
    pub async fn execute_pipeline(
        &self,
        pipeline: &Pipeline,
        input: Value,
    ) -> Result<PipelineResult, PipelineError> {
        let span = crate::pipeline_span!(
            pipeline_id = %pipeline.id,
            run_id = %pipeline.run_id,
            mode = ?pipeline.config.mode
        );
        self.execute_inner(pipeline, input).instrument(span).await
    }

    async fn execute_inner(
        &self,
        pipeline: &Pipeline,
        input: Value,
    ) -> Result<PipelineResult, PipelineError> {
        let control = {
            let mut active = self.active.write().await;
            let run = match active.get_mut(&pipeline.id) {
                Some(run) if run.run_id == pipeline.run_id => run,
                _ => return Err(PipelineError::NotFound(pipeline.id.clone())),
            };
            if run.status.state != PipelineState::Pending {
                return Err(AgentError::validation(format!(
                    "Pipeline {} has already been started",
                    pipeline.id
                ))
                .with_pipeline(pipeline.id.as_str())
                .into());
            }
            let now = Utc::now();
            run.status.state = PipelineState::Running;
            run.status.started_at = Some(now);
            run.status.updated_at = now;
            run.control.subscribe()
        };

        let started = Instant::now();
        metrics().record_pipeline_started();
        self.events.emit(
            pipeline.config.notifications.emit_events,
            PipelineEvent::Started {
                pipeline_id: pipeline.id.clone(),
                total_agents: pipeline.config.agents.len(),
            },
        );
        info!(agents = pipeline.config.agents.len(), "Pipeline started");

        let run = self.run(pipeline, input, control);
        let outcome = match pipeline.config.timeouts.pipeline_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AgentError::timeout(format!(
                    "Pipeline {} exceeded its {ms}ms deadline",
                    pipeline.id
                ))),
            },
            None => run.await,
        };

        self.finish(pipeline, outcome, started.elapsed()).await
    }

    async fn run(
        &self,
        pipeline: &Pipeline,
        input: Value,
        mut control: watch::Receiver<RunSignal>,
    ) -> AgentResult<RunOutcome> {
        let config = &pipeline.config;
        if let Some(max_agents) = config.resource_limits.max_agents {
            if config.agents.len() > max_agents {
                return Err(AgentError::resource_exhausted(format!(
                    "Pipeline declares {} agents, limit is {max_agents}",
                    config.agents.len()
                )));
            }
        }

        let agents = self.resolve_agents(config)?;
        pipeline.context.set(INPUT_KEY, input.clone()).await?;

        let metadata = HashMap::from([("pipeline_id".to_string(), json!(pipeline.id))]);
        let agent_input = AgentInput::new(input)
            .with_metadata(metadata)
            .with_correlation_id(pipeline.run_id.as_str());

        let outcome = match config.mode {
            ExecutionMode::Sequential => {
                self.run_sequential(pipeline, &agents, &agent_input, &mut control)
                    .await
            }
            ExecutionMode::Parallel => {
                let all: Vec<usize> = (0..agents.len()).collect();
                let mut outcome = RunOutcome::default();
                self.run_stage(pipeline, &agents, &all, &agent_input, &control, &mut outcome)
                    .await;
                outcome
            }
            ExecutionMode::Hybrid => {
                let stages = plan_stages(&config.agents, &config.connections)
                    .map_err(|v| AgentError::validation_violations("Pipeline stages", v))?;
                self.run_hybrid(pipeline, &agents, &stages, &agent_input, &control)
                    .await
            }
        };
        Ok(outcome)
    }

    fn resolve_agents(&self, config: &PipelineConfig) -> AgentResult<Vec<Arc<ManagedAgent>>> {
        let mut agents = Vec::with_capacity(config.agents.len());
        let mut missing = Vec::new();
        for definition in &config.agents {
            match self.registry.get_agent(&definition.id) {
                Some(agent) => agents.push(agent),
                None => missing.push(format!("agent '{}' is not registered", definition.id)),
            }
        }
        if missing.is_empty() {
            Ok(agents)
        } else {
            Err(AgentError::validation_violations("Pipeline agents", missing))
        }
    }

    async fn run_sequential(
        &self,
        pipeline: &Pipeline,
        agents: &[Arc<ManagedAgent>],
        input: &AgentInput,
        control: &mut watch::Receiver<RunSignal>,
    ) -> RunOutcome {
        let definitions = &pipeline.config.agents;
        let mut outcome = RunOutcome::default();

        for (index, (definition, agent)) in definitions.iter().zip(agents).enumerate() {
            if !wait_for_go(control).await {
                outcome.stop = Some(StopReason::Cancelled);
                break;
            }

            self.update_status(&pipeline.id, &pipeline.run_id, |status| {
                status.current_agent = Some(definition.id.clone());
            })
            .await;

            let result = self.invoke(pipeline, definition, agent, input).await;
            self.mark_settled(pipeline, &definition.id, &result).await;

            if outcome.absorb(&definition.id, result) {
                warn!(agent_id = %definition.id, "Critical failure, stopping pipeline");
                outcome.stop = Some(StopReason::Critical);
                outcome.errors.extend(
                    definitions[index + 1..]
                        .iter()
                        .map(|d| skipped_error(&pipeline.id, &d.id)),
                );
                break;
            }
        }
        outcome
    }

    async fn run_hybrid(
        &self,
        pipeline: &Pipeline,
        agents: &[Arc<ManagedAgent>],
        stages: &[Vec<usize>],
        input: &AgentInput,
        control: &watch::Receiver<RunSignal>,
    ) -> RunOutcome {
        let definitions = &pipeline.config.agents;
        let mut outcome = RunOutcome::default();

        for (stage_index, stage) in stages.iter().enumerate() {
            debug!(stage = stage_index, agents = stage.len(), "Starting stage");
            let critical = self
                .run_stage(pipeline, agents, stage, input, control, &mut outcome)
                .await;
            if outcome.stop.is_some() {
                break;
            }
            if critical {
                warn!(stage = stage_index, "Critical failure, skipping later stages");
                outcome.stop = Some(StopReason::Critical);
                outcome.errors.extend(
                    stages[stage_index + 1..]
                        .iter()
                        .flatten()
                        .map(|&i| skipped_error(&pipeline.id, &definitions[i].id)),
                );
                break;
            }
        }
        outcome
    }

    /// Run the agents at `indexes` concurrently and fold their results into
    /// `outcome` in declaration order; returns whether any was critical
    async fn run_stage(
        &self,
        pipeline: &Pipeline,
        agents: &[Arc<ManagedAgent>],
        indexes: &[usize],
        input: &AgentInput,
        control: &watch::Receiver<RunSignal>,
        outcome: &mut RunOutcome,
    ) -> bool {
        let definitions = &pipeline.config.agents;
        let semaphore = pipeline
            .config
            .resource_limits
            .max_concurrency
            .map(Semaphore::new);

        let runs = indexes.iter().map(|&index| {
            let mut control = control.clone();
            let semaphore = semaphore.as_ref();
            async move {
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire().await.ok(),
                    None => None,
                };
                if !wait_for_go(&mut control).await {
                    return (index, None);
                }
                let definition = &definitions[index];
                let result = self.invoke(pipeline, definition, &agents[index], input).await;
                self.mark_settled(pipeline, &definition.id, &result).await;
                (index, Some(result))
            }
        });

        let mut critical = false;
        for (index, result) in join_all(runs).await {
            match result {
                Some(result) => critical |= outcome.absorb(&definitions[index].id, result),
                None => outcome.stop = Some(StopReason::Cancelled),
            }
        }
        critical
    }

    async fn invoke(
        &self,
        pipeline: &Pipeline,
        definition: &AgentDefinition,
        agent: &ManagedAgent,
        input: &AgentInput,
    ) -> AgentResult<AgentOutput> {
        let config = &pipeline.config;
        let context = pipeline
            .context
            .clone()
            .with_agent_config(definition.config.clone())
            .with_retries_override(config.agent_retries(definition));

        agent.initialize(&context).await?;
        let mut output = agent
            .process_with_timeout(&context, input.clone(), config.agent_timeout(definition))
            .await?;

        for e in &mut output.errors {
            if e.pipeline_id.is_none() {
                e.pipeline_id = Some(pipeline.id.clone());
            }
        }
        if output.success {
            pipeline
                .context
                .set(&result_key(&definition.id), output.data.clone())
                .await
                .map_err(|e| {
                    e.with_agent(definition.id.as_str())
                        .with_pipeline(pipeline.id.as_str())
                })?;
        }
        Ok(output)
    }

    /// Apply `f` to the live status; false when the run is no longer active
    async fn update_status<F>(&self, pipeline_id: &str, run_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut PipelineStatus),
    {
        let mut active = self.active.write().await;
        match active.get_mut(pipeline_id) {
            Some(run) if run.run_id == run_id => {
                f(&mut run.status);
                run.status.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    async fn mark_settled(
        &self,
        pipeline: &Pipeline,
        agent_id: &str,
        result: &AgentResult<AgentOutput>,
    ) {
        let (success, errors) = match result {
            Ok(output) => (output.success, output.errors.clone()),
            Err(e) => (false, vec![e.clone()]),
        };
        if let Err(e) = result {
            warn!(agent_id = %agent_id, error = %e, "Agent failed");
        }

        let mut snapshot = None;
        self.update_status(&pipeline.id, &pipeline.run_id, |status| {
            status.errors.extend(errors);
            status.agent_settled();
            if status.current_agent.as_deref() == Some(agent_id) {
                status.current_agent = None;
            }
            snapshot = Some((status.progress, status.completed_agents));
        })
        .await;

        let Some((progress, completed_agents)) = snapshot else {
            return;
        };
        let emit = pipeline.config.notifications.emit_events;
        self.events.emit(
            emit,
            PipelineEvent::AgentCompleted {
                pipeline_id: pipeline.id.clone(),
                agent_id: agent_id.to_string(),
                success,
            },
        );
        self.events.emit(
            emit,
            PipelineEvent::Progress {
                pipeline_id: pipeline.id.clone(),
                progress,
                completed_agents,
            },
        );
    }

    async fn finish(
        &self,
        pipeline: &Pipeline,
        outcome: AgentResult<RunOutcome>,
        elapsed: Duration,
    ) -> Result<PipelineResult, PipelineError> {
        let emit = pipeline.config.notifications.emit_events;
        let run = {
            let mut active = self.active.write().await;
            let current = active
                .get(&pipeline.id)
                .is_some_and(|run| run.run_id == pipeline.run_id);
            if current {
                active.remove(&pipeline.id)
            } else {
                None
            }
        };

        let cancelled = matches!(&outcome, Ok(o) if o.stop == Some(StopReason::Cancelled));
        let Some(run) = run.filter(|_| !cancelled) else {
            info!("Pipeline run ended after cancellation");
            return Err(PipelineError::Execution {
                pipeline_id: pipeline.id.clone(),
                errors: vec![cancelled_error(&pipeline.id)],
            });
        };

        let mut status = run.status;
        let now = Utc::now();
        status.current_agent = None;
        status.finished_at = Some(now);
        status.updated_at = now;

        match outcome {
            Ok(outcome) => {
                let critical_stop = outcome.stop == Some(StopReason::Critical);
                let success = !critical_stop && outcome.errors.is_empty();
                status.errors = outcome.errors.clone();
                if critical_stop {
                    status.state = PipelineState::Failed;
                    metrics().record_pipeline_failed(elapsed);
                } else {
                    status.state = PipelineState::Completed;
                    status.completed_agents = status.total_agents;
                    status.progress = 100;
                    metrics().record_pipeline_completed(elapsed);
                }

                let result = PipelineResult {
                    pipeline_id: pipeline.id.clone(),
                    success,
                    result: Self::aggregate(pipeline.config.mode, &outcome.agent_results),
                    execution_time: elapsed,
                    errors: outcome.errors,
                    agent_results: outcome.agent_results,
                };
                let recorded = Some(result.result.clone());
                self.record_history(&run.run_id, run.mode, &status, success, recorded, elapsed)
                    .await;

                if critical_stop {
                    warn!(errors = result.errors.len(), "Pipeline failed on a critical error");
                    self.events.emit(
                        emit,
                        PipelineEvent::Failed {
                            pipeline_id: pipeline.id.clone(),
                            errors: result.errors.iter().map(AgentError::to_record).collect(),
                        },
                    );
                } else {
                    info!(
                        success,
                        errors = result.errors.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Pipeline completed"
                    );
                    self.events.emit(
                        emit,
                        PipelineEvent::Completed {
                            pipeline_id: pipeline.id.clone(),
                            success,
                            execution_time_ms: elapsed.as_millis() as u64,
                        },
                    );
                }
                Ok(result)
            }
            Err(fatal) => {
                let fatal = if fatal.pipeline_id.is_none() {
                    fatal.with_pipeline(pipeline.id.as_str())
                } else {
                    fatal
                };
                error!(error = %fatal, "Pipeline execution failed");

                let mut errors = std::mem::take(&mut status.errors);
                errors.push(fatal);
                status.errors = errors.clone();
                status.state = PipelineState::Failed;
                metrics().record_pipeline_failed(elapsed);
                self.record_history(&run.run_id, run.mode, &status, false, None, elapsed)
                    .await;

                self.events.emit(
                    emit,
                    PipelineEvent::Failed {
                        pipeline_id: pipeline.id.clone(),
                        errors: errors.iter().map(AgentError::to_record).collect(),
                    },
                );
                Err(PipelineError::Execution {
                    pipeline_id: pipeline.id.clone(),
                    errors,
                })
            }
        }
    }

    fn aggregate(mode: ExecutionMode, agent_results: &[AgentRun]) -> Value {
        let successes = agent_results.iter().filter(|r| r.output.success);
        match mode {
            ExecutionMode::Sequential => successes
                .last()
                .map(|r| r.output.data.clone())
                .unwrap_or(Value::Null),
            ExecutionMode::Parallel | ExecutionMode::Hybrid => Value::Object(
                successes
                    .map(|r| (r.agent_id.clone(), r.output.data.clone()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    async fn record_history(
        &self,
        run_id: &str,
        mode: ExecutionMode,
        status: &PipelineStatus,
        success: bool,
        result: Option<Value>,
        elapsed: Duration,
    ) {
        let entry = PipelineHistoryEntry {
            pipeline_id: status.pipeline_id.clone(),
            run_id: run_id.to_string(),
            mode,
            state: status.state,
            success,
            progress: status.progress,
            completed_agents: status.completed_agents,
            total_agents: status.total_agents,
            errors: status.errors.clone(),
            result,
            created_at: status.created_at,
            started_at: status.started_at,
            finished_at: status.finished_at.unwrap_or_else(Utc::now),
            execution_time_ms: elapsed.as_millis() as u64,
        };

        let mut history = self.history.write().await;
        history.push_back(entry);
        while history.len() > self.settings.history_capacity {
            history.pop_front();
        }
    }

    /// Stop scheduling new agents; in-flight agents run to completion
    pub async fn pause_pipeline(&self, pipeline_id: &str) -> bool {
        let mut active = self.active.write().await;
        match active.get_mut(pipeline_id) {
            Some(run) if run.status.state == PipelineState::Running => {
                run.status.state = PipelineState::Paused;
                run.status.updated_at = Utc::now();
                run.control.send_replace(RunSignal::Pause);
                info!(pipeline_id = %pipeline_id, "Pipeline paused");
                true
            }
            _ => false,
        }
    }

    pub async fn resume_pipeline(&self, pipeline_id: &str) -> bool {
        let mut active = self.active.write().await;
        match active.get_mut(pipeline_id) {
            Some(run) if run.status.state == PipelineState::Paused => {
                run.status.state = PipelineState::Running;
                run.status.updated_at = Utc::now();
                run.control.send_replace(RunSignal::Run);
                info!(pipeline_id = %pipeline_id, "Pipeline resumed");
                true
            }
            _ => false,
        }
    }

    /// Cancel an active run and delete its context
    ///
    /// A running pipeline stops before its next agent; the pending
    /// `execute_pipeline` call then returns a cancellation error.
    pub async fn cancel_pipeline(&self, pipeline_id: &str) -> bool {
        let run = {
            let mut active = self.active.write().await;
            let Some(run) = active.remove(pipeline_id) else {
                return false;
            };
            run.control.send_replace(RunSignal::Cancel);
            run
        };

        let state_before = run.status.state;
        let mut status = run.status;
        let now = Utc::now();
        status.state = PipelineState::Cancelled;
        status.current_agent = None;
        status.finished_at = Some(now);
        status.updated_at = now;

        let elapsed = status
            .started_at
            .and_then(|started| (now - started).to_std().ok())
            .unwrap_or_default();
        if state_before != PipelineState::Pending {
            metrics().record_pipeline_cancelled(elapsed);
        }

        self.contexts.delete_context(&run.context_id).await;
        self.record_history(&run.run_id, run.mode, &status, false, None, elapsed)
            .await;
        self.events.emit(
            run.emit_events,
            PipelineEvent::Cancelled {
                pipeline_id: pipeline_id.to_string(),
                state_before,
            },
        );
        info!(pipeline_id = %pipeline_id, state_before = %state_before, "Pipeline cancelled");
        true
    }

    /// Live status of an active run, or the status of its latest finished run
    pub async fn get_pipeline_status(&self, pipeline_id: &str) -> Result<PipelineStatus, PipelineError> {
        if let Some(run) = self.active.read().await.get(pipeline_id) {
            return Ok(run.status.clone());
        }
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|entry| entry.pipeline_id == pipeline_id)
            .map(PipelineHistoryEntry::to_status)
            .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))
    }

    /// Statuses of pending, running, and paused runs, oldest first
    pub async fn get_active_pipelines(&self) -> Vec<PipelineStatus> {
        let mut statuses: Vec<PipelineStatus> = self
            .active
            .read()
            .await
            .values()
            .map(|run| run.status.clone())
            .collect();
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        statuses
    }

    /// Finished runs matching `query`, oldest first
    pub async fn get_pipeline_history(&self, query: &HistoryQuery) -> Vec<PipelineHistoryEntry> {
        let history = self.history.read().await;
        let matching = history.iter().filter(|entry| query.matches(entry));
        let page = matching.skip(query.offset);
        match query.limit {
            Some(limit) => page.take(limit).cloned().collect(),
            None => page.cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::AgentConnection;
    use crate::testing::mocks::MockAgent;

    fn orchestrator_with(agents: Vec<MockAgent>) -> PipelineOrchestrator {
        let registry = AgentRegistry::new();
        for agent in agents {
            registry.register_agent(agent.into_managed());
        }
        PipelineOrchestrator::new(registry, ContextManager::default())
    }

    #[tokio::test]
    async fn test_create_rejects_all_violations() {
        let orchestrator = orchestrator_with(vec![]);
        let err = orchestrator
            .create_pipeline(PipelineConfig::default())
            .await
            .unwrap_err();
        match err {
            PipelineError::InvalidConfig { violations } => assert_eq!(violations.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hybrid_cycle_rejected_at_creation() {
        let orchestrator = orchestrator_with(vec![]);
        let config = PipelineConfig::new("cyclic", ExecutionMode::Hybrid)
            .with_agents(["a", "b"])
            .with_connection(AgentConnection::new("a", "b"))
            .with_connection(AgentConnection::new("b", "a"));
        assert!(matches!(
            orchestrator.create_pipeline(config).await,
            Err(PipelineError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_active_id_rejected() {
        let orchestrator = orchestrator_with(vec![MockAgent::succeeding("a")]);
        let config = PipelineConfig::new("dup", ExecutionMode::Sequential).with_agents(["a"]);
        orchestrator.create_pipeline(config.clone()).await.unwrap();
        assert!(orchestrator.create_pipeline(config).await.is_err());
        assert_eq!(orchestrator.contexts().list_contexts("dup").await.len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_stores_input_and_results() {
        let orchestrator = orchestrator_with(vec![
            MockAgent::succeeding("first").with_output(json!({"step": 1})),
            MockAgent::succeeding("second").with_output(json!({"step": 2})),
        ]);
        let pipeline = orchestrator
            .create_pipeline(
                PipelineConfig::new("seq", ExecutionMode::Sequential).with_agents(["first", "second"]),
            )
            .await
            .unwrap();

        let result = orchestrator
            .execute_pipeline(&pipeline, json!({"text": "hello"}))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.result, json!({"step": 2}));
        assert_eq!(result.agent_results.len(), 2);
        assert_eq!(pipeline.context.get(INPUT_KEY).await.unwrap(), Some(json!({"text": "hello"})));
        assert_eq!(
            pipeline.context.get(&result_key("first")).await.unwrap(),
            Some(json!({"step": 1}))
        );

        let status = orchestrator.get_pipeline_status("seq").await.unwrap();
        assert_eq!(status.state, PipelineState::Completed);
        assert_eq!(status.progress, 100);
        assert!(orchestrator.get_active_pipelines().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_agent_fails_with_terminal_status() {
        let orchestrator = orchestrator_with(vec![MockAgent::succeeding("present")]);
        let pipeline = orchestrator
            .create_pipeline(
                PipelineConfig::new("missing", ExecutionMode::Sequential)
                    .with_agents(["present", "absent"]),
            )
            .await
            .unwrap();

        let err = orchestrator
            .execute_pipeline(&pipeline, json!({}))
            .await
            .unwrap_err();
        match &err {
            PipelineError::Execution { pipeline_id, errors } => {
                assert_eq!(pipeline_id, "missing");
                assert_eq!(errors[0].kind, ErrorKind::ValidationError);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let status = orchestrator.get_pipeline_status("missing").await.unwrap();
        assert_eq!(status.state, PipelineState::Failed);
        assert_eq!(status.errors.len(), err.errors().len());
    }

    #[tokio::test]
    async fn test_max_agents_is_resource_exhausted() {
        let orchestrator = orchestrator_with(vec![
            MockAgent::succeeding("a"),
            MockAgent::succeeding("b"),
        ]);
        let mut config = PipelineConfig::new("limited", ExecutionMode::Parallel).with_agents(["a", "b"]);
        config.resource_limits.max_agents = Some(1);
        let pipeline = orchestrator.create_pipeline(config).await.unwrap();

        let err = orchestrator
            .execute_pipeline(&pipeline, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.errors()[0].kind, ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_execute_twice_rejected() {
        let orchestrator = orchestrator_with(vec![MockAgent::succeeding("a")]);
        let pipeline = orchestrator
            .create_pipeline(PipelineConfig::new("once", ExecutionMode::Sequential).with_agents(["a"]))
            .await
            .unwrap();
        orchestrator.execute_pipeline(&pipeline, json!(1)).await.unwrap();
        assert!(matches!(
            orchestrator.execute_pipeline(&pipeline, json!(1)).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_resume_only_from_expected_state() {
        let orchestrator = orchestrator_with(vec![MockAgent::succeeding("a")]);
        orchestrator
            .create_pipeline(PipelineConfig::new("p", ExecutionMode::Sequential).with_agents(["a"]))
            .await
            .unwrap();

        assert!(!orchestrator.pause_pipeline("p").await, "pending cannot pause");
        assert!(!orchestrator.resume_pipeline("p").await);
        assert!(!orchestrator.pause_pipeline("unknown").await);
    }

    #[tokio::test]
    async fn test_cancel_pending_pipeline() {
        let orchestrator = orchestrator_with(vec![MockAgent::succeeding("a")]);
        let pipeline = orchestrator
            .create_pipeline(PipelineConfig::new("c", ExecutionMode::Sequential).with_agents(["a"]))
            .await
            .unwrap();

        assert!(orchestrator.cancel_pipeline("c").await);
        assert!(!orchestrator.cancel_pipeline("c").await);
        assert!(pipeline.context.snapshot().await.is_err());
        assert_eq!(
            orchestrator.get_pipeline_status("c").await.unwrap().state,
            PipelineState::Cancelled
        );
        assert!(matches!(
            orchestrator.get_pipeline_status("never").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_aggregate_by_mode() {
        let runs = vec![
            AgentRun {
                agent_id: "a".to_string(),
                output: AgentOutput::success(json!(1)),
            },
            AgentRun {
                agent_id: "b".to_string(),
                output: AgentOutput::success(json!(2)),
            },
        ];
        assert_eq!(
            PipelineOrchestrator::aggregate(ExecutionMode::Sequential, &runs),
            json!(2)
        );
        assert_eq!(
            PipelineOrchestrator::aggregate(ExecutionMode::Parallel, &runs),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(
            PipelineOrchestrator::aggregate(ExecutionMode::Sequential, &[]),
            Value::Null
        );
    }
}
