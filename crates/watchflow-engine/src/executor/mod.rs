//! Step executor
//!
//! Runs a DAG of typed steps against an execution context. Ready steps
//! (dependency set fully completed, not yet started) launch up to the
//! configured concurrency; each step retries with exponential backoff. A
//! state where no step is ready while none is in flight fails the run
//! with a cyclic-dependency error before any step transitions to running.
//! The run-level deadline and cancellation are observed at every step
//! boundary.

pub mod condition;
pub mod context;
mod handlers;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use watchflow_core::bus::{EngineEvent, EventBus};
use watchflow_core::model::{StepDefinition, StepKind, StepState, StepStatus};
use watchflow_core::template;

use crate::error::{EngineError, Result};
use context::ExecutionContext;

/// Typed outcome of one attempt; the retry loop decides on it without
/// unwinding
#[derive(Debug)]
pub enum StepFailure {
    /// Transient; retried while attempts remain
    Retryable(String),
    /// Config or logic error; retrying cannot help
    Fatal(String),
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailure::Retryable(msg) | StepFailure::Fatal(msg) => f.write_str(msg),
        }
    }
}

/// What a handler returns
pub type StepResult = std::result::Result<Value, StepFailure>;

/// One step kind's implementation
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        driver: &StepExecutor,
    ) -> StepResult;
}

/// Result of driving a whole step graph
pub struct StepRunOutcome {
    /// Terminal (or pending, if never launched) state per step id
    pub states: HashMap<String, StepState>,
    pub result: Result<()>,
}

enum AttemptOutcome {
    Success(Value, u32),
    Failed(String, u32),
    Cancelled(u32),
}

type StepFuture<'a> = BoxFuture<'a, (String, AttemptOutcome)>;

/// The step-graph driver: a registry of kind -> handler plus the DAG loop
///
/// The driver is closed over the registry; new kinds register without
/// touching the loop.
pub struct StepExecutor {
    registry: HashMap<StepKind, Arc<dyn StepHandler>>,
    bus: EventBus,
}

impl StepExecutor {
    pub fn new(bus: EventBus) -> Self {
        let mut executor = Self {
            registry: HashMap::new(),
            bus,
        };
        executor.register(StepKind::Navigate, Arc::new(handlers::NavigateHandler));
        executor.register(StepKind::Wait, Arc::new(handlers::WaitHandler));
        executor.register(StepKind::Click, Arc::new(handlers::ClickHandler));
        executor.register(StepKind::Fill, Arc::new(handlers::FillHandler));
        executor.register(StepKind::Extract, Arc::new(handlers::ExtractHandler));
        executor.register(StepKind::Condition, Arc::new(handlers::ConditionHandler));
        executor.register(StepKind::Loop, Arc::new(handlers::LoopHandler));
        executor.register(StepKind::Screenshot, Arc::new(handlers::ScreenshotHandler));
        executor.register(StepKind::Api, Arc::new(handlers::ApiHandler));
        executor.register(StepKind::Store, Arc::new(handlers::StoreHandler));
        executor
    }

    pub fn register(&mut self, kind: StepKind, handler: Arc<dyn StepHandler>) {
        self.registry.insert(kind, handler);
    }

    /// Drive the step graph to completion, failure, timeout, or
    /// cancellation
    #[instrument(skip_all, fields(run_id = %ctx.run_id, steps = steps.len()))]
    pub async fn run(&self, steps: &[StepDefinition], ctx: &ExecutionContext) -> StepRunOutcome {
        let mut states: HashMap<String, StepState> = steps
            .iter()
            .map(|s| (s.id.clone(), StepState::from_definition(s)))
            .collect();

        if let Err(e) = self.validate(steps) {
            return StepRunOutcome {
                states,
                result: Err(e),
            };
        }

        let step_cancel = CancellationToken::new();
        let mut launched: HashSet<String> = HashSet::new();
        let mut futures: FuturesUnordered<StepFuture<'_>> = FuturesUnordered::new();
        let total = steps.len();
        let mut finished = 0usize;

        let result: Result<()> = loop {
            // Launch every ready step up to the concurrency cap
            while futures.len() < ctx.max_concurrent_steps {
                let ready = steps.iter().find(|s| {
                    !launched.contains(&s.id)
                        && s.dependencies.iter().all(|dep| {
                            states
                                .get(dep)
                                .map(|st| st.status == StepStatus::Success)
                                .unwrap_or(false)
                        })
                });
                let Some(step) = ready else { break };
                launched.insert(step.id.clone());
                if let Some(state) = states.get_mut(&step.id) {
                    state.status = StepStatus::Running;
                    state.started_at = Some(Utc::now());
                }
                self.bus.publish(EngineEvent::StepStarted {
                    run_id: ctx.run_id,
                    step_id: step.id.clone(),
                    name: step.name.clone(),
                });
                futures.push(self.step_future(step, ctx, step_cancel.clone()));
            }

            if futures.is_empty() {
                if finished == total {
                    break Ok(());
                }
                let stuck: Vec<String> = steps
                    .iter()
                    .filter(|s| !launched.contains(&s.id))
                    .map(|s| s.id.clone())
                    .collect();
                break Err(EngineError::CyclicDependency(stuck.join(", ")));
            }

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    step_cancel.cancel();
                    drain_cancelled(&mut futures, &mut states).await;
                    break Err(EngineError::Cancelled);
                }
                _ = tokio::time::sleep_until(ctx.deadline) => {
                    step_cancel.cancel();
                    drain_cancelled(&mut futures, &mut states).await;
                    break Err(EngineError::Timeout);
                }
                Some((id, outcome)) = futures.next() => {
                    finished += 1;
                    let now = Utc::now();
                    match outcome {
                        AttemptOutcome::Success(output, retries) => {
                            if let Some(state) = states.get_mut(&id) {
                                state.status = StepStatus::Success;
                                state.completed_at = Some(now);
                                state.output = Some(output);
                                state.retry_count = retries;
                            }
                            self.bus.publish(EngineEvent::StepCompleted {
                                run_id: ctx.run_id,
                                step_id: id,
                            });
                        }
                        AttemptOutcome::Failed(error, retries) => {
                            if let Some(state) = states.get_mut(&id) {
                                state.status = StepStatus::Failed;
                                state.completed_at = Some(now);
                                state.error = Some(error.clone());
                                state.retry_count = retries;
                            }
                            self.bus.publish(EngineEvent::StepFailed {
                                run_id: ctx.run_id,
                                step_id: id.clone(),
                                error: error.clone(),
                            });
                            // One exhausted step fails the whole run
                            step_cancel.cancel();
                            drain_cancelled(&mut futures, &mut states).await;
                            break Err(EngineError::step(id, error));
                        }
                        AttemptOutcome::Cancelled(retries) => {
                            if let Some(state) = states.get_mut(&id) {
                                state.status = StepStatus::Cancelled;
                                state.completed_at = Some(now);
                                state.retry_count = retries;
                            }
                        }
                    }
                }
            }
        };

        debug!(ok = result.is_ok(), "step graph finished");
        StepRunOutcome { states, result }
    }

    /// Run child steps (loop bodies) sequentially with the same retry
    /// policy; used by handlers that recurse
    pub(crate) async fn run_children(
        &self,
        steps: &[StepDefinition],
        ctx: &ExecutionContext,
    ) -> std::result::Result<Vec<Value>, StepFailure> {
        let cancel = ctx.cancel.child_token();
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let (_, outcome) = self.step_future(step, ctx, cancel.clone()).await;
            match outcome {
                AttemptOutcome::Success(value, _) => results.push(value),
                AttemptOutcome::Failed(error, _) => {
                    return Err(StepFailure::Fatal(format!(
                        "child step {} failed: {error}",
                        step.id
                    )));
                }
                AttemptOutcome::Cancelled(_) => {
                    return Err(StepFailure::Fatal("cancelled".to_string()));
                }
            }
        }
        Ok(results)
    }

    fn validate(&self, steps: &[StepDefinition]) -> Result<()> {
        let mut ids = HashSet::new();
        for step in steps {
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
            if !self.registry.contains_key(&step.kind) {
                return Err(EngineError::validation(format!(
                    "no handler for step kind {}",
                    step.kind.as_str()
                )));
            }
        }
        for step in steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::validation(format!(
                        "step {} depends on unknown step {dep}",
                        step.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn step_future<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a ExecutionContext,
        cancel: CancellationToken,
    ) -> StepFuture<'a> {
        let handler = self.registry.get(&step.kind).cloned();
        let bus = self.bus.clone();
        async move {
            let Some(handler) = handler else {
                return (
                    step.id.clone(),
                    AttemptOutcome::Failed(
                        format!("no handler for step kind {}", step.kind.as_str()),
                        0,
                    ),
                );
            };

            let mut retries = 0u32;
            loop {
                // Templates resolve fresh per attempt so retried steps see
                // the current variable state
                let rendered = StepDefinition {
                    config: template::render_value(&step.config, &ctx.context_value()),
                    ..step.clone()
                };

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        return (step.id.clone(), AttemptOutcome::Cancelled(retries));
                    }
                    result = handler.execute(&rendered, ctx, self) => result,
                };

                match outcome {
                    Ok(output) => {
                        return (step.id.clone(), AttemptOutcome::Success(output, retries));
                    }
                    Err(StepFailure::Fatal(error)) => {
                        return (step.id.clone(), AttemptOutcome::Failed(error, retries));
                    }
                    Err(StepFailure::Retryable(error)) => {
                        if !ctx.backoff.has_retries_remaining(retries) {
                            return (step.id.clone(), AttemptOutcome::Failed(error, retries));
                        }
                        bus.publish(EngineEvent::StepRetry {
                            run_id: ctx.run_id,
                            step_id: step.id.clone(),
                            attempt: retries + 1,
                        });
                        let delay = ctx.backoff.delay_for_retry(retries);
                        retries += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return (step.id.clone(), AttemptOutcome::Cancelled(retries));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        .boxed()
    }
}

async fn drain_cancelled(
    futures: &mut FuturesUnordered<StepFuture<'_>>,
    states: &mut HashMap<String, StepState>,
) {
    while let Some((id, outcome)) = futures.next().await {
        if let Some(state) = states.get_mut(&id) {
            state.completed_at = Some(Utc::now());
            match outcome {
                AttemptOutcome::Success(output, retries) => {
                    state.status = StepStatus::Success;
                    state.output = Some(output);
                    state.retry_count = retries;
                }
                AttemptOutcome::Failed(error, retries) => {
                    state.status = StepStatus::Failed;
                    state.error = Some(error);
                    state.retry_count = retries;
                }
                AttemptOutcome::Cancelled(retries) => {
                    state.status = StepStatus::Cancelled;
                    state.retry_count = retries;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;
    use watchflow_core::browser::{PageFixture, StubBrowser};
    use watchflow_core::retry::BackoffPolicy;

    fn context_with(browser: StubBrowser, timeout: Duration) -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Arc::new(browser),
            None,
            timeout,
            BackoffPolicy::new(2, 10),
            2,
        )
    }

    /// Handler that fails a configured number of times before succeeding
    struct FlakyHandler {
        failures: AtomicU32,
    }

    #[async_trait]
    impl StepHandler for FlakyHandler {
        async fn execute(
            &self,
            _step: &StepDefinition,
            _ctx: &ExecutionContext,
            _driver: &StepExecutor,
        ) -> StepResult {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                (f > 0).then(|| f - 1)
            })
            .is_ok()
            {
                Err(StepFailure::Retryable("flaky".to_string()))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    #[tokio::test]
    async fn test_diamond_dag_with_retry() {
        let bus = EventBus::default();
        let mut executor = StepExecutor::new(bus.clone());

        // A -> B, A -> C, B -> D, C -> D; B fails twice then succeeds
        let flaky = Arc::new(FlakyHandler {
            failures: AtomicU32::new(2),
        });
        executor.register(StepKind::Api, flaky);

        let steps = vec![
            StepDefinition::new("a", StepKind::Condition, json!({"expression": "1 == 1"})),
            StepDefinition::new("b", StepKind::Api, json!({})).depends_on(&["a"]),
            StepDefinition::new("c", StepKind::Condition, json!({"expression": "1 == 1"}))
                .depends_on(&["a"]),
            StepDefinition::new("d", StepKind::Condition, json!({"expression": "1 == 1"}))
                .depends_on(&["b", "c"]),
        ];

        let ctx = context_with(StubBrowser::new(), Duration::from_secs(30));
        let outcome = executor.run(&steps, &ctx).await;

        outcome.result.expect("run should succeed");
        let states = outcome.states;
        assert!(states.values().all(|s| s.status == StepStatus::Success));
        assert_eq!(states["b"].retry_count, 2);
        assert_eq!(states["d"].retry_count, 0);
        assert!(states["d"].started_at >= states["b"].completed_at);
    }

    #[tokio::test]
    async fn test_cyclic_dependency_fails_before_running() {
        let executor = StepExecutor::new(EventBus::default());
        let steps = vec![
            StepDefinition::new("a", StepKind::Condition, json!({"expression": "1 == 1"}))
                .depends_on(&["b"]),
            StepDefinition::new("b", StepKind::Condition, json!({"expression": "1 == 1"}))
                .depends_on(&["a"]),
        ];

        let ctx = context_with(StubBrowser::new(), Duration::from_secs(30));
        let outcome = executor.run(&steps, &ctx).await;

        assert!(matches!(
            outcome.result,
            Err(EngineError::CyclicDependency(_))
        ));
        // No step ever transitioned to running
        assert!(outcome
            .states
            .values()
            .all(|s| s.status == StepStatus::Pending && s.started_at.is_none()));
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let executor = StepExecutor::new(EventBus::default());
        let steps = vec![StepDefinition::new(
            "a",
            StepKind::Condition,
            json!({"expression": "1 == 1"}),
        )
        .depends_on(&["ghost"])];

        let ctx = context_with(StubBrowser::new(), Duration::from_secs(30));
        let outcome = executor.run(&steps, &ctx).await;
        assert!(matches!(outcome.result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_run() {
        let bus = EventBus::default();
        let mut executor = StepExecutor::new(bus.clone());
        executor.register(
            StepKind::Api,
            Arc::new(FlakyHandler {
                failures: AtomicU32::new(10),
            }),
        );

        let steps = vec![
            StepDefinition::new("bad", StepKind::Api, json!({})),
            StepDefinition::new("after", StepKind::Condition, json!({"expression": "1 == 1"}))
                .depends_on(&["bad"]),
        ];

        let ctx = context_with(StubBrowser::new(), Duration::from_secs(30));
        let outcome = executor.run(&steps, &ctx).await;

        assert!(matches!(outcome.result, Err(EngineError::Step { .. })));
        assert_eq!(outcome.states["bad"].status, StepStatus::Failed);
        assert_eq!(outcome.states["bad"].retry_count, 2);
        assert_eq!(outcome.states["after"].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout() {
        let mut executor = StepExecutor::new(EventBus::default());

        struct SlowHandler;
        #[async_trait]
        impl StepHandler for SlowHandler {
            async fn execute(
                &self,
                _step: &StepDefinition,
                _ctx: &ExecutionContext,
                _driver: &StepExecutor,
            ) -> StepResult {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            }
        }
        executor.register(StepKind::Api, Arc::new(SlowHandler));

        let steps = vec![StepDefinition::new("slow", StepKind::Api, json!({}))];
        let ctx = context_with(StubBrowser::new(), Duration::from_millis(50));
        let outcome = executor.run(&steps, &ctx).await;

        assert!(matches!(outcome.result, Err(EngineError::Timeout)));
        assert_eq!(outcome.states["slow"].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_marks_run_cancelled() {
        let mut executor = StepExecutor::new(EventBus::default());

        struct SlowHandler;
        #[async_trait]
        impl StepHandler for SlowHandler {
            async fn execute(
                &self,
                _step: &StepDefinition,
                _ctx: &ExecutionContext,
                _driver: &StepExecutor,
            ) -> StepResult {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            }
        }
        executor.register(StepKind::Api, Arc::new(SlowHandler));

        let steps = vec![StepDefinition::new("slow", StepKind::Api, json!({}))];
        let ctx = context_with(StubBrowser::new(), Duration::from_secs(60));
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let outcome = executor.run(&steps, &ctx).await;
        assert!(matches!(outcome.result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_browser_steps_extract_and_store() {
        let browser = StubBrowser::new();
        browser.set_page(
            "https://example.test",
            PageFixture::with_text("page").selector("h1", "A"),
        );

        let executor = StepExecutor::new(EventBus::default());
        let steps = vec![
            StepDefinition::new(
                "open",
                StepKind::Navigate,
                json!({"url": "https://example.test"}),
            ),
            StepDefinition::new("grab", StepKind::Extract, json!({"title": "h1"}))
                .depends_on(&["open"]),
            StepDefinition::new(
                "keep",
                StepKind::Store,
                json!({"variable": "title_copy", "source": "extractedData.title"}),
            )
            .depends_on(&["grab"]),
        ];

        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Arc::new(browser.clone()),
            None,
            Duration::from_secs(30),
            BackoffPolicy::new(0, 10),
            1,
        );
        let outcome = executor.run(&steps, &ctx).await;
        outcome.result.expect("run should succeed");

        assert_eq!(ctx.extracted_data()["title"], "A");
        assert_eq!(ctx.variable("title_copy"), Some(json!("A")));
        ctx.close_tab().await;
        assert_eq!(browser.open_tab_count(), 0);
    }

    #[tokio::test]
    async fn test_loop_step_sets_iteration_variables() {
        let executor = StepExecutor::new(EventBus::default());
        let steps = vec![StepDefinition::new(
            "repeat",
            StepKind::Loop,
            json!({
                "iterations": 3,
                "steps": [
                    {"id": "keep", "kind": "store",
                     "config": {"variable": "last_index", "source": "loopIndex"}}
                ]
            }),
        )];

        let ctx = context_with(StubBrowser::new(), Duration::from_secs(30));
        let outcome = executor.run(&steps, &ctx).await;
        outcome.result.expect("run should succeed");

        let output = outcome.states["repeat"].output.clone().expect("output");
        assert_eq!(output["iterations"], 3);
        assert_eq!(ctx.variable("last_index"), Some(json!(2)));
    }
}
