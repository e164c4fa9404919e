//! Engine orchestration: the per-invocation state machine.
//!
//! One run walks `Created -> Running -> DrainingAsync -> Capturing ->
//! Finalized`. The engine owns a fresh QuickJS runtime per invocation,
//! installs the capability bridge, executes the guest's synchronous body,
//! then concurrently awaits the operation tracker and the sequential test
//! chain before the capture hook fires exactly once.
//!
//! The interpreter context is released only by ordinary drop after the
//! result snapshot exists; there is no forced dispose path. A returned
//! value must never outlive its context.

use crate::bridge::{self, BridgeHandles, HostcallKind, HostcallOutcome};
use crate::capture::{self, RunResult, ScriptFailure};
use crate::config::EngineConfig;
use crate::context::{ConsoleLevel, CookieJar, Environment, ScriptContext};
use crate::error::{Error, Result};
use crate::marshal::{self, RawResponse, RequestDescriptor};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rquickjs::{AsyncContext, AsyncRuntime, Ctx};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// The external collaborator performing the actual HTTP call.
///
/// Stateless from the engine's point of view: invoked per call, no state
/// retained between calls. The engine never opens sockets itself.
#[async_trait]
pub trait NetworkExecutor: Send + Sync {
    async fn execute(&self, request: RequestDescriptor) -> Result<RawResponse>;
}

/// Which script slot is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptPhase {
    PreRequest,
    Test,
}

/// Inputs for one script run.
pub struct RunOptions {
    pub request: RequestDescriptor,
    pub response: Option<RawResponse>,
    pub environment: Environment,
    pub cookies: CookieJar,
    pub phase: ScriptPhase,
    /// Overall run timeout, owned by the invocation caller. On expiry the
    /// pending chain and tracker are abandoned; no partial result is
    /// emitted.
    pub timeout: Option<Duration>,
    pub executor: Arc<dyn NetworkExecutor>,
}

impl RunOptions {
    #[must_use]
    pub fn new(request: RequestDescriptor, executor: Arc<dyn NetworkExecutor>) -> Self {
        Self {
            request,
            response: None,
            environment: Environment::default(),
            cookies: CookieJar::default(),
            phase: ScriptPhase::PreRequest,
            timeout: None,
            executor,
        }
    }

    #[must_use]
    pub fn with_response(mut self, response: RawResponse) -> Self {
        self.response = Some(response);
        self.phase = ScriptPhase::Test;
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_cookies(mut self, cookies: CookieJar) -> Self {
        self.cookies = cookies;
        self
    }

    #[must_use]
    pub fn with_phase(mut self, phase: ScriptPhase) -> Self {
        self.phase = phase;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Run lifecycle states, strictly forward-moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EngineState {
    Created,
    Running,
    DrainingAsync,
    Capturing,
    Finalized,
}

impl EngineState {
    const fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::DrainingAsync => "draining_async",
            Self::Capturing => "capturing",
            Self::Finalized => "finalized",
        }
    }
}

/// Tracks and logs the forward-only state progression of one run.
#[derive(Debug)]
struct StateMachine {
    state: EngineState,
}

impl StateMachine {
    fn new() -> Self {
        tracing::debug!(event = "engine.state", state = "created", "Run created");
        Self {
            state: EngineState::Created,
        }
    }

    fn advance(&mut self, next: EngineState) {
        debug_assert!(self.state < next, "engine state must move forward");
        tracing::debug!(
            event = "engine.state",
            from = self.state.name(),
            to = next.name(),
            "State transition"
        );
        self.state = next;
    }
}

/// One settled host operation, ready for delivery into the guest.
enum SettledOperation {
    Hostcall {
        call_id: String,
        outcome: HostcallOutcome,
    },
    Timer {
        call_id: String,
        timer_id: u64,
    },
}

/// The script sandbox engine. Cheap to construct; each run gets a fresh
/// interpreter and context.
#[derive(Debug, Clone, Default)]
pub struct ScriptEngine {
    config: EngineConfig,
}

#[allow(clippy::future_not_send)]
impl ScriptEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Run one script against the supplied request/response context.
    ///
    /// Returns a complete [`RunResult`] (possibly containing failed
    /// assertions) or a [`ScriptFailure`] with best-effort partial test
    /// data.
    pub async fn run(
        &self,
        source: &str,
        options: RunOptions,
    ) -> std::result::Result<RunResult, ScriptFailure> {
        let RunOptions {
            request,
            response,
            environment,
            cookies,
            phase,
            timeout,
            executor,
        } = options;

        let state = Rc::new(RefCell::new(ScriptContext::new(environment, cookies)));
        let handles = BridgeHandles::new(Rc::clone(&state), self.config.settle_grace_rounds);

        let run = self.run_inner(source, request, response, phase, executor, &handles);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        event = "engine.timeout",
                        timeout_ms = limit.as_millis() as u64,
                        "Run exceeded caller timeout; abandoning pending work"
                    );
                    Err(ScriptFailure::timeout(
                        format!("script run exceeded {}ms", limit.as_millis()),
                        Some(state.borrow().export_tests()),
                    ))
                }
            },
            None => run.await,
        }
    }

    async fn run_inner(
        &self,
        source: &str,
        request: RequestDescriptor,
        response: Option<RawResponse>,
        phase: ScriptPhase,
        executor: Arc<dyn NetworkExecutor>,
        handles: &BridgeHandles,
    ) -> std::result::Result<RunResult, ScriptFailure> {
        let mut machine = StateMachine::new();

        let runtime = AsyncRuntime::new().map_err(|err| ScriptFailure::from(map_js_error(&err)))?;
        if let Some(limit) = self.config.memory_limit_bytes {
            runtime.set_memory_limit(limit).await;
        }
        let context = AsyncContext::full(&runtime)
            .await
            .map_err(|err| ScriptFailure::from(map_js_error(&err)))?;

        // Bodies are fully materialized before anything crosses the
        // boundary.
        let serialized_response = match response {
            Some(raw) => Some(marshal::to_serialized_response(raw).await),
            None => None,
        };
        let request_value = request.to_bridge_value().map_err(ScriptFailure::from)?;

        context
            .with(|ctx| {
                bridge::install_capabilities(
                    &ctx,
                    handles,
                    &request_value,
                    serialized_response.as_ref(),
                )
            })
            .await
            .map_err(|err| ScriptFailure::from(map_js_error(&err)))?;

        machine.advance(EngineState::Running);
        tracing::debug!(
            event = "engine.run",
            phase = ?phase,
            source_len = source.len(),
            "Executing script body"
        );

        let wrapped = wrap_source(source);
        let eval_error = context
            .with(|ctx| match ctx.eval::<(), _>(wrapped.as_str()) {
                Ok(()) => None,
                Err(err) => Some(classify_eval_error(&ctx, &err)),
            })
            .await;
        if let Some((code, message)) = eval_error {
            return Err(failure_from_guest(code, message, &handles.state));
        }

        // The synchronous body ran inside eval up to its first await; one
        // job drain surfaces any rejection from that synchronous segment.
        self.drain_jobs(&runtime, &handles.state).await;
        let script_error = handles.state.borrow_mut().take_script_error();
        if let Some(err) = script_error {
            return Err(failure_from_guest(err.code, err.message, &handles.state));
        }
        handles.state.borrow_mut().mark_sync_body_done();

        machine.advance(EngineState::DrainingAsync);
        self.drain_async(&runtime, &context, handles, &executor).await;

        machine.advance(EngineState::Capturing);
        let final_request = context
            .with(|ctx| {
                let value: rquickjs::Value<'_> = ctx.globals().get("request")?;
                bridge::js_to_json(&ctx, value)
            })
            .await
            .ok();
        let result =
            capture::capture_run_result(&handles.state.borrow(), &request_value, final_request);

        machine.advance(EngineState::Finalized);
        // `context` and `runtime` drop here, after the snapshot exists.
        Ok(result)
    }

    /// Service the tracker's live set and the test chain until both settle.
    ///
    /// Each round: launch newly queued operations, await every member of
    /// the current wave (completions may enqueue more, which join the
    /// wave), then yield one scheduling tick so chained continuations can
    /// register new work. Only a run of consecutive rounds with nothing
    /// pending, no jobs run, and a settled chain ends the phase.
    async fn drain_async(
        &self,
        runtime: &AsyncRuntime,
        context: &AsyncContext,
        handles: &BridgeHandles,
        executor: &Arc<dyn NetworkExecutor>,
    ) {
        let mut inflight: FuturesUnordered<BoxFuture<'static, SettledOperation>> =
            FuturesUnordered::new();

        loop {
            launch_queued(&mut inflight, handles, executor);

            if inflight.is_empty() {
                handles.tracker.borrow_mut().mark_empty_round();
            } else {
                handles.tracker.borrow_mut().mark_progress();
                while let Some(settled) = inflight.next().await {
                    self.deliver(context, handles, settled).await;
                    self.drain_jobs(runtime, &handles.state).await;
                    launch_queued(&mut inflight, handles, executor);
                }
            }

            let jobs = self.drain_jobs(runtime, &handles.state).await;
            let chain_settled = handles.state.borrow().chain_settled();
            let queue_empty = handles.queue.borrow().is_empty();
            if jobs > 0 || !chain_settled || !queue_empty {
                handles.tracker.borrow_mut().mark_progress();
            }
            if chain_settled && handles.tracker.borrow().drained() {
                break;
            }
            tokio::task::yield_now().await;
            if jobs == 0 && !chain_settled && queue_empty && inflight.is_empty() {
                // The chain is waiting on something that is not host work;
                // back off so a caller timeout can fire without a hot spin.
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        let tracker = handles.tracker.borrow();
        tracing::debug!(
            event = "engine.drained",
            issued = tracker.issued(),
            settled = tracker.settled(),
            "All host-async work settled"
        );
    }

    async fn deliver(
        &self,
        context: &AsyncContext,
        handles: &BridgeHandles,
        settled: SettledOperation,
    ) {
        match settled {
            SettledOperation::Hostcall { call_id, outcome } => {
                handles.tracker.borrow_mut().settle(&call_id);
                if let HostcallOutcome::Error { message, .. } = &outcome {
                    handles
                        .state
                        .borrow_mut()
                        .push_console(ConsoleLevel::Warn, format!("fetch failed: {message}"));
                }
                let delivered = context
                    .with(|ctx| bridge::deliver_hostcall_completion(&ctx, &call_id, &outcome))
                    .await;
                if let Err(err) = delivered {
                    tracing::warn!(
                        event = "engine.delivery_failed",
                        call_id = %call_id,
                        error = %err,
                        "Hostcall completion could not be delivered"
                    );
                }
            }
            SettledOperation::Timer { call_id, timer_id } => {
                handles.tracker.borrow_mut().settle(&call_id);
                let delivered = context
                    .with(|ctx| bridge::deliver_timer_fire(&ctx, timer_id))
                    .await;
                if let Err(err) = delivered {
                    tracing::warn!(
                        event = "engine.timer_delivery_failed",
                        timer_id = timer_id,
                        error = %err,
                        "Timer fire could not be delivered"
                    );
                }
            }
        }
    }

    /// Drain the interpreter's internal job queue to a fixpoint.
    ///
    /// A job that raises fails only its own continuation: the error is
    /// logged and recorded on the console, and draining continues.
    async fn drain_jobs(&self, runtime: &AsyncRuntime, state: &Rc<RefCell<ScriptContext>>) -> usize {
        let mut count = 0;
        loop {
            match runtime.execute_pending_job().await {
                Ok(true) => count += 1,
                Ok(false) => break,
                Err(err) => {
                    count += 1;
                    tracing::warn!(
                        event = "engine.job_error",
                        error = %err,
                        "Guest job raised"
                    );
                    state.borrow_mut().push_console(
                        ConsoleLevel::Error,
                        format!("uncaught error in async continuation: {err}"),
                    );
                }
            }
        }
        count
    }
}

/// Move queued hostcall requests into the in-flight set.
fn launch_queued(
    inflight: &mut FuturesUnordered<BoxFuture<'static, SettledOperation>>,
    handles: &BridgeHandles,
    executor: &Arc<dyn NetworkExecutor>,
) {
    let requests: Vec<_> = handles.queue.borrow_mut().drain(..).collect();
    for request in requests {
        match request.kind {
            HostcallKind::Fetch { descriptor } => {
                let executor = Arc::clone(executor);
                let call_id = request.call_id;
                tracing::debug!(
                    event = "engine.fetch_dispatch",
                    call_id = %call_id,
                    url = %descriptor.url,
                    method = %descriptor.method,
                    "Dispatching fetch to network executor"
                );
                inflight.push(
                    async move {
                        let outcome = match executor.execute(descriptor).await {
                            Ok(raw) => {
                                let serialized = marshal::to_serialized_response(raw).await;
                                HostcallOutcome::Success(serialized.to_bridge_value())
                            }
                            Err(err) => HostcallOutcome::Error {
                                code: "NETWORK_ERROR".to_string(),
                                message: err.to_string(),
                            },
                        };
                        SettledOperation::Hostcall { call_id, outcome }
                    }
                    .boxed(),
                );
            }
            HostcallKind::Sleep { timer_id, delay_ms } => {
                let call_id = request.call_id;
                inflight.push(
                    async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        SettledOperation::Timer { call_id, timer_id }
                    }
                    .boxed(),
                );
            }
        }
    }
}

/// Wrap the guest source in an async IIFE so explicit awaits suspend the
/// top-level body; rejections funnel into the bridge's error callback.
fn wrap_source(source: &str) -> String {
    format!(
        "(async () => {{\n{source}\n}})().catch((err) => \
         __rs_script_error(__rs_error_message(err), \
         err && err.code !== undefined && err.code !== null ? String(err.code) : null));"
    )
}

fn classify_eval_error(ctx: &Ctx<'_>, err: &rquickjs::Error) -> (Option<String>, String) {
    if matches!(err, rquickjs::Error::Exception) {
        bridge::caught_error(ctx)
    } else {
        (None, format!("{err}"))
    }
}

fn failure_from_guest(
    code: Option<String>,
    message: String,
    state: &Rc<RefCell<ScriptContext>>,
) -> ScriptFailure {
    let partial = Some(state.borrow().export_tests());
    if code.as_deref() == Some("UNSUPPORTED") {
        ScriptFailure::unsupported_feature(message, partial)
    } else {
        ScriptFailure::script_error(message, partial)
    }
}

fn map_js_error(err: &rquickjs::Error) -> Error {
    Error::bridge(format!("QuickJS: {err}"))
}

// ============================================================================
// Dedicated-thread embedding
// ============================================================================

enum EngineCommand {
    Run {
        source: String,
        options: RunOptions,
        reply: tokio::sync::oneshot::Sender<std::result::Result<RunResult, ScriptFailure>>,
    },
}

/// A `Send + Clone` handle running the engine on its own thread.
///
/// Engine futures are not `Send` (the interpreter context is thread-bound),
/// so hosts living on multi-threaded runtimes talk to a dedicated engine
/// thread over a command channel.
#[derive(Clone)]
pub struct ScriptEngineHandle {
    sender: tokio::sync::mpsc::Sender<EngineCommand>,
}

impl ScriptEngineHandle {
    /// Spawn the engine thread with its own current-thread runtime.
    pub fn spawn(config: EngineConfig) -> Result<Self> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<EngineCommand>(16);

        std::thread::Builder::new()
            .name("reqscript-engine".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!(
                            event = "engine.thread_init_failed",
                            error = %err,
                            "Could not build engine runtime"
                        );
                        return;
                    }
                };
                runtime.block_on(async move {
                    let engine = ScriptEngine::with_config(config);
                    while let Some(command) = rx.recv().await {
                        match command {
                            EngineCommand::Run {
                                source,
                                options,
                                reply,
                            } => {
                                let result = engine.run(&source, options).await;
                                let _ = reply.send(result);
                            }
                        }
                    }
                });
            })?;

        Ok(Self { sender: tx })
    }

    /// Run one script on the engine thread.
    pub async fn run(
        &self,
        source: impl Into<String>,
        options: RunOptions,
    ) -> std::result::Result<RunResult, ScriptFailure> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(EngineCommand::Run {
                source: source.into(),
                options,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ScriptFailure::script_error("engine thread is gone", None))?;
        reply_rx
            .await
            .map_err(|_| ScriptFailure::script_error("engine thread dropped the run", None))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_moves_forward() {
        let mut machine = StateMachine::new();
        machine.advance(EngineState::Running);
        machine.advance(EngineState::DrainingAsync);
        machine.advance(EngineState::Capturing);
        machine.advance(EngineState::Finalized);
        assert_eq!(machine.state, EngineState::Finalized);
    }

    #[test]
    #[should_panic(expected = "forward")]
    #[cfg(debug_assertions)]
    fn state_machine_rejects_backward_moves() {
        let mut machine = StateMachine::new();
        machine.advance(EngineState::Capturing);
        machine.advance(EngineState::Running);
    }

    #[test]
    fn wrapped_source_funnels_rejections() {
        let wrapped = wrap_source("env.set('k', 1);");
        assert!(wrapped.starts_with("(async () => {"));
        assert!(wrapped.contains("env.set('k', 1);"));
        assert!(wrapped.contains("__rs_script_error"));
    }

    #[test]
    fn guest_failures_classify_by_code() {
        let state = Rc::new(RefCell::new(ScriptContext::new(
            Environment::default(),
            CookieJar::default(),
        )));
        let failure = failure_from_guest(Some("UNSUPPORTED".into()), "legacy".into(), &state);
        assert_eq!(
            failure.kind,
            crate::capture::ScriptFailureKind::UnsupportedFeature
        );
        let failure = failure_from_guest(None, "boom".into(), &state);
        assert_eq!(failure.kind, crate::capture::ScriptFailureKind::ScriptError);
        assert_eq!(failure.partial_tests, Some(Vec::new()));
    }
}
