//! Capability bridge between the host and the QuickJS guest.
//!
//! This module installs the fixed set of host-implemented functions into a
//! fresh interpreter context and owns the Promise plumbing for async
//! hostcalls:
//!
//! ```text
//! Guest code                   Rust host
//! ----------                   ---------
//! fetch(url, opts)         --> normalize request (marshal)
//!   returns Promise            generate call id
//!   resolve/reject stored      register handle with the tracker
//!   in a guest-side map        enqueue HostcallRequest
//!
//! [drain loop]             <-- network executor settles
//!   __rs_complete_hostcall(callId, outcome)
//!   resolve(value) or reject(error)
//!   microtasks drain (.then chains run)
//! ```
//!
//! Guest callables are only guaranteed valid while their creating call
//! frame is conceptually alive, so resolve/reject pairs are never held in
//! Rust across scheduling ticks: registration hands them straight to a map
//! inside the guest heap (`__rs_register_hostcall`) and completion looks
//! them up by call id from within the context.

use crate::context::{ConsoleLevel, Cookie, EnvScope, OutcomeStatus, ScriptContext};
use crate::marshal::{self, RequestDescriptor, SerializedResponse};
use crate::tracker::{OperationKind, OperationTracker};
use regex::Regex;
use rquickjs::function::{Func, Opt, Rest};
use rquickjs::{Ctx, Function, IntoJs, Object, Promise, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A host operation requested from guest code.
#[derive(Debug, Clone)]
pub struct HostcallRequest {
    pub call_id: String,
    pub kind: HostcallKind,
}

/// What the host is being asked to do.
#[derive(Debug, Clone)]
pub enum HostcallKind {
    /// `fetch(url, options)`: run the descriptor through the network
    /// executor.
    Fetch { descriptor: RequestDescriptor },
    /// `setTimeout`: sleep, then fire the guest-side callback.
    Sleep { timer_id: u64, delay_ms: u64 },
}

/// Completion of one hostcall, delivered back into the guest.
#[derive(Debug, Clone, PartialEq)]
pub enum HostcallOutcome {
    Success(serde_json::Value),
    Error { code: String, message: String },
}

/// Queue of hostcall requests waiting to be serviced by the drain loop.
pub type HostcallQueue = Rc<RefCell<VecDeque<HostcallRequest>>>;

/// Per-run handles shared with every installed capability.
///
/// All of this is owned by one run and passed by reference into each
/// capability closure; nothing here is process-wide.
#[derive(Clone)]
pub struct BridgeHandles {
    pub state: Rc<RefCell<ScriptContext>>,
    pub tracker: Rc<RefCell<OperationTracker>>,
    pub queue: HostcallQueue,
}

impl BridgeHandles {
    #[must_use]
    pub fn new(state: Rc<RefCell<ScriptContext>>, grace_rounds: u32) -> Self {
        Self {
            state,
            tracker: Rc::new(RefCell::new(OperationTracker::new(grace_rounds))),
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }
}

/// Install the capability set into a fresh context.
///
/// `request` is the caller's request as plain JSON (exposed mutably to the
/// guest); `response` is present only for post-response test scripts.
pub fn install_capabilities<'js>(
    ctx: &Ctx<'js>,
    handles: &BridgeHandles,
    request: &serde_json::Value,
    response: Option<&SerializedResponse>,
) -> rquickjs::Result<()> {
    ctx.eval::<(), _>(BRIDGE_JS)?;

    let global = ctx.globals();

    // log(...) and the console object share one ordered sink.
    let state = handles.state.clone();
    global.set(
        "log",
        Func::from(move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let message = stringify_args(&ctx, args.0)?;
            state.borrow_mut().push_console(ConsoleLevel::Log, message);
            Ok(())
        }),
    )?;

    let console = Object::new(ctx.clone())?;
    let state = handles.state.clone();
    console.set(
        "log",
        Func::from(move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let message = stringify_args(&ctx, args.0)?;
            state.borrow_mut().push_console(ConsoleLevel::Log, message);
            Ok(())
        }),
    )?;
    let state = handles.state.clone();
    console.set(
        "info",
        Func::from(move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let message = stringify_args(&ctx, args.0)?;
            state.borrow_mut().push_console(ConsoleLevel::Info, message);
            Ok(())
        }),
    )?;
    let state = handles.state.clone();
    console.set(
        "warn",
        Func::from(move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let message = stringify_args(&ctx, args.0)?;
            state.borrow_mut().push_console(ConsoleLevel::Warn, message);
            Ok(())
        }),
    )?;
    let state = handles.state.clone();
    console.set(
        "error",
        Func::from(move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let message = stringify_args(&ctx, args.0)?;
            state.borrow_mut().push_console(ConsoleLevel::Error, message);
            Ok(())
        }),
    )?;
    let state = handles.state.clone();
    console.set(
        "debug",
        Func::from(move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let message = stringify_args(&ctx, args.0)?;
            state.borrow_mut().push_console(ConsoleLevel::Debug, message);
            Ok(())
        }),
    )?;
    global.set("console", console)?;

    // env.get/set/unset, scope-optional by arity; explicit unknown scope
    // names throw.
    let env = Object::new(ctx.clone())?;
    let state = handles.state.clone();
    env.set(
        "get",
        Func::from(
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                let state = state.borrow();
                let value = match args.0.as_slice() {
                    [key] => {
                        let key = require_string(&ctx, key, "env key")?;
                        state.environment.lookup(&key).cloned()
                    }
                    [scope, key, ..] => {
                        let scope = require_scope(&ctx, scope)?;
                        let key = require_string(&ctx, key, "env key")?;
                        state.environment.get(scope, &key).cloned()
                    }
                    [] => return Err(throw_coded(&ctx, "TYPE_ERROR", "env.get requires a key")),
                };
                json_to_js(&ctx, &value.unwrap_or(serde_json::Value::Null))
            },
        ),
    )?;
    let state = handles.state.clone();
    env.set(
        "set",
        Func::from(
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
                match args.0.as_slice() {
                    [key, value] => {
                        let key = require_string(&ctx, key, "env key")?;
                        let value = js_to_json(&ctx, value.clone())?;
                        state
                            .borrow_mut()
                            .environment
                            .set(EnvScope::Selected, &key, value);
                    }
                    [scope, key, value] => {
                        let scope = require_scope(&ctx, scope)?;
                        let key = require_string(&ctx, key, "env key")?;
                        let value = js_to_json(&ctx, value.clone())?;
                        state.borrow_mut().environment.set(scope, &key, value);
                    }
                    _ => {
                        return Err(throw_coded(
                            &ctx,
                            "TYPE_ERROR",
                            "env.set requires (key, value) or (scope, key, value)",
                        ));
                    }
                }
                Ok(())
            },
        ),
    )?;
    let state = handles.state.clone();
    env.set(
        "unset",
        Func::from(
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
                match args.0.as_slice() {
                    [key] => {
                        let key = require_string(&ctx, key, "env key")?;
                        Ok(state
                            .borrow_mut()
                            .environment
                            .unset(EnvScope::Selected, &key))
                    }
                    [scope, key, ..] => {
                        let scope = require_scope(&ctx, scope)?;
                        let key = require_string(&ctx, key, "env key")?;
                        Ok(state.borrow_mut().environment.unset(scope, &key))
                    }
                    [] => Err(throw_coded(&ctx, "TYPE_ERROR", "env.unset requires a key")),
                }
            },
        ),
    )?;
    global.set("env", env)?;

    // cookies.get/set
    let cookies = Object::new(ctx.clone())?;
    let state = handles.state.clone();
    cookies.set(
        "get",
        Func::from(
            move |ctx: Ctx<'js>, name: String| -> rquickjs::Result<Value<'js>> {
                let state = state.borrow();
                match state.cookies.get(&name) {
                    Some(cookie) => cookie.value.clone().into_js(&ctx),
                    None => Ok(Value::new_null(ctx.clone())),
                }
            },
        ),
    )?;
    let state = handles.state.clone();
    cookies.set(
        "set",
        Func::from(
            move |ctx: Ctx<'js>,
                  name: String,
                  value: String,
                  attrs: Opt<Value<'js>>|
                  -> rquickjs::Result<()> {
                let attrs = match attrs.0 {
                    Some(attrs) => js_to_json(&ctx, attrs)?,
                    None => serde_json::Value::Null,
                };
                state.borrow_mut().cookies.set(Cookie {
                    name,
                    value,
                    domain: attrs
                        .get("domain")
                        .and_then(serde_json::Value::as_str)
                        .map(String::from),
                    path: attrs
                        .get("path")
                        .and_then(serde_json::Value::as_str)
                        .map(String::from),
                });
                Ok(())
            },
        ),
    )?;
    global.set("cookies", cookies)?;

    // fetch(url, options) -> Promise. The resolve/reject pair goes straight
    // into the guest-side map; Rust only keeps the call id.
    let queue = handles.queue.clone();
    let tracker = handles.tracker.clone();
    global.set(
        "fetch",
        Func::from(
            move |ctx: Ctx<'js>,
                  url: String,
                  options: Opt<Value<'js>>|
                  -> rquickjs::Result<Promise<'js>> {
                let options = match options.0 {
                    Some(options) => js_to_json(&ctx, options)?,
                    None => serde_json::Value::Null,
                };
                let descriptor = marshal::to_network_request(&url, &options);

                let (promise, resolve, reject) = Promise::new(&ctx)?;
                let global = ctx.globals();
                let register_fn: Function<'_> = global.get("__rs_register_hostcall")?;
                let call_id: String = register_fn.call((resolve, reject, true))?;

                tracker
                    .borrow_mut()
                    .register(call_id.clone(), OperationKind::Fetch { url: url.clone() });
                queue.borrow_mut().push_back(HostcallRequest {
                    call_id,
                    kind: HostcallKind::Fetch { descriptor },
                });
                Ok(promise)
            },
        ),
    )?;

    // assert(actual, matcher, expected) records on the active descriptor,
    // never raises.
    let state = handles.state.clone();
    global.set(
        "assert",
        Func::from(
            move |ctx: Ctx<'js>,
                  actual: Value<'js>,
                  matcher: String,
                  expected: Value<'js>|
                  -> rquickjs::Result<()> {
                let actual = js_to_json(&ctx, actual)?;
                let expected = js_to_json(&ctx, expected)?;
                let (status, message) = judge_assertion(&actual, &matcher, &expected);
                state.borrow_mut().record_outcome(status, message);
                Ok(())
            },
        ),
    )?;

    // Test bookkeeping callbacks used by the guest-side chain.
    let state = handles.state.clone();
    global.set(
        "__rs_test_register",
        Func::from(move |name: String| -> i32 {
            state.borrow_mut().register_test(name) as i32
        }),
    )?;
    let state = handles.state.clone();
    global.set(
        "__rs_test_activate",
        Func::from(move |id: i32| {
            state.borrow_mut().activate_test(id.max(0) as usize);
        }),
    )?;
    let state = handles.state.clone();
    global.set(
        "__rs_test_finish",
        Func::from(move |ctx: Ctx<'js>, id: i32, error: Value<'js>| -> rquickjs::Result<()> {
            let message = if error.is_null() || error.is_undefined() {
                None
            } else {
                Some(stringify_value(&ctx, error)?)
            };
            state.borrow_mut().finish_test(id.max(0) as usize, message);
            Ok(())
        }),
    )?;

    // setTimeout's host half: allocate a timer id and enqueue a sleep.
    let queue = handles.queue.clone();
    let tracker = handles.tracker.clone();
    global.set(
        "__rs_host_sleep",
        Func::from(move |delay: f64| -> i32 {
            let delay_ms = if delay.is_finite() && delay > 0.0 {
                delay as u64
            } else {
                0
            };
            let mut tracker = tracker.borrow_mut();
            let timer_id = tracker.allocate_timer_id();
            let call_id = format!("timer-{timer_id}");
            tracker.register(call_id.clone(), OperationKind::Sleep { timer_id, delay_ms });
            queue.borrow_mut().push_back(HostcallRequest {
                call_id,
                kind: HostcallKind::Sleep { timer_id, delay_ms },
            });
            timer_id as i32
        }),
    )?;

    // Top-level rejection funnel for the wrapped script body.
    let state = handles.state.clone();
    global.set(
        "__rs_script_error",
        Func::from(
            move |ctx: Ctx<'js>, message: String, code: Value<'js>| -> rquickjs::Result<()> {
                let code = if code.is_null() || code.is_undefined() {
                    None
                } else {
                    Some(stringify_value(&ctx, code)?)
                };
                let mut state = state.borrow_mut();
                if state.sync_body_done() {
                    tracing::debug!(
                        event = "bridge.branch_error",
                        message = %message,
                        "Top-level async branch failed"
                    );
                    state.push_console(
                        ConsoleLevel::Error,
                        format!("uncaught error: {message}"),
                    );
                    state.record_root_failure(message);
                } else {
                    state.record_script_error(message, code);
                }
                Ok(())
            },
        ),
    )?;

    // Legacy API kept only to fail descriptively.
    global.set(
        "sendRequest",
        Func::from(|ctx: Ctx<'js>, _args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            Err(throw_coded(
                &ctx,
                "UNSUPPORTED",
                "sendRequest is no longer available; use fetch(url, options)",
            ))
        }),
    )?;

    global.set("request", json_to_js(ctx, request)?)?;

    if let Some(response) = response {
        let plain = json_to_js(ctx, &response.to_bridge_value())?;
        let wrap_fn: Function<'_> = global.get("__rs_wrap_response")?;
        let wrapped: Value<'_> = wrap_fn.call((plain,))?;
        global.set("response", wrapped)?;
    }

    tracing::debug!(
        event = "bridge.installed",
        has_response = response.is_some(),
        "Capabilities installed into fresh context"
    );
    Ok(())
}

/// Resolve or reject one pending guest promise by call id.
pub fn deliver_hostcall_completion(
    ctx: &Ctx<'_>,
    call_id: &str,
    outcome: &HostcallOutcome,
) -> rquickjs::Result<()> {
    let global = ctx.globals();
    let complete_fn: Function<'_> = global.get("__rs_complete_hostcall")?;
    let js_outcome = match outcome {
        HostcallOutcome::Success(value) => {
            tracing::trace!(
                event = "bridge.resolve",
                call_id = %call_id,
                "Resolving hostcall promise"
            );
            let obj = Object::new(ctx.clone())?;
            obj.set("ok", true)?;
            obj.set("value", json_to_js(ctx, value)?)?;
            obj
        }
        HostcallOutcome::Error { code, message } => {
            tracing::trace!(
                event = "bridge.reject",
                call_id = %call_id,
                code = %code,
                "Rejecting hostcall promise"
            );
            let obj = Object::new(ctx.clone())?;
            obj.set("ok", false)?;
            obj.set("code", code.clone())?;
            obj.set("message", message.clone())?;
            obj
        }
    };
    complete_fn.call::<_, ()>((call_id, js_outcome))?;
    Ok(())
}

/// Fire one timer callback in the guest.
pub fn deliver_timer_fire(ctx: &Ctx<'_>, timer_id: u64) -> rquickjs::Result<()> {
    let global = ctx.globals();
    let fire_fn: Function<'_> = global.get("__rs_fire_timer")?;
    fire_fn.call::<_, ()>((timer_id as f64,))?;
    Ok(())
}

/// Pull the pending exception and split it into (code, message).
pub fn caught_error(ctx: &Ctx<'_>) -> (Option<String>, String) {
    let caught = ctx.catch();
    if let Some(obj) = caught.as_object() {
        let message = string_property(obj, "message");
        let code = string_property(obj, "code");
        if let Some(message) = message {
            return (code, message);
        }
    }
    if let Some(s) = caught.as_string() {
        if let Ok(message) = s.to_string() {
            return (None, message);
        }
    }
    (None, "unknown script error".to_string())
}

fn string_property(obj: &Object<'_>, name: &str) -> Option<String> {
    let value: Value<'_> = obj.get(name).ok()?;
    value.as_string().and_then(|s| s.to_string().ok())
}

/// Throw a plain error object carrying a machine-readable code.
fn throw_coded(ctx: &Ctx<'_>, code: &str, message: impl Into<String>) -> rquickjs::Error {
    let message = message.into();
    match build_error_value(ctx, code, &message) {
        Ok(value) => ctx.throw(value),
        Err(err) => err,
    }
}

fn build_error_value<'js>(
    ctx: &Ctx<'js>,
    code: &str,
    message: &str,
) -> rquickjs::Result<Value<'js>> {
    let error = Object::new(ctx.clone())?;
    error.set("message", message)?;
    error.set("code", code)?;
    Ok(error.into_value())
}

fn require_string<'js>(
    ctx: &Ctx<'js>,
    value: &Value<'js>,
    what: &str,
) -> rquickjs::Result<String> {
    if let Some(s) = value.as_string() {
        return s.to_string();
    }
    Err(throw_coded(ctx, "TYPE_ERROR", format!("{what} must be a string")))
}

fn require_scope<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<EnvScope> {
    let name = require_string(ctx, value, "env scope")?;
    EnvScope::parse(&name).ok_or_else(|| {
        throw_coded(
            ctx,
            "TYPE_ERROR",
            format!("unknown env scope \"{name}\" (expected \"global\" or \"selected\")"),
        )
    })
}

fn stringify_args<'js>(ctx: &Ctx<'js>, args: Vec<Value<'js>>) -> rquickjs::Result<String> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(stringify_value(ctx, arg)?);
    }
    Ok(parts.join(" "))
}

fn stringify_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<String> {
    if let Some(s) = value.as_string() {
        return s.to_string();
    }
    if value.is_undefined() {
        return Ok("undefined".to_string());
    }
    Ok(js_to_json(ctx, value)?.to_string())
}

/// Convert a `serde_json::Value` to a guest value.
pub fn json_to_js<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
) -> rquickjs::Result<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    Ok(Value::new_int(ctx.clone(), small))
                } else {
                    Ok(Value::new_float(ctx.clone(), i as f64))
                }
            } else if let Some(f) = n.as_f64() {
                Ok(Value::new_float(ctx.clone(), f))
            } else {
                Ok(Value::new_null(ctx.clone()))
            }
        }
        serde_json::Value::String(s) => s.clone().into_js(ctx),
        serde_json::Value::Array(arr) => {
            let js_arr = rquickjs::Array::new(ctx.clone())?;
            for (i, item) in arr.iter().enumerate() {
                js_arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(js_arr.into_value())
        }
        serde_json::Value::Object(obj) => {
            let js_obj = Object::new(ctx.clone())?;
            for (k, v) in obj {
                js_obj.set(k.as_str(), json_to_js(ctx, v)?)?;
            }
            Ok(js_obj.into_value())
        }
    }
}

/// Convert a guest value to plain JSON. Functions, symbols and other
/// interpreter-internal values fall back to null.
pub fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<serde_json::Value> {
    if value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::json!(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(serde_json::json!(f));
    }
    if let Some(s) = value.as_string() {
        return Ok(serde_json::Value::String(s.to_string()?));
    }
    if let Some(arr) = value.as_array() {
        let mut result = Vec::new();
        for item in arr.iter::<Value<'js>>() {
            result.push(js_to_json(ctx, item?)?);
        }
        return Ok(serde_json::Value::Array(result));
    }
    if let Some(obj) = value.as_object() {
        let mut result = serde_json::Map::new();
        for item in obj.props::<String, Value<'js>>() {
            let (k, v) = item?;
            result.insert(k, js_to_json(ctx, v)?);
        }
        return Ok(serde_json::Value::Object(result));
    }
    Ok(serde_json::Value::Null)
}

/// Evaluate one assertion. Returns the outcome status plus a message
/// (empty on pass). Unknown matchers and uncomparable operands become
/// failures, never thrown errors.
#[must_use]
pub fn judge_assertion(
    actual: &serde_json::Value,
    matcher: &str,
    expected: &serde_json::Value,
) -> (OutcomeStatus, String) {
    match evaluate_matcher(actual, matcher, expected) {
        Ok(true) => (OutcomeStatus::Pass, String::new()),
        Ok(false) => (
            OutcomeStatus::Fail,
            format!("expected {actual} to {matcher} {expected}"),
        ),
        Err(message) => (OutcomeStatus::Fail, message),
    }
}

fn evaluate_matcher(
    actual: &serde_json::Value,
    matcher: &str,
    expected: &serde_json::Value,
) -> Result<bool, String> {
    match matcher {
        "eq" => Ok(actual == expected),
        "neq" => Ok(actual != expected),
        "gt" => compare(actual, expected).map(|ord| ord == std::cmp::Ordering::Greater),
        "gte" => compare(actual, expected).map(|ord| ord != std::cmp::Ordering::Less),
        "lt" => compare(actual, expected).map(|ord| ord == std::cmp::Ordering::Less),
        "lte" => compare(actual, expected).map(|ord| ord != std::cmp::Ordering::Greater),
        "contains" => contains(actual, expected),
        "matches" => {
            let text = actual
                .as_str()
                .ok_or_else(|| format!("matches requires a string, got {actual}"))?;
            let pattern = expected
                .as_str()
                .ok_or_else(|| format!("matches requires a string pattern, got {expected}"))?;
            let regex =
                Regex::new(pattern).map_err(|err| format!("invalid pattern {expected}: {err}"))?;
            Ok(regex.is_match(text))
        }
        other => Err(format!("unknown matcher \"{other}\"")),
    }
}

fn compare(
    actual: &serde_json::Value,
    expected: &serde_json::Value,
) -> Result<std::cmp::Ordering, String> {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| "cannot order NaN".to_string());
    }
    if let (Some(a), Some(b)) = (actual.as_str(), expected.as_str()) {
        return Ok(a.cmp(b));
    }
    Err(format!("cannot order {actual} against {expected}"))
}

fn contains(actual: &serde_json::Value, expected: &serde_json::Value) -> Result<bool, String> {
    match actual {
        serde_json::Value::String(s) => {
            let needle = expected
                .as_str()
                .ok_or_else(|| format!("contains on a string requires a string, got {expected}"))?;
            Ok(s.contains(needle))
        }
        serde_json::Value::Array(items) => Ok(items.contains(expected)),
        serde_json::Value::Object(map) => {
            let key = expected
                .as_str()
                .ok_or_else(|| format!("contains on an object requires a key, got {expected}"))?;
            Ok(map.contains_key(key))
        }
        other => Err(format!("contains is not defined for {other}")),
    }
}

/// Guest-side bridge source: the pending-promise map, the sequential test
/// chain, timers, and the response wrapper.
pub const BRIDGE_JS: &str = r#"
"use strict";

// Pending hostcalls: callId -> { resolve, reject, wrapResponse }
const __rs_pending_hostcalls = new Map();
let __rs_next_call_id = 1;

// Timer callbacks: timerId -> callback
const __rs_timer_callbacks = new Map();

// Sequential test chain, pre-resolved so registration never blocks the
// synchronous body.
let __rs_test_chain = Promise.resolve();

function __rs_register_hostcall(resolve, reject, wrapResponse) {
    const callId = `call-${__rs_next_call_id++}`;
    __rs_pending_hostcalls.set(callId, { resolve, reject, wrapResponse: !!wrapResponse });
    return callId;
}

function __rs_complete_hostcall(callId, outcome) {
    const pending = __rs_pending_hostcalls.get(callId);
    if (!pending) {
        return;
    }
    __rs_pending_hostcalls.delete(callId);
    if (outcome.ok) {
        const value = pending.wrapResponse ? __rs_wrap_response(outcome.value) : outcome.value;
        pending.resolve(value);
    } else {
        const error = new Error(outcome.message);
        error.code = outcome.code;
        pending.reject(error);
    }
}

// A response crosses the boundary as plain data; the accessors below are
// pure derivations over bodyBytes/bodyText.
function __rs_wrap_response(plain) {
    const bytes = plain.bodyBytes || [];
    const text = plain.bodyText || "";
    return {
        status: plain.status,
        statusText: plain.statusText,
        headers: plain.headers,
        bodyBytes: bytes,
        header(name) {
            const wanted = String(name).toLowerCase();
            for (const h of this.headers) {
                if (h.name.toLowerCase() === wanted) {
                    return h.value;
                }
            }
            return null;
        },
        text() {
            return Promise.resolve(text);
        },
        json() {
            return Promise.resolve().then(() => JSON.parse(text));
        },
        arrayBuffer() {
            return Promise.resolve(Uint8Array.from(bytes).buffer);
        },
    };
}

function __rs_error_message(err) {
    if (err === null || err === undefined) {
        return "unknown error";
    }
    if (err instanceof Error) {
        return err.message || String(err);
    }
    if (typeof err === "object" && err.message !== undefined) {
        return String(err.message);
    }
    try {
        return String(err);
    } catch (_) {
        return "unknown error";
    }
}

function __rs_fire_timer(timerId) {
    const callback = __rs_timer_callbacks.get(timerId);
    if (callback === undefined) {
        return;
    }
    __rs_timer_callbacks.delete(timerId);
    try {
        callback();
    } catch (err) {
        console.error("uncaught error in timer callback: " + __rs_error_message(err));
    }
}

globalThis.test = function test(name, body) {
    if (typeof body !== "function") {
        throw new TypeError("test(name, body) requires a function body");
    }
    const id = __rs_test_register(String(name));
    __rs_test_chain = __rs_test_chain
        .then(() => {
            __rs_test_activate(id);
            return Promise.resolve().then(body);
        })
        .then(
            () => __rs_test_finish(id, null),
            (err) => __rs_test_finish(id, __rs_error_message(err)),
        );
};

globalThis.setTimeout = function setTimeout(callback, delay) {
    if (typeof callback !== "function") {
        throw new TypeError("setTimeout requires a callback function");
    }
    const timerId = __rs_host_sleep(Number(delay) || 0);
    __rs_timer_callbacks.set(timerId, callback);
    return timerId;
};

globalThis.clearTimeout = function clearTimeout(timerId) {
    __rs_timer_callbacks.delete(timerId);
};
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_matcher_compares_structurally() {
        let (status, _) = judge_assertion(&json!({"a": 1}), "eq", &json!({"a": 1}));
        assert_eq!(status, OutcomeStatus::Pass);
        let (status, message) = judge_assertion(&json!(1), "eq", &json!(2));
        assert_eq!(status, OutcomeStatus::Fail);
        assert_eq!(message, "expected 1 to eq 2");
    }

    #[test]
    fn ordering_matchers_work_on_numbers_and_strings() {
        assert_eq!(judge_assertion(&json!(3), "gt", &json!(2)).0, OutcomeStatus::Pass);
        assert_eq!(judge_assertion(&json!(2), "gte", &json!(2)).0, OutcomeStatus::Pass);
        assert_eq!(judge_assertion(&json!("a"), "lt", &json!("b")).0, OutcomeStatus::Pass);
        assert_eq!(judge_assertion(&json!(1), "lte", &json!(0)).0, OutcomeStatus::Fail);
    }

    #[test]
    fn ordering_on_mixed_types_fails_without_raising() {
        let (status, message) = judge_assertion(&json!(1), "gt", &json!("x"));
        assert_eq!(status, OutcomeStatus::Fail);
        assert!(message.contains("cannot order"));
    }

    #[test]
    fn contains_covers_strings_arrays_and_objects() {
        assert_eq!(
            judge_assertion(&json!("hello world"), "contains", &json!("lo w")).0,
            OutcomeStatus::Pass
        );
        assert_eq!(
            judge_assertion(&json!([1, 2, 3]), "contains", &json!(2)).0,
            OutcomeStatus::Pass
        );
        assert_eq!(
            judge_assertion(&json!({"token": "x"}), "contains", &json!("token")).0,
            OutcomeStatus::Pass
        );
        assert_eq!(
            judge_assertion(&json!([1, 2, 3]), "contains", &json!(9)).0,
            OutcomeStatus::Fail
        );
    }

    #[test]
    fn matches_applies_a_regex() {
        assert_eq!(
            judge_assertion(&json!("v1.2.3"), "matches", &json!("^v\\d+\\.\\d+\\.\\d+$")).0,
            OutcomeStatus::Pass
        );
        let (status, message) = judge_assertion(&json!("abc"), "matches", &json!("["));
        assert_eq!(status, OutcomeStatus::Fail);
        assert!(message.contains("invalid pattern"));
    }

    #[test]
    fn unknown_matcher_fails_descriptively() {
        let (status, message) = judge_assertion(&json!(1), "approximately", &json!(1));
        assert_eq!(status, OutcomeStatus::Fail);
        assert!(message.contains("unknown matcher"));
    }
}
