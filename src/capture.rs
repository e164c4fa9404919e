//! Result capture: the single point that turns live run state into an
//! immutable snapshot.
//!
//! Handing a consumer a live reference lets it observe a later mutation
//! from a stray continuation as if it were the final answer. Everything in
//! a [`RunResult`] is therefore an independent deep copy, produced exactly
//! once per run by the engine's `Capturing` state.

use crate::context::{ConsoleEntry, Cookie, EnvVar, ScriptContext, TestDescriptor, TestOutcome};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Environment snapshot at capture time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub global: Vec<EnvVar>,
    pub selected: Vec<EnvVar>,
}

/// The final immutable snapshot of one script run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub environment: EnvironmentSnapshot,
    pub cookies: Vec<Cookie>,
    pub tests: Vec<TestDescriptor>,
    /// Assertions recorded outside any test body, plus failures of dead
    /// top-level async branches.
    pub root_outcomes: Vec<TestOutcome>,
    pub console: Vec<ConsoleEntry>,
    /// Present only when the guest changed the `request` global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutated_request: Option<Value>,
}

/// Why a run produced no [`RunResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFailureKind {
    ScriptError,
    Timeout,
    UnsupportedFeature,
}

/// Terminal run failure with best-effort partial test data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFailure {
    pub kind: ScriptFailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_tests: Option<Vec<TestDescriptor>>,
}

impl ScriptFailure {
    #[must_use]
    pub fn script_error(
        message: impl Into<String>,
        partial_tests: Option<Vec<TestDescriptor>>,
    ) -> Self {
        Self {
            kind: ScriptFailureKind::ScriptError,
            message: message.into(),
            partial_tests,
        }
    }

    #[must_use]
    pub fn timeout(
        message: impl Into<String>,
        partial_tests: Option<Vec<TestDescriptor>>,
    ) -> Self {
        Self {
            kind: ScriptFailureKind::Timeout,
            message: message.into(),
            partial_tests,
        }
    }

    #[must_use]
    pub fn unsupported_feature(
        message: impl Into<String>,
        partial_tests: Option<Vec<TestDescriptor>>,
    ) -> Self {
        Self {
            kind: ScriptFailureKind::UnsupportedFeature,
            message: message.into(),
            partial_tests,
        }
    }
}

impl std::fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ScriptFailureKind::ScriptError => "script error",
            ScriptFailureKind::Timeout => "timeout",
            ScriptFailureKind::UnsupportedFeature => "unsupported feature",
        };
        write!(f, "{kind}: {}", self.message)
    }
}

impl std::error::Error for ScriptFailure {}

impl From<Error> for ScriptFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::Unsupported(message) => Self::unsupported_feature(message, None),
            other => Self::script_error(other.to_string(), None),
        }
    }
}

/// Deep-copy all mutable state into a [`RunResult`].
///
/// `final_request` is the `request` global read back from the guest;
/// `original_request` is what the caller supplied. They are compared so
/// `mutated_request` is only set when the guest actually changed something.
#[must_use]
pub fn capture_run_result(
    ctx: &ScriptContext,
    original_request: &Value,
    final_request: Option<Value>,
) -> RunResult {
    let mutated_request = final_request.filter(|current| current != original_request);

    tracing::debug!(
        event = "capture.snapshot",
        tests = ctx.tests_registered(),
        console_entries = ctx.console().len(),
        request_mutated = mutated_request.is_some(),
        "Captured run result"
    );

    RunResult {
        environment: EnvironmentSnapshot {
            global: ctx.environment.global.clone(),
            selected: ctx.environment.selected.clone(),
        },
        cookies: ctx.cookies.cookies.clone(),
        tests: ctx.export_tests(),
        root_outcomes: ctx.export_root_outcomes(),
        console: ctx.console().to_vec(),
        mutated_request,
    }
}
