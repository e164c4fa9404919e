//! Per-run mutable state owned by one script execution.
//!
//! A [`ScriptContext`] is created at invocation start and lives until the
//! run's result snapshot exists. It owns the environment scopes, the cookie
//! jar, the console sink and the test descriptor tree; capabilities mutate
//! it through a shared handle, and the capture hook deep-copies it exactly
//! once at the end.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Environment scope names. Two ordered scopes, unique keys per scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvScope {
    Global,
    Selected,
}

impl EnvScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Selected => "selected",
        }
    }

    /// Parse a guest-supplied scope name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "global" => Some(Self::Global),
            "selected" => Some(Self::Selected),
            _ => None,
        }
    }
}

/// One environment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub secret: bool,
}

/// Two ordered scopes of environment variables.
///
/// Set preserves insertion order and the existing secret flag on overwrite;
/// lookup without an explicit scope prefers `selected` over `global`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub global: Vec<EnvVar>,
    pub selected: Vec<EnvVar>,
}

impl Environment {
    fn scope(&self, scope: EnvScope) -> &Vec<EnvVar> {
        match scope {
            EnvScope::Global => &self.global,
            EnvScope::Selected => &self.selected,
        }
    }

    fn scope_mut(&mut self, scope: EnvScope) -> &mut Vec<EnvVar> {
        match scope {
            EnvScope::Global => &mut self.global,
            EnvScope::Selected => &mut self.selected,
        }
    }

    #[must_use]
    pub fn get(&self, scope: EnvScope, key: &str) -> Option<&Value> {
        self.scope(scope)
            .iter()
            .find(|v| v.key == key)
            .map(|v| &v.value)
    }

    /// Scope-less lookup: selected wins over global.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.get(EnvScope::Selected, key)
            .or_else(|| self.get(EnvScope::Global, key))
    }

    pub fn set(&mut self, scope: EnvScope, key: &str, value: Value) {
        let vars = self.scope_mut(scope);
        if let Some(existing) = vars.iter_mut().find(|v| v.key == key) {
            existing.value = value;
        } else {
            vars.push(EnvVar {
                key: key.to_string(),
                value,
                secret: false,
            });
        }
        tracing::trace!(
            event = "context.env_set",
            scope = scope.as_str(),
            key = key,
            "Environment variable set"
        );
    }

    /// Remove a key from one scope; returns whether it existed.
    pub fn unset(&mut self, scope: EnvScope, key: &str) -> bool {
        let vars = self.scope_mut(scope);
        let before = vars.len();
        vars.retain(|v| v.key != key);
        vars.len() != before
    }
}

/// One stored cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Ordered cookie jar, exclusively owned by one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CookieJar {
    pub cookies: Vec<Cookie>,
}

impl CookieJar {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Upsert by name, preserving position on overwrite.
    pub fn set(&mut self, cookie: Cookie) {
        if let Some(existing) = self.cookies.iter_mut().find(|c| c.name == cookie.name) {
            *existing = cookie;
        } else {
            self.cookies.push(cookie);
        }
    }
}

/// Console entry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// One console entry; entries preserve true emission order across
/// interleaved sync and async guest code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
}

/// Outcome status of one assertion or body failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Pass,
    Fail,
}

/// One recorded outcome on a test descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub status: OutcomeStatus,
    pub message: String,
}

/// Exported test tree node, plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescriptor {
    pub name: String,
    pub outcomes: Vec<TestOutcome>,
    pub children: Vec<TestDescriptor>,
}

/// Arena node backing one descriptor while the run is live.
#[derive(Debug)]
struct TestNode {
    name: String,
    outcomes: Vec<TestOutcome>,
    children: Vec<usize>,
    finished: bool,
}

const ROOT_NODE: usize = 0;

/// All mutable state of one script execution.
#[derive(Debug)]
pub struct ScriptContext {
    pub environment: Environment,
    pub cookies: CookieJar,
    console: Vec<ConsoleEntry>,
    nodes: Vec<TestNode>,
    /// Active descriptor stack. The root is always at the bottom, so
    /// top-level assertions attach to the synthetic root.
    active: Vec<usize>,
    tests_registered: usize,
    tests_completed: usize,
    script_error: Option<ScriptErrorRecord>,
    sync_body_done: bool,
}

/// A top-level guest error captured by the bridge.
#[derive(Debug, Clone)]
pub struct ScriptErrorRecord {
    pub message: String,
    pub code: Option<String>,
}

impl ScriptContext {
    #[must_use]
    pub fn new(environment: Environment, cookies: CookieJar) -> Self {
        Self {
            environment,
            cookies,
            console: Vec::new(),
            nodes: vec![TestNode {
                name: String::new(),
                outcomes: Vec::new(),
                children: Vec::new(),
                finished: false,
            }],
            active: vec![ROOT_NODE],
            tests_registered: 0,
            tests_completed: 0,
            script_error: None,
            sync_body_done: false,
        }
    }

    pub fn push_console(&mut self, level: ConsoleLevel, message: impl Into<String>) {
        self.console.push(ConsoleEntry {
            level,
            message: message.into(),
        });
    }

    #[must_use]
    pub fn console(&self) -> &[ConsoleEntry] {
        &self.console
    }

    /// Register a test under the currently active descriptor.
    ///
    /// Registration nests under whichever test body is executing right now,
    /// which is what makes `test()` calls inside a running test children of
    /// that test while top-level calls become roots.
    pub fn register_test(&mut self, name: impl Into<String>) -> usize {
        let parent = *self.active.last().unwrap_or(&ROOT_NODE);
        let id = self.nodes.len();
        self.nodes.push(TestNode {
            name: name.into(),
            outcomes: Vec::new(),
            children: Vec::new(),
            finished: false,
        });
        self.nodes[parent].children.push(id);
        self.tests_registered += 1;
        tracing::trace!(
            event = "context.test_registered",
            id = id,
            parent = parent,
            registered = self.tests_registered,
            "Test registered"
        );
        id
    }

    /// Push a descriptor onto the active stack as its body begins.
    pub fn activate_test(&mut self, id: usize) {
        debug_assert!(id < self.nodes.len());
        self.active.push(id);
    }

    /// Pop a descriptor as its body settles, recording a failure first if
    /// the body raised. A descriptor is frozen from this point on.
    pub fn finish_test(&mut self, id: usize, error: Option<String>) {
        if let Some(message) = error {
            if let Some(node) = self.nodes.get_mut(id) {
                node.outcomes.push(TestOutcome {
                    status: OutcomeStatus::Fail,
                    message,
                });
            }
        }
        if self.active.last() == Some(&id) {
            self.active.pop();
        } else {
            // Out-of-order finish means the bridge chain discipline broke;
            // recover by dropping everything above the root.
            tracing::warn!(
                event = "context.unbalanced_finish",
                id = id,
                "Test finished out of stack order"
            );
            self.active.retain(|&n| n == ROOT_NODE);
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.finished = true;
        }
        self.tests_completed += 1;
        tracing::trace!(
            event = "context.test_finished",
            id = id,
            completed = self.tests_completed,
            "Test finished"
        );
    }

    /// Record an assertion outcome on the currently active descriptor.
    ///
    /// Outcomes only attach to the stack top: a descriptor's outcome list
    /// grows while it is active and is frozen once execution moves past it.
    pub fn record_outcome(&mut self, status: OutcomeStatus, message: impl Into<String>) {
        let id = *self.active.last().unwrap_or(&ROOT_NODE);
        let node = &mut self.nodes[id];
        debug_assert!(!node.finished, "outcome recorded on a frozen descriptor");
        node.outcomes.push(TestOutcome {
            status,
            message: message.into(),
        });
    }

    /// Record a failing outcome on the synthetic root (a dead top-level
    /// async branch).
    pub fn record_root_failure(&mut self, message: impl Into<String>) {
        self.nodes[ROOT_NODE].outcomes.push(TestOutcome {
            status: OutcomeStatus::Fail,
            message: message.into(),
        });
    }

    #[must_use]
    pub fn tests_registered(&self) -> usize {
        self.tests_registered
    }

    /// Whether the sequential test chain has fully settled.
    #[must_use]
    pub fn chain_settled(&self) -> bool {
        self.tests_completed == self.tests_registered
    }

    pub fn record_script_error(&mut self, message: String, code: Option<String>) {
        if self.script_error.is_none() {
            self.script_error = Some(ScriptErrorRecord { message, code });
        }
    }

    pub fn take_script_error(&mut self) -> Option<ScriptErrorRecord> {
        self.script_error.take()
    }

    /// Mark the guest's top-level synchronous body as completed; later
    /// top-level rejections fail only their own branch.
    pub fn mark_sync_body_done(&mut self) {
        self.sync_body_done = true;
    }

    #[must_use]
    pub fn sync_body_done(&self) -> bool {
        self.sync_body_done
    }

    /// Export the test tree as independent plain data (root's children).
    #[must_use]
    pub fn export_tests(&self) -> Vec<TestDescriptor> {
        self.nodes[ROOT_NODE]
            .children
            .iter()
            .map(|&child| self.export_node(child))
            .collect()
    }

    /// Export the synthetic root's own outcomes (top-level assertions and
    /// dead-branch failures).
    #[must_use]
    pub fn export_root_outcomes(&self) -> Vec<TestOutcome> {
        self.nodes[ROOT_NODE].outcomes.clone()
    }

    fn export_node(&self, id: usize) -> TestDescriptor {
        let node = &self.nodes[id];
        TestDescriptor {
            name: node.name.clone(),
            outcomes: node.outcomes.clone(),
            children: node
                .children
                .iter()
                .map(|&child| self.export_node(child))
                .collect(),
        }
    }
}
