//! Embedded JavaScript sandbox for HTTP pre-request and test scripts.
//!
//! `reqscript` runs untrusted, user-authored scripts against an HTTP
//! request/response context inside an isolated QuickJS interpreter. Host
//! capabilities (logging, a key-value environment, cookies, `fetch`, test
//! registration and assertions) cross the isolation boundary as plain data
//! only, and every run produces exactly one immutable result snapshot.
//!
//! ```text
//! caller --source + request/response/env/cookies + executor--> ScriptEngine
//!
//!   install capabilities (bridge)    fresh QuickJS context
//!   run synchronous body         --> registers tests, mutates state, fetches
//!   drain tracker + test chain   <-- network completions, microtask fixpoints
//!   capture hook (exactly once)  --> independent deep copies
//!
//!   => RunResult | ScriptFailure
//! ```
//!
//! The guest's `fetch` never opens sockets: the engine hands a normalized
//! [`marshal::RequestDescriptor`] to the caller-supplied
//! [`engine::NetworkExecutor`] and marshals the answer back as a fully
//! drained [`marshal::SerializedResponse`].
//!
//! # Example
//!
//! ```ignore
//! let engine = ScriptEngine::new();
//! let options = RunOptions::new(request, Arc::new(MyExecutor));
//! let result = engine.run(r#"
//!     test('status is ok', async () => {
//!         const r = await fetch('https://api.test/health');
//!         assert(r.status, 'eq', 200);
//!     });
//! "#, options).await?;
//! ```

pub mod bridge;
pub mod capture;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod marshal;
pub mod tracker;

pub use capture::{EnvironmentSnapshot, RunResult, ScriptFailure, ScriptFailureKind};
pub use config::EngineConfig;
pub use context::{
    ConsoleEntry, ConsoleLevel, Cookie, CookieJar, EnvScope, EnvVar, Environment, OutcomeStatus,
    TestDescriptor, TestOutcome,
};
pub use engine::{NetworkExecutor, RunOptions, ScriptEngine, ScriptEngineHandle, ScriptPhase};
pub use error::{Error, Result};
pub use marshal::{
    Header, RawResponse, RequestBody, RequestDescriptor, SerializedResponse,
    to_network_request, to_serialized_response,
};
