//! Engine configuration.

use crate::tracker::DEFAULT_SETTLE_GRACE_ROUNDS;

/// Tunables for one [`crate::engine::ScriptEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consecutive empty drain rounds before the run is considered settled.
    /// An empirically chosen safety margin; rounds in which interpreter
    /// jobs ran never count as empty, so this is a backstop rather than the
    /// primary signal.
    pub settle_grace_rounds: u32,
    /// Optional interpreter heap limit in bytes.
    pub memory_limit_bytes: Option<usize>,
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_settle_grace_rounds(mut self, rounds: u32) -> Self {
        self.settle_grace_rounds = rounds.max(1);
        self
    }

    #[must_use]
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_grace_rounds: DEFAULT_SETTLE_GRACE_ROUNDS,
            memory_limit_bytes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfig::new()
            .with_settle_grace_rounds(9)
            .with_memory_limit(16 * 1024 * 1024);
        assert_eq!(config.settle_grace_rounds, 9);
        assert_eq!(config.memory_limit_bytes, Some(16 * 1024 * 1024));
    }

    #[test]
    fn grace_rounds_never_zero() {
        let config = EngineConfig::new().with_settle_grace_rounds(0);
        assert_eq!(config.settle_grace_rounds, 1);
    }
}
