use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Index of a node slot in the registry arena. Stable for the lifetime of
/// the node; slots are recycled after `destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Monotonically increasing per-domain turn counter.
pub type TurnId = u64;

/// Admission flags carried by a turn. Only `ALLOW_INPUT_MERGING` is
/// recognized by the core; unknown bits are preserved but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnFlags(u8);

impl TurnFlags {
    pub const NONE: TurnFlags = TurnFlags(0);
    /// Permit later inputs to merge into this turn while it is still
    /// waiting for its predecessor to finish.
    pub const ALLOW_INPUT_MERGING: TurnFlags = TurnFlags(1);

    pub fn contains(self, other: TurnFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TurnFlags {
    type Output = TurnFlags;

    fn bitor(self, rhs: TurnFlags) -> TurnFlags {
        TurnFlags(self.0 | rhs.0)
    }
}

/// How a turn drives the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// One turn at a time, the submitting thread drives every tick.
    #[default]
    SequentialConcurrent,
    /// One turn at a time, but independent work inside the turn is fanned
    /// out to a worker pool.
    ParallelConcurrent,
}

/// Which propagation engine the domain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Level-ordered propagation over a priority structure.
    #[default]
    Toposort,
    /// Counts pending predecessor pulses per node; no explicit levels.
    Pulsecount,
    /// Confines propagation to the subgraph marked from the changed inputs.
    Subtree,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default)]
    pub mode: ConcurrencyMode,
    #[serde(default)]
    pub engine: EngineKind,
    /// Worker pool size for `ParallelConcurrent` mode. `None` lets the
    /// pool pick the hardware default.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            mode: ConcurrencyMode::SequentialConcurrent,
            engine: EngineKind::Toposort,
            worker_threads: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_test() {
        let flags = TurnFlags::NONE | TurnFlags::ALLOW_INPUT_MERGING;
        assert!(flags.contains(TurnFlags::ALLOW_INPUT_MERGING));
        assert!(!TurnFlags::NONE.contains(TurnFlags::ALLOW_INPUT_MERGING));
    }

    #[test]
    fn config_defaults_are_sequential_toposort() {
        let config = DomainConfig::default();
        assert_eq!(config.mode, ConcurrencyMode::SequentialConcurrent);
        assert_eq!(config.engine, EngineKind::Toposort);
        assert!(config.worker_threads.is_none());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = DomainConfig {
            mode: ConcurrencyMode::ParallelConcurrent,
            engine: EngineKind::Pulsecount,
            worker_threads: Some(4),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("parallel_concurrent"));
        let back: DomainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode, config.mode);
        assert_eq!(back.engine, config.engine);
        assert_eq!(back.worker_threads, Some(4));
    }
}
