//! Strand runtime configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. Builder calls / set_param
//! 2. Environment variables (STRAND_*)
//! 3. Config file (JSON, loaded explicitly)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use strand::util::config::RuntimeConfig;
//!
//! let mut config = RuntimeConfig::from_env().unwrap();
//! config.set("nworkers", "4").unwrap();
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::runtime::error::ParamError;

/// How an idle worker picks the next victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    /// Uniformly random among the other workers.
    #[default]
    Random,
    /// Cycle through the other workers in index order.
    RoundRobin,
}

/// Where diagnostic reports go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpTarget {
    Stderr,
    File(PathBuf),
}

impl DumpTarget {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "" | "0" | "off" | "none" => None,
            "stderr" | "1" => Some(DumpTarget::Stderr),
            path => Some(DumpTarget::File(PathBuf::from(path))),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Total workers, counting the user thread that calls `run`
    #[serde(default = "default_nworkers")]
    pub nworkers: usize,
    /// Threads that may be bound as user workers at the same time
    #[serde(default = "default_max_user_workers")]
    pub max_user_workers: usize,
    /// Bytes per fiber stack
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    /// System-wide cap on live fiber stacks
    #[serde(default = "default_max_stacks")]
    pub max_stacks: usize,
    /// Fibers each worker keeps for itself
    #[serde(default = "default_local_stack_cache")]
    pub local_stack_cache: usize,
    /// Ready deque entries per worker
    #[serde(default = "default_deque_capacity")]
    pub deque_capacity: usize,
    #[serde(default)]
    pub victim_policy: VictimPolicy,
    /// Failed steal rounds spent spinning before yielding the thread
    #[serde(default = "default_steal_rounds_before_yield")]
    pub steal_rounds_before_yield: u32,
    /// Yielding rounds before going to sleep
    #[serde(default = "default_yield_rounds_before_sleep")]
    pub yield_rounds_before_sleep: u32,
    /// Upper bound on one sleep, in milliseconds
    #[serde(default = "default_sleep_timeout_ms")]
    pub sleep_timeout_ms: u64,
    #[serde(default)]
    pub diagnostics: Option<DumpTarget>,
}

fn default_nworkers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_max_user_workers() -> usize {
    default_nworkers().max(4)
}

fn default_stack_size() -> usize {
    1024 * 1024
}

fn default_max_stacks() -> usize {
    1024
}

fn default_local_stack_cache() -> usize {
    8
}

fn default_deque_capacity() -> usize {
    1024
}

fn default_steal_rounds_before_yield() -> u32 {
    16
}

fn default_yield_rounds_before_sleep() -> u32 {
    32
}

fn default_sleep_timeout_ms() -> u64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            nworkers: default_nworkers(),
            max_user_workers: default_max_user_workers(),
            stack_size: default_stack_size(),
            max_stacks: default_max_stacks(),
            local_stack_cache: default_local_stack_cache(),
            deque_capacity: default_deque_capacity(),
            victim_policy: VictimPolicy::default(),
            steal_rounds_before_yield: default_steal_rounds_before_yield(),
            yield_rounds_before_sleep: default_yield_rounds_before_sleep(),
            sleep_timeout_ms: default_sleep_timeout_ms(),
            diagnostics: None,
        }
    }
}

/// Environment variables read by [`RuntimeConfig::from_env`], with the
/// parameter each one sets.
pub const ENV_PARAMS: &[(&str, &str)] = &[
    ("STRAND_NWORKERS", "nworkers"),
    ("STRAND_MAX_USER_WORKERS", "max_user_workers"),
    ("STRAND_STACK_SIZE", "stack_size"),
    ("STRAND_MAX_STACKS", "max_stacks"),
    ("STRAND_LOCAL_STACK_CACHE", "local_stack_cache"),
    ("STRAND_DEQUE_CAPACITY", "deque_capacity"),
    ("STRAND_VICTIM_POLICY", "victim_policy"),
    ("STRAND_DUMP", "dump"),
];

/// Smallest stack the runtime will hand to user code.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

impl RuntimeConfig {
    /// Defaults overridden by `STRAND_*` environment variables.
    pub fn from_env() -> Result<Self, ParamError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `STRAND_*` environment variables on top of `self`.
    pub fn apply_env(&mut self) -> Result<(), ParamError> {
        for (var, name) in ENV_PARAMS {
            if let Ok(value) = std::env::var(var) {
                self.set(name, &value)?;
            }
        }
        Ok(())
    }

    /// Set one parameter by name from its string form.
    pub fn set(
        &mut self,
        name: &str,
        value: &str,
    ) -> Result<(), ParamError> {
        match name {
            "nworkers" => self.nworkers = parse_count(name, value, 1, 4096)?,
            "max_user_workers" => self.max_user_workers = parse_count(name, value, 1, 4096)?,
            "stack_size" => {
                self.stack_size = parse_count(name, value, MIN_STACK_SIZE, 1 << 30)?
            },
            "max_stacks" => self.max_stacks = parse_count(name, value, 1, 1 << 20)?,
            "local_stack_cache" => self.local_stack_cache = parse_count(name, value, 0, 1 << 16)?,
            "deque_capacity" => self.deque_capacity = parse_count(name, value, 2, 1 << 24)?,
            "victim_policy" => {
                self.victim_policy = match value.trim() {
                    "random" => VictimPolicy::Random,
                    "round_robin" | "round-robin" => VictimPolicy::RoundRobin,
                    _ => return Err(invalid(name, value)),
                }
            },
            "steal_rounds_before_yield" => {
                self.steal_rounds_before_yield = parse_count(name, value, 0, 1 << 20)? as u32
            },
            "yield_rounds_before_sleep" => {
                self.yield_rounds_before_sleep = parse_count(name, value, 0, 1 << 20)? as u32
            },
            "sleep_timeout_ms" => {
                self.sleep_timeout_ms = parse_count(name, value, 1, 60_000)? as u64
            },
            "dump" => self.diagnostics = DumpTarget::parse(value),
            _ => return Err(ParamError::Unimplemented(name.to_string())),
        }
        Ok(())
    }

    /// System workers: every worker except the one the user thread provides.
    #[inline]
    pub fn system_workers(&self) -> usize {
        self.nworkers.saturating_sub(1)
    }

    /// Worker slots: system workers followed by user worker slots.
    #[inline]
    pub fn total_slots(&self) -> usize {
        self.system_workers() + self.max_user_workers
    }

    /// Load a JSON config file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        serde_json::from_str(&content).map_err(ConfigError::ParseError)
    }

    /// Save as pretty JSON.
    pub fn save(
        &self,
        path: &Path,
    ) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::SerializeError)?;
        fs::write(path, content).map_err(ConfigError::IoError)
    }
}

fn invalid(
    name: &str,
    value: &str,
) -> ParamError {
    ParamError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn parse_count(
    name: &str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<usize, ParamError> {
    let parsed: usize = value.trim().parse().map_err(|_| invalid(name, value))?;
    if parsed < min || parsed > max {
        return Err(ParamError::OutOfRange {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    ParseError(serde_json::Error),
    SerializeError(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Config parse error: {}", e),
            ConfigError::SerializeError(e) => write!(f, "Config serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
