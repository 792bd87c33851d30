//! Environment-first configuration for the core.
//!
//! Every tunable has a compiled default and a `PROCTOR_`-prefixed override.
//! The CLI resolves the full config once at startup and injects the pieces
//! into the components that need them.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::BusConfig;
use crate::state::StateConfig;

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

// ---------------------------------------------------------------------------
// Worker / router
// ---------------------------------------------------------------------------

/// Consumer/router tunables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent in-flight messages.
    pub max_concurrency: usize,
    /// How long the router blocks on an empty bus before re-checking for
    /// shutdown.
    pub poll_timeout: Duration,
    /// How long a shutdown waits for in-flight handlers to finish.
    pub drain_budget: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            poll_timeout: Duration::from_millis(500),
            drain_budget: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// How the executor produces results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorMode {
    /// Write a trivial report without running anything.
    #[default]
    Simulate,
    /// Spawn the runner collaborator as a child process.
    Process,
}

impl FromStr for ExecutorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simulate" => Ok(Self::Simulate),
            "process" => Ok(Self::Process),
            other => Err(format!("invalid executor mode: {other:?}")),
        }
    }
}

/// Executor agent tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub mode: ExecutorMode,
    /// Hard wall-time limit per run.
    pub timeout: Duration,
    /// Interval of the cancellation-set poll while a run is in flight.
    pub cancel_poll: Duration,
    pub report_dir: PathBuf,
    pub tests_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutorMode::Simulate,
            timeout: Duration::from_millis(120_000),
            cancel_poll: Duration::from_millis(500),
            report_dir: PathBuf::from("reports"),
            tests_dir: PathBuf::from("tests"),
        }
    }
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// Optimizer agent tunables.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Retries granted per failing execution before the flaky
    /// recommendation is recorded.
    pub max_attempts: u64,
    /// Fixed delay before a retry execution request is sent.
    pub backoff: Duration,
    /// Lifetime of the per-execution pending-optimization state.
    pub pending_ttl: Duration,
    /// Lifetime of the per-execution attempt counter.
    pub attempts_ttl: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(500),
            pending_ttl: Duration::from_secs(600),
            attempts_ttl: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Locator agent scoring boosts.
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Add +5 to `[data-testid=...]` candidates.
    pub prefer_testid: bool,
    /// Add +2 to `role=...` candidates.
    pub prefer_role: bool,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            prefer_testid: true,
            prefer_role: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Logger agent tunables.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// JSON-per-line syslog file, appended best-effort.
    pub syslog_path: PathBuf,
    /// Ceiling applied to `QUERY_LOGS` limits.
    pub max_query_limit: i64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            syslog_path: PathBuf::from("proctor-syslog.jsonl"),
            max_query_limit: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent runtime
// ---------------------------------------------------------------------------

/// Per-agent runtime budgets and health/breaker tuning.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub startup_budget: Duration,
    pub shutdown_budget: Duration,
    pub health_interval: Duration,
    /// Consecutive bad probes before the agent status degrades.
    pub failure_threshold: u32,
    /// Consecutive healthy probes before the agent status recovers.
    pub recovery_threshold: u32,
    /// Messages processed before the breaker starts evaluating.
    pub breaker_min_processed: u64,
    /// Failure rate at which the breaker opens.
    pub breaker_failure_rate: f64,
    /// Time after the last open before the breaker auto-closes.
    pub breaker_cooldown: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            startup_budget: Duration::from_secs(30),
            shutdown_budget: Duration::from_secs(10),
            health_interval: Duration::from_secs(10),
            failure_threshold: 3,
            recovery_threshold: 2,
            breaker_min_processed: 10,
            breaker_failure_rate: 0.5,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Fully resolved core configuration.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub bus: BusConfig,
    pub state: StateConfig,
    pub worker: WorkerConfig,
    pub executor: ExecutorConfig,
    pub optimizer: OptimizerConfig,
    pub locator: LocatorConfig,
    pub logger: LoggerConfig,
    pub runtime: RuntimeConfig,
}

impl CoreConfig {
    /// Build the config from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let bus_defaults = BusConfig::default();
        let bus = BusConfig {
            default_queue: env_string("PROCTOR_QUEUE_DEFAULT", &bus_defaults.default_queue),
            high_queue: env_string("PROCTOR_QUEUE_HIGH", &bus_defaults.high_queue),
            critical_queue: env_string("PROCTOR_QUEUE_CRITICAL", &bus_defaults.critical_queue),
            dead_letter_queue: env_string("PROCTOR_QUEUE_DLQ", &bus_defaults.dead_letter_queue),
            max_retries: env_parse("PROCTOR_BUS_MAX_RETRIES", bus_defaults.max_retries),
            retry_delay: Duration::from_millis(env_parse(
                "PROCTOR_BUS_RETRY_DELAY_MS",
                bus_defaults.retry_delay.as_millis() as u64,
            )),
            lease_ttl: Duration::from_secs(env_parse(
                "PROCTOR_BUS_LEASE_TTL_SECS",
                bus_defaults.lease_ttl.as_secs(),
            )),
            ..bus_defaults
        };

        let state_defaults = StateConfig::default();
        let state = StateConfig {
            prefix: env_string("PROCTOR_STATE_PREFIX", &state_defaults.prefix),
            default_ttl: Duration::from_secs(env_parse(
                "PROCTOR_STATE_TTL_SECS",
                state_defaults.default_ttl.as_secs(),
            )),
        };

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            max_concurrency: env_parse(
                "PROCTOR_WORKER_CONCURRENCY",
                worker_defaults.max_concurrency,
            ),
            drain_budget: Duration::from_secs(env_parse(
                "PROCTOR_WORKER_DRAIN_SECS",
                worker_defaults.drain_budget.as_secs(),
            )),
            ..worker_defaults
        };

        let executor_defaults = ExecutorConfig::default();
        let executor = ExecutorConfig {
            mode: env_parse("PROCTOR_EXECUTOR_MODE", executor_defaults.mode),
            timeout: Duration::from_millis(env_parse(
                "PROCTOR_EXECUTOR_TIMEOUT_MS",
                executor_defaults.timeout.as_millis() as u64,
            )),
            report_dir: PathBuf::from(env_string("PROCTOR_REPORT_DIR", "reports")),
            tests_dir: PathBuf::from(env_string("PROCTOR_TESTS_DIR", "tests")),
            ..executor_defaults
        };

        let optimizer_defaults = OptimizerConfig::default();
        let optimizer = OptimizerConfig {
            max_attempts: env_parse(
                "PROCTOR_OPTIMIZER_MAX_ATTEMPTS",
                optimizer_defaults.max_attempts,
            ),
            backoff: Duration::from_millis(env_parse(
                "PROCTOR_OPTIMIZER_BACKOFF_MS",
                optimizer_defaults.backoff.as_millis() as u64,
            )),
            ..optimizer_defaults
        };

        let logger_defaults = LoggerConfig::default();
        let logger = LoggerConfig {
            syslog_path: PathBuf::from(env_string(
                "PROCTOR_SYSLOG_PATH",
                &logger_defaults.syslog_path.to_string_lossy(),
            )),
            ..logger_defaults
        };

        let runtime_defaults = RuntimeConfig::default();
        let runtime = RuntimeConfig {
            health_interval: Duration::from_secs(env_parse(
                "PROCTOR_HEALTH_INTERVAL_SECS",
                runtime_defaults.health_interval.as_secs(),
            )),
            failure_threshold: env_parse(
                "PROCTOR_HEALTH_FAILURE_THRESHOLD",
                runtime_defaults.failure_threshold,
            ),
            recovery_threshold: env_parse(
                "PROCTOR_HEALTH_RECOVERY_THRESHOLD",
                runtime_defaults.recovery_threshold,
            ),
            startup_budget: Duration::from_secs(env_parse(
                "PROCTOR_STARTUP_BUDGET_SECS",
                runtime_defaults.startup_budget.as_secs(),
            )),
            shutdown_budget: Duration::from_secs(env_parse(
                "PROCTOR_SHUTDOWN_BUDGET_SECS",
                runtime_defaults.shutdown_budget.as_secs(),
            )),
            ..runtime_defaults
        };

        Self {
            bus,
            state,
            worker,
            executor,
            optimizer,
            locator: LocatorConfig::default(),
            logger,
            runtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_mode_parses() {
        assert_eq!("simulate".parse::<ExecutorMode>().ok(), Some(ExecutorMode::Simulate));
        assert_eq!("process".parse::<ExecutorMode>().ok(), Some(ExecutorMode::Process));
        assert!("browser".parse::<ExecutorMode>().is_err());
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.worker.max_concurrency, 4);
        assert_eq!(config.bus.max_retries, 3);
        assert_eq!(config.bus.lease_ttl, Duration::from_secs(600));
        assert_eq!(config.optimizer.max_attempts, 2);
        assert_eq!(config.runtime.breaker_min_processed, 10);
        assert_eq!(config.runtime.breaker_cooldown, Duration::from_secs(60));
        assert_eq!(config.executor.cancel_poll, Duration::from_millis(500));
    }
}
