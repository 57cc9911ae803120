//! Task loop configuration.
//!
//! Every knob reads from the environment with a usable default so a bare
//! `gary-agents run "goal"` works against a local gateway. Endpoint and MCP
//! settings live in [`gateway::GatewayConfig`]; this covers only the loop
//! itself.

use std::time::Duration;

/// Tunables for one task loop run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Attempts allowed per step before the loop gives up on it.
    pub step_retry_budget: u32,
    /// Base delay for the exponential backoff between step attempts.
    pub step_backoff_base: Duration,
    /// Ceiling for the step backoff.
    pub step_backoff_cap: Duration,
    /// Pause for a human decision on escalation and retry exhaustion
    /// instead of failing the task outright.
    pub checkpoint_enabled: bool,
    /// Most steps accepted from a single plan; the rest are dropped.
    pub max_plan_steps: usize,
    /// Sampling temperature passed through to the inference backend.
    pub temperature: f64,
    /// Completion token limit passed through to the inference backend.
    pub max_tokens: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            step_retry_budget: env_parsed("GARY_STEP_RETRIES", 3u32),
            step_backoff_base: Duration::from_millis(env_parsed(
                "GARY_STEP_BACKOFF_MS",
                1_000u64,
            )),
            step_backoff_cap: Duration::from_secs(30),
            checkpoint_enabled: env_flag("GARY_CHECKPOINT_ENABLED"),
            max_plan_steps: env_parsed("GARY_MAX_PLAN_STEPS", 16usize),
            temperature: env_parsed("GARY_TEMPERATURE", 0.7f64),
            max_tokens: env_parsed("GARY_MAX_TOKENS", 2_048u64),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
