use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Aggressiveness preset for the adaptive concurrency controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveMode {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

/// Adaptive controller tuning. `min` is both the starting target and the
/// floor for shrink operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default)]
    pub mode: AdaptiveMode,
    #[serde(default = "default_adaptive_min")]
    pub min: u32,
    /// Sliding window of most recent outcomes consulted by the controller.
    #[serde(default = "default_adaptive_window")]
    pub window: u32,
    #[serde(default = "default_ramp_after")]
    pub ramp_after_successes: u32,
    /// Ramp-up is suppressed while the observed failure rate exceeds this.
    #[serde(default = "default_ramp_max_failure_rate")]
    pub ramp_max_failure_rate: f64,
    /// Number of admissions after a severe failure during which ramp-up
    /// stays suppressed.
    #[serde(default = "default_cooldown_severe")]
    pub cooldown_severe: u32,
}

fn default_adaptive_min() -> u32 {
    1
}

fn default_adaptive_window() -> u32 {
    8
}

fn default_ramp_after() -> u32 {
    2
}

fn default_ramp_max_failure_rate() -> f64 {
    0.2
}

fn default_cooldown_severe() -> u32 {
    4
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            mode: AdaptiveMode::Balanced,
            min: default_adaptive_min(),
            window: default_adaptive_window(),
            ramp_after_successes: default_ramp_after(),
            ramp_max_failure_rate: default_ramp_max_failure_rate(),
            cooldown_severe: default_cooldown_severe(),
        }
    }
}

impl AdaptiveConfig {
    /// Preset values for a mode, used when a stack file names a mode without
    /// overriding individual knobs.
    pub fn for_mode(mode: AdaptiveMode) -> Self {
        match mode {
            AdaptiveMode::Conservative => Self {
                mode,
                min: 1,
                window: 8,
                ramp_after_successes: 4,
                ramp_max_failure_rate: 0.1,
                cooldown_severe: 8,
            },
            AdaptiveMode::Balanced => Self::default(),
            AdaptiveMode::Aggressive => Self {
                mode,
                min: 2,
                window: 4,
                ramp_after_successes: 1,
                ramp_max_failure_rate: 0.5,
                cooldown_severe: 2,
            },
        }
    }
}

/// Static admission limits enforced by the scheduler in addition to the
/// global concurrency target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Per `cluster/namespace` cap; 0 disables the budget.
    #[serde(default)]
    pub max_parallel_per_namespace: u32,
    /// Cap per user-declared parallelism group. Must be >= 1.
    #[serde(default = "default_group_limit")]
    pub parallelism_group_limit: u32,
    /// Per-kind caps keyed by `primary_kind`; an absent kind is unlimited.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_parallel_kind: BTreeMap<String, u32>,
}

fn default_group_limit() -> u32 {
    2
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_parallel_per_namespace: 0,
            parallelism_group_limit: default_group_limit(),
            max_parallel_kind: BTreeMap::new(),
        }
    }
}

/// Resolved runner configuration carried by the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub progressive_concurrency: bool,
    /// Kubernetes client rate limiting, passed through to executors.
    #[serde(default = "default_qps")]
    pub qps: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

fn default_concurrency() -> u32 {
    4
}

fn default_qps() -> f64 {
    20.0
}

fn default_burst() -> u32 {
    40
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            progressive_concurrency: false,
            qps: default_qps(),
            burst: default_burst(),
            limits: Limits::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Check the structural invariants the scheduler depends on. Returns a
    /// list of violations; empty means the config is usable.
    pub fn violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.concurrency < 1 {
            out.push("concurrency must be >= 1".to_string());
        }
        if self.limits.parallelism_group_limit < 1 {
            out.push("limits.parallelism_group_limit must be >= 1".to_string());
        }
        for (kind, cap) in &self.limits.max_parallel_kind {
            if *cap < 1 {
                out.push(format!("limits.max_parallel_kind[{kind}] must be >= 1"));
            }
        }
        if self.adaptive.min < 1 {
            out.push("adaptive.min must be >= 1".to_string());
        }
        if self.adaptive.min > self.concurrency {
            out.push(format!(
                "adaptive.min ({}) must not exceed concurrency ({})",
                self.adaptive.min, self.concurrency
            ));
        }
        if self.adaptive.window < 4 {
            out.push("adaptive.window must be >= 4".to_string());
        }
        if self.adaptive.ramp_after_successes < 1 {
            out.push("adaptive.ramp_after_successes must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.adaptive.ramp_max_failure_rate) {
            out.push("adaptive.ramp_max_failure_rate must be within [0, 1]".to_string());
        }
        out
    }
}
