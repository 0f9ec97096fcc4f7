use std::collections::VecDeque;
use std::sync::Mutex;

use ktl_stack_types::{AdaptiveConfig, ErrorClass};

/// A target adjustment to announce as `RUN_CONCURRENCY`.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetChange {
    pub reason: String,
    pub class: Option<ErrorClass>,
    pub from: u32,
    pub to: u32,
    pub window: usize,
    pub fail_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure(ErrorClass),
}

struct State {
    target: u32,
    window: VecDeque<Outcome>,
    successes_since_change: u32,
    cooldown: u32,
}

/// Outcome-driven concurrency controller.
///
/// Starts at `min` and walks the target up on sustained success, halves on
/// rate limiting (with a ramp-suppressing cooldown measured in admissions),
/// and shrinks by one on repeated conflicts. `OTHER` outcomes never move
/// the target.
pub struct AdaptiveController {
    config: AdaptiveConfig,
    max: u32,
    state: Mutex<State>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, max_concurrency: u32) -> Self {
        let start = config.min.clamp(1, max_concurrency.max(1));
        Self {
            config,
            max: max_concurrency.max(1),
            state: Mutex::new(State {
                target: start,
                window: VecDeque::new(),
                successes_since_change: 0,
                cooldown: 0,
            }),
        }
    }

    pub fn target(&self) -> u32 {
        self.lock().target
    }

    /// Called once per dispatched node; burns down the post-shrink
    /// cooldown.
    pub fn on_admission(&self) {
        let mut state = self.lock();
        state.cooldown = state.cooldown.saturating_sub(1);
    }

    pub fn on_success(&self) -> Option<TargetChange> {
        let mut state = self.lock();
        self.push(&mut state, Outcome::Success);
        state.successes_since_change += 1;

        let fail_rate = fail_rate(&state.window);
        if state.successes_since_change >= self.config.ramp_after_successes
            && fail_rate <= self.config.ramp_max_failure_rate
            && state.cooldown == 0
            && state.target < self.max
        {
            let from = state.target;
            state.target += 1;
            state.successes_since_change = 0;
            return Some(TargetChange {
                reason: "ramp-up".to_string(),
                class: None,
                from,
                to: state.target,
                window: state.window.len(),
                fail_rate,
            });
        }
        None
    }

    pub fn on_failure(&self, class: ErrorClass) -> Option<TargetChange> {
        let mut state = self.lock();
        self.push(&mut state, Outcome::Failure(class));
        state.successes_since_change = 0;

        match class {
            ErrorClass::RateLimit => {
                state.cooldown = self.config.cooldown_severe;
                let from = state.target;
                state.target = (state.target / 2).max(self.config.min);
                if state.target == from {
                    return None;
                }
                Some(TargetChange {
                    reason: "RATE_LIMIT".to_string(),
                    class: Some(class),
                    from,
                    to: state.target,
                    window: state.window.len(),
                    fail_rate: fail_rate(&state.window),
                })
            }
            ErrorClass::Conflict => {
                let conflicts = state
                    .window
                    .iter()
                    .filter(|o| matches!(o, Outcome::Failure(ErrorClass::Conflict)))
                    .count();
                // First conflict in the window is tolerated; the second
                // shrinks by one.
                if conflicts < 2 || state.target <= self.config.min {
                    return None;
                }
                let from = state.target;
                state.target -= 1;
                Some(TargetChange {
                    reason: "CONFLICT".to_string(),
                    class: Some(class),
                    from,
                    to: state.target,
                    window: state.window.len(),
                    fail_rate: fail_rate(&state.window),
                })
            }
            _ => None,
        }
    }

    fn push(&self, state: &mut State, outcome: Outcome) {
        state.window.push_back(outcome);
        while state.window.len() > self.config.window as usize {
            state.window.pop_front();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("adaptive state poisoned")
    }
}

fn fail_rate(window: &VecDeque<Outcome>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let failures = window
        .iter()
        .filter(|o| matches!(o, Outcome::Failure(_)))
        .count();
    failures as f64 / window.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AdaptiveConfig {
        AdaptiveConfig {
            min: 1,
            window: 8,
            ramp_after_successes: 2,
            ramp_max_failure_rate: 0.5,
            cooldown_severe: 3,
            ..AdaptiveConfig::default()
        }
    }

    #[test]
    fn starts_at_min_and_ramps_on_two_successes() {
        let ctl = AdaptiveController::new(config(), 8);
        assert_eq!(ctl.target(), 1);

        assert!(ctl.on_success().is_none());
        let change = ctl.on_success().expect("ramp");
        assert_eq!(change.reason, "ramp-up");
        assert_eq!(change.from, 1);
        assert_eq!(change.to, 2);
        assert_eq!(ctl.target(), 2);
    }

    #[test]
    fn ramp_is_capped_at_max_concurrency() {
        let ctl = AdaptiveController::new(config(), 2);
        ctl.on_success();
        ctl.on_success();
        assert_eq!(ctl.target(), 2);
        for _ in 0..8 {
            assert!(ctl.on_success().is_none());
        }
        assert_eq!(ctl.target(), 2);
    }

    #[test]
    fn rate_limit_halves_to_no_less_than_min() {
        let ctl = AdaptiveController::new(config(), 8);
        for _ in 0..8 {
            ctl.on_success();
        }
        let before = ctl.target();
        assert!(before >= 4);

        let change = ctl.on_failure(ErrorClass::RateLimit).expect("shrink");
        assert_eq!(change.reason, "RATE_LIMIT");
        assert_eq!(change.from, before);
        assert_eq!(change.to, before / 2);

        // Already at min: halving again reports no change.
        let ctl = AdaptiveController::new(config(), 8);
        assert!(ctl.on_failure(ErrorClass::RateLimit).is_none());
        assert_eq!(ctl.target(), 1);
    }

    #[test]
    fn cooldown_suppresses_ramp_until_admissions_burn_it_down() {
        let ctl = AdaptiveController::new(config(), 8);
        ctl.on_success();
        ctl.on_success(); // target 2
        ctl.on_failure(ErrorClass::RateLimit); // target 1, cooldown 3

        // Plenty of successes, but cooldown holds the target.
        assert!(ctl.on_success().is_none());
        assert!(ctl.on_success().is_none());
        assert_eq!(ctl.target(), 1);

        for _ in 0..3 {
            ctl.on_admission();
        }
        ctl.on_success();
        let change = ctl.on_success().expect("ramp after cooldown");
        assert_eq!(change.reason, "ramp-up");
    }

    #[test]
    fn first_conflict_is_tolerated_second_shrinks_by_one() {
        let ctl = AdaptiveController::new(config(), 8);
        for _ in 0..6 {
            ctl.on_success();
        }
        let before = ctl.target();
        assert!(before >= 3);

        assert!(ctl.on_failure(ErrorClass::Conflict).is_none());
        let change = ctl.on_failure(ErrorClass::Conflict).expect("shrink");
        assert_eq!(change.reason, "CONFLICT");
        assert_eq!(change.from, before);
        assert_eq!(change.to, before - 1);
    }

    #[test]
    fn conflicts_age_out_of_the_window() {
        let mut cfg = config();
        cfg.window = 4;
        let ctl = AdaptiveController::new(cfg, 8);
        for _ in 0..6 {
            ctl.on_success();
        }
        let before = ctl.target();

        assert!(ctl.on_failure(ErrorClass::Conflict).is_none());
        // Push the conflict out of the 4-slot window.
        for _ in 0..4 {
            ctl.on_success();
        }
        // This conflict is again the only one in the window.
        assert!(ctl.on_failure(ErrorClass::Conflict).is_none());
        assert!(ctl.target() >= before);
    }

    #[test]
    fn other_failures_never_move_the_target() {
        let ctl = AdaptiveController::new(config(), 8);
        ctl.on_success();
        ctl.on_success();
        let target = ctl.target();
        for _ in 0..6 {
            assert!(ctl.on_failure(ErrorClass::Other).is_none());
        }
        assert_eq!(ctl.target(), target);
    }

    #[test]
    fn high_failure_rate_blocks_ramp() {
        let mut cfg = config();
        cfg.ramp_max_failure_rate = 0.2;
        let ctl = AdaptiveController::new(cfg, 8);
        ctl.on_failure(ErrorClass::Other);
        ctl.on_failure(ErrorClass::Other);
        // Two successes, but the window is half failures.
        assert!(ctl.on_success().is_none());
        assert!(ctl.on_success().is_none());
        assert_eq!(ctl.target(), 1);
    }
}
