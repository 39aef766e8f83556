//! Error injection for simulated devices.
//!
//! Failures surface as `anyhow` errors, the same way a real device adapter
//! reports a remote call that went wrong.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::rng::MockRng;

/// Error injection configuration
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0); `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call of `operation` after the first `count` succeeded
    FailAfterN {
        operation: &'static str,
        count: u32,
    },
    /// Every call fails from the first one on
    CommunicationLoss,
    /// Latched fault reported on every later call
    HardwareFault { code: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// No injected errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures with a fixed seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Fail if an injected error applies to `operation` on `device`.
    pub fn check_operation(&self, device: &str, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock();

        if state.communication_lost {
            bail!("{device}: communication lost");
        }
        if state.hardware_fault_code != 0 {
            bail!("{device}: hardware fault {}", state.hardware_fault_code);
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN { operation: op, count } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        bail!("{device}: injected failure of '{operation}' after {count} calls");
                    }
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    bail!("{device}: communication lost");
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    bail!("{device}: hardware fault {code}");
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            bail!("{device}: random failure on '{operation}'");
        }
        Ok(())
    }

    /// Clear counters and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("cam", "trigger").is_ok());
        }
    }

    #[test]
    fn test_random_failures() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("cam", "trigger").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "run",
            count: 2,
        });
        assert!(config.check_operation("dsp", "run").is_ok());
        assert!(config.check_operation("dsp", "read").is_ok());
        assert!(config.check_operation("dsp", "run").is_ok());
        let err = config.check_operation("dsp", "run").unwrap_err();
        assert!(err.to_string().contains("after 2 calls"));

        config.reset();
        assert!(config.check_operation("dsp", "run").is_ok());
    }

    #[test]
    fn test_hardware_fault_latches() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 17 });
        assert!(config.check_operation("stage", "move").is_err());
        let err = config.check_operation("stage", "position").unwrap_err();
        assert!(err.to_string().contains("hardware fault 17"));
    }
}
