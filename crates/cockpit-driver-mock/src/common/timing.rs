//! Timing configuration for realistic mode.

use std::time::Duration;

use super::mode::MockMode;

/// Hardware-like delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Frame readout time in milliseconds (camera)
    pub frame_readout_ms: u64,
    /// Settling time in milliseconds (stage)
    pub settling_time_ms: u64,
    /// Communication delay in milliseconds (serial, network)
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    pub fn camera() -> Self {
        Self {
            frame_readout_ms: 5,
            settling_time_ms: 0,
            communication_delay_ms: 2,
        }
    }

    pub fn stage() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 50,
            communication_delay_ms: 5,
        }
    }

    pub fn executor() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 1,
            communication_delay_ms: 1,
        }
    }

    /// Sleep for the communication delay when in realistic mode.
    pub async fn communicate(&self, mode: MockMode) {
        if mode.is_realistic() && self.communication_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.communication_delay_ms)).await;
        }
    }

    /// Sleep for the settling time when in realistic mode.
    pub async fn settle(&self, mode: MockMode) {
        if mode.is_realistic() && self.settling_time_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settling_time_ms)).await;
        }
    }
}
