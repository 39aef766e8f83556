//! Operational modes for simulated devices.
//!
//! - **Instant**: Zero delays, deterministic behavior for unit tests
//! - **Realistic**: Hardware-like timing for integration runs and the CLI

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic
    #[default]
    Instant,
    /// Programs play out on the wall clock
    Realistic,
}

impl MockMode {
    pub fn is_realistic(self) -> bool {
        self == MockMode::Realistic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert!(!MockMode::default().is_realistic());
    }

    #[derive(Deserialize)]
    struct Holder {
        mode: MockMode,
    }

    #[test]
    fn test_mode_from_toml() {
        let holder: Holder = toml::from_str("mode = \"realistic\"").unwrap();
        assert_eq!(holder.mode, MockMode::Realistic);
    }
}
