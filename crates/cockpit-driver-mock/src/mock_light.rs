//! Simulated light source switched by an executor line.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cockpit_core::{DeviceHandler, DeviceKind, LightSource};
use serde::{Deserialize, Serialize};

use crate::mock_executor_backend::TriggerListener;

/// Configuration for a simulated light source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockLightConfig {
    pub name: String,

    /// Excitation wavelength in nm
    #[serde(default)]
    pub wavelength: Option<f64>,

    #[serde(default)]
    pub power_mw: Option<f64>,

    /// Executor digital line that gates the light
    #[serde(default)]
    pub trigger_line: Option<u32>,
}

impl MockLightConfig {
    pub fn new(name: impl Into<String>, wavelength: f64) -> Self {
        Self {
            name: name.into(),
            wavelength: Some(wavelength),
            power_mw: None,
            trigger_line: None,
        }
    }
}

#[derive(Debug)]
pub struct MockLight {
    config: MockLightConfig,
    on: AtomicBool,
    pulses: AtomicU64,
}

impl MockLight {
    pub fn new(config: MockLightConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            on: AtomicBool::new(false),
            pulses: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &MockLightConfig {
        &self.config
    }

    pub fn trigger_line(&self) -> Option<u32> {
        self.config.trigger_line
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Number of times the light has been switched on.
    pub fn pulse_count(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }
}

impl TriggerListener for MockLight {
    fn on_edge(&self, high: bool) {
        if !self.on.swap(high, Ordering::SeqCst) && high {
            self.pulses.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl DeviceHandler for MockLight {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::LightSource
    }

    fn savefile_info(&self) -> Option<String> {
        self.config.power_mw.map(|p| format!("{p} mW"))
    }

    async fn cleanup_after_experiment(&self) -> anyhow::Result<()> {
        self.on.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LightSource for MockLight {
    fn wavelength(&self) -> Option<f64> {
        self.config.wavelength
    }

    fn power_mw(&self) -> Option<f64> {
        self.config.power_mw
    }
}
