//! Devices that are triggered through a line owned by an executor.

use std::sync::Arc;

use async_trait::async_trait;
use cockpit_core::{CockpitResult, DeviceHandler, DeviceKind, TimeMs, ToggleRoute};

use crate::digital_analog::DigitalAnalogExecutor;

/// A generic device (spatial light modulator, pattern generator, ...) whose
/// table toggles go to an executor's trigger line.
#[derive(Debug)]
pub struct DelegatedTrigger {
    name: String,
    route: ToggleRoute,
}

impl DelegatedTrigger {
    /// Claim `line` on `executor` as the trigger for `name`.
    ///
    /// `trigger_time` is the pulse width the device needs and `response` the
    /// time from the end of the pulse until the device has settled.
    pub fn delegate_to(
        name: impl Into<String>,
        executor: &DigitalAnalogExecutor,
        line: u32,
        trigger_time: TimeMs,
        response: TimeMs,
    ) -> CockpitResult<Arc<Self>> {
        let name = name.into();
        let target = executor.register_trigger_line(&format!("{name} trigger"), line)?;
        Ok(Arc::new(Self {
            name,
            route: ToggleRoute {
                target,
                pulse: trigger_time,
                response,
            },
        }))
    }

    pub fn response_time(&self) -> TimeMs {
        self.route.response
    }
}

#[async_trait]
impl DeviceHandler for DelegatedTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Generic
    }

    fn toggle_route(&self) -> Option<ToggleRoute> {
        Some(self.route.clone())
    }
}
