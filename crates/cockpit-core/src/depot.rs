//! Registry of device handlers.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tracing::{error, info};

use crate::capabilities::{Camera, DeviceKind, Executor, LightSource, Positioner};
use crate::error::{CockpitError, CockpitResult};
use crate::handler::HandlerRef;

/// Default number of handlers finalised concurrently.
pub const DEFAULT_FINALIZE_WIDTH: usize = 4;

/// All handlers known to the application, keyed by unique name.
#[derive(Debug, Default)]
pub struct DeviceDepot {
    handlers: RwLock<Vec<HandlerRef>>,
}

impl DeviceDepot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: impl Into<HandlerRef>) -> CockpitResult<()> {
        let handler = handler.into();
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(CockpitError::Configuration(format!(
                "duplicate handler name '{}'",
                handler.name()
            )));
        }
        handlers.push(handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<HandlerRef> {
        self.handlers.read().iter().find(|h| h.name() == name).cloned()
    }

    pub fn all(&self) -> Vec<HandlerRef> {
        self.handlers.read().clone()
    }

    pub fn of_kind(&self, kind: DeviceKind) -> Vec<HandlerRef> {
        self.handlers
            .read()
            .iter()
            .filter(|h| h.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn cameras(&self) -> Vec<Arc<dyn Camera>> {
        self.handlers.read().iter().filter_map(|h| h.as_camera().cloned()).collect()
    }

    pub fn lights(&self) -> Vec<Arc<dyn LightSource>> {
        self.handlers.read().iter().filter_map(|h| h.as_light().cloned()).collect()
    }

    pub fn positioners(&self) -> Vec<Arc<dyn Positioner>> {
        self.handlers
            .read()
            .iter()
            .filter_map(|h| h.as_positioner().cloned())
            .collect()
    }

    pub fn executors(&self) -> Vec<Arc<dyn Executor>> {
        self.handlers
            .read()
            .iter()
            .filter_map(|h| h.as_executor().cloned())
            .collect()
    }

    /// Light filters in the path of `light`.
    pub fn filters_for(&self, light: &str) -> Vec<HandlerRef> {
        self.handlers
            .read()
            .iter()
            .filter(|h| h.kind() == DeviceKind::LightFilter && h.filters_light(light))
            .cloned()
            .collect()
    }

    /// Run every handler's second-stage initialisation, at most `width` at a
    /// time. All calls are awaited; the first failure is returned.
    pub async fn finalize_initialization(&self, width: usize) -> CockpitResult<()> {
        let handlers = self.all();
        let results: Vec<(String, anyhow::Result<()>)> = stream::iter(handlers)
            .map(|handler| async move {
                let result = handler.finalize_initialization().await;
                (handler.name().to_string(), result)
            })
            .buffer_unordered(width.max(1))
            .collect()
            .await;

        let mut first_error = None;
        for (name, result) in results {
            if let Err(e) = result {
                error!(device = %name, error = %e, "finalize failed");
                if first_error.is_none() {
                    first_error = Some(CockpitError::hardware(name, e));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("all handlers finalized");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DeviceHandler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Device {
        name: &'static str,
        fail: bool,
        finalized: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeviceHandler for Device {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> DeviceKind {
            DeviceKind::Generic
        }

        async fn finalize_initialization(&self) -> anyhow::Result<()> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }
    }

    fn device(name: &'static str, fail: bool, counter: &Arc<AtomicUsize>) -> HandlerRef {
        let handler: Arc<dyn DeviceHandler> = Arc::new(Device {
            name,
            fail,
            finalized: Arc::clone(counter),
        });
        handler.into()
    }

    #[test]
    fn rejects_duplicate_names() {
        let counter = Arc::new(AtomicUsize::new(0));
        let depot = DeviceDepot::new();
        depot.add(device("a", false, &counter)).unwrap();
        assert!(depot.add(device("a", false, &counter)).is_err());
        assert!(depot.get("a").is_some());
        assert_eq!(depot.of_kind(DeviceKind::Generic).len(), 1);
    }

    #[tokio::test]
    async fn finalize_awaits_everything_and_reports_a_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let depot = DeviceDepot::new();
        depot.add(device("good1", false, &counter)).unwrap();
        depot.add(device("bad", true, &counter)).unwrap();
        depot.add(device("good2", false, &counter)).unwrap();

        let err = depot.finalize_initialization(2).await.unwrap_err();
        assert!(err.to_string().contains("bad"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
