//! Named publish/subscribe events.
//!
//! Devices, the scheduler and the data saver talk through an [`EventBus`].
//! Events are identified by name; per-device channels are built by formatting
//! the device name into a template (see [`executor_done`] and [`new_image`]).
//!
//! Two kinds of subscription exist:
//!
//! - persistent callbacks registered with [`EventBus::subscribe`], invoked
//!   synchronously on the publishing task
//! - one-shot waiters from [`EventBus::once`], completed by the next publication
//!
//! Publishing [`USER_ABORT`] releases every pending one-shot waiter after the
//! persistent callbacks have run, so nothing stays blocked on an event that
//! an aborted device will never send.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::data::Image;

pub const PREPARE_FOR_EXPERIMENT: &str = "prepare for experiment";
pub const CLEANUP_AFTER_EXPERIMENT: &str = "cleanup after experiment";
pub const EXPERIMENT_EXECUTION: &str = "experiment execution";
pub const EXPERIMENT_COMPLETE: &str = "experiment complete";
pub const UPDATE_STATUS_LIGHT: &str = "update status light";
pub const USER_ABORT: &str = "user abort";

/// Completion channel of one executor.
pub fn executor_done(executor: &str) -> String {
    format!("executor done {executor}")
}

/// Image channel of one camera.
pub fn new_image(camera: &str) -> String {
    format!("new image {camera}")
}

#[derive(Debug, Clone, Default)]
pub enum EventPayload {
    #[default]
    None,
    /// Status indicator update.
    Status { light: String, text: String },
    /// Image from a camera; `timestamp` is seconds on the camera's clock.
    Image {
        camera: String,
        image: Arc<Image>,
        timestamp: f64,
    },
}

/// How a one-shot wait ended.
#[derive(Debug, Clone)]
pub enum Released {
    Published(EventPayload),
    /// The waiter was dropped by a user abort.
    Aborted,
}

type Callback = Arc<dyn Fn(&EventPayload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
    one_shots: Mutex<HashMap<String, Vec<oneshot::Sender<EventPayload>>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        before != list.len()
    }

    /// Wait for the next publication of `event`.
    pub fn once(&self, event: &str) -> oneshot::Receiver<EventPayload> {
        let (tx, rx) = oneshot::channel();
        self.one_shots
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn publish(&self, event: &str, payload: EventPayload) {
        debug!(event, "publish");
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .get(event)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&payload);
        }

        let waiters = self.one_shots.lock().remove(event).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(payload.clone());
        }

        if event == USER_ABORT {
            let released = std::mem::take(&mut *self.one_shots.lock());
            debug!(count = released.len(), "abort released one-shot waiters");
        }
    }

    /// Register for `event`, run `action`, then wait for the event.
    ///
    /// The waiter exists before `action` starts, so a publication made while
    /// `action` is still running is not missed.
    pub async fn execute_and_wait_for<T, F>(
        &self,
        event: &str,
        action: F,
    ) -> anyhow::Result<(T, Released)>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let waiter = self.once(event);
        let output = match action.await {
            Ok(output) => output,
            Err(err) => {
                drop(waiter);
                self.prune_closed(event);
                return Err(err);
            }
        };
        let released = match waiter.await {
            Ok(payload) => Released::Published(payload),
            Err(_) => Released::Aborted,
        };
        Ok((output, released))
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.lock().get(event).map_or(0, Vec::len)
    }

    /// One-shot waiters still registered for `event`.
    pub fn pending_waiters(&self, event: &str) -> usize {
        self.one_shots.lock().get(event).map_or(0, Vec::len)
    }

    fn prune_closed(&self, event: &str) {
        let mut one_shots = self.one_shots.lock();
        if let Some(list) = one_shots.get_mut(event) {
            list.retain(|tx| !tx.is_closed());
            if list.is_empty() {
                one_shots.remove(event);
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.subscribers.lock().len())
            .finish()
    }
}
