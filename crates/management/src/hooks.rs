//! Connect and disconnect observers.

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use tracing::error;

/// A session lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected { reason: String },
}

impl LifecycleEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            LifecycleEvent::Connected => HookKind::Connect,
            LifecycleEvent::Disconnected { .. } => HookKind::Disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Connect,
    Disconnect,
}

/// Returned by an observer after each firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Keep,
    Remove,
}

type Observer = Box<dyn FnMut(&LifecycleEvent) -> HookAction + Send>;

/// Observers per transition, run in registration order.
#[derive(Default)]
pub struct LifecycleHooks {
    connect: Mutex<Vec<Observer>>,
    disconnect: Mutex<Vec<Observer>>,
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("connect", &self.connect.lock().len())
            .field("disconnect", &self.disconnect.lock().len())
            .finish()
    }
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `callback` on the next connect only.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callback = Some(callback);
        self.subscribe(HookKind::Connect, move |_| {
            if let Some(callback) = callback.take() {
                callback();
            }
            HookAction::Remove
        });
    }

    /// Runs `callback` with the reason on the next disconnect only.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let mut callback = Some(callback);
        self.subscribe(HookKind::Disconnect, move |event| {
            if let (Some(callback), LifecycleEvent::Disconnected { reason }) = (callback.take(), event) {
                callback(reason);
            }
            HookAction::Remove
        });
    }

    /// Registers an observer that stays until it returns [`HookAction::Remove`].
    pub fn subscribe<F>(&self, kind: HookKind, observer: F)
    where
        F: FnMut(&LifecycleEvent) -> HookAction + Send + 'static,
    {
        self.list(kind).lock().push(Box::new(observer));
    }

    pub fn len(&self, kind: HookKind) -> usize {
        self.list(kind).lock().len()
    }

    /// Runs every observer for the event. A panicking observer is logged and
    /// removed; the others still run. Observers registered while firing wait
    /// for the next event.
    pub fn fire(&self, event: &LifecycleEvent) {
        let list = self.list(event.kind());
        let observers = std::mem::take(&mut *list.lock());

        let mut kept = Vec::with_capacity(observers.len());
        for mut observer in observers {
            match catch_unwind(AssertUnwindSafe(|| observer(event))) {
                Ok(HookAction::Keep) => kept.push(observer),
                Ok(HookAction::Remove) => {}
                Err(_) => error!(?event, "lifecycle observer panicked; removing it"),
            }
        }

        let mut guard = list.lock();
        let registered_meanwhile = std::mem::take(&mut *guard);
        kept.extend(registered_meanwhile);
        *guard = kept;
    }

    fn list(&self, kind: HookKind) -> &Mutex<Vec<Observer>> {
        match kind {
            HookKind::Connect => &self.connect,
            HookKind::Disconnect => &self.disconnect,
        }
    }
}
