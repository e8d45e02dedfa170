//! Event bus: typed topic subscription with wildcard fan-out.
//!
//! `Any` handlers run before kind-specific handlers for every event. With
//! the default `Spawn` policy each handler runs on its own task, so a slow
//! handler cannot stall dispatch and handlers may freely call back into
//! the connection. No cross-handler ordering is promised.

use crate::types::{Event, EventKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type Handler = Arc<dyn Fn(Event) + Send + Sync>;

/// How `emit` invokes handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Spawn a task per handler invocation. Requires a tokio runtime.
    #[default]
    Spawn,
    /// Invoke handlers inline on the emitting task, in registration order.
    Inline,
}

#[derive(Default)]
pub struct Bus {
    handlers: Mutex<HashMap<EventKind, Vec<Handler>>>,
    policy: DispatchPolicy,
}

impl Bus {
    pub fn new(policy: DispatchPolicy) -> Self {
        Bus {
            handlers: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Register `handler` for `kind`. `EventKind::Any` receives everything.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("bus lock poisoned")
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Fan `event` out to every `Any` handler, then every handler of its
    /// kind. The handler list is copied out before dispatch so handlers can
    /// re-enter the bus without deadlocking.
    pub fn emit(&self, event: Event) {
        let targets: Vec<Handler> = {
            let handlers = self.handlers.lock().expect("bus lock poisoned");
            let mut out = Vec::new();
            if let Some(any) = handlers.get(&EventKind::Any) {
                out.extend(any.iter().cloned());
            }
            if event.kind != EventKind::Any {
                if let Some(specific) = handlers.get(&event.kind) {
                    out.extend(specific.iter().cloned());
                }
            }
            out
        };

        for handler in targets {
            match self.policy {
                DispatchPolicy::Spawn => {
                    let event = event.clone();
                    tokio::spawn(async move { handler(event) });
                }
                DispatchPolicy::Inline => handler(event.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wildcard_and_specific() {
        let bus = Bus::new(DispatchPolicy::Inline);
        let any = Arc::new(AtomicUsize::new(0));
        let joins = Arc::new(AtomicUsize::new(0));

        let c = any.clone();
        bus.on(EventKind::Any, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = joins.clone();
        bus.on(EventKind::UserJoined, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event {
            kind: EventKind::UserJoined,
            ..Default::default()
        });
        bus.emit(Event {
            kind: EventKind::UserLeft,
            ..Default::default()
        });

        assert_eq!(any.load(Ordering::SeqCst), 2);
        assert_eq!(joins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_handler_does_not_deadlock() {
        let bus = Arc::new(Bus::new(DispatchPolicy::Inline));
        let seen = Arc::new(AtomicUsize::new(0));

        let inner_bus = bus.clone();
        let c = seen.clone();
        bus.on(EventKind::Connected, move |_| {
            // handlers may call back into the bus mid-dispatch
            inner_bus.on(EventKind::Disconnected, |_| {});
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event {
            kind: EventKind::Connected,
            ..Default::default()
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_policy_delivers() {
        let bus = Bus::new(DispatchPolicy::Spawn);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.on(EventKind::GroupMessage, move |e| {
            let _ = tx.send(e.body);
        });
        bus.emit(Event {
            kind: EventKind::GroupMessage,
            body: "hi".into(),
            ..Default::default()
        });
        assert_eq!(rx.recv().await.as_deref(), Some("hi"));
    }
}
