//! [`CallbackRegistry`] – demultiplexes native callbacks by event type.
//!
//! The native library exposes a single callback slot per event type. The
//! registry mirrors that: [`CallbackRegistry::set`] overwrites whatever
//! handler was installed for a type, and [`CallbackRegistry::dispatch`]
//! routes an incoming callback to the handler for its event type.
//!
//! The registry is an ordinary value rather than process-global state. The
//! binding for the real library holds the only process-wide reference; tests
//! create as many independent registries as they like.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rmbridge_types::EventType;
use tracing::trace;

/// Handler invoked with `(event_code, payload, tag)`.
///
/// Runs on whatever thread the native side delivers on and must not block
/// indefinitely.
pub type EventCallback = Arc<dyn Fn(u64, &[u8], u64) + Send + Sync>;

/// Table of at most one [`EventCallback`] per event type.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<u32, EventCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback` as the sole handler for `event_type`, or clear the
    /// slot when `callback` is `None`.
    pub fn set(&self, event_type: EventType, callback: Option<EventCallback>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match callback {
            Some(cb) => {
                handlers.insert(event_type.code(), cb);
            }
            None => {
                handlers.remove(&event_type.code());
            }
        }
    }

    /// Route a native callback to the handler for its event type.
    ///
    /// A callback for a type with no handler is dropped silently. The table
    /// lock is released before the handler runs, so handlers may call
    /// [`CallbackRegistry::set`].
    pub fn dispatch(&self, event_code: u64, data: &[u8], tag: u64) {
        let event_type = (event_code >> 32) as u32;
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .cloned();

        match handler {
            Some(h) => h(event_code, data, tag),
            None => trace!(event_code, tag, "no handler registered; callback dropped"),
        }
    }

    pub fn is_set(&self, event_type: EventType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&event_type.code())
    }

    /// Number of event types with an installed handler.
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmbridge_types::Event;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting(counter: &Arc<AtomicUsize>) -> EventCallback {
        let c = Arc::clone(counter);
        Arc::new(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn dispatch_reaches_installed_handler() {
        let registry = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.set(
            EventType::GetValue,
            Some(Arc::new(move |code, data: &[u8], tag| {
                sink.lock().unwrap().push((code, data.to_vec(), tag));
            })),
        );

        let code = Event::new(EventType::GetValue).code() | 7;
        registry.dispatch(code, b"payload", 99);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(code, b"payload".to_vec(), 99)]);
    }

    #[test]
    fn later_set_overwrites() {
        let registry = CallbackRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.set(EventType::StartVideo, Some(counting(&first)));
        registry.set(EventType::StartVideo, Some(counting(&second)));

        registry.dispatch(Event::new(EventType::StartVideo).code(), &[], 0);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clearing_and_missing_handlers_are_noops() {
        let registry = CallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.set(EventType::Connection, Some(counting(&count)));
        registry.set(EventType::Connection, None);

        registry.dispatch(Event::new(EventType::Connection).code(), &[], 0);
        registry.dispatch(Event::new(EventType::Render).code(), &[], 0);
        registry.dispatch(u64::MAX, &[], 0);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn handler_may_reenter_set() {
        let registry = Arc::new(CallbackRegistry::new());
        let inner = Arc::clone(&registry);
        registry.set(
            EventType::StopVideo,
            Some(Arc::new(move |_, _, _| {
                inner.set(EventType::StopVideo, None);
            })),
        );

        registry.dispatch(Event::new(EventType::StopVideo).code(), &[], 0);
        assert!(!registry.is_set(EventType::StopVideo));
    }

    #[test]
    fn concurrent_dispatch_and_set() {
        let registry = Arc::new(CallbackRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        let code = Event::new(EventType::VideoDataRecv).code();

        let dispatcher = {
            let r = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..1_000 {
                    r.dispatch(code, &[1, 2, 3], 0);
                }
            })
        };
        for i in 0..1_000 {
            let cb = if i % 2 == 0 { Some(counting(&count)) } else { None };
            registry.set(EventType::VideoDataRecv, cb);
        }
        dispatcher.join().expect("dispatcher panicked");

        assert!(count.load(Ordering::SeqCst) <= 1_000);
    }
}
