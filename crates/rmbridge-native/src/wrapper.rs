//! [`Wrapper`] – lifecycle guard around a [`NativeBridge`].
//!
//! The native library crashes when its primitives are called out of order,
//! so every call goes through the wrapper, which tracks where in the
//! create → initialize → uninitialize → destroy sequence the library is.
//!
//! ```text
//!  Idle ──start()──▶ Running ──stop()──▶ Idle
//! ```
//!
//! The wrapper also owns the [`CallbackRegistry`] bound to the library, and
//! pairs every registry change with the matching native
//! `set_event_callback` call.

use std::sync::{Arc, Mutex, PoisonError};

use rmbridge_types::{BridgeError, EventType};
use tracing::{debug, trace, warn};

use crate::native::{CreateOptions, NativeBridge};
use crate::registry::{CallbackRegistry, EventCallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
}

pub struct Wrapper {
    native: Arc<dyn NativeBridge>,
    registry: Arc<CallbackRegistry>,
    state: Mutex<Lifecycle>,
}

impl Wrapper {
    /// Wrap `native` and bind a fresh [`CallbackRegistry`] to it.
    pub fn new(native: Arc<dyn NativeBridge>) -> Self {
        let registry = Arc::new(CallbackRegistry::new());
        native.bind(Arc::clone(&registry));
        Self {
            native,
            registry,
            state: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == Lifecycle::Running
    }

    /// Create and initialise the library.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AlreadyStarted`] if the library is already running, or
    /// the native error from create/initialize. A failed initialise destroys
    /// the instance again so the wrapper stays `Idle`.
    pub fn start(&self, options: &CreateOptions) -> Result<(), BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == Lifecycle::Running {
            return Err(BridgeError::AlreadyStarted);
        }

        debug!(name = %options.name, debug = options.debug, "creating native bridge");
        self.native.create(options)?;
        if let Err(e) = self.native.initialize() {
            warn!(error = %e, "native bridge initialisation failed");
            self.native.destroy();
            return Err(e);
        }

        *state = Lifecycle::Running;
        debug!("native bridge running");
        Ok(())
    }

    /// Uninitialise and destroy the library.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotStarted`] if [`Wrapper::start`] has not succeeded.
    pub fn stop(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != Lifecycle::Running {
            return Err(BridgeError::NotStarted);
        }

        self.native.uninitialize();
        self.native.destroy();
        *state = Lifecycle::Idle;
        debug!("native bridge stopped");
        Ok(())
    }

    pub fn send_event(&self, event_code: u64, data: &[u8], tag: u64) -> Result<(), BridgeError> {
        self.ensure_running()?;
        trace!(event_code, tag, len = data.len(), "send_event");
        self.native.send_event(event_code, data, tag);
        Ok(())
    }

    pub fn send_event_with_string(
        &self,
        event_code: u64,
        data: &str,
        tag: u64,
    ) -> Result<(), BridgeError> {
        self.ensure_running()?;
        trace!(event_code, tag, data, "send_event_with_string");
        self.native.send_event_with_string(event_code, data, tag);
        Ok(())
    }

    pub fn send_event_with_number(
        &self,
        event_code: u64,
        data: u64,
        tag: u64,
    ) -> Result<(), BridgeError> {
        self.ensure_running()?;
        trace!(event_code, tag, data, "send_event_with_number");
        self.native.send_event_with_number(event_code, data, tag);
        Ok(())
    }

    /// Install (`Some`) or clear (`None`) the callback for `event_type`,
    /// enabling or disabling native delivery to match.
    pub fn set_event_callback(&self, event_type: EventType, callback: Option<EventCallback>) {
        let enabled = callback.is_some();
        self.registry.set(event_type, callback);
        self.native.set_event_callback(event_type, enabled);
        debug!(%event_type, enabled, "event callback updated");
    }

    pub fn security_key(&self, index: u32) -> Result<Option<String>, BridgeError> {
        self.ensure_running()?;
        Ok(self.native.security_key(index))
    }

    fn ensure_running(&self) -> Result<(), BridgeError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BridgeError::NotStarted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every primitive call in order.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_initialize: bool,
        bound: Mutex<Option<Arc<CallbackRegistry>>>,
    }

    impl Recorder {
        fn push(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl NativeBridge for Recorder {
        fn bind(&self, registry: Arc<CallbackRegistry>) {
            *self.bound.lock().unwrap() = Some(registry);
        }
        fn create(&self, options: &CreateOptions) -> Result<(), BridgeError> {
            self.push(format!("create:{}", options.name));
            Ok(())
        }
        fn destroy(&self) {
            self.push("destroy");
        }
        fn initialize(&self) -> Result<(), BridgeError> {
            self.push("initialize");
            if self.fail_initialize {
                Err(BridgeError::Native("init failed".into()))
            } else {
                Ok(())
            }
        }
        fn uninitialize(&self) {
            self.push("uninitialize");
        }
        fn send_event(&self, event_code: u64, _data: &[u8], tag: u64) {
            self.push(format!("send:{event_code}:{tag}"));
        }
        fn send_event_with_string(&self, event_code: u64, data: &str, _tag: u64) {
            self.push(format!("send_str:{event_code}:{data}"));
        }
        fn send_event_with_number(&self, event_code: u64, data: u64, _tag: u64) {
            self.push(format!("send_num:{event_code}:{data}"));
        }
        fn set_event_callback(&self, event_type: EventType, enabled: bool) {
            self.push(format!("callback:{event_type}:{enabled}"));
        }
        fn security_key(&self, index: u32) -> Option<String> {
            Some(format!("key-{index}"))
        }
    }

    #[test]
    fn lifecycle_runs_in_order() -> Result<(), BridgeError> {
        let native = Arc::new(Recorder::default());
        let wrapper = Wrapper::new(native.clone());

        wrapper.start(&CreateOptions::default())?;
        wrapper.send_event_with_number(7, 42, 1)?;
        wrapper.stop()?;

        assert_eq!(
            native.calls(),
            vec![
                "create:Robomaster",
                "initialize",
                "send_num:7:42",
                "uninitialize",
                "destroy"
            ]
        );
        Ok(())
    }

    #[test]
    fn misuse_is_rejected() -> Result<(), BridgeError> {
        let wrapper = Wrapper::new(Arc::new(Recorder::default()));

        assert!(matches!(wrapper.stop(), Err(BridgeError::NotStarted)));
        assert!(matches!(
            wrapper.send_event(1, &[], 0),
            Err(BridgeError::NotStarted)
        ));

        wrapper.start(&CreateOptions::default())?;
        assert!(matches!(
            wrapper.start(&CreateOptions::default()),
            Err(BridgeError::AlreadyStarted)
        ));
        assert_eq!(wrapper.security_key(3)?, Some("key-3".to_string()));
        Ok(())
    }

    #[test]
    fn failed_initialize_destroys_instance() {
        let native = Arc::new(Recorder {
            fail_initialize: true,
            ..Recorder::default()
        });
        let wrapper = Wrapper::new(native.clone());

        assert!(matches!(
            wrapper.start(&CreateOptions::default()),
            Err(BridgeError::Native(_))
        ));
        assert!(!wrapper.is_running());
        assert_eq!(native.calls(), vec!["create:Robomaster", "initialize", "destroy"]);
    }

    #[test]
    fn callback_changes_reach_registry_and_native() {
        let native = Arc::new(Recorder::default());
        let wrapper = Wrapper::new(native.clone());

        let bound = native.bound.lock().unwrap().clone().expect("registry bound");
        assert!(Arc::ptr_eq(&bound, wrapper.registry()));

        wrapper.set_event_callback(EventType::GetValue, Some(Arc::new(|_, _, _| {})));
        assert!(wrapper.registry().is_set(EventType::GetValue));
        wrapper.set_event_callback(EventType::GetValue, None);
        assert!(!wrapper.registry().is_set(EventType::GetValue));

        assert_eq!(
            native.calls(),
            vec!["callback:GetValue:true", "callback:GetValue:false"]
        );
    }
}
