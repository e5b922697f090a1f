//! The [`NativeBridge`] trait – the seam to the vendor bridge library.
//!
//! Implementations are expected to be thin: every method maps onto one
//! exported primitive of the library. Two implementations ship with this
//! crate:
//!
//! | Type | Backing |
//! |---|---|
//! | [`LibraryBridge`](crate::dlopen::LibraryBridge) | the vendor shared library, loaded at runtime |
//! | [`SimulatedBridge`](crate::sim::SimulatedBridge) | an in-process device model for tests |

use std::sync::Arc;

use rmbridge_types::{BridgeError, EventType};

use crate::registry::CallbackRegistry;

/// Parameters passed to [`NativeBridge::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub name: String,
    pub debug: bool,
    pub log_path: String,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            name: "Robomaster".to_string(),
            debug: false,
            log_path: String::new(),
        }
    }
}

/// Primitives exported by the native bridge library.
///
/// Calls are synchronous and must follow the lifecycle
/// create → initialize → (operate) → uninitialize → destroy. The
/// [`Wrapper`](crate::wrapper::Wrapper) enforces that order; implementations
/// may assume it.
pub trait NativeBridge: Send + Sync {
    /// Route every callback the library delivers into `registry`.
    ///
    /// Called once, before [`NativeBridge::create`].
    fn bind(&self, registry: Arc<CallbackRegistry>);

    fn create(&self, options: &CreateOptions) -> Result<(), BridgeError>;

    fn destroy(&self);

    /// # Errors
    ///
    /// Returns [`BridgeError::Native`] when the library reports failure.
    fn initialize(&self) -> Result<(), BridgeError>;

    fn uninitialize(&self);

    /// Send an event with a raw byte payload.
    fn send_event(&self, event_code: u64, data: &[u8], tag: u64);

    fn send_event_with_string(&self, event_code: u64, data: &str, tag: u64);

    fn send_event_with_number(&self, event_code: u64, data: u64, tag: u64);

    /// Enable or disable native callback delivery for `event_type`.
    fn set_event_callback(&self, event_type: EventType, enabled: bool);

    /// Look up the security key stored at `index` in the library key chain.
    fn security_key(&self, index: u32) -> Option<String>;
}
