//! `rmbridge-middleware` – request/response and subscriptions over the
//! callback-driven native bridge.
//!
//! # Modules
//!
//! - [`listeners`] – reference-counted, token-addressed [`ListenerTable`]
//!   shared by key and event-type subscriptions.
//! - [`bridge`] – the [`Bridge`] facade: lifecycle, key and event-type
//!   listeners, raw sends, reply correlation by tag.
//! - [`rpc`] – get / set / perform-action in callback, blocking and `async`
//!   flavours.

pub mod bridge;
pub mod listeners;
pub mod rpc;

pub use bridge::{Bridge, BridgeConfig, DEFAULT_REQUEST_TIMEOUT, EventListener, KeyListener};
pub use listeners::ListenerTable;
