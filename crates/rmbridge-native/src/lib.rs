//! `rmbridge-native` – the boundary to the vendor bridge library.
//!
//! The library delivers every asynchronous result through one callback slot
//! per event type, on a thread it owns. This crate wraps that interface:
//!
//! # Modules
//!
//! - [`native`] – the [`NativeBridge`] trait, one method per exported
//!   primitive.
//! - [`registry`] – [`CallbackRegistry`], which demultiplexes callbacks by
//!   event type.
//! - [`wrapper`] – [`Wrapper`], which enforces the library lifecycle and
//!   keeps the registry and the native callback slots in step.
//! - [`dlopen`] – [`LibraryBridge`], the `libloading` binding to the real
//!   library.
//! - [`sim`] – [`SimulatedBridge`](sim::SimulatedBridge), an in-process
//!   device for tests and demos.

pub mod dlopen;
pub mod native;
pub mod registry;
pub mod sim;
pub mod wrapper;

pub use dlopen::LibraryBridge;
pub use native::{CreateOptions, NativeBridge};
pub use registry::{CallbackRegistry, EventCallback};
pub use wrapper::Wrapper;
