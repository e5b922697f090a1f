//! `rmbridge-runtime` – the client-facing layer of the bridge stack.
//!
//! # Modules
//!
//! - [`connection`] – [`Connection`]: discovery, handshake and the
//!   close / set-IP / set-port / open sequence, with a [`StatusCell`] that
//!   blocks callers until the device reports the link state.
//! - [`camera`] – [`Camera`]: reference-counted video stream, capture
//!   settings, photo and video recording.
//! - [`client`] – [`Client`]: starts bridge, connection and camera in order
//!   and stops them in reverse.
//! - [`config`] – [`ClientConfig`], the serialisable settings every part is
//!   built from.
//! - [`telemetry`] – [`init_tracing`]: global `tracing` subscriber with an
//!   optional OTLP span exporter (`OTEL_EXPORTER_OTLP_ENDPOINT`).

pub mod camera;
pub mod client;
pub mod config;
pub mod connection;
pub mod telemetry;

pub use camera::{Camera, CameraMode};
pub use client::Client;
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionConfig, ConnectionState, StatusCell};
pub use telemetry::{TracerProviderGuard, init_tracing};
