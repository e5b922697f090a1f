//! `rmbridge-finder` – device discovery on the local network.
//!
//! A device must be found and acknowledged before the bridge library can
//! open a session to it.
//!
//! # Modules
//!
//! - [`wire`] – probe / reply / ack datagram codec.
//! - [`finder`] – [`Finder`], which runs the probe/reply/ack handshake over
//!   UDP, and the [`Beacon`] it yields.

pub mod finder;
pub mod wire;

pub use finder::{Beacon, Finder, FinderConfig};
pub use wire::ANY_APP_ID;
