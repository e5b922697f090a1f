//! `rmbridge-types` – shared vocabulary of the bridge stack.
//!
//! # Modules
//!
//! - [`key`] – the fixed [`Key`] catalog with access masks and value shapes.
//! - [`event`] – [`Event`] envelopes and the [`EventType`] table.
//! - [`tag`] – packing of a payload discriminator and a 48-bit sequence
//!   number into the 64-bit tag that correlates requests with replies.
//! - [`value`] – [`Value`], the typed form of a decoded payload.
//! - [`result`] – [`KeyResult`] and its JSON envelope decoder.
//! - [`token`] – listener [`Token`]s.
//! - [`error`] – [`BridgeError`], used by every crate in the workspace.

pub mod error;
pub mod event;
pub mod key;
pub mod result;
pub mod tag;
pub mod token;
pub mod value;

pub use error::{BridgeError, Stage};
pub use event::{Event, EventType};
pub use key::{Access, Key, ValueShape, keys};
pub use result::KeyResult;
pub use tag::{DataType, SequenceGenerator};
pub use token::{Token, TokenGenerator};
pub use value::Value;
