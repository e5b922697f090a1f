//! Events – addresses for native operations.
//!
//! An event code packs the event type into the high 32 bits and a sub-type
//! into the low 32 bits. For key operations the sub-type is the key's
//! sub-type; for everything else it selects a variant of the operation
//! (e.g. which connection step to run).

use std::fmt;

use crate::error::BridgeError;
use crate::key::Key;

/// Every event type understood by the native bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum EventType {
    SetValue = 0,
    GetValue = 1,
    GetAvailableValue = 2,
    PerformAction = 3,
    StartListening = 4,
    StopListening = 5,
    Activation = 6,
    LocalAlbum = 7,
    FirmwareUpgrade = 8,
    Connection = 100,
    Security = 101,
    PrintLog = 200,
    StartVideo = 300,
    StopVideo = 301,
    Render = 302,
    GetNativeTexture = 303,
    VideoTransferSpeed = 304,
    AudioDataRecv = 305,
    VideoDataRecv = 306,
    AudioTransferSpeed = 307,
}

const ALL_TYPES: [EventType; 20] = [
    EventType::SetValue,
    EventType::GetValue,
    EventType::GetAvailableValue,
    EventType::PerformAction,
    EventType::StartListening,
    EventType::StopListening,
    EventType::Activation,
    EventType::LocalAlbum,
    EventType::FirmwareUpgrade,
    EventType::Connection,
    EventType::Security,
    EventType::PrintLog,
    EventType::StartVideo,
    EventType::StopVideo,
    EventType::Render,
    EventType::GetNativeTexture,
    EventType::VideoTransferSpeed,
    EventType::AudioDataRecv,
    EventType::VideoDataRecv,
    EventType::AudioTransferSpeed,
];

impl EventType {
    /// All known event types, in code order.
    pub fn all() -> &'static [EventType] {
        &ALL_TYPES
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Result<Self, BridgeError> {
        ALL_TYPES
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or(BridgeError::UnknownEventType(code))
    }

    /// Event types whose replies carry a key result envelope.
    pub fn is_key_operation(self) -> bool {
        matches!(
            self,
            EventType::SetValue
                | EventType::GetValue
                | EventType::GetAvailableValue
                | EventType::PerformAction
                | EventType::StartListening
                | EventType::StopListening
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connection sub-types used with [`EventType::Connection`].
pub mod connection {
    pub const OPEN: u32 = 0;
    pub const CLOSE: u32 = 1;
    pub const SET_IP: u32 = 2;
    pub const SET_PORT: u32 = 3;
}

/// A short-lived command envelope. Single writer: rewrite the sub-type with
/// [`Event::reset_sub_type`] between sends, never while a send is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    event_type: EventType,
    sub_type: u32,
}

impl Event {
    /// Event of the given type with sub-type 0.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            sub_type: 0,
        }
    }

    /// Event addressing `key` through a key operation type.
    pub fn for_key(event_type: EventType, key: &Key) -> Self {
        Self {
            event_type,
            sub_type: key.sub_type(),
        }
    }

    /// Parse a full 64-bit event code.
    pub fn from_code(code: u64) -> Result<Self, BridgeError> {
        let event_type = EventType::from_code((code >> 32) as u32)?;
        Ok(Self {
            event_type,
            sub_type: code as u32,
        })
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn sub_type(&self) -> u32 {
        self.sub_type
    }

    pub fn reset_sub_type(&mut self, sub_type: u32) {
        self.sub_type = sub_type;
    }

    pub fn code(&self) -> u64 {
        (u64::from(self.event_type.code()) << 32) | u64::from(self.sub_type)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#x}", self.event_type, self.sub_type)
    }
}
