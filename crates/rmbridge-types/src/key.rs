//! Key catalog.
//!
//! Every controllable parameter on the device is a [`Key`]: a sub-type
//! identifier (`product << 24 | index`), an [`Access`] mask, and the
//! [`ValueShape`] its results decode to. The catalog is fixed at compile time;
//! [`Key::from_sub_type`] rejects anything outside it.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use crate::error::BridgeError;

/// Operations a key permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access(u8);

impl Access {
    pub const READ: Access = Access(0b0001);
    pub const WRITE: Access = Access(0b0010);
    pub const ACTION: Access = Access(0b0100);
    pub const SUBSCRIBE: Access = Access(0b1000);

    pub const fn with(self, other: Access) -> Access {
        Access(self.0 | other.0)
    }

    pub const fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Shape of the value carried by a key's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Bool,
    Uint,
    Float,
    String,
    /// Structured JSON object.
    Record,
    /// Action keys that carry no value.
    Void,
}

/// Immutable descriptor of a device parameter. Compared by sub-type.
#[derive(Debug, Clone, Copy)]
pub struct Key {
    name: &'static str,
    sub_type: u32,
    access: Access,
    shape: ValueShape,
}

impl Key {
    const fn new(
        name: &'static str,
        product: u32,
        index: u32,
        access: Access,
        shape: ValueShape,
    ) -> Self {
        Self {
            name,
            sub_type: (product << 24) | index,
            access,
            shape,
        }
    }

    /// Look up a key by its sub-type.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::UnknownKey`] for sub-types outside the catalog.
    pub fn from_sub_type(sub_type: u32) -> Result<Key, BridgeError> {
        BY_SUB_TYPE
            .get(&sub_type)
            .copied()
            .ok_or(BridgeError::UnknownKey(sub_type))
    }

    /// Look up a key by its catalog name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Key> {
        keys::all()
            .iter()
            .copied()
            .find(|k| k.name.eq_ignore_ascii_case(name))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn sub_type(&self) -> u32 {
        self.sub_type
    }

    pub fn product(&self) -> u32 {
        self.sub_type >> 24
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn shape(&self) -> ValueShape {
        self.shape
    }

    pub fn is_readable(&self) -> bool {
        self.access.contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    pub fn is_actionable(&self) -> bool {
        self.access.contains(Access::ACTION)
    }

    pub fn is_subscribable(&self) -> bool {
        self.access.contains(Access::SUBSCRIBE)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.sub_type == other.sub_type
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sub_type.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#010x})", self.name, self.sub_type)
    }
}

static BY_SUB_TYPE: LazyLock<HashMap<u32, Key>> =
    LazyLock::new(|| keys::all().iter().map(|k| (k.sub_type, *k)).collect());

/// Product identifiers (top byte of a key sub-type).
pub mod product {
    pub const COMMON: u32 = 0;
    pub const CAMERA: u32 = 1;
    pub const GIMBAL: u32 = 4;
    pub const AIRLINK: u32 = 7;
    pub const ROBOMASTER: u32 = 8;
}

/// The key catalog.
pub mod keys {
    use super::{product, Access, Key, ValueShape};

    const R: Access = Access::READ;
    const RS: Access = Access::READ.with(Access::SUBSCRIBE);
    const RW: Access = Access::READ.with(Access::WRITE);
    const RWS: Access = RW.with(Access::SUBSCRIBE);
    const W: Access = Access::WRITE;
    const A: Access = Access::ACTION;
    const S: Access = Access::SUBSCRIBE;

    // Common
    pub const PRODUCT_NAME: Key = Key::new("ProductName", product::COMMON, 1, R, ValueShape::String);
    pub const FIRMWARE_VERSION: Key =
        Key::new("FirmwareVersion", product::COMMON, 2, R, ValueShape::String);
    pub const SERIAL_NUMBER: Key =
        Key::new("SerialNumber", product::COMMON, 3, R, ValueShape::String);
    pub const PRODUCT_TYPE: Key = Key::new("ProductType", product::COMMON, 4, R, ValueShape::Uint);
    pub const PRODUCT_CONNECTION: Key =
        Key::new("ProductConnection", product::COMMON, 5, RS, ValueShape::Bool);

    // Camera
    pub const CAMERA_CONNECTION: Key =
        Key::new("CameraConnection", product::CAMERA, 1, RS, ValueShape::Bool);
    pub const CAMERA_VIDEO_FORMAT: Key =
        Key::new("CameraVideoFormat", product::CAMERA, 2, RW, ValueShape::Uint);
    pub const CAMERA_VIDEO_TRANS_RATE: Key =
        Key::new("CameraVideoTransRate", product::CAMERA, 3, RW, ValueShape::Float);
    pub const CAMERA_MODE: Key = Key::new("CameraMode", product::CAMERA, 4, RWS, ValueShape::Uint);
    pub const CAMERA_DIGITAL_ZOOM_FACTOR: Key =
        Key::new("CameraDigitalZoomFactor", product::CAMERA, 5, RW, ValueShape::Uint);
    pub const CAMERA_IS_RECORDING: Key =
        Key::new("CameraIsRecording", product::CAMERA, 6, RS, ValueShape::Bool);
    pub const CAMERA_CURRENT_RECORDING_TIME_IN_SECONDS: Key = Key::new(
        "CameraCurrentRecordingTimeInSeconds",
        product::CAMERA,
        7,
        RS,
        ValueShape::Uint,
    );
    pub const CAMERA_START_RECORD_VIDEO: Key =
        Key::new("CameraStartRecordVideo", product::CAMERA, 8, A, ValueShape::Void);
    pub const CAMERA_STOP_RECORD_VIDEO: Key =
        Key::new("CameraStopRecordVideo", product::CAMERA, 9, A, ValueShape::Void);
    pub const CAMERA_START_SHOOT_PHOTO: Key =
        Key::new("CameraStartShootPhoto", product::CAMERA, 10, A, ValueShape::Void);

    // Gimbal
    pub const GIMBAL_CONNECTION: Key =
        Key::new("GimbalConnection", product::GIMBAL, 1, RS, ValueShape::Bool);
    pub const GIMBAL_RESET_POSITION: Key =
        Key::new("GimbalResetPosition", product::GIMBAL, 2, A, ValueShape::Void);
    pub const GIMBAL_ATTITUDE: Key =
        Key::new("GimbalAttitude", product::GIMBAL, 3, RS, ValueShape::Record);
    pub const GIMBAL_WORK_MODE: Key =
        Key::new("GimbalWorkMode", product::GIMBAL, 4, RW, ValueShape::Uint);

    // AirLink
    pub const AIRLINK_CONNECTION: Key =
        Key::new("AirLinkConnection", product::AIRLINK, 1, RS, ValueShape::Bool);
    pub const AIRLINK_SIGNAL_QUALITY: Key =
        Key::new("AirLinkSignalQuality", product::AIRLINK, 2, RS, ValueShape::Uint);
    pub const AIRLINK_CHANNEL: Key =
        Key::new("AirLinkChannel", product::AIRLINK, 3, RW, ValueShape::Uint);

    // Robomaster system
    pub const ROBOMASTER_SYSTEM_CONNECTION: Key =
        Key::new("RobomasterSystemConnection", product::ROBOMASTER, 1, RS, ValueShape::Bool);
    pub const ROBOMASTER_FUNCTION_ENABLE: Key =
        Key::new("RobomasterFunctionEnable", product::ROBOMASTER, 2, W, ValueShape::Record);
    pub const ROBOMASTER_CHASSIS_SPEED: Key =
        Key::new("RobomasterChassisSpeed", product::ROBOMASTER, 3, W, ValueShape::Record);
    pub const ROBOMASTER_CHASSIS_POSITION: Key =
        Key::new("RobomasterChassisPosition", product::ROBOMASTER, 4, RS, ValueShape::Record);
    pub const ROBOMASTER_WATER_GUN_FIRE: Key =
        Key::new("RobomasterWaterGunFire", product::ROBOMASTER, 5, W, ValueShape::Uint);
    pub const ROBOMASTER_WATER_GUN_FIRE_WITH_TIMES: Key = Key::new(
        "RobomasterWaterGunFireWithTimes",
        product::ROBOMASTER,
        6,
        A,
        ValueShape::Record,
    );
    pub const ROBOMASTER_BATTERY_PERCENT: Key =
        Key::new("RobomasterBatteryPercent", product::ROBOMASTER, 7, RS, ValueShape::Uint);
    pub const ROBOMASTER_ARMOR_HIT: Key =
        Key::new("RobomasterArmorHit", product::ROBOMASTER, 8, S, ValueShape::Record);

    const ALL: [Key; 30] = [
        PRODUCT_NAME,
        FIRMWARE_VERSION,
        SERIAL_NUMBER,
        PRODUCT_TYPE,
        PRODUCT_CONNECTION,
        CAMERA_CONNECTION,
        CAMERA_VIDEO_FORMAT,
        CAMERA_VIDEO_TRANS_RATE,
        CAMERA_MODE,
        CAMERA_DIGITAL_ZOOM_FACTOR,
        CAMERA_IS_RECORDING,
        CAMERA_CURRENT_RECORDING_TIME_IN_SECONDS,
        CAMERA_START_RECORD_VIDEO,
        CAMERA_STOP_RECORD_VIDEO,
        CAMERA_START_SHOOT_PHOTO,
        GIMBAL_CONNECTION,
        GIMBAL_RESET_POSITION,
        GIMBAL_ATTITUDE,
        GIMBAL_WORK_MODE,
        AIRLINK_CONNECTION,
        AIRLINK_SIGNAL_QUALITY,
        AIRLINK_CHANNEL,
        ROBOMASTER_SYSTEM_CONNECTION,
        ROBOMASTER_FUNCTION_ENABLE,
        ROBOMASTER_CHASSIS_SPEED,
        ROBOMASTER_CHASSIS_POSITION,
        ROBOMASTER_WATER_GUN_FIRE,
        ROBOMASTER_WATER_GUN_FIRE_WITH_TIMES,
        ROBOMASTER_BATTERY_PERCENT,
        ROBOMASTER_ARMOR_HIT,
    ];

    /// Every key in the catalog.
    pub fn all() -> &'static [Key] {
        &ALL
    }
}
