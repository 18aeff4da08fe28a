//! Host input layer seam
//!
//! The driver registers one input device per binding and pushes key and
//! relative-axis events into it, framed by `sync`. Codes follow the Linux
//! input numbering so the events can be forwarded to evdev-style consumers
//! unchanged.
//!
//! ```text
//! ReportHandler ──► InputSink::report_key / report_relative ──► sync
//! ```

pub mod event_sink;

use crate::report::{MotionAxis, MouseButton};
use crate::usb::DeviceId;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use event_sink::EventChannelSink;

/// Key/button code in Linux input numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyCode(pub u16);

impl KeyCode {
    pub const BTN_LEFT: KeyCode = KeyCode(0x110);
    pub const BTN_RIGHT: KeyCode = KeyCode(0x111);
    pub const BTN_MIDDLE: KeyCode = KeyCode(0x112);
    pub const BTN_SIDE: KeyCode = KeyCode(0x113);
}

impl From<MouseButton> for KeyCode {
    fn from(button: MouseButton) -> Self {
        match button {
            MouseButton::Left => KeyCode::BTN_LEFT,
            MouseButton::Right => KeyCode::BTN_RIGHT,
            MouseButton::Middle => KeyCode::BTN_MIDDLE,
            MouseButton::Side => KeyCode::BTN_SIDE,
        }
    }
}

/// Relative axis code in Linux input numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelativeAxis(pub u16);

impl RelativeAxis {
    pub const REL_X: RelativeAxis = RelativeAxis(0x00);
    pub const REL_Y: RelativeAxis = RelativeAxis(0x01);
    pub const REL_WHEEL: RelativeAxis = RelativeAxis(0x08);
}

impl From<MotionAxis> for RelativeAxis {
    fn from(axis: MotionAxis) -> Self {
        match axis {
            MotionAxis::X => RelativeAxis::REL_X,
            MotionAxis::Y => RelativeAxis::REL_Y,
            MotionAxis::Wheel => RelativeAxis::REL_WHEEL,
        }
    }
}

/// Event types and codes an input device may emit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub keys: Vec<KeyCode>,
    pub relative: Vec<RelativeAxis>,
}

impl Capabilities {
    /// Four buttons plus X, Y and wheel.
    pub fn mouse() -> Self {
        Self {
            keys: MouseButton::ALL.into_iter().map(KeyCode::from).collect(),
            relative: MotionAxis::ALL.into_iter().map(RelativeAxis::from).collect(),
        }
    }

    pub fn supports_key(&self, code: KeyCode) -> bool {
        self.keys.contains(&code)
    }

    pub fn supports_relative(&self, axis: RelativeAxis) -> bool {
        self.relative.contains(&axis)
    }
}

/// Everything the input layer needs to create a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub name: String,
    /// Physical path, stable for the lifetime of the binding
    pub phys: String,
    pub id: DeviceId,
    pub capabilities: Capabilities,
}

/// Registered input device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("Failed to register input device: {0}")]
    RegistrationFailed(String),

    #[error("Unknown input device: {0}")]
    UnknownDevice(DeviceHandle),
}

/// Capability for publishing input events
///
/// The report methods are fire-and-forget and are called from completion
/// context, so implementations must not block.
pub trait InputSink: Send + Sync {
    fn register_device(&self, info: &InputDeviceInfo) -> Result<DeviceHandle, InputError>;

    fn report_key(&self, handle: DeviceHandle, code: KeyCode, pressed: bool);

    fn report_relative(&self, handle: DeviceHandle, axis: RelativeAxis, delta: i32);

    /// Marks the end of one coherent batch of events.
    fn sync(&self, handle: DeviceHandle);

    fn unregister(&self, handle: DeviceHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEventKind {
    Key { code: KeyCode, pressed: bool },
    Relative { axis: RelativeAxis, delta: i32 },
    Sync,
}

/// Input event as delivered to consumers
#[derive(Debug, Clone, PartialEq)]
pub struct InputEvent {
    pub device: DeviceHandle,
    pub kind: InputEventKind,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.timestamp.format("%H:%M:%S%.3f");
        match self.kind {
            InputEventKind::Key { code, pressed } => write!(
                f,
                "{} {} key {:#05x} {}",
                time,
                self.device,
                code.0,
                if pressed { "down" } else { "up" }
            ),
            InputEventKind::Relative { axis, delta } => {
                write!(f, "{} {} rel {:#04x} {:+}", time, self.device, axis.0, delta)
            }
            InputEventKind::Sync => write!(f, "{} {} sync", time, self.device),
        }
    }
}
