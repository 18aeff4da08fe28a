//! Boot mouse report decoding
//!
//! Turns the fixed 8-byte interrupt report into button states and signed
//! relative motion. Decoding is total: every byte pattern yields a report and
//! nothing is scaled, filtered or smoothed.
//!
//! # Layout
//!
//! ```text
//! byte:  0        1          2     3     4     5       6     7
//!       [rsvd] [buttons]  [ X ] [ - ] [ Y ] [ - ] [wheel] [ - ]
//! ```
//!
//! Field data from the supported mice carries a leading report id byte, which
//! is why the default layout starts at offset 1. [`ReportLayout::BOOT`] is the
//! plain boot-protocol placement for devices that omit it.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Size of one interrupt report in bytes.
pub const REPORT_LEN: usize = 8;

/// One raw interrupt report as delivered by the transport.
pub type RawReport = [u8; REPORT_LEN];

bitflags! {
    /// Pressed mouse buttons, one bit per button in report order
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MouseButtons: u8 {
        const LEFT   = 0b0000_0001;
        const RIGHT  = 0b0000_0010;
        const MIDDLE = 0b0000_0100;
        const SIDE   = 0b0000_1000;
    }
}

// Mouse button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Side,
}

impl MouseButton {
    /// All buttons in the order they are reported to the input layer.
    pub const ALL: [MouseButton; 4] = [
        MouseButton::Left,
        MouseButton::Right,
        MouseButton::Middle,
        MouseButton::Side,
    ];

    pub fn flag(self) -> MouseButtons {
        match self {
            MouseButton::Left => MouseButtons::LEFT,
            MouseButton::Right => MouseButtons::RIGHT,
            MouseButton::Middle => MouseButtons::MIDDLE,
            MouseButton::Side => MouseButtons::SIDE,
        }
    }
}

// Relative motion axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotionAxis {
    X,
    Y,
    Wheel,
}

impl MotionAxis {
    pub const ALL: [MotionAxis; 3] = [MotionAxis::X, MotionAxis::Y, MotionAxis::Wheel];
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("{field} offset {offset} lies outside the 8-byte report")]
    OffsetOutOfRange { field: &'static str, offset: usize },
}

/// Byte offsets of the decoded fields inside a [`RawReport`]
///
/// The offsets are configuration rather than constants because the two driver
/// revisions seen in the field disagree on them. Out-of-range offsets are
/// rejected by [`ReportLayout::new`] and [`ReportLayout::validate`]; decoding
/// with an unvalidated layout still never panics and reads missing bytes as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLayout {
    pub buttons: usize,
    pub x: usize,
    pub y: usize,
    pub wheel: usize,
}

impl ReportLayout {
    /// Report id at byte 0, fields spaced by one padding byte.
    pub const PREFIXED: ReportLayout = ReportLayout {
        buttons: 1,
        x: 2,
        y: 4,
        wheel: 6,
    };

    /// Plain boot-protocol placement: buttons first, then X, Y and wheel.
    pub const BOOT: ReportLayout = ReportLayout {
        buttons: 0,
        x: 1,
        y: 2,
        wheel: 3,
    };

    pub fn new(buttons: usize, x: usize, y: usize, wheel: usize) -> Result<Self, ReportError> {
        let layout = Self {
            buttons,
            x,
            y,
            wheel,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        let fields = [
            ("buttons", self.buttons),
            ("x", self.x),
            ("y", self.y),
            ("wheel", self.wheel),
        ];
        for (field, offset) in fields {
            if offset >= REPORT_LEN {
                return Err(ReportError::OffsetOutOfRange { field, offset });
            }
        }
        Ok(())
    }
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self::PREFIXED
    }
}

/// One decoded report. Produced and consumed within a single completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodedReport {
    pub buttons: MouseButtons,
    pub x: i8,
    pub y: i8,
    pub wheel: i8,
}

/// Single input-layer event derived from a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportEvent {
    Button { button: MouseButton, pressed: bool },
    Motion { axis: MotionAxis, delta: i32 },
}

impl DecodedReport {
    pub fn is_pressed(&self, button: MouseButton) -> bool {
        self.buttons.contains(button.flag())
    }

    pub fn delta(&self, axis: MotionAxis) -> i8 {
        match axis {
            MotionAxis::X => self.x,
            MotionAxis::Y => self.y,
            MotionAxis::Wheel => self.wheel,
        }
    }

    pub fn has_movement(&self) -> bool {
        self.x != 0 || self.y != 0 || self.wheel != 0
    }

    /// Events in forwarding order: every button state, then X, Y and wheel.
    ///
    /// Unchanged and zero values are included; suppressing repeats is the
    /// input layer's business.
    pub fn events(&self) -> impl Iterator<Item = ReportEvent> + '_ {
        let buttons = MouseButton::ALL
            .into_iter()
            .map(|button| ReportEvent::Button {
                button,
                pressed: self.is_pressed(button),
            });
        let motion = MotionAxis::ALL.into_iter().map(|axis| ReportEvent::Motion {
            axis,
            delta: i32::from(self.delta(axis)),
        });
        buttons.chain(motion)
    }
}

/// Decodes a report with the default layout.
pub fn decode(report: &RawReport) -> DecodedReport {
    decode_with(&ReportLayout::default(), report)
}

pub fn decode_with(layout: &ReportLayout, report: &RawReport) -> DecodedReport {
    let byte = |offset: usize| report.get(offset).copied().unwrap_or(0);

    DecodedReport {
        buttons: MouseButtons::from_bits_truncate(byte(layout.buttons)),
        x: byte(layout.x) as i8,
        y: byte(layout.y) as i8,
        wheel: byte(layout.wheel) as i8,
    }
}
