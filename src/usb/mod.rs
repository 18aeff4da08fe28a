//! USB-side types: device references, descriptors and the transport seam
//!
//! - [`validate`] decides whether an interface looks like a boot mouse
//! - [`transport`] is the capability the driver uses to move interrupt transfers
//! - [`loopback`] is an in-process transport where the caller plays the device

pub mod loopback;
pub mod transport;
pub mod validate;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use loopback::{Fault, LoopbackStats, LoopbackTransport};
pub use transport::{
    Completion, CompletionFn, InterruptRequest, ReportBuffer, StatusClass, SubmitError,
    TransferId, TransferStatus, TransportError, UsbTransport,
};
pub use validate::match_boot_mouse;

pub const CLASS_HID: u8 = 0x03;
pub const SUBCLASS_BOOT: u8 = 0x01;
pub const PROTOCOL_MOUSE: u8 = 0x02;

const ENDPOINT_DIR_IN: u8 = 0x80;
const ENDPOINT_NUMBER_MASK: u8 = 0x0F;
const TRANSFER_TYPE_MASK: u8 = 0x03;

/// Vendor/product pair used by the match table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Bus-unique address of an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}/{:03}", self.bus, self.address)
    }
}

/// Reference to an attached USB device, as handed out by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbDevice {
    address: DeviceAddress,
    bus_name: String,
    port_path: String,
    id: DeviceId,
}

impl UsbDevice {
    pub fn new(
        address: DeviceAddress,
        bus_name: impl Into<String>,
        port_path: impl Into<String>,
        id: DeviceId,
    ) -> Self {
        Self {
            address,
            bus_name: bus_name.into(),
            port_path: port_path.into(),
            id,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    /// Physical path in the `usb-<bus>-<port path>` form the host input layer expects.
    pub fn make_path(&self) -> String {
        format!("usb-{}-{}", self.bus_name, self.port_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor fields the driver cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`: bit 7 is the direction, bits 0..=3 the number
    pub address: u8,
    /// `bmAttributes`: bits 0..=1 are the transfer type
    pub attributes: u8,
    pub max_packet_size: u16,
    /// `bInterval`, the polling hint in frames
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn interrupt_in(number: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: ENDPOINT_DIR_IN | (number & ENDPOINT_NUMBER_MASK),
            attributes: 0x03,
            max_packet_size,
            interval,
        }
    }

    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        if self.address & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match self.attributes & TRANSFER_TYPE_MASK {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub fn is_interrupt_in(&self) -> bool {
        self.direction() == Direction::In && self.transfer_type() == TransferType::Interrupt
    }
}

/// Interface descriptor of the active alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    /// HID boot mouse interface exposing a single endpoint.
    pub fn boot_mouse(number: u8, endpoint: EndpointDescriptor) -> Self {
        Self {
            number,
            alternate_setting: 0,
            class: CLASS_HID,
            subclass: SUBCLASS_BOOT,
            protocol: PROTOCOL_MOUSE,
            endpoints: vec![endpoint],
        }
    }
}
