//! Interface shape check for boot mice
//!
//! A mismatch is a routing decision, not an error: enumeration simply moves on
//! to the next candidate driver.

use super::{EndpointDescriptor, InterfaceDescriptor, CLASS_HID, PROTOCOL_MOUSE, SUBCLASS_BOOT};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mismatch {
    ClassTriple { class: u8, subclass: u8, protocol: u8 },
    EndpointCount(usize),
    NotInterruptIn { address: u8, attributes: u8 },
}

/// Returns the endpoint to poll if `interface` is a HID boot mouse with exactly
/// one interrupt IN endpoint, `None` otherwise.
pub fn match_boot_mouse(interface: &InterfaceDescriptor) -> Option<EndpointDescriptor> {
    match check(interface) {
        Ok(endpoint) => Some(endpoint),
        Err(reason) => {
            debug!(
                "Interface {} is not a boot mouse: {:?}",
                interface.number, reason
            );
            None
        }
    }
}

fn check(interface: &InterfaceDescriptor) -> Result<EndpointDescriptor, Mismatch> {
    if (interface.class, interface.subclass, interface.protocol)
        != (CLASS_HID, SUBCLASS_BOOT, PROTOCOL_MOUSE)
    {
        return Err(Mismatch::ClassTriple {
            class: interface.class,
            subclass: interface.subclass,
            protocol: interface.protocol,
        });
    }

    let [endpoint] = interface.endpoints.as_slice() else {
        return Err(Mismatch::EndpointCount(interface.endpoints.len()));
    };

    if !endpoint.is_interrupt_in() {
        return Err(Mismatch::NotInterruptIn {
            address: endpoint.address,
            attributes: endpoint.attributes,
        });
    }

    Ok(*endpoint)
}
