//! Driver registration against the enumeration layer
//!
//! [`DriverRegistration`] is what the enumeration layer talks to: it filters
//! devices through the driver's match table, keeps one binding per device and
//! detaches everything that is left when the driver is deregistered.

use super::binding::{attach, AttachError, BindingSettings, MouseBinding, Polling};
use crate::config::DriverConfig;
use crate::input::InputSink;
use crate::usb::{DeviceAddress, DeviceId, InterfaceDescriptor, UsbDevice, UsbTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attach/detach entry points the enumeration layer calls
pub trait UsbDriver: Send + Sync {
    type Binding: Send;

    fn name(&self) -> &str;

    fn id_table(&self) -> &[DeviceId];

    /// `Ok(None)` leaves the device to other drivers.
    fn attach(
        &self,
        device: &UsbDevice,
        interface: &InterfaceDescriptor,
    ) -> Result<Option<Self::Binding>, AttachError>;

    fn detach(&self, binding: Self::Binding);

    fn matches(&self, id: DeviceId) -> bool {
        self.id_table().contains(&id)
    }
}

/// Boot mouse driver
pub struct MouseDriver {
    transport: Arc<dyn UsbTransport>,
    sink: Arc<dyn InputSink>,
    settings: BindingSettings,
    id_table: Vec<DeviceId>,
}

impl MouseDriver {
    pub const NAME: &'static str = "usbmouse";

    pub fn new(
        transport: Arc<dyn UsbTransport>,
        sink: Arc<dyn InputSink>,
        config: &DriverConfig,
    ) -> Self {
        Self::with_settings(
            transport,
            sink,
            config.binding_settings(),
            config.match_table.clone(),
        )
    }

    pub fn with_settings(
        transport: Arc<dyn UsbTransport>,
        sink: Arc<dyn InputSink>,
        settings: BindingSettings,
        id_table: Vec<DeviceId>,
    ) -> Self {
        Self {
            transport,
            sink,
            settings,
            id_table,
        }
    }
}

impl UsbDriver for MouseDriver {
    type Binding = MouseBinding<Polling>;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn id_table(&self) -> &[DeviceId] {
        &self.id_table
    }

    fn attach(
        &self,
        device: &UsbDevice,
        interface: &InterfaceDescriptor,
    ) -> Result<Option<Self::Binding>, AttachError> {
        attach(
            device,
            interface,
            Arc::clone(&self.transport),
            Arc::clone(&self.sink),
            self.settings.clone(),
        )
    }

    fn detach(&self, binding: Self::Binding) {
        binding.detach();
    }
}

/// A registered driver and the devices it is bound to
pub struct DriverRegistration<D: UsbDriver> {
    driver: D,
    bound: HashMap<DeviceAddress, D::Binding>,
}

impl<D: UsbDriver> DriverRegistration<D> {
    pub fn register(driver: D) -> Self {
        info!(
            "Registered driver {} for {} device id(s)",
            driver.name(),
            driver.id_table().len()
        );
        Self {
            driver,
            bound: HashMap::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Offers a newly enumerated interface to the driver.
    ///
    /// Returns `Ok(true)` if the driver bound to it.
    pub fn device_added(
        &mut self,
        device: &UsbDevice,
        interface: &InterfaceDescriptor,
    ) -> Result<bool, AttachError> {
        if !self.driver.matches(device.id()) {
            debug!("{} not in the {} match table", device.id(), self.driver.name());
            return Ok(false);
        }
        if self.bound.contains_key(&device.address()) {
            warn!("Device {} is already bound", device.address());
            return Ok(false);
        }

        match self.driver.attach(device, interface)? {
            Some(binding) => {
                self.bound.insert(device.address(), binding);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Detaches the binding for a removed device. Returns `false` if the
    /// device was never bound.
    pub fn device_removed(&mut self, device: DeviceAddress) -> bool {
        match self.bound.remove(&device) {
            Some(binding) => {
                self.driver.detach(binding);
                true
            }
            None => false,
        }
    }

    pub fn binding(&self, device: DeviceAddress) -> Option<&D::Binding> {
        self.bound.get(&device)
    }

    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }

    /// Unloads the driver, detaching every remaining binding.
    pub fn deregister(mut self) {
        self.detach_all();
        info!("Deregistered driver {}", self.driver.name());
    }

    fn detach_all(&mut self) {
        for (device, binding) in self.bound.drain() {
            debug!("Detaching {} on driver unload", device);
            self.driver.detach(binding);
        }
    }
}

impl<D: UsbDriver> Drop for DriverRegistration<D> {
    fn drop(&mut self) {
        self.detach_all();
    }
}
