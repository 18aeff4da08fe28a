#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use usbmouse::driver::{BindingSettings, DriverRegistration, MouseDriver};
use usbmouse::input::{
    DeviceHandle, InputDeviceInfo, InputError, InputSink, KeyCode, RelativeAxis,
};
use usbmouse::usb::{
    DeviceAddress, DeviceId, EndpointDescriptor, InterfaceDescriptor, LoopbackTransport,
    UsbDevice, UsbTransport,
};

pub const MOUSE_ID: DeviceId = DeviceId::new(0x1038, 0x1702);
pub const MOUSE_ADDR: DeviceAddress = DeviceAddress { bus: 1, address: 4 };

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Register(String),
    Key(KeyCode, bool),
    Relative(RelativeAxis, i32),
    Sync,
    Unregister,
}

/// Sink that records every call verbatim, without any filtering
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    next_handle: AtomicU64,
    registrations: AtomicU64,
    unregistrations: AtomicU64,
    fail_registration: AtomicBool,
}

impl RecordingSink {
    pub fn fail_next_registration(&self) {
        self.fail_registration.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Everything except registrations.
    pub fn events(&self) -> Vec<SinkCall> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, SinkCall::Register(_)))
            .collect()
    }

    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn unregistrations(&self) -> u64 {
        self.unregistrations.load(Ordering::SeqCst)
    }

    fn push(&self, call: SinkCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl InputSink for RecordingSink {
    fn register_device(&self, info: &InputDeviceInfo) -> Result<DeviceHandle, InputError> {
        if self.fail_registration.swap(false, Ordering::SeqCst) {
            return Err(InputError::RegistrationFailed("injected".to_string()));
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.push(SinkCall::Register(info.phys.clone()));
        Ok(DeviceHandle::new(
            self.next_handle.fetch_add(1, Ordering::SeqCst) + 1,
        ))
    }

    fn report_key(&self, _handle: DeviceHandle, code: KeyCode, pressed: bool) {
        self.push(SinkCall::Key(code, pressed));
    }

    fn report_relative(&self, _handle: DeviceHandle, axis: RelativeAxis, delta: i32) {
        self.push(SinkCall::Relative(axis, delta));
    }

    fn sync(&self, _handle: DeviceHandle) {
        self.push(SinkCall::Sync);
    }

    fn unregister(&self, _handle: DeviceHandle) {
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
        self.push(SinkCall::Unregister);
    }
}

pub fn mouse_device() -> UsbDevice {
    UsbDevice::new(MOUSE_ADDR, "0000:00:14.0", "1", MOUSE_ID)
}

pub fn mouse_interface() -> InterfaceDescriptor {
    InterfaceDescriptor::boot_mouse(0, EndpointDescriptor::interrupt_in(1, 8, 10))
}

pub struct Harness {
    pub transport: Arc<LoopbackTransport>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(LoopbackTransport::new()),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    pub fn transport(&self) -> Arc<dyn UsbTransport> {
        self.transport.clone()
    }

    pub fn sink(&self) -> Arc<dyn InputSink> {
        self.sink.clone()
    }

    pub fn registration(&self, id_table: Vec<DeviceId>) -> DriverRegistration<MouseDriver> {
        DriverRegistration::register(MouseDriver::with_settings(
            self.transport(),
            self.sink(),
            BindingSettings::default(),
            id_table,
        ))
    }
}
