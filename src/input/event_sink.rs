//! Input sink that forwards events over a tokio channel
//!
//! Behaves like a host input core: events for unknown devices or codes the
//! device never declared are dropped, key events only pass when the key
//! changes state, zero relative deltas are swallowed and a `Sync` is only
//! emitted when the batch it closes carried at least one event.
//!
//! Sending uses `try_send`, so a full queue drops events instead of blocking
//! the completion context.

use super::{
    DeviceHandle, InputDeviceInfo, InputError, InputEvent, InputEventKind, InputSink, KeyCode,
    RelativeAxis,
};
use chrono::Local;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct RegisteredDevice {
    info: InputDeviceInfo,
    pressed: HashSet<KeyCode>,
    // Events emitted since the last sync
    dirty: bool,
}

pub struct EventChannelSink {
    sender: mpsc::Sender<InputEvent>,
    devices: Mutex<HashMap<DeviceHandle, RegisteredDevice>>,
    next_handle: AtomicU64,
    dropped: AtomicU64,
}

impl EventChannelSink {
    /// Creates the sink together with the receiving end of its event queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InputEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        debug!("Created input event channel with capacity {}", capacity);
        let sink = Self {
            sender,
            devices: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        };
        (sink, receiver)
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<DeviceHandle, RegisteredDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of events lost to a full or closed queue.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn device_info(&self, handle: DeviceHandle) -> Option<InputDeviceInfo> {
        self.devices().get(&handle).map(|device| device.info.clone())
    }

    pub fn registered_count(&self) -> usize {
        self.devices().len()
    }

    fn emit(&self, device: DeviceHandle, kind: InputEventKind) {
        let event = InputEvent {
            device,
            kind,
            timestamp: Local::now(),
        };
        if let Err(e) = self.sender.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping input event for {}: {}", device, e);
        }
    }
}

impl InputSink for EventChannelSink {
    fn register_device(&self, info: &InputDeviceInfo) -> Result<DeviceHandle, InputError> {
        if self.sender.is_closed() {
            return Err(InputError::RegistrationFailed(
                "event consumer has gone away".to_string(),
            ));
        }

        let handle = DeviceHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.devices().insert(
            handle,
            RegisteredDevice {
                info: info.clone(),
                pressed: HashSet::new(),
                dirty: false,
            },
        );
        info!(
            "Registered input device {} \"{}\" [{}] at {}",
            handle, info.name, info.id, info.phys
        );
        Ok(handle)
    }

    fn report_key(&self, handle: DeviceHandle, code: KeyCode, pressed: bool) {
        let changed = {
            let mut devices = self.devices();
            let Some(device) = devices.get_mut(&handle) else {
                warn!("Key event for unregistered device {}", handle);
                return;
            };
            if !device.info.capabilities.supports_key(code) {
                debug!("{} does not declare key {:#05x}", handle, code.0);
                return;
            }
            let changed = if pressed {
                device.pressed.insert(code)
            } else {
                device.pressed.remove(&code)
            };
            device.dirty |= changed;
            changed
        };

        if changed {
            self.emit(handle, InputEventKind::Key { code, pressed });
        }
    }

    fn report_relative(&self, handle: DeviceHandle, axis: RelativeAxis, delta: i32) {
        if delta == 0 {
            return;
        }
        {
            let mut devices = self.devices();
            let Some(device) = devices.get_mut(&handle) else {
                warn!("Relative event for unregistered device {}", handle);
                return;
            };
            if !device.info.capabilities.supports_relative(axis) {
                debug!("{} does not declare axis {:#04x}", handle, axis.0);
                return;
            }
            device.dirty = true;
        }
        self.emit(handle, InputEventKind::Relative { axis, delta });
    }

    fn sync(&self, handle: DeviceHandle) {
        let flush = match self.devices().get_mut(&handle) {
            Some(device) => std::mem::take(&mut device.dirty),
            None => false,
        };
        if flush {
            self.emit(handle, InputEventKind::Sync);
        }
    }

    fn unregister(&self, handle: DeviceHandle) {
        match self.devices().remove(&handle) {
            Some(device) => info!("Unregistered input device {} ({})", handle, device.info.phys),
            None => warn!("Unregistering unknown input device {}", handle),
        }
    }
}
