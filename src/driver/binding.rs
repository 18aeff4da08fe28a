//! Device binding with statum state machine for the attach/detach lifecycle
//!
//! Each attach step lives in its own state, so the set of resources that must
//! be released on failure is fixed by the type being unwound.
//!
//! # State Machine
//!
//! ```text
//! Probed ──register──► Registered ──start_polling──► Polling ──detach──► (gone)
//!   │                      │
//!   └─ buffer/registration └─ channel/submit failure: unregister input
//!      failure: nothing        (and release the channel) before returning
//!      to release
//! ```

use super::channel::{ChannelError, ChannelState, ChannelStats, ReportHandler, TransferChannel};
use crate::input::{Capabilities, DeviceHandle, InputDeviceInfo, InputError, InputSink};
use crate::report::{self, RawReport, ReportEvent, ReportLayout};
use crate::usb::{
    match_boot_mouse, EndpointDescriptor, InterfaceDescriptor, ReportBuffer, TransportError,
    UsbDevice, UsbTransport,
};
use statum::{machine, state};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_DEVICE_NAME: &str = "USB Mouse";

/// Per-binding settings supplied by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSettings {
    pub device_name: String,
    pub layout: ReportLayout,
}

impl Default for BindingSettings {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            layout: ReportLayout::default(),
        }
    }
}

/// Why an attach attempt failed after the interface matched
///
/// Everything acquired during the attempt has been released when this is
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("Resource exhaustion: {0}")]
    Resource(#[from] TransportError),

    #[error("Input registration failed: {0}")]
    Registration(#[from] InputError),

    #[error("Polling could not start: {0}")]
    Channel(#[from] ChannelError),
}

impl AttachError {
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            AttachError::Resource(_)
                | AttachError::Registration(_)
                | AttachError::Channel(ChannelError::Resource(_))
        )
    }
}

/// Decodes reports and pushes them into the registered input device
struct ReportForwarder {
    sink: Arc<dyn InputSink>,
    input: DeviceHandle,
    layout: ReportLayout,
}

impl ReportHandler for ReportForwarder {
    fn handle_report(&self, raw: &RawReport) {
        let decoded = report::decode_with(&self.layout, raw);
        for event in decoded.events() {
            match event {
                ReportEvent::Button { button, pressed } => {
                    self.sink.report_key(self.input, button.into(), pressed)
                }
                ReportEvent::Motion { axis, delta } => {
                    self.sink.report_relative(self.input, axis.into(), delta)
                }
            }
        }
        self.sink.sync(self.input);
    }
}

/// States for the binding lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum BindingState {
    Probed,     // Interface matched, nothing acquired yet
    Registered, // Buffer allocated, input device registered
    Polling,    // Interrupt transfer submitted
}

/// Live association between one mouse and the driver
#[machine]
pub struct MouseBinding<S: BindingState> {
    device: UsbDevice,
    endpoint: EndpointDescriptor,
    path: String,
    transport: Arc<dyn UsbTransport>,
    sink: Arc<dyn InputSink>,
    settings: BindingSettings,
    buffer: Option<ReportBuffer>,
    input: Option<DeviceHandle>,
    channel: Option<TransferChannel>,
}

impl<S: BindingState> MouseBinding<S> {
    pub fn device(&self) -> &UsbDevice {
        &self.device
    }

    /// Physical path, also used as the input device's `phys`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }
}

impl MouseBinding<Probed> {
    /// Checks the interface shape. `None` means the device is not ours.
    pub fn probe(
        device: &UsbDevice,
        interface: &InterfaceDescriptor,
        transport: Arc<dyn UsbTransport>,
        sink: Arc<dyn InputSink>,
        settings: BindingSettings,
    ) -> Option<Self> {
        let endpoint = match_boot_mouse(interface)?;
        let path = device.make_path();
        info!(
            "Boot mouse {} found at {} (endpoint {:#04x}, interval {})",
            device.id(),
            path,
            endpoint.address,
            endpoint.interval
        );

        Some(Self::new(
            device.clone(),
            endpoint,
            path,
            transport,
            sink,
            settings,
            None, // buffer
            None, // input
            None, // channel
        ))
    }

    /// Allocates the report buffer and registers the input device.
    pub fn register(mut self) -> Result<MouseBinding<Registered>, AttachError> {
        let buffer = self
            .transport
            .alloc_buffer(self.device.address())
            .map_err(|e| {
                error!("Failed to allocate report buffer for {}: {}", self.path, e);
                e
            })?;

        let info = InputDeviceInfo {
            name: self.settings.device_name.clone(),
            phys: self.path.clone(),
            id: self.device.id(),
            capabilities: Capabilities::mouse(),
        };
        // The buffer is dropped with `self` if registration fails
        let input = self.sink.register_device(&info).map_err(|e| {
            error!("Failed to register input device for {}: {}", self.path, e);
            e
        })?;
        debug!("Registered {} as {}", self.path, input);

        self.buffer = Some(buffer);
        self.input = Some(input);
        Ok(self.transition())
    }
}

impl MouseBinding<Registered> {
    /// Creates the transfer channel and submits the first transfer.
    pub fn start_polling(mut self) -> Result<MouseBinding<Polling>, AttachError> {
        let (Some(buffer), Some(input)) = (self.buffer.take(), self.input) else {
            self.unwind();
            return Err(AttachError::Channel(ChannelError::Terminated));
        };

        let handler = Arc::new(ReportForwarder {
            sink: Arc::clone(&self.sink),
            input,
            layout: self.settings.layout,
        });
        let channel = match TransferChannel::create(
            Arc::clone(&self.transport),
            self.device.address(),
            &self.endpoint,
            buffer,
            handler,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                error!("Failed to create transfer channel for {}: {}", self.path, e);
                self.unwind();
                return Err(e.into());
            }
        };

        if let Err(e) = channel.submit() {
            error!("Initial submission failed for {}: {}", self.path, e);
            channel.terminate();
            drop(channel);
            self.unwind();
            return Err(e.into());
        }

        info!("Polling {} on endpoint {:#04x}", self.path, self.endpoint.address);
        self.channel = Some(channel);
        Ok(self.transition())
    }

    fn unwind(&mut self) {
        if let Some(input) = self.input.take() {
            debug!("Unwinding registration of {}", input);
            self.sink.unregister(input);
        }
    }
}

impl MouseBinding<Polling> {
    pub fn input(&self) -> Option<DeviceHandle> {
        self.input
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel
            .as_ref()
            .map_or(ChannelState::Terminated, TransferChannel::state)
    }

    pub fn stats(&self) -> ChannelStats {
        self.channel
            .as_ref()
            .map(TransferChannel::stats)
            .unwrap_or_default()
    }

    /// Tears the binding down. Never fails.
    ///
    /// The channel is terminated before the input device is unregistered, so
    /// no completion can push events into a device that no longer exists.
    pub fn detach(mut self) {
        info!("Detaching {}", self.path);

        if let Some(channel) = &self.channel {
            if channel.state() == ChannelState::Terminated {
                warn!("{} had already stopped polling", self.path);
            }
            channel.terminate();
        }
        if let Some(input) = self.input.take() {
            self.sink.unregister(input);
        }
        drop(self.channel.take());

        debug!("{} released", self.path);
    }
}

/// Runs the whole attach sequence.
///
/// `Ok(None)` means the interface is not a boot mouse and other drivers may
/// claim it.
pub fn attach(
    device: &UsbDevice,
    interface: &InterfaceDescriptor,
    transport: Arc<dyn UsbTransport>,
    sink: Arc<dyn InputSink>,
    settings: BindingSettings,
) -> Result<Option<MouseBinding<Polling>>, AttachError> {
    let Some(probed) = MouseBinding::probe(device, interface, transport, sink, settings) else {
        return Ok(None);
    };
    let polling = probed.register()?.start_polling()?;
    Ok(Some(polling))
}
