//! Replay device for the loopback transport
//!
//! Plays a recorded list of reports into whatever transfer the driver has
//! queued, one report per polling interval, then unplugs itself. Lets the demo
//! binary exercise the whole attach, poll and detach path without hardware.

use crate::config::ReplayConfig;
use crate::report::RawReport;
use crate::usb::{EndpointDescriptor, InterfaceDescriptor, LoopbackTransport, UsbDevice};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ENDPOINT_NUMBER: u8 = 1;
const MAX_PACKET_SIZE: u16 = 8;

/// Outcome of one replay run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    pub delivered: usize,
    /// Ticks where the driver had no transfer queued
    pub missed: usize,
    pub cancelled: bool,
}

pub struct ReplayDevice {
    transport: Arc<LoopbackTransport>,
    device: UsbDevice,
    interval: Duration,
    endpoint: EndpointDescriptor,
    reports: Vec<RawReport>,
}

impl ReplayDevice {
    pub fn new(transport: Arc<LoopbackTransport>, device: UsbDevice, config: &ReplayConfig) -> Self {
        let interval_ms = config.interval_ms.max(1);
        Self {
            transport,
            device,
            interval: Duration::from_millis(u64::from(interval_ms)),
            endpoint: EndpointDescriptor::interrupt_in(ENDPOINT_NUMBER, MAX_PACKET_SIZE, interval_ms),
            reports: config.reports.clone(),
        }
    }

    pub fn device(&self) -> &UsbDevice {
        &self.device
    }

    /// Interface the device presents during enumeration.
    pub fn interface(&self) -> InterfaceDescriptor {
        InterfaceDescriptor::boot_mouse(0, self.endpoint)
    }

    /// Delivers every report, then unplugs the device.
    ///
    /// Cancellation stops delivery but still unplugs, so the driver always
    /// sees the device go away.
    pub async fn run(self, cancel: CancellationToken) -> ReplaySummary {
        let address = self.device.address();
        let mut summary = ReplaySummary::default();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Replaying {} report(s) on {} every {:?}",
            self.reports.len(),
            address,
            self.interval
        );

        for report in &self.reports {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Replay on {} cancelled", address);
                    summary.cancelled = true;
                    break;
                }
                _ = ticker.tick() => {
                    if self.transport.deliver(address, report) {
                        summary.delivered += 1;
                        debug!("Delivered report {:02x?}", report);
                    } else {
                        summary.missed += 1;
                        warn!("No transfer queued on {}, report dropped", address);
                    }
                }
            }
        }

        self.transport.unplug(address);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{DeviceAddress, DeviceId, InterruptRequest, TransferStatus, UsbTransport};
    use std::sync::Mutex;

    fn device() -> UsbDevice {
        UsbDevice::new(
            DeviceAddress { bus: 1, address: 9 },
            "replay",
            "1",
            DeviceId::new(0x1038, 0x1702),
        )
    }

    #[tokio::test]
    async fn delivers_then_unplugs() {
        let transport = Arc::new(LoopbackTransport::new());
        let dev = device();
        let replay = ReplayDevice::new(
            transport.clone(),
            dev.clone(),
            &ReplayConfig {
                interval_ms: 5,
                reports: vec![[0, 1, 0, 0, 0, 0, 0, 0], [0, 2, 0, 0, 0, 0, 0, 0]],
                device: dev.id(),
            },
        );
        assert_eq!(replay.interface().endpoints[0].interval, 5);

        // A transfer that requeues itself, like the driver's channel would
        let transfer = transport.alloc_transfer(dev.address()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        fn submit(
            transport: Arc<LoopbackTransport>,
            request: InterruptRequest,
            seen: Arc<Mutex<Vec<(TransferStatus, u8)>>>,
        ) {
            let again = transport.clone();
            let _ = transport.submit_interrupt_transfer(
                request,
                Box::new(move |completion| {
                    seen.lock().unwrap().push((completion.status, completion.buffer[1]));
                    if completion.status == TransferStatus::Completed {
                        let next = InterruptRequest {
                            transfer: completion.transfer,
                            device: DeviceAddress { bus: 1, address: 9 },
                            endpoint: 0x81,
                            interval: 5,
                            buffer: completion.buffer,
                        };
                        submit(again, next, seen);
                    }
                }),
            );
        }
        submit(
            transport.clone(),
            InterruptRequest {
                transfer,
                device: dev.address(),
                endpoint: 0x81,
                interval: 5,
                buffer: transport.alloc_buffer(dev.address()).unwrap(),
            },
            seen.clone(),
        );

        let summary = replay.run(CancellationToken::new()).await;

        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.missed, 0);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                (TransferStatus::Completed, 1),
                (TransferStatus::Completed, 2),
                // Shutdown leaves the last report in the buffer
                (TransferStatus::Shutdown, 2),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_replay_still_unplugs() {
        let transport = Arc::new(LoopbackTransport::new());
        let replay = ReplayDevice::new(transport.clone(), device(), &ReplayConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = replay.run(cancel).await;

        assert!(summary.cancelled);
        assert_eq!(summary.delivered, 0);
        let err = transport.alloc_transfer(device().address()).unwrap_err();
        assert_eq!(err, crate::usb::TransportError::NoDevice);
    }
}
