//! Transfer channel: one self-resubmitting interrupt IN transfer
//!
//! # State Machine
//!
//! ```text
//!          submit ok                completion(success | transient)
//!   Idle ────────────► Submitted ◄──────────────┐
//!    │                  │   │  └─────resubmit────┘
//!    │                  │   └── completion(fatal) / resubmit failed ──┐
//!    │                  │                                             ▼
//!    └──── terminate ───┴──────────── terminate ────────────────► Terminated
//! ```
//!
//! `Terminated` is absorbing. The completion handler runs in the transport's
//! context and holds the channel lock for its whole run, so `terminate()`
//! either sees a finished resubmission (and cancels it) or the handler sees
//! `Terminated` and forwards nothing.

use crate::report::RawReport;
use crate::usb::{
    Completion, DeviceAddress, EndpointDescriptor, InterruptRequest, ReportBuffer, StatusClass,
    SubmitError, TransferId, TransportError, UsbTransport,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, trace};

/// Receives every successfully completed report
///
/// Called from completion context: must not block.
pub trait ReportHandler: Send + Sync {
    fn handle_report(&self, report: &RawReport);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Submitted,
    Terminated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Reports decoded and forwarded
    pub reports: u64,
    /// Non-fatal error completions
    pub transient_errors: u64,
    /// Successful resubmissions from the completion handler
    pub resubmissions: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to allocate transfer: {0}")]
    Resource(#[source] TransportError),

    #[error("Transport rejected submission: {0}")]
    Submit(#[source] TransportError),

    #[error("Transfer is already submitted")]
    AlreadySubmitted,

    #[error("Channel has been terminated")]
    Terminated,
}

struct Slot {
    state: ChannelState,
    // Present whenever no transfer is in flight
    buffer: Option<ReportBuffer>,
    stats: ChannelStats,
}

struct ChannelCore {
    transport: Arc<dyn UsbTransport>,
    device: DeviceAddress,
    transfer: TransferId,
    endpoint: u8,
    interval: u8,
    handler: Arc<dyn ReportHandler>,
    slot: Mutex<Slot>,
}

impl ChannelCore {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Caller holds the slot lock
    fn start(self: &Arc<Self>, buffer: ReportBuffer) -> Result<(), SubmitError> {
        let request = InterruptRequest {
            transfer: self.transfer,
            device: self.device,
            endpoint: self.endpoint,
            interval: self.interval,
            buffer,
        };
        let core = Arc::downgrade(self);
        self.transport.submit_interrupt_transfer(
            request,
            Box::new(move |completion| Self::on_complete(&core, completion)),
        )
    }

    fn on_complete(core: &Weak<Self>, completion: Completion) {
        match core.upgrade() {
            Some(core) => core.complete(completion),
            None => debug!(
                "Dropping completion for released {}",
                completion.transfer
            ),
        }
    }

    fn complete(self: &Arc<Self>, completion: Completion) {
        let Completion {
            transfer,
            status,
            buffer,
        } = completion;
        let mut slot = self.lock();

        if slot.state != ChannelState::Submitted {
            debug!("{} finished with {:?} after termination", transfer, status);
            slot.buffer = Some(buffer);
            return;
        }

        match status.class() {
            StatusClass::Fatal => {
                info!(
                    "Polling on endpoint {:#04x} of {} stopped: {:?}",
                    self.endpoint, self.device, status
                );
                slot.state = ChannelState::Terminated;
                slot.buffer = Some(buffer);
                return;
            }
            StatusClass::Transient => {
                slot.stats.transient_errors += 1;
                debug!(
                    "{} on {} failed with {:?} (code {}), resubmitting",
                    transfer,
                    self.device,
                    status,
                    status.code()
                );
            }
            StatusClass::Success => {
                trace!("{} report {:02x?}", self.device, buffer);
                slot.stats.reports += 1;
                self.handler.handle_report(&buffer);
            }
        }

        match self.start(buffer) {
            Ok(()) => slot.stats.resubmissions += 1,
            Err(SubmitError { buffer, source }) => {
                error!(
                    "Failed to resubmit {} on {}: {}",
                    transfer, self.device, source
                );
                slot.state = ChannelState::Terminated;
                slot.buffer = Some(buffer);
            }
        }
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        debug!("Releasing {} of {}", self.transfer, self.device);
        self.transport.free_transfer(self.transfer);
    }
}

/// Owns one interrupt IN transfer and its report buffer
pub struct TransferChannel {
    core: Arc<ChannelCore>,
}

impl TransferChannel {
    /// Allocates the transfer for `endpoint` and parks `buffer` in the channel.
    /// The channel starts `Idle`.
    pub fn create(
        transport: Arc<dyn UsbTransport>,
        device: DeviceAddress,
        endpoint: &EndpointDescriptor,
        buffer: ReportBuffer,
        handler: Arc<dyn ReportHandler>,
    ) -> Result<Self, ChannelError> {
        let transfer = transport
            .alloc_transfer(device)
            .map_err(ChannelError::Resource)?;
        debug!(
            "Created channel {} for endpoint {:#04x} (interval {})",
            transfer, endpoint.address, endpoint.interval
        );

        Ok(Self {
            core: Arc::new(ChannelCore {
                transport,
                device,
                transfer,
                endpoint: endpoint.address,
                interval: endpoint.interval,
                handler,
                slot: Mutex::new(Slot {
                    state: ChannelState::Idle,
                    buffer: Some(buffer),
                    stats: ChannelStats::default(),
                }),
            }),
        })
    }

    /// Starts polling. A rejected submission leaves the channel `Idle`.
    pub fn submit(&self) -> Result<(), ChannelError> {
        let mut slot = self.core.lock();
        match slot.state {
            ChannelState::Idle => {}
            ChannelState::Submitted => return Err(ChannelError::AlreadySubmitted),
            ChannelState::Terminated => return Err(ChannelError::Terminated),
        }
        let Some(buffer) = slot.buffer.take() else {
            return Err(ChannelError::AlreadySubmitted);
        };

        match self.core.start(buffer) {
            Ok(()) => {
                slot.state = ChannelState::Submitted;
                Ok(())
            }
            Err(SubmitError { buffer, source }) => {
                slot.buffer = Some(buffer);
                Err(ChannelError::Submit(source))
            }
        }
    }

    /// Stops polling for good and waits until no completion can still run.
    ///
    /// Safe to call in any state and more than once.
    pub fn terminate(&self) {
        let previous = std::mem::replace(&mut self.core.lock().state, ChannelState::Terminated);
        debug!("Terminating {} (was {:?})", self.core.transfer, previous);
        self.core.transport.cancel_and_await(self.core.transfer);
    }

    pub fn state(&self) -> ChannelState {
        self.core.lock().state
    }

    pub fn stats(&self) -> ChannelStats {
        self.core.lock().stats
    }

    pub fn transfer(&self) -> TransferId {
        self.core.transfer
    }

    pub fn endpoint(&self) -> u8 {
        self.core.endpoint
    }

    pub fn interval(&self) -> u8 {
        self.core.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{Fault, LoopbackTransport, TransferStatus};

    const DEV: DeviceAddress = DeviceAddress { bus: 3, address: 7 };

    #[derive(Default)]
    struct CountingHandler {
        reports: Mutex<Vec<RawReport>>,
    }

    impl ReportHandler for CountingHandler {
        fn handle_report(&self, report: &RawReport) {
            self.reports.lock().unwrap().push(*report);
        }
    }

    fn channel(
        transport: &Arc<LoopbackTransport>,
    ) -> (TransferChannel, Arc<CountingHandler>) {
        let handler = Arc::new(CountingHandler::default());
        let buffer = transport.alloc_buffer(DEV).unwrap();
        let channel = TransferChannel::create(
            transport.clone(),
            DEV,
            &EndpointDescriptor::interrupt_in(1, 8, 4),
            buffer,
            handler.clone(),
        )
        .unwrap();
        (channel, handler)
    }

    #[test]
    fn success_forwards_once_and_resubmits_once() {
        let transport = Arc::new(LoopbackTransport::new());
        let (channel, handler) = channel(&transport);
        channel.submit().unwrap();
        let submissions = transport.stats().submissions;

        let report = [0, 1, 2, 3, 4, 5, 6, 7];
        assert!(transport.complete(channel.transfer(), TransferStatus::Completed, &report));

        assert_eq!(handler.reports.lock().unwrap().as_slice(), &[report]);
        assert_eq!(transport.stats().submissions, submissions + 1);
        assert_eq!(channel.state(), ChannelState::Submitted);
        assert_eq!(channel.stats().resubmissions, 1);
    }

    #[test]
    fn fatal_status_stops_without_resubmitting() {
        for status in [
            TransferStatus::ConnectionReset,
            TransferStatus::Unlinked,
            TransferStatus::Shutdown,
        ] {
            let transport = Arc::new(LoopbackTransport::new());
            let (channel, handler) = channel(&transport);
            channel.submit().unwrap();

            assert!(transport.complete(channel.transfer(), status, &[0xFF; 8]));

            assert_eq!(transport.stats().submissions, 1);
            assert_eq!(transport.pending_count(), 0);
            assert_eq!(channel.state(), ChannelState::Terminated);
            assert!(handler.reports.lock().unwrap().is_empty());
        }
    }

    #[test]
    fn transient_status_resubmits_without_forwarding() {
        let transport = Arc::new(LoopbackTransport::new());
        let (channel, handler) = channel(&transport);
        channel.submit().unwrap();

        assert!(transport.complete(channel.transfer(), TransferStatus::Protocol, &[]));

        assert!(handler.reports.lock().unwrap().is_empty());
        assert!(transport.is_pending(channel.transfer()));
        assert_eq!(channel.stats().transient_errors, 1);
        assert_eq!(channel.state(), ChannelState::Submitted);
    }

    #[test]
    fn failed_resubmission_terminates() {
        let transport = Arc::new(LoopbackTransport::new());
        let (channel, handler) = channel(&transport);
        channel.submit().unwrap();

        transport.fail_next(Fault::Submit);
        assert!(transport.complete(channel.transfer(), TransferStatus::Completed, &[0, 1]));

        assert_eq!(handler.reports.lock().unwrap().len(), 1);
        assert_eq!(channel.state(), ChannelState::Terminated);
        assert_eq!(transport.pending_count(), 0);
        assert!(matches!(channel.submit(), Err(ChannelError::Terminated)));
    }

    #[test]
    fn rejected_initial_submit_leaves_channel_idle() {
        let transport = Arc::new(LoopbackTransport::new());
        let (channel, _handler) = channel(&transport);

        transport.fail_next(Fault::Submit);
        assert!(matches!(
            channel.submit(),
            Err(ChannelError::Submit(TransportError::NoMemory))
        ));
        assert_eq!(channel.state(), ChannelState::Idle);

        channel.submit().unwrap();
        assert!(matches!(
            channel.submit(),
            Err(ChannelError::AlreadySubmitted)
        ));
    }

    #[test]
    fn terminate_cancels_and_blocks_later_completions() {
        let transport = Arc::new(LoopbackTransport::new());
        let (channel, handler) = channel(&transport);
        channel.submit().unwrap();

        channel.terminate();
        channel.terminate();

        assert_eq!(channel.state(), ChannelState::Terminated);
        assert_eq!(transport.pending_count(), 0);
        assert!(!transport.complete(channel.transfer(), TransferStatus::Completed, &[1; 8]));
        assert!(handler.reports.lock().unwrap().is_empty());
    }

    #[test]
    fn drop_frees_the_transfer() {
        let transport = Arc::new(LoopbackTransport::new());
        let (channel, _handler) = channel(&transport);
        channel.submit().unwrap();
        channel.terminate();
        drop(channel);

        let stats = transport.stats();
        assert_eq!(stats.transfers_allocated, 1);
        assert_eq!(stats.transfers_freed, 1);
    }
}
