//! In-process transport where the caller plays the device
//!
//! Submitted transfers are parked until [`LoopbackTransport::complete`] (or one
//! of its variants) fills the buffer and runs the completion callback on the
//! calling thread. That is enough to drive the full polling loop from a tokio
//! task in the demo binary or from plain threads in tests, and it keeps the
//! cancellation contract of [`UsbTransport`]:
//!
//! - a completion running on another thread blocks `cancel_and_await` until it
//!   returns,
//! - whatever is still queued afterwards completes with `Unlinked` before
//!   `cancel_and_await` returns.
//!
//! Faults can be injected per operation to exercise unwinding paths.

use super::transport::{
    Completion, CompletionFn, InterruptRequest, ReportBuffer, SubmitError, TransferId,
    TransferStatus, TransportError, UsbTransport,
};
use super::DeviceAddress;
use crate::report::{RawReport, REPORT_LEN};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};

/// Operation that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    AllocBuffer,
    AllocTransfer,
    Submit,
}

/// Running totals, used to check that nothing leaks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub buffers_allocated: u64,
    pub transfers_allocated: u64,
    pub transfers_freed: u64,
    pub submissions: u64,
    pub rejected_submissions: u64,
    pub completions: u64,
    pub cancellations: u64,
}

struct PendingTransfer {
    device: DeviceAddress,
    endpoint: u8,
    buffer: ReportBuffer,
    on_complete: CompletionFn,
}

#[derive(Default)]
struct LoopbackState {
    next_transfer: u64,
    allocated: HashMap<TransferId, DeviceAddress>,
    pending: BTreeMap<TransferId, PendingTransfer>,
    running: HashSet<TransferId>,
    unplugged: HashSet<DeviceAddress>,
    faults: HashSet<Fault>,
    stats: LoopbackStats,
}

impl LoopbackState {
    fn take_fault(&mut self, fault: Fault) -> bool {
        self.faults.remove(&fault)
    }
}

#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    // Signalled whenever a completion callback returns
    settled: Condvar,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of the given operation fail.
    pub fn fail_next(&self, fault: Fault) {
        debug!("Arming loopback fault {:?}", fault);
        self.lock().faults.insert(fault);
    }

    pub fn stats(&self) -> LoopbackStats {
        self.lock().stats
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, transfer: TransferId) -> bool {
        self.lock().pending.contains_key(&transfer)
    }

    /// Transfers currently queued for `device`, lowest id first.
    pub fn pending_for(&self, device: DeviceAddress) -> Vec<TransferId> {
        self.lock()
            .pending
            .iter()
            .filter(|(_, pending)| pending.device == device)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Finishes `transfer` with `status`, copying `data` into the buffer when
    /// the status is [`TransferStatus::Completed`].
    ///
    /// Runs the completion callback on the calling thread and returns `false`
    /// if the transfer was not queued.
    pub fn complete(&self, transfer: TransferId, status: TransferStatus, data: &[u8]) -> bool {
        let pending = {
            let mut state = self.lock();
            let Some(pending) = state.pending.remove(&transfer) else {
                return false;
            };
            state.running.insert(transfer);
            state.stats.completions += 1;
            pending
        };

        let PendingTransfer {
            endpoint,
            mut buffer,
            on_complete,
            ..
        } = pending;
        if status == TransferStatus::Completed {
            let len = data.len().min(REPORT_LEN);
            buffer[..len].copy_from_slice(&data[..len]);
        }
        trace!(
            "Completing {} on endpoint {:#04x} with {:?}",
            transfer,
            endpoint,
            status
        );

        on_complete(Completion {
            transfer,
            status,
            buffer,
        });

        self.lock().running.remove(&transfer);
        self.settled.notify_all();
        true
    }

    /// Delivers `report` on the first transfer queued for `device`.
    pub fn deliver(&self, device: DeviceAddress, report: &RawReport) -> bool {
        match self.pending_for(device).first() {
            Some(&transfer) => self.complete(transfer, TransferStatus::Completed, report),
            None => false,
        }
    }

    /// Simulates physical removal: further submissions for `device` fail with
    /// [`TransportError::NoDevice`] and queued transfers complete with
    /// [`TransferStatus::Shutdown`].
    pub fn unplug(&self, device: DeviceAddress) -> usize {
        let queued = {
            let mut state = self.lock();
            state.unplugged.insert(device);
            state
                .pending
                .iter()
                .filter(|(_, pending)| pending.device == device)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
        };
        info!("Device {} unplugged, {} transfer(s) in flight", device, queued.len());

        queued
            .into_iter()
            .filter(|&transfer| self.complete(transfer, TransferStatus::Shutdown, &[]))
            .count()
    }
}

impl UsbTransport for LoopbackTransport {
    fn alloc_buffer(&self, device: DeviceAddress) -> Result<ReportBuffer, TransportError> {
        let mut state = self.lock();
        if state.take_fault(Fault::AllocBuffer) {
            warn!("Injected buffer allocation failure for {}", device);
            return Err(TransportError::NoMemory);
        }
        state.stats.buffers_allocated += 1;
        Ok(Box::new([0; REPORT_LEN]))
    }

    fn alloc_transfer(&self, device: DeviceAddress) -> Result<TransferId, TransportError> {
        let mut state = self.lock();
        if state.take_fault(Fault::AllocTransfer) {
            warn!("Injected transfer allocation failure for {}", device);
            return Err(TransportError::NoMemory);
        }
        if state.unplugged.contains(&device) {
            return Err(TransportError::NoDevice);
        }
        state.next_transfer += 1;
        let transfer = TransferId::new(state.next_transfer);
        state.allocated.insert(transfer, device);
        state.stats.transfers_allocated += 1;
        debug!("Allocated {} for {}", transfer, device);
        Ok(transfer)
    }

    fn submit_interrupt_transfer(
        &self,
        request: InterruptRequest,
        on_complete: CompletionFn,
    ) -> Result<(), SubmitError> {
        let mut state = self.lock();

        let rejection = if state.take_fault(Fault::Submit) {
            Some(TransportError::NoMemory)
        } else if state.unplugged.contains(&request.device) {
            Some(TransportError::NoDevice)
        } else if !state.allocated.contains_key(&request.transfer) {
            Some(TransportError::Rejected(format!(
                "{} was never allocated",
                request.transfer
            )))
        } else if state.pending.contains_key(&request.transfer) {
            Some(TransportError::Rejected(format!(
                "{} is already in flight",
                request.transfer
            )))
        } else {
            None
        };

        if let Some(source) = rejection {
            state.stats.rejected_submissions += 1;
            drop(state);
            // Dropping the callback may release the last handle on the
            // submitter, which must not happen under our lock.
            drop(on_complete);
            return Err(SubmitError {
                buffer: request.buffer,
                source,
            });
        }

        state.stats.submissions += 1;
        state.pending.insert(
            request.transfer,
            PendingTransfer {
                device: request.device,
                endpoint: request.endpoint,
                buffer: request.buffer,
                on_complete,
            },
        );
        Ok(())
    }

    fn cancel_and_await(&self, transfer: TransferId) {
        let cancelled = {
            let mut state = self.lock();
            while state.running.contains(&transfer) {
                state = self
                    .settled
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.stats.cancellations += 1;
            state.pending.remove(&transfer)
        };

        if let Some(pending) = cancelled {
            debug!("Unlinking in-flight {}", transfer);
            (pending.on_complete)(Completion {
                transfer,
                status: TransferStatus::Unlinked,
                buffer: pending.buffer,
            });
        }
    }

    fn free_transfer(&self, transfer: TransferId) {
        let stale = {
            let mut state = self.lock();
            if state.allocated.remove(&transfer).is_none() {
                warn!("Freeing unknown {}", transfer);
                return;
            }
            state.stats.transfers_freed += 1;
            state.pending.remove(&transfer)
        };
        if stale.is_some() {
            warn!("{} freed while still in flight", transfer);
        }
        drop(stale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DEV: DeviceAddress = DeviceAddress { bus: 1, address: 2 };

    fn request(transport: &LoopbackTransport, transfer: TransferId) -> InterruptRequest {
        InterruptRequest {
            transfer,
            device: DEV,
            endpoint: 0x81,
            interval: 10,
            buffer: transport.alloc_buffer(DEV).expect("buffer"),
        }
    }

    #[test]
    fn completion_fills_buffer_and_runs_callback_once() {
        let transport = LoopbackTransport::new();
        let transfer = transport.alloc_transfer(DEV).expect("transfer");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        transport
            .submit_interrupt_transfer(
                request(&transport, transfer),
                Box::new(move |completion| {
                    sink.lock().unwrap().push((completion.status, *completion.buffer));
                }),
            )
            .expect("submit");

        assert!(transport.complete(transfer, TransferStatus::Completed, &[1, 2, 3]));
        assert!(!transport.complete(transfer, TransferStatus::Completed, &[9]));

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(TransferStatus::Completed, [1, 2, 3, 0, 0, 0, 0, 0])]
        );
    }

    #[test]
    fn double_submission_is_rejected_with_buffer_returned() {
        let transport = LoopbackTransport::new();
        let transfer = transport.alloc_transfer(DEV).expect("transfer");
        transport
            .submit_interrupt_transfer(request(&transport, transfer), Box::new(|_| {}))
            .expect("first submit");

        let err = transport
            .submit_interrupt_transfer(request(&transport, transfer), Box::new(|_| {}))
            .expect_err("second submit must fail");
        assert!(matches!(err.source, TransportError::Rejected(_)));
        assert_eq!(*err.buffer, [0; REPORT_LEN]);
        assert_eq!(transport.stats().rejected_submissions, 1);
    }

    #[test]
    fn cancel_unlinks_queued_transfer() {
        let transport = LoopbackTransport::new();
        let transfer = transport.alloc_transfer(DEV).expect("transfer");
        let status = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&status);
        transport
            .submit_interrupt_transfer(
                request(&transport, transfer),
                Box::new(move |completion| {
                    *slot.lock().unwrap() = Some(completion.status);
                }),
            )
            .expect("submit");

        transport.cancel_and_await(transfer);
        assert_eq!(*status.lock().unwrap(), Some(TransferStatus::Unlinked));
        assert_eq!(transport.pending_count(), 0);
    }

    #[test]
    fn unplug_shuts_down_transfers_and_refuses_new_ones() {
        let transport = LoopbackTransport::new();
        let transfer = transport.alloc_transfer(DEV).expect("transfer");
        let status = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&status);
        transport
            .submit_interrupt_transfer(
                request(&transport, transfer),
                Box::new(move |completion| {
                    *slot.lock().unwrap() = Some(completion.status);
                }),
            )
            .expect("submit");

        assert_eq!(transport.unplug(DEV), 1);
        assert_eq!(*status.lock().unwrap(), Some(TransferStatus::Shutdown));

        let err = transport
            .submit_interrupt_transfer(request(&transport, transfer), Box::new(|_| {}))
            .expect_err("unplugged device");
        assert_eq!(err.source, TransportError::NoDevice);
    }

    #[test]
    fn faults_fire_once() {
        let transport = LoopbackTransport::new();
        transport.fail_next(Fault::AllocTransfer);

        assert_eq!(transport.alloc_transfer(DEV), Err(TransportError::NoMemory));
        let transfer = transport.alloc_transfer(DEV).expect("second attempt");
        transport.free_transfer(transfer);

        let stats = transport.stats();
        assert_eq!(stats.transfers_allocated, 1);
        assert_eq!(stats.transfers_freed, 1);
    }
}
