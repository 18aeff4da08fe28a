//! Transport capability consumed by the driver
//!
//! The transport owns USB scheduling. The driver only allocates a transfer
//! once, lends its report buffer for each submission and gets it back in the
//! [`Completion`]. While a transfer is in flight the driver holds no reference
//! to the buffer, so it cannot read it early.
//!
//! # Contract
//!
//! - `submit_interrupt_transfer` only enqueues; it must never invoke the
//!   completion callback on the caller's stack.
//! - Each accepted submission produces exactly one completion callback, and
//!   callbacks for one transfer never overlap.
//! - `cancel_and_await` returns only once no callback for the transfer is
//!   running or can still run. A cancelled transfer completes with
//!   [`TransferStatus::Unlinked`] before the call returns. It must not be
//!   called from inside a completion callback.

use super::DeviceAddress;
use crate::report::RawReport;
use std::fmt;

/// Report buffer lent to the transport for the duration of one transfer.
pub type ReportBuffer = Box<RawReport>;

/// Callback run by the transport when a submitted transfer finishes.
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Out of memory")]
    NoMemory,

    #[error("Device is no longer present")]
    NoDevice,

    #[error("Transfer rejected: {0}")]
    Rejected(String),
}

/// Submission refused by the transport; the buffer comes back with the error.
#[derive(Debug, thiserror::Error)]
#[error("Submission rejected: {source}")]
pub struct SubmitError {
    pub buffer: ReportBuffer,
    pub source: TransportError,
}

// Linux errno values used as URB completion codes
const ENOENT: i32 = 2;
const EPIPE: i32 = 32;
const ETIME: i32 = 62;
const EPROTO: i32 = 71;
const EOVERFLOW: i32 = 75;
const EILSEQ: i32 = 84;
const ECONNRESET: i32 = 104;
const ESHUTDOWN: i32 = 108;

/// Completion status of one interrupt transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    /// Transfer was unlinked asynchronously
    ConnectionReset,
    /// Transfer was cancelled synchronously
    Unlinked,
    /// Device or host controller went away
    Shutdown,
    Stall,
    Overflow,
    Protocol,
    Crc,
    Timeout,
    Other(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Keep polling
    Transient,
    /// Stop polling for good
    Fatal,
}

impl TransferStatus {
    /// Maps a Linux-style completion code (`0` or a negative errno).
    pub fn from_code(code: i32) -> Self {
        match code.wrapping_neg() {
            0 => Self::Completed,
            ECONNRESET => Self::ConnectionReset,
            ENOENT => Self::Unlinked,
            ESHUTDOWN => Self::Shutdown,
            EPIPE => Self::Stall,
            EOVERFLOW => Self::Overflow,
            EPROTO => Self::Protocol,
            EILSEQ => Self::Crc,
            ETIME => Self::Timeout,
            _ => Self::Other(code),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::ConnectionReset => -ECONNRESET,
            Self::Unlinked => -ENOENT,
            Self::Shutdown => -ESHUTDOWN,
            Self::Stall => -EPIPE,
            Self::Overflow => -EOVERFLOW,
            Self::Protocol => -EPROTO,
            Self::Crc => -EILSEQ,
            Self::Timeout => -ETIME,
            Self::Other(code) => code,
        }
    }

    pub fn class(self) -> StatusClass {
        match self {
            Self::Completed => StatusClass::Success,
            Self::ConnectionReset | Self::Unlinked | Self::Shutdown => StatusClass::Fatal,
            _ => StatusClass::Transient,
        }
    }

    pub fn is_fatal(self) -> bool {
        self.class() == StatusClass::Fatal
    }
}

/// One inbound interrupt transfer handed to the transport
#[derive(Debug)]
pub struct InterruptRequest {
    pub transfer: TransferId,
    pub device: DeviceAddress,
    pub endpoint: u8,
    /// Polling hint in frames; the transport completes after at most this many
    /// polling cycles, sooner if data arrives.
    pub interval: u8,
    pub buffer: ReportBuffer,
}

/// Result of a finished transfer. `buffer` holds the report when `status` is
/// [`TransferStatus::Completed`].
#[derive(Debug)]
pub struct Completion {
    pub transfer: TransferId,
    pub status: TransferStatus,
    pub buffer: ReportBuffer,
}

/// Capability for moving interrupt transfers between host and device
pub trait UsbTransport: Send + Sync {
    /// Allocates a zeroed report buffer suitable for transfers to `device`.
    fn alloc_buffer(&self, device: DeviceAddress) -> Result<ReportBuffer, TransportError>;

    /// Allocates a reusable transfer handle for `device`.
    fn alloc_transfer(&self, device: DeviceAddress) -> Result<TransferId, TransportError>;

    /// Queues `request`; `on_complete` runs later from the transport's context.
    fn submit_interrupt_transfer(
        &self,
        request: InterruptRequest,
        on_complete: CompletionFn,
    ) -> Result<(), SubmitError>;

    /// Cancels any in-flight transfer and waits until no callback can fire.
    fn cancel_and_await(&self, transfer: TransferId);

    /// Releases a transfer handle. The transfer must not be in flight.
    fn free_transfer(&self, transfer: TransferId);
}
