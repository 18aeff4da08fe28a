//! Mouse driver: transfer channel, device binding and registration glue
//!
//! 1. [`channel`] - self-resubmitting interrupt transfer
//! 2. [`binding`] - per-device attach/detach lifecycle
//! 3. [`registration`] - match table and binding bookkeeping
//!
//! # Data Flow
//!
//! ```text
//! Transport ──[Completion]──► TransferChannel ──► ReportForwarder ──► InputSink
//!                                   │
//!                               resubmit
//! ```

pub mod binding;
pub mod channel;
pub mod registration;

pub use binding::{attach, AttachError, BindingSettings, MouseBinding, Polling};
pub use channel::{ChannelError, ChannelState, ChannelStats, ReportHandler, TransferChannel};
pub use registration::{DriverRegistration, MouseDriver, UsbDriver};
