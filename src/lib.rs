//! USB boot-protocol mouse driver
//!
//! Binds a HID boot mouse to a host input layer and keeps an interrupt
//! transfer polling loop alive for as long as the device stays bound.
//!
//! # Architecture
//!
//! ```text
//! UsbTransport ──[Completion]──► TransferChannel ──► report::decode ──► InputSink
//!      ▲                               │
//!      └────────── resubmit ───────────┘
//! ```
//!
//! Both the transport and the input sink are injected as trait objects, so the
//! whole lifecycle runs against [`usb::loopback::LoopbackTransport`] without
//! hardware.

pub mod config;
pub mod driver;
pub mod input;
pub mod replay;
pub mod report;
pub mod usb;
