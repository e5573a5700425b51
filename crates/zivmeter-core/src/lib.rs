//! # zivmeter Core Library
//!
//! Core functionality for reading a Ziv electricity meter over its optical
//! port.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A tick-driven request/response engine that never blocks on the link
//! - DLMS/COSEM over HDLC (link reset, association, register reads)
//! - The read-cycle state machine publishing scaled values to sinks
//! - JSON configuration
//! - A simulated meter for running without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use zivmeter_core::prelude::*;
//!
//! let config = MeterConfig::load("meter.json")?;
//! let port = open_port(&config.port.name, Some(config.port.baud_rate))?;
//! let engine = CommunicationEngine::new(
//!     SerialTransport::new(port),
//!     DlmsCodec::new(config.link.clone()),
//!     config.engine.clone(),
//! );
//! let mut poller = MeterPoller::new(engine, config.read_steps());
//!
//! poller.update();
//! while !poller.is_idle() {
//!     poller.advance();
//!     std::thread::sleep(std::time::Duration::from_millis(config.tick_interval_ms));
//! }
//! ```

pub mod config;
pub mod demo;
pub mod dlms;
pub mod poller;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, MeterConfig, ReadConfig, SensorConfig};
    pub use crate::demo::DemoMeter;
    pub use crate::dlms::{DlmsCodec, LinkSettings};
    pub use crate::poller::{MeterPoller, PollerStats, ReadStep, SensorSink, State};
    pub use crate::protocol::{
        open_port, AttributeRef, CommunicationEngine, EngineConfig, ProtocolError,
        SerialTransport, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
