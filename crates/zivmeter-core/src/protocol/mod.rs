//! Meter Communication
//!
//! Tick-driven request/response engine for a slow half-duplex serial link.
//!
//! The engine, the receive buffer and the step handlers know nothing about
//! the wire format; that is the [`Codec`]'s job. Bytes move through a
//! [`Transport`].

mod buffer;
mod codec;
mod engine;
mod error;
mod message;
pub mod serial;
mod step;
mod transport;

pub use buffer::ReceiveBuffer;
pub use codec::{Assembly, AttributeRef, Codec, ReplyRecord};
pub use engine::{CommunicationEngine, EngineConfig};
pub use error::ProtocolError;
pub use message::{Message, OutboundQueue};
pub use serial::{list_ports, open_port, PortInfo};
pub use step::{Step, StepHandler, StepResult, ERROR_CODE};
pub use transport::{SerialTransport, Transport};

/// Baud rate of the meter's optical port
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Reply deadline after the last request byte, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Bytes written per tick
///
/// A tick may last about 20ms and the UART has no transmit buffer; at 9600
/// baud ten bytes take roughly 10ms.
pub const DEFAULT_SEND_CHUNK: usize = 10;

/// Frame-end scanning is skipped while the buffer holds this many bytes or fewer
pub const DEFAULT_MIN_FRAME_LEN: usize = 5;

/// HDLC flag byte
pub const FRAME_END_MARKER: u8 = 0x7E;

/// Initial receive buffer capacity
pub const DEFAULT_RECEIVE_CAPACITY: usize = 128;

/// Extra room added each time the receive buffer grows
pub const RECEIVE_SLACK: usize = 20;
