//! Codec interface
//!
//! The engine never looks inside protocol messages. A codec turns each step
//! into wire messages, assembles inbound bytes into a reply record and
//! judges that reply.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Message, ProtocolError, ReceiveBuffer};

/// Identity of a single readable attribute on the meter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeRef {
    /// Logical register name, e.g. "1.0.1.8.0.255"
    pub logical_name: String,
    /// Attribute index within the object (2 is a register's value)
    pub attribute: u8,
}

impl AttributeRef {
    /// Reference attribute `attribute` of the object named `logical_name`
    pub fn new(logical_name: impl Into<String>, attribute: u8) -> Self {
        Self {
            logical_name: logical_name.into(),
            attribute,
        }
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.logical_name, self.attribute)
    }
}

/// Reply state built up by a codec across ticks
pub trait ReplyRecord: Default {
    /// True once a whole reply has been assembled
    fn is_complete(&self) -> bool;
}

/// Outcome of one incremental assembly pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assembly {
    /// The buffered bytes do not yet hold a whole reply
    NeedMore,
    /// The reply record is complete
    Complete,
}

/// Protocol encoder/decoder used by the step handlers and the engine
///
/// Parse methods return 0 when the meter accepted the request and a nonzero
/// code otherwise.
pub trait Codec {
    /// Codec-owned reply record
    type Reply: ReplyRecord;

    /// Messages that reset the data link
    fn build_link_reset(&mut self) -> Result<Vec<Message>, ProtocolError>;

    /// Messages that open an application association
    fn build_associate(&mut self) -> Result<Vec<Message>, ProtocolError>;

    /// Messages that read one attribute
    fn build_attribute_read(&mut self, attr: &AttributeRef) -> Result<Vec<Message>, ProtocolError>;

    /// Judge the answer to a link reset
    fn parse_link_reset_reply(&mut self, reply: &Self::Reply) -> i32;

    /// Judge the answer to an association request
    fn parse_associate_reply(&mut self, reply: &Self::Reply) -> i32;

    /// Judge an attribute read
    ///
    /// Returns the code and, when the code is 0, the decoded value
    fn parse_attribute_reply(&mut self, attr: &AttributeRef, reply: &Self::Reply) -> (i32, i64);

    /// Consume framed bytes from `buffer` into `reply`
    ///
    /// An error means the bytes cannot form a valid reply.
    fn assemble(
        &mut self,
        buffer: &mut ReceiveBuffer,
        reply: &mut Self::Reply,
    ) -> Result<Assembly, ProtocolError>;
}
