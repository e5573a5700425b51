//! DLMS/COSEM over HDLC
//!
//! [`DlmsCodec`] is the [`Codec`] used against the Ziv meter: LN
//! referencing, LOW authentication, HDLC on the optical port.

pub mod apdu;
pub mod hdlc;
pub mod obis;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    Assembly, AttributeRef, Codec, Message, ProtocolError, ReceiveBuffer, ReplyRecord,
};
use hdlc::{control, Frame, FLAG, LLC_REQUEST, LLC_RESPONSE};

/// Client address of the public/management client used by the meter
pub const DEFAULT_CLIENT_ADDRESS: u8 = 2;

/// Logical device 1, physical device 0x10
pub const DEFAULT_SERVER_ADDRESS: u32 = 0x90;

/// Factory LOW authentication password
pub const DEFAULT_PASSWORD: &str = "00000001";

/// Default maximum information field length in both directions
pub const DEFAULT_MAX_INFO_LENGTH: u16 = 128;

/// Conformance block proposed in the AARQ
const CONFORMANCE: [u8; 3] = [0x00, 0x7E, 0x1F];

/// Largest APDU the client accepts
const MAX_PDU_SIZE: u16 = 0xFFFF;

/// Invoke id and priority of every GET request
const INVOKE_ID: u8 = 0xC1;

/// Why the meter's answer did not satisfy the request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// Frame type does not answer the request
    #[error("unexpected control field {0:#04x}")]
    UnexpectedControl(u8),

    /// The meter answered DM
    #[error("meter is in disconnected mode")]
    Disconnected,

    /// APDU ends early
    #[error("reply truncated")]
    Truncated,

    /// APDU of the wrong kind
    #[error("unexpected APDU tag {0:#04x}")]
    UnexpectedApdu(u8),

    /// AARE lacks the initiate response
    #[error("association accepted without an initiate response")]
    NoInitiateResponse,

    /// Exception response
    #[error("exception response (state {state}, service {service})")]
    Exception {
        /// State error
        state: u8,
        /// Service error
        service: u8,
    },

    /// Confirmed service error, raw body
    #[error("confirmed service error {0:02x?}")]
    ServiceError(Vec<u8>),

    /// GET response other than normal
    #[error("unsupported GET response type {0:#04x}")]
    UnsupportedResponse(u8),

    /// Association refused
    #[error("association rejected (result {result}, diagnostic {diagnostic})")]
    Rejected {
        /// Association result
        result: u8,
        /// Source diagnostic
        diagnostic: u8,
    },

    /// GET answered with a data access result
    #[error("data access error {0}")]
    DataAccess(u8),

    /// Value is not an integer
    #[error("value with tag {0:#04x} is not numeric")]
    NotNumeric(u8),
}

impl ReplyError {
    /// Stable nonzero step code
    pub fn code(&self) -> i32 {
        match self {
            ReplyError::UnexpectedControl(_) => 1,
            ReplyError::Disconnected => 2,
            ReplyError::Truncated => 3,
            ReplyError::UnexpectedApdu(_) => 4,
            ReplyError::NoInitiateResponse => 5,
            ReplyError::Exception { .. } => 6,
            ReplyError::ServiceError(_) => 7,
            ReplyError::UnsupportedResponse(_) => 8,
            ReplyError::Rejected { result, .. } => 0x100 + i32::from(*result),
            ReplyError::DataAccess(result) => 0x200 + i32::from(*result),
            ReplyError::NotNumeric(tag) => 0x300 + i32::from(*tag),
        }
    }
}

/// Addressing and authentication of the HDLC link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Client SAP
    pub client_address: u8,
    /// Server address before HDLC encoding
    pub server_address: u32,
    /// LOW authentication password
    pub password: String,
    /// Largest information field proposed before the UA says otherwise
    pub max_info_length: u16,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            client_address: DEFAULT_CLIENT_ADDRESS,
            server_address: DEFAULT_SERVER_ADDRESS,
            password: DEFAULT_PASSWORD.to_string(),
            max_info_length: DEFAULT_MAX_INFO_LENGTH,
        }
    }
}

/// One assembled server frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlmsReply {
    /// A whole frame has been assembled
    pub complete: bool,
    /// Control field of the frame
    pub control: u8,
    /// Information field, LLC header stripped
    pub data: Vec<u8>,
}

impl ReplyRecord for DlmsReply {
    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// DLMS/COSEM client codec
#[derive(Debug, Clone)]
pub struct DlmsCodec {
    settings: LinkSettings,
    client: Vec<u8>,
    server: Vec<u8>,
    send_seq: u8,
    recv_seq: u8,
    max_info_tx: usize,
    max_info_rx: usize,
}

impl DlmsCodec {
    /// Codec with sequence numbers at zero
    pub fn new(settings: LinkSettings) -> Self {
        let max_info = usize::from(settings.max_info_length);
        Self {
            client: hdlc::client_address(settings.client_address),
            server: hdlc::server_address(settings.server_address),
            settings,
            send_seq: 0,
            recv_seq: 0,
            max_info_tx: max_info,
            max_info_rx: max_info,
        }
    }

    /// Link settings in use
    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Largest information field sent to the meter
    pub fn max_info_tx(&self) -> usize {
        self.max_info_tx
    }

    /// Largest information field the meter will send
    pub fn max_info_rx(&self) -> usize {
        self.max_info_rx
    }

    /// Current N(S) and N(R)
    pub fn sequence(&self) -> (u8, u8) {
        (self.send_seq, self.recv_seq)
    }

    /// Wrap an APDU in I-frames, one per information field segment
    fn information_frames(&mut self, apdu: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        let mut payload = Vec::with_capacity(LLC_REQUEST.len() + apdu.len());
        payload.extend_from_slice(&LLC_REQUEST);
        payload.extend_from_slice(apdu);

        let segment = self.max_info_tx.max(1);
        let count = payload.len().div_ceil(segment);
        let mut messages = Vec::with_capacity(count);
        for (i, chunk) in payload.chunks(segment).enumerate() {
            let frame = Frame {
                dest: self.server.clone(),
                src: self.client.clone(),
                control: Frame::i_control(self.send_seq, self.recv_seq),
                segmented: i + 1 < count,
                info: chunk.to_vec(),
            };
            let bytes = frame
                .encode()
                .map_err(|e| ProtocolError::Build(e.to_string()))?;
            messages.push(Message::new(bytes));
            self.send_seq = (self.send_seq + 1) & 0x07;
        }
        Ok(messages)
    }

    /// Information field of an I-frame reply
    fn information<'a>(&self, reply: &'a DlmsReply) -> Result<&'a [u8], ReplyError> {
        match reply.control {
            control::DM => Err(ReplyError::Disconnected),
            c if c & 0x01 == 0 => Ok(&reply.data),
            c => Err(ReplyError::UnexpectedControl(c)),
        }
    }

    fn check_link_reset(&mut self, reply: &DlmsReply) -> Result<(), ReplyError> {
        match reply.control {
            control::UA => {}
            control::DM => return Err(ReplyError::Disconnected),
            c => return Err(ReplyError::UnexpectedControl(c)),
        }
        let params = apdu::parse_ua_parameters(&reply.data)?;
        // The meter's receive limit bounds what we send, and vice versa
        if let Some(rx) = params.max_info_rx {
            self.max_info_tx = usize::from(rx).min(usize::from(self.settings.max_info_length));
        }
        if let Some(tx) = params.max_info_tx {
            self.max_info_rx = usize::from(tx);
        }
        tracing::debug!(
            "link up: max info tx {} rx {}",
            self.max_info_tx,
            self.max_info_rx
        );
        Ok(())
    }
}

impl Default for DlmsCodec {
    fn default() -> Self {
        Self::new(LinkSettings::default())
    }
}

impl Codec for DlmsCodec {
    type Reply = DlmsReply;

    fn build_link_reset(&mut self) -> Result<Vec<Message>, ProtocolError> {
        self.send_seq = 0;
        self.recv_seq = 0;
        self.max_info_tx = usize::from(self.settings.max_info_length);
        self.max_info_rx = usize::from(self.settings.max_info_length);

        let frame = Frame::command(self.server.clone(), self.client.clone(), control::SNRM);
        let bytes = frame
            .encode()
            .map_err(|e| ProtocolError::Build(e.to_string()))?;
        Ok(vec![Message::new(bytes)])
    }

    fn build_associate(&mut self) -> Result<Vec<Message>, ProtocolError> {
        let aarq = apdu::build_aarq(self.settings.password.as_bytes(), CONFORMANCE, MAX_PDU_SIZE);
        self.information_frames(&aarq)
    }

    fn build_attribute_read(&mut self, attr: &AttributeRef) -> Result<Vec<Message>, ProtocolError> {
        let logical_name = obis::parse_logical_name(&attr.logical_name)?;
        let request = apdu::build_get_request(
            INVOKE_ID,
            apdu::REGISTER_CLASS_ID,
            logical_name,
            attr.attribute,
        );
        self.information_frames(&request)
    }

    fn parse_link_reset_reply(&mut self, reply: &DlmsReply) -> i32 {
        match self.check_link_reset(reply) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!("link reset refused: {e}");
                e.code()
            }
        }
    }

    fn parse_associate_reply(&mut self, reply: &DlmsReply) -> i32 {
        match self.information(reply).and_then(apdu::parse_aare) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!("association refused: {e}");
                e.code()
            }
        }
    }

    fn parse_attribute_reply(&mut self, attr: &AttributeRef, reply: &DlmsReply) -> (i32, i64) {
        match self.information(reply).and_then(apdu::parse_get_response) {
            Ok(value) => (0, value),
            Err(e) => {
                tracing::warn!("read {attr} refused: {e}");
                (e.code(), 0)
            }
        }
    }

    fn assemble(
        &mut self,
        buffer: &mut ReceiveBuffer,
        reply: &mut DlmsReply,
    ) -> Result<Assembly, ProtocolError> {
        loop {
            let data = buffer.unread();
            let Some(start) = data.iter().position(|&b| b == FLAG) else {
                buffer.consume(data.len());
                return Ok(Assembly::NeedMore);
            };
            if start > 0 {
                tracing::trace!("skipping {start} bytes before flag");
                buffer.consume(start);
                continue;
            }
            let Some(&format) = data.get(1) else {
                return Ok(Assembly::NeedMore);
            };
            if format == FLAG || !hdlc::is_format_byte(format) {
                // Repeated flag, or a closing flag followed by noise
                buffer.consume(1);
                continue;
            }
            let Some(&low) = data.get(2) else {
                return Ok(Assembly::NeedMore);
            };
            let len = hdlc::frame_length(format, low);
            if data.len() < len + 2 {
                return Ok(Assembly::NeedMore);
            }
            if data[len + 1] != FLAG {
                return Err(ProtocolError::MalformedFrame(format!(
                    "no closing flag after {len} bytes"
                )));
            }
            let frame = Frame::decode(&data[1..=len])
                .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
            // The closing flag may open the next frame
            buffer.consume(len + 1);

            if frame.dest != self.client || frame.src != self.server {
                tracing::trace!("skipping frame {:02x?} -> {:02x?}", frame.src, frame.dest);
                continue;
            }
            if frame.is_receive_ready() {
                tracing::trace!("skipping RR");
                continue;
            }
            if frame.segmented {
                return Err(ProtocolError::MalformedFrame(
                    "segmented replies are not supported".into(),
                ));
            }

            let mut info = frame.info.as_slice();
            if frame.is_information() {
                self.recv_seq = (frame.send_sequence() + 1) & 0x07;
                info = info.strip_prefix(&LLC_RESPONSE[..]).unwrap_or(info);
            }
            reply.control = frame.control;
            reply.data = info.to_vec();
            reply.complete = true;
            return Ok(Assembly::Complete);
        }
    }
}
