//! COSEM application layer
//!
//! Just enough of the xDLMS APDUs to associate with LOW authentication and
//! read register values by logical name.

use byteorder::{BigEndian, ByteOrder};

use super::ReplyError;

/// Logical name referencing, no ciphering
const LN_CONTEXT: [u8; 7] = [0x60, 0x85, 0x74, 0x05, 0x08, 0x01, 0x01];

/// LOW (password) authentication mechanism
const LOW_MECHANISM: [u8; 7] = [0x60, 0x85, 0x74, 0x05, 0x08, 0x02, 0x01];

const AARQ: u8 = 0x60;
const AARE: u8 = 0x61;
const GET_REQUEST: u8 = 0xC0;
const GET_RESPONSE: u8 = 0xC4;
const EXCEPTION_RESPONSE: u8 = 0xD8;
const INITIATE_RESPONSE: u8 = 0x08;
const CONFIRMED_SERVICE_ERROR: u8 = 0x0E;
const NORMAL: u8 = 0x01;

/// Interface class of a COSEM register
pub const REGISTER_CLASS_ID: u16 = 3;

/// xDLMS version proposed in the initiate request
const DLMS_VERSION: u8 = 6;

/// Parameters negotiated in the UA information field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UaParameters {
    /// Largest information field the server sends
    pub max_info_tx: Option<u16>,
    /// Largest information field the server accepts
    pub max_info_rx: Option<u16>,
}

/// Build an AARQ
///
/// An empty password omits the authentication fields.
pub fn build_aarq(password: &[u8], conformance: [u8; 3], max_pdu_size: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&[0xA1, 0x09, 0x06, 0x07]);
    body.extend_from_slice(&LN_CONTEXT);

    if !password.is_empty() {
        // sender-acse-requirements: authentication
        body.extend_from_slice(&[0x8A, 0x02, 0x07, 0x80]);
        body.extend_from_slice(&[0x8B, 0x07]);
        body.extend_from_slice(&LOW_MECHANISM);
        body.extend_from_slice(&[0xAC, password.len() as u8 + 2, 0x80, password.len() as u8]);
        body.extend_from_slice(password);
    }

    let mut initiate = vec![0x01, 0x00, 0x00, 0x00, DLMS_VERSION, 0x5F, 0x1F, 0x04, 0x00];
    initiate.extend_from_slice(&conformance);
    initiate.extend_from_slice(&max_pdu_size.to_be_bytes());

    body.extend_from_slice(&[0xBE, initiate.len() as u8 + 2, 0x04, initiate.len() as u8]);
    body.extend_from_slice(&initiate);

    let mut apdu = Vec::with_capacity(body.len() + 2);
    apdu.push(AARQ);
    apdu.push(body.len() as u8);
    apdu.extend_from_slice(&body);
    apdu
}

/// Check an AARE: the association must be accepted with an initiate response
pub fn parse_aare(apdu: &[u8]) -> Result<(), ReplyError> {
    let tag = *apdu.first().ok_or(ReplyError::Truncated)?;
    if tag != AARE {
        return Err(unexpected(apdu));
    }
    let (body, _) = read_tlv_value(&apdu[1..])?;

    let mut result = None;
    let mut diagnostic = 0;
    let mut initiated = false;
    let mut rest = body;
    while !rest.is_empty() {
        let tag = rest[0];
        let (value, remaining) = read_tlv_value(&rest[1..])?;
        match tag {
            // association-result: INTEGER
            0xA2 => result = value.get(2).copied(),
            // result-source-diagnostic: [1|2] { INTEGER }
            0xA3 => diagnostic = value.get(4).copied().unwrap_or(0),
            // user-information: OCTET STRING { xDLMS APDU }
            0xBE => {
                let inner = value.get(2..).unwrap_or_default();
                match inner.first() {
                    Some(&INITIATE_RESPONSE) => initiated = true,
                    Some(&CONFIRMED_SERVICE_ERROR) => {
                        return Err(ReplyError::ServiceError(inner.get(1..).unwrap_or_default().to_vec()))
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        rest = remaining;
    }

    match result {
        None => Err(ReplyError::Truncated),
        Some(0) if initiated => Ok(()),
        Some(0) => Err(ReplyError::NoInitiateResponse),
        Some(result) => Err(ReplyError::Rejected { result, diagnostic }),
    }
}

/// Build a GET-Request-Normal for one attribute
pub fn build_get_request(invoke_id: u8, class_id: u16, logical_name: [u8; 6], attribute: u8) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(13);
    apdu.extend_from_slice(&[GET_REQUEST, NORMAL, invoke_id]);
    apdu.extend_from_slice(&class_id.to_be_bytes());
    apdu.extend_from_slice(&logical_name);
    apdu.push(attribute);
    // no selective access
    apdu.push(0x00);
    apdu
}

/// Decode a GET-Response-Normal into an integer
pub fn parse_get_response(apdu: &[u8]) -> Result<i64, ReplyError> {
    match apdu.first() {
        Some(&GET_RESPONSE) => {}
        Some(&EXCEPTION_RESPONSE) => {
            return Err(ReplyError::Exception {
                state: apdu.get(1).copied().unwrap_or(0),
                service: apdu.get(2).copied().unwrap_or(0),
            })
        }
        Some(_) => return Err(unexpected(apdu)),
        None => return Err(ReplyError::Truncated),
    }
    if apdu.len() < 5 {
        return Err(ReplyError::Truncated);
    }
    if apdu[1] != NORMAL {
        return Err(ReplyError::UnsupportedResponse(apdu[1]));
    }
    match apdu[3] {
        0x00 => decode_integer(&apdu[4..]),
        _ => Err(ReplyError::DataAccess(apdu[4])),
    }
}

/// Decode an A-XDR numeric value to `i64`; floats are truncated
pub fn decode_integer(data: &[u8]) -> Result<i64, ReplyError> {
    let tag = *data.first().ok_or(ReplyError::Truncated)?;
    let v = &data[1..];
    let need = |n: usize| if v.len() < n { Err(ReplyError::Truncated) } else { Ok(&v[..n]) };

    let value = match tag {
        // boolean, enum, unsigned
        0x03 | 0x16 | 0x11 => i64::from(need(1)?[0]),
        // integer
        0x0F => i64::from(need(1)?[0] as i8),
        // long
        0x10 => i64::from(BigEndian::read_i16(need(2)?)),
        // long-unsigned
        0x12 => i64::from(BigEndian::read_u16(need(2)?)),
        // double-long
        0x05 => i64::from(BigEndian::read_i32(need(4)?)),
        // double-long-unsigned
        0x06 => i64::from(BigEndian::read_u32(need(4)?)),
        // long64
        0x14 => BigEndian::read_i64(need(8)?),
        // long64-unsigned
        0x15 => BigEndian::read_u64(need(8)?) as i64,
        // float32
        0x17 => BigEndian::read_f32(need(4)?) as i64,
        // float64
        0x18 => BigEndian::read_f64(need(8)?) as i64,
        other => return Err(ReplyError::NotNumeric(other)),
    };
    Ok(value)
}

/// Read the negotiated parameters from a UA information field
pub fn parse_ua_parameters(info: &[u8]) -> Result<UaParameters, ReplyError> {
    let mut params = UaParameters::default();
    if info.is_empty() {
        return Ok(params);
    }
    if info.len() < 3 || info[0] != 0x81 || info[1] != 0x80 {
        return Err(ReplyError::Truncated);
    }
    let group = info.get(3..3 + usize::from(info[2])).ok_or(ReplyError::Truncated)?;

    let mut i = 0;
    while i + 2 <= group.len() {
        let id = group[i];
        let len = usize::from(group[i + 1]);
        let value = group.get(i + 2..i + 2 + len).ok_or(ReplyError::Truncated)?;
        let number = value.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        match id {
            0x05 => params.max_info_tx = Some(number.min(u32::from(u16::MAX)) as u16),
            0x06 => params.max_info_rx = Some(number.min(u32::from(u16::MAX)) as u16),
            _ => {}
        }
        i += 2 + len;
    }
    Ok(params)
}

/// Split a BER length and value off `bytes` (which start at the length)
fn read_tlv_value(bytes: &[u8]) -> Result<(&[u8], &[u8]), ReplyError> {
    let first = *bytes.first().ok_or(ReplyError::Truncated)?;
    let (len, header) = match first {
        0x81 => (usize::from(*bytes.get(1).ok_or(ReplyError::Truncated)?), 2),
        0x82 => {
            let raw = bytes.get(1..3).ok_or(ReplyError::Truncated)?;
            (usize::from(BigEndian::read_u16(raw)), 3)
        }
        n if n < 0x80 => (usize::from(n), 1),
        _ => return Err(ReplyError::Truncated),
    };
    let value = bytes.get(header..header + len).ok_or(ReplyError::Truncated)?;
    Ok((value, &bytes[header + len..]))
}

fn unexpected(apdu: &[u8]) -> ReplyError {
    ReplyError::UnexpectedApdu(apdu.first().copied().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// AARE accepting the association, as sent by the meter
    pub(crate) fn accepted_aare() -> Vec<u8> {
        vec![
            0x61, 0x29, 0xA1, 0x09, 0x06, 0x07, 0x60, 0x85, 0x74, 0x05, 0x08, 0x01, 0x01, 0xA2,
            0x03, 0x02, 0x01, 0x00, 0xA3, 0x05, 0xA1, 0x03, 0x02, 0x01, 0x00, 0xBE, 0x10, 0x04,
            0x0E, 0x08, 0x00, 0x06, 0x5F, 0x1F, 0x04, 0x00, 0x00, 0x10, 0x1D, 0x00, 0xEF, 0x00,
            0x07,
        ]
    }

    #[test]
    fn test_aarq_with_password() {
        let apdu = build_aarq(b"00000001", [0x00, 0x7E, 0x1F], 0xFFFF);
        assert_eq!(apdu[0], 0x60);
        assert_eq!(usize::from(apdu[1]), apdu.len() - 2);
        assert_eq!(apdu.len(), 56);
        let auth = [0xAC, 0x0A, 0x80, 0x08, b'0', b'0', b'0', b'0', b'0', b'0', b'0', b'1'];
        assert!(apdu.windows(auth.len()).any(|w| w == auth));
        assert_eq!(&apdu[apdu.len() - 5..], &[0x00, 0x7E, 0x1F, 0xFF, 0xFF]);
    }

    #[test]
    fn test_aarq_without_password() {
        let apdu = build_aarq(b"", [0x00, 0x7E, 0x1F], 0x0400);
        assert!(!apdu.contains(&0xAC));
        assert_eq!(usize::from(apdu[1]), apdu.len() - 2);
    }

    #[test]
    fn test_aare_accepted() {
        assert_eq!(parse_aare(&accepted_aare()), Ok(()));
    }

    #[test]
    fn test_aare_rejected() {
        let mut aare = accepted_aare();
        aare[17] = 0x01; // association-result: rejected-permanent
        aare[24] = 0x0D; // authentication failure
        assert_eq!(
            parse_aare(&aare),
            Err(ReplyError::Rejected {
                result: 1,
                diagnostic: 0x0D
            })
        );
    }

    #[test]
    fn test_get_request_layout() {
        let apdu = build_get_request(0xC1, REGISTER_CLASS_ID, [1, 0, 1, 8, 0, 255], 2);
        assert_eq!(
            apdu,
            vec![0xC0, 0x01, 0xC1, 0x00, 0x03, 0x01, 0x00, 0x01, 0x08, 0x00, 0xFF, 0x02, 0x00]
        );
    }

    #[test]
    fn test_get_response_values() {
        let unsigned = [0xC4, 0x01, 0xC1, 0x00, 0x06, 0x00, 0x00, 0x30, 0x39];
        assert_eq!(parse_get_response(&unsigned), Ok(12345));

        let signed = [0xC4, 0x01, 0xC1, 0x00, 0x05, 0xFF, 0xFF, 0xFF, 0xFE];
        assert_eq!(parse_get_response(&signed), Ok(-2));

        let short = [0xC4, 0x01, 0xC1, 0x00, 0x12, 0x01, 0xF4];
        assert_eq!(parse_get_response(&short), Ok(500));
    }

    #[test]
    fn test_get_response_errors() {
        let denied = [0xC4, 0x01, 0xC1, 0x01, 0x03];
        assert_eq!(parse_get_response(&denied), Err(ReplyError::DataAccess(3)));

        let text = [0xC4, 0x01, 0xC1, 0x00, 0x09, 0x02, 0x41, 0x42];
        assert_eq!(parse_get_response(&text), Err(ReplyError::NotNumeric(0x09)));

        let cut = [0xC4, 0x01, 0xC1, 0x00, 0x06, 0x00];
        assert_eq!(parse_get_response(&cut), Err(ReplyError::Truncated));

        let block = [0xC4, 0x02, 0xC1, 0x00, 0x00];
        assert_eq!(parse_get_response(&block), Err(ReplyError::UnsupportedResponse(0x02)));
    }

    #[test]
    fn test_ua_parameters() {
        let info = [
            0x81, 0x80, 0x14, 0x05, 0x02, 0x00, 0x80, 0x06, 0x02, 0x00, 0x40, 0x07, 0x04, 0x00,
            0x00, 0x00, 0x01, 0x08, 0x04, 0x00, 0x00, 0x00, 0x01,
        ];
        let params = parse_ua_parameters(&info).unwrap();
        assert_eq!(params.max_info_tx, Some(128));
        assert_eq!(params.max_info_rx, Some(64));
        assert_eq!(parse_ua_parameters(&[]), Ok(UaParameters::default()));
    }
}
