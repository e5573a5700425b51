//! Logical names (OBIS codes)
//!
//! Accepts the dotted form used in configuration ("1.0.1.8.0.255") as well
//! as the display form ("1-0:1.8.0*255").

use crate::protocol::ProtocolError;

/// Parse a logical name into its six bytes
pub fn parse_logical_name(name: &str) -> Result<[u8; 6], ProtocolError> {
    let invalid = || ProtocolError::InvalidLogicalName(name.to_string());

    let parts: Vec<&str> = name
        .trim()
        .split(|c| matches!(c, '.' | '-' | ':' | '*'))
        .collect();
    if parts.len() != 6 {
        return Err(invalid());
    }

    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().zip(&parts) {
        *slot = part.trim().parse::<u8>().map_err(|_| invalid())?;
    }
    Ok(out)
}

/// Dotted form of a logical name
pub fn format_logical_name(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_and_display_forms() {
        assert_eq!(parse_logical_name("1.0.1.8.0.255").unwrap(), [1, 0, 1, 8, 0, 255]);
        assert_eq!(parse_logical_name("1-0:2.7.0*255").unwrap(), [1, 0, 2, 7, 0, 255]);
        assert_eq!(format_logical_name(&[1, 0, 2, 8, 0, 255]), "1.0.2.8.0.255");
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "1.0.1.8.0", "1.0.1.8.0.256", "1.0.x.8.0.255", "1.0.1.8.0.255.1"] {
            assert!(
                matches!(parse_logical_name(name), Err(ProtocolError::InvalidLogicalName(_))),
                "{name} should be rejected"
            );
        }
    }
}
