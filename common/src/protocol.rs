//! Zone synchronization datagram, plaintext layer.
//!
//! ```text
//! offset  size      field
//! 0       1         request type
//! 1       NAME_LEN  zone name, NUL padded
//! 11      4         value, f32 LE, NaN = unknown
//! 15      4         setpoint, f32 LE, NaN = use default
//! ```

use crate::{error::ProtocolError, zone::NAME_LEN};

pub const DATAGRAM_LEN: usize = 1 + NAME_LEN + 4 + 4;

const VALUE_OFFSET: usize = 1 + NAME_LEN;
const SETPOINT_OFFSET: usize = VALUE_OFFSET + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    QueryOne,
    QueryAll,
    Report,
    Reboot,
}

impl Request {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::QueryOne => b'?',
            Self::QueryAll => b'*',
            Self::Report => b'!',
            Self::Reboot => b'#',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            b'?' => Ok(Self::QueryOne),
            b'*' => Ok(Self::QueryAll),
            b'!' => Ok(Self::Report),
            b'#' => Ok(Self::Reboot),
            other => Err(ProtocolError::UnknownRequest(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub request: Request,
    pub name: String,
    pub value: f32,
    pub setpoint: f32,
}

impl Datagram {
    pub fn report(name: &str, value: f32, setpoint: f32) -> Self {
        Self {
            request: Request::Report,
            name: name.to_string(),
            value,
            setpoint,
        }
    }

    pub fn query_one(name: &str) -> Self {
        Self {
            request: Request::QueryOne,
            name: name.to_string(),
            value: 0.0,
            setpoint: 0.0,
        }
    }

    pub fn query_all() -> Self {
        Self {
            request: Request::QueryAll,
            name: String::new(),
            value: 0.0,
            setpoint: 0.0,
        }
    }

    pub fn reboot() -> Self {
        Self {
            request: Request::Reboot,
            name: String::new(),
            value: 0.0,
            setpoint: 0.0,
        }
    }

    /// Names longer than the field are truncated so the terminator always fits.
    pub fn encode(&self) -> [u8; DATAGRAM_LEN] {
        let mut buf = [0u8; DATAGRAM_LEN];
        buf[0] = self.request.as_byte();

        let name = self.name.as_bytes();
        let len = name.len().min(NAME_LEN - 1);
        buf[1..1 + len].copy_from_slice(&name[..len]);

        buf[VALUE_OFFSET..SETPOINT_OFFSET].copy_from_slice(&self.value.to_le_bytes());
        buf[SETPOINT_OFFSET..DATAGRAM_LEN].copy_from_slice(&self.setpoint.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != DATAGRAM_LEN {
            return Err(ProtocolError::Length {
                expected: DATAGRAM_LEN,
                actual: buf.len(),
            });
        }

        let request = Request::from_byte(buf[0])?;

        // The last byte of the field is always treated as the terminator.
        let field = &buf[1..VALUE_OFFSET - 1];
        let end = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
        let name = String::from_utf8_lossy(&field[..end]).into_owned();

        Ok(Self {
            request,
            name,
            value: read_f32(&buf[VALUE_OFFSET..SETPOINT_OFFSET]),
            setpoint: read_f32(&buf[SETPOINT_OFFSET..DATAGRAM_LEN]),
        })
    }
}

fn read_f32(bytes: &[u8]) -> f32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    f32::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn report_layout_matches_wire_table() {
        let buf = Datagram::report("bedroom", 21.8, 22.5).encode();

        assert_eq!(buf.len(), 19);
        assert_eq!(buf[0], b'!');
        assert_eq!(&buf[1..8], b"bedroom");
        assert_eq!(&buf[8..11], &[0, 0, 0]);
        assert_eq!(&buf[11..15], &21.8f32.to_le_bytes());
        assert_eq!(&buf[15..19], &22.5f32.to_le_bytes());
    }

    #[test]
    fn decode_reads_report_fields() {
        let decoded = Datagram::decode(&Datagram::report("ctrl", 20.0, f32::NAN).encode()).unwrap();

        assert_eq!(decoded.request, Request::Report);
        assert_eq!(decoded.name, "ctrl");
        assert_eq!(decoded.value, 20.0);
        assert!(decoded.setpoint.is_nan());
    }

    #[test]
    fn unterminated_name_is_cut_at_field_end() {
        let mut buf = Datagram::query_one("x").encode();
        buf[1..11].copy_from_slice(b"abcdefghij");

        let decoded = Datagram::decode(&buf).unwrap();
        assert_eq!(decoded.name, "abcdefghi");
    }

    #[test]
    fn rejects_undersized_datagram() {
        let buf = Datagram::query_all().encode();
        assert!(matches!(
            Datagram::decode(&buf[..10]),
            Err(ProtocolError::Length { actual: 10, .. })
        ));
    }

    #[test]
    fn rejects_unknown_request_byte() {
        let mut buf = Datagram::query_all().encode();
        buf[0] = b'x';
        assert!(matches!(
            Datagram::decode(&buf),
            Err(ProtocolError::UnknownRequest(b'x'))
        ));
    }
}
