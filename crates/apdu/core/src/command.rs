//! APDU command definitions
//!
//! This module provides the command type used to talk to cards according to ISO/IEC 7816-4,
//! covering the four cases of short APDUs and their extended length counterparts.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

/// Expected length type for APDU commands
///
/// `256` encodes as `00` in short form, `65536` as `00 00` in extended form.
pub type ExpectedLength = u32;

/// Largest Le that fits a short APDU
pub const MAX_SHORT_LE: ExpectedLength = 256;

/// Largest Le that fits an extended APDU
pub const MAX_EXTENDED_LE: ExpectedLength = 65536;

/// Generic APDU command structure
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected length (optional)
    pub le: Option<ExpectedLength>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with expected response length (Le)
    pub const fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: ExpectedLength) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: Some(le),
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Some(data.into()),
            le: None,
        }
    }

    /// Create a new command with both data and expected length
    pub fn new_with_data_and_le<T: Into<Bytes>>(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        data: T,
        le: ExpectedLength,
    ) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Some(data.into()),
            le: Some(le),
        }
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: ExpectedLength) -> Self {
        self.le = Some(le);
        self
    }

    /// Replace the class byte
    pub const fn with_class(mut self, cla: u8) -> Self {
        self.cla = cla;
        self
    }

    /// Command class (CLA)
    pub const fn class(&self) -> u8 {
        self.cla
    }

    /// Instruction code (INS)
    pub const fn instruction(&self) -> u8 {
        self.ins
    }

    /// First parameter (P1)
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    /// Second parameter (P2)
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Header bytes CLA INS P1 P2
    pub const fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Command payload data, empty when absent
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Expected response length (optional)
    pub const fn expected_length(&self) -> Option<ExpectedLength> {
        self.le
    }

    /// Whether the class byte signals ISO secure messaging with authenticated header
    pub const fn is_secure_messaging(&self) -> bool {
        self.cla & 0x0C == 0x0C
    }

    /// Whether this command needs the extended length encoding
    pub fn is_extended(&self) -> bool {
        self.data().len() > 255 || self.le.is_some_and(|le| le > MAX_SHORT_LE)
    }

    /// Encode the Le field on its own, as it appears at the end of the APDU
    ///
    /// Returns an empty buffer when the command carries no Le.
    pub fn le_bytes(&self) -> Bytes {
        let Some(le) = self.le else {
            return Bytes::new();
        };
        if self.is_extended() {
            let mut buf = BytesMut::with_capacity(3);
            if self.data.is_none() {
                buf.put_u8(0x00);
            }
            buf.put_u16((le % MAX_EXTENDED_LE) as u16);
            buf.freeze()
        } else {
            Bytes::copy_from_slice(&[(le % MAX_SHORT_LE) as u8])
        }
    }

    /// Calculate length of serialized command
    pub fn command_length(&self) -> usize {
        // Header (CLA, INS, P1, P2) is always 4 bytes
        let mut length = 4;
        let extended = self.is_extended();

        if let Some(data) = &self.data {
            length += if extended { 3 } else { 1 } + data.len();
        }

        length + self.le_bytes().len()
    }

    /// Convert to raw APDU bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.command_length());
        buffer.put_slice(&self.header());

        if let Some(data) = &self.data {
            if self.is_extended() {
                buffer.put_u8(0x00);
                buffer.put_u16(data.len() as u16);
            } else {
                buffer.put_u8(data.len() as u8);
            }
            buffer.put_slice(data);
        }

        buffer.put_slice(&self.le_bytes());
        buffer.freeze()
    }

    /// Parse a command from raw bytes
    ///
    /// Accepts every ISO 7816-4 case, short and extended.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 4 {
            return Err(Error::InvalidCommandLength(data.len()));
        }

        let mut command = Self::new(data[0], data[1], data[2], data[3]);
        let body = &data[4..];

        match body.len() {
            // Case 1
            0 => {}
            // Case 2 short
            1 => command.le = Some(decode_short_le(body[0])),
            // Case 2 extended
            3 if body[0] == 0x00 => {
                command.le = Some(decode_extended_le(body[1], body[2]));
            }
            _ if body[0] == 0x00 && body.len() >= 3 => {
                // Case 3/4 extended
                let lc = u16::from_be_bytes([body[1], body[2]]) as usize;
                let rest = &body[3..];
                if lc == 0 || rest.len() < lc {
                    return Err(Error::InvalidCommandLength(data.len()));
                }
                command.data = Some(Bytes::copy_from_slice(&rest[..lc]));
                match &rest[lc..] {
                    [] => {}
                    [hi, lo] => command.le = Some(decode_extended_le(*hi, *lo)),
                    _ => return Err(Error::InvalidCommandLength(data.len())),
                }
            }
            _ => {
                // Case 3/4 short
                let lc = body[0] as usize;
                let rest = &body[1..];
                if rest.len() < lc {
                    return Err(Error::InvalidCommandLength(data.len()));
                }
                command.data = Some(Bytes::copy_from_slice(&rest[..lc]));
                match &rest[lc..] {
                    [] => {}
                    [le] => command.le = Some(decode_short_le(*le)),
                    _ => return Err(Error::InvalidCommandLength(data.len())),
                }
            }
        }

        Ok(command)
    }
}

const fn decode_short_le(le: u8) -> ExpectedLength {
    if le == 0 { MAX_SHORT_LE } else { le as ExpectedLength }
}

const fn decode_extended_le(hi: u8, lo: u8) -> ExpectedLength {
    match u16::from_be_bytes([hi, lo]) {
        0 => MAX_EXTENDED_LE,
        le => le as ExpectedLength,
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("header", &hex::encode_upper(self.header()))
            .field("data_len", &self.data().len())
            .field("le", &self.le)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_command_serialization() {
        let data = Bytes::from_static(&[0xA0, 0x00, 0x00, 0x00, 0x39]);
        let cmd = Command::new_with_data_and_le(0x00, 0xA4, 0x04, 0x0C, data, 256);
        assert_eq!(cmd.to_bytes().as_ref(), hex!("00A4040C05A00000003900"));

        let cmd = Command::new_with_le(0x00, 0xB0, 0x00, 0x00, 0xDF);
        assert_eq!(cmd.to_bytes().as_ref(), hex!("00B00000DF"));
    }

    #[test]
    fn test_extended_serialization() {
        let cmd = Command::new_with_le(0x00, 0xB0, 0x00, 0x00, 1024);
        assert!(cmd.is_extended());
        assert_eq!(cmd.to_bytes().as_ref(), hex!("00B00000000400"));

        let data = vec![0x5A; 300];
        let cmd = Command::new_with_data_and_le(0x00, 0x2A, 0x9E, 0x9A, data, MAX_EXTENDED_LE);
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[..7], hex!("002A9E9A00012C"));
        assert_eq!(&bytes[bytes.len() - 2..], hex!("0000"));
        assert_eq!(bytes.len(), cmd.command_length());
    }

    #[test]
    fn test_command_length() {
        let cmd1 = Command::new(0x00, 0xB0, 0x00, 0x00);
        assert_eq!(cmd1.command_length(), 4);

        let cmd2 = Command::new_with_le(0x00, 0xB0, 0x00, 0x00, 0xFF);
        assert_eq!(cmd2.command_length(), 5);

        let data = Bytes::from_static(&[0x01, 0x02, 0x03]);
        let cmd3 = Command::new_with_data(0x00, 0xD6, 0x00, 0x00, data.clone());
        assert_eq!(cmd3.command_length(), 8);

        let cmd4 = Command::new_with_data_and_le(0x00, 0xD6, 0x00, 0x00, data, 0xFF);
        assert_eq!(cmd4.command_length(), 9);
    }

    #[test]
    fn test_command_from_bytes() {
        // Case 1
        let cmd = Command::from_bytes(&hex!("00A40400")).unwrap();
        assert_eq!(cmd.header(), [0x00, 0xA4, 0x04, 0x00]);
        assert!(cmd.data.is_none());
        assert!(cmd.le.is_none());

        // Case 3
        let cmd = Command::from_bytes(&hex!("00A4020C021001")).unwrap();
        assert_eq!(cmd.data(), &[0x10, 0x01]);
        assert!(cmd.le.is_none());

        // Case 4
        let cmd = Command::from_bytes(&hex!("0088000008010203040506070800")).unwrap();
        assert_eq!(cmd.data().len(), 8);
        assert_eq!(cmd.le, Some(256));

        // Case 2 with Le = 0 meaning 256
        let cmd = Command::from_bytes(&hex!("00B0000000")).unwrap();
        assert_eq!(cmd.le, Some(256));

        // Case 2 extended
        let cmd = Command::from_bytes(&hex!("00B00000000000")).unwrap();
        assert_eq!(cmd.le, Some(MAX_EXTENDED_LE));

        // Case 4 extended
        let cmd = Command::from_bytes(&hex!("0086000000000281010000")).unwrap();
        assert_eq!(cmd.data(), &[0x81, 0x01]);
        assert_eq!(cmd.le, Some(MAX_EXTENDED_LE));

        // Lc longer than the body
        assert!(Command::from_bytes(&hex!("00A4020C0410")).is_err());
        assert!(Command::from_bytes(&hex!("00A4")).is_err());
    }

    #[test]
    fn test_secure_messaging_class() {
        let cmd = Command::new(0x0C, 0xB0, 0x00, 0x00);
        assert!(cmd.is_secure_messaging());
        assert!(!cmd.with_class(0x00).is_secure_messaging());
    }
}
