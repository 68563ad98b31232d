//! Status word definitions for APDU responses

use std::fmt;

use tracing::Level;

/// Status Word (SW1-SW2) from an APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Create from a u16 value (SW1 | SW2)
    pub const fn from_u16(status: u16) -> Self {
        Self::new((status >> 8) as u8, status as u8)
    }

    /// Convert to a u16 value (SW1 | SW2)
    pub const fn to_u16(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// Both bytes in transmission order
    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    /// 90 00
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// 61 XX, more data can be fetched with GET RESPONSE
    pub const fn is_more_data_available(&self) -> bool {
        self.sw1 == 0x61
    }

    /// Warning range (62 XX and 63 XX)
    pub const fn is_warning(&self) -> bool {
        self.sw1 == 0x62 || self.sw1 == 0x63
    }

    /// Remaining PIN attempts when the card answers 63 CX
    pub const fn wrong_pin_attempts(&self) -> Option<u8> {
        if self.sw1 == 0x63 && self.sw2 & 0xF0 == 0xC0 {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }

    /// Authentication method blocked (69 83)
    pub const fn is_authentication_blocked(&self) -> bool {
        self.sw1 == 0x69 && self.sw2 == 0x83
    }

    /// Security status not satisfied (69 82)
    pub const fn is_security_condition_not_satisfied(&self) -> bool {
        self.sw1 == 0x69 && self.sw2 == 0x82
    }

    /// The card rejected the secure messaging objects (69 87 or 69 88)
    pub const fn is_sm_data_error(&self) -> bool {
        self.sw1 == 0x69 && (self.sw2 == 0x87 || self.sw2 == 0x88)
    }

    /// File not found (6A 82)
    pub const fn is_file_not_found(&self) -> bool {
        self.sw1 == 0x6A && self.sw2 == 0x82
    }

    /// Reading went past the end of a transparent file
    ///
    /// Cards report this either as 62 82 or as 6B 00 depending on the vendor.
    pub const fn is_end_of_file(&self) -> bool {
        (self.sw1 == 0x62 && self.sw2 == 0x82) || (self.sw1 == 0x6B && self.sw2 == 0x00)
    }

    /// Tracing level used when logging this status word
    pub const fn tracing_level(&self) -> Level {
        if self.is_success() || self.is_more_data_available() {
            Level::DEBUG
        } else if self.is_warning() {
            Level::INFO
        } else {
            Level::WARN
        }
    }

    /// Human readable description
    pub const fn description(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x61, _) => "More data available",
            (0x62, 0x82) => "End of file reached before reading Le bytes",
            (0x62, 0x83) => "Selected file invalidated",
            (0x63, n) if (n & 0xF0) == 0xC0 => "Verification failed, counter value",
            (0x65, 0x81) => "Memory failure",
            (0x67, 0x00) => "Wrong length",
            (0x68, 0x82) => "Secure messaging not supported",
            (0x69, 0x81) => "Command incompatible with file structure",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x83) => "Authentication method blocked",
            (0x69, 0x84) => "Referenced data invalidated",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x69, 0x86) => "Command not allowed",
            (0x69, 0x87) => "Expected SM data objects missing",
            (0x69, 0x88) => "SM data objects incorrect",
            (0x6A, 0x80) => "Incorrect parameters in the data field",
            (0x6A, 0x81) => "Function not supported",
            (0x6A, 0x82) => "File not found",
            (0x6A, 0x86) => "Incorrect parameters P1-P2",
            (0x6A, 0x88) => "Referenced data not found",
            (0x6B, 0x00) => "Wrong parameters P1-P2",
            (0x6C, _) => "Wrong Le field",
            (0x6D, 0x00) => "Instruction code not supported or invalid",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => "Unknown status word",
        }
    }
}

impl From<(u8, u8)> for StatusWord {
    fn from((sw1, sw2): (u8, u8)) -> Self {
        Self::new(sw1, sw2)
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.sw1, self.sw2)
    }
}

/// Common status words
pub mod common {
    use super::StatusWord;

    /// Success (90 00)
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);
    /// End of file (62 82)
    pub const END_OF_FILE: StatusWord = StatusWord::new(0x62, 0x82);
    /// Wrong length (67 00)
    pub const WRONG_LENGTH: StatusWord = StatusWord::new(0x67, 0x00);
    /// Security condition not satisfied (69 82)
    pub const SECURITY_CONDITION_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);
    /// Authentication method blocked (69 83)
    pub const AUTHENTICATION_BLOCKED: StatusWord = StatusWord::new(0x69, 0x83);
    /// Expected SM data objects missing (69 87)
    pub const SM_DATA_MISSING: StatusWord = StatusWord::new(0x69, 0x87);
    /// SM data objects incorrect (69 88)
    pub const SM_DATA_INCORRECT: StatusWord = StatusWord::new(0x69, 0x88);
    /// File not found (6A 82)
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);
    /// Wrong parameters, offset outside the file (6B 00)
    pub const WRONG_P1P2: StatusWord = StatusWord::new(0x6B, 0x00);
    /// Instruction not supported (6D 00)
    pub const INVALID_INSTRUCTION: StatusWord = StatusWord::new(0x6D, 0x00);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_word_from_to_u16() {
        let sw = StatusWord::from_u16(0x63C2);
        assert_eq!(sw, StatusWord::new(0x63, 0xC2));
        assert_eq!(sw.to_u16(), 0x63C2);
        assert_eq!(sw.to_bytes(), [0x63, 0xC2]);
    }

    #[test]
    fn test_wrong_pin_attempts() {
        assert_eq!(StatusWord::new(0x63, 0xC2).wrong_pin_attempts(), Some(2));
        assert_eq!(StatusWord::new(0x63, 0xC0).wrong_pin_attempts(), Some(0));
        assert_eq!(StatusWord::new(0x63, 0x00).wrong_pin_attempts(), None);
        assert_eq!(common::SUCCESS.wrong_pin_attempts(), None);
    }

    #[test]
    fn test_status_word_classes() {
        assert!(common::AUTHENTICATION_BLOCKED.is_authentication_blocked());
        assert!(common::SM_DATA_MISSING.is_sm_data_error());
        assert!(common::SM_DATA_INCORRECT.is_sm_data_error());
        assert!(common::END_OF_FILE.is_end_of_file());
        assert!(common::WRONG_P1P2.is_end_of_file());
        assert!(!common::FILE_NOT_FOUND.is_end_of_file());
        assert_eq!(common::WRONG_LENGTH.tracing_level(), Level::WARN);
        assert_eq!(StatusWord::new(0x63, 0xC1).tracing_level(), Level::INFO);
    }

    #[test]
    fn test_status_word_display() {
        assert_eq!(common::FILE_NOT_FOUND.to_string(), "6A 82");
        assert_eq!(common::FILE_NOT_FOUND.description(), "File not found");
    }
}
