//! Tag identifiers
//!
//! UIDs come in as `xx-xx-xx-xx` or `xx:xx:xx:xx`, case-insensitive, and are stored as raw bytes.
//! Consumers always see the canonical form: uppercase pairs joined by `-`.
use core::fmt::{self, Write};

use heapless::{String, Vec};

use crate::ConfigurationError;

/// Longest NFCID, a triple size NFCID1
pub const MAX_UID_LEN: usize = 10;
/// Two hex digits per byte and a separator between them
pub const MAX_UID_STR_LEN: usize = MAX_UID_LEN * 3 - 1;

pub type UidString = String<MAX_UID_STR_LEN>;

#[derive(Clone, PartialEq, Eq)]
pub struct Uid(Vec<u8, MAX_UID_LEN>);

impl Uid {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigurationError> {
        if bytes.is_empty() {
            return Err(ConfigurationError::EmptyUid);
        }
        Vec::from_slice(bytes)
            .map(Self)
            .map_err(|_| ConfigurationError::UidTooLong)
    }

    /// Parse a configured UID
    pub fn parse(s: &str) -> Result<Self, ConfigurationError> {
        if s.trim().is_empty() {
            return Err(ConfigurationError::EmptyUid);
        }
        let mut bytes = Vec::new();
        for (index, part) in s.split(['-', ':']).enumerate() {
            let byte = parse_pair(part).ok_or(ConfigurationError::InvalidUidSegment { index })?;
            bytes
                .push(byte)
                .map_err(|_| ConfigurationError::UidTooLong)?;
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_uid_string(&self) -> UidString {
        let mut s = String::new();
        // capacity fits the longest UID
        let _ = write!(s, "{}", self);
        s
    }
}

fn parse_pair(part: &str) -> Option<u8> {
    match part.as_bytes() {
        [hi, lo] => Some(hex_digit(*hi)? << 4 | hex_digit(*lo)?),
        _ => None,
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Validate a configured UID and return its canonical form
pub fn normalize(s: &str) -> Result<UidString, ConfigurationError> {
    Uid::parse(s).map(|uid| uid.to_uid_string())
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char('-')?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Uid {
    fn format(&self, f: defmt::Formatter) {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                defmt::write!(f, "-");
            }
            defmt::write!(f, "{=u8:02X}", *b);
        }
    }
}

impl core::str::FromStr for Uid {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
