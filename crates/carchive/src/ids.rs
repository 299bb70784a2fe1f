use crate::hexstring::HexData;
use binrw::{BinRead, BinWrite};
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fmt::{Debug, Display};
use std::str::FromStr;

#[derive(Snafu, Debug)]
pub enum IdParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

fn parse_id(s: &str, result: &mut [u8]) -> Result<(), IdParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            IdParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            IdParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

/// Title identifier, also used as program/application/patch id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BinRead, BinWrite)]
pub struct TitleId(pub u64);

impl TitleId {
    pub fn is_kernel_process_range(&self) -> bool {
        // built-in kernel processes live below 0x0100000000001000
        self.0 < 0x0100_0000_0000_1000
    }
}

impl Debug for TitleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}
impl Display for TitleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl FromStr for TitleId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 8];
        parse_id(s, &mut result)?;
        Ok(TitleId(u64::from_be_bytes(result)))
    }
}

/// 16-byte content identifier. The hex rendering doubles as the content
/// filename stem, hence the lowercase formatting.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BinRead, BinWrite)]
pub struct ContentId(pub [u8; 0x10]);

impl Debug for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
impl Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl FromStr for ContentId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_id(s, &mut result).map(|_| ContentId(result))
    }
}

/// Pairs a title with a titlekey. All zeroes when the content uses plain
/// key-area crypto instead.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
    BinRead,
    BinWrite,
)]
pub struct RightsId(pub HexData<0x10>);

impl RightsId {
    pub fn is_empty(&self) -> bool {
        self.0.is_zero()
    }

    /// Key generation encoded in the last byte of the rights id.
    pub fn key_generation(&self) -> u8 {
        self.0 .0[0xf]
    }
}

impl Display for RightsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RightsId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_id(s, &mut result).map(|_| RightsId(HexData(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_roundtrip() {
        let id: ContentId = "0102030405060708090a0b0c0d0e0f10".parse().unwrap();
        assert_eq!(id.to_string(), "0102030405060708090a0b0c0d0e0f10");
    }

    #[test]
    fn rights_id_emptiness() {
        let empty: RightsId = "00000000000000000000000000000000".parse().unwrap();
        assert!(empty.is_empty());

        let id: RightsId = "01004b9000490000000000000000000b".parse().unwrap();
        assert!(!id.is_empty());
        assert_eq!(id.key_generation(), 0xb);
    }
}
