use binrw::{BinRead, BinWrite};
use std::fmt;

/// Packed title version: major.minor.micro.relstep packed into a u32.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BinRead, BinWrite)]
pub struct Version(pub u32);

impl Version {
    pub fn major(self) -> u8 {
        (self.0 >> 26) as u8
    }
    pub fn minor(self) -> u8 {
        ((self.0 >> 20) & 0x3f) as u8
    }
    pub fn micro(self) -> u8 {
        ((self.0 >> 16) & 0xf) as u8
    }
    pub fn relstep(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}-{} ({})",
            self.major(),
            self.minor(),
            self.micro(),
            self.relstep(),
            self.0
        )
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Version {
    fn from(v: u32) -> Self {
        Self(v)
    }
}
impl From<Version> for u32 {
    fn from(v: Version) -> Self {
        v.0
    }
}
