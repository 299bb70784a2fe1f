use binrw::{BinRead, BinWrite};

/// Fixed-size byte array rendered as an uppercase hexstring.
///
/// Used for keys, hashes and other opaque binary blobs embedded in headers.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, BinRead, BinWrite)]
pub struct HexData<const N: usize>(pub [u8; N]);

impl<const N: usize> HexData<N> {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl<const N: usize> Default for HexData<N> {
    fn default() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> core::fmt::Debug for HexData<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl<const N: usize> core::fmt::Display for HexData<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

impl<'de, const N: usize> serde::Deserialize<'de> for HexData<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct StrVisitor<const N: usize>;
        impl<'de, const N: usize> serde::de::Visitor<'de> for StrVisitor<N> {
            type Value = HexData<N>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "a {}-character hexstring", N * 2)
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let mut value = [0; N];
                hex::decode_to_slice(s, &mut value)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(s), &self))?;
                Ok(HexData(value))
            }
        }

        deserializer.deserialize_str(StrVisitor)
    }
}

impl<const N: usize> serde::Serialize for HexData<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<const N: usize> AsRef<[u8]> for HexData<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> AsMut<[u8]> for HexData<N> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const N: usize> From<[u8; N]> for HexData<N> {
    fn from(value: [u8; N]) -> Self {
        Self(value)
    }
}

impl<const N: usize> From<HexData<N>> for [u8; N] {
    fn from(value: HexData<N>) -> Self {
        value.0
    }
}
