use crate::hexstring::HexData;
use aes::Aes128;
use binrw::{BinRead, BinWrite};
use cipher::generic_array::GenericArray;
use ctr::Ctr128BE;
use hex::FromHexError;
use rsa::{BigUint, Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::str::FromStr;
use xts_mode::Xts128;

pub mod keyset;

pub const AES_BLOCK_SIZE: usize = 0x10;
/// AES-XTS sector size used by all header and section XTS crypto.
pub const XTS_SECTOR_SIZE: usize = 0x200;

#[derive(Snafu, Debug)]
pub enum KeyParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, BinRead, BinWrite)]
pub struct EncryptedAesKey(pub HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, BinRead, BinWrite)]
pub struct EncryptedAesXtsKey(pub HexData<0x20>);

/// An AES-128 title key, still wrapped with the per-generation titlekek.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TitleKey(pub HexData<0x10>);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesKey(pub HexData<0x10>);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesXtsKey(pub HexData<0x20>);

fn parse_key(s: &str, result: &mut [u8]) -> Result<(), KeyParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            KeyParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            KeyParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

impl FromStr for AesKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| AesKey(HexData(result)))
    }
}

impl FromStr for AesXtsKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x20];
        parse_key(s, &mut result).map(|_| AesXtsKey(HexData(result)))
    }
}

impl FromStr for TitleKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| TitleKey(HexData(result)))
    }
}

impl TitleKey {
    pub fn decrypt(&self, title_kek: AesKey) -> AesKey {
        title_kek.derive_key(&self.0 .0)
    }
}

impl From<[u8; 0x10]> for TitleKey {
    fn from(data: [u8; 0x10]) -> Self {
        TitleKey(HexData(data))
    }
}

impl From<[u8; 0x10]> for AesKey {
    fn from(data: [u8; 0x10]) -> Self {
        AesKey(HexData(data))
    }
}

impl AesKey {
    fn derive_key(&self, source: &[u8; 0x10]) -> AesKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey));

        AesKey(HexData(newkey))
    }

    pub fn decrypt_key(&self, source: EncryptedAesKey) -> AesKey {
        self.derive_key(&source.0 .0)
    }

    fn derive_xts_key(&self, source: &[u8; 0x20]) -> AesXtsKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x00..0x10]));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x10..0x20]));

        AesXtsKey(HexData(newkey))
    }

    pub fn decrypt_xts_key(&self, source: EncryptedAesXtsKey) -> AesXtsKey {
        self.derive_xts_key(&source.0 .0)
    }

    /// ECB-crypt a multiple of the block size in place. The key-area crypt
    /// walks 16-byte slots with this.
    pub fn crypt_ecb(&self, buf: &mut [u8], encrypt: bool) {
        use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
        assert_eq!(buf.len() % AES_BLOCK_SIZE, 0);

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            if encrypt {
                crypter.encrypt_block(block);
            } else {
                crypter.decrypt_block(block);
            }
        }
    }

    /// CTR keystream application; identical for encryption and decryption.
    pub fn crypt_ctr(&self, buf: &mut [u8], ctr: &[u8; 0x10]) {
        use cipher::{KeyIvInit, StreamCipher};

        let key = GenericArray::from_slice(&self.0 .0);
        let iv = GenericArray::from_slice(ctr);
        let mut crypter = Ctr128BE::<Aes128>::new(key, iv);
        crypter.apply_keystream(buf);
    }
}

/// Counter for section CTR crypto: the upper 8 bytes come from the section
/// header, the lower 8 are the big-endian block index of the absolute offset.
pub fn ctr_init_partial(upper_iv: u64, offset: u64) -> [u8; 0x10] {
    let mut ctr = [0; 0x10];
    ctr[..8].copy_from_slice(&upper_iv.to_be_bytes());
    ctr[8..].copy_from_slice(&(offset >> 4).to_be_bytes());
    ctr
}

/// Counter for CTR-EX ranges: the generation replaces the upper IV, the next
/// four bytes stay zero.
pub fn ctr_init_partial_ex(generation: u32, offset: u64) -> [u8; 0x10] {
    let mut ctr = [0; 0x10];
    ctr[..4].copy_from_slice(&generation.to_be_bytes());
    ctr[8..].copy_from_slice(&(offset >> 4).to_be_bytes());
    ctr
}

fn get_tweak(mut sector: u128) -> [u8; 0x10] {
    let mut tweak = [0; 0x10];
    for tweak in tweak.iter_mut().rev() {
        /* console-specific little-endian tweak */
        *tweak = (sector & 0xFF) as u8;
        sector >>= 8;
    }
    tweak
}

impl AesXtsKey {
    #[inline]
    fn to_crypter(&self) -> Xts128<Aes128> {
        use cipher::KeyInit;

        let key1 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x00..0x10]));
        let key2 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x10..0x20]));
        Xts128::<Aes128>::new(key1, key2)
    }

    pub fn decrypt(&self, data: &mut [u8], mut sector: u64, sector_size: usize) {
        assert_eq!(data.len() % sector_size, 0);

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector as u128);

            crypter.decrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }

    pub fn encrypt(&self, data: &mut [u8], mut sector: u64, sector_size: usize) {
        assert_eq!(data.len() % sector_size, 0);

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector as u128);

            crypter.encrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }
}

pub fn sha256(data: &[u8]) -> [u8; 0x20] {
    use digest::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha3_256(data: &[u8]) -> [u8; 0x20] {
    use digest::Digest;
    let mut hasher = sha3::Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Streaming CRC-32 for chunked dumps; feed the previous return value back in
/// as the seed of the next call.
pub fn crc32_with_seed(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// Verifies an RSA-2048-PSS signature (SHA-256, public exponent 0x10001) over
/// `data`. Returns a plain bool: callers decide whether a bad signature is
/// fatal.
pub fn rsa2048_pss_verify_sha256(modulus: &[u8; 0x100], signature: &[u8; 0x100], data: &[u8]) -> bool {
    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from(0x10001u32);
    let key = match RsaPublicKey::new(n, e) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let hashed = sha256(data);
    key.verify(Pss::new::<sha2::Sha256>(), &hashed, signature)
        .is_ok()
}

#[derive(Snafu, Debug)]
pub enum RsaError {
    /// The RSA key components do not form a usable key
    InvalidKey { source: rsa::Error },
    /// RSA-OAEP decryption failed
    OaepDecrypt { source: rsa::Error },
}

/// RSA-2048-OAEP (SHA-256) decryption with an optional label. Used for the
/// personalized-ticket titlekey block.
pub fn rsa2048_oaep_decrypt_sha256(
    modulus: &[u8; 0x100],
    public_exponent: u32,
    private_exponent: &[u8; 0x100],
    label: Option<&str>,
    input: &[u8; 0x100],
) -> Result<Vec<u8>, RsaError> {
    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from(public_exponent);
    let d = BigUint::from_bytes_be(private_exponent);

    let key = RsaPrivateKey::from_components(n, e, d, vec![]).context(InvalidKeySnafu)?;

    let padding = match label {
        Some(label) => Oaep::new_with_label::<sha2::Sha256, _>(label.to_string()),
        None => Oaep::new::<sha2::Sha256>(),
    };

    key.decrypt(padding, input).context(OaepDecryptSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha256_vector() {
        assert_eq!(
            sha256(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn sha3_256_vector() {
        assert_eq!(
            sha3_256(b"abc"),
            hex!("3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532")
        );
    }

    #[test]
    fn crc32_seed_carry_matches_one_shot() {
        let data = b"0123456789abcdef0123456789abcdef";
        let (head, tail) = data.split_at(7);

        let chunked = crc32_with_seed(crc32_with_seed(0, head), tail);
        assert_eq!(chunked, crc32(data));
    }

    #[test]
    fn partial_ctr_layouts() {
        let ctr = ctr_init_partial(0x0102030405060708, 0x40);
        assert_eq!(ctr[..8], hex!("0102030405060708"));
        assert_eq!(ctr[8..], hex!("0000000000000004"));

        let ctr = ctr_init_partial_ex(0xaabbccdd, 0x20);
        assert_eq!(ctr[..8], hex!("aabbccdd00000000"));
        assert_eq!(ctr[8..], hex!("0000000000000002"));
    }

    #[test]
    fn xts_roundtrip() {
        let key: AesXtsKey = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
            .parse()
            .unwrap();

        let mut data = vec![0xa5u8; XTS_SECTOR_SIZE * 2];
        let plain = data.clone();

        key.encrypt(&mut data, 2, XTS_SECTOR_SIZE);
        assert_ne!(data, plain);
        key.decrypt(&mut data, 2, XTS_SECTOR_SIZE);
        assert_eq!(data, plain);
    }

    #[test]
    fn ctr_roundtrip() {
        let key: AesKey = "2b7e151628aed2a6abf7158809cf4f3c".parse().unwrap();
        let ctr = ctr_init_partial(0xdeadbeef00000000, 0x100);

        let mut data = b"some not block aligned data".to_vec();
        let plain = data.clone();

        key.crypt_ctr(&mut data, &ctr);
        assert_ne!(data, plain);
        key.crypt_ctr(&mut data, &ctr);
        assert_eq!(data, plain);
    }
}
