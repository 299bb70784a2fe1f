mod patch;
mod section;
mod signature;
mod storage;
pub mod structs;

#[cfg(test)]
mod tests;

use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;
use tracing::{debug, warn};

use crate::crypto::keyset::KeySet;
use crate::crypto::{sha256, AesKey, AesXtsKey};
use crate::formats::nca::structs::{
    NcaFsHeader, NcaHeader, NcaMagic, NCA_FS_HEADER_COUNT, NCA_FS_HEADER_SIZE, NCA_HEADER_SIZE,
};
use crate::ids::ContentId;
use crate::storage::{ReadableStorage, ReadableStorageExt, SharedStorage, StorageError};
use crate::ticket::TicketStore;

pub use patch::{HashTreePatch, PatchRegion};
pub use section::{FsSection, FsSectionType, SectionCrypt};
pub use storage::{BaseStorage, SectionStorage, SectionStorageAdapter};
pub use structs::{NcaContentType, NcaEncryptionType, NcaHashType};

/// Hash of an all-plaintext NCA0 key area; used to probe whether the key
/// area needs decryption at all.
const NCA0_PLAINTEXT_KEY_AREA_HASH: [u8; 0x20] = [
    0x9A, 0xBB, 0xD2, 0x11, 0x86, 0x00, 0x21, 0x9D, 0x7A, 0xDC, 0x5B, 0x43, 0x95, 0xF8, 0x4E,
    0xFD, 0xFF, 0x6B, 0x25, 0xEF, 0x9F, 0x96, 0x85, 0x28, 0x18, 0x9E, 0x76, 0xB0, 0x92, 0xF0,
    0x6A, 0xCB,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaVersion {
    Nca0,
    Nca2,
    Nca3,
}

#[derive(Snafu, Debug)]
pub enum NcaError {
    /// NCA: failed to read from the storage
    Storage { source: StorageError },
    /// NCA: missing a crypto key
    MissingKey {
        source: crate::crypto::keyset::MissingKeyError,
    },
    /// NCA: failed to parse the NCA header
    HeaderParsing { source: binrw::Error },
    /// NCA: failed to parse the FS header for section {index}
    FsHeaderParsing { index: usize, source: binrw::Error },
    /// NCA: malformed image: {what}
    MalformedImage { what: &'static str },
    /// NCA: declared content size {expected} does not match the storage size {actual}
    StorageSizeMismatch { expected: u64, actual: u64 },
    /// NCA: section error
    Section { source: SectionError },
}

pub use section::SectionError;

/// Keys the content sections are encrypted with.
#[derive(Debug, Clone)]
pub enum ContentKeys {
    /// Decrypted from the key area with the selected KAEK.
    KeyArea { xts: AesXtsKey, ctr: AesKey },
    /// Rights-id crypto with the resolved (and titlekek-unwrapped) titlekey.
    TitleKey(AesKey),
    /// Rights-id crypto, but the titlekey could not be resolved. Headers are
    /// still readable; section reads fail.
    Missing,
}

/// An opened content archive: decrypted headers, resolved content keys and
/// up to four populated section contexts.
#[derive(Debug)]
pub struct Nca<S: ReadableStorage> {
    storage: SharedStorage<S>,
    header: NcaHeader,
    /// Encrypted copy of the first 0x400 bytes, kept as the template for
    /// header re-emission.
    encrypted_header: Vec<u8>,
    header_hash: [u8; 0x20],
    format_version: NcaVersion,
    valid_main_signature: bool,
    content_keys: ContentKeys,
    sections: [Option<FsSection<S>>; NCA_FS_HEADER_COUNT],
    content_id: Option<ContentId>,
}

impl<S: ReadableStorage> Nca<S> {
    /// Opens an archive: decrypts and validates headers, resolves content
    /// keys and initializes the per-section contexts.
    ///
    /// A failed main-signature check is recorded, not fatal — repacked
    /// content legitimately carries custom signatures. A missing titlekey is
    /// also not fatal here; the affected sections fail on first read.
    pub fn new(
        key_set: &KeySet,
        storage: S,
        ticket_store: Option<&TicketStore>,
    ) -> Result<Self, NcaError> {
        let storage = storage.shared();
        let content_size = storage.get_size();

        if content_size < (NCA_HEADER_SIZE + NCA_FS_HEADER_COUNT * NCA_FS_HEADER_SIZE) as u64 {
            return Err(NcaError::MalformedImage {
                what: "content smaller than the full header",
            });
        }

        let header_key = key_set.header_key().context(MissingKeySnafu)?;

        // decrypt the fixed header
        let mut encrypted_header = vec![0u8; NCA_HEADER_SIZE];
        storage.read(0, &mut encrypted_header).context(StorageSnafu)?;

        let mut header_data = encrypted_header.clone();
        header_key.decrypt(&mut header_data, 0, crate::crypto::XTS_SECTOR_SIZE);

        let header =
            NcaHeader::read(&mut Cursor::new(&header_data)).context(HeaderParsingSnafu)?;

        let format_version = match header.magic {
            NcaMagic::Nca0 => NcaVersion::Nca0,
            NcaMagic::Nca2 => NcaVersion::Nca2,
            NcaMagic::Nca3 => NcaVersion::Nca3,
        };

        if header.content_size != content_size {
            return Err(NcaError::StorageSizeMismatch {
                expected: header.content_size,
                actual: content_size,
            });
        }

        let header_hash = sha256(&header_data);

        // the fixed-key signature covers everything from the magic onwards;
        // record the outcome but keep going either way
        let valid_main_signature = signature::verify_main_signature(
            header.main_signature_key_generation,
            &header.main_signature.0 .0,
            &header_data[0x200..0x400],
        );
        if !valid_main_signature {
            debug!(
                content_type = ?header.content_type,
                "main header signature did not verify"
            );
        }

        let revision = header.key_generation_revision();
        let rights_id_available = !header.rights_id.is_empty();

        let content_keys = if rights_id_available {
            let title_key = key_set.title_key(&header.rights_id).or_else(|| {
                ticket_store.and_then(|store| {
                    store
                        .get(&header.rights_id, revision, true)
                        .map_err(|error| {
                            warn!(rights_id = %header.rights_id, %error, "titlekey lookup failed");
                            error
                        })
                        .ok()
                })
            });

            match (title_key, key_set.title_kek(revision)) {
                (Some(title_key), Ok(title_kek)) => {
                    ContentKeys::TitleKey(title_key.decrypt(title_kek))
                }
                _ => ContentKeys::Missing,
            }
        } else {
            Self::decrypt_key_area(key_set, &header, &header_data, format_version)?
        };

        // read and decrypt the per-section headers
        let mut sections: [Option<FsSection<S>>; NCA_FS_HEADER_COUNT] = Default::default();

        for index in 0..NCA_FS_HEADER_COUNT {
            let fs_info = header.fs_info[index];
            if !fs_info.is_enabled() {
                continue;
            }

            let fs_header_offset = match format_version {
                NcaVersion::Nca0 => fs_info.start_offset(),
                _ => (NCA_HEADER_SIZE + index * NCA_FS_HEADER_SIZE) as u64,
            };

            let mut fs_header_data = vec![0u8; NCA_FS_HEADER_SIZE];
            storage
                .read(fs_header_offset, &mut fs_header_data)
                .context(StorageSnafu)?;
            let encrypted_fs_header = fs_header_data.clone();

            // NCA0 section headers use the section's own XTS keys; newer
            // formats reuse the header key with version-specific sectors
            match format_version {
                NcaVersion::Nca3 => {
                    header_key.decrypt(
                        &mut fs_header_data,
                        2 + index as u64,
                        crate::crypto::XTS_SECTOR_SIZE,
                    );
                }
                NcaVersion::Nca2 => {
                    header_key.decrypt(&mut fs_header_data, 0, crate::crypto::XTS_SECTOR_SIZE);
                }
                NcaVersion::Nca0 => {
                    let ContentKeys::KeyArea { xts, .. } = &content_keys else {
                        warn!(section = index, "no XTS key for NCA0 section header");
                        continue;
                    };
                    let sector = (fs_info.start_sector as u64).saturating_sub(2);
                    xts.decrypt(&mut fs_header_data, sector, crate::crypto::XTS_SECTOR_SIZE);
                }
            }

            if !header.fs_header_hashes[index].verify(&fs_header_data) {
                warn!(section = index, "FS header hash mismatch, skipping section");
                continue;
            }

            let fs_header = NcaFsHeader::read(&mut Cursor::new(&fs_header_data))
                .context(FsHeaderParsingSnafu { index })?;

            let content_ctr_key = match &content_keys {
                ContentKeys::TitleKey(key) => Some(*key),
                ContentKeys::KeyArea { ctr, .. } => Some(*ctr),
                ContentKeys::Missing => None,
            };

            let content_keys = &content_keys;
            let section = FsSection::new(
                storage.clone(),
                fs_header,
                encrypted_fs_header,
                index,
                fs_info.start_offset(),
                fs_info.size(),
                content_size,
                format_version,
                content_ctr_key,
                |encryption_type| match encryption_type {
                    NcaEncryptionType::None => SectionCrypt::None,
                    NcaEncryptionType::AesXts => match content_keys {
                        ContentKeys::KeyArea { xts, .. } => SectionCrypt::Xts { key: *xts },
                        _ => SectionCrypt::Unavailable,
                    },
                    _ => match content_keys {
                        ContentKeys::TitleKey(key) => SectionCrypt::Ctr {
                            key: *key,
                            upper_iv: fs_header.upper_iv,
                        },
                        ContentKeys::KeyArea { ctr, .. } => SectionCrypt::Ctr {
                            key: *ctr,
                            upper_iv: fs_header.upper_iv,
                        },
                        ContentKeys::Missing => SectionCrypt::Unavailable,
                    },
                },
            );

            match section {
                Ok(section) => sections[index] = Some(section),
                Err(error @ SectionError::UnsupportedCombination { .. }) => {
                    return Err(NcaError::Section { source: error })
                }
                Err(error) => {
                    warn!(section = index, %error, "skipping unusable section");
                }
            }
        }

        Ok(Self {
            storage,
            header,
            encrypted_header,
            header_hash,
            format_version,
            valid_main_signature,
            content_keys,
            sections,
            content_id: None,
        })
    }

    fn decrypt_key_area(
        key_set: &KeySet,
        header: &NcaHeader,
        header_data: &[u8],
        format_version: NcaVersion,
    ) -> Result<ContentKeys, NcaError> {
        // raw encrypted key area bytes: xts (0x20) + ctr (0x10) + ctr-ex (0x10)
        let encrypted_key_area = &header_data[0x300..0x340];

        let plaintext = format_version == NcaVersion::Nca0
            && sha256(encrypted_key_area) == NCA0_PLAINTEXT_KEY_AREA_HASH;

        let (xts, ctr) = if plaintext {
            let xts = AesXtsKey(crate::HexData(encrypted_key_area[..0x20].try_into().unwrap()));
            let ctr = AesKey(crate::HexData(
                encrypted_key_area[0x20..0x30].try_into().unwrap(),
            ));
            (xts, ctr)
        } else {
            let kaek = key_set
                .key_area_key(
                    header.key_area_key_index,
                    header.key_generation_revision(),
                )
                .context(MissingKeySnafu)?;

            let xts = kaek.decrypt_xts_key(header.key_area.encrypted_xts_key);
            let ctr = kaek.decrypt_key(header.key_area.encrypted_ctr_key);
            (xts, ctr)
        };

        Ok(ContentKeys::KeyArea { xts, ctr })
    }

    pub fn header(&self) -> &NcaHeader {
        &self.header
    }

    pub fn format_version(&self) -> NcaVersion {
        self.format_version
    }

    pub fn content_type(&self) -> NcaContentType {
        self.header.content_type
    }

    pub fn content_size(&self) -> u64 {
        self.header.content_size
    }

    pub fn valid_main_signature(&self) -> bool {
        self.valid_main_signature
    }

    pub fn content_keys(&self) -> &ContentKeys {
        &self.content_keys
    }

    /// SHA-256 of the decrypted fixed header.
    pub fn header_hash(&self) -> [u8; 0x20] {
        self.header_hash
    }

    /// The encrypted header exactly as stored; dumps that do not patch
    /// anything re-emit this verbatim.
    pub fn encrypted_header(&self) -> &[u8] {
        &self.encrypted_header
    }

    pub fn section(&self, index: usize) -> Option<&FsSection<S>> {
        self.sections.get(index).and_then(|s| s.as_ref())
    }

    pub fn sections(&self) -> impl Iterator<Item = &FsSection<S>> {
        self.sections.iter().flatten()
    }

    /// Section index holding the given filesystem kind, resolved by the
    /// conventional layout (0 = code, 1 = data, 2 = logo).
    pub fn section_index_of(&self, section_type: FsSectionType) -> Option<usize> {
        (0..NCA_FS_HEADER_COUNT)
            .find(|&i| self.section(i).map(|s| s.section_type()) == Some(section_type))
    }

    pub fn content_id(&self) -> Option<ContentId> {
        self.content_id
    }

    pub fn set_content_id(&mut self, content_id: ContentId) {
        self.content_id = Some(content_id);
    }

    /// After repacking, the new content id is the first half of the new
    /// content hash.
    pub fn update_content_id_from_hash(&mut self, hash: [u8; 0x20]) {
        self.content_id = Some(ContentId(hash[..0x10].try_into().unwrap()));
    }

    /// Raw read from the underlying content provider, without any section
    /// crypto. Dump loops stream the image through this.
    pub fn read_content(&self, offset: u64, buf: &mut [u8]) -> Result<(), NcaError> {
        self.storage.read(offset, buf).context(StorageSnafu)
    }
}
