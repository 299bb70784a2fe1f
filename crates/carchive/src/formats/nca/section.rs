use crate::crypto::{
    ctr_init_partial, ctr_init_partial_ex, AesKey, AesXtsKey, AES_BLOCK_SIZE, XTS_SECTOR_SIZE,
};
use crate::formats::bktr::BktrError;
use crate::formats::nca::structs::{
    HashData, NcaEncryptionType, NcaFsHeader, NcaFsType, NcaHashType, NCA_HEADER_SIZE,
};
use crate::formats::nca::NcaVersion;
use crate::storage::{ReadableStorage, SharedStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tracing::warn;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum SectionError {
    /// Section: failed to read from the storage
    Storage { source: StorageError },
    /// Section {index}: malformed: {what}
    MalformedSection { index: usize, what: &'static str },
    /// Section {index}: NCA0 images cannot carry a sparse layer
    UnsupportedCombination { index: usize },
    /// Section: the rights-id titlekey is unavailable
    MissingTitleKey {},
    /// Section: read past the end of the section
    OutOfRange {},
    /// Section: bucket tree error
    Bktr { source: BktrError },
    /// Section: hash mismatch in {what}
    HashMismatch { what: &'static str },
    /// Section: compressed entry rejected: {what}
    Compression { what: &'static str },
    /// Section: patching is not supported here: {reason}
    UnsupportedLayer { reason: &'static str },
}

/// What the section stores, derived from the fs/hash/encryption type matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsSectionType {
    PartitionFs,
    RomFs,
    PatchRomFs,
    Nca0RomFs,
}

/// Per-section crypto state. XTS carries the key-area XTS key, CTR carries
/// the resolved content key plus the header's upper IV half.
#[derive(Debug, Clone)]
pub enum SectionCrypt {
    None,
    Xts { key: AesXtsKey },
    Ctr { key: AesKey, upper_iv: u64 },
    /// Rights-id content whose titlekey could not be resolved; reads fail.
    Unavailable,
}

/// A populated filesystem section: decrypted header plus everything needed
/// to read raw plaintext bytes out of it. Owns no parent reference; the
/// content storage is shared and the header data is copied in.
#[derive(Debug)]
pub struct FsSection<S: ReadableStorage> {
    pub(super) storage: SharedStorage<S>,
    pub(super) header: NcaFsHeader,
    pub(super) encrypted_header: Vec<u8>,
    pub(super) index: usize,
    pub(super) section_offset: u64,
    pub(super) section_size: u64,
    pub(super) content_size: u64,
    pub(super) format_version: NcaVersion,
    pub(super) hash_type: NcaHashType,
    pub(super) encryption_type: NcaEncryptionType,
    pub(super) section_type: FsSectionType,
    pub(super) skip_hash_layer_crypto: bool,
    /// Where the hash-target region (the actual filesystem bytes) starts;
    /// everything before it is hash-tree layers.
    pub(super) hash_target_offset: u64,
    pub(super) hash_target_size: u64,
    /// Absolute content offset of the sparse bucket table, when present.
    pub(super) sparse_table_offset: Option<u64>,
    pub(super) crypt: SectionCrypt,
    /// Content CTR key independent of the section encryption type; sparse
    /// tables and CTR-EX ranges always use it.
    pub(super) content_ctr_key: Option<AesKey>,
}

impl<S: ReadableStorage> Clone for FsSection<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            header: self.header.clone(),
            encrypted_header: self.encrypted_header.clone(),
            index: self.index,
            section_offset: self.section_offset,
            section_size: self.section_size,
            content_size: self.content_size,
            format_version: self.format_version,
            hash_type: self.hash_type,
            encryption_type: self.encryption_type,
            section_type: self.section_type,
            skip_hash_layer_crypto: self.skip_hash_layer_crypto,
            hash_target_offset: self.hash_target_offset,
            hash_target_size: self.hash_target_size,
            sparse_table_offset: self.sparse_table_offset,
            crypt: self.crypt.clone(),
            content_ctr_key: self.content_ctr_key,
        }
    }
}

struct ResolvedTypes {
    hash_type: NcaHashType,
    encryption_type: NcaEncryptionType,
    section_type: FsSectionType,
}

/// Applies the `Auto` resolution rules and the fs/hash/encryption type
/// matrix.
fn resolve_types(
    header: &NcaFsHeader,
    index: usize,
    format_version: NcaVersion,
) -> Result<ResolvedTypes, SectionError> {
    let hash_type = match header.hash_type {
        ty @ (NcaHashType::Auto | NcaHashType::AutoSha3) => {
            let sha3 = ty == NcaHashType::AutoSha3;
            match index {
                // ExeFS / logo partitions
                0 | 2 => {
                    if sha3 {
                        NcaHashType::HierarchicalSha3256
                    } else {
                        NcaHashType::HierarchicalSha256
                    }
                }
                // RomFS
                1 => {
                    if sha3 {
                        NcaHashType::HierarchicalIntegritySha3
                    } else {
                        NcaHashType::HierarchicalIntegrity
                    }
                }
                _ => {
                    return Err(SectionError::MalformedSection {
                        index,
                        what: "auto hash type on section 3",
                    })
                }
            }
        }
        ty => ty,
    };

    let encryption_type = if format_version == NcaVersion::Nca0 {
        NcaEncryptionType::AesXts
    } else {
        match header.encryption_type {
            NcaEncryptionType::Auto => match index {
                0 | 1 => NcaEncryptionType::AesCtr,
                2 => NcaEncryptionType::None,
                _ => {
                    return Err(SectionError::MalformedSection {
                        index,
                        what: "auto encryption type on section 3",
                    })
                }
            },
            ty => ty,
        }
    };

    let has_indirect = header.patch_info.has_indirect_layer();
    let has_aes_ctr_ex = header.patch_info.has_aes_ctr_ex_layer();

    let section_type = match header.fs_type {
        NcaFsType::PartitionFs => {
            let hash_ok = match hash_type {
                NcaHashType::None => encryption_type < NcaEncryptionType::AesCtrEx,
                NcaHashType::HierarchicalSha256 | NcaHashType::HierarchicalSha3256 => {
                    encryption_type < NcaEncryptionType::AesCtrEx
                        || encryption_type == NcaEncryptionType::AesCtrSkipLayerHash
                }
                _ => false,
            };
            if !hash_ok {
                return Err(SectionError::MalformedSection {
                    index,
                    what: "partition fs hash/encryption combination",
                });
            }
            FsSectionType::PartitionFs
        }
        NcaFsType::RomFs => match hash_type {
            NcaHashType::None
            | NcaHashType::HierarchicalIntegrity
            | NcaHashType::HierarchicalIntegritySha3 => {
                if has_indirect && has_aes_ctr_ex {
                    let enc_ok = matches!(
                        encryption_type,
                        NcaEncryptionType::None | NcaEncryptionType::AesCtrEx
                    ) || (encryption_type == NcaEncryptionType::AesCtrExSkipLayerHash
                        && hash_type != NcaHashType::None);
                    if !enc_ok {
                        return Err(SectionError::MalformedSection {
                            index,
                            what: "patch romfs encryption type",
                        });
                    }
                    FsSectionType::PatchRomFs
                } else if !has_indirect && !has_aes_ctr_ex {
                    let enc_ok = matches!(
                        encryption_type,
                        NcaEncryptionType::None
                            | NcaEncryptionType::AesXts
                            | NcaEncryptionType::AesCtr
                    ) || (encryption_type == NcaEncryptionType::AesCtrSkipLayerHash
                        && hash_type != NcaHashType::None);
                    if !enc_ok {
                        return Err(SectionError::MalformedSection {
                            index,
                            what: "romfs encryption type",
                        });
                    }
                    FsSectionType::RomFs
                } else {
                    return Err(SectionError::MalformedSection {
                        index,
                        what: "partial patch info",
                    });
                }
            }
            NcaHashType::HierarchicalSha256 if format_version == NcaVersion::Nca0 => {
                FsSectionType::Nca0RomFs
            }
            _ => {
                return Err(SectionError::MalformedSection {
                    index,
                    what: "romfs hash type",
                })
            }
        },
    };

    Ok(ResolvedTypes {
        hash_type,
        encryption_type,
        section_type,
    })
}

/// Extents of the hash-target region (the "user data" the outermost hash
/// tree covers), relative to the section start.
pub(super) fn hash_target_extents(
    hash_type: NcaHashType,
    hash_data: &HashData,
    section_size: u64,
) -> Option<(u64, u64)> {
    match (hash_type, hash_data) {
        (NcaHashType::None, _) => Some((0, section_size)),
        (
            NcaHashType::HierarchicalSha256 | NcaHashType::HierarchicalSha3256,
            HashData::HierarchicalSha256(data),
        ) => {
            let count = data.hash_region_count as usize;
            if count == 0 || count > data.hash_regions.len() {
                return None;
            }
            let region = data.hash_regions[count - 1];
            Some((region.offset, region.size))
        }
        (
            NcaHashType::HierarchicalIntegrity | NcaHashType::HierarchicalIntegritySha3,
            HashData::HierarchicalIntegrity(info),
        ) => {
            let count = info.max_level_count as usize;
            if count < 2 || count > info.levels.len() + 1 {
                return None;
            }
            let level = info.levels[count - 2];
            Some((level.offset, level.size))
        }
        _ => None,
    }
}

impl<S: ReadableStorage> FsSection<S> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        storage: SharedStorage<S>,
        header: NcaFsHeader,
        encrypted_header: Vec<u8>,
        index: usize,
        section_offset: u64,
        section_size: u64,
        content_size: u64,
        format_version: NcaVersion,
        content_ctr_key: Option<AesKey>,
        crypt_for: impl FnOnce(NcaEncryptionType) -> SectionCrypt,
    ) -> Result<Self, SectionError> {
        if section_offset < NCA_HEADER_SIZE as u64 || section_size == 0 {
            return Err(SectionError::MalformedSection {
                index,
                what: "section extents",
            });
        }

        let resolved = resolve_types(&header, index, format_version)?;

        let mut section_size = section_size;
        let mut sparse_table_offset = None;
        let mut skip_extent_checks = false;

        if header.has_sparse_layer() {
            if format_version == NcaVersion::Nca0 {
                return Err(SectionError::UnsupportedCombination { index });
            }

            let sparse_info = &header.sparse_info;
            let bucket = &sparse_info.bucket;
            let raw_storage_offset = sparse_info.physical_offset;
            let raw_storage_size = bucket.offset + bucket.size;

            if raw_storage_offset < NCA_HEADER_SIZE as u64
                || raw_storage_offset + raw_storage_size > content_size
            {
                return Err(SectionError::MalformedSection {
                    index,
                    what: "sparse info extents",
                });
            }

            if raw_storage_size != 0 && bucket.header.entry_count != 0 {
                sparse_table_offset = Some(raw_storage_offset + bucket.offset);
                section_size = raw_storage_size;
            } else {
                warn!(section = index, "empty sparse table, skipping extent checks");
                skip_extent_checks = true;
            }
        }

        if !skip_extent_checks && section_offset + section_size > content_size {
            return Err(SectionError::MalformedSection {
                index,
                what: "section out of content bounds",
            });
        }

        let (hash_target_offset, hash_target_size) =
            hash_target_extents(resolved.hash_type, &header.hash_data, section_size).ok_or(
                SectionError::MalformedSection {
                    index,
                    what: "hash target extents",
                },
            )?;

        // the hash layers live in [0, hash_target_offset); for patch and
        // sparse sections they may exceed what is physically present, but
        // everything has to fit otherwise
        if resolved.section_type != FsSectionType::PatchRomFs
            && !header.has_sparse_layer()
            && (hash_target_offset > section_size
                || section_offset + hash_target_offset > content_size)
        {
            return Err(SectionError::MalformedSection {
                index,
                what: "hash layer region out of bounds",
            });
        }

        let skip_hash_layer_crypto = matches!(
            resolved.encryption_type,
            NcaEncryptionType::AesCtrSkipLayerHash | NcaEncryptionType::AesCtrExSkipLayerHash
        );
        if skip_hash_layer_crypto && resolved.hash_type == NcaHashType::None {
            return Err(SectionError::MalformedSection {
                index,
                what: "skip-layer-hash crypto without a hash tree",
            });
        }

        if header.has_compression_layer() {
            let bucket = &header.compression_info.bucket;
            if bucket.header.entry_count == 0 {
                return Err(SectionError::MalformedSection {
                    index,
                    what: "compression bucket entry count",
                });
            }

            if resolved.section_type != FsSectionType::PatchRomFs && !header.has_sparse_layer() {
                let bucket_offset = hash_target_offset + bucket.offset;
                if bucket_offset < NCA_HEADER_SIZE as u64
                    || bucket_offset + bucket.size > section_size
                    || section_offset + bucket_offset + bucket.size > content_size
                {
                    return Err(SectionError::MalformedSection {
                        index,
                        what: "compression bucket extents",
                    });
                }
            }
        }

        let crypt = crypt_for(resolved.encryption_type);

        Ok(Self {
            storage,
            header,
            encrypted_header,
            index,
            section_offset,
            section_size,
            content_size,
            format_version,
            hash_type: resolved.hash_type,
            encryption_type: resolved.encryption_type,
            section_type: resolved.section_type,
            skip_hash_layer_crypto,
            hash_target_offset,
            hash_target_size,
            sparse_table_offset,
            crypt,
            content_ctr_key,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn header(&self) -> &NcaFsHeader {
        &self.header
    }

    pub fn section_type(&self) -> FsSectionType {
        self.section_type
    }

    pub fn hash_type(&self) -> NcaHashType {
        self.hash_type
    }

    pub fn encryption_type(&self) -> NcaEncryptionType {
        self.encryption_type
    }

    pub fn section_offset(&self) -> u64 {
        self.section_offset
    }

    pub fn section_size(&self) -> u64 {
        self.section_size
    }

    /// Start of the hash-target region; the hash layers occupy everything
    /// before it.
    pub fn hash_target_offset(&self) -> u64 {
        self.hash_target_offset
    }

    pub fn hash_target_size(&self) -> u64 {
        self.hash_target_size
    }

    pub fn has_sparse_layer(&self) -> bool {
        self.header.has_sparse_layer()
    }

    pub fn has_compression_layer(&self) -> bool {
        self.header.has_compression_layer()
    }

    pub fn skip_hash_layer_crypto(&self) -> bool {
        self.skip_hash_layer_crypto
    }

    pub(super) fn content_ctr_key(&self) -> Result<AesKey, SectionError> {
        self.content_ctr_key.ok_or(SectionError::MissingTitleKey {})
    }

    pub(super) fn sparse_table_offset(&self) -> Option<u64> {
        self.sparse_table_offset
    }

    /// Reads decrypted section bytes at `offset`. This is the leaf of the
    /// storage stack; bucket-tree layers sit on top of it.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), SectionError> {
        self.read_with_iv(offset, buf, None)
    }

    /// Same as [`read`](Self::read), with the counter derived from an
    /// overridden absolute offset. Sparse layers pass the virtual offset
    /// here, since their counters predate relocation.
    pub fn read_with_iv(
        &self,
        offset: u64,
        buf: &mut [u8],
        iv_offset: Option<u64>,
    ) -> Result<(), SectionError> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > self.section_size {
            return Err(SectionError::OutOfRange {});
        }

        let content_offset = self.section_offset + offset;
        if content_offset + buf.len() as u64 > self.content_size {
            return Err(SectionError::OutOfRange {});
        }

        // skip-layer-hash sections keep the hash-tree layers in plaintext;
        // split the read at the region boundary. The layer region always
        // starts at offset zero, so the plaintext part (if any) comes first.
        if let Some(plain_size) = self.plaintext_hash_region_overlap(offset, buf.len() as u64) {
            let (head, tail) = buf.split_at_mut(plain_size as usize);

            self.read_content(content_offset, head)?;

            if !tail.is_empty() {
                let tail_offset = offset + plain_size;
                self.read_encrypted(tail_offset, tail, iv_offset.map(|iv| iv + plain_size))?;
            }

            return Ok(());
        }

        self.read_encrypted(offset, buf, iv_offset)
    }

    /// Decrypting read without the plaintext-region handling.
    fn read_encrypted(
        &self,
        offset: u64,
        buf: &mut [u8],
        iv_offset: Option<u64>,
    ) -> Result<(), SectionError> {
        let content_offset = self.section_offset + offset;

        match &self.crypt {
            SectionCrypt::None => self.read_content(content_offset, buf),
            SectionCrypt::Unavailable => Err(SectionError::MissingTitleKey {}),
            SectionCrypt::Xts { key } => {
                let align = XTS_SECTOR_SIZE as u64;
                let block_start = content_offset / align * align;
                let block_end = (content_offset + buf.len() as u64).div_ceil(align) * align;

                let mut block = vec![0u8; (block_end - block_start) as usize];
                self.read_content(block_start, &mut block)?;

                // NCA0 sections count sectors from the end of the archive
                // header, newer formats from the section start
                let sector = match self.format_version {
                    NcaVersion::Nca0 => (block_start - NCA_HEADER_SIZE as u64) / align,
                    _ => (block_start - self.section_offset) / align,
                };
                key.decrypt(&mut block, sector, XTS_SECTOR_SIZE);

                let skip = (content_offset - block_start) as usize;
                buf.copy_from_slice(&block[skip..skip + buf.len()]);
                Ok(())
            }
            SectionCrypt::Ctr { key, upper_iv } => {
                let iv_base = self.section_offset + iv_offset.unwrap_or(offset);

                let align = AES_BLOCK_SIZE as u64;
                let block_start = content_offset / align * align;
                let block_end = (content_offset + buf.len() as u64).div_ceil(align) * align;
                let lead = (content_offset - block_start) as usize;

                if lead == 0 && (block_end - block_start) as usize == buf.len() {
                    self.read_content(content_offset, buf)?;
                    let ctr = ctr_init_partial(*upper_iv, iv_base);
                    key.crypt_ctr(buf, &ctr);
                    Ok(())
                } else {
                    let mut block = vec![0u8; (block_end - block_start) as usize];
                    self.read_content(block_start, &mut block)?;
                    let ctr = ctr_init_partial(*upper_iv, iv_base / align * align);
                    key.crypt_ctr(&mut block, &ctr);
                    buf.copy_from_slice(&block[lead..lead + buf.len()]);
                    Ok(())
                }
            }
        }
    }

    /// CTR-EX read: same leaf bytes, but the counter is keyed off the
    /// entry's generation and crypto may be disabled per range.
    pub fn read_ctr_ex(
        &self,
        offset: u64,
        buf: &mut [u8],
        generation: u32,
        decrypt: bool,
    ) -> Result<(), SectionError> {
        if buf.is_empty() {
            return Ok(());
        }
        if self.section_type != FsSectionType::PatchRomFs {
            return Err(SectionError::MalformedSection {
                index: self.index,
                what: "ctr-ex read outside a patch section",
            });
        }
        if offset + buf.len() as u64 > self.section_size {
            return Err(SectionError::OutOfRange {});
        }

        let content_offset = self.section_offset + offset;

        if !decrypt {
            return self.read_content(content_offset, buf);
        }

        let key = self.content_ctr_key()?;

        let align = AES_BLOCK_SIZE as u64;
        let block_start = content_offset / align * align;
        let block_end = (content_offset + buf.len() as u64).div_ceil(align) * align;
        let lead = (content_offset - block_start) as usize;

        if lead == 0 && (block_end - block_start) as usize == buf.len() {
            self.read_content(content_offset, buf)?;
            let ctr = ctr_init_partial_ex(generation, content_offset);
            key.crypt_ctr(buf, &ctr);
            Ok(())
        } else {
            let mut block = vec![0u8; (block_end - block_start) as usize];
            self.read_content(block_start, &mut block)?;
            let ctr = ctr_init_partial_ex(generation, block_start);
            key.crypt_ctr(&mut block, &ctr);
            buf.copy_from_slice(&block[lead..lead + buf.len()]);
            Ok(())
        }
    }

    /// Raw bytes from the content file.
    fn read_content(&self, content_offset: u64, buf: &mut [u8]) -> Result<(), SectionError> {
        self.storage.read(content_offset, buf).context(StorageSnafu)
    }

    /// Length of the head of `[offset, offset+size)` that falls inside the
    /// plaintext hash-layer region, when skip-layer-hash crypto applies.
    fn plaintext_hash_region_overlap(&self, offset: u64, size: u64) -> Option<u64> {
        if !self.skip_hash_layer_crypto {
            return None;
        }

        let region_end = self.hash_target_offset;
        if offset < region_end {
            Some(std::cmp::min(region_end - offset, size))
        } else {
            None
        }
    }
}
