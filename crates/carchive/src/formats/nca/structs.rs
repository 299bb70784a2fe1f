use crate::crypto::keyset::KeyAreaKeyIndex;
use crate::crypto::{EncryptedAesKey, EncryptedAesXtsKey};
use crate::formats::bktr::BucketInfo;
use crate::hexstring::HexData;
use crate::ids::{RightsId, TitleId};
use binrw::{BinRead, BinWrite};
use std::fmt::Debug;

pub const NCA_HEADER_SIZE: usize = 0x400;
pub const NCA_FS_HEADER_SIZE: usize = 0x200;
pub const NCA_FS_HEADER_COUNT: usize = 4;
pub const NCA_FULL_HEADER_SIZE: usize = NCA_HEADER_SIZE + NCA_FS_HEADER_COUNT * NCA_FS_HEADER_SIZE;
/// Section extents are stored in 0x200-byte media units.
pub const NCA_MEDIA_UNIT: u64 = 0x200;

pub const IVFC_LEVEL_COUNT: usize = 6;
pub const SHA256_MAX_REGION_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaContentType {
    Program = 0,
    Meta = 1,
    Control = 2,
    Manual = 3,
    Data = 4,
    PublicData = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum DistributionType {
    Download = 0,
    GameCard = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaEncryptionType {
    Auto = 0,
    None = 1,
    AesXts = 2,
    AesCtr = 3,
    AesCtrEx = 4,
    AesCtrSkipLayerHash = 5,
    AesCtrExSkipLayerHash = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaHashType {
    Auto = 0,
    None = 1,
    HierarchicalSha256 = 2,
    HierarchicalIntegrity = 3,
    AutoSha3 = 4,
    HierarchicalSha3256 = 5,
    HierarchicalIntegritySha3 = 6,
}

impl NcaHashType {
    pub fn uses_sha3(&self) -> bool {
        matches!(
            self,
            NcaHashType::HierarchicalSha3256 | NcaHashType::HierarchicalIntegritySha3
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaFsType {
    RomFs = 0,
    PartitionFs = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum MetaDataHashType {
    None = 0,
    HierarchicalIntegrity = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct NcaSignature(pub HexData<0x100>);

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub enum NcaMagic {
    #[brw(magic = b"NCA0")]
    Nca0,
    #[brw(magic = b"NCA2")]
    Nca2,
    #[brw(magic = b"NCA3")]
    Nca3,
}

/// Section extents in media units.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct NcaFsInfo {
    pub start_sector: u32,
    pub end_sector: u32,
    pub hash_sector_size: u32,
    pub reserved: u32,
}

impl NcaFsInfo {
    /// A populated entry is anything other than an all-zero record.
    pub fn is_enabled(&self) -> bool {
        self.start_sector != 0
            || self.end_sector != 0
            || self.hash_sector_size != 0
            || self.reserved != 0
    }

    pub fn start_offset(&self) -> u64 {
        self.start_sector as u64 * NCA_MEDIA_UNIT
    }

    pub fn size(&self) -> u64 {
        (self.end_sector as u64).saturating_sub(self.start_sector as u64) * NCA_MEDIA_UNIT
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct Sha256Hash(pub HexData<0x20>);

impl Sha256Hash {
    pub fn verify(&self, data: &[u8]) -> bool {
        crate::crypto::sha256(data) == self.0 .0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct NcaKeyArea {
    pub encrypted_xts_key: EncryptedAesXtsKey,
    pub encrypted_ctr_key: EncryptedAesKey,
    pub encrypted_ctr_ex_key: EncryptedAesKey,
}

/// The first 0x400 bytes of the decrypted content archive. The fixed-key
/// signature covers bytes 0x200..0x400 (everything from the magic onwards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaHeader {
    pub main_signature: NcaSignature,
    pub acid_signature: NcaSignature,
    pub magic: NcaMagic,
    pub distribution_type: DistributionType,
    pub content_type: NcaContentType,
    pub key_generation_old: u8,
    pub key_area_key_index: KeyAreaKeyIndex,
    pub content_size: u64,
    pub program_id: TitleId,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation: u8,
    #[brw(pad_after = 0xe)]
    pub main_signature_key_generation: u8,
    pub rights_id: RightsId,
    pub fs_info: [NcaFsInfo; NCA_FS_HEADER_COUNT],
    pub fs_header_hashes: [Sha256Hash; NCA_FS_HEADER_COUNT],
    #[brw(pad_after = 0xc0)]
    pub key_area: NcaKeyArea,
}

impl NcaHeader {
    /// Raw key generation: the larger of the two generation bytes.
    pub fn key_generation_value(&self) -> u8 {
        std::cmp::max(self.key_generation_old, self.key_generation)
    }

    /// Master-key revision used for keyset lookups.
    pub fn key_generation_revision(&self) -> u8 {
        self.key_generation_value().saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct HashRegion {
    pub offset: u64,
    pub size: u64,
}

/// Hash data for PFS-carrying sections: a flat stack of up to five hash
/// regions, the last one being the actual filesystem bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct HierarchicalSha256Data {
    pub master_hash: Sha256Hash,
    pub hash_block_size: u32,
    pub hash_region_count: u32,
    pub hash_regions: [HashRegion; SHA256_MAX_REGION_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct IvfcLevel {
    pub offset: u64,
    pub size: u64,
    /// log2 of the level's hash block size
    pub block_order: u32,
    pub reserved: u32,
}

impl IvfcLevel {
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_order
    }
}

/// Hash data for RoIFS-carrying sections: the 6-level integrity tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(magic = b"IVFC")]
pub struct IntegrityMetaInfo {
    pub version: u32,
    pub master_hash_size: u32,
    pub max_level_count: u32,
    pub levels: [IvfcLevel; IVFC_LEVEL_COUNT],
    pub signature_salt: HexData<0x20>,
    pub master_hash: Sha256Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(import(hash_type: NcaHashType))]
pub enum HashData {
    #[br(pre_assert(matches!(hash_type, NcaHashType::None | NcaHashType::Auto | NcaHashType::AutoSha3)))]
    None,
    #[br(pre_assert(matches!(hash_type, NcaHashType::HierarchicalSha256 | NcaHashType::HierarchicalSha3256)))]
    HierarchicalSha256(HierarchicalSha256Data),
    #[br(pre_assert(matches!(hash_type, NcaHashType::HierarchicalIntegrity | NcaHashType::HierarchicalIntegritySha3)))]
    HierarchicalIntegrity(IntegrityMetaInfo),
}

/// Patch sections carry two trees: the indirect relocation table and the
/// CTR-EX encryption table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct PatchInfo {
    pub indirect_bucket: BucketInfo,
    pub aes_ctr_ex_bucket: BucketInfo,
}

impl PatchInfo {
    pub fn has_indirect_layer(&self) -> bool {
        !self.indirect_bucket.is_empty()
    }

    pub fn has_aes_ctr_ex_layer(&self) -> bool {
        !self.aes_ctr_ex_bucket.is_empty()
    }

    pub fn zeroed() -> Self {
        Self {
            indirect_bucket: BucketInfo::zeroed(),
            aes_ctr_ex_bucket: BucketInfo::zeroed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct SparseInfo {
    pub bucket: BucketInfo,
    pub physical_offset: u64,
    #[brw(pad_after = 6)]
    pub generation: u16,
}

impl SparseInfo {
    pub fn zeroed() -> Self {
        Self {
            bucket: BucketInfo::zeroed(),
            physical_offset: 0,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct CompressionInfo {
    #[brw(pad_after = 8)]
    pub bucket: BucketInfo,
}

impl CompressionInfo {
    pub fn zeroed() -> Self {
        Self {
            bucket: BucketInfo::zeroed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct MetaDataHashDataInfo {
    pub table_offset: u64,
    pub table_size: u64,
    pub table_hash: Sha256Hash,
}

/// Decrypted 0x200-byte section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaFsHeader {
    pub version: u16,
    pub fs_type: NcaFsType,
    pub hash_type: NcaHashType,
    pub encryption_type: NcaEncryptionType,
    #[brw(pad_after = 2)]
    pub meta_data_hash_type: MetaDataHashType,

    #[br(args(hash_type))]
    #[brw(pad_size_to = 0xf8)]
    pub hash_data: HashData,

    pub patch_info: PatchInfo,

    pub upper_iv: u64,

    pub sparse_info: SparseInfo,

    pub compression_info: CompressionInfo,

    #[brw(pad_after = 0x30)]
    pub meta_data_hash_data_info: MetaDataHashDataInfo,
}

impl NcaFsHeader {
    pub fn is_patch_section(&self) -> bool {
        self.patch_info.has_indirect_layer()
    }

    pub fn has_sparse_layer(&self) -> bool {
        self.sparse_info.generation != 0
    }

    pub fn has_compression_layer(&self) -> bool {
        self.compression_info.bucket.offset != 0 && self.compression_info.bucket.size != 0
    }
}
