use crate::hexstring::HexData;
use crate::ids::ContentId;
use crate::version::Version;
use binrw::{BinRead, BinWrite};
use bitflags::bitflags;

pub const PACKAGED_HEADER_SIZE: u64 = 0x20;
pub const PACKAGED_CONTENT_INFO_SIZE: u64 = 0x38;
pub const CONTENT_META_INFO_SIZE: u64 = 0x10;
pub const DIGEST_SIZE: u64 = 0x20;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum ContentMetaType {
    SystemProgram = 1,
    SystemData = 2,
    SystemUpdate = 3,
    BootImagePackage = 4,
    BootImagePackageSafe = 5,
    Application = 0x80,
    Patch = 0x81,
    AddOnContent = 0x82,
    Delta = 0x83,
    DataPatch = 0x84,
}

impl ContentMetaType {
    /// The `<type>_<titleid>.cnmt` filename prefix.
    pub fn name(&self) -> &'static str {
        match self {
            ContentMetaType::SystemProgram => "SystemProgram",
            ContentMetaType::SystemData => "SystemData",
            ContentMetaType::SystemUpdate => "SystemUpdate",
            ContentMetaType::BootImagePackage => "BootImagePackage",
            ContentMetaType::BootImagePackageSafe => "BootImagePackageSafe",
            ContentMetaType::Application => "Application",
            ContentMetaType::Patch => "Patch",
            ContentMetaType::AddOnContent => "AddOnContent",
            ContentMetaType::Delta => "Delta",
            ContentMetaType::DataPatch => "DataPatch",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "SystemProgram" => ContentMetaType::SystemProgram,
            "SystemData" => ContentMetaType::SystemData,
            "SystemUpdate" => ContentMetaType::SystemUpdate,
            "BootImagePackage" => ContentMetaType::BootImagePackage,
            "BootImagePackageSafe" => ContentMetaType::BootImagePackageSafe,
            "Application" => ContentMetaType::Application,
            "Patch" => ContentMetaType::Patch,
            "AddOnContent" => ContentMetaType::AddOnContent,
            "Delta" => ContentMetaType::Delta,
            "DataPatch" => ContentMetaType::DataPatch,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum StorageId {
    None = 0,
    Host = 1,
    GameCard = 2,
    BuiltInSystem = 3,
    BuiltInUser = 4,
    SdCard = 5,
    Any = 6,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum ContentInstallType {
    Full = 0,
    FragmentOnly = 1,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct ContentMetaAttribute(pub u8);
bitflags! {
    impl ContentMetaAttribute: u8 {
        const INCLUDES_EXFAT_DRIVER = 0x01;
        const REBOOTLESS = 0x02;
        const COMPACTED = 0x04;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcmContentType {
    Meta = 0,
    Program = 1,
    Data = 2,
    Control = 3,
    HtmlDocument = 4,
    LegalInformation = 5,
    DeltaFragment = 6,
}

impl NcmContentType {
    pub fn name(&self) -> &'static str {
        match self {
            NcmContentType::Meta => "Meta",
            NcmContentType::Program => "Program",
            NcmContentType::Data => "Data",
            NcmContentType::Control => "Control",
            NcmContentType::HtmlDocument => "HtmlDocument",
            NcmContentType::LegalInformation => "LegalInformation",
            NcmContentType::DeltaFragment => "DeltaFragment",
        }
    }
}

/// First 0x20 bytes of the packaged content meta.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct PackagedContentMetaHeader {
    pub title_id: u64,
    pub version: Version,
    pub content_meta_type: ContentMetaType,
    pub platform: u8,
    pub extended_header_size: u16,
    pub content_count: u16,
    pub content_meta_count: u16,
    pub attributes: ContentMetaAttribute,
    pub storage_id: StorageId,
    pub content_install_type: ContentInstallType,
    pub install_state: u8,
    #[brw(pad_after = 4)]
    pub required_download_system_version: Version,
}

/// Per-type extended header, discriminated by the meta type; the declared
/// size must match the variant layout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little)]
#[br(import(meta_type: ContentMetaType, extended_header_size: u16))]
pub enum ExtendedHeader {
    #[br(pre_assert(meta_type == ContentMetaType::SystemUpdate && extended_header_size == 4))]
    SystemUpdate { extended_data_size: u32 },
    #[br(pre_assert(meta_type == ContentMetaType::Application && extended_header_size == 0x10))]
    Application {
        patch_id: u64,
        required_system_version: Version,
        required_application_version: Version,
    },
    #[br(pre_assert(meta_type == ContentMetaType::Patch && extended_header_size == 0x18))]
    Patch {
        application_id: u64,
        required_system_version: Version,
        #[brw(pad_after = 8)]
        extended_data_size: u32,
    },
    #[br(pre_assert(meta_type == ContentMetaType::AddOnContent && extended_header_size == 0x18))]
    AddOnContent {
        application_id: u64,
        required_application_version: Version,
        #[brw(pad_after = 3)]
        content_accessibilities: u8,
        data_patch_id: u64,
    },
    #[br(pre_assert(meta_type == ContentMetaType::AddOnContent && extended_header_size == 0x10))]
    AddOnContentLegacy {
        application_id: u64,
        #[brw(pad_after = 4)]
        required_application_version: Version,
    },
    #[br(pre_assert(meta_type == ContentMetaType::Delta && extended_header_size == 0x10))]
    Delta {
        application_id: u64,
        #[brw(pad_after = 4)]
        extended_data_size: u32,
    },
    #[br(pre_assert(meta_type == ContentMetaType::DataPatch && extended_header_size == 0x18))]
    DataPatch {
        data_id: u64,
        #[brw(pad_after = 0xc)]
        extended_data_size: u32,
    },
    #[br(pre_assert(extended_header_size == 0))]
    None,
}

impl ExtendedHeader {
    pub fn extended_data_size(&self) -> u32 {
        match *self {
            ExtendedHeader::SystemUpdate { extended_data_size }
            | ExtendedHeader::Patch {
                extended_data_size, ..
            }
            | ExtendedHeader::Delta {
                extended_data_size, ..
            }
            | ExtendedHeader::DataPatch {
                extended_data_size, ..
            } => extended_data_size,
            _ => 0,
        }
    }

    /// Versions required by the system / the base application, for the
    /// authoring descriptor.
    pub fn required_system_version(&self) -> Option<Version> {
        match *self {
            ExtendedHeader::Application {
                required_system_version,
                ..
            }
            | ExtendedHeader::Patch {
                required_system_version,
                ..
            } => Some(required_system_version),
            _ => None,
        }
    }

    pub fn required_application_version(&self) -> Option<Version> {
        match *self {
            ExtendedHeader::Application {
                required_application_version,
                ..
            }
            | ExtendedHeader::AddOnContent {
                required_application_version,
                ..
            }
            | ExtendedHeader::AddOnContentLegacy {
                required_application_version,
                ..
            } => Some(required_application_version),
            _ => None,
        }
    }
}

/// Per-content record: hash + id + 5-byte size + type.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct PackagedContentInfo {
    pub hash: HexData<0x20>,
    pub content_id: ContentId,
    #[br(parse_with = crate::brw_utils::read_u40)]
    #[bw(write_with = crate::brw_utils::write_u40)]
    pub size: u64,
    pub attributes: u8,
    pub content_type: NcmContentType,
    pub id_offset: u8,
}

/// Child meta record, only present for SystemUpdate metas.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct ContentMetaInfo {
    pub title_id: u64,
    pub version: Version,
    pub content_meta_type: ContentMetaType,
    #[brw(pad_after = 2)]
    pub attributes: ContentMetaAttribute,
}
