//! Packaged content-meta: the manifest listing every content archive of a
//! title plus per-content hashes. Lives as the single `.cnmt` entry of a
//! Meta archive's partition filesystem.

pub mod structs;

use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;
use tracing::debug;

use crate::crypto::sha256;
use crate::formats::nca::{HashTreePatch, Nca, SectionError};
use crate::formats::pfs::{PartitionFs, PartitionFsEntry, PfsError};
use crate::ids::ContentId;
use crate::storage::ReadableStorage;

pub use structs::{
    ContentInstallType, ContentMetaAttribute, ContentMetaInfo, ContentMetaType, ExtendedHeader,
    NcmContentType, PackagedContentInfo, PackagedContentMetaHeader, StorageId,
    CONTENT_META_INFO_SIZE, DIGEST_SIZE, PACKAGED_CONTENT_INFO_SIZE, PACKAGED_HEADER_SIZE,
};

#[derive(Snafu, Debug)]
pub enum CnmtError {
    /// CNMT: partition filesystem error
    Pfs { source: PfsError },
    /// CNMT: no `.cnmt` entry in the partition
    MissingEntry {},
    /// CNMT: malformed: {what}
    Malformed { what: &'static str },
    /// CNMT: failed to parse: {source}
    Parsing { source: binrw::Error },
    /// CNMT: the filename disagrees with the packaged header
    FilenameMismatch {},
    /// CNMT: no content record with id {content_id}
    UnknownContent { content_id: ContentId },
    /// CNMT: hash mismatch for content {content_id}
    HashMismatch { content_id: ContentId },
    /// CNMT: patch generation failed
    Patch { source: SectionError },
}

/// Parsed packaged content meta plus the raw blob it came from. The blob is
/// what gets patched and re-emitted, so every mutation keeps both in sync.
#[derive(Debug)]
pub struct ContentMeta {
    filename: String,
    entry: PartitionFsEntry,
    raw_data: Vec<u8>,
    /// SHA-256 of the blob as read; patch generation is elided while the
    /// live hash still matches.
    original_hash: [u8; 0x20],
    header: PackagedContentMetaHeader,
    extended_header: ExtendedHeader,
    content_infos: Vec<PackagedContentInfo>,
    content_meta_infos: Vec<ContentMetaInfo>,
    extended_data: Vec<u8>,
    digest: [u8; 0x20],
}

fn parse_cnmt_filename(filename: &str) -> Option<(ContentMetaType, u64)> {
    let stem = filename.strip_suffix(".cnmt")?;
    let (type_name, title_id) = stem.split_once('_')?;
    let meta_type = ContentMetaType::from_name(type_name)?;
    if title_id.len() != 16 {
        return None;
    }
    let title_id = u64::from_str_radix(title_id, 16).ok()?;
    Some((meta_type, title_id))
}

impl ContentMeta {
    /// Locates and parses the `.cnmt` entry of a Meta archive's partition
    /// filesystem.
    pub fn new<S: ReadableStorage>(pfs: &PartitionFs<S>) -> Result<Self, CnmtError> {
        let (index, filename) = (0..pfs.entry_count())
            .filter_map(|i| pfs.entry_name(i).map(|name| (i, name.to_string())))
            .find(|(_, name)| name.to_ascii_lowercase().ends_with(".cnmt"))
            .ok_or(CnmtError::MissingEntry {})?;

        debug!(filename, "found packaged content meta entry");

        let (filename_type, filename_title_id) =
            parse_cnmt_filename(&filename).ok_or(CnmtError::Malformed {
                what: "unparseable cnmt filename",
            })?;

        let entry = *pfs.entry(index).expect("index from enumeration");
        if entry.size < PACKAGED_HEADER_SIZE + DIGEST_SIZE {
            return Err(CnmtError::Malformed {
                what: "blob smaller than header plus digest",
            });
        }

        let raw_data = pfs.read_entry_to_vec(&entry).context(PfsSnafu)?;
        let original_hash = sha256(&raw_data);

        let mut cursor = Cursor::new(&raw_data);
        let header = PackagedContentMetaHeader::read(&mut cursor).context(ParsingSnafu)?;

        if header.title_id != filename_title_id || header.content_meta_type != filename_type {
            return Err(CnmtError::FilenameMismatch {});
        }

        let extended_header = ExtendedHeader::read_args(
            &mut cursor,
            (header.content_meta_type, header.extended_header_size),
        )
        .context(ParsingSnafu)?;

        // everything after the extended header is position-derived
        let mut offset = PACKAGED_HEADER_SIZE + header.extended_header_size as u64;

        let content_count = header.content_count as u64;
        let content_meta_count = header.content_meta_count as u64;
        let extended_data_size = extended_header.extended_data_size() as u64;

        let expected_size = offset
            + content_count * PACKAGED_CONTENT_INFO_SIZE
            + content_meta_count * CONTENT_META_INFO_SIZE
            + extended_data_size
            + DIGEST_SIZE;
        if expected_size != raw_data.len() as u64 {
            return Err(CnmtError::Malformed {
                what: "declared sizes do not add up to the blob size",
            });
        }

        let mut cursor = Cursor::new(&raw_data);
        cursor.set_position(offset);

        let mut content_infos = Vec::with_capacity(content_count as usize);
        for _ in 0..content_count {
            content_infos.push(PackagedContentInfo::read(&mut cursor).context(ParsingSnafu)?);
        }
        offset += content_count * PACKAGED_CONTENT_INFO_SIZE;

        let mut content_meta_infos = Vec::with_capacity(content_meta_count as usize);
        for _ in 0..content_meta_count {
            content_meta_infos.push(ContentMetaInfo::read(&mut cursor).context(ParsingSnafu)?);
        }
        offset += content_meta_count * CONTENT_META_INFO_SIZE;

        let extended_data =
            raw_data[offset as usize..(offset + extended_data_size) as usize].to_vec();
        offset += extended_data_size;

        let digest = raw_data[offset as usize..(offset + DIGEST_SIZE) as usize]
            .try_into()
            .unwrap();

        Ok(Self {
            filename,
            entry,
            raw_data,
            original_hash,
            header,
            extended_header,
            content_infos,
            content_meta_infos,
            extended_data,
            digest,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn header(&self) -> &PackagedContentMetaHeader {
        &self.header
    }

    pub fn extended_header(&self) -> &ExtendedHeader {
        &self.extended_header
    }

    pub fn meta_type(&self) -> ContentMetaType {
        self.header.content_meta_type
    }

    pub fn title_id(&self) -> u64 {
        self.header.title_id
    }

    pub fn content_infos(&self) -> &[PackagedContentInfo] {
        &self.content_infos
    }

    pub fn content_meta_infos(&self) -> &[ContentMetaInfo] {
        &self.content_meta_infos
    }

    pub fn extended_data(&self) -> &[u8] {
        &self.extended_data
    }

    pub fn digest(&self) -> &[u8; 0x20] {
        &self.digest
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    pub fn find_content(&self, content_id: &ContentId) -> Option<&PackagedContentInfo> {
        self.content_infos
            .iter()
            .find(|info| &info.content_id == content_id)
    }

    /// Compares a freshly computed content hash against the stored record.
    pub fn verify_content(
        &self,
        content_id: &ContentId,
        hash: &[u8; 0x20],
    ) -> Result<(), CnmtError> {
        let info = self.find_content(content_id).ok_or(CnmtError::UnknownContent {
            content_id: *content_id,
        })?;
        if &info.hash.0 != hash {
            return Err(CnmtError::HashMismatch {
                content_id: *content_id,
            });
        }
        Ok(())
    }

    /// Byte offset of the content record with the given index in the blob.
    fn content_info_offset(&self, index: usize) -> usize {
        (PACKAGED_HEADER_SIZE
            + self.header.extended_header_size as u64
            + index as u64 * PACKAGED_CONTENT_INFO_SIZE) as usize
    }

    /// Replaces a content record's id and hash in place (both the parsed
    /// view and the raw blob), after a content has been repacked.
    pub fn update_content(
        &mut self,
        content_id: &ContentId,
        new_content_id: ContentId,
        new_hash: [u8; 0x20],
    ) -> Result<(), CnmtError> {
        let index = self
            .content_infos
            .iter()
            .position(|info| &info.content_id == content_id)
            .ok_or(CnmtError::UnknownContent {
                content_id: *content_id,
            })?;

        self.content_infos[index].hash.0 = new_hash;
        self.content_infos[index].content_id = new_content_id;

        let at = self.content_info_offset(index);
        self.raw_data[at..at + 0x20].copy_from_slice(&new_hash);
        self.raw_data[at + 0x20..at + 0x30].copy_from_slice(&new_content_id.0);

        Ok(())
    }

    /// Whether the blob changed since parsing; patch generation is a no-op
    /// while this is false.
    pub fn is_dirty(&self) -> bool {
        sha256(&self.raw_data) != self.original_hash
    }

    /// Emits the partition-entry patch covering the whole `.cnmt` blob, or
    /// `None` when nothing changed since parsing.
    pub fn generate_patch<S, P>(
        &self,
        meta_nca: &mut Nca<S>,
        pfs: &PartitionFs<P>,
    ) -> Result<Option<HashTreePatch>, CnmtError>
    where
        S: ReadableStorage,
        P: ReadableStorage,
    {
        if !self.is_dirty() {
            return Ok(None);
        }

        let target_offset = pfs.entry_patch_offset(&self.entry, 0);
        let patch = meta_nca
            .generate_hash_tree_patch(0, &self.raw_data, target_offset)
            .context(PatchSnafu)?;

        Ok(Some(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::pfs::test_image;
    use crate::storage::VecStorage;
    use binrw::BinWrite;

    pub(crate) fn build_cnmt_blob(
        title_id: u64,
        contents: &[(ContentId, [u8; 0x20], u64, NcmContentType)],
    ) -> Vec<u8> {
        let mut blob = Vec::new();

        let header = PackagedContentMetaHeader {
            title_id,
            version: crate::version::Version(0x10000),
            content_meta_type: ContentMetaType::Application,
            platform: 0,
            extended_header_size: 0x10,
            content_count: contents.len() as u16,
            content_meta_count: 0,
            attributes: ContentMetaAttribute::empty(),
            storage_id: StorageId::None,
            content_install_type: ContentInstallType::Full,
            install_state: 0,
            required_download_system_version: crate::version::Version(0),
        };
        let mut cursor = Cursor::new(&mut blob);
        header.write(&mut cursor).unwrap();

        let extended = ExtendedHeader::Application {
            patch_id: title_id + 0x800,
            required_system_version: crate::version::Version(0),
            required_application_version: crate::version::Version(0),
        };
        extended.write(&mut cursor).unwrap();

        for (content_id, hash, size, content_type) in contents {
            PackagedContentInfo {
                hash: crate::HexData(*hash),
                content_id: *content_id,
                size: *size,
                attributes: 0,
                content_type: *content_type,
                id_offset: 0,
            }
            .write(&mut cursor)
            .unwrap();
        }

        blob.extend_from_slice(&[0u8; 0x20]); // digest
        blob
    }

    fn sample_ids() -> (ContentId, [u8; 0x20]) {
        let id: ContentId = "0102030405060708090a0b0c0d0e0f10".parse().unwrap();
        let hash = [0x42u8; 0x20];
        (id, hash)
    }

    #[test]
    fn parse_verify_and_update() {
        let (id, hash) = sample_ids();
        let blob = build_cnmt_blob(
            0x0100_0000_0001_0000,
            &[(id, hash, 0x1000, NcmContentType::Program)],
        );

        let image = test_image::build(&[("Application_0100000000010000.cnmt", &blob)]);
        let pfs = PartitionFs::new(VecStorage::new(image)).unwrap();

        let mut meta = ContentMeta::new(&pfs).unwrap();
        assert_eq!(meta.meta_type(), ContentMetaType::Application);
        assert_eq!(meta.title_id(), 0x0100_0000_0001_0000);
        assert_eq!(meta.content_infos().len(), 1);

        meta.verify_content(&id, &hash).unwrap();
        assert!(matches!(
            meta.verify_content(&id, &[0u8; 0x20]),
            Err(CnmtError::HashMismatch { .. })
        ));

        // unchanged metas elide patch generation entirely
        assert!(!meta.is_dirty());

        let new_id: ContentId = "ffeeddccbbaa99887766554433221100".parse().unwrap();
        let new_hash = [0x77u8; 0x20];
        meta.update_content(&id, new_id, new_hash).unwrap();
        assert!(meta.is_dirty());

        // the raw blob reparses to the updated record
        let reparsed_image =
            test_image::build(&[("Application_0100000000010000.cnmt", meta.raw_data())]);
        let reparsed_pfs = PartitionFs::new(VecStorage::new(reparsed_image)).unwrap();
        let reparsed = ContentMeta::new(&reparsed_pfs).unwrap();
        assert_eq!(reparsed.content_infos()[0].content_id, new_id);
        assert_eq!(reparsed.content_infos()[0].hash.0, new_hash);
    }

    #[test]
    fn filename_mismatch_is_rejected() {
        let (id, hash) = sample_ids();
        let blob = build_cnmt_blob(
            0x0100_0000_0001_0000,
            &[(id, hash, 0x1000, NcmContentType::Program)],
        );

        // title id in the filename differs from the header
        let image = test_image::build(&[("Application_0100000000099999.cnmt", &blob)]);
        let pfs = PartitionFs::new(VecStorage::new(image)).unwrap();
        assert!(matches!(
            ContentMeta::new(&pfs),
            Err(CnmtError::FilenameMismatch {})
        ));
    }

    #[test]
    fn filename_parsing() {
        assert_eq!(
            parse_cnmt_filename("Patch_0100000000010800.cnmt"),
            Some((ContentMetaType::Patch, 0x0100_0000_0001_0800))
        );
        assert_eq!(parse_cnmt_filename("Patch_123.cnmt"), None);
        assert_eq!(parse_cnmt_filename("Whatever_0100000000010800.cnmt"), None);
        assert_eq!(parse_cnmt_filename("no_extension"), None);
    }
}
