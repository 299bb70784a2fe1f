//! End-to-end archive tests over synthetic images: a complete NCA3 with an
//! AES-CTR partition-fs section is built in memory, opened, read back, and
//! patched through the hash-tree pipeline.

use binrw::BinWrite;
use std::io::Cursor;

use crate::crypto::keyset::KeySet;
use crate::crypto::{ctr_init_partial, sha256, AesKey, XTS_SECTOR_SIZE};
use crate::formats::nca::structs::*;
use crate::formats::nca::{FsSectionType, Nca, NcaVersion};
use crate::formats::pfs::{test_image, SectionPartitionFs};
use crate::hexstring::HexData;
use crate::ids::{RightsId, TitleId};
use crate::storage::VecStorage;

const SECTION_OFFSET: u64 = 0xc00;
const HASH_BLOCK_SIZE: u64 = 0x1000;
const DATA_REGION_OFFSET: u64 = 0x1000;
const DATA_REGION_SIZE: u64 = 0x2000;

fn test_keyset() -> KeySet {
    KeySet::from_file_contents(
        "header_key = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f\n\
         key_area_key_application_00 = 2b7e151628aed2a6abf7158809cf4f3c\n\
         titlekek_00 = 303132333435363738393a3b3c3d3e3f\n",
        "",
    )
    .unwrap()
}

fn content_ctr_key() -> AesKey {
    AesKey(HexData([0x77; 0x10]))
}

struct TestArchive {
    content: Vec<u8>,
    pfs_image: Vec<u8>,
    hash_block_size: u64,
    data_region_offset: u64,
    data_region_size: u64,
}

/// Builds a complete encrypted NCA3 with one HierarchicalSha256 partition-fs
/// section, using the default layout.
fn build_archive() -> TestArchive {
    build_archive_sized(HASH_BLOCK_SIZE, DATA_REGION_OFFSET, DATA_REGION_SIZE, 0x1000)
}

/// Same, with a custom hash layout and `main` entry size, so tests can shape
/// the top hash-table layer.
fn build_archive_sized(
    hash_block_size: u64,
    data_region_offset: u64,
    data_region_size: u64,
    main_size: u32,
) -> TestArchive {
    let key_set = test_keyset();
    let section_size = data_region_offset + data_region_size;

    // partition image: an ExeFS-looking pair of entries
    let npdm = {
        let mut data = vec![0u8; 0x100];
        data[..4].copy_from_slice(b"META");
        data
    };
    let main: Vec<u8> = (0..main_size).map(|i| (i % 253) as u8).collect();
    let pfs_image = test_image::build(&[("main.npdm", &npdm), ("main", &main)]);
    assert!(pfs_image.len() as u64 <= data_region_size);

    // plaintext section: level-0 hashes, padding, then the data region
    let mut data_region = pfs_image.clone();
    data_region.resize(data_region_size as usize, 0);

    let mut level0 = Vec::new();
    for block in data_region.chunks(hash_block_size as usize) {
        level0.extend_from_slice(&sha256(block));
    }
    assert!(level0.len() as u64 <= data_region_offset);
    let master_hash = sha256(&level0);

    let mut section = vec![0u8; section_size as usize];
    section[..level0.len()].copy_from_slice(&level0);
    section[data_region_offset as usize..].copy_from_slice(&data_region);

    let upper_iv = 0xdead_beef_0000_4242u64;

    // encrypt the section
    let ctr = ctr_init_partial(upper_iv, SECTION_OFFSET);
    content_ctr_key().crypt_ctr(&mut section, &ctr);

    // section header
    let fs_header = NcaFsHeader {
        version: 2,
        fs_type: NcaFsType::PartitionFs,
        hash_type: NcaHashType::HierarchicalSha256,
        encryption_type: NcaEncryptionType::AesCtr,
        meta_data_hash_type: MetaDataHashType::None,
        hash_data: HashData::HierarchicalSha256(HierarchicalSha256Data {
            master_hash: Sha256Hash(HexData(master_hash)),
            hash_block_size: hash_block_size as u32,
            hash_region_count: 2,
            hash_regions: [
                HashRegion {
                    offset: 0,
                    size: level0.len() as u64,
                },
                HashRegion {
                    offset: data_region_offset,
                    size: data_region_size,
                },
                HashRegion { offset: 0, size: 0 },
                HashRegion { offset: 0, size: 0 },
                HashRegion { offset: 0, size: 0 },
            ],
        }),
        patch_info: PatchInfo::zeroed(),
        upper_iv,
        sparse_info: SparseInfo::zeroed(),
        compression_info: CompressionInfo::zeroed(),
        meta_data_hash_data_info: MetaDataHashDataInfo {
            table_offset: 0,
            table_size: 0,
            table_hash: Sha256Hash(HexData([0; 0x20])),
        },
    };

    let mut fs_header_bytes = vec![0u8; NCA_FS_HEADER_SIZE];
    fs_header
        .write(&mut Cursor::new(&mut fs_header_bytes[..]))
        .unwrap();
    let fs_header_hash = sha256(&fs_header_bytes);

    // key area: the CTR slot wraps the content key with the KAEK
    let kaek = test_keyset()
        .key_area_key(crate::crypto::keyset::KeyAreaKeyIndex::Application, 0)
        .unwrap();
    let mut wrapped_ctr_key = content_ctr_key().0 .0;
    kaek.crypt_ecb(&mut wrapped_ctr_key, true);

    let content_size = SECTION_OFFSET + section_size;
    let header = NcaHeader {
        main_signature: NcaSignature(HexData([0; 0x100])),
        acid_signature: NcaSignature(HexData([0; 0x100])),
        magic: NcaMagic::Nca3,
        distribution_type: DistributionType::Download,
        content_type: NcaContentType::Data,
        key_generation_old: 0,
        key_area_key_index: crate::crypto::keyset::KeyAreaKeyIndex::Application,
        content_size,
        program_id: TitleId(0x0100_0000_0000_abcd),
        content_index: 0,
        sdk_version: 0x000c_0000,
        key_generation: 0,
        main_signature_key_generation: 0,
        rights_id: RightsId(HexData([0; 0x10])),
        fs_info: [
            NcaFsInfo {
                start_sector: (SECTION_OFFSET / NCA_MEDIA_UNIT) as u32,
                end_sector: (content_size / NCA_MEDIA_UNIT) as u32,
                hash_sector_size: 0,
                reserved: 0,
            },
            NcaFsInfo {
                start_sector: 0,
                end_sector: 0,
                hash_sector_size: 0,
                reserved: 0,
            },
            NcaFsInfo {
                start_sector: 0,
                end_sector: 0,
                hash_sector_size: 0,
                reserved: 0,
            },
            NcaFsInfo {
                start_sector: 0,
                end_sector: 0,
                hash_sector_size: 0,
                reserved: 0,
            },
        ],
        fs_header_hashes: [
            Sha256Hash(HexData(fs_header_hash)),
            Sha256Hash(HexData([0; 0x20])),
            Sha256Hash(HexData([0; 0x20])),
            Sha256Hash(HexData([0; 0x20])),
        ],
        key_area: NcaKeyArea {
            encrypted_xts_key: crate::crypto::EncryptedAesXtsKey(HexData([0; 0x20])),
            encrypted_ctr_key: crate::crypto::EncryptedAesKey(HexData(wrapped_ctr_key)),
            encrypted_ctr_ex_key: crate::crypto::EncryptedAesKey(HexData([0; 0x10])),
        },
    };

    let mut header_bytes = vec![0u8; NCA_HEADER_SIZE];
    header.write(&mut Cursor::new(&mut header_bytes[..])).unwrap();

    // encrypt the headers the way the console stores them
    let header_key = key_set.header_key().unwrap();
    header_key.encrypt(&mut header_bytes, 0, XTS_SECTOR_SIZE);
    header_key.encrypt(&mut fs_header_bytes, 2, XTS_SECTOR_SIZE);

    let mut content = vec![0u8; content_size as usize];
    content[..NCA_HEADER_SIZE].copy_from_slice(&header_bytes);
    content[NCA_HEADER_SIZE..NCA_HEADER_SIZE + NCA_FS_HEADER_SIZE]
        .copy_from_slice(&fs_header_bytes);
    content[SECTION_OFFSET as usize..].copy_from_slice(&section);

    TestArchive {
        content,
        pfs_image,
        hash_block_size,
        data_region_offset,
        data_region_size,
    }
}

fn open(content: Vec<u8>) -> Nca<VecStorage> {
    Nca::new(&test_keyset(), VecStorage::new(content), None).unwrap()
}

#[test]
fn open_and_inspect() {
    let archive = build_archive();
    let nca = open(archive.content);

    assert_eq!(nca.format_version(), NcaVersion::Nca3);
    assert_eq!(nca.content_type(), NcaContentType::Data);
    // unsigned test image: recorded, not rejected
    assert!(!nca.valid_main_signature());

    let section = nca.section(0).expect("section 0 is populated");
    assert_eq!(section.section_type(), FsSectionType::PartitionFs);
    assert_eq!(section.hash_type(), NcaHashType::HierarchicalSha256);
    assert_eq!(section.encryption_type(), NcaEncryptionType::AesCtr);
    assert_eq!(section.hash_target_offset(), DATA_REGION_OFFSET);
    assert!(nca.section(1).is_none());
}

#[test]
fn partition_fs_round_trip() {
    let archive = build_archive();
    let nca = open(archive.content);

    let storage = nca.open_section_storage(0).unwrap();

    // byte-exact plaintext across the hash target region
    let (target_offset, _) = storage.hash_target_extents();
    let mut raw = vec![0u8; archive.pfs_image.len()];
    storage.read(target_offset, &mut raw).unwrap();
    assert_eq!(raw, archive.pfs_image);

    // unaligned window
    let mut window = vec![0u8; 0x33];
    storage.read(target_offset + 0x11, &mut window).unwrap();
    assert_eq!(window, archive.pfs_image[0x11..0x44]);

    let fs = SectionPartitionFs::from_section(storage).unwrap();
    assert!(fs.is_exefs());
    assert_eq!(fs.entry_by_name("main"), Some(1));

    let entry = *fs.entry(1).unwrap();
    assert_eq!(entry.size, 0x1000);

    let mut buf = vec![0u8; 0x10];
    fs.read_entry(&entry, 0x200, &mut buf).unwrap();
    let expected: Vec<u8> = (0x200..0x210u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(buf, expected);
}

#[test]
fn hash_tree_patch_round_trip() {
    let archive = build_archive();
    let mut nca = open(archive.content.clone());

    // plaintext overwrite inside the `main` entry
    let new_data = vec![0xa5u8; 0x20];
    let (entry, data_offset) = {
        let storage = nca.open_section_storage(0).unwrap();
        let fs = SectionPartitionFs::from_section(storage).unwrap();
        let entry = *fs.entry(1).unwrap();
        (entry, fs.entry_patch_offset(&entry, 0x100))
    };

    let mut patch = nca
        .generate_hash_tree_patch(0, &new_data, data_offset)
        .unwrap();
    // one region per hash level: the target layer block and the level-0
    // hash slice
    assert_eq!(patch.regions.len(), 2);

    let header_patch = nca.encrypt_headers(&test_keyset()).unwrap();

    // apply every region at its absolute content offset
    let mut patched = archive.content.clone();
    for region in patch
        .regions
        .iter()
        .chain(header_patch.regions.iter())
    {
        let at = region.offset as usize;
        patched[at..at + region.data.len()].copy_from_slice(&region.data);
    }

    // the streamed application path must agree with direct application
    let mut streamed = archive.content.clone();
    patch.write_to_buffer(&mut streamed[..], 0);
    assert!(patch.written);
    for region in &patch.regions {
        let at = region.offset as usize;
        assert_eq!(
            &streamed[at..at + region.data.len()],
            &patched[at..at + region.data.len()]
        );
    }

    // reopen the patched image: headers verify, data reads back patched
    let reopened = open(patched);
    let storage = reopened.open_section_storage(0).unwrap();
    let fs = SectionPartitionFs::from_section(storage).unwrap();

    let mut buf = vec![0u8; 0x20];
    fs.read_entry(&entry, 0x100, &mut buf).unwrap();
    assert_eq!(buf, new_data);

    // neighboring bytes survived
    let mut before = vec![0u8; 0x10];
    fs.read_entry(&entry, 0xf0, &mut before).unwrap();
    let expected: Vec<u8> = (0xf0..0x100u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(before, expected);

    // the whole tree re-verifies against the rewritten master hash
    let storage = reopened.open_section_storage(0).unwrap();
    let mut data_region = vec![0u8; DATA_REGION_SIZE as usize];
    storage.read(DATA_REGION_OFFSET, &mut data_region).unwrap();

    let mut level0 = Vec::new();
    for block in data_region.chunks(HASH_BLOCK_SIZE as usize) {
        level0.extend_from_slice(&sha256(block));
    }

    let mut stored_level0 = vec![0u8; level0.len()];
    storage.read(0, &mut stored_level0).unwrap();
    assert_eq!(stored_level0, level0);

    let section = reopened.section(0).unwrap();
    let HashData::HierarchicalSha256(hash_data) = &section.header().hash_data else {
        panic!("unexpected hash data variant");
    };
    assert_eq!(hash_data.master_hash.0 .0, sha256(&level0));
}

#[test]
fn master_hash_covers_distant_hash_entries() {
    // shrink the hash block to 0x200 and grow the data region to 0x4000, so
    // the top hash-table layer is 0x400 bytes (two hash blocks). Patching a
    // range whose hash entry lands past the first hash block exercises the
    // master-level splice beyond a block boundary.
    let archive = build_archive_sized(0x200, 0x1000, 0x4000, 0x3000);
    let mut nca = open(archive.content.clone());

    let new_data = vec![0x3cu8; 0x40];
    let (entry, data_offset) = {
        let storage = nca.open_section_storage(0).unwrap();
        let fs = SectionPartitionFs::from_section(storage).unwrap();
        let entry = *fs.entry(1).unwrap();
        (entry, fs.entry_patch_offset(&entry, 0x2800))
    };
    // the touched bytes hash into an entry in the second block of the table
    assert!(data_offset / archive.hash_block_size * 0x20 >= archive.hash_block_size);

    let patch = nca
        .generate_hash_tree_patch(0, &new_data, data_offset)
        .unwrap();
    let header_patch = nca.encrypt_headers(&test_keyset()).unwrap();

    let mut patched = archive.content.clone();
    for region in patch
        .regions
        .iter()
        .chain(header_patch.regions.iter())
    {
        let at = region.offset as usize;
        patched[at..at + region.data.len()].copy_from_slice(&region.data);
    }

    let reopened = open(patched);
    let storage = reopened.open_section_storage(0).unwrap();

    let mut buf = vec![0u8; new_data.len()];
    storage
        .read(archive.data_region_offset + data_offset, &mut buf)
        .unwrap();
    assert_eq!(buf, new_data);

    let fs =
        SectionPartitionFs::from_section(reopened.open_section_storage(0).unwrap()).unwrap();
    let mut via_entry = vec![0u8; new_data.len()];
    fs.read_entry(&entry, 0x2800, &mut via_entry).unwrap();
    assert_eq!(via_entry, new_data);

    // reference hashes recomputed independently from the patched content
    let mut data_region = vec![0u8; archive.data_region_size as usize];
    storage
        .read(archive.data_region_offset, &mut data_region)
        .unwrap();

    let mut level0 = Vec::new();
    for block in data_region.chunks(archive.hash_block_size as usize) {
        level0.extend_from_slice(&sha256(block));
    }

    let mut stored_level0 = vec![0u8; level0.len()];
    storage.read(0, &mut stored_level0).unwrap();
    assert_eq!(stored_level0, level0);

    let section = reopened.section(0).unwrap();
    let HashData::HierarchicalSha256(hash_data) = &section.header().hash_data else {
        panic!("unexpected hash data variant");
    };
    assert_eq!(hash_data.master_hash.0 .0, sha256(&level0));
}
