//! Hash-tree patch generation: given a plaintext write against a section,
//! recompute every hash level up to the master hash and emit encrypted byte
//! patches at absolute content offsets, ready to be overlaid onto a
//! streaming dump.

use binrw::BinWrite;
use std::io::Cursor;

use crate::crypto::{ctr_init_partial, sha256, sha3_256, AES_BLOCK_SIZE, XTS_SECTOR_SIZE};
use crate::formats::nca::section::{FsSection, SectionCrypt, SectionError};
use crate::formats::nca::structs::{
    HashData, NcaEncryptionType, NcaHashType, NCA_FS_HEADER_SIZE, NCA_HEADER_SIZE,
};
use crate::formats::nca::{Nca, NcaVersion};
use crate::ids::ContentId;
use crate::storage::ReadableStorage;

const HASH_SIZE: u64 = 0x20;

/// One run of encrypted bytes at an absolute content offset.
#[derive(Debug, Clone)]
pub struct PatchRegion {
    pub offset: u64,
    pub data: Vec<u8>,
    applied: bool,
}

impl PatchRegion {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            data,
            applied: false,
        }
    }
}

/// A set of patch regions produced by the hash-tree patcher (or the header
/// re-encryption). `written` flips once every region has been fully applied
/// to a streamed buffer.
#[derive(Debug, Clone, Default)]
pub struct HashTreePatch {
    pub content_id: Option<ContentId>,
    pub regions: Vec<PatchRegion>,
    pub written: bool,
}

impl HashTreePatch {
    /// Applies the overlap of every region with `[buf_offset,
    /// buf_offset + buf.len())`. Dumps stream sequentially, so a region
    /// counts as applied once its end has passed through a buffer.
    pub fn write_to_buffer(&mut self, buf: &mut [u8], buf_offset: u64) {
        let buf_size = buf.len() as u64;

        for region in &mut self.regions {
            let patch_end = region.offset + region.data.len() as u64;
            if buf_offset + buf_size <= region.offset || patch_end <= buf_offset {
                continue;
            }

            let (patch_skip, buf_skip) = if region.offset > buf_offset {
                (0u64, region.offset - buf_offset)
            } else {
                (buf_offset - region.offset, 0u64)
            };
            let count = std::cmp::min(
                region.data.len() as u64 - patch_skip,
                buf_size - buf_skip,
            ) as usize;

            buf[buf_skip as usize..buf_skip as usize + count]
                .copy_from_slice(&region.data[patch_skip as usize..patch_skip as usize + count]);

            if patch_end <= buf_offset + buf_size {
                region.applied = true;
            }
        }

        self.written = self.regions.iter().all(|r| r.applied);
    }
}

struct LayerDesc {
    offset: u64,
    size: u64,
    block_size: u64,
}

fn layer_stack(section_header_hash_data: &HashData) -> Option<Vec<LayerDesc>> {
    match section_header_hash_data {
        HashData::HierarchicalSha256(data) => {
            let count = data.hash_region_count as usize;
            if count == 0 || count > data.hash_regions.len() || data.hash_block_size == 0 {
                return None;
            }
            Some(
                data.hash_regions[..count]
                    .iter()
                    .map(|region| LayerDesc {
                        offset: region.offset,
                        size: region.size,
                        block_size: data.hash_block_size as u64,
                    })
                    .collect(),
            )
        }
        HashData::HierarchicalIntegrity(info) => {
            if info.max_level_count as usize != info.levels.len() + 1 {
                return None;
            }
            Some(
                info.levels
                    .iter()
                    .map(|level| LayerDesc {
                        offset: level.offset,
                        size: level.size,
                        block_size: level.block_size(),
                    })
                    .collect(),
            )
        }
        HashData::None => None,
    }
}

fn layer_hash(use_sha3: bool, data: &[u8]) -> [u8; 0x20] {
    if use_sha3 {
        sha3_256(data)
    } else {
        sha256(data)
    }
}

fn align_down(value: u64, align: u64) -> u64 {
    value / align * align
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

impl<S: ReadableStorage> Nca<S> {
    /// Generates the patch for a plaintext write of `data` at `data_offset`
    /// within the section's hash-target layer: re-hashes every level up to
    /// the master hash, updates the in-memory section header and the header
    /// hash table, and returns the encrypted regions.
    ///
    /// Patch offsets would be ambiguous under relocation, so sections with a
    /// sparse or compressed layer are refused.
    pub fn generate_hash_tree_patch(
        &mut self,
        section_index: usize,
        data: &[u8],
        data_offset: u64,
    ) -> Result<HashTreePatch, SectionError> {
        let section = self
            .section(section_index)
            .ok_or(SectionError::MalformedSection {
                index: section_index,
                what: "section is not populated",
            })?
            .clone();

        if section.has_sparse_layer() || section.has_compression_layer() {
            return Err(SectionError::UnsupportedLayer {
                reason: "sparse and compressed sections cannot be patched in place",
            });
        }
        if matches!(
            section.encryption_type(),
            NcaEncryptionType::AesCtrEx | NcaEncryptionType::AesCtrExSkipLayerHash
        ) {
            return Err(SectionError::UnsupportedLayer {
                reason: "patch sections are repacked, not patched in place",
            });
        }
        if matches!(section.hash_type(), NcaHashType::None | NcaHashType::Auto | NcaHashType::AutoSha3)
        {
            return Err(SectionError::UnsupportedLayer {
                reason: "section carries no hash tree",
            });
        }

        let use_sha3 = section.hash_type().uses_sha3();
        let is_integrity = matches!(
            section.hash_type(),
            NcaHashType::HierarchicalIntegrity | NcaHashType::HierarchicalIntegritySha3
        );

        let layers =
            layer_stack(&section.header().hash_data).ok_or(SectionError::MalformedSection {
                index: section_index,
                what: "hash layer descriptors",
            })?;
        let layer_count = layers.len();

        let target = &layers[layer_count - 1];
        if data.is_empty() || data_offset + data.len() as u64 > target.size {
            return Err(SectionError::OutOfRange {});
        }

        let mut regions = Vec::new();
        let mut new_master_hash = None;

        let mut cur_data: Vec<u8> = Vec::new();
        let mut cur_data_offset = data_offset;
        let mut cur_data_size = data.len() as u64;

        for i in (1..=layer_count).rev() {
            let layer = &layers[i - 1];
            let block_size = layer.block_size;

            if block_size <= 1
                || layer.size == 0
                || layer.offset + layer.size > section.section_size()
            {
                return Err(SectionError::MalformedSection {
                    index: section_index,
                    what: "hash layer extents",
                });
            }

            // aligned read window within the current layer; the master layer
            // is always processed whole
            let (read_start, aligned_end, parent_read_start, parent_read_size) = if i > 1 {
                let start = layer.offset + align_down(cur_data_offset, block_size);
                let end = layer.offset + align_up(cur_data_offset + cur_data_size, block_size);
                let parent_start = cur_data_offset / block_size * HASH_SIZE;
                let parent_size = (end - start) / block_size * HASH_SIZE;
                (start, end, parent_start, parent_size)
            } else {
                (layer.offset, layer.offset + layer.size, 0, 0)
            };

            let aligned_size = aligned_end - read_start;
            let read_end = std::cmp::min(aligned_end, layer.offset + layer.size);
            let read_size = read_end - read_start;
            // splice position relative to the read window; the master level
            // reads from the layer start, the others from the aligned-down
            // offset
            let patch_offset_in_block = cur_data_offset - (read_start - layer.offset);

            // read the layer window; the tail past the layer end stays zero,
            // which is exactly what the integrity variant hashes
            let mut block = vec![0u8; aligned_size as usize];
            section.read(read_start, &mut block[..read_size as usize])?;

            let splice = if i == layer_count {
                data
            } else {
                cur_data.as_slice()
            };
            block[patch_offset_in_block as usize..patch_offset_in_block as usize + splice.len()]
                .copy_from_slice(splice);

            let mut parent_block = Vec::new();
            if i > 1 {
                let parent = &layers[i - 2];
                if parent.size == 0 || parent.offset + parent.size > section.section_size() {
                    return Err(SectionError::MalformedSection {
                        index: section_index,
                        what: "hash layer extents",
                    });
                }

                parent_block = vec![0u8; parent_read_size as usize];
                section.read(parent.offset + parent_read_start, &mut parent_block)?;

                // recompute the hashes covering the spliced region; the
                // SHA-256 variant truncates the final partial block, the
                // integrity variant hashes the zero-padded full block
                let mut hash_index = 0usize;
                let mut j = 0u64;
                while j < read_size {
                    let len = if is_integrity {
                        block_size
                    } else {
                        std::cmp::min(block_size, read_size - j)
                    };
                    let hash = layer_hash(use_sha3, &block[j as usize..(j + len) as usize]);
                    parent_block[hash_index * 0x20..hash_index * 0x20 + 0x20]
                        .copy_from_slice(&hash);
                    hash_index += 1;
                    j += block_size;
                }
            } else {
                new_master_hash = Some(layer_hash(use_sha3, &block[..read_size as usize]));
            }

            // emit this layer's patch region; plaintext when the layer falls
            // into the skip-hash region
            let window =
                &block[patch_offset_in_block as usize..(patch_offset_in_block + cur_data_size) as usize];
            let layer_data_offset = layer.offset + cur_data_offset;

            if !section.skip_hash_layer_crypto() || i == layer_count {
                let (offset, data) = encrypt_section_block(&section, window, layer_data_offset)?;
                regions.push(PatchRegion::new(offset, data));
            } else {
                regions.push(PatchRegion::new(
                    section.section_offset() + layer_data_offset,
                    window.to_vec(),
                ));
            }

            if i > 1 {
                cur_data = parent_block;
                cur_data_offset = parent_read_start;
                cur_data_size = parent_read_size;
            }
        }

        // push the recomputed master hash into the in-memory section header
        // and refresh the header's hash over it
        let master = new_master_hash.expect("the master layer is always processed");
        {
            let section = self.sections[section_index]
                .as_mut()
                .expect("section presence already checked");
            match &mut section.header.hash_data {
                HashData::HierarchicalSha256(data) => data.master_hash.0 .0 = master,
                HashData::HierarchicalIntegrity(info) => info.master_hash.0 .0 = master,
                HashData::None => unreachable!("hash type was validated above"),
            }

            let header_bytes = serialize_fs_header(&section.header);
            self.header.fs_header_hashes[section_index].0 .0 = sha256(&header_bytes);
        }

        Ok(HashTreePatch {
            content_id: self.content_id(),
            regions,
            written: false,
        })
    }

    /// Re-encrypts the in-memory (possibly patched) headers, producing
    /// regions the dump loop can overlay: the fixed header at offset 0 plus
    /// each populated section header at its version-specific location.
    pub fn encrypt_headers(
        &self,
        key_set: &crate::crypto::keyset::KeySet,
    ) -> Result<HashTreePatch, super::NcaError> {
        use snafu::ResultExt;

        let header_key = key_set.header_key().context(super::MissingKeySnafu)?;

        let mut header_bytes = vec![0u8; NCA_HEADER_SIZE];
        let mut cursor = Cursor::new(&mut header_bytes[..]);
        self.header
            .write(&mut cursor)
            .expect("header serialization is infallible");
        header_key.encrypt(&mut header_bytes, 0, XTS_SECTOR_SIZE);

        let mut regions = vec![PatchRegion::new(0, header_bytes)];

        for section in self.sections() {
            let mut fs_header_bytes = serialize_fs_header(&section.header);

            let fs_header_offset = match self.format_version {
                NcaVersion::Nca0 => section.section_offset(),
                _ => (NCA_HEADER_SIZE + section.index() * NCA_FS_HEADER_SIZE) as u64,
            };

            match self.format_version {
                NcaVersion::Nca3 => header_key.encrypt(
                    &mut fs_header_bytes,
                    2 + section.index() as u64,
                    XTS_SECTOR_SIZE,
                ),
                NcaVersion::Nca2 => header_key.encrypt(&mut fs_header_bytes, 0, XTS_SECTOR_SIZE),
                NcaVersion::Nca0 => {
                    let super::ContentKeys::KeyArea { xts, .. } = &self.content_keys else {
                        return Err(super::NcaError::MalformedImage {
                            what: "NCA0 header re-encryption without key-area keys",
                        });
                    };
                    let sector = (section.section_offset() / XTS_SECTOR_SIZE as u64) - 2;
                    xts.encrypt(&mut fs_header_bytes, sector, XTS_SECTOR_SIZE);
                }
            }

            regions.push(PatchRegion::new(fs_header_offset, fs_header_bytes));
        }

        Ok(HashTreePatch {
            content_id: self.content_id(),
            regions,
            written: false,
        })
    }
}

fn serialize_fs_header(header: &crate::formats::nca::structs::NcaFsHeader) -> Vec<u8> {
    let mut bytes = vec![0u8; NCA_FS_HEADER_SIZE];
    let mut cursor = Cursor::new(&mut bytes[..]);
    header
        .write(&mut cursor)
        .expect("fs header serialization is infallible");
    bytes
}

/// Splices `data` into the aligned encrypted block that contains it and
/// re-encrypts, returning the block at its absolute content offset.
fn encrypt_section_block<S: ReadableStorage>(
    section: &FsSection<S>,
    data: &[u8],
    data_offset: u64,
) -> Result<(u64, Vec<u8>), SectionError> {
    let content_offset = section.section_offset() + data_offset;

    let align = match section.encryption_type() {
        NcaEncryptionType::None => {
            return Ok((content_offset, data.to_vec()));
        }
        NcaEncryptionType::AesXts => XTS_SECTOR_SIZE as u64,
        _ => AES_BLOCK_SIZE as u64,
    };

    let block_start = align_down(data_offset, align);
    let block_end = align_up(data_offset + data.len() as u64, align);
    let lead = (data_offset - block_start) as usize;

    let mut block = vec![0u8; (block_end - block_start) as usize];
    if lead != 0 || block.len() != data.len() {
        section.read(block_start, &mut block)?;
    }
    block[lead..lead + data.len()].copy_from_slice(data);

    match &section.crypt {
        SectionCrypt::None => unreachable!("handled above"),
        SectionCrypt::Unavailable => return Err(SectionError::MissingTitleKey {}),
        SectionCrypt::Xts { key } => {
            let sector = match section.format_version {
                NcaVersion::Nca0 => {
                    (section.section_offset() + block_start - NCA_HEADER_SIZE as u64) / align
                }
                _ => block_start / align,
            };
            key.encrypt(&mut block, sector, XTS_SECTOR_SIZE);
        }
        SectionCrypt::Ctr { key, upper_iv } => {
            let ctr = ctr_init_partial(*upper_iv, section.section_offset() + block_start);
            key.crypt_ctr(&mut block, &ctr);
        }
    }

    Ok((section.section_offset() + block_start, block))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_region_streaming_application() {
        let mut patch = HashTreePatch {
            content_id: None,
            regions: vec![
                PatchRegion::new(0x10, vec![0xaa; 0x20]),
                PatchRegion::new(0x100, vec![0xbb; 0x10]),
            ],
            written: false,
        };

        // first chunk covers only part of the first region
        let mut buf = vec![0u8; 0x20];
        patch.write_to_buffer(&mut buf, 0);
        assert_eq!(&buf[..0x10], &[0u8; 0x10]);
        assert_eq!(&buf[0x10..], &[0xaa; 0x10]);
        assert!(!patch.written);

        // second chunk finishes the first region
        let mut buf = vec![0u8; 0x20];
        patch.write_to_buffer(&mut buf, 0x20);
        assert_eq!(&buf[..0x10], &[0xaa; 0x10]);
        assert!(!patch.written);

        // final chunk covers the second region entirely
        let mut buf = vec![0u8; 0x40];
        patch.write_to_buffer(&mut buf, 0xf0);
        assert_eq!(&buf[0x10..0x20], &[0xbb; 0x10]);
        assert!(patch.written);
    }
}
