//! Composed virtual storages for a section: Regular at the bottom, then
//! (depending on the section) Sparse, Indirect + CTR-EX, and Compressed on
//! top. The set is closed, so dispatch is a tagged enum rather than a trait
//! object.

use crate::crypto::ctr_init_partial;
use crate::formats::bktr::{
    AesCtrExEntry, BucketInfo, BucketTree, CompressedEntry, CompressionType, IndirectEntry,
    StorageIndex, TreeEntry,
};
use crate::formats::nca::section::{BktrSnafu, FsSection, FsSectionType, StorageSnafu};
use crate::formats::nca::{Nca, SectionError};
use crate::storage::{ReadableStorage, StorageError};
use snafu::ResultExt;

/// The base ("original") side of a patch section's indirect layer, attached
/// by the caller from the base archive. Open set, hence a trait object.
pub type BaseStorage = Box<dyn ReadableStorage>;

enum Layer {
    Regular,
    Sparse {
        table: BucketTree<IndirectEntry>,
    },
    Indirect {
        table: BucketTree<IndirectEntry>,
        ctr_ex_table: BucketTree<AesCtrExEntry>,
        base: Option<BaseStorage>,
    },
    Compressed {
        table: BucketTree<CompressedEntry>,
        inner: Box<Layer>,
    },
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Regular => write!(f, "Regular"),
            Layer::Sparse { .. } => write!(f, "Sparse"),
            Layer::Indirect { base, .. } => {
                write!(f, "Indirect(base: {})", base.is_some())
            }
            Layer::Compressed { inner, .. } => write!(f, "Compressed({:?})", inner),
        }
    }
}

/// Read stack of one section. Reads yield plaintext bytes of the section's
/// virtual address space; the stack height is statically bounded by the
/// layer construction (at most compressed → indirect → ctr-ex → regular).
#[derive(Debug)]
pub struct SectionStorage<S: ReadableStorage> {
    section: FsSection<S>,
    layer: Layer,
    size: u64,
}

impl<S: ReadableStorage> SectionStorage<S> {
    /// Virtual size of the stack: the outermost tree's end offset, or the
    /// raw section size for plain sections.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn section(&self) -> &FsSection<S> {
        &self.section
    }

    /// Extents of the hash-target region within this storage.
    pub fn hash_target_extents(&self) -> (u64, u64) {
        (
            self.section.hash_target_offset(),
            self.section.hash_target_size(),
        )
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), SectionError> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > self.size {
            return Err(SectionError::OutOfRange {});
        }
        read_layer(&self.layer, &self.section, offset, buf)
    }

    /// Whether any byte of `[offset, offset + size)` is backed by the patch
    /// side of the indirect layer. Drives update detection for patch images.
    pub fn is_range_updated(&self, offset: u64, size: u64) -> Result<bool, SectionError> {
        if offset + size > self.size {
            return Err(SectionError::OutOfRange {});
        }
        layer_range_updated(&self.layer, &self.section, offset, size)
    }
}

/// Walks indirect entries covering the range and reports whether any of them
/// target the patch side. For compressed layers the check recurses through
/// the entry's physical extents.
fn layer_range_updated<S: ReadableStorage>(
    layer: &Layer,
    section: &FsSection<S>,
    offset: u64,
    size: u64,
) -> Result<bool, SectionError> {
    match layer {
        Layer::Regular | Layer::Sparse { .. } => Ok(false),
        Layer::Indirect { table, .. } => {
            let mut visitor = table.find(offset).context(BktrSnafu)?;
            loop {
                let entry = visitor.current();
                if entry.storage_index == StorageIndex::Patch {
                    return Ok(true);
                }
                if !visitor.can_advance() {
                    return Ok(false);
                }
                let next_offset = visitor.next_entry_offset().context(BktrSnafu)?;
                if next_offset >= offset + size {
                    return Ok(false);
                }
            }
        }
        Layer::Compressed { table, inner } => {
            let base_offset = section.hash_target_offset();
            let mut visitor = table.find(offset).context(BktrSnafu)?;
            let mut cursor = offset;
            loop {
                let entry = visitor.current();
                let entry_offset = entry.virtual_offset;
                let next_offset = visitor.next_entry_offset().context(BktrSnafu)?;

                let phys_start = base_offset
                    + entry.physical_offset
                    + cursor.saturating_sub(entry_offset);
                let mut phys_size = next_offset - entry_offset - (cursor - entry_offset);
                if offset + size <= next_offset {
                    phys_size -= next_offset - (offset + size);
                }

                if entry.compression_type != CompressionType::Zero
                    && layer_range_updated(inner, section, phys_start, phys_size)?
                {
                    return Ok(true);
                }

                if offset + size <= next_offset {
                    return Ok(false);
                }
                cursor = next_offset;
            }
        }
    }
}

fn read_layer<S: ReadableStorage>(
    layer: &Layer,
    section: &FsSection<S>,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), SectionError> {
    match layer {
        Layer::Regular => section.read(offset, buf),
        Layer::Sparse { table } => read_sparse(table, section, offset, buf),
        Layer::Indirect {
            table,
            ctr_ex_table,
            base,
        } => read_indirect(table, ctr_ex_table, base.as_deref(), section, offset, buf),
        Layer::Compressed { table, inner } => read_compressed(table, inner, section, offset, buf),
    }
}

/// Sparse layer: Original ranges relocate into the physical file, Patch
/// ranges read as zeroes. The counter of the underlying read is keyed off
/// the virtual offset.
fn read_sparse<S: ReadableStorage>(
    table: &BucketTree<IndirectEntry>,
    section: &FsSection<S>,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), SectionError> {
    let mut visitor = table.find(offset).context(BktrSnafu)?;
    let mut accum = 0usize;

    while accum < buf.len() {
        let block_offset = offset + accum as u64;

        let entry = visitor.current();
        if entry.virtual_offset > block_offset {
            return Err(SectionError::Bktr {
                source: crate::formats::bktr::BktrError::MalformedTable {
                    what: "sparse entry does not cover the requested offset",
                },
            });
        }
        let next_offset = visitor.next_entry_offset().context(BktrSnafu)?;

        let block_size = (next_offset - block_offset) as usize;
        let read_size = std::cmp::min(block_size, buf.len() - accum);
        let chunk = &mut buf[accum..accum + read_size];

        match entry.storage_index {
            StorageIndex::Original => {
                let physical = block_offset - entry.virtual_offset + entry.physical_offset;
                section.read_with_iv(physical, chunk, Some(block_offset))?;
            }
            StorageIndex::Patch => chunk.fill(0),
        }

        accum += read_size;
    }

    Ok(())
}

/// Indirect (patch) layer: Original ranges come from the attached base
/// storage, Patch ranges route through the CTR-EX layer of this section.
fn read_indirect<S: ReadableStorage>(
    table: &BucketTree<IndirectEntry>,
    ctr_ex_table: &BucketTree<AesCtrExEntry>,
    base: Option<&dyn ReadableStorage>,
    section: &FsSection<S>,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), SectionError> {
    let mut visitor = table.find(offset).context(BktrSnafu)?;
    let mut accum = 0usize;

    while accum < buf.len() {
        let block_offset = offset + accum as u64;

        let entry = visitor.current();
        if entry.virtual_offset > block_offset {
            return Err(SectionError::Bktr {
                source: crate::formats::bktr::BktrError::MalformedTable {
                    what: "indirect entry does not cover the requested offset",
                },
            });
        }
        let next_offset = visitor.next_entry_offset().context(BktrSnafu)?;

        let block_size = (next_offset - block_offset) as usize;
        let read_size = std::cmp::min(block_size, buf.len() - accum);
        let chunk = &mut buf[accum..accum + read_size];
        let physical = block_offset - entry.virtual_offset + entry.physical_offset;

        match entry.storage_index {
            StorageIndex::Original => {
                let base = base.ok_or(SectionError::MalformedSection {
                    index: section.index(),
                    what: "patch read without an attached base storage",
                })?;
                base.read(physical, chunk).context(StorageSnafu)?;
            }
            StorageIndex::Patch => read_ctr_ex(ctr_ex_table, section, physical, chunk)?,
        }

        accum += read_size;
    }

    Ok(())
}

/// CTR-EX layer: each entry carries its own counter generation and may
/// disable crypto for its range. Offsets here address the section's raw
/// bytes.
fn read_ctr_ex<S: ReadableStorage>(
    table: &BucketTree<AesCtrExEntry>,
    section: &FsSection<S>,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), SectionError> {
    let mut visitor = table.find(offset).context(BktrSnafu)?;
    let mut accum = 0usize;

    while accum < buf.len() {
        let block_offset = offset + accum as u64;

        let entry = visitor.current();
        if entry.offset > block_offset || entry.offset % 0x10 != 0 {
            return Err(SectionError::Bktr {
                source: crate::formats::bktr::BktrError::MalformedTable {
                    what: "ctr-ex entry does not cover the requested offset",
                },
            });
        }
        let next_offset = visitor.next_entry_offset().context(BktrSnafu)?;
        if next_offset % 0x10 != 0 {
            return Err(SectionError::Bktr {
                source: crate::formats::bktr::BktrError::MalformedTable {
                    what: "unaligned ctr-ex entry boundary",
                },
            });
        }

        let block_size = (next_offset - block_offset) as usize;
        let read_size = std::cmp::min(block_size, buf.len() - accum);
        let chunk = &mut buf[accum..accum + read_size];

        section.read_ctr_ex(block_offset, chunk, entry.generation, entry.encryption_enabled)?;

        accum += read_size;
    }

    Ok(())
}

/// LZ4 scratch sizing: the decompressed size plus the in-place margin the
/// compressor guarantees.
fn lz4_scratch_size(decompressed: usize) -> usize {
    decompressed + (decompressed >> 8) + 32
}

/// Compressed layer: entries pass through, emit zeroes, or decompress an
/// LZ4 block and copy the requested window. Physical extents are relative to
/// the end of the hash-target region.
fn read_compressed<S: ReadableStorage>(
    table: &BucketTree<CompressedEntry>,
    inner: &Layer,
    section: &FsSection<S>,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), SectionError> {
    let base_offset = section.hash_target_offset();

    let mut visitor = table.find(offset).context(BktrSnafu)?;
    let mut accum = 0usize;

    while accum < buf.len() {
        let block_offset = offset + accum as u64;

        let entry = visitor.current();
        if entry.virtual_offset > block_offset || !entry.is_valid() {
            return Err(SectionError::Compression {
                what: "invalid compressed entry",
            });
        }
        let next_offset = visitor.next_entry_offset().context(BktrSnafu)?;

        let block_size = (next_offset - block_offset) as usize;
        let read_size = std::cmp::min(block_size, buf.len() - accum);
        let chunk = &mut buf[accum..accum + read_size];

        match entry.compression_type {
            CompressionType::None => {
                let physical =
                    base_offset + entry.physical_offset + (block_offset - entry.virtual_offset);
                read_layer(inner, section, physical, chunk)?;
            }
            CompressionType::Zero => chunk.fill(0),
            CompressionType::Lz4 => {
                let compressed_size = entry.physical_size as usize;
                let decompressed_size = (next_offset - entry.virtual_offset) as usize;

                // read the compressed extent to the tail of the scratch
                // buffer, decompress into a window at its head
                let mut scratch = vec![0u8; lz4_scratch_size(decompressed_size)];
                if compressed_size > scratch.len() {
                    return Err(SectionError::Compression {
                        what: "compressed extent larger than its decompressed span",
                    });
                }
                let tail_start = scratch.len() - compressed_size;
                read_layer(
                    inner,
                    section,
                    base_offset + entry.physical_offset,
                    &mut scratch[tail_start..],
                )?;

                let (head, tail) = scratch.split_at_mut(tail_start);
                let decompressed = lz4_flex::block::decompress_into(tail, head)
                    .map_err(|_| SectionError::Compression {
                        what: "lz4 block decompression failed",
                    })?;
                if decompressed != decompressed_size {
                    return Err(SectionError::Compression {
                        what: "decompressed size disagrees with the entry extents",
                    });
                }

                let window = (block_offset - entry.virtual_offset) as usize;
                chunk.copy_from_slice(&head[window..window + read_size]);
            }
            CompressionType::Unknown => {
                return Err(SectionError::Compression {
                    what: "unknown compression type",
                })
            }
        }

        accum += read_size;
    }

    Ok(())
}

impl<S: ReadableStorage> Nca<S> {
    /// Opens the storage stack for a non-patch section (Regular, optionally
    /// under Sparse, optionally under Compressed).
    pub fn open_section_storage(&self, index: usize) -> Result<SectionStorage<S>, SectionError> {
        self.build_section_storage(index, None)
    }

    /// Opens the storage stack for a Patch section. `base` supplies the
    /// original side of the indirect layer (normally the base archive's
    /// hash-target region); passing `None` leaves base reads failing, which
    /// still suffices for update detection and CTR-EX-only access.
    pub fn open_patch_section_storage(
        &self,
        index: usize,
        base: Option<BaseStorage>,
    ) -> Result<SectionStorage<S>, SectionError> {
        self.build_section_storage(index, Some(base))
    }

    fn build_section_storage(
        &self,
        index: usize,
        patch_base: Option<Option<BaseStorage>>,
    ) -> Result<SectionStorage<S>, SectionError> {
        let section = self
            .section(index)
            .ok_or(SectionError::MalformedSection {
                index,
                what: "section is not populated",
            })?
            .clone();

        let is_patch = section.section_type() == FsSectionType::PatchRomFs;
        if is_patch != patch_base.is_some() {
            return Err(SectionError::MalformedSection {
                index,
                what: if is_patch {
                    "patch section opened without a base attachment point"
                } else {
                    "base attachment on a non-patch section"
                },
            });
        }

        let mut layer = if let Some(base) = patch_base {
            let header = section.header();
            let table = read_patch_table::<IndirectEntry, S>(
                &section,
                &header.patch_info.indirect_bucket,
            )?;
            let ctr_ex_table = read_patch_table::<AesCtrExEntry, S>(
                &section,
                &header.patch_info.aes_ctr_ex_bucket,
            )?;
            Layer::Indirect {
                table,
                ctr_ex_table,
                base,
            }
        } else if section.has_sparse_layer() {
            Layer::Sparse {
                table: read_sparse_table(&section)?,
            }
        } else {
            Layer::Regular
        };

        if section.has_compression_layer() {
            let bucket = section.header().compression_info.bucket;
            let table_offset = section.hash_target_offset() + bucket.offset;

            let mut table_data = vec![0u8; bucket.size as usize];
            read_layer(&layer, &section, table_offset, &mut table_data)?;

            let table = BucketTree::new(&bucket, table_data).context(BktrSnafu)?;
            layer = Layer::Compressed {
                table,
                inner: Box::new(layer),
            };
        }

        let size = match &layer {
            Layer::Regular => section.section_size(),
            Layer::Sparse { table } => table.end_offset(),
            Layer::Indirect { table, .. } => table.end_offset(),
            Layer::Compressed { table, .. } => table.end_offset(),
        };

        Ok(SectionStorage {
            section,
            layer,
            size,
        })
    }
}

/// Reads and decrypts the sparse relocation table. It sits outside the
/// section proper and is encrypted with a counter derived from the sparse
/// generation.
fn read_sparse_table<S: ReadableStorage>(
    section: &FsSection<S>,
) -> Result<BucketTree<IndirectEntry>, SectionError> {
    let header = section.header();
    let bucket = header.sparse_info.bucket;

    let table_offset = section
        .sparse_table_offset()
        .ok_or(SectionError::MalformedSection {
            index: section.index(),
            what: "sparse layer without a table",
        })?;

    let mut table_data = vec![0u8; bucket.size as usize];
    section
        .storage
        .read(table_offset, &mut table_data)
        .context(StorageSnafu)?;

    // the table counter reuses the section's upper IV with the generation
    // spliced into its low half
    let key = section.content_ctr_key()?;
    let generation_iv = (section.header.upper_iv & !0xffff_ffff_u64)
        | ((header.sparse_info.generation as u64) << 16);
    let ctr = ctr_init_partial(generation_iv, table_offset);
    key.crypt_ctr(&mut table_data, &ctr);

    BucketTree::new(&bucket, table_data).context(BktrSnafu)
}

/// Reads a patch-info bucket table through the section's regular read path.
fn read_patch_table<E: TreeEntry, S: ReadableStorage>(
    section: &FsSection<S>,
    bucket: &BucketInfo,
) -> Result<BucketTree<E>, SectionError> {
    if bucket.is_empty() {
        return Err(SectionError::MalformedSection {
            index: section.index(),
            what: "patch section without bucket tables",
        });
    }

    let mut table_data = vec![0u8; bucket.size as usize];
    section.read(bucket.offset, &mut table_data)?;

    BucketTree::new(bucket, table_data).context(BktrSnafu)
}

/// Adapter exposing a section storage as a plain [`ReadableStorage`], e.g.
/// to slice out the hash-target region for a patch's base side.
#[derive(Debug)]
pub struct SectionStorageAdapter<S: ReadableStorage>(pub SectionStorage<S>);

impl<S: ReadableStorage> ReadableStorage for SectionStorageAdapter<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.0.read(offset, buf).map_err(|error| {
            tracing::debug!(%error, "section storage read failed");
            StorageError::OutOfBounds {}
        })
    }

    fn get_size(&self) -> u64 {
        self.0.size()
    }
}

impl<S: ReadableStorage + 'static> SectionStorage<S> {
    /// Boxes up the hash-target region of this storage as the base side for
    /// a patch section's indirect layer.
    pub fn into_hash_target_storage(self) -> Result<BaseStorage, SectionError> {
        let (offset, size) = self.hash_target_extents();
        let adapter = SectionStorageAdapter(self);
        let slice = crate::storage::SliceStorage::new(adapter, offset, size).map_err(|_| {
            SectionError::MalformedSection {
                index: 0,
                what: "hash target region exceeds the storage",
            }
        })?;
        Ok(Box::new(slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ctr_init_partial_ex;
    use crate::formats::bktr::{BucketTreeHeader, BKTR_MAGIC, BKTR_VERSION, NODE_SIZE};
    use crate::formats::nca::section::SectionCrypt;
    use crate::formats::nca::structs::{
        CompressionInfo, HashData, HashRegion, HierarchicalSha256Data, NcaEncryptionType,
        NcaFsHeader, NcaFsType, NcaHashType, PatchInfo, Sha256Hash, SparseInfo,
        NCA_FS_HEADER_SIZE,
    };
    use crate::formats::nca::NcaVersion;
    use crate::storage::{ReadableStorageExt, SharedStorage, VecStorage};
    use crate::HexData;

    /// Single-node table builder shared by the storage tests. `write_entry`
    /// serializes one entry at its slot.
    fn build_table<F>(
        entry_size: u64,
        entry_count: usize,
        end_offset: u64,
        first_virtual_offset: u64,
        mut write_entry: F,
    ) -> (BucketInfo, Vec<u8>)
    where
        F: FnMut(usize, &mut [u8]),
    {
        let mut table = vec![0u8; (NODE_SIZE * 2) as usize];

        table[0..4].copy_from_slice(&0u32.to_le_bytes());
        table[4..8].copy_from_slice(&1u32.to_le_bytes());
        table[8..16].copy_from_slice(&end_offset.to_le_bytes());
        table[16..24].copy_from_slice(&first_virtual_offset.to_le_bytes());

        let base = NODE_SIZE as usize;
        table[base..base + 4].copy_from_slice(&0u32.to_le_bytes());
        table[base + 4..base + 8].copy_from_slice(&(entry_count as u32).to_le_bytes());
        table[base + 8..base + 16].copy_from_slice(&end_offset.to_le_bytes());

        for index in 0..entry_count {
            let at = base + 0x10 + index * entry_size as usize;
            write_entry(index, &mut table[at..at + entry_size as usize]);
        }

        let bucket = BucketInfo {
            offset: 0,
            size: NODE_SIZE * 2,
            header: BucketTreeHeader {
                magic: HexData(BKTR_MAGIC),
                version: BKTR_VERSION,
                entry_count: entry_count as u32,
                reserved: 0,
            },
        };
        (bucket, table)
    }

    fn indirect_tree(
        entries: &[(u64, u64, StorageIndex)],
        end_offset: u64,
    ) -> BucketTree<IndirectEntry> {
        let (bucket, table) = build_table(
            IndirectEntry::ENTRY_SIZE,
            entries.len(),
            end_offset,
            entries[0].0,
            |index, slot| {
                let (virt, phys, storage_index) = entries[index];
                slot[0..8].copy_from_slice(&virt.to_le_bytes());
                slot[8..16].copy_from_slice(&phys.to_le_bytes());
                slot[16..20].copy_from_slice(&(storage_index as u32).to_le_bytes());
            },
        );
        BucketTree::new(&bucket, table).unwrap()
    }

    fn ctr_ex_tree(entries: &[(u64, u32, bool)], end_offset: u64) -> BucketTree<AesCtrExEntry> {
        let (bucket, table) = build_table(
            AesCtrExEntry::ENTRY_SIZE,
            entries.len(),
            end_offset,
            entries[0].0,
            |index, slot| {
                let (offset, generation, enabled) = entries[index];
                slot[0..8].copy_from_slice(&offset.to_le_bytes());
                slot[8..12].copy_from_slice(&generation.to_le_bytes());
                slot[12] = enabled as u8;
            },
        );
        BucketTree::new(&bucket, table).unwrap()
    }

    fn compressed_tree(
        entries: &[(u64, u64, CompressionType, i8, u32)],
        end_offset: u64,
    ) -> BucketTree<CompressedEntry> {
        let (bucket, table) = build_table(
            CompressedEntry::ENTRY_SIZE,
            entries.len(),
            end_offset,
            entries[0].0,
            |index, slot| {
                let (virt, phys, ty, level, phys_size) = entries[index];
                slot[0..8].copy_from_slice(&virt.to_le_bytes());
                slot[8..16].copy_from_slice(&phys.to_le_bytes());
                slot[0x10] = ty as u8;
                slot[0x11] = level as u8;
                slot[0x14..0x18].copy_from_slice(&phys_size.to_le_bytes());
            },
        );
        BucketTree::new(&bucket, table).unwrap()
    }

    /// A plaintext section over in-memory content, with the hash target
    /// covering everything (hash type None).
    fn plain_section(content: Vec<u8>, section_offset: u64) -> FsSection<VecStorage> {
        let section_size = content.len() as u64 - section_offset;
        plain_section_sized(content, section_offset, section_size, 0)
    }

    fn plain_section_sized(
        content: Vec<u8>,
        section_offset: u64,
        section_size: u64,
        hash_target_offset: u64,
    ) -> FsSection<VecStorage> {
        let content_size = content.len() as u64;
        let header = NcaFsHeader {
            version: 2,
            fs_type: NcaFsType::RomFs,
            hash_type: NcaHashType::None,
            encryption_type: NcaEncryptionType::None,
            meta_data_hash_type: crate::formats::nca::structs::MetaDataHashType::None,
            hash_data: HashData::HierarchicalSha256(HierarchicalSha256Data {
                master_hash: Sha256Hash(HexData([0; 0x20])),
                hash_block_size: 0x4000,
                hash_region_count: 2,
                hash_regions: [
                    HashRegion {
                        offset: 0,
                        size: hash_target_offset,
                    },
                    HashRegion {
                        offset: hash_target_offset,
                        size: section_size - hash_target_offset,
                    },
                    HashRegion { offset: 0, size: 0 },
                    HashRegion { offset: 0, size: 0 },
                    HashRegion { offset: 0, size: 0 },
                ],
            }),
            patch_info: PatchInfo::zeroed(),
            upper_iv: 0,
            sparse_info: SparseInfo::zeroed(),
            compression_info: CompressionInfo::zeroed(),
            meta_data_hash_data_info: crate::formats::nca::structs::MetaDataHashDataInfo {
                table_offset: 0,
                table_size: 0,
                table_hash: Sha256Hash(HexData([0; 0x20])),
            },
        };

        FsSection {
            storage: SharedStorage::new(VecStorage::new(content)),
            header,
            encrypted_header: vec![0u8; NCA_FS_HEADER_SIZE],
            index: 0,
            section_offset,
            section_size,
            content_size,
            format_version: NcaVersion::Nca3,
            hash_type: NcaHashType::None,
            encryption_type: NcaEncryptionType::None,
            section_type: FsSectionType::PatchRomFs,
            skip_hash_layer_crypto: false,
            hash_target_offset,
            hash_target_size: section_size - hash_target_offset,
            sparse_table_offset: None,
            crypt: SectionCrypt::None,
            content_ctr_key: Some(crate::crypto::AesKey(HexData([0x42; 0x10]))),
        }
    }

    #[test]
    fn sparse_reads_zero_fill_patch_ranges() {
        // physical layout: 0x1000 bytes of real data at section offset
        let mut content = vec![0u8; 0x1800];
        for (i, byte) in content[0x800..0x1800].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let section = plain_section(content, 0x800);

        // virtual: [0, 0x1000) physical, [0x1000, 0x3000) zeroes
        let table = indirect_tree(
            &[
                (0, 0, StorageIndex::Original),
                (0x1000, 0, StorageIndex::Patch),
            ],
            0x3000,
        );
        let layer = Layer::Sparse { table };

        let mut buf = vec![0u8; 0x1800];
        read_layer(&layer, &section, 0x800, &mut buf).unwrap();

        for (i, &byte) in buf[..0x800].iter().enumerate() {
            assert_eq!(byte, ((i + 0x800) % 251) as u8);
        }
        assert!(buf[0x800..].iter().all(|&b| b == 0));
    }

    #[test]
    fn indirect_routes_between_base_and_patch() {
        // patch section content: ctr-ex area holds 0x1000 bytes, plaintext
        // (every ctr-ex entry has encryption disabled)
        let mut content = vec![0u8; 0x1800];
        for byte in &mut content[0x800..] {
            *byte = 0xcc;
        }
        let section = plain_section(content, 0x800);

        let table = indirect_tree(
            &[
                (0, 0, StorageIndex::Original),
                (0x2000, 0, StorageIndex::Patch),
            ],
            0x3000,
        );
        let ctr_ex_table = ctr_ex_tree(&[(0, 0, false)], 0x1000);

        let base: BaseStorage = Box::new(VecStorage::new(vec![0xaa; 0x2000]));
        let layer = Layer::Indirect {
            table,
            ctr_ex_table,
            base: Some(base),
        };

        let mut buf = vec![0u8; 0x3000];
        read_layer(&layer, &section, 0, &mut buf).unwrap();

        assert!(buf[..0x2000].iter().all(|&b| b == 0xaa));
        assert!(buf[0x2000..].iter().all(|&b| b == 0xcc));
    }

    #[test]
    fn indirect_without_base_fails_only_on_original_ranges() {
        let content = vec![0xccu8; 0x1800];
        let section = plain_section(content, 0x800);

        let table = indirect_tree(
            &[
                (0, 0, StorageIndex::Original),
                (0x2000, 0, StorageIndex::Patch),
            ],
            0x3000,
        );
        let ctr_ex_table = ctr_ex_tree(&[(0, 0, false)], 0x1000);

        let layer = Layer::Indirect {
            table,
            ctr_ex_table,
            base: None,
        };

        let mut buf = vec![0u8; 0x100];
        assert!(read_layer(&layer, &section, 0, &mut buf).is_err());
        read_layer(&layer, &section, 0x2000, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xcc));
    }

    #[test]
    fn ctr_ex_applies_per_range_generations() {
        // two ranges with different generations, both encrypted
        let key = crate::crypto::AesKey(HexData([0x42; 0x10]));
        let mut plain = vec![0u8; 0x1000];
        for (i, byte) in plain.iter_mut().enumerate() {
            *byte = (i % 249) as u8;
        }

        let section_offset = 0x800u64;
        let mut encrypted = plain.clone();
        let (first, second) = encrypted.split_at_mut(0x800);
        key.crypt_ctr(first, &ctr_init_partial_ex(7, section_offset));
        key.crypt_ctr(second, &ctr_init_partial_ex(9, section_offset + 0x800));

        let mut content = vec![0u8; 0x800 + 0x1000];
        content[0x800..].copy_from_slice(&encrypted);
        let section = plain_section(content, section_offset);

        let table = ctr_ex_tree(&[(0, 7, true), (0x800, 9, true)], 0x1000);

        // read across the generation boundary, unaligned on purpose
        let mut buf = vec![0u8; 0x900];
        read_ctr_ex(&table, &section, 0x7f0, &mut buf[..0x20]).unwrap();
        assert_eq!(&buf[..0x20], &plain[0x7f0..0x810]);

        let mut buf = vec![0u8; 0x1000];
        read_ctr_ex(&table, &section, 0, &mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn compressed_layer_handles_all_entry_kinds() {
        // virtual layout: [0, 0x100) raw, [0x100, 0x300) zero, [0x300, 0x700) lz4
        let lz4_plain: Vec<u8> = (0..0x400u32).map(|i| (i % 61) as u8).collect();
        let lz4_block = lz4_flex::block::compress(&lz4_plain);

        // physical layout after the (empty) hash target region: raw bytes at
        // 0, lz4 block at 0x100 (16-byte aligned)
        let mut physical = vec![0u8; 0x100 + lz4_block.len()];
        physical[..0x100].copy_from_slice(&vec![0x5au8; 0x100]);
        physical[0x100..].copy_from_slice(&lz4_block);

        let mut content = vec![0u8; 0x800 + physical.len()];
        content[0x800..].copy_from_slice(&physical);
        let section = plain_section_sized(
            content.clone(),
            0x800,
            physical.len() as u64,
            0, // hash target offset: compressed extents are relative to it
        );

        let table = compressed_tree(
            &[
                (
                    0,
                    0,
                    CompressionType::None,
                    0,
                    crate::formats::bktr::COMPRESSION_INVALID_PHYS_SIZE,
                ),
                (0x100, 0, CompressionType::Zero, 0, 0x200),
                (0x300, 0x100, CompressionType::Lz4, 4, lz4_block.len() as u32),
            ],
            0x700,
        );
        let layer = Layer::Compressed {
            table,
            inner: Box::new(Layer::Regular),
        };

        let mut buf = vec![0u8; 0x700];
        read_layer(&layer, &section, 0, &mut buf).unwrap();

        assert!(buf[..0x100].iter().all(|&b| b == 0x5a));
        assert!(buf[0x100..0x300].iter().all(|&b| b == 0));
        assert_eq!(&buf[0x300..], &lz4_plain[..]);

        // a partial window into the lz4 entry decompresses the same bytes
        let mut buf = vec![0u8; 0x40];
        read_layer(&layer, &section, 0x320, &mut buf).unwrap();
        assert_eq!(&buf[..], &lz4_plain[0x20..0x60]);
    }

    #[test]
    fn range_update_detection() {
        let content = vec![0u8; 0x1800];
        let section = plain_section(content, 0x800);

        let table = indirect_tree(
            &[
                (0, 0, StorageIndex::Original),
                (0x2000, 0, StorageIndex::Patch),
            ],
            0x3000,
        );
        let ctr_ex_table = ctr_ex_tree(&[(0, 0, false)], 0x1000);

        let layer = Layer::Indirect {
            table,
            ctr_ex_table,
            base: None,
        };

        assert!(!layer_range_updated(&layer, &section, 0, 0x2000).unwrap());
        assert!(layer_range_updated(&layer, &section, 0x1000, 0x1800).unwrap());
        assert!(layer_range_updated(&layer, &section, 0x2000, 0x100).unwrap());
    }
}
