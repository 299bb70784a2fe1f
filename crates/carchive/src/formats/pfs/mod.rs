//! Flat partition-filesystem archive: header, entry table, name table, data
//! area. Sections of Meta archives and repacked archives both use it.

mod builder;
mod structs;

use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

use crate::formats::nca::{SectionStorage, SectionStorageAdapter};
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SliceStorage, SliceStorageError, StorageError,
};

pub use builder::{PartitionFsImageBuilder, PfsBuildError};
pub use structs::{name_at, PartitionFsEntry, PartitionFsHeader, PFS_ENTRY_SIZE, PFS_HEADER_SIZE};

const NPDM_MAGIC: &[u8; 4] = b"META";

#[derive(Snafu, Debug)]
pub enum PfsError {
    /// PFS: malformed image: {what}
    Malformed { what: &'static str },
    /// PFS: failed to parse the header
    HeaderParsing { source: binrw::Error },
    /// PFS: failed to read from the storage
    Storage { source: StorageError },
    /// PFS: storage slicing failed
    Slice { source: SliceStorageError },
    /// PFS: read past the end of an entry
    OutOfRange {},
}

/// A parsed partition filesystem over a byte storage. The full header
/// (entries plus name table) is kept resident; file data is read on demand.
#[derive(Debug)]
pub struct PartitionFs<S: ReadableStorage> {
    storage: S,
    entries: Vec<PartitionFsEntry>,
    name_table: Vec<u8>,
    header_size: u64,
    is_exefs: bool,
}

impl<S: ReadableStorage> PartitionFs<S> {
    pub fn new(storage: S) -> Result<Self, PfsError> {
        let mut header_data = [0u8; PFS_HEADER_SIZE as usize];
        storage.read(0, &mut header_data).context(StorageSnafu)?;

        let header = PartitionFsHeader::read(&mut Cursor::new(&header_data))
            .context(HeaderParsingSnafu)?;

        if header.entry_count == 0 {
            return Err(PfsError::Malformed {
                what: "zero entry count",
            });
        }
        if header.name_table_size == 0 {
            return Err(PfsError::Malformed {
                what: "zero name table size",
            });
        }

        let entries_size = header.entry_count as u64 * PFS_ENTRY_SIZE;
        let header_size = PFS_HEADER_SIZE + entries_size + header.name_table_size as u64;
        if header_size > storage.get_size() {
            return Err(PfsError::Malformed {
                what: "header exceeds the image",
            });
        }

        let mut entry_data = vec![0u8; entries_size as usize];
        storage
            .read(PFS_HEADER_SIZE, &mut entry_data)
            .context(StorageSnafu)?;

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        let mut cursor = Cursor::new(&entry_data);
        for _ in 0..header.entry_count {
            entries.push(PartitionFsEntry::read(&mut cursor).context(HeaderParsingSnafu)?);
        }

        // entry ranges must be monotonic and non-overlapping
        let data_size = storage.get_size() - header_size;
        let mut last_end = 0u64;
        for entry in &entries {
            if entry.offset < last_end || entry.offset + entry.size > data_size {
                return Err(PfsError::Malformed {
                    what: "overlapping or out-of-bounds entry",
                });
            }
            last_end = entry.offset + entry.size;
        }

        let mut name_table = vec![0u8; header.name_table_size as usize];
        storage
            .read(PFS_HEADER_SIZE + entries_size, &mut name_table)
            .context(StorageSnafu)?;

        let mut fs = Self {
            storage,
            entries,
            name_table,
            header_size,
            is_exefs: false,
        };

        // an ExeFS carries the program metadata as `main.npdm`
        if let Some(index) = fs.entry_by_name("main.npdm") {
            let entry = fs.entries[index];
            if entry.size >= 4 {
                let mut magic = [0u8; 4];
                fs.read_entry(&entry, 0, &mut magic)?;
                fs.is_exefs = &magic == NPDM_MAGIC;
            }
        }

        Ok(fs)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> Option<&PartitionFsEntry> {
        self.entries.get(index)
    }

    pub fn entry_name(&self, index: usize) -> Option<&str> {
        let entry = self.entries.get(index)?;
        name_at(&self.name_table, entry.name_offset)
    }

    /// Linear scan; partition filesystems hold at most a handful of entries.
    pub fn entry_by_name(&self, name: &str) -> Option<usize> {
        (0..self.entries.len()).find(|&i| self.entry_name(i) == Some(name))
    }

    pub fn entries(&self) -> impl Iterator<Item = (Option<&str>, &PartitionFsEntry)> {
        self.entries
            .iter()
            .map(|entry| (name_at(&self.name_table, entry.name_offset), entry))
    }

    /// Size of header + entry table + name table; entry data begins here.
    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Whether this partition is an ExeFS.
    pub fn is_exefs(&self) -> bool {
        self.is_exefs
    }

    /// Sum of all entry sizes.
    pub fn total_data_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Reads raw partition bytes (header area included).
    pub fn read_partition(&self, offset: u64, buf: &mut [u8]) -> Result<(), PfsError> {
        self.storage.read(offset, buf).context(StorageSnafu)
    }

    pub fn read_entry(
        &self,
        entry: &PartitionFsEntry,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), PfsError> {
        if offset + buf.len() as u64 > entry.size {
            return Err(PfsError::OutOfRange {});
        }
        self.read_partition(self.header_size + entry.offset + offset, buf)
    }

    pub fn read_entry_to_vec(&self, entry: &PartitionFsEntry) -> Result<Vec<u8>, PfsError> {
        let mut data = vec![0u8; entry.size as usize];
        self.read_entry(entry, 0, &mut data)?;
        Ok(data)
    }

    /// Offset of the entry's bytes within the hash-target layer. Feed this
    /// to the hash-tree patcher when regenerating an entry.
    pub fn entry_patch_offset(&self, entry: &PartitionFsEntry, data_offset: u64) -> u64 {
        self.header_size + entry.offset + data_offset
    }
}

pub type SectionPartitionFs<S> = PartitionFs<SliceStorage<SectionStorageAdapter<S>>>;

impl<S: ReadableStorage> SectionPartitionFs<S> {
    /// Opens the partition filesystem stored in a section's hash-target
    /// region.
    pub fn from_section(storage: SectionStorage<S>) -> Result<Self, PfsError> {
        let (offset, size) = storage.hash_target_extents();
        let storage = SectionStorageAdapter(storage)
            .slice(offset, size)
            .context(SliceSnafu)?;
        Self::new(storage)
    }
}

#[cfg(test)]
pub(crate) mod test_image {
    use super::structs::{PFS_ENTRY_SIZE, PFS_HEADER_SIZE};

    /// Builds a well-formed PFS image out of (name, bytes) pairs, with the
    /// name table zero-padded to 0x20 alignment.
    pub fn build(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut name_table = Vec::new();
        let mut name_offsets = Vec::new();
        for (name, _) in entries {
            name_offsets.push(name_table.len() as u32);
            name_table.extend_from_slice(name.as_bytes());
            name_table.push(0);
        }
        let unaligned =
            PFS_HEADER_SIZE + entries.len() as u64 * PFS_ENTRY_SIZE + name_table.len() as u64;
        name_table.resize(
            name_table.len() + (unaligned.next_multiple_of(0x20) - unaligned) as usize,
            0,
        );

        let mut image = Vec::new();
        image.extend_from_slice(b"PFS0");
        image.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        image.extend_from_slice(&(name_table.len() as u32).to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());

        let mut data_offset = 0u64;
        for (i, (_, data)) in entries.iter().enumerate() {
            image.extend_from_slice(&data_offset.to_le_bytes());
            image.extend_from_slice(&(data.len() as u64).to_le_bytes());
            image.extend_from_slice(&name_offsets[i].to_le_bytes());
            image.extend_from_slice(&0u32.to_le_bytes());
            data_offset += data.len() as u64;
        }

        image.extend_from_slice(&name_table);
        for (_, data) in entries {
            image.extend_from_slice(data);
        }
        image
    }
}
