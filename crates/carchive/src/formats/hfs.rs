//! Cartridge hash filesystem: the flat archive format of gamecard
//! partitions. Like the partition filesystem, but every entry carries the
//! SHA-256 of a prefix of its data.

use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

use crate::crypto::sha256;
use crate::hexstring::HexData;
use crate::storage::{ReadableStorage, StorageError};

pub const HFS_HEADER_SIZE: u64 = 0x10;
pub const HFS_ENTRY_SIZE: u64 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little, magic = b"HFS0")]
pub struct HashFsHeader {
    pub entry_count: u32,
    pub name_table_size: u32,
    pub reserved: u32,
}

/// Entry offsets are relative to the start of the data area. The hash
/// covers the first `hash_target_size` bytes at `hash_target_offset` within
/// the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct HashFsEntry {
    pub offset: u64,
    pub size: u64,
    pub name_offset: u32,
    pub hash_target_size: u32,
    pub hash_target_offset: u64,
    pub hash: HexData<0x20>,
}

#[derive(Snafu, Debug)]
pub enum HfsError {
    /// HFS: malformed image: {what}
    Malformed { what: &'static str },
    /// HFS: failed to parse the header
    HeaderParsing { source: binrw::Error },
    /// HFS: failed to read from the storage
    Storage { source: StorageError },
    /// HFS: read past the end of an entry
    OutOfRange {},
    /// HFS: hash mismatch for entry {name}
    HashMismatch { name: String },
}

/// A parsed hash-filesystem partition over a byte storage (usually a slice
/// of the raw cartridge space).
#[derive(Debug)]
pub struct HashFs<S: ReadableStorage> {
    storage: S,
    entries: Vec<HashFsEntry>,
    name_table: Vec<u8>,
    header_size: u64,
}

impl<S: ReadableStorage> HashFs<S> {
    pub fn new(storage: S) -> Result<Self, HfsError> {
        let mut header_data = [0u8; HFS_HEADER_SIZE as usize];
        storage.read(0, &mut header_data).context(StorageSnafu)?;

        let header =
            HashFsHeader::read(&mut Cursor::new(&header_data)).context(HeaderParsingSnafu)?;

        if header.entry_count == 0 {
            return Err(HfsError::Malformed {
                what: "zero entry count",
            });
        }

        let entries_size = header.entry_count as u64 * HFS_ENTRY_SIZE;
        let header_size = HFS_HEADER_SIZE + entries_size + header.name_table_size as u64;
        if header_size > storage.get_size() {
            return Err(HfsError::Malformed {
                what: "header exceeds the partition",
            });
        }

        let mut entry_data = vec![0u8; entries_size as usize];
        storage
            .read(HFS_HEADER_SIZE, &mut entry_data)
            .context(StorageSnafu)?;

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        let mut cursor = Cursor::new(&entry_data);
        for _ in 0..header.entry_count {
            entries.push(HashFsEntry::read(&mut cursor).context(HeaderParsingSnafu)?);
        }

        let mut name_table = vec![0u8; header.name_table_size as usize];
        storage
            .read(HFS_HEADER_SIZE + entries_size, &mut name_table)
            .context(StorageSnafu)?;

        Ok(Self {
            storage,
            entries,
            name_table,
            header_size,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> Option<&HashFsEntry> {
        self.entries.get(index)
    }

    pub fn entry_name(&self, index: usize) -> Option<&str> {
        let entry = self.entries.get(index)?;
        crate::formats::pfs::name_at(&self.name_table, entry.name_offset)
    }

    pub fn entry_by_name(&self, name: &str) -> Option<usize> {
        (0..self.entries.len()).find(|&i| self.entry_name(i) == Some(name))
    }

    pub fn entries(&self) -> impl Iterator<Item = (Option<&str>, &HashFsEntry)> {
        self.entries
            .iter()
            .map(|entry| (crate::formats::pfs::name_at(&self.name_table, entry.name_offset), entry))
    }

    /// `(offset, size)` of a named entry, with the offset absolute within
    /// this partition's storage. This is the lookup the cartridge content
    /// provider serves.
    pub fn entry_info(&self, name: &str) -> Option<(u64, u64)> {
        let index = self.entry_by_name(name)?;
        let entry = &self.entries[index];
        Some((self.header_size + entry.offset, entry.size))
    }

    pub fn read_partition(&self, offset: u64, buf: &mut [u8]) -> Result<(), HfsError> {
        self.storage.read(offset, buf).context(StorageSnafu)
    }

    pub fn read_entry(
        &self,
        entry: &HashFsEntry,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), HfsError> {
        if offset + buf.len() as u64 > entry.size {
            return Err(HfsError::OutOfRange {});
        }
        self.read_partition(self.header_size + entry.offset + offset, buf)
    }

    pub fn read_entry_to_vec(&self, entry: &HashFsEntry) -> Result<Vec<u8>, HfsError> {
        let mut data = vec![0u8; entry.size as usize];
        self.read_entry(entry, 0, &mut data)?;
        Ok(data)
    }

    /// Verifies the entry's hashed region.
    pub fn verify_entry(&self, index: usize) -> Result<(), HfsError> {
        let entry = *self.entries.get(index).ok_or(HfsError::OutOfRange {})?;
        let name = self.entry_name(index).unwrap_or("?").to_string();

        let mut data = vec![0u8; entry.hash_target_size as usize];
        self.read_entry(&entry, entry.hash_target_offset, &mut data)?;

        if sha256(&data) != entry.hash.0 {
            return Err(HfsError::HashMismatch { name });
        }
        Ok(())
    }

    pub fn total_data_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecStorage;

    fn build_image(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut name_table = Vec::new();
        let mut name_offsets = Vec::new();
        for (name, _) in entries {
            name_offsets.push(name_table.len() as u32);
            name_table.extend_from_slice(name.as_bytes());
            name_table.push(0);
        }
        name_table.resize(name_table.len().next_multiple_of(0x20), 0);

        let mut image = Vec::new();
        image.extend_from_slice(b"HFS0");
        image.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        image.extend_from_slice(&(name_table.len() as u32).to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());

        let mut data_offset = 0u64;
        for (i, (_, data)) in entries.iter().enumerate() {
            image.extend_from_slice(&data_offset.to_le_bytes());
            image.extend_from_slice(&(data.len() as u64).to_le_bytes());
            image.extend_from_slice(&name_offsets[i].to_le_bytes());
            image.extend_from_slice(&(data.len() as u32).to_le_bytes()); // hash target size
            image.extend_from_slice(&0u64.to_le_bytes()); // hash target offset
            image.extend_from_slice(&crate::crypto::sha256(data));
            data_offset += data.len() as u64;
        }

        image.extend_from_slice(&name_table);
        for (_, data) in entries {
            image.extend_from_slice(data);
        }
        image
    }

    #[test]
    fn entry_info_and_reads() {
        let content = vec![0xabu8; 0x400];
        let image = build_image(&[("0102030405060708090a0b0c0d0e0f10.nca", &content)]);
        let header_size = image.len() as u64 - 0x400;

        let fs = HashFs::new(VecStorage::new(image)).unwrap();

        let (offset, size) = fs
            .entry_info("0102030405060708090a0b0c0d0e0f10.nca")
            .unwrap();
        assert_eq!(size, 0x400);
        assert_eq!(offset, header_size);

        let mut buf = [0u8; 0x10];
        fs.read_partition(offset, &mut buf).unwrap();
        assert_eq!(buf, [0xab; 0x10]);

        fs.verify_entry(0).unwrap();
    }

    #[test]
    fn hash_mismatch_detected() {
        let content = vec![0x11u8; 0x100];
        let mut image = build_image(&[("data.bin", &content)]);
        let len = image.len();
        image[len - 1] ^= 0xff;

        let fs = HashFs::new(VecStorage::new(image)).unwrap();
        assert!(matches!(
            fs.verify_entry(0),
            Err(HfsError::HashMismatch { .. })
        ));
    }
}
