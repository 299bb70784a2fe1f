//! In-memory partition-fs header builder, used when a dump repackages
//! contents into a new archive: entries are registered up front, the header
//! is emitted once, then file data is streamed after it.

use binrw::BinWrite;
use snafu::Snafu;
use std::io::Cursor;

use super::structs::{
    PartitionFsEntry, PartitionFsHeader, PFS_ENTRY_SIZE, PFS_HEADER_ALIGNMENT, PFS_HEADER_SIZE,
};

#[derive(Snafu, Debug)]
pub enum PfsBuildError {
    /// PFS build: entry index {index} is out of bounds
    InvalidIndex { index: usize },
    /// PFS build: replacement name is longer than the reserved space
    NameTooLong {},
    /// PFS build: no entries registered
    Empty {},
}

#[derive(Debug, Default)]
pub struct PartitionFsImageBuilder {
    names: Vec<String>,
    sizes: Vec<u64>,
}

impl PartitionFsImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry and returns its index. Offsets are assigned
    /// contiguously in registration order.
    pub fn add_entry(&mut self, name: impl Into<String>, size: u64) -> usize {
        self.names.push(name.into());
        self.sizes.push(size);
        self.names.len() - 1
    }

    /// Renames a previously registered entry. The new name must not exceed
    /// the original's length, so already-computed name-table offsets stay
    /// valid.
    pub fn update_entry_name(
        &mut self,
        index: usize,
        new_name: impl Into<String>,
    ) -> Result<(), PfsBuildError> {
        let name = self
            .names
            .get_mut(index)
            .ok_or(PfsBuildError::InvalidIndex { index })?;
        let new_name = new_name.into();
        if new_name.len() > name.len() {
            return Err(PfsBuildError::NameTooLong {});
        }
        // keep the original allocation width by padding with NULs
        let width = name.len();
        let mut padded = new_name;
        while padded.len() < width {
            padded.push('\0');
        }
        *name = padded;
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.names.len()
    }

    /// Header size including the alignment padding before the data area.
    pub fn header_size(&self) -> u64 {
        let name_table_size: u64 = self.names.iter().map(|n| n.len() as u64 + 1).sum();
        let unaligned =
            PFS_HEADER_SIZE + self.names.len() as u64 * PFS_ENTRY_SIZE + name_table_size;
        unaligned.next_multiple_of(PFS_HEADER_ALIGNMENT)
    }

    /// Total image size: header plus all entry data.
    pub fn image_size(&self) -> u64 {
        self.header_size() + self.sizes.iter().sum::<u64>()
    }

    /// Serializes the header (magic, entry table, padded name table).
    pub fn build_header(&self) -> Result<Vec<u8>, PfsBuildError> {
        if self.names.is_empty() {
            return Err(PfsBuildError::Empty {});
        }

        let header_size = self.header_size();
        let name_table_size = header_size
            - PFS_HEADER_SIZE
            - self.names.len() as u64 * PFS_ENTRY_SIZE;

        let mut out = vec![0u8; header_size as usize];
        let mut cursor = Cursor::new(&mut out[..]);

        PartitionFsHeader {
            entry_count: self.names.len() as u32,
            name_table_size: name_table_size as u32,
            reserved: 0,
        }
        .write(&mut cursor)
        .expect("header serialization is infallible");

        let mut data_offset = 0u64;
        let mut name_offset = 0u32;
        for (name, &size) in self.names.iter().zip(&self.sizes) {
            PartitionFsEntry {
                offset: data_offset,
                size,
                name_offset,
            }
            .write(&mut cursor)
            .expect("entry serialization is infallible");

            data_offset += size;
            name_offset += name.len() as u32 + 1;
        }

        let names_at = (PFS_HEADER_SIZE + self.names.len() as u64 * PFS_ENTRY_SIZE) as usize;
        let mut at = names_at;
        for name in &self.names {
            out[at..at + name.len()].copy_from_slice(name.as_bytes());
            at += name.len() + 1; // NUL terminator
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::pfs::PartitionFs;
    use crate::storage::VecStorage;

    #[test]
    fn built_header_parses_back() {
        let mut builder = PartitionFsImageBuilder::new();
        let meta = builder.add_entry("00112233445566778899001122334455.cnmt.nca", 0x300);
        builder.add_entry("aabbccddeeff00112233445566778899.nca", 0x1000);

        builder
            .update_entry_name(meta, "ffeeddccbbaa99887766554433221100.cnmt.nca")
            .unwrap();

        let mut image = builder.build_header().unwrap();
        assert_eq!(image.len() as u64, builder.header_size());
        assert_eq!(image.len() % 0x20, 0);

        image.resize(builder.image_size() as usize, 0);

        let fs = PartitionFs::new(VecStorage::new(image)).unwrap();
        assert_eq!(fs.entry_count(), 2);
        assert_eq!(
            fs.entry_by_name("ffeeddccbbaa99887766554433221100.cnmt.nca"),
            Some(0)
        );
        assert_eq!(fs.entry(1).unwrap().offset, 0x300);
    }
}
