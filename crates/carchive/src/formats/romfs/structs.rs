use binrw::{BinRead, BinWrite};

pub const ROMFS_HEADER_SIZE: u64 = 0x50;
pub const ROMFS_OLD_HEADER_SIZE: u64 = 0x28;
/// "No entry" sentinel in every offset field.
pub const ROMFS_VOID_ENTRY: u32 = u32::MAX;

pub const DIR_ENTRY_FIXED_SIZE: usize = 0x18;
pub const FILE_ENTRY_FIXED_SIZE: usize = 0x20;

/// Current header: all extents as 64-bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct RomFsHeader {
    pub header_size: u64,
    pub dir_hash_table_offset: u64,
    pub dir_hash_table_size: u64,
    pub dir_table_offset: u64,
    pub dir_table_size: u64,
    pub file_hash_table_offset: u64,
    pub file_hash_table_size: u64,
    pub file_table_offset: u64,
    pub file_table_size: u64,
    pub body_offset: u64,
}

/// Legacy 0x28-byte header with 32-bit extents, used by NCA0 images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct RomFsOldHeader {
    pub header_size: u32,
    pub dir_hash_table_offset: u32,
    pub dir_hash_table_size: u32,
    pub dir_table_offset: u32,
    pub dir_table_size: u32,
    pub file_hash_table_offset: u32,
    pub file_hash_table_size: u32,
    pub file_table_offset: u32,
    pub file_table_size: u32,
    pub body_offset: u32,
}

/// Directory record decoded out of the directory table. `offset` is the
/// record's own byte offset within the table, which is how other records
/// refer to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub offset: u32,
    pub parent_offset: u32,
    pub next_sibling_offset: u32,
    pub first_child_dir_offset: u32,
    pub first_child_file_offset: u32,
    pub hash_chain_next: u32,
    pub name_length: u32,
}

/// File record decoded out of the file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    pub offset: u32,
    pub parent_offset: u32,
    pub next_sibling_offset: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub hash_chain_next: u32,
    pub name_length: u32,
}

fn u32_at(table: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(
        table.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

fn u64_at(table: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(
        table.get(offset..offset + 8)?.try_into().ok()?,
    ))
}

/// Decodes the fixed part of a directory record; the name bytes follow it.
pub fn dir_entry_at(table: &[u8], offset: u32) -> Option<DirectoryEntry> {
    let base = offset as usize;
    Some(DirectoryEntry {
        offset,
        parent_offset: u32_at(table, base)?,
        next_sibling_offset: u32_at(table, base + 4)?,
        first_child_dir_offset: u32_at(table, base + 8)?,
        first_child_file_offset: u32_at(table, base + 0xc)?,
        hash_chain_next: u32_at(table, base + 0x10)?,
        name_length: u32_at(table, base + 0x14)?,
    })
}

pub fn file_entry_at(table: &[u8], offset: u32) -> Option<FileEntry> {
    let base = offset as usize;
    Some(FileEntry {
        offset,
        parent_offset: u32_at(table, base)?,
        next_sibling_offset: u32_at(table, base + 4)?,
        data_offset: u64_at(table, base + 8)?,
        data_size: u64_at(table, base + 0x10)?,
        hash_chain_next: u32_at(table, base + 0x18)?,
        name_length: u32_at(table, base + 0x1c)?,
    })
}

/// Name bytes of a record; names may abut the next record with no
/// terminator, so length comes from the record itself.
pub fn entry_name(table: &[u8], fixed_size: usize, offset: u32, name_length: u32) -> Option<&[u8]> {
    let start = offset as usize + fixed_size;
    table.get(start..start + name_length as usize)
}
