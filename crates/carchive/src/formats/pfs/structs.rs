use binrw::{BinRead, BinWrite};

pub const PFS_HEADER_SIZE: u64 = 0x10;
pub const PFS_ENTRY_SIZE: u64 = 0x18;
/// Data areas are aligned so entry offset zero starts on a 0x20 boundary.
pub const PFS_HEADER_ALIGNMENT: u64 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"PFS0")]
pub struct PartitionFsHeader {
    pub entry_count: u32,
    pub name_table_size: u32,
    pub reserved: u32,
}

/// Entry offsets are relative to the start of the data area (the end of the
/// name table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct PartitionFsEntry {
    pub offset: u64,
    pub size: u64,
    #[brw(pad_after = 4)]
    pub name_offset: u32,
}

/// Reads a NUL-terminated name out of the name table. Names at the very end
/// of the table may lack the terminator.
pub fn name_at(name_table: &[u8], offset: u32) -> Option<&str> {
    let start = offset as usize;
    if start >= name_table.len() {
        return None;
    }
    let end = name_table[start..]
        .iter()
        .position(|&c| c == 0)
        .map(|p| start + p)
        .unwrap_or(name_table.len());

    std::str::from_utf8(&name_table[start..end]).ok()
}
