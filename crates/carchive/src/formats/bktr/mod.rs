//! Bucket-tree index: a two-level B-tree-like structure mapping virtual
//! offset ranges to per-consumer entries. It backs the sparse, indirect,
//! CTR-EX and compressed storage layers.
//!
//! The table layout is: one root offset node, optionally a layer of L2 offset
//! nodes, then a run of entry nodes. Every node is `NODE_SIZE` bytes and
//! starts with a [`NodeHeader`].

use crate::hexstring::HexData;
use binrw::{BinRead, BinWrite};
use snafu::Snafu;
use std::fmt::Debug;
use std::marker::PhantomData;

mod entries;

pub use entries::{
    AesCtrExEntry, CompressedEntry, CompressionType, IndirectEntry, StorageIndex, TreeEntry,
    COMPRESSION_INVALID_PHYS_SIZE,
};

pub const NODE_SIZE: u64 = 0x4000;
pub const NODE_HEADER_SIZE: u64 = 0x10;
const NODE_SIZE_MIN: u64 = 0x400;
const NODE_SIZE_MAX: u64 = 0x80000;

/// Tree descriptor embedded in the section header next to the table extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct BucketTreeHeader {
    pub magic: HexData<4>,
    pub version: u32,
    pub entry_count: u32,
    pub reserved: u32,
}

pub const BKTR_MAGIC: [u8; 4] = *b"BKTR";
pub const BKTR_VERSION: u32 = 1;

impl BucketTreeHeader {
    pub fn validate(&self) -> Result<(), BktrError> {
        if self.magic.0 != BKTR_MAGIC {
            return Err(BktrError::MalformedTable {
                what: "bucket header magic",
            });
        }
        if self.version > BKTR_VERSION {
            return Err(BktrError::MalformedTable {
                what: "bucket header version",
            });
        }
        if self.entry_count == 0 {
            return Err(BktrError::MalformedTable {
                what: "bucket header entry count",
            });
        }
        Ok(())
    }
}

/// Table extents (relative to the owning layer) plus the tree descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct BucketInfo {
    pub offset: u64,
    pub size: u64,
    pub header: BucketTreeHeader,
}

impl BucketInfo {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// An absent bucket, as stored in headers of sections without the
    /// corresponding layer.
    pub fn zeroed() -> Self {
        Self {
            offset: 0,
            size: 0,
            header: BucketTreeHeader {
                magic: HexData([0; 4]),
                version: 0,
                entry_count: 0,
                reserved: 0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NodeHeader {
    pub index: u32,
    pub count: u32,
    /// End offset of the range covered by this node.
    pub offset: u64,
}

#[derive(Snafu, Debug)]
pub enum BktrError {
    /// Bucket tree table failed validation: {what}
    MalformedTable { what: &'static str },
    /// No bucket tree entry covers virtual offset {offset:#x}
    OutOfRange { offset: u64 },
}

/// Fully-resident bucket tree over entries of type `E`.
pub struct BucketTree<E: TreeEntry> {
    table: Vec<u8>,
    node_size: u64,
    offset_count: u32,
    entry_set_count: u32,
    node_storage_size: u64,
    entry_storage_size: u64,
    start_offset: u64,
    end_offset: u64,
    _entries: PhantomData<E>,
}

impl<E: TreeEntry> Debug for BucketTree<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketTree")
            .field("entry_set_count", &self.entry_set_count)
            .field("start_offset", &self.start_offset)
            .field("end_offset", &self.end_offset)
            .finish()
    }
}

fn read_u64_le(bytes: &[u8], offset: u64) -> u64 {
    let offset = offset as usize;
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn read_node_header(table: &[u8], offset: u64) -> NodeHeader {
    NodeHeader {
        index: u32::from_le_bytes(table[offset as usize..offset as usize + 4].try_into().unwrap()),
        count: u32::from_le_bytes(
            table[offset as usize + 4..offset as usize + 8]
                .try_into()
                .unwrap(),
        ),
        offset: read_u64_le(table, offset + 8),
    }
}

fn verify_node_header(
    header: &NodeHeader,
    node_index: u32,
    node_size: u64,
    entry_size: u64,
) -> Result<(), BktrError> {
    if header.index != node_index
        || header.count == 0
        || header.count as u64 > (node_size - NODE_HEADER_SIZE) / entry_size
    {
        return Err(BktrError::MalformedTable {
            what: "node header",
        });
    }
    Ok(())
}

fn offsets_per_node(node_size: u64) -> u32 {
    ((node_size - NODE_HEADER_SIZE) / 8) as u32
}

fn entries_per_node(node_size: u64, entry_size: u64) -> u32 {
    ((node_size - NODE_HEADER_SIZE) / entry_size) as u32
}

fn entry_set_count(node_size: u64, entry_size: u64, entry_count: u32) -> u32 {
    let per_node = entries_per_node(node_size, entry_size);
    (entry_count + per_node - 1) / per_node
}

fn l2_node_count(node_size: u64, entry_size: u64, entry_count: u32) -> u32 {
    let per_node = offsets_per_node(node_size);
    let entry_sets = entry_set_count(node_size, entry_size, entry_count);

    if entry_sets <= per_node {
        return 0;
    }

    let l2_count = (entry_sets + per_node - 1) / per_node;
    if l2_count > per_node {
        return 0;
    }

    (entry_sets - (per_node - (l2_count - 1)) + per_node - 1) / per_node
}

pub fn node_storage_size(node_size: u64, entry_size: u64, entry_count: u32) -> u64 {
    (1 + l2_node_count(node_size, entry_size, entry_count) as u64) * node_size
}

pub fn entry_storage_size(node_size: u64, entry_size: u64, entry_count: u32) -> u64 {
    entry_set_count(node_size, entry_size, entry_count) as u64 * node_size
}

impl<E: TreeEntry> BucketTree<E> {
    /// Builds a tree from the descriptor and the raw table bytes read from
    /// the owning layer.
    pub fn new(bucket: &BucketInfo, table: Vec<u8>) -> Result<Self, BktrError> {
        bucket.header.validate()?;

        let node_size = NODE_SIZE;
        let entry_size = E::ENTRY_SIZE;
        let entry_count = bucket.header.entry_count;

        assert!(node_size.is_power_of_two());
        assert!((NODE_SIZE_MIN..=NODE_SIZE_MAX).contains(&node_size));
        assert!(node_size >= entry_size + NODE_HEADER_SIZE);

        let node_storage_size = node_storage_size(node_size, entry_size, entry_count);
        let entry_storage_size = entry_storage_size(node_size, entry_size, entry_count);

        if node_storage_size + entry_storage_size > bucket.size
            || (table.len() as u64) < node_storage_size + entry_storage_size
        {
            return Err(BktrError::MalformedTable {
                what: "table extents",
            });
        }

        let offset_count = offsets_per_node(node_size);
        let entry_set_count = entry_set_count(node_size, entry_size, entry_count);

        // validate the root offset node
        let root_header = read_node_header(&table, 0);
        verify_node_header(&root_header, 0, node_size, 8)?;

        if root_header.count != entry_set_count {
            return Err(BktrError::MalformedTable {
                what: "root offset node count",
            });
        }

        let node_start_offset = read_u64_le(&table, NODE_HEADER_SIZE);
        let start_offset = if offset_count < entry_set_count && root_header.count < offset_count {
            read_u64_le(&table, NODE_HEADER_SIZE + root_header.count as u64 * 8)
        } else {
            node_start_offset
        };
        let end_offset = root_header.offset;

        if start_offset > node_start_offset || start_offset >= end_offset {
            return Err(BktrError::MalformedTable {
                what: "root offset node range",
            });
        }

        Ok(Self {
            table,
            node_size,
            offset_count,
            entry_set_count,
            node_storage_size,
            entry_storage_size,
            start_offset,
            end_offset,
            _entries: PhantomData,
        })
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Total virtual size covered by the tree.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    fn has_l2(&self) -> bool {
        self.offset_count < self.entry_set_count
    }

    fn has_l2_offsets_in_l1(&self) -> bool {
        let root_header = read_node_header(&self.table, 0);
        self.has_l2() && root_header.count < self.offset_count
    }

    /// Binary search over a slice of little-endian u64 range starts; returns
    /// the index of the entry whose `[start, next_start)` range covers
    /// `virtual_offset`. Lower bound inclusive, upper exclusive.
    fn search_offsets(offsets: &[u8], virtual_offset: u64) -> Option<u32> {
        let count = (offsets.len() / 8) as u32;
        if count == 1 {
            return Some(0);
        }

        let at = |i: u32| read_u64_le(offsets, i as u64 * 8);

        let (mut low, mut high) = (0u32, count - 1);
        while low <= high {
            let half = (low + high) / 2;
            if at(half) > virtual_offset {
                high = half.checked_sub(1)?;
            } else if half == count - 1 || at(half + 1) > virtual_offset {
                return Some(half);
            } else {
                low = half + 1;
            }
        }
        None
    }

    /// Binary search inside an entry node; entries lead with their virtual
    /// offset, so stride by entry size.
    fn search_entries(&self, node_offset: u64, count: u32, virtual_offset: u64) -> Option<u32> {
        if count == 1 {
            return Some(0);
        }

        let at = |i: u32| {
            read_u64_le(
                &self.table,
                node_offset + NODE_HEADER_SIZE + i as u64 * E::ENTRY_SIZE,
            )
        };

        let (mut low, mut high) = (0u32, count - 1);
        while low <= high {
            let half = (low + high) / 2;
            if at(half) > virtual_offset {
                high = half.checked_sub(1)?;
            } else if half == count - 1 || at(half + 1) > virtual_offset {
                return Some(half);
            } else {
                low = half + 1;
            }
        }
        None
    }

    fn l2_node_offset(&self, node_index: u32) -> u64 {
        (node_index as u64 + 1) * self.node_size
    }

    fn entry_set_offset(&self, entry_set_index: u32) -> u64 {
        self.node_storage_size + entry_set_index as u64 * self.node_size
    }

    /// Locates the entry covering `virtual_offset` via the two-level search.
    pub fn find(&self, virtual_offset: u64) -> Result<Visitor<'_, E>, BktrError> {
        if virtual_offset >= self.end_offset {
            return Err(BktrError::OutOfRange {
                offset: virtual_offset,
            });
        }

        let root_header = read_node_header(&self.table, 0);
        let root_offsets_start = NODE_HEADER_SIZE as usize;
        let root_offsets_end = root_offsets_start + root_header.count as usize * 8;

        let entry_set_index = if self.has_l2_offsets_in_l1()
            && virtual_offset < read_u64_le(&self.table, NODE_HEADER_SIZE)
        {
            // part of the L2 offsets spilled into the root node
            let spill_start = root_offsets_end;
            let spill_end = root_offsets_start + self.offset_count as usize * 8;
            Self::search_offsets(&self.table[spill_start..spill_end], virtual_offset).ok_or(
                BktrError::MalformedTable {
                    what: "L1 spill offsets",
                },
            )?
        } else {
            let index = Self::search_offsets(
                &self.table[root_offsets_start..root_offsets_end],
                virtual_offset,
            )
            .ok_or(BktrError::MalformedTable {
                what: "root offsets",
            })?;

            if self.has_l2() {
                let node_index = index;
                if node_index >= self.offset_count {
                    return Err(BktrError::MalformedTable {
                        what: "L2 node index",
                    });
                }

                let node_offset = self.l2_node_offset(node_index);
                if node_offset + NODE_HEADER_SIZE > self.node_storage_size {
                    return Err(BktrError::MalformedTable {
                        what: "L2 node offset",
                    });
                }

                let node_header = read_node_header(&self.table, node_offset);
                verify_node_header(&node_header, node_index, self.node_size, 8)?;

                let offsets_start = (node_offset + NODE_HEADER_SIZE) as usize;
                let offsets_end = offsets_start + node_header.count as usize * 8;
                let offset_index =
                    Self::search_offsets(&self.table[offsets_start..offsets_end], virtual_offset)
                        .ok_or(BktrError::MalformedTable {
                            what: "L2 offsets",
                        })?;

                (self.offset_count - root_header.count)
                    + self.offset_count * node_index
                    + offset_index
            } else {
                index
            }
        };

        if entry_set_index >= self.entry_set_count {
            return Err(BktrError::MalformedTable {
                what: "entry set index",
            });
        }

        // find the entry within the entry set node
        let entry_set_offset = self.entry_set_offset(entry_set_index);
        if entry_set_offset + NODE_HEADER_SIZE > self.node_storage_size + self.entry_storage_size {
            return Err(BktrError::MalformedTable {
                what: "entry set offset",
            });
        }

        let entry_set_header = read_node_header(&self.table, entry_set_offset);
        verify_node_header(
            &entry_set_header,
            entry_set_index,
            self.node_size,
            E::ENTRY_SIZE,
        )?;

        let entry_index = self
            .search_entries(entry_set_offset, entry_set_header.count, virtual_offset)
            .ok_or(BktrError::OutOfRange {
                offset: virtual_offset,
            })?;

        Ok(Visitor {
            tree: self,
            entry_set: entry_set_header,
            entry_index,
        })
    }
}

/// Position inside the entry nodes; advances in ascending virtual-offset
/// order, crossing node boundaries with validation.
pub struct Visitor<'a, E: TreeEntry> {
    tree: &'a BucketTree<E>,
    entry_set: NodeHeader,
    entry_index: u32,
}

impl<'a, E: TreeEntry> Visitor<'a, E> {
    pub fn current(&self) -> E {
        let offset = self.tree.entry_set_offset(self.entry_set.index)
            + NODE_HEADER_SIZE
            + self.entry_index as u64 * E::ENTRY_SIZE;
        E::parse(&self.tree.table[offset as usize..(offset + E::ENTRY_SIZE) as usize])
    }

    pub fn can_advance(&self) -> bool {
        self.entry_index + 1 < self.entry_set.count
            || self.entry_set.index + 1 < self.tree.entry_set_count
    }

    pub fn advance(&mut self) -> Result<(), BktrError> {
        let mut entry_index = self.entry_index + 1;

        if entry_index == self.entry_set.count {
            let entry_set_index = self.entry_set.index + 1;
            if entry_set_index >= self.tree.entry_set_count {
                return Err(BktrError::MalformedTable {
                    what: "advance past last entry node",
                });
            }

            let end_offset = self.entry_set.offset;
            let entry_set_offset = self.tree.entry_set_offset(entry_set_index);

            if entry_set_offset + NODE_HEADER_SIZE + 8
                > self.tree.node_storage_size + self.tree.entry_storage_size
            {
                return Err(BktrError::MalformedTable {
                    what: "next entry node offset",
                });
            }

            let header = read_node_header(&self.tree.table, entry_set_offset);
            verify_node_header(&header, entry_set_index, self.tree.node_size, E::ENTRY_SIZE)?;

            // the first entry of the next node must continue exactly where
            // the previous node ended
            let start = read_u64_le(&self.tree.table, entry_set_offset + NODE_HEADER_SIZE);
            if start != end_offset || start >= header.offset {
                return Err(BktrError::MalformedTable {
                    what: "next entry node continuity",
                });
            }

            self.entry_set = header;
            entry_index = 0;
        }

        self.entry_index = entry_index;
        Ok(())
    }

    /// Virtual offset where the range of the current entry ends: the next
    /// entry's start, or the tree end for the last entry. Advances the
    /// visitor onto the next entry when there is one.
    pub fn next_entry_offset(&mut self) -> Result<u64, BktrError> {
        if self.can_advance() {
            self.advance()?;
            Ok(self.current().virtual_offset())
        } else {
            Ok(self.tree.end_offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a single-node table covering `entries`.
    fn build_table(entries: &[IndirectEntry]) -> (BucketInfo, Vec<u8>) {
        let end_offset = entries.last().unwrap().virtual_offset + 0x1000;
        let mut table = vec![0u8; (NODE_SIZE * 2) as usize];

        // root offset node: index 0, count 1, end offset
        table[0..4].copy_from_slice(&0u32.to_le_bytes());
        table[4..8].copy_from_slice(&1u32.to_le_bytes());
        table[8..16].copy_from_slice(&end_offset.to_le_bytes());
        table[16..24].copy_from_slice(&entries[0].virtual_offset.to_le_bytes());

        // entry node
        let base = NODE_SIZE as usize;
        table[base..base + 4].copy_from_slice(&0u32.to_le_bytes());
        table[base + 4..base + 8].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        table[base + 8..base + 16].copy_from_slice(&end_offset.to_le_bytes());

        for (i, entry) in entries.iter().enumerate() {
            let at = base + 0x10 + i * IndirectEntry::ENTRY_SIZE as usize;
            table[at..at + 8].copy_from_slice(&entry.virtual_offset.to_le_bytes());
            table[at + 8..at + 16].copy_from_slice(&entry.physical_offset.to_le_bytes());
            table[at + 16..at + 20].copy_from_slice(&(entry.storage_index as u32).to_le_bytes());
        }

        let bucket = BucketInfo {
            offset: 0,
            size: NODE_SIZE * 2,
            header: BucketTreeHeader {
                magic: HexData(BKTR_MAGIC),
                version: BKTR_VERSION,
                entry_count: entries.len() as u32,
                reserved: 0,
            },
        };

        (bucket, table)
    }

    fn entry(virtual_offset: u64, physical_offset: u64, storage_index: StorageIndex) -> IndirectEntry {
        IndirectEntry {
            virtual_offset,
            physical_offset,
            storage_index,
        }
    }

    #[test]
    fn find_and_advance() {
        let entries = [
            entry(0, 0, StorageIndex::Original),
            entry(0x2000, 0x1000, StorageIndex::Patch),
            entry(0x5000, 0x4000, StorageIndex::Original),
        ];
        let (bucket, table) = build_table(&entries);
        let tree = BucketTree::<IndirectEntry>::new(&bucket, table).unwrap();

        assert_eq!(tree.end_offset(), 0x6000);

        let visitor = tree.find(0).unwrap();
        assert_eq!(visitor.current().virtual_offset, 0);

        let visitor = tree.find(0x1fff).unwrap();
        assert_eq!(visitor.current().virtual_offset, 0);

        let mut visitor = tree.find(0x2000).unwrap();
        assert_eq!(visitor.current().virtual_offset, 0x2000);
        assert_eq!(visitor.current().storage_index, StorageIndex::Patch);

        assert!(visitor.can_advance());
        assert_eq!(visitor.next_entry_offset().unwrap(), 0x5000);
        assert_eq!(visitor.current().physical_offset, 0x4000);
        assert_eq!(visitor.next_entry_offset().unwrap(), 0x6000);

        assert!(matches!(
            tree.find(0x6000),
            Err(BktrError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let entries = [entry(0, 0, StorageIndex::Original)];
        let (mut bucket, table) = build_table(&entries);
        bucket.header.magic = HexData(*b"NOPE");

        assert!(BucketTree::<IndirectEntry>::new(&bucket, table).is_err());
    }

    #[test]
    fn rejects_undersized_bucket() {
        let entries = [entry(0, 0, StorageIndex::Original)];
        let (mut bucket, table) = build_table(&entries);
        bucket.size = NODE_SIZE; // node storage alone needs this much

        assert!(BucketTree::<IndirectEntry>::new(&bucket, table).is_err());
    }
}
