//! Read-only indexed filesystem: directory and file tables linked through
//! parent/sibling/child offsets, with file data in a trailing body region.

mod structs;

use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

use crate::formats::nca::{SectionStorage, SectionStorageAdapter};
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SliceStorage, SliceStorageError, StorageError,
};

pub use structs::{
    dir_entry_at, entry_name, file_entry_at, DirectoryEntry, FileEntry, RomFsHeader,
    RomFsOldHeader, DIR_ENTRY_FIXED_SIZE, FILE_ENTRY_FIXED_SIZE, ROMFS_HEADER_SIZE,
    ROMFS_OLD_HEADER_SIZE, ROMFS_VOID_ENTRY,
};

#[derive(Snafu, Debug)]
pub enum RomFsError {
    /// RomFS: malformed image: {what}
    Malformed { what: &'static str },
    /// RomFS: failed to parse the header
    HeaderParsing { source: binrw::Error },
    /// RomFS: failed to read from the storage
    Storage { source: StorageError },
    /// RomFS: storage slicing failed
    Slice { source: SliceStorageError },
    /// RomFS: no entry at path {path}
    NotFound { path: String },
    /// RomFS: read past the end of a file
    OutOfRange {},
}

/// How to treat characters that are not representable on common host
/// filesystems when generating paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IllegalCharReplacement {
    #[default]
    Keep,
    /// Replace characters invalid in FAT/NTFS-style names.
    ReplaceNonFs,
    /// Replace everything outside printable ASCII.
    AsciiOnly,
}

const ILLEGAL_FS_CHARS: &[u8] = b"\\/:*?\"<>|";

fn replace_illegal_chars(name: &str, mode: IllegalCharReplacement) -> String {
    match mode {
        IllegalCharReplacement::Keep => name.to_string(),
        IllegalCharReplacement::ReplaceNonFs => name
            .chars()
            .map(|c| {
                if c.is_ascii() && ILLEGAL_FS_CHARS.contains(&(c as u8)) {
                    '_'
                } else {
                    c
                }
            })
            .collect(),
        IllegalCharReplacement::AsciiOnly => name
            .chars()
            .map(|c| {
                if !c.is_ascii_graphic() && c != ' ' {
                    '_'
                } else if ILLEGAL_FS_CHARS.contains(&(c as u8)) {
                    '_'
                } else {
                    c
                }
            })
            .collect(),
    }
}

/// Kind + size of a traversal item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RomFsEntryKind {
    Directory,
    File { size: u64 },
}

#[derive(Debug)]
pub struct RomFs<S: ReadableStorage> {
    storage: S,
    dir_table: Vec<u8>,
    file_table: Vec<u8>,
    body_offset: u64,
}

impl<S: ReadableStorage> RomFs<S> {
    /// Parses the header (current or legacy layout, told apart by the
    /// declared header size) and loads both entry tables.
    pub fn new(storage: S) -> Result<Self, RomFsError> {
        let mut probe = [0u8; 8];
        storage.read(0, &mut probe).context(StorageSnafu)?;

        // the current layout declares a 64-bit header size of 0x50, the
        // legacy one a 32-bit size of 0x28
        let declared_u64 = u64::from_le_bytes(probe);
        let declared_u32 = u32::from_le_bytes(probe[..4].try_into().unwrap());

        let (dir_table_offset, dir_table_size, file_table_offset, file_table_size, body_offset) =
            if declared_u64 == ROMFS_HEADER_SIZE {
                let mut data = [0u8; ROMFS_HEADER_SIZE as usize];
                storage.read(0, &mut data).context(StorageSnafu)?;
                let header =
                    RomFsHeader::read(&mut Cursor::new(&data)).context(HeaderParsingSnafu)?;
                (
                    header.dir_table_offset,
                    header.dir_table_size,
                    header.file_table_offset,
                    header.file_table_size,
                    header.body_offset,
                )
            } else if declared_u32 as u64 == ROMFS_OLD_HEADER_SIZE {
                let mut data = [0u8; ROMFS_OLD_HEADER_SIZE as usize];
                storage.read(0, &mut data).context(StorageSnafu)?;
                let header =
                    RomFsOldHeader::read(&mut Cursor::new(&data)).context(HeaderParsingSnafu)?;
                (
                    header.dir_table_offset as u64,
                    header.dir_table_size as u64,
                    header.file_table_offset as u64,
                    header.file_table_size as u64,
                    header.body_offset as u64,
                )
            } else {
                return Err(RomFsError::Malformed {
                    what: "unrecognized header size",
                });
            };

        let size = storage.get_size();
        if dir_table_size == 0 || dir_table_offset + dir_table_size > size {
            return Err(RomFsError::Malformed {
                what: "directory table extents",
            });
        }
        if file_table_size == 0 || file_table_offset + file_table_size > size {
            return Err(RomFsError::Malformed {
                what: "file table extents",
            });
        }
        if body_offset >= size {
            return Err(RomFsError::Malformed {
                what: "body offset",
            });
        }

        let mut dir_table = vec![0u8; dir_table_size as usize];
        storage
            .read(dir_table_offset, &mut dir_table)
            .context(StorageSnafu)?;

        let mut file_table = vec![0u8; file_table_size as usize];
        storage
            .read(file_table_offset, &mut file_table)
            .context(StorageSnafu)?;

        Ok(Self {
            storage,
            dir_table,
            file_table,
            body_offset,
        })
    }

    pub fn root(&self) -> Result<DirectoryEntry, RomFsError> {
        dir_entry_at(&self.dir_table, 0).ok_or(RomFsError::Malformed {
            what: "missing root directory entry",
        })
    }

    pub fn directory_at(&self, offset: u32) -> Option<DirectoryEntry> {
        dir_entry_at(&self.dir_table, offset)
    }

    pub fn file_at(&self, offset: u32) -> Option<FileEntry> {
        file_entry_at(&self.file_table, offset)
    }

    pub fn directory_name(&self, entry: &DirectoryEntry) -> Option<&[u8]> {
        entry_name(
            &self.dir_table,
            DIR_ENTRY_FIXED_SIZE,
            entry.offset,
            entry.name_length,
        )
    }

    pub fn file_name(&self, entry: &FileEntry) -> Option<&[u8]> {
        entry_name(
            &self.file_table,
            FILE_ENTRY_FIXED_SIZE,
            entry.offset,
            entry.name_length,
        )
    }

    fn child_dir_by_name(
        &self,
        parent: &DirectoryEntry,
        name: &[u8],
    ) -> Option<DirectoryEntry> {
        let mut offset = parent.first_child_dir_offset;
        while offset != ROMFS_VOID_ENTRY {
            let entry = dir_entry_at(&self.dir_table, offset)?;
            if self.directory_name(&entry) == Some(name) {
                return Some(entry);
            }
            offset = entry.next_sibling_offset;
        }
        None
    }

    fn child_file_by_name(&self, parent: &DirectoryEntry, name: &[u8]) -> Option<FileEntry> {
        let mut offset = parent.first_child_file_offset;
        while offset != ROMFS_VOID_ENTRY {
            let entry = file_entry_at(&self.file_table, offset)?;
            if self.file_name(&entry) == Some(name) {
                return Some(entry);
            }
            offset = entry.next_sibling_offset;
        }
        None
    }

    /// Looks up a directory by `/`-separated absolute path.
    pub fn open_directory(&self, path: &str) -> Result<DirectoryEntry, RomFsError> {
        let mut current = self.root()?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self
                .child_dir_by_name(&current, component.as_bytes())
                .ok_or_else(|| RomFsError::NotFound {
                    path: path.to_string(),
                })?;
        }
        Ok(current)
    }

    /// Looks up a file by `/`-separated absolute path.
    pub fn open_file(&self, path: &str) -> Result<FileEntry, RomFsError> {
        let (dir_path, file_name) = path.rsplit_once('/').unwrap_or(("", path));
        if file_name.is_empty() {
            return Err(RomFsError::NotFound {
                path: path.to_string(),
            });
        }

        let parent = self.open_directory(dir_path)?;
        self.child_file_by_name(&parent, file_name.as_bytes())
            .ok_or_else(|| RomFsError::NotFound {
                path: path.to_string(),
            })
    }

    /// Reconstructs the absolute path of a directory by walking the parent
    /// chain.
    pub fn directory_path(
        &self,
        entry: &DirectoryEntry,
        mode: IllegalCharReplacement,
    ) -> Result<String, RomFsError> {
        if entry.name_length == 0 {
            return Ok("/".to_string());
        }

        let mut components = Vec::new();
        let mut current = *entry;
        // bounded by the table size, in case of a cyclic parent chain
        let max_depth = self.dir_table.len() / DIR_ENTRY_FIXED_SIZE + 1;
        for _ in 0..max_depth {
            let name = self
                .directory_name(&current)
                .ok_or(RomFsError::Malformed {
                    what: "directory name extends past the table",
                })?;
            let name = String::from_utf8_lossy(name).into_owned();
            components.push(replace_illegal_chars(&name, mode));

            if current.parent_offset == current.offset {
                break;
            }
            current = self
                .directory_at(current.parent_offset)
                .ok_or(RomFsError::Malformed {
                    what: "broken parent chain",
                })?;
            if current.name_length == 0 {
                break;
            }
        }

        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    /// Reconstructs the absolute path of a file.
    pub fn file_path(
        &self,
        entry: &FileEntry,
        mode: IllegalCharReplacement,
    ) -> Result<String, RomFsError> {
        let parent = self
            .directory_at(entry.parent_offset)
            .ok_or(RomFsError::Malformed {
                what: "broken parent chain",
            })?;
        let dir_path = self.directory_path(&parent, mode)?;

        let name = self.file_name(entry).ok_or(RomFsError::Malformed {
            what: "file name extends past the table",
        })?;
        let name = replace_illegal_chars(&String::from_utf8_lossy(name), mode);

        if dir_path == "/" {
            Ok(format!("/{}", name))
        } else {
            Ok(format!("{}/{}", dir_path, name))
        }
    }

    /// Depth-first traversal: children before siblings, directories before
    /// files within a node. Yields `(path, kind)` tuples in deterministic
    /// order.
    pub fn walk(&self) -> RomFsWalk<'_, S> {
        RomFsWalk {
            fs: self,
            stack: vec![WalkItem::Directory(0, "/".to_string())],
        }
    }

    pub fn read_file(
        &self,
        entry: &FileEntry,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), RomFsError> {
        if offset + buf.len() as u64 > entry.data_size {
            return Err(RomFsError::OutOfRange {});
        }
        self.storage
            .read(self.body_offset + entry.data_offset + offset, buf)
            .context(StorageSnafu)
    }

    pub fn read_file_to_vec(&self, entry: &FileEntry) -> Result<Vec<u8>, RomFsError> {
        let mut data = vec![0u8; entry.data_size as usize];
        self.read_file(entry, 0, &mut data)?;
        Ok(data)
    }

    /// Total size of all file entries.
    pub fn total_data_size(&self) -> Result<u64, RomFsError> {
        let mut total = 0u64;
        for item in self.walk() {
            if let (_, RomFsEntryKind::File { size }) = item? {
                total += size;
            }
        }
        Ok(total)
    }

    /// Offset of a file's bytes within the hash-target layer; feed to the
    /// hash-tree patcher when regenerating file contents.
    pub fn file_patch_offset(&self, entry: &FileEntry, data_offset: u64) -> u64 {
        self.body_offset + entry.data_offset + data_offset
    }

    pub fn body_offset(&self) -> u64 {
        self.body_offset
    }
}

enum WalkItem {
    Directory(u32, String),
    File(u32, String),
}

/// Iterator over the whole tree; see [`RomFs::walk`].
pub struct RomFsWalk<'a, S: ReadableStorage> {
    fs: &'a RomFs<S>,
    stack: Vec<WalkItem>,
}

impl<'a, S: ReadableStorage> Iterator for RomFsWalk<'a, S> {
    type Item = Result<(String, RomFsEntryKind), RomFsError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.stack.pop()?;

        match item {
            WalkItem::Directory(offset, path) => {
                let Some(entry) = self.fs.directory_at(offset) else {
                    return Some(Err(RomFsError::Malformed {
                        what: "dangling directory offset",
                    }));
                };

                // push siblings first so children come out before them;
                // within the node directories precede files
                let mut files = Vec::new();
                let mut file_offset = entry.first_child_file_offset;
                while file_offset != ROMFS_VOID_ENTRY {
                    let Some(file) = self.fs.file_at(file_offset) else {
                        return Some(Err(RomFsError::Malformed {
                            what: "dangling file offset",
                        }));
                    };
                    let name =
                        String::from_utf8_lossy(self.fs.file_name(&file).unwrap_or(b"?"))
                            .into_owned();
                    files.push(WalkItem::File(file_offset, join_path(&path, &name)));
                    file_offset = file.next_sibling_offset;
                }

                let mut dirs = Vec::new();
                let mut dir_offset = entry.first_child_dir_offset;
                while dir_offset != ROMFS_VOID_ENTRY {
                    let Some(dir) = self.fs.directory_at(dir_offset) else {
                        return Some(Err(RomFsError::Malformed {
                            what: "dangling directory offset",
                        }));
                    };
                    let name =
                        String::from_utf8_lossy(self.fs.directory_name(&dir).unwrap_or(b"?"))
                            .into_owned();
                    dirs.push(WalkItem::Directory(dir_offset, join_path(&path, &name)));
                    dir_offset = dir.next_sibling_offset;
                }

                // reversed so the stack pops in table order
                for item in files.into_iter().rev() {
                    self.stack.push(item);
                }
                for item in dirs.into_iter().rev() {
                    self.stack.push(item);
                }

                Some(Ok((path, RomFsEntryKind::Directory)))
            }
            WalkItem::File(offset, path) => {
                let Some(entry) = self.fs.file_at(offset) else {
                    return Some(Err(RomFsError::Malformed {
                        what: "dangling file offset",
                    }));
                };
                Some(Ok((
                    path,
                    RomFsEntryKind::File {
                        size: entry.data_size,
                    },
                )))
            }
        }
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

pub type SectionRomFs<S> = RomFs<SliceStorage<SectionStorageAdapter<S>>>;

impl<S: ReadableStorage> SectionRomFs<S> {
    /// Opens the filesystem stored in a section's hash-target region.
    pub fn from_section(storage: SectionStorage<S>) -> Result<Self, RomFsError> {
        let (offset, size) = storage.hash_target_extents();
        let storage = SectionStorageAdapter(storage)
            .slice(offset, size)
            .context(SliceSnafu)?;
        Self::new(storage)
    }

    /// For filesystems backed by a patch section: whether any byte of the
    /// file is served from the patch side of the indirect layer.
    pub fn is_file_updated(&self, entry: &FileEntry) -> Result<bool, RomFsError> {
        let section_storage = &self.storage.get_ref().0;
        let absolute = self.storage.offset() + self.body_offset + entry.data_offset;
        section_storage
            .is_range_updated(absolute, entry.data_size)
            .map_err(|_| RomFsError::Malformed {
                what: "update detection failed",
            })
    }
}

#[cfg(test)]
pub(crate) mod test_image {
    use super::*;

    pub struct DirSpec {
        pub name: &'static str,
        pub parent: usize,
    }

    pub struct FileSpec {
        pub name: &'static str,
        pub parent: usize,
        pub data: &'static [u8],
    }

    /// Builds a minimal current-format image. Directory index 0 is the
    /// root; `parent` fields index into `dirs`.
    pub fn build(dirs: &[DirSpec], files: &[FileSpec]) -> Vec<u8> {
        fn align4(v: usize) -> usize {
            (v + 3) & !3
        }

        // compute record offsets
        let mut dir_offsets = vec![0u32; dirs.len() + 1];
        let mut at = align4(DIR_ENTRY_FIXED_SIZE); // root record, empty name
        for (i, dir) in dirs.iter().enumerate() {
            dir_offsets[i + 1] = at as u32;
            at = align4(at + DIR_ENTRY_FIXED_SIZE + dir.name.len());
        }
        let dir_table_size = at;

        let mut file_offsets = vec![0u32; files.len()];
        let mut at = 0;
        for (i, file) in files.iter().enumerate() {
            file_offsets[i] = at as u32;
            at = align4(at + FILE_ENTRY_FIXED_SIZE + file.name.len());
        }
        let file_table_size = at;

        // sibling/child links, children in declaration order
        let node_count = dirs.len() + 1;
        let mut first_child_dir = vec![ROMFS_VOID_ENTRY; node_count];
        let mut next_dir_sibling = vec![ROMFS_VOID_ENTRY; node_count];
        for (i, dir) in dirs.iter().enumerate().rev() {
            next_dir_sibling[i + 1] = first_child_dir[dir.parent];
            first_child_dir[dir.parent] = dir_offsets[i + 1];
        }

        let mut first_child_file = vec![ROMFS_VOID_ENTRY; node_count];
        let mut next_file_sibling = vec![ROMFS_VOID_ENTRY; files.len()];
        for (i, file) in files.iter().enumerate().rev() {
            next_file_sibling[i] = first_child_file[file.parent];
            first_child_file[file.parent] = file_offsets[i];
        }

        // serialize the directory table
        let mut dir_table = vec![0u8; dir_table_size];
        let mut write_dir = |offset: u32,
                             parent: u32,
                             sibling: u32,
                             child_dir: u32,
                             child_file: u32,
                             name: &str| {
            let at = offset as usize;
            dir_table[at..at + 4].copy_from_slice(&parent.to_le_bytes());
            dir_table[at + 4..at + 8].copy_from_slice(&sibling.to_le_bytes());
            dir_table[at + 8..at + 12].copy_from_slice(&child_dir.to_le_bytes());
            dir_table[at + 12..at + 16].copy_from_slice(&child_file.to_le_bytes());
            dir_table[at + 16..at + 20].copy_from_slice(&ROMFS_VOID_ENTRY.to_le_bytes());
            dir_table[at + 20..at + 24].copy_from_slice(&(name.len() as u32).to_le_bytes());
            dir_table[at + 24..at + 24 + name.len()].copy_from_slice(name.as_bytes());
        };

        write_dir(0, 0, ROMFS_VOID_ENTRY, first_child_dir[0], first_child_file[0], "");
        for (i, dir) in dirs.iter().enumerate() {
            write_dir(
                dir_offsets[i + 1],
                dir_offsets[dir.parent],
                next_dir_sibling[i + 1],
                first_child_dir[i + 1],
                first_child_file[i + 1],
                dir.name,
            );
        }

        // serialize the file table and collect body bytes
        let mut file_table = vec![0u8; file_table_size];
        let mut body = Vec::new();
        for (i, file) in files.iter().enumerate() {
            let at = file_offsets[i] as usize;
            let data_offset = body.len() as u64;
            body.extend_from_slice(file.data);

            file_table[at..at + 4].copy_from_slice(&dir_offsets[file.parent].to_le_bytes());
            file_table[at + 4..at + 8].copy_from_slice(&next_file_sibling[i].to_le_bytes());
            file_table[at + 8..at + 16].copy_from_slice(&data_offset.to_le_bytes());
            file_table[at + 16..at + 24]
                .copy_from_slice(&(file.data.len() as u64).to_le_bytes());
            file_table[at + 24..at + 28].copy_from_slice(&ROMFS_VOID_ENTRY.to_le_bytes());
            file_table[at + 28..at + 32]
                .copy_from_slice(&(file.name.len() as u32).to_le_bytes());
            file_table[at + 32..at + 32 + file.name.len()]
                .copy_from_slice(file.name.as_bytes());
        }

        // assemble: header, (empty hash tables), dir table, file table, body
        let dir_table_offset = ROMFS_HEADER_SIZE;
        let file_table_offset = dir_table_offset + dir_table_size as u64;
        let body_offset = file_table_offset + file_table_size as u64;

        let mut image = Vec::new();
        for value in [
            ROMFS_HEADER_SIZE,
            dir_table_offset, // dir hash table (empty, points at dir table)
            0,
            dir_table_offset,
            dir_table_size as u64,
            file_table_offset, // file hash table (empty)
            0,
            file_table_offset,
            file_table_size as u64,
            body_offset,
        ] {
            image.extend_from_slice(&value.to_le_bytes());
        }
        image.extend_from_slice(&dir_table);
        image.extend_from_slice(&file_table);
        image.extend_from_slice(&body);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::test_image::{DirSpec, FileSpec};
    use super::*;
    use crate::storage::VecStorage;

    fn sample() -> RomFs<VecStorage> {
        let image = test_image::build(
            &[
                DirSpec {
                    name: "data",
                    parent: 0,
                },
                DirSpec {
                    name: "sub",
                    parent: 1,
                },
            ],
            &[
                FileSpec {
                    name: "root.bin",
                    parent: 0,
                    data: b"rootfile",
                },
                FileSpec {
                    name: "inner.txt",
                    parent: 2,
                    data: b"hello from the inside",
                },
            ],
        );
        RomFs::new(VecStorage::new(image)).unwrap()
    }

    #[test]
    fn path_lookup_and_read() {
        let fs = sample();

        let file = fs.open_file("/data/sub/inner.txt").unwrap();
        assert_eq!(file.data_size, 21);

        let mut buf = [0u8; 5];
        fs.read_file(&file, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let root_file = fs.open_file("/root.bin").unwrap();
        assert_eq!(fs.read_file_to_vec(&root_file).unwrap(), b"rootfile");

        assert!(matches!(
            fs.open_file("/data/missing"),
            Err(RomFsError::NotFound { .. })
        ));
        assert!(fs.open_directory("/data/sub").is_ok());
    }

    #[test]
    fn path_generation() {
        let fs = sample();
        let file = fs.open_file("/data/sub/inner.txt").unwrap();
        assert_eq!(
            fs.file_path(&file, IllegalCharReplacement::Keep).unwrap(),
            "/data/sub/inner.txt"
        );

        let dir = fs.open_directory("/data/sub").unwrap();
        assert_eq!(
            fs.directory_path(&dir, IllegalCharReplacement::Keep)
                .unwrap(),
            "/data/sub"
        );
    }

    #[test]
    fn deterministic_walk() {
        let fs = sample();
        let items: Vec<_> = fs.walk().collect::<Result<Vec<_>, _>>().unwrap();
        let paths: Vec<_> = items.iter().map(|(path, _)| path.as_str()).collect();

        assert_eq!(
            paths,
            ["/", "/data", "/data/sub", "/data/sub/inner.txt", "/root.bin"]
        );
        assert_eq!(
            items[3].1,
            RomFsEntryKind::File { size: 21 },
        );
    }

    #[test]
    fn illegal_char_replacement() {
        assert_eq!(
            replace_illegal_chars("a:b?c", IllegalCharReplacement::ReplaceNonFs),
            "a_b_c"
        );
        assert_eq!(
            replace_illegal_chars("ключ.txt", IllegalCharReplacement::AsciiOnly)
                .chars()
                .filter(|&c| c == '_')
                .count(),
            4
        );
        assert_eq!(
            replace_illegal_chars("plain.txt", IllegalCharReplacement::Keep),
            "plain.txt"
        );
    }
}
