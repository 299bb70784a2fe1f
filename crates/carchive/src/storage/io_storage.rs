use snafu::ResultExt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use super::{IoSnafu, ReadableStorage, StorageError};

/// Storage over a seekable reader. The mutex makes concurrent reads from the
/// dump pipeline safe; the content provider contract requires blocking reads.
#[derive(Debug)]
pub struct RoIoStorage<Io: Read + Seek + Send> {
    io: Mutex<Io>,
    size: u64,
}

impl<Io: Read + Seek + Send> RoIoStorage<Io> {
    pub fn new(mut io: Io) -> Result<Self, StorageError> {
        let size = io
            .seek(SeekFrom::End(0))
            .context(IoSnafu { operation: "seek" })?;
        io.seek(SeekFrom::Start(0))
            .context(IoSnafu { operation: "seek" })?;
        Ok(Self {
            io: Mutex::new(io),
            size,
        })
    }
}

impl<Io: Read + Seek + Send> ReadableStorage for RoIoStorage<Io> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if offset + buf.len() as u64 > self.size {
            return Err(StorageError::OutOfBounds {});
        }
        let mut io = self.io.lock().unwrap();
        io.seek(SeekFrom::Start(offset))
            .context(IoSnafu { operation: "seek" })?;
        io.read_exact(buf).context(IoSnafu { operation: "read" })?;
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.size
    }
}

pub type FileRoStorage = RoIoStorage<File>;

impl FileRoStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let io = File::open(path).context(IoSnafu { operation: "open" })?;
        Self::new(io)
    }
}
