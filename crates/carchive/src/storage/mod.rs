use snafu::Snafu;
use std::io::BufReader;

mod io_storage;
mod shared_storage;
mod slice_storage;
mod storage_io;
mod vec_storage;

pub use io_storage::{FileRoStorage, RoIoStorage};
pub use shared_storage::SharedStorage;
pub use slice_storage::{SliceStorage, SliceStorageError};
pub use storage_io::StorageIo;
pub use vec_storage::VecStorage;

/// Random-access byte source. The whole reader stack is read-only: writes
/// leave the core as byte patches, never as in-place storage mutation.
pub trait ReadableStorage: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;
    fn get_size(&self) -> u64;
}

impl<S: ReadableStorage + ?Sized> ReadableStorage for Box<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read(offset, buf)
    }

    fn get_size(&self) -> u64 {
        (**self).get_size()
    }
}

pub trait ReadableStorageExt: ReadableStorage {
    fn slice(self, offset: u64, size: u64) -> Result<SliceStorage<Self>, SliceStorageError>
    where
        Self: Sized,
    {
        SliceStorage::new(self, offset, size)
    }

    fn shared(self) -> SharedStorage<Self>
    where
        Self: Sized,
    {
        SharedStorage::new(self)
    }

    fn io(self) -> StorageIo<Self>
    where
        Self: Sized,
    {
        StorageIo::new(self)
    }

    fn buf_read(self) -> BufReader<StorageIo<Self>>
    where
        Self: Sized,
    {
        BufReader::new(self.io())
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0; self.get_size() as usize];
        self.read(0, &mut buf)?;
        Ok(buf)
    }
}

impl<T: ReadableStorage + ?Sized> ReadableStorageExt for T {}

#[derive(Snafu, Debug)]
pub enum StorageError {
    #[snafu(display("IO error in storage: {} during {}", source, operation))]
    Io {
        source: std::io::Error,
        operation: &'static str,
    },
    #[snafu(display("Attempt to read a storage out of bounds"))]
    OutOfBounds {},
}
