use crate::storage::{ReadableStorage, StorageError};
use std::fmt::Debug;

/// In-memory storage. Handy for tables that are fully resident and in tests.
pub struct VecStorage {
    data: Vec<u8>,
}

impl Debug for VecStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VecStorage")
            .field("size", &self.data.len())
            .finish()
    }
}

impl VecStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ReadableStorage for VecStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let offset: usize = offset.try_into().map_err(|_| StorageError::OutOfBounds {})?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(StorageError::OutOfBounds {})?;
        if end > self.data.len() {
            return Err(StorageError::OutOfBounds {});
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.data.len() as u64
    }
}
