use crate::storage::{ReadableStorage, StorageError};
use std::ops::Deref;
use std::sync::Arc;

/// Cheaply cloneable handle to a storage. Sections of the same content file
/// all read through clones of one of these.
#[derive(Debug)]
pub struct SharedStorage<S: ReadableStorage> {
    storage: Arc<S>,
}

impl<S: ReadableStorage> SharedStorage<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }
}

impl<S: ReadableStorage> Deref for SharedStorage<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

impl<S: ReadableStorage> Clone for SharedStorage<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<S: ReadableStorage> ReadableStorage for SharedStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.storage.read(offset, buf)
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }
}
