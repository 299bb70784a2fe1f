use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Where the writer thread drains to. `put` must be blocking;
/// `finalize` flushes (and, for host sinks, waits for the acknowledgment).
/// `rollback` undoes partial output after a failed or cancelled dump.
pub trait Sink {
    fn put(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn finalize(&mut self) -> std::io::Result<()>;
    fn rollback(&mut self) {}
}

/// Plain file sink; rollback deletes the half-written file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }
}

impl Sink for FileSink {
    fn put(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file
            .as_mut()
            .expect("sink used after rollback")
            .write_all(data)
    }

    fn finalize(&mut self) -> std::io::Result<()> {
        self.file.as_mut().expect("sink used after rollback").flush()
    }

    fn rollback(&mut self) {
        self.file = None;
        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %error, "failed to remove partial dump");
        }
    }
}

/// In-memory sink, shared so tests can inspect the output after the
/// pipeline consumed the sink value.
#[derive(Debug, Clone, Default)]
pub struct VecSink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl VecSink {
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Sink for VecSink {
    fn put(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
