//! Producer/consumer dump pipeline: a reader thread pulls chunks out of the
//! virtual storage (applying byte patches on the way), a writer thread
//! hashes them and drains into a sink. The two share a single-slot buffer
//! guarded by one mutex and two condition variables, so backpressure is
//! implicit.

mod host;
mod sink;

use snafu::Snafu;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, warn};

use crate::crypto::crc32_with_seed;
use crate::formats::nca::HashTreePatch;

pub use host::{
    CommandHeader, HostCommand, StatusCode, StatusResponse, COMMAND_MAGIC, FILENAME_LENGTH,
};
pub use sink::{FileSink, Sink, VecSink};

/// Default transfer chunk: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Snafu, Debug)]
pub enum DumpError {
    /// Dump: reader failed: {message}
    Read { message: String },
    /// Dump: sink failed
    Sink { source: std::io::Error },
    /// Dump: cancelled
    Cancelled {},
}

/// Cooperative cancellation flag, checked by both threads at every chunk
/// boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub chunk_size: usize,
    pub calculate_crc: bool,
    pub calculate_sha256: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            calculate_crc: false,
            calculate_sha256: false,
        }
    }
}

#[derive(Debug)]
pub struct DumpReport {
    pub bytes_written: u64,
    pub crc32: Option<u32>,
    pub sha256: Option<[u8; 0x20]>,
}

/// Single-slot exchange buffer. `data_size` is zero when the slot is free
/// and the chunk length while it is full.
struct Slot {
    data: Vec<u8>,
    data_size: usize,
    read_error: bool,
    write_error: bool,
}

struct Exchange {
    slot: Mutex<Slot>,
    /// Signalled by the writer once the slot drains.
    read_done: Condvar,
    /// Signalled by the reader once the slot fills.
    write_done: Condvar,
}

/// Runs a dump to completion: `reader` produces the bytes at each offset,
/// `patches` are overlaid in order as chunks pass through, `sink` receives
/// them in strict FIFO order.
///
/// On any failure the sink's rollback hook runs and the deepest error is
/// returned; the caller's cancel token stops both threads within one chunk
/// exchange.
pub fn dump<F, K>(
    total_size: u64,
    mut reader: F,
    mut sink: K,
    patches: &mut [HashTreePatch],
    options: &DumpOptions,
    cancel: &CancelToken,
) -> Result<DumpReport, DumpError>
where
    F: FnMut(u64, &mut [u8]) -> Result<(), DumpError> + Send,
    K: Sink + Send,
{
    assert!(options.chunk_size > 0);

    let exchange = Exchange {
        slot: Mutex::new(Slot {
            data: vec![0u8; options.chunk_size],
            data_size: 0,
            read_error: false,
            write_error: false,
        }),
        read_done: Condvar::new(),
        write_done: Condvar::new(),
    };

    let mut read_result: Result<(), DumpError> = Ok(());
    let mut write_result: Result<DumpReport, DumpError> = Ok(DumpReport {
        bytes_written: 0,
        crc32: None,
        sha256: None,
    });

    std::thread::scope(|scope| {
        let exchange = &exchange;

        // reader: produce chunks, apply patches, hand off through the slot
        let read_handle = scope.spawn({
            let cancel = cancel.clone();
            let patches = &mut *patches;
            let reader = &mut reader;
            move || -> Result<(), DumpError> {
                let mut buf = vec![0u8; options.chunk_size];
                let mut offset = 0u64;

                while offset < total_size {
                    let chunk_size =
                        std::cmp::min(options.chunk_size as u64, total_size - offset) as usize;

                    if cancel.is_cancelled() {
                        exchange.write_done.notify_all();
                        return Err(DumpError::Cancelled {});
                    }

                    if let Err(error) = reader(offset, &mut buf[..chunk_size]) {
                        let mut slot = exchange.slot.lock().unwrap();
                        slot.read_error = true;
                        drop(slot);
                        exchange.write_done.notify_all();
                        return Err(error);
                    }

                    // overlay pending byte patches onto this chunk
                    for patch in patches.iter_mut() {
                        patch.write_to_buffer(&mut buf[..chunk_size], offset);
                    }

                    let mut slot = exchange.slot.lock().unwrap();
                    while slot.data_size != 0 && !slot.write_error {
                        slot = exchange.read_done.wait(slot).unwrap();
                    }
                    if slot.write_error {
                        return Ok(());
                    }

                    slot.data[..chunk_size].copy_from_slice(&buf[..chunk_size]);
                    slot.data_size = chunk_size;
                    drop(slot);
                    exchange.write_done.notify_all();

                    offset += chunk_size as u64;
                }

                Ok(())
            }
        });

        // writer: drain the slot, hash, sink
        let write_handle = scope.spawn({
            let cancel = cancel.clone();
            let sink = &mut sink;
            move || -> Result<DumpReport, DumpError> {
                let mut bytes_written = 0u64;
                let mut crc = 0u32;
                let mut sha = options.calculate_sha256.then(sha2::Sha256::default);

                while bytes_written < total_size {
                    let mut slot = exchange.slot.lock().unwrap();
                    while slot.data_size == 0 && !slot.read_error && !cancel.is_cancelled() {
                        slot = exchange.write_done.wait(slot).unwrap();
                    }

                    if slot.read_error || cancel.is_cancelled() {
                        let cancelled = cancel.is_cancelled();
                        drop(slot);
                        sink.rollback();
                        return Err(if cancelled {
                            DumpError::Cancelled {}
                        } else {
                            DumpError::Read {
                                message: "reader aborted".into(),
                            }
                        });
                    }

                    let chunk_size = slot.data_size;
                    let chunk = &slot.data[..chunk_size];

                    if options.calculate_crc {
                        crc = crc32_with_seed(crc, chunk);
                    }
                    if let Some(sha) = &mut sha {
                        use digest::Digest;
                        sha.update(chunk);
                    }

                    if let Err(error) = sink.put(chunk) {
                        slot.write_error = true;
                        drop(slot);
                        exchange.read_done.notify_all();
                        sink.rollback();
                        return Err(DumpError::Sink { source: error });
                    }

                    bytes_written += chunk_size as u64;
                    slot.data_size = 0;
                    drop(slot);
                    exchange.read_done.notify_all();
                }

                sink.finalize().map_err(|error| {
                    sink.rollback();
                    DumpError::Sink { source: error }
                })?;

                Ok(DumpReport {
                    bytes_written,
                    crc32: options.calculate_crc.then_some(crc),
                    sha256: sha.map(|sha| {
                        use digest::Digest;
                        sha.finalize().into()
                    }),
                })
            }
        });

        read_result = read_handle.join().expect("reader thread panicked");
        write_result = write_handle.join().expect("writer thread panicked");
    });

    match (read_result, write_result) {
        (Ok(()), Ok(report)) => {
            debug!(bytes = report.bytes_written, "dump finished");
            for patch in patches.iter() {
                if !patch.written {
                    warn!("a patch was not fully applied during the dump");
                }
            }
            Ok(report)
        }
        // the reader error is the deeper one when both sides failed
        (Err(error), _) => Err(error),
        (Ok(()), Err(error)) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::nca::PatchRegion;

    fn counting_reader(offset: u64, buf: &mut [u8]) -> Result<(), DumpError> {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = ((offset + i as u64) % 251) as u8;
        }
        Ok(())
    }

    #[test]
    fn no_loss_and_fifo_order() {
        let total = 1024u64 * 7 + 13;
        let options = DumpOptions {
            chunk_size: 1024,
            calculate_crc: true,
            calculate_sha256: true,
        };

        let sink = VecSink::default();
        let report = dump(
            total,
            counting_reader,
            sink.clone(),
            &mut [],
            &options,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(report.bytes_written, total);

        let expected: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        assert_eq!(sink.contents(), expected);
        assert_eq!(report.crc32, Some(crate::crypto::crc32(&expected)));
        assert_eq!(report.sha256, Some(crate::crypto::sha256(&expected)));
    }

    #[test]
    fn patches_are_applied_inline() {
        let total = 4096u64;
        let options = DumpOptions {
            chunk_size: 1024,
            ..Default::default()
        };

        let mut patch = HashTreePatch {
            content_id: None,
            regions: vec![PatchRegion::new(1000, vec![0xff; 100])],
            written: false,
        };

        let sink = VecSink::default();
        dump(
            total,
            counting_reader,
            sink.clone(),
            std::slice::from_mut(&mut patch),
            &options,
            &CancelToken::new(),
        )
        .unwrap();

        assert!(patch.written);
        let contents = sink.contents();
        // the patched range spans the first chunk boundary
        assert_eq!(&contents[1000..1100], &[0xff; 100]);
        assert_eq!(contents[999], (999 % 251) as u8);
        assert_eq!(contents[1100], (1100 % 251) as u8);
    }

    #[test]
    fn reader_error_reaches_the_caller() {
        let options = DumpOptions {
            chunk_size: 512,
            ..Default::default()
        };

        let result = dump(
            4096,
            |offset, _buf: &mut [u8]| {
                if offset >= 1024 {
                    Err(DumpError::Read {
                        message: "simulated".into(),
                    })
                } else {
                    Ok(())
                }
            },
            VecSink::default(),
            &mut [],
            &options,
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(DumpError::Read { .. })));
    }

    #[test]
    fn cancellation_stops_both_threads() {
        let options = DumpOptions {
            chunk_size: 64,
            ..Default::default()
        };
        let cancel = CancelToken::new();

        let cancel_inner = cancel.clone();
        let result = dump(
            1 << 20,
            move |offset, buf: &mut [u8]| {
                if offset >= 1024 {
                    cancel_inner.cancel();
                }
                counting_reader(offset, buf)
            },
            VecSink::default(),
            &mut [],
            &options,
            &cancel,
        );

        assert!(matches!(result, Err(DumpError::Cancelled {})));
    }
}
