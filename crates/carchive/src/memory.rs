//! Program-memory reader: captures the code/data segments of a running
//! system program through debug facilities, to bootstrap runtime constants
//! the host key material does not provide.
//!
//! The debug facilities themselves are platform glue, injected as a trait so
//! the page-walking logic stays testable.

use snafu::Snafu;
use tracing::debug;

use crate::ids::TitleId;

/// Program id of the storage subsystem program, which carries two
/// executable text segments on patched firmware.
pub const STORAGE_PROGRAM_ID: TitleId = TitleId(0x0100_0000_0000_0000);

bitflags::bitflags! {
    /// Which program segments to capture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentMask: u8 {
        const TEXT = 1 << 0;
        const RODATA = 1 << 1;
        const DATA = 1 << 2;
    }
}

/// Memory page classification, mirroring the kernel's memory state types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    CodeStatic,
    CodeMutable,
    Other,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagePermission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// One page-range record as reported by the memory query.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub address: u64,
    pub size: u64,
    pub page_type: PageType,
    pub permission: PagePermission,
    /// Non-zero attribute flags disqualify a page.
    pub attribute: u32,
}

/// The debug capabilities the runtime must grant. Implementations attach to
/// a live process; every call may block.
pub trait DebugInterface {
    type Handle;

    /// Resolves the process for a program id and attaches a debug handle.
    fn attach(&self, program_id: TitleId) -> Result<Self::Handle, MemoryError>;

    /// Queries the page containing `address`; iteration walks
    /// `address + size` until the address space wraps to zero.
    fn query_page(&self, handle: &Self::Handle, address: u64) -> Result<PageInfo, MemoryError>;

    /// Reads raw bytes out of the attached process.
    fn read(
        &self,
        handle: &Self::Handle,
        address: u64,
        buf: &mut [u8],
    ) -> Result<(), MemoryError>;
}

#[derive(Snafu, Debug)]
pub enum MemoryError {
    /// The runtime denies the debug capabilities needed to read program memory
    DebugUnavailable {},
    /// No process is running program {program_id}
    ProcessNotFound { program_id: TitleId },
    /// Memory query failed at address {address:#x}
    QueryFailed { address: u64 },
    /// Memory read failed at address {address:#x}
    ReadFailed { address: u64 },
    /// No readable pages matched the requested segments of {program_id}
    NoMatchingPages { program_id: TitleId },
}

/// Captured segment data of one program.
#[derive(Debug, Clone)]
pub struct ProgramMemory {
    pub program_id: TitleId,
    pub data: Vec<u8>,
}

fn is_code_page(info: &PageInfo) -> bool {
    matches!(info.page_type, PageType::CodeStatic | PageType::CodeMutable)
}

/// Finds the start of the last executable text segment. The storage
/// subsystem program carries two on patched firmware; only the last one is
/// the real one, so the capture below restarts from it.
fn find_last_text_segment<D: DebugInterface>(
    debug: &D,
    handle: &D::Handle,
) -> Result<u64, MemoryError> {
    let mut address = 0u64;
    let mut last_text_address = 0u64;

    loop {
        let info = debug.query_page(handle, address)?;
        address = info.address.wrapping_add(info.size);

        let executable = info.permission.contains(PagePermission::READ | PagePermission::EXECUTE);
        if is_code_page(&info) && info.attribute == 0 && executable {
            last_text_address = info.address;
        }

        if address == 0 {
            break;
        }
    }

    Ok(last_text_address)
}

/// Captures the selected segments of a program into one buffer. Segment
/// ordering follows the address space: text, rodata, data.
pub fn read_program_segments<D: DebugInterface>(
    debug: &D,
    program_id: TitleId,
    mask: SegmentMask,
) -> Result<ProgramMemory, MemoryError> {
    let handle = debug.attach(program_id)?;

    let mut address = 0u64;
    if program_id == STORAGE_PROGRAM_ID && mask.contains(SegmentMask::TEXT) {
        address = find_last_text_segment(debug, &handle)?;
        debug!(program = %program_id, address, "restarting capture at the last text segment");
    }

    let mut data = Vec::new();
    // code segments appear in text → rodata → data order; shift a cursor
    // through the mask as each code page run goes by
    let mut segment_cursor: u8 = SegmentMask::TEXT.bits();

    loop {
        let info = debug.query_page(&handle, address)?;
        address = info.address.wrapping_add(info.size);

        let wanted = is_code_page(&info)
            && info.attribute == 0
            && info.permission.contains(PagePermission::READ)
            && {
                let current = segment_cursor;
                segment_cursor <<= 1;
                mask.bits() & current != 0
            };

        if wanted {
            let start = data.len();
            data.resize(start + info.size as usize, 0);
            debug.read(&handle, info.address, &mut data[start..])?;
        }

        if address == 0 || segment_cursor > SegmentMask::DATA.bits() {
            break;
        }
    }

    if data.is_empty() {
        return Err(MemoryError::NoMatchingPages { program_id });
    }

    Ok(ProgramMemory { program_id, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake address space: a list of page records, queried by address.
    struct FakeDebug {
        pages: Vec<(PageInfo, Vec<u8>)>,
    }

    impl DebugInterface for FakeDebug {
        type Handle = ();

        fn attach(&self, _program_id: TitleId) -> Result<(), MemoryError> {
            Ok(())
        }

        fn query_page(&self, _handle: &(), address: u64) -> Result<PageInfo, MemoryError> {
            self.pages
                .iter()
                .map(|(info, _)| info)
                .find(|info| address >= info.address && address < info.address + info.size)
                .copied()
                .ok_or(MemoryError::QueryFailed { address })
        }

        fn read(&self, _handle: &(), address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
            let (info, data) = self
                .pages
                .iter()
                .find(|(info, _)| info.address == address)
                .ok_or(MemoryError::ReadFailed { address })?;
            assert_eq!(buf.len() as u64, info.size);
            buf.copy_from_slice(data);
            Ok(())
        }
    }

    fn page(
        address: u64,
        size: u64,
        page_type: PageType,
        permission: PagePermission,
        fill: u8,
    ) -> (PageInfo, Vec<u8>) {
        (
            PageInfo {
                address,
                size,
                page_type,
                permission,
                attribute: 0,
            },
            vec![fill; size as usize],
        )
    }

    #[test]
    fn captures_selected_segments() {
        // text (rx), rodata (r), data (rw), then an unrelated heap page
        // covering the rest of the address space
        let debug = FakeDebug {
            pages: vec![
                page(
                    0x0,
                    0x1000,
                    PageType::CodeStatic,
                    PagePermission::READ | PagePermission::EXECUTE,
                    0x11,
                ),
                page(0x1000, 0x1000, PageType::CodeStatic, PagePermission::READ, 0x22),
                page(
                    0x2000,
                    0x1000,
                    PageType::CodeMutable,
                    PagePermission::READ | PagePermission::WRITE,
                    0x33,
                ),
                (
                    PageInfo {
                        address: 0x3000,
                        size: u64::MAX - 0x3000 + 1,
                        page_type: PageType::Other,
                        permission: PagePermission::READ,
                        attribute: 0,
                    },
                    Vec::new(),
                ),
            ],
        };

        let program_id = TitleId(0x0100_0000_0000_001c);

        let all = read_program_segments(&debug, program_id, SegmentMask::all()).unwrap();
        assert_eq!(all.data.len(), 0x3000);
        assert_eq!(all.data[0], 0x11);
        assert_eq!(all.data[0x1000], 0x22);
        assert_eq!(all.data[0x2000], 0x33);

        let rodata =
            read_program_segments(&debug, program_id, SegmentMask::RODATA).unwrap();
        assert_eq!(rodata.data.len(), 0x1000);
        assert_eq!(rodata.data[0], 0x22);
    }

    #[test]
    fn no_pages_is_an_error() {
        let debug = FakeDebug {
            pages: vec![(
                PageInfo {
                    address: 0,
                    size: u64::MAX,
                    page_type: PageType::Other,
                    permission: PagePermission::READ,
                    attribute: 0,
                },
                Vec::new(),
            )],
        };

        assert!(matches!(
            read_program_segments(&debug, TitleId(1), SegmentMask::all()),
            Err(MemoryError::NoMatchingPages { .. })
        ));
    }
}
