//! Bit-exact framing contract with the USB host tool. The transport itself
//! lives outside the core; these structs exist so dumps aimed at a host can
//! frame their commands and parse status replies.

use binrw::{BinRead, BinWrite};

pub const COMMAND_MAGIC: [u8; 4] = *b"NXDT";
pub const FILENAME_LENGTH: usize = 0x301;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct CommandHeader {
    pub magic: [u8; 4],
    pub command: u32,
    pub command_block_size: u32,
    pub reserved: [u8; 4],
}

/// Commands the core's dump path may emit, with their block payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    StartSession {
        app_version: [u8; 3],
        abi_version: u8,
        git_commit: [u8; 8],
    },
    SendFileProperties {
        file_size: u64,
        filename: String,
        /// Non-zero only when the file is a repacked archive whose header
        /// gets patched in afterwards via `SendNspHeader`.
        nsp_header_size: u32,
    },
    CancelFileTransfer,
    SendNspHeader(Vec<u8>),
    EndSession,
    StartExtractedFsDump {
        fs_size: u64,
        root_path: String,
    },
    EndExtractedFsDump,
}

impl HostCommand {
    pub fn command_id(&self) -> u32 {
        match self {
            HostCommand::StartSession { .. } => 0,
            HostCommand::SendFileProperties { .. } => 1,
            HostCommand::CancelFileTransfer => 2,
            HostCommand::SendNspHeader(_) => 3,
            HostCommand::EndSession => 4,
            HostCommand::StartExtractedFsDump { .. } => 5,
            HostCommand::EndExtractedFsDump => 6,
        }
    }

    fn command_block(&self) -> Vec<u8> {
        match self {
            HostCommand::StartSession {
                app_version,
                abi_version,
                git_commit,
            } => {
                let mut block = Vec::with_capacity(0x10);
                block.extend_from_slice(app_version);
                block.push(*abi_version);
                block.extend_from_slice(git_commit);
                block.resize(0x10, 0);
                block
            }
            HostCommand::SendFileProperties {
                file_size,
                filename,
                nsp_header_size,
            } => {
                let mut block = Vec::with_capacity(0x10 + FILENAME_LENGTH);
                block.extend_from_slice(&file_size.to_le_bytes());
                block.extend_from_slice(&(filename.len() as u32).to_le_bytes());
                block.extend_from_slice(&nsp_header_size.to_le_bytes());
                let mut name = [0u8; FILENAME_LENGTH];
                let len = std::cmp::min(filename.len(), FILENAME_LENGTH - 1);
                name[..len].copy_from_slice(&filename.as_bytes()[..len]);
                block.extend_from_slice(&name);
                // padded to keep the block 4-byte aligned
                block.resize(block.len().next_multiple_of(4), 0);
                block
            }
            HostCommand::SendNspHeader(header) => header.clone(),
            HostCommand::StartExtractedFsDump { fs_size, root_path } => {
                let mut block = Vec::with_capacity(8 + FILENAME_LENGTH);
                block.extend_from_slice(&fs_size.to_le_bytes());
                let mut name = [0u8; FILENAME_LENGTH];
                let len = std::cmp::min(root_path.len(), FILENAME_LENGTH - 1);
                name[..len].copy_from_slice(&root_path.as_bytes()[..len]);
                block.extend_from_slice(&name);
                block.resize(block.len().next_multiple_of(4), 0);
                block
            }
            HostCommand::CancelFileTransfer
            | HostCommand::EndSession
            | HostCommand::EndExtractedFsDump => Vec::new(),
        }
    }

    /// Serializes the full frame: header followed by the command block.
    pub fn to_frame(&self) -> Vec<u8> {
        let block = self.command_block();

        let mut frame = Vec::with_capacity(0x10 + block.len());
        frame.extend_from_slice(&COMMAND_MAGIC);
        frame.extend_from_slice(&self.command_id().to_le_bytes());
        frame.extend_from_slice(&(block.len() as u32).to_le_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        frame.extend_from_slice(&block);
        frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, repr = u32)]
pub enum StatusCode {
    Success = 0,
    InvalidMagic = 4,
    UnsupportedCommand = 5,
    UnsupportedAbi = 6,
    Malformed = 7,
    HostIoError = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct StatusResponse {
    pub magic: [u8; 4],
    pub status: StatusCode,
    #[brw(pad_after = 6)]
    pub max_packet_size: u16,
}

impl StatusResponse {
    pub fn is_success(&self) -> bool {
        self.magic == COMMAND_MAGIC && self.status == StatusCode::Success
    }

    /// Whether a transfer ending on a packet-size boundary needs an explicit
    /// zero-length termination packet.
    pub fn needs_zlt(&self, final_chunk_size: u64) -> bool {
        self.max_packet_size != 0 && final_chunk_size % self.max_packet_size as u64 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinRead;
    use std::io::Cursor;

    #[test]
    fn frame_layout() {
        let frame = HostCommand::SendFileProperties {
            file_size: 0x1234,
            filename: "title.nsp".into(),
            nsp_header_size: 0,
        }
        .to_frame();

        assert_eq!(&frame[..4], b"NXDT");
        assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), 1);
        let block_size = u32::from_le_bytes(frame[8..12].try_into().unwrap());
        assert_eq!(frame.len(), 0x10 + block_size as usize);

        // payload: file size, then filename length
        assert_eq!(
            u64::from_le_bytes(frame[0x10..0x18].try_into().unwrap()),
            0x1234
        );
        assert_eq!(u32::from_le_bytes(frame[0x18..0x1c].try_into().unwrap()), 9);
    }

    #[test]
    fn status_parse_and_zlt() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"NXDT");
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.extend_from_slice(&0x200u16.to_le_bytes());
        raw.extend_from_slice(&[0u8; 6]);

        let status = StatusResponse::read(&mut Cursor::new(&raw)).unwrap();
        assert!(status.is_success());
        assert!(status.needs_zlt(0x400));
        assert!(!status.needs_zlt(0x401));
    }
}
