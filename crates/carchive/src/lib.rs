pub use binrw;
pub use snafu;

mod brw_utils;
pub mod crypto;
pub mod dump;
pub mod formats;
mod hexstring;
pub mod ids;
pub mod memory;
pub mod storage;
pub mod ticket;
pub mod version;
pub mod xml;

pub use hexstring::HexData;
