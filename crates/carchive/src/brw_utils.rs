use binrw::{BinRead, BinWrite};
use binrw::{BinResult, Endian};
use std::io::{Read, Seek, Write};

/// Content sizes are stored as 5-byte little-endian integers.
pub fn read_u40<R: Read + Seek>(
    reader: &mut R,
    endian: Endian,
    _args: (),
) -> BinResult<u64> {
    assert_eq!(endian, Endian::Little);
    let low = u32::read_le(reader)?;
    let high = u8::read_le(reader)?;
    Ok((high as u64) << 32 | (low as u64))
}

pub fn write_u40<W: Write + Seek>(
    value: &u64,
    writer: &mut W,
    endian: Endian,
    _args: (),
) -> BinResult<()> {
    assert_eq!(endian, Endian::Little);
    let low = (value & 0xFFFF_FFFF) as u32;
    let high = ((value >> 32) & 0xFF) as u8;
    low.write_le(writer)?;
    high.write_le(writer)?;
    Ok(())
}
