/// Field decoding and timestamp helpers shared by the metadata parsers
///
/// All on-disk integers are decoded explicitly from byte slices; a field that
/// falls outside the slice yields `None` instead of panicking.
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::{DateTime, TimeZone, Utc};

pub fn u8_at(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

pub fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset.checked_add(2)?)
        .map(LittleEndian::read_u16)
}

pub fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset.checked_add(4)?)
        .map(LittleEndian::read_u32)
}

pub fn u64_at(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset.checked_add(8)?)
        .map(LittleEndian::read_u64)
}

pub fn be_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset.checked_add(2)?).map(BigEndian::read_u16)
}

pub fn be_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset.checked_add(4)?).map(BigEndian::read_u32)
}

pub fn bytes_at(data: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    data.get(offset..offset.checked_add(len)?)
}

/// Seconds between 1601-01-01 (Windows FILETIME epoch) and 1970-01-01
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// NTFS FILETIME (100ns ticks since 1601) to UTC
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let secs = (filetime / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Unix seconds (ext4) to UTC, with the optional `_extra` epoch bits and
/// nanoseconds of large inodes
pub fn unix_to_datetime(seconds: u32, extra: Option<u32>) -> Option<DateTime<Utc>> {
    if seconds == 0 && extra.unwrap_or(0) == 0 {
        return None;
    }
    let (epoch_bits, nanos) = match extra {
        Some(extra) => ((extra & 0x3) as i64, extra >> 2),
        None => (0, 0),
    };
    let secs = seconds as i32 as i64 + (epoch_bits << 32);
    Utc.timestamp_opt(secs, nanos.min(999_999_999)).single()
}

/// Nanoseconds since 1970 (APFS) to UTC
pub fn nanos_to_datetime(nanos: u64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        return None;
    }
    let secs = (nanos / 1_000_000_000) as i64;
    let sub = (nanos % 1_000_000_000) as u32;
    Utc.timestamp_opt(secs, sub).single()
}

/// Replace path separators and control characters in a decoded name
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c.is_control() { '_' } else { c })
        .collect()
}
