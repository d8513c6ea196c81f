/// MFT file record decoding: fixups, attribute walk and data runs
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use encoding_rs::UTF_16LE;

use crate::fs::common::{bytes_at, filetime_to_datetime, u16_at, u32_at, u64_at, u8_at};

pub const FILE_SIGNATURE: &[u8; 4] = b"FILE";
/// Signature written by chkdsk over records it found damaged
pub const BAAD_SIGNATURE: &[u8; 4] = b"BAAD";

pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_END: u32 = 0xFFFF_FFFF;

pub const RECORD_FLAG_IN_USE: u16 = 0x0001;
pub const RECORD_FLAG_DIRECTORY: u16 = 0x0002;

/// Update sequence stride, independent of the device sector size
const FIXUP_STRIDE: usize = 512;
/// Smallest header that holds every field read below
const RECORD_HEADER_LEN: usize = 48;

pub const NAMESPACE_POSIX: u8 = 0;
pub const NAMESPACE_WIN32: u8 = 1;
pub const NAMESPACE_DOS: u8 = 2;
pub const NAMESPACE_WIN32_AND_DOS: u8 = 3;

/// One decoded data run, in clusters. `lcn` is `None` for sparse runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub lcn: Option<u64>,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileNameAttr {
    pub parent_record: u64,
    pub parent_sequence: u16,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub real_size: u64,
    pub namespace: u8,
    pub name: String,
    /// UTF-16 decode hit unpaired surrogates
    pub lossy: bool,
}

impl FileNameAttr {
    /// Higher wins: Win32 names over POSIX over 8.3 DOS aliases
    fn namespace_rank(&self) -> u8 {
        match self.namespace {
            NAMESPACE_WIN32 | NAMESPACE_WIN32_AND_DOS => 3,
            NAMESPACE_POSIX => 2,
            NAMESPACE_DOS => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StandardInfo {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub mft_modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
}

/// The unnamed `$DATA` stream
#[derive(Debug, Clone, PartialEq)]
pub enum DataStream {
    Resident { size: u64 },
    NonResident { real_size: u64, runs: Vec<DataRun> },
}

impl DataStream {
    pub fn size(&self) -> u64 {
        match self {
            DataStream::Resident { size } => *size,
            DataStream::NonResident { real_size, .. } => *real_size,
        }
    }
}

/// A validated, fixed-up MFT record
#[derive(Debug, Clone, PartialEq)]
pub struct MftRecord {
    pub record_number: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub flags: u16,
    /// Non-zero for extension records owned by another record
    pub base_record: u64,
    pub standard_info: Option<StandardInfo>,
    pub file_name: Option<FileNameAttr>,
    pub data: Option<DataStream>,
}

impl MftRecord {
    pub fn in_use(&self) -> bool {
        self.flags & RECORD_FLAG_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_FLAG_DIRECTORY != 0
    }

    pub fn is_extension(&self) -> bool {
        self.base_record & 0x0000_FFFF_FFFF_FFFF != 0
    }
}

/// Decode one raw record.
///
/// `Ok(None)` is a never-initialised slot (all-zero signature). Anything else
/// that fails validation is an error so the caller can count it as skipped.
pub fn parse_record(raw: &[u8], record_number: u64) -> Result<Option<MftRecord>> {
    if raw.len() < RECORD_HEADER_LEN {
        bail!("record {} truncated to {} bytes", record_number, raw.len());
    }
    match &raw[0..4] {
        sig if sig == FILE_SIGNATURE => {}
        [0, 0, 0, 0] => return Ok(None),
        sig if sig == BAAD_SIGNATURE => bail!("record {} marked BAAD", record_number),
        sig => bail!("record {} has bad signature {:02X?}", record_number, sig),
    }

    let mut data = raw.to_vec();
    apply_fixups(&mut data)?;

    let field = |value: Option<u16>| value.ok_or_else(|| anyhow::anyhow!("short header"));
    let sequence_number = field(u16_at(&data, 16))?;
    let hard_link_count = field(u16_at(&data, 18))?;
    let first_attr = field(u16_at(&data, 20))? as usize;
    let flags = field(u16_at(&data, 22))?;
    let bytes_used = u32_at(&data, 24).unwrap_or(0) as usize;
    let base_record = u64_at(&data, 32).unwrap_or(0);

    if first_attr < RECORD_HEADER_LEN - 8 || first_attr >= data.len() {
        bail!("record {} first attribute offset {} out of range", record_number, first_attr);
    }
    if bytes_used > data.len() {
        bail!("record {} claims {} bytes used", record_number, bytes_used);
    }

    let mut record = MftRecord {
        record_number,
        sequence_number,
        hard_link_count,
        flags,
        base_record,
        standard_info: None,
        file_name: None,
        data: None,
    };

    let limit = if bytes_used > first_attr { bytes_used } else { data.len() };
    let mut offset = first_attr;
    while offset + 8 <= limit {
        let attr_type = u32_at(&data, offset).unwrap_or(ATTR_END);
        if attr_type == ATTR_END || attr_type == 0 {
            break;
        }
        let attr_len = u32_at(&data, offset + 4).unwrap_or(0) as usize;
        if attr_len < 16 || offset + attr_len > limit {
            bail!(
                "record {} attribute 0x{:X} at {} has bad length {}",
                record_number,
                attr_type,
                offset,
                attr_len
            );
        }
        let attr = &data[offset..offset + attr_len];

        match attr_type {
            ATTR_STANDARD_INFORMATION => {
                if let Some(value) = resident_value(attr) {
                    record.standard_info = Some(parse_standard_info(value));
                }
            }
            ATTR_FILE_NAME => {
                if let Some(name) = resident_value(attr).and_then(parse_file_name) {
                    let better = record
                        .file_name
                        .as_ref()
                        .map_or(true, |current| name.namespace_rank() > current.namespace_rank());
                    if better {
                        record.file_name = Some(name);
                    }
                }
            }
            ATTR_DATA if u8_at(attr, 9) == Some(0) => {
                record.data = parse_data_attr(attr);
            }
            _ => {}
        }

        offset += attr_len;
    }

    Ok(Some(record))
}

/// Verify and undo the update sequence array. A mismatch means a torn write.
pub fn apply_fixups(data: &mut [u8]) -> Result<()> {
    let usa_offset = u16_at(data, 4).unwrap_or(0) as usize;
    let usa_count = u16_at(data, 6).unwrap_or(0) as usize;
    if usa_count == 0 {
        return Ok(());
    }
    if usa_offset < 8 || usa_offset + usa_count * 2 > data.len() {
        bail!("update sequence array out of bounds");
    }
    if (usa_count - 1) * FIXUP_STRIDE > data.len() {
        bail!("update sequence array covers more than the record");
    }

    let usn = [data[usa_offset], data[usa_offset + 1]];
    for i in 1..usa_count {
        let tail = i * FIXUP_STRIDE - 2;
        if data[tail..tail + 2] != usn {
            bail!("fixup mismatch in sector {}", i - 1);
        }
        let saved = usa_offset + i * 2;
        data[tail] = data[saved];
        data[tail + 1] = data[saved + 1];
    }
    Ok(())
}

fn resident_value(attr: &[u8]) -> Option<&[u8]> {
    if u8_at(attr, 8)? != 0 {
        return None;
    }
    let len = u32_at(attr, 16)? as usize;
    let offset = u16_at(attr, 20)? as usize;
    bytes_at(attr, offset, len)
}

fn parse_standard_info(value: &[u8]) -> StandardInfo {
    let time = |offset| u64_at(value, offset).and_then(filetime_to_datetime);
    StandardInfo {
        created: time(0),
        modified: time(8),
        mft_modified: time(16),
        accessed: time(24),
    }
}

fn parse_file_name(value: &[u8]) -> Option<FileNameAttr> {
    let parent_ref = u64_at(value, 0)?;
    let name_chars = u8_at(value, 64)? as usize;
    let namespace = u8_at(value, 65)?;
    let raw_name = bytes_at(value, 66, name_chars * 2)?;
    if name_chars == 0 {
        return None;
    }

    let (name, _, lossy) = UTF_16LE.decode(raw_name);
    Some(FileNameAttr {
        parent_record: parent_ref & 0x0000_FFFF_FFFF_FFFF,
        parent_sequence: (parent_ref >> 48) as u16,
        created: u64_at(value, 8).and_then(filetime_to_datetime),
        modified: u64_at(value, 16).and_then(filetime_to_datetime),
        real_size: u64_at(value, 48)?,
        namespace,
        name: name.into_owned(),
        lossy,
    })
}

fn parse_data_attr(attr: &[u8]) -> Option<DataStream> {
    if u8_at(attr, 8)? == 0 {
        return Some(DataStream::Resident {
            size: u32_at(attr, 16)? as u64,
        });
    }
    let runs_offset = u16_at(attr, 32)? as usize;
    let real_size = u64_at(attr, 48)?;
    let runs = decode_data_runs(attr.get(runs_offset..)?);
    Some(DataStream::NonResident { real_size, runs })
}

/// Decode the mapping-pairs array. Offsets are signed deltas from the
/// previous run's LCN; a zero offset size marks a sparse run.
pub fn decode_data_runs(data: &[u8]) -> Vec<DataRun> {
    let mut runs = Vec::new();
    let mut pos = 0;
    let mut lcn: i64 = 0;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        pos += 1;

        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            break;
        }
        if pos + length_size + offset_size > data.len() {
            break;
        }

        let mut length: u64 = 0;
        for i in 0..length_size {
            length |= (data[pos + i] as u64) << (i * 8);
        }
        pos += length_size;

        if offset_size == 0 {
            runs.push(DataRun { lcn: None, length });
            continue;
        }

        let mut delta: i64 = 0;
        for i in 0..offset_size {
            delta |= (data[pos + i] as i64) << (i * 8);
        }
        if offset_size < 8 && data[pos + offset_size - 1] & 0x80 != 0 {
            delta |= -1i64 << (offset_size * 8);
        }
        pos += offset_size;

        lcn = match lcn.checked_add(delta) {
            Some(next) if next >= 0 => next,
            _ => break,
        };
        runs.push(DataRun {
            lcn: Some(lcn as u64),
            length,
        });
    }

    runs
}
