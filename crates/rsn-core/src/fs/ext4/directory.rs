/// Linear ext4 directory blocks, including residual entries left in slack
use crate::fs::common::{u16_at, u32_at, u8_at};

const DIRENT_HEADER_LEN: usize = 8;
/// Highest `file_type` value in a directory entry (EXT4_FT_SYMLINK)
const MAX_FILE_TYPE: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
    pub file_type: u8,
    /// Recovered from the unused tail of another entry
    pub from_slack: bool,
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Decode one directory block.
///
/// `max_inode` bounds what counts as a plausible residual entry. A malformed
/// `rec_len` ends the block; what was decoded up to that point is returned.
pub fn parse_dir_block(block: &[u8], max_inode: u32) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset + DIRENT_HEADER_LEN <= block.len() {
        let inode = u32_at(block, offset).unwrap_or(0);
        let rec_len = u16_at(block, offset + 4).unwrap_or(0) as usize;
        let name_len = u8_at(block, offset + 6).unwrap_or(0) as usize;
        let file_type = u8_at(block, offset + 7).unwrap_or(0);

        if rec_len < DIRENT_HEADER_LEN || rec_len % 4 != 0 || offset + rec_len > block.len() {
            tracing::debug!("Bad rec_len {} at offset {}", rec_len, offset);
            break;
        }

        let used = if inode != 0 && name_len > 0 && DIRENT_HEADER_LEN + name_len <= rec_len {
            let name_start = offset + DIRENT_HEADER_LEN;
            let name = &block[name_start..name_start + name_len];
            if name != b"." && name != b".." {
                entries.push(DirEntry {
                    inode,
                    name: String::from_utf8_lossy(name).into_owned(),
                    file_type,
                    from_slack: false,
                });
            }
            align4(DIRENT_HEADER_LEN + name_len)
        } else {
            DIRENT_HEADER_LEN
        };

        if rec_len > used + DIRENT_HEADER_LEN {
            scan_slack(&block[offset + used..offset + rec_len], max_inode, &mut entries);
        }
        offset += rec_len;
    }

    entries
}

/// Deleting an entry folds its `rec_len` into the previous one, so the old
/// header and name stay in the gap
fn scan_slack(slack: &[u8], max_inode: u32, out: &mut Vec<DirEntry>) {
    let mut pos = 0usize;
    while pos + DIRENT_HEADER_LEN <= slack.len() {
        match residual_at(slack, pos, max_inode) {
            Some(entry) => {
                let advance = align4(DIRENT_HEADER_LEN + entry.name.len());
                out.push(entry);
                pos += advance;
            }
            None => pos += 4,
        }
    }
}

fn residual_at(slack: &[u8], pos: usize, max_inode: u32) -> Option<DirEntry> {
    let inode = u32_at(slack, pos)?;
    let rec_len = u16_at(slack, pos + 4)? as usize;
    let name_len = u8_at(slack, pos + 6)? as usize;
    let file_type = u8_at(slack, pos + 7)?;

    if inode == 0 || inode > max_inode || name_len == 0 || file_type > MAX_FILE_TYPE {
        return None;
    }
    if rec_len < DIRENT_HEADER_LEN + name_len || rec_len % 4 != 0 {
        return None;
    }
    let name_start = pos + DIRENT_HEADER_LEN;
    let name = slack.get(name_start..name_start + name_len)?;
    if name == b"." || name == b".." || name.iter().any(|&b| b == 0 || b == b'/') {
        return None;
    }
    let name = std::str::from_utf8(name).ok()?;

    Some(DirEntry {
        inode,
        name: name.to_string(),
        file_type,
        from_slack: true,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn put_dirent(
        block: &mut [u8],
        offset: usize,
        inode: u32,
        rec_len: u16,
        name: &str,
        file_type: u8,
    ) {
        block[offset..offset + 4].copy_from_slice(&inode.to_le_bytes());
        block[offset + 4..offset + 6].copy_from_slice(&rec_len.to_le_bytes());
        block[offset + 6] = name.len() as u8;
        block[offset + 7] = file_type;
        block[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
    }

    #[test]
    fn test_live_entries() {
        let mut block = vec![0u8; 1024];
        put_dirent(&mut block, 0, 2, 12, ".", 2);
        put_dirent(&mut block, 12, 2, 12, "..", 2);
        put_dirent(&mut block, 24, 12, 20, "notes.txt", 1);
        put_dirent(&mut block, 44, 13, 980, "src", 2);

        let entries = parse_dir_block(&block, 100);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["notes.txt", "src"]);
        assert!(entries.iter().all(|e| !e.from_slack));
    }

    #[test]
    fn test_deleted_entry_in_slack() {
        let mut block = vec![0u8; 1024];
        put_dirent(&mut block, 0, 12, 16, "a.txt", 1);
        // "gone.bin" was at 16; its rec_len was merged into the one before
        put_dirent(&mut block, 16, 14, 1008, "gone.bin", 1);
        block[4..6].copy_from_slice(&1024u16.to_le_bytes());

        let entries = parse_dir_block(&block, 100);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].inode, 14);
        assert_eq!(entries[1].name, "gone.bin");
        assert!(entries[1].from_slack);
    }

    #[test]
    fn test_slack_noise_is_rejected() {
        let mut block = vec![0u8; 1024];
        put_dirent(&mut block, 0, 12, 1024, "a.txt", 1);
        // Inode out of range, bad file type, embedded NUL
        put_dirent(&mut block, 16, 5000, 16, "x", 1);
        put_dirent(&mut block, 32, 15, 16, "y", 9);
        put_dirent(&mut block, 48, 16, 16, "b\0c", 1);

        let entries = parse_dir_block(&block, 100);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_bad_rec_len_stops_block() {
        let mut block = vec![0u8; 1024];
        put_dirent(&mut block, 0, 12, 16, "a.txt", 1);
        put_dirent(&mut block, 16, 13, 3, "b.txt", 1);
        let entries = parse_dir_block(&block, 100);
        assert_eq!(entries.len(), 1);
        assert!(parse_dir_block(&[0u8; 4], 100).is_empty());
    }
}
