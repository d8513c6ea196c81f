/// Filesystem classification from on-disk magic numbers
///
/// Candidates are tried in a fixed order. NTFS goes before FAT32 because both
/// end their boot sector with 0x55AA and only NTFS has the 8-byte OEM id.
use crate::device::BlockSource;
use crate::FilesystemType;

pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
pub const NTFS_OEM_OFFSET: u64 = 3;

pub const EXT4_MAGIC: u16 = 0xEF53;
pub const EXT4_MAGIC_OFFSET: u64 = 1024 + 56;

/// "NXSB" container superblock
pub const APFS_CONTAINER_MAGIC: u32 = 0x4253584E;
/// "APSB" volume superblock
pub const APFS_VOLUME_MAGIC: u32 = 0x42535041;
/// Magic inside a full APFS object, after the 32-byte object header
pub const APFS_OBJECT_MAGIC_OFFSET: u64 = 32;

pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const BOOT_SIGNATURE_OFFSET: u64 = 510;
pub const X86_JUMP_SHORT: u8 = 0xEB;
pub const X86_JUMP_NEAR: u8 = 0xE9;

/// "H+"
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B;
/// "HX", case-sensitive HFSX
pub const HFSX_SIGNATURE: u16 = 0x4858;
pub const HFS_PLUS_OFFSET: u64 = 1024;

type Check = fn(&dyn BlockSource) -> bool;

/// Detection order
const CHECKS: [(FilesystemType, Check); 5] = [
    (FilesystemType::Ntfs, is_ntfs),
    (FilesystemType::Ext4, is_ext4),
    (FilesystemType::Apfs, is_apfs),
    (FilesystemType::Fat32, is_fat32),
    (FilesystemType::HfsPlus, is_hfs_plus),
];

/// Classify the filesystem on `source`. Read failures count as "no match".
pub fn detect_filesystem(source: &dyn BlockSource) -> FilesystemType {
    for (fs_type, check) in CHECKS {
        if check(source) {
            tracing::info!("Detected {} signature", fs_type);
            return fs_type;
        }
    }
    tracing::info!("No known filesystem signature found");
    FilesystemType::Unknown
}

pub fn is_ntfs(source: &dyn BlockSource) -> bool {
    source
        .read_at(NTFS_OEM_OFFSET, NTFS_OEM_ID.len())
        .map(|oem| oem.as_slice() == NTFS_OEM_ID)
        .unwrap_or(false)
}

pub fn is_ext4(source: &dyn BlockSource) -> bool {
    source
        .read_u16_le(EXT4_MAGIC_OFFSET)
        .map(|magic| magic == EXT4_MAGIC)
        .unwrap_or(false)
}

pub fn is_apfs(source: &dyn BlockSource) -> bool {
    [0, APFS_OBJECT_MAGIC_OFFSET].iter().any(|&offset| {
        source
            .read_u32_le(offset)
            .map(|magic| magic == APFS_CONTAINER_MAGIC || magic == APFS_VOLUME_MAGIC)
            .unwrap_or(false)
    })
}

pub fn is_fat32(source: &dyn BlockSource) -> bool {
    let signature = source.read_u16_le(BOOT_SIGNATURE_OFFSET);
    let jump = source.read_at(0, 1);
    match (signature, jump) {
        (Ok(signature), Ok(jump)) => {
            signature == BOOT_SIGNATURE && matches!(jump[0], X86_JUMP_SHORT | X86_JUMP_NEAR)
        }
        _ => false,
    }
}

/// The volume header stores the signature big-endian ('H' then '+'), so both
/// byte orders are accepted.
pub fn is_hfs_plus(source: &dyn BlockSource) -> bool {
    match source.read_at(HFS_PLUS_OFFSET, 2) {
        Ok(bytes) => {
            let le = u16::from_le_bytes([bytes[0], bytes[1]]);
            let be = u16::from_be_bytes([bytes[0], bytes[1]]);
            [le, be]
                .iter()
                .any(|&sig| sig == HFS_PLUS_SIGNATURE || sig == HFSX_SIGNATURE)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn detect(data: Vec<u8>) -> FilesystemType {
        detect_filesystem(&MemoryDevice::new(data))
    }

    #[test]
    fn test_each_signature() {
        let mut ntfs = vec![0u8; 512];
        ntfs[3..11].copy_from_slice(NTFS_OEM_ID);
        assert_eq!(detect(ntfs), FilesystemType::Ntfs);

        let mut ext4 = vec![0u8; 2048];
        ext4[1080..1082].copy_from_slice(&EXT4_MAGIC.to_le_bytes());
        assert_eq!(detect(ext4), FilesystemType::Ext4);

        let mut nxsb = vec![0u8; 512];
        nxsb[0..4].copy_from_slice(&APFS_CONTAINER_MAGIC.to_le_bytes());
        assert_eq!(detect(nxsb), FilesystemType::Apfs);

        let mut apsb = vec![0u8; 512];
        apsb[0..4].copy_from_slice(&APFS_VOLUME_MAGIC.to_le_bytes());
        assert_eq!(detect(apsb), FilesystemType::Apfs);

        let mut fat = vec![0u8; 512];
        fat[0] = X86_JUMP_SHORT;
        fat[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
        assert_eq!(detect(fat), FilesystemType::Fat32);

        let mut hfs = vec![0u8; 2048];
        hfs[1024..1026].copy_from_slice(&HFS_PLUS_SIGNATURE.to_le_bytes());
        assert_eq!(detect(hfs), FilesystemType::HfsPlus);

        let mut hfsx = vec![0u8; 2048];
        hfsx[1024..1026].copy_from_slice(b"HX");
        assert_eq!(detect(hfsx), FilesystemType::HfsPlus);
    }

    #[test]
    fn test_real_apfs_object_magic_position() {
        let mut nxsb = vec![0u8; 4096];
        nxsb[32..36].copy_from_slice(b"NXSB");
        assert_eq!(detect(nxsb), FilesystemType::Apfs);
    }

    #[test]
    fn test_ntfs_wins_over_fat32() {
        let mut data = vec![0u8; 512];
        data[0] = X86_JUMP_SHORT;
        data[3..11].copy_from_slice(NTFS_OEM_ID);
        data[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
        assert_eq!(detect(data), FilesystemType::Ntfs);
    }

    #[test]
    fn test_fat32_requires_jump() {
        let mut data = vec![0u8; 512];
        data[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
        assert_eq!(detect(data), FilesystemType::Unknown);
    }

    #[test]
    fn test_unknown_and_short_inputs() {
        assert_eq!(detect(vec![0u8; 4096]), FilesystemType::Unknown);
        assert_eq!(detect(Vec::new()), FilesystemType::Unknown);
        assert_eq!(detect(vec![0xEB, 0x52]), FilesystemType::Unknown);
    }
}
