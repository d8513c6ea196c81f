/// Host-specific open, size and positioned-read helpers
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;

#[cfg(windows)]
use std::os::windows::fs::OpenOptionsExt;

pub(super) fn open_read_only(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);

    #[cfg(windows)]
    {
        use winapi::um::winnt::{FILE_SHARE_READ, FILE_SHARE_WRITE};
        // Mounted volumes refuse raw handles without write sharing
        options.share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE);
    }

    options.open(path)
}

/// Size of a block or character device
pub(super) fn device_size(file: &File) -> io::Result<u64> {
    #[cfg(windows)]
    {
        if let Some(size) = windows::disk_length(file) {
            return Ok(size);
        }
    }

    let mut handle = file;
    let size = handle.seek(SeekFrom::End(0))?;
    handle.seek(SeekFrom::Start(0))?;
    Ok(size)
}

/// Logical sector size, if the platform reports one
#[allow(unused_variables)]
pub(super) fn sector_size(path: &Path, file: &File) -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        return linux::logical_block_size(path);
    }

    #[cfg(windows)]
    {
        return windows::bytes_per_sector(file);
    }

    #[allow(unreachable_code)]
    None
}

#[cfg(unix)]
pub(super) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(super) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device returned fewer bytes than requested",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub(super) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::io::Read;
    let mut handle = file;
    handle.seek(SeekFrom::Start(offset))?;
    handle.read_exact(buf)
}

#[cfg(target_os = "linux")]
mod linux {
    use std::path::Path;

    /// `/sys/class/block/<dev>/queue/logical_block_size`, falling back to the
    /// parent disk for partitions
    pub(super) fn logical_block_size(path: &Path) -> Option<u32> {
        let resolved = std::fs::canonicalize(path).ok()?;
        let name = resolved.file_name()?.to_str()?;
        let base = Path::new("/sys/class/block").join(name);

        [
            base.join("queue/logical_block_size"),
            base.join("../queue/logical_block_size"),
        ]
        .iter()
        .find_map(|candidate| std::fs::read_to_string(candidate).ok())
        .and_then(|text| text.trim().parse::<u32>().ok())
        .filter(|size| size.is_power_of_two() && *size >= 512)
    }
}

#[cfg(windows)]
mod windows {
    use std::fs::File;
    use std::mem;
    use std::os::windows::io::AsRawHandle;
    use winapi::um::ioapiset::DeviceIoControl;
    use winapi::um::winioctl::{
        DISK_GEOMETRY, GET_LENGTH_INFORMATION, IOCTL_DISK_GET_DRIVE_GEOMETRY,
        IOCTL_DISK_GET_LENGTH_INFO,
    };

    pub(super) fn disk_length(file: &File) -> Option<u64> {
        unsafe {
            let mut info: GET_LENGTH_INFORMATION = mem::zeroed();
            let mut returned = 0u32;
            let ok = DeviceIoControl(
                file.as_raw_handle() as *mut _,
                IOCTL_DISK_GET_LENGTH_INFO,
                std::ptr::null_mut(),
                0,
                &mut info as *mut _ as *mut _,
                mem::size_of::<GET_LENGTH_INFORMATION>() as u32,
                &mut returned,
                std::ptr::null_mut(),
            );
            if ok != 0 {
                let length = *info.Length.QuadPart() as u64;
                if length > 0 {
                    return Some(length);
                }
            }
        }

        let geometry = drive_geometry(file)?;
        let size = unsafe { *geometry.Cylinders.QuadPart() } as u64
            * geometry.TracksPerCylinder as u64
            * geometry.SectorsPerTrack as u64
            * geometry.BytesPerSector as u64;
        (size > 0).then_some(size)
    }

    pub(super) fn bytes_per_sector(file: &File) -> Option<u32> {
        drive_geometry(file)
            .map(|g| g.BytesPerSector)
            .filter(|size| size.is_power_of_two() && *size >= 512)
    }

    fn drive_geometry(file: &File) -> Option<DISK_GEOMETRY> {
        unsafe {
            let mut geometry: DISK_GEOMETRY = mem::zeroed();
            let mut returned = 0u32;
            let ok = DeviceIoControl(
                file.as_raw_handle() as *mut _,
                IOCTL_DISK_GET_DRIVE_GEOMETRY,
                std::ptr::null_mut(),
                0,
                &mut geometry as *mut _ as *mut _,
                mem::size_of::<DISK_GEOMETRY>() as u32,
                &mut returned,
                std::ptr::null_mut(),
            );
            (ok != 0).then_some(geometry)
        }
    }
}
