//! Disk image format sniffing.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Offset of the ISO 9660 primary volume descriptor identifier.
const ISO9660_MAGIC_OFFSET: u64 = 32769;
const ISO9660_MAGIC: &[u8; 5] = b"CD001";
const QCOW2_MAGIC: &[u8; 4] = b"QFI\xfb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Qcow2,
    /// Installable media.
    Iso,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Iso => "iso",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sniff the format of the image at `path`.
///
/// Anything that is neither qcow2 nor ISO 9660 is treated as raw.
pub fn detect_format(path: &Path) -> io::Result<DiskFormat> {
    let mut file = File::open(path)?;

    let mut head = [0u8; 4];
    if read_full(&mut file, &mut head)? && &head == QCOW2_MAGIC {
        return Ok(DiskFormat::Qcow2);
    }

    file.seek(SeekFrom::Start(ISO9660_MAGIC_OFFSET))?;
    let mut magic = [0u8; 5];
    if read_full(&mut file, &mut magic)? && &magic == ISO9660_MAGIC {
        return Ok(DiskFormat::Iso);
    }

    Ok(DiskFormat::Raw)
}

/// Like `read_exact`, but a short file yields `false` instead of an error.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
