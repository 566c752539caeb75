use crate::fs::errors::Status;
use crate::fs::types::cache_flags;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;

const XATTR_CHUNK_SIZE: &CStr = c"user.chunk_size";
const XATTR_CACHE_FLAGS: &CStr = c"user.cache_flags";
const XATTR_SIZE: &CStr = c"user.size";

/// Fixed length of the in-file header in header mode. The header occupies
/// `{ chunk_size: u64, msize: u16, flags: u16 }` padded to 8-byte alignment;
/// the logical payload begins at this offset.
pub const HEADER_LEN: u64 = 16;

/// Per-chunk metadata persisted alongside the chunk payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub chunk_size: u64,
    pub flags: u16,
    pub file_size: u64,
}

impl ChunkMetadata {
    pub fn is_dirty(&self) -> bool {
        self.flags & cache_flags::DIRTY != 0
    }

    pub fn is_cache(&self) -> bool {
        self.flags & cache_flags::CACHE != 0
    }
}

/// How chunk metadata is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataMode {
    /// Extended attributes on the chunk file; payload starts at offset 0.
    Xattr,
    /// A header block at offset 0; payload starts at [`HEADER_LEN`]. For
    /// filesystems without user xattr support.
    Header,
}

/// Strategy object wrapping the two persistence modes behind one API.
/// Selected from configuration at startup; must match the data already on
/// disk under the data root.
#[derive(Debug, Clone, Copy)]
pub struct MetadataStore {
    mode: MetadataMode,
}

impl MetadataStore {
    pub fn new(mode: MetadataMode) -> Self {
        MetadataStore { mode }
    }

    /// Offset of the chunk payload within the chunk file.
    pub fn payload_offset(&self) -> u64 {
        match self.mode {
            MetadataMode::Xattr => 0,
            MetadataMode::Header => HEADER_LEN,
        }
    }

    /// Writes all three metadata fields. Idempotent; called on create before
    /// success is reported and on every metadata transition afterwards.
    pub fn set(&self, path: &Path, md: &ChunkMetadata) -> Result<(), Status> {
        match self.mode {
            MetadataMode::Xattr => {
                set_xattr(path, XATTR_CHUNK_SIZE, &md.chunk_size.to_ne_bytes())?;
                set_xattr(path, XATTR_CACHE_FLAGS, &md.flags.to_ne_bytes())?;
                set_xattr(path, XATTR_SIZE, &md.file_size.to_ne_bytes())
            }
            MetadataMode::Header => {
                let meta = std::fs::symlink_metadata(path)?;
                if !meta.is_file() {
                    // Directories and symlinks have no header block to write.
                    return Ok(());
                }
                let file = OpenOptions::new().write(true).open(path)?;
                let mut header = [0u8; HEADER_LEN as usize];
                header[..8].copy_from_slice(&md.chunk_size.to_le_bytes());
                header[8..10].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
                header[10..12].copy_from_slice(&md.flags.to_le_bytes());
                file.write_all_at(&header, 0)?;
                // The payload length is the file length past the header.
                if meta.len() != HEADER_LEN + md.file_size {
                    file.set_len(HEADER_LEN + md.file_size)?;
                }
                Ok(())
            }
        }
    }

    pub fn get(&self, path: &Path) -> Result<ChunkMetadata, Status> {
        match self.mode {
            MetadataMode::Xattr => {
                let chunk_size = u64::from_ne_bytes(get_xattr::<8>(path, XATTR_CHUNK_SIZE)?);
                let flags = u16::from_ne_bytes(get_xattr::<2>(path, XATTR_CACHE_FLAGS)?);
                let file_size = u64::from_ne_bytes(get_xattr::<8>(path, XATTR_SIZE)?);
                Ok(ChunkMetadata {
                    chunk_size,
                    flags,
                    file_size,
                })
            }
            MetadataMode::Header => {
                let meta = std::fs::symlink_metadata(path)?;
                if !meta.is_file() {
                    return Err(Status::NoEntry);
                }
                let file = OpenOptions::new().read(true).open(path)?;
                let mut header = [0u8; HEADER_LEN as usize];
                file.read_exact_at(&mut header, 0)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::UnexpectedEof => Status::NoEntry,
                        _ => Status::from_io(&e),
                    })?;
                let chunk_size = u64::from_le_bytes(header[..8].try_into().unwrap());
                let flags = u16::from_le_bytes(header[10..12].try_into().unwrap());
                Ok(ChunkMetadata {
                    chunk_size,
                    flags,
                    file_size: meta.len().saturating_sub(HEADER_LEN),
                })
            }
        }
    }
}

fn path_cstr(path: &Path) -> Result<CString, Status> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Status::Unknown)
}

fn set_xattr(path: &Path, name: &CStr, value: &[u8]) -> Result<(), Status> {
    let path = path_cstr(path)?;
    let r = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if r == -1 {
        return Err(Status::from_io(&io::Error::last_os_error()));
    }
    Ok(())
}

fn get_xattr<const N: usize>(path: &Path, name: &CStr) -> Result<[u8; N], Status> {
    let path = path_cstr(path)?;
    let mut value = [0u8; N];
    let r = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_mut_ptr().cast(),
            value.len(),
        )
    };
    if r == -1 {
        return Err(Status::from_io(&io::Error::last_os_error()));
    }
    if r as usize != N {
        return Err(Status::Unknown);
    }
    Ok(value)
}
