use crate::fs::errors::Status;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt, symlink};
use std::path::{Path, PathBuf};
use tracing::debug;

/// The durable store that flushed chunks are collated into. Chunks of one
/// logical file land at `index * chunk_size` offsets in a single backend
/// file, so the backend tree mirrors the logical namespace without chunk
/// suffixes.
pub struct BackendSink {
    root: PathBuf,
}

impl BackendSink {
    pub fn new(root: PathBuf) -> Self {
        BackendSink { root }
    }

    /// Writes `buf` at `offset` in the backend file at `rel`, creating the
    /// file (when `create` is set) and its parents as needed.
    pub fn write(
        &self,
        rel: &Path,
        buf: &[u8],
        offset: u64,
        create: bool,
        mode: u32,
    ) -> Result<(), Status> {
        let dst = self.root.join(rel);
        let mut opts = OpenOptions::new();
        opts.write(true)
            .create(create)
            .mode(mode & 0o7777);
        let file = match opts.open(&dst) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {
                mkdir_parent(&dst)?;
                opts.open(&dst)?
            }
            Err(e) => return Err(Status::from_io(&e)),
        };
        file.write_all_at(buf, offset)?;
        debug!(dst = %dst.display(), len = buf.len(), offset, "backend write");
        Ok(())
    }

    /// Mirrors a logical directory into the backend.
    pub fn mirror_dir(&self, rel: &Path, _mode: u32) -> Result<(), Status> {
        let dst = self.root.join(rel);
        fs::create_dir_all(&dst)?;
        Ok(())
    }

    /// Mirrors a symlink into the backend, retrying once after materializing
    /// the parent directory.
    pub fn mirror_symlink(&self, target: &Path, rel: &Path) -> Result<(), Status> {
        let dst = self.root.join(rel);
        match symlink(target, &dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(_) => {
                mkdir_parent(&dst)?;
                match symlink(target, &dst) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                    Err(e) => Err(Status::from_io(&e)),
                }
            }
        }
    }
}

/// Materializes the parent directory of `path`.
pub fn mkdir_parent(path: &Path) -> Result<(), Status> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
