use crate::fs::backend::{BackendSink, mkdir_parent};
use crate::fs::errors::Status;
use crate::fs::key::{ChunkKey, chunk_key};
use crate::fs::lock_manager::LockManager;
use crate::fs::metadata::{ChunkMetadata, MetadataMode, MetadataStore};
use crate::fs::types::{DirEntry, FileStat, Timespec, cache_flags, emode};
use crate::ring::RingTable;
use crate::task::spawn_blocking_named;
use anyhow::Context;
use bytes::Bytes;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The chunk-addressed file engine: every keyed object is one ordinary file
/// under the data root, carrying its own metadata and cache state. Mutations
/// mark chunks dirty and enqueue them for the flush workers.
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    data_root: PathBuf,
    metadata: MetadataStore,
    backend: Option<BackendSink>,
    ring: Arc<RingTable>,
    locks: LockManager,
    flush_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChunkStore {
    /// Materializes the data root and wires the flush queue. The returned
    /// receiver feeds the flush worker pool.
    pub fn new(
        data_root: PathBuf,
        metadata_mode: MetadataMode,
        backend_root: Option<PathBuf>,
        ring: Arc<RingTable>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>)> {
        fs::create_dir_all(&data_root)
            .with_context(|| format!("creating data root {}", data_root.display()))?;
        info!(path = %data_root.display(), mode = ?metadata_mode, "chunk store initialized");

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let store = ChunkStore {
            inner: Arc::new(StoreInner {
                data_root,
                metadata: MetadataStore::new(metadata_mode),
                backend: backend_root.map(BackendSink::new),
                ring,
                locks: LockManager::new(),
                flush_tx,
            }),
        };
        Ok((store, flush_rx))
    }

    pub async fn create(
        &self,
        key: &[u8],
        uid: u32,
        gid: u32,
        emode_word: u32,
        chunk_size: u64,
        symlink_target: Option<Vec<u8>>,
    ) -> Result<(), Status> {
        let inner = self.inner.clone();
        let path = inner.resolve(key);
        let _guard = inner.locks.acquire(&path).await;
        let key = key.to_vec();
        run_blocking("fs-create", move || {
            inner.create_blocking(&key, uid, gid, emode_word, chunk_size, symlink_target)
        })
        .await
    }

    pub async fn stat(&self, key: &[u8]) -> Result<FileStat, Status> {
        let inner = self.inner.clone();
        let path = inner.resolve(key);
        run_blocking("fs-stat", move || inner.stat_blocking(&path)).await
    }

    /// Writes a clamped byte range into one chunk and records the new
    /// file-size high-water mark. Returns the number of bytes written.
    pub async fn write(
        &self,
        key: &[u8],
        value: Bytes,
        offset: i64,
        emode_word: u32,
        chunk_size: u64,
    ) -> Result<u64, Status> {
        let inner = self.inner.clone();
        let path = inner.resolve(key);
        let _guard = inner.locks.acquire(&path).await;
        let key = key.to_vec();
        run_blocking("fs-write", move || {
            inner.write_blocking(&key, &path, &value, offset, emode_word, chunk_size)
        })
        .await
    }

    pub async fn read(&self, key: &[u8], size: u64, offset: i64) -> Result<Vec<u8>, Status> {
        let inner = self.inner.clone();
        let path = inner.resolve(key);
        run_blocking("fs-read", move || inner.read_blocking(&path, size, offset)).await
    }

    pub async fn truncate(&self, key: &[u8], len: u64) -> Result<(), Status> {
        let inner = self.inner.clone();
        let path = inner.resolve(key);
        let _guard = inner.locks.acquire(&path).await;
        let key = key.to_vec();
        run_blocking("fs-truncate", move || {
            let md = inner.metadata.get(&path)?;
            inner.metadata.set(
                &path,
                &ChunkMetadata {
                    chunk_size: md.chunk_size,
                    flags: md.flags | cache_flags::DIRTY,
                    file_size: len,
                },
            )?;
            inner.enqueue_flush(&key);
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, key: &[u8]) -> Result<(), Status> {
        let inner = self.inner.clone();
        let path = inner.resolve(key);
        run_blocking("fs-remove", move || inner.remove_blocking(&path)).await
    }

    /// Logical directory listing: chunk files (`:` in the name) and pure
    /// backend mirrors (CACHE flag, never locally modified) are invisible.
    pub async fn readdir(&self, path_key: &[u8]) -> Result<Vec<DirEntry>, Status> {
        let inner = self.inner.clone();
        let path = inner.resolve(path_key);
        run_blocking("fs-readdir", move || inner.readdir_blocking(&path)).await
    }

    /// Sweeps chunk files of `base` from `start_index` upward, unlinking the
    /// ones this server owns and stopping at the first unlink failure.
    pub async fn unlink_chunk_all(&self, base: &[u8], start_index: u32) -> Result<(), Status> {
        let inner = self.inner.clone();
        let base = base.to_vec();
        run_blocking("fs-unlink-chunks", move || {
            let mut index = start_index;
            loop {
                let key = chunk_key(&base, index);
                index += 1;
                if !inner.ring.is_in_charge(&key) {
                    continue;
                }
                let path = inner.resolve(&key);
                if fs::remove_file(&path).is_err() {
                    return Ok(());
                }
                debug!(path = %path.display(), "unlinked chunk");
            }
        })
        .await
    }

    /// Pushes one dirty chunk to the backend and marks it a clean mirror.
    /// Called by the flush workers; harmless to repeat on a clean chunk.
    pub async fn flush(&self, key: &[u8]) -> Result<(), Status> {
        let inner = self.inner.clone();
        let path = inner.resolve(key);
        let _guard = inner.locks.acquire(&path).await;
        let key = key.to_vec();
        run_blocking("fs-flush", move || inner.flush_blocking(&key, &path)).await
    }
}

async fn run_blocking<T, F>(name: &'static str, f: F) -> Result<T, Status>
where
    F: FnOnce() -> Result<T, Status> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking_named(name, f)
        .await
        .unwrap_or(Err(Status::Unknown))
}

impl StoreInner {
    fn resolve(&self, key: &[u8]) -> PathBuf {
        self.data_root.join(ChunkKey::new(key).local_path())
    }

    fn enqueue_flush(&self, key: &[u8]) {
        // A closed queue means we are shutting down; the chunk stays dirty.
        let _ = self.flush_tx.send(key.to_vec());
    }

    /// Opens a chunk read-write, creating it (plus parents and metadata) when
    /// absent. Returns whether this call created the file.
    fn open_rw(
        &self,
        path: &Path,
        mode: u32,
        chunk_size: u64,
        flags: u16,
    ) -> Result<(fs::File, bool), Status> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Ok((file, false)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                mkdir_parent(path)?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .mode(mode & 0o7777)
                    .open(path)?;
                self.metadata.set(
                    path,
                    &ChunkMetadata {
                        chunk_size,
                        flags,
                        file_size: 0,
                    },
                )?;
                Ok((file, true))
            }
            Err(e) => Err(Status::from_io(&e)),
        }
    }

    fn create_blocking(
        &self,
        key: &[u8],
        _uid: u32,
        _gid: u32,
        emode_word: u32,
        chunk_size: u64,
        symlink_target: Option<Vec<u8>>,
    ) -> Result<(), Status> {
        let path = self.resolve(key);
        let mode = emode::mode_bits(emode_word);
        let mut flags = emode::flags_bits(emode_word);
        debug!(path = %path.display(), mode = format_args!("{mode:o}"), chunk_size, "create");

        if emode::is_reg(emode_word) {
            if flags & cache_flags::CACHE == 0 {
                flags |= cache_flags::DIRTY;
            }
            let file = match OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode & 0o7777)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    mkdir_parent(&path)?;
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .mode(mode & 0o7777)
                        .open(&path)?
                }
                Err(e) => return Err(Status::from_io(&e)),
            };
            // Metadata must exist before create reports success; the fd is
            // closed either way.
            self.metadata.set(
                &path,
                &ChunkMetadata {
                    chunk_size,
                    flags,
                    file_size: 0,
                },
            )?;
            drop(file);
        } else if emode::is_dir(emode_word) {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true).mode(mode & 0o7777);
            builder.create(&path)?;
            self.metadata.set(
                &path,
                &ChunkMetadata {
                    chunk_size: 0,
                    flags,
                    file_size: 0,
                },
            )?;
        } else if emode::is_lnk(emode_word) {
            let target = symlink_target.ok_or(Status::NotSupported)?;
            let target = PathBuf::from(std::ffi::OsStr::from_bytes(&target));
            if symlink(&target, &path).is_err() {
                mkdir_parent(&path)?;
                symlink(&target, &path)?;
            }
        } else {
            return Err(Status::NotSupported);
        }

        if flags & cache_flags::CACHE == 0 {
            self.enqueue_flush(key);
        }
        Ok(())
    }

    fn stat_blocking(&self, path: &Path) -> Result<FileStat, Status> {
        let sb = fs::symlink_metadata(path)?;
        let mut stat = FileStat {
            mode: sb.mode(),
            uid: sb.uid(),
            gid: sb.gid(),
            size: sb.size(),
            chunk_size: 0,
            mtime: Timespec {
                sec: sb.mtime(),
                nsec: sb.mtime_nsec(),
            },
            ctime: Timespec {
                sec: sb.ctime(),
                nsec: sb.ctime_nsec(),
            },
        };
        if sb.is_file() {
            let md = self.metadata.get(path)?;
            stat.mode = emode::compose(sb.mode(), md.flags);
            stat.size = md.file_size;
            stat.chunk_size = md.chunk_size;
        }
        Ok(stat)
    }

    fn write_blocking(
        &self,
        key: &[u8],
        path: &Path,
        value: &Bytes,
        offset: i64,
        emode_word: u32,
        chunk_size: u64,
    ) -> Result<u64, Status> {
        if offset < 0 {
            return Err(Status::Unknown);
        }
        let offset = offset as u64;
        debug!(path = %path.display(), len = value.len(), offset, "write");
        if offset >= chunk_size {
            return Ok(0);
        }
        let ss = (value.len() as u64).min(chunk_size - offset);

        let mode = emode::mode_bits(emode_word);
        let mut flags = emode::flags_bits(emode_word);
        if flags & cache_flags::CACHE == 0 {
            flags |= cache_flags::DIRTY;
        }

        let (file, created) = self.open_rw(path, mode, chunk_size, flags)?;
        file.write_all_at(
            &value[..ss as usize],
            self.metadata.payload_offset() + offset,
        )?;

        let prev = if created {
            ChunkMetadata {
                chunk_size,
                flags,
                file_size: 0,
            }
        } else {
            self.metadata.get(path).unwrap_or_default()
        };
        self.metadata.set(
            path,
            &ChunkMetadata {
                chunk_size,
                flags: prev.flags | flags,
                file_size: prev.file_size.max(offset + ss),
            },
        )?;

        if emode::flags_bits(emode_word) & cache_flags::CACHE == 0 {
            self.enqueue_flush(key);
        }
        Ok(ss)
    }

    fn read_blocking(&self, path: &Path, size: u64, offset: i64) -> Result<Vec<u8>, Status> {
        if offset < 0 {
            return Err(Status::Unknown);
        }
        let offset = offset as u64;
        debug!(path = %path.display(), size, offset, "read");

        if let Ok(sb) = fs::symlink_metadata(path)
            && sb.file_type().is_symlink()
        {
            let mut target = fs::read_link(path)?.into_os_string().into_vec();
            target.truncate(size as usize);
            return Ok(target);
        }

        let file = OpenOptions::new().read(true).open(path)?;
        let md = self.metadata.get(path)?;
        if offset >= md.chunk_size || offset >= md.file_size {
            return Ok(Vec::new());
        }
        let ss = size
            .min(md.chunk_size - offset)
            .min(md.file_size - offset);

        let mut buf = vec![0u8; ss as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read_at(
                &mut buf[filled..],
                self.metadata.payload_offset() + offset + filled as u64,
            )?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn remove_blocking(&self, path: &Path) -> Result<(), Status> {
        let sb = fs::symlink_metadata(path)?;
        debug!(path = %path.display(), "remove");
        if sb.is_dir() {
            rmdir_recursive(path)
        } else {
            fs::remove_file(path).map_err(|e| Status::from_io(&e))
        }
    }

    fn readdir_blocking(&self, path: &Path) -> Result<Vec<DirEntry>, Status> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            if name.as_bytes().contains(&b':') {
                continue;
            }
            let entry_path = entry.path();
            let md = self.metadata.get(&entry_path).ok();
            if let Some(md) = &md
                && md.is_cache()
            {
                continue;
            }
            let Ok(stat) = self.stat_dirent(&entry_path, md) else {
                continue;
            };
            entries.push(DirEntry {
                name: name.as_bytes().to_vec(),
                stat,
            });
        }
        Ok(entries)
    }

    fn stat_dirent(&self, path: &Path, md: Option<ChunkMetadata>) -> Result<FileStat, Status> {
        let sb = fs::symlink_metadata(path)?;
        let mut stat = FileStat {
            mode: sb.mode(),
            uid: sb.uid(),
            gid: sb.gid(),
            size: sb.size(),
            chunk_size: 0,
            mtime: Timespec {
                sec: sb.mtime(),
                nsec: sb.mtime_nsec(),
            },
            ctime: Timespec {
                sec: sb.ctime(),
                nsec: sb.ctime_nsec(),
            },
        };
        if sb.is_file()
            && let Some(md) = md
        {
            stat.size = md.file_size;
            stat.chunk_size = md.chunk_size;
        }
        Ok(stat)
    }

    fn flush_blocking(&self, key: &[u8], path: &Path) -> Result<(), Status> {
        let view = ChunkKey::new(key);
        let backend = self.backend.as_ref().ok_or(Status::NoBackendPath)?;
        let rel = view.backend_rel_path()?;
        let sb = fs::symlink_metadata(path)?;

        if sb.is_dir() {
            return backend.mirror_dir(&rel, sb.mode());
        }
        if sb.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            return backend.mirror_symlink(&target, &rel);
        }
        if !sb.is_file() {
            return Err(Status::NotSupported);
        }

        let md = self.metadata.get(path)?;
        if !md.is_dirty() {
            debug!(path = %path.display(), "flush: clean");
            return Ok(());
        }

        let file = OpenOptions::new().read(true).open(path)?;
        let mut buf = vec![0u8; md.file_size as usize];
        file.read_exact_at(&mut buf, self.metadata.payload_offset())
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => Status::PartialRead,
                _ => Status::from_io(&e),
            })?;

        backend.write(
            &rel,
            &buf,
            view.index() as u64 * md.chunk_size,
            !md.is_cache(),
            sb.mode(),
        )?;

        self.metadata.set(
            path,
            &ChunkMetadata {
                chunk_size: md.chunk_size,
                flags: (md.flags & !cache_flags::DIRTY) | cache_flags::CACHE,
                file_size: md.file_size,
            },
        )
    }
}

fn rmdir_recursive(dir: &Path) -> Result<(), Status> {
    match fs::remove_dir(dir) {
        Ok(()) => return Ok(()),
        Err(e)
            if e.raw_os_error() != Some(libc::ENOTEMPTY)
                && e.raw_os_error() != Some(libc::EEXIST) =>
        {
            return Err(Status::from_io(&e));
        }
        Err(_) => {}
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            rmdir_recursive(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    fs::remove_dir(dir).map_err(|e| Status::from_io(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingDigest;

    const CHUNK_SIZE: u64 = 4096;

    fn new_store(
        data: &Path,
        backend: Option<&Path>,
    ) -> (ChunkStore, mpsc::UnboundedReceiver<Vec<u8>>) {
        let ring = Arc::new(RingTable::new(RingDigest::Md5, false, "n0:9000"));
        ChunkStore::new(
            data.to_path_buf(),
            MetadataMode::Header,
            backend.map(|p| p.to_path_buf()),
            ring,
        )
        .unwrap()
    }

    fn reg_mode() -> u32 {
        libc::S_IFREG | 0o644
    }

    #[tokio::test]
    async fn create_write_read_stat_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);

        store
            .create(b"a/b\0", 1000, 1000, reg_mode(), CHUNK_SIZE, None)
            .await
            .unwrap();
        let written = store
            .write(b"a/b\0", Bytes::from_static(b"hello"), 0, reg_mode(), CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(written, 5);

        let data = store.read(b"a/b\0", 16, 0).await.unwrap();
        assert_eq!(data, b"hello");

        let stat = store.stat(b"a/b\0").await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.chunk_size, CHUNK_SIZE);
        assert!(emode::is_reg(stat.mode));
    }

    #[tokio::test]
    async fn write_clamps_to_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);

        let written = store
            .write(b"f\0", Bytes::from(vec![7u8; 100]), 60, reg_mode(), 64)
            .await
            .unwrap();
        assert_eq!(written, 4);

        let written = store
            .write(b"f\0", Bytes::from_static(b"x"), 64, reg_mode(), 64)
            .await
            .unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn write_keeps_file_size_high_water_mark() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);

        store
            .write(b"f\0", Bytes::from(vec![1u8; 100]), 0, reg_mode(), CHUNK_SIZE)
            .await
            .unwrap();
        store
            .write(b"f\0", Bytes::from(vec![2u8; 10]), 5, reg_mode(), CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(store.stat(b"f\0").await.unwrap().size, 100);
    }

    #[tokio::test]
    async fn read_is_clamped_by_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);

        store
            .write(b"f\0", Bytes::from_static(b"abcdef"), 0, reg_mode(), CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(store.read(b"f\0", 100, 0).await.unwrap(), b"abcdef");
        assert_eq!(store.read(b"f\0", 100, 4).await.unwrap(), b"ef");
        assert_eq!(store.read(b"f\0", 100, 6).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn cache_state_machine() {
        let data = tempfile::tempdir().unwrap();
        let backend = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(data.path(), Some(backend.path()));

        store
            .create(b"f\0", 0, 0, reg_mode(), 64, None)
            .await
            .unwrap();
        store
            .write(b"f\0", Bytes::from(vec![b'x'; 32]), 0, reg_mode(), 64)
            .await
            .unwrap();

        // Locally created, never flushed.
        let stat = store.stat(b"f\0").await.unwrap();
        assert_eq!(emode::flags_bits(stat.mode), cache_flags::DIRTY);

        store.flush(b"f\0").await.unwrap();
        let stat = store.stat(b"f\0").await.unwrap();
        assert_eq!(emode::flags_bits(stat.mode), cache_flags::CACHE);
        assert_eq!(
            fs::read(backend.path().join("f")).unwrap(),
            vec![b'x'; 32]
        );

        // A clean mirror that gets modified is dirty again but stays a cache.
        store
            .write(b"f\0", Bytes::from_static(b"y"), 0, reg_mode(), 64)
            .await
            .unwrap();
        let stat = store.stat(b"f\0").await.unwrap();
        assert_eq!(
            emode::flags_bits(stat.mode),
            cache_flags::CACHE | cache_flags::DIRTY
        );

        // Flushing a clean chunk is a no-op.
        store.flush(b"f\0").await.unwrap();
        store.flush(b"f\0").await.unwrap();
    }

    #[tokio::test]
    async fn flush_collates_chunks_at_offsets() {
        let data = tempfile::tempdir().unwrap();
        let backend = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(data.path(), Some(backend.path()));

        let k1 = chunk_key(b"/big", 1);
        store
            .write(b"/big\0", Bytes::from(vec![b'a'; 64]), 0, reg_mode(), 64)
            .await
            .unwrap();
        store
            .write(&k1, Bytes::from(vec![b'b'; 8]), 0, reg_mode(), 64)
            .await
            .unwrap();
        store.flush(b"/big\0").await.unwrap();
        store.flush(&k1).await.unwrap();

        let out = fs::read(backend.path().join("big")).unwrap();
        assert_eq!(out.len(), 72);
        assert_eq!(&out[..64], &vec![b'a'; 64][..]);
        assert_eq!(&out[64..], &vec![b'b'; 8][..]);
    }

    #[tokio::test]
    async fn flush_without_backend_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);
        store
            .write(b"f\0", Bytes::from_static(b"z"), 0, reg_mode(), 64)
            .await
            .unwrap();
        assert_eq!(store.flush(b"f\0").await, Err(Status::NoBackendPath));
    }

    #[tokio::test]
    async fn mutations_enqueue_flush_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut rx) = new_store(dir.path(), None);

        store
            .create(b"f\0", 0, 0, reg_mode(), 64, None)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"f\0");

        store
            .write(b"f\0", Bytes::from_static(b"x"), 0, reg_mode(), 64)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"f\0");

        store.truncate(b"f\0", 0).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"f\0");

        // A cache-mirror create must not be enqueued.
        store
            .create(b"mirror\0", 0, 0, reg_mode() | emode::CACHE, 64, None)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn truncate_marks_dirty() {
        let data = tempfile::tempdir().unwrap();
        let backend = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(data.path(), Some(backend.path()));

        store
            .write(b"f\0", Bytes::from_static(b"abcdef"), 0, reg_mode(), 64)
            .await
            .unwrap();
        store.flush(b"f\0").await.unwrap();
        store.truncate(b"f\0", 3).await.unwrap();

        let stat = store.stat(b"f\0").await.unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(
            emode::flags_bits(stat.mode),
            cache_flags::CACHE | cache_flags::DIRTY
        );
    }

    #[tokio::test]
    async fn readdir_hides_chunks_and_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);

        store
            .write(b"/d/foo\0", Bytes::from_static(b"abc"), 0, reg_mode(), 4)
            .await
            .unwrap();
        store
            .write(
                &chunk_key(b"/d/foo", 1),
                Bytes::from_static(b"de"),
                0,
                reg_mode(),
                4,
            )
            .await
            .unwrap();
        store
            .write(b"/d/bar\0", Bytes::from_static(b"x"), 0, reg_mode(), 4)
            .await
            .unwrap();
        store
            .create(b"/d/mirror\0", 0, 0, reg_mode() | emode::CACHE, 4, None)
            .await
            .unwrap();

        let mut names: Vec<Vec<u8>> = store
            .readdir(b"/d\0")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec![b"bar".to_vec(), b"foo".to_vec()]);

        let entries = store.readdir(b"/d\0").await.unwrap();
        let foo = entries.iter().find(|e| e.name == b"foo").unwrap();
        assert_eq!(foo.stat.size, 3);
    }

    #[tokio::test]
    async fn remove_and_chunk_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);

        store
            .write(b"/f\0", Bytes::from_static(b"aaaa"), 0, reg_mode(), 4)
            .await
            .unwrap();
        for i in 1..4u32 {
            store
                .write(&chunk_key(b"/f", i), Bytes::from_static(b"bbbb"), 0, reg_mode(), 4)
                .await
                .unwrap();
        }

        store.remove(b"/f\0").await.unwrap();
        store.unlink_chunk_all(b"/f", 1).await.unwrap();

        assert_eq!(store.stat(b"/f\0").await, Err(Status::NoEntry));
        for i in 1..4u32 {
            assert_eq!(
                store.stat(&chunk_key(b"/f", i)).await,
                Err(Status::NoEntry)
            );
        }
        assert_eq!(store.remove(b"/f\0").await, Err(Status::NoEntry));
    }

    #[tokio::test]
    async fn remove_directory_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);

        store
            .create(b"/d\0", 0, 0, libc::S_IFDIR | 0o755, 0, None)
            .await
            .unwrap();
        store
            .write(b"/d/x\0", Bytes::from_static(b"1"), 0, reg_mode(), 4)
            .await
            .unwrap();
        store
            .write(b"/d/sub/y\0", Bytes::from_static(b"2"), 0, reg_mode(), 4)
            .await
            .unwrap();

        store.remove(b"/d\0").await.unwrap();
        assert_eq!(store.stat(b"/d\0").await, Err(Status::NoEntry));
    }

    #[tokio::test]
    async fn symlink_create_read_and_flush() {
        let data = tempfile::tempdir().unwrap();
        let backend = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(data.path(), Some(backend.path()));

        store
            .create(
                b"/l\0",
                0,
                0,
                libc::S_IFLNK | 0o777,
                0,
                Some(b"target/file".to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(store.read(b"/l\0", 64, 0).await.unwrap(), b"target/file");

        store.flush(b"/l\0").await.unwrap();
        assert_eq!(
            fs::read_link(backend.path().join("l")).unwrap(),
            PathBuf::from("target/file")
        );
    }

    #[tokio::test]
    async fn directory_flush_mirrors_tree() {
        let data = tempfile::tempdir().unwrap();
        let backend = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(data.path(), Some(backend.path()));

        store
            .create(b"/a/b\0", 0, 0, libc::S_IFDIR | 0o755, 0, None)
            .await
            .unwrap();
        store.flush(b"/a/b\0").await.unwrap();
        assert!(backend.path().join("a/b").is_dir());
    }

    #[tokio::test]
    async fn unsupported_inode_type() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _rx) = new_store(dir.path(), None);
        assert_eq!(
            store
                .create(b"/s\0", 0, 0, libc::S_IFSOCK | 0o644, 0, None)
                .await,
            Err(Status::NotSupported)
        );
    }
}
