use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-chunk lock table keyed by the chunk's on-disk path.
///
/// The kernel serializes payload writes, but the metadata read-modify-write
/// in write/truncate/flush would race without this; entries are created on
/// demand and dropped again once no task holds them.
#[derive(Clone, Default)]
pub struct LockManager {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

pub struct ChunkGuard {
    _guard: OwnedMutexGuard<()>,
    path: PathBuf,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, path: &Path) -> ChunkGuard {
        let lock = self.get_or_create(path);
        let guard = lock.lock_owned().await;
        ChunkGuard {
            _guard: guard,
            path: path.to_path_buf(),
            locks: self.locks.clone(),
        }
    }
}

impl Drop for ChunkGuard {
    fn drop(&mut self) {
        // One reference held by the map, one by the guard being dropped.
        self.locks
            .remove_if(&self.path, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn sequential_acquire_release() {
        let manager = LockManager::new();
        let p = Path::new("a/b:0");
        drop(manager.acquire(p).await);
        let _again = manager.acquire(p).await;
    }

    #[tokio::test]
    async fn different_chunks_do_not_block() {
        let manager = Arc::new(LockManager::new());
        let _held = manager.acquire(Path::new("f:0")).await;

        let manager2 = manager.clone();
        let acquired = Arc::new(AtomicBool::new(false));
        let acquired2 = acquired.clone();
        let handle = tokio::spawn(async move {
            let _g = manager2.acquire(Path::new("f:1")).await;
            acquired2.store(true, Ordering::SeqCst);
        });
        handle.await.unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn entries_are_cleaned_up() {
        let manager = LockManager::new();
        {
            let _a = manager.acquire(Path::new("x:0")).await;
            let _b = manager.acquire(Path::new("y:0")).await;
            assert_eq!(manager.locks.len(), 2);
        }
        assert_eq!(manager.locks.len(), 0);
    }
}
