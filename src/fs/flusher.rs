use crate::fs::chunk_store::ChunkStore;
use crate::task::spawn_named;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Background pool draining the dirty-chunk FIFO.
///
/// Delivery is at-least-once: flush is idempotent once a chunk is clean, so
/// duplicate keys are harmless. A failed flush is logged and not requeued;
/// the chunk stays dirty and the next mutation enqueues it again.
pub struct Flusher {
    store: ChunkStore,
    workers: usize,
}

impl Flusher {
    pub fn new(store: ChunkStore, workers: usize) -> Self {
        Flusher {
            store,
            workers: workers.max(1),
        }
    }

    pub fn spawn(
        self,
        flush_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        info!(workers = self.workers, "flush worker pool started");
        let flush_rx = Arc::new(Mutex::new(flush_rx));
        (0..self.workers)
            .map(|id| {
                let store = self.store.clone();
                let flush_rx = Arc::clone(&flush_rx);
                let shutdown = shutdown.clone();
                spawn_named("flush-worker", async move {
                    worker_loop(id, store, flush_rx, shutdown).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(
    id: usize,
    store: ChunkStore,
    flush_rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    shutdown: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            key = recv_next(&flush_rx) => key,
            _ = shutdown.cancelled() => {
                drain(id, &store, &flush_rx).await;
                break;
            }
        };
        let Some(key) = key else {
            debug!(worker = id, "flush queue closed");
            break;
        };
        flush_one(&store, &key).await;
    }
    info!(worker = id, "flush worker stopped");
}

async fn recv_next(flush_rx: &Mutex<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    flush_rx.lock().await.recv().await
}

/// Final pass on shutdown: push whatever is still queued.
async fn drain(id: usize, store: &ChunkStore, flush_rx: &Mutex<mpsc::UnboundedReceiver<Vec<u8>>>) {
    let mut rx = flush_rx.lock().await;
    let mut drained = 0usize;
    while let Ok(key) = rx.try_recv() {
        flush_one(store, &key).await;
        drained += 1;
    }
    if drained > 0 {
        info!(worker = id, drained, "shutdown flush complete");
    }
}

async fn flush_one(store: &ChunkStore, key: &[u8]) {
    match store.flush(key).await {
        Ok(()) => debug!(key = %String::from_utf8_lossy(key), "flushed"),
        Err(status) if status.is_benign() => {
            info!(key = %String::from_utf8_lossy(key), %status, "flush skipped")
        }
        Err(status) => {
            // The chunk stays dirty; the next mutation re-enqueues it.
            error!(key = %String::from_utf8_lossy(key), %status, "flush failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::MetadataMode;
    use crate::fs::types::{cache_flags, emode};
    use crate::ring::{RingDigest, RingTable};
    use bytes::Bytes;

    #[tokio::test]
    async fn worker_drains_queue_and_cleans_chunks() {
        let data = tempfile::tempdir().unwrap();
        let backend = tempfile::tempdir().unwrap();
        let ring = Arc::new(RingTable::new(RingDigest::Md5, false, "n0:9000"));
        let (store, rx) = ChunkStore::new(
            data.path().to_path_buf(),
            MetadataMode::Header,
            Some(backend.path().to_path_buf()),
            ring,
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        let handles = Flusher::new(store.clone(), 2).spawn(rx, shutdown.clone());

        store
            .write(
                b"f\0",
                Bytes::from(vec![b'x'; 32]),
                0,
                libc::S_IFREG | 0o644,
                64,
            )
            .await
            .unwrap();

        // Wait for the worker to flush and mark the chunk a clean mirror.
        for _ in 0..100 {
            let stat = store.stat(b"f\0").await.unwrap();
            if emode::flags_bits(stat.mode) == cache_flags::CACHE {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let stat = store.stat(b"f\0").await.unwrap();
        assert_eq!(emode::flags_bits(stat.mode), cache_flags::CACHE);
        assert_eq!(std::fs::read(backend.path().join("f")).unwrap().len(), 32);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn failed_flush_leaves_chunk_dirty() {
        let data = tempfile::tempdir().unwrap();
        let ring = Arc::new(RingTable::new(RingDigest::Md5, false, "n0:9000"));
        // No backend configured: every flush fails with NoBackendPath.
        let (store, rx) = ChunkStore::new(
            data.path().to_path_buf(),
            MetadataMode::Header,
            None,
            ring,
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        let handles = Flusher::new(store.clone(), 1).spawn(rx, shutdown.clone());

        store
            .write(
                b"f\0",
                Bytes::from_static(b"data"),
                0,
                libc::S_IFREG | 0o644,
                64,
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stat = store.stat(b"f\0").await.unwrap();
        assert_eq!(emode::flags_bits(stat.mode), cache_flags::DIRTY);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
