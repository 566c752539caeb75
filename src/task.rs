use std::future::Future;
use tokio::task::JoinHandle;
use tracing::trace;

/// Spawns a long-lived task under a diagnostic name.
pub fn spawn_named<T, F>(name: &'static str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    trace!(task = name, "spawn");
    tokio::spawn(future)
}

/// Runs blocking file I/O on the dedicated blocking pool so RPC-serving
/// workers stay responsive.
pub fn spawn_blocking_named<T, F>(name: &'static str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    trace!(task = name, "spawn_blocking");
    tokio::task::spawn_blocking(f)
}
