use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::{Builder, Runtime};

/// Builds the Tokio runtime that drives replica connections.
///
/// Pass its handle to [`QuorumStore::new`](crate::QuorumStore::new).
pub fn io_runtime(worker_threads: usize) -> std::io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("cregion-store-{}", id)
        })
        .enable_all()
        .build()
}
