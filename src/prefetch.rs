//! Concurrent warm-up of the file metadata cache.
//!
//! Before linking the graph, the driver queues background walks over the
//! engine and project trees so that the staleness pass finds most `stat`
//! answers already interned. No ordering is guaranteed between directories;
//! the only contract is that once [`MetadataPrefetcher::wait`] returns,
//! every reachable directory has been read into the registry.

use crate::items::{DirectoryItem, ItemRegistry};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
};

/// Subdirectories that make up the known engine layout.
const ENGINE_LAYOUT: [&str; 4] = ["plugins", "runtime", "developer", "editor"];

#[derive(Debug, Default)]
struct PendingTasks {
    count: Mutex<usize>,
    drained: Condvar,
}

impl PendingTasks {
    fn add(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }
}

#[derive(Clone)]
struct WalkContext {
    registry: Arc<ItemRegistry>,
    pending: Arc<PendingTasks>,
    cancelled: Arc<AtomicBool>,
}

/// Background directory walker feeding the [`ItemRegistry`].
pub struct MetadataPrefetcher {
    pool: rayon::ThreadPool,
    ctx: WalkContext,
}

impl MetadataPrefetcher {
    pub fn new(registry: Arc<ItemRegistry>, threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|index| format!("prefetch-{index}"))
            .build()
            .unwrap();
        let ctx = WalkContext {
            registry,
            pending: Arc::new(PendingTasks::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        Self { pool, ctx }
    }

    /// Queues the known engine layout directories under `root`.
    pub fn queue_engine_root(&self, root: &Path) {
        for name in ENGINE_LAYOUT {
            let dir = root.join(name);
            if dir.is_dir() {
                self.queue_directory(&dir);
            }
        }
    }

    /// Queues a generic recursive walk of `path`.
    pub fn queue_directory(&self, path: &Path) {
        let dir = self.ctx.registry.directory(path);
        self.ctx.pending.add();
        let ctx = self.ctx.clone();
        self.pool.spawn(move || walk_task(ctx, dir));
    }

    /// Requests cooperative cancellation; queued tasks check the flag before
    /// doing any work.
    pub fn cancel(&self) {
        self.ctx.cancelled.store(true, Ordering::Relaxed);
    }

    /// Blocks until the task queue drains.
    pub fn wait(&self) {
        let mut count = self.ctx.pending.count.lock().unwrap();
        while *count > 0 {
            count = self.ctx.pending.drained.wait(count).unwrap();
        }
        trace!("prefetch drained; {} files interned", self.ctx.registry.file_count());
    }
}

fn walk_task(ctx: WalkContext, dir: DirectoryItem) {
    if !ctx.cancelled.load(Ordering::Relaxed) {
        // listing the directory primes the child file attributes
        let subdirs = dir.child_directories(&ctx.registry);
        let _ = dir.child_files(&ctx.registry);
        for subdir in subdirs {
            ctx.pending.add();
            let child_ctx = ctx.clone();
            // spawns onto the pool this task runs in
            rayon::spawn(move || walk_task(child_ctx, subdir));
        }
    }
    ctx.pending.done();
}
