/// Deepest reservation tree walked by check and release.
pub const MAX_TREE_DEPTH: usize = 16;

/// Children attached to a single reservation.
pub const MAX_CHILDREN: usize = 1024;

/// Entries in one counter batch or release batch.
pub const MAX_BATCH_SIZE: usize = 1000;

/// COUNT hint for HSCAN pages.
pub const SCAN_PAGE_SIZE: usize = 100;

/// Pending release tasks buffered between watcher and worker.
pub const DEFAULT_TASK_QUEUE: usize = 4096;

/// Releases running at once in the worker.
pub const DEFAULT_RELEASE_CONCURRENCY: usize = 32;
