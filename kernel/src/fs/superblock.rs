//! One `Superblock` per mounted filesystem instance.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{dentry::Dentry, Filesystem};

static NEXT_DEV_ID: AtomicU64 = AtomicU64::new(1);

/// Per-mount filesystem state: the root dentry of the mounted tree, a
/// device id distinguishing this instance from others of the same
/// filesystem type, and the `Filesystem` implementation that backs it.
pub struct Superblock {
    pub root: Arc<Dentry>,
    pub dev_id: u64,
    pub fs: Arc<dyn Filesystem>,
}

impl Superblock {
    pub fn new(fs: Arc<dyn Filesystem>) -> Arc<Self> {
        let root_inode = fs.root();
        Arc::new(Self {
            root: Dentry::new_root(root_inode),
            dev_id: NEXT_DEV_ID.fetch_add(1, Ordering::Relaxed),
            fs,
        })
    }

    pub fn name(&self) -> &str {
        self.fs.name()
    }

    pub fn is_readonly(&self) -> bool {
        self.fs.is_readonly()
    }

    pub fn sync(&self) -> Result<(), crate::error::KernelError> {
        self.fs.sync()
    }
}
