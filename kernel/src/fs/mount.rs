//! Mount graph: the binding of a filesystem's root dentry onto a mountpoint
//! dentry of another (already-mounted) filesystem.
//!
//! All mounts form a forest whose root is the initial root mount (the one
//! created when a namespace is built with no parent/mountpoint of its own).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{dentry::Dentry, superblock::Superblock};

static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const READ_ONLY  = 1 << 0;
        const NO_EXEC    = 1 << 1;
        const NO_SUID    = 1 << 2;
        /// Propagate mount/unmount events to this mount's children (unused
        /// at this scope; recorded to match the spec's field list).
        const SHARED     = 1 << 3;
    }
}

/// A mounted filesystem instance: its superblock, the dentry it was mounted
/// on (`None` for a namespace's root mount), and the mount above it.
pub struct Mount {
    pub id: u64,
    pub parent: Option<Arc<Mount>>,
    pub mountpoint: Option<Arc<Dentry>>,
    pub root: Arc<Dentry>,
    pub superblock: Arc<Superblock>,
    pub flags: MountFlags,
}

impl Mount {
    pub fn new_root(superblock: Arc<Superblock>, flags: MountFlags) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            parent: None,
            mountpoint: None,
            root: superblock.root.clone(),
            superblock,
            flags,
        })
    }

    pub fn new_child(
        parent: Arc<Mount>,
        mountpoint: Arc<Dentry>,
        superblock: Arc<Superblock>,
        flags: MountFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            parent: Some(parent),
            mountpoint: Some(mountpoint),
            root: superblock.root.clone(),
            superblock,
            flags,
        })
    }

    pub fn is_root_mount(&self) -> bool {
        self.parent.is_none()
    }
}
