//! Per-process visible mount forest.
//!
//! Every process sees some `Namespace`: a root mount plus the set of mounts
//! stacked onto dentries within it. Namespaces are cheap to branch
//! (`unshare`) because mounts themselves are reference-counted and shared;
//! only the *visibility* bookkeeping (which mounts cover which dentries) is
//! duplicated.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

#[cfg(not(target_arch = "aarch64"))]
use spin::RwLock;

#[cfg(target_arch = "aarch64")]
use super::bare_lock::RwLock;
use super::{
    dentry::Dentry,
    mount::{Mount, MountFlags},
    path::Path,
    superblock::Superblock,
    Filesystem,
};
use crate::error::FsError;

/// The visible mount forest for one or more processes (shared by reference
/// until `unshare` is called).
pub struct Namespace {
    root: RwLock<Arc<Mount>>,
    /// Dentry identity -> stack of mounts covering it, topmost last. A
    /// non-empty stack is what makes a dentry's `mount_count` nonzero.
    covers: RwLock<BTreeMap<usize, Vec<Arc<Mount>>>>,
    /// Flat list of every mount visible in this namespace, for enumeration
    /// and unmount-by-mountpoint lookups.
    mounts: RwLock<Vec<Arc<Mount>>>,
}

impl Namespace {
    pub fn new(root_fs: Arc<dyn Filesystem>) -> Arc<Self> {
        let superblock = Superblock::new(root_fs);
        let root_mount = Mount::new_root(superblock, MountFlags::empty());
        Arc::new(Self {
            root: RwLock::new(root_mount.clone()),
            covers: RwLock::new(BTreeMap::new()),
            mounts: RwLock::new(alloc::vec![root_mount]),
        })
    }

    pub fn root_mount(&self) -> Arc<Mount> {
        self.root.read().clone()
    }

    pub fn root_path(&self) -> Path {
        let mount = self.root_mount();
        let dentry = mount.root.clone();
        Path { mount, dentry }
    }

    /// Mount `fs` on top of `at`. `at` must name an existing directory
    /// dentry; it becomes covered (its `mount_count` increments) and future
    /// walks through it land on the new mount's root instead.
    pub fn mount(&self, at: &Path, fs: Arc<dyn Filesystem>, flags: MountFlags) -> Result<(), FsError> {
        let superblock = Superblock::new(fs);
        let new_mount = Mount::new_child(at.mount.clone(), at.dentry.clone(), superblock, flags);

        at.dentry.mount_count.fetch_add(1, core::sync::atomic::Ordering::AcqRel);
        self.covers
            .write()
            .entry(at.dentry.identity())
            .or_default()
            .push(new_mount.clone());
        self.mounts.write().push(new_mount);
        Ok(())
    }

    /// Unmount the topmost mount covering `at`'s dentry.
    pub fn unmount(&self, at: &Path) -> Result<(), FsError> {
        let key = at.dentry.identity();
        let mut covers = self.covers.write();
        let stack = covers.get_mut(&key).ok_or(FsError::NotMounted)?;
        let removed = stack.pop().ok_or(FsError::NotMounted)?;
        if stack.is_empty() {
            covers.remove(&key);
        }
        at.dentry
            .mount_count
            .fetch_sub(1, core::sync::atomic::Ordering::AcqRel);
        self.mounts.write().retain(|m| !Arc::ptr_eq(m, &removed));
        Ok(())
    }

    /// The topmost mount stacked directly on `dentry`, if any.
    pub fn topmost_cover(&self, dentry: &Arc<Dentry>) -> Option<Arc<Mount>> {
        if !dentry.is_mountpoint() {
            return None;
        }
        self.covers
            .read()
            .get(&dentry.identity())
            .and_then(|stack| stack.last().cloned())
    }

    /// Branch a private copy of this namespace's mount visibility. Mounts
    /// are shared (`Arc`); only which-mounts-cover-which-dentry bookkeeping
    /// is duplicated, so subsequent mount/unmount in either namespace is
    /// invisible to the other.
    pub fn unshare(&self) -> Arc<Namespace> {
        Arc::new(Self {
            root: RwLock::new(self.root_mount()),
            covers: RwLock::new(self.covers.read().clone()),
            mounts: RwLock::new(self.mounts.read().clone()),
        })
    }

    /// Whether `other` shares at least the root mount with `self` — the
    /// minimal cross-namespace accessibility check: a dentry reachable only
    /// through a mount private to one namespace is not accessible from the
    /// other.
    pub fn accessible_from(&self, other: &Namespace) -> bool {
        Arc::ptr_eq(&self.root_mount(), &other.root_mount())
    }

    pub fn mounts(&self) -> Vec<Arc<Mount>> {
        self.mounts.read().clone()
    }
}
