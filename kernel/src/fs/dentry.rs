//! Dentry cache: name-keyed nodes forming the tree rooted at each
//! superblock's root, shared across every `Path` that walks through them.
//!
//! A dentry caches the outcome of one `VfsNode::lookup` call under one name
//! within one parent. A miss that resolved to nothing is cached too, as a
//! `NEGATIVE` dentry, so repeated failed lookups (e.g. shell `$PATH` probing)
//! don't re-enter the filesystem.

use alloc::{collections::BTreeMap, string::String, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(not(target_arch = "aarch64"))]
use spin::RwLock;

#[cfg(target_arch = "aarch64")]
use super::bare_lock::RwLock;
use super::VfsNode;

/// A node in the per-superblock name cache.
///
/// Children are listed in `children`, guarded by this dentry's own lock
/// (the spec's "siblings protected by a rwlock on the parent"). The `parent`
/// link is a strong reference: a dentry keeps its parent alive so `..` never
/// has to re-resolve a vanished ancestor.
pub struct Dentry {
    pub name: String,
    pub parent: Option<Arc<Dentry>>,
    inode: RwLock<Option<Arc<dyn VfsNode>>>,
    negative: AtomicBool,
    /// Count of mounts stacked on top of this dentry. Zero means this
    /// dentry is not a mountpoint.
    pub mount_count: AtomicUsize,
    children: RwLock<BTreeMap<String, Arc<Dentry>>>,
}

impl Dentry {
    pub fn new_root(inode: Arc<dyn VfsNode>) -> Arc<Self> {
        Arc::new(Self {
            name: String::new(),
            parent: None,
            inode: RwLock::new(Some(inode)),
            negative: AtomicBool::new(false),
            mount_count: AtomicUsize::new(0),
            children: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn new_positive(name: String, parent: Arc<Dentry>, inode: Arc<dyn VfsNode>) -> Arc<Self> {
        Arc::new(Self {
            name,
            parent: Some(parent),
            inode: RwLock::new(Some(inode)),
            negative: AtomicBool::new(false),
            mount_count: AtomicUsize::new(0),
            children: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn new_negative(name: String, parent: Arc<Dentry>) -> Arc<Self> {
        Arc::new(Self {
            name,
            parent: Some(parent),
            inode: RwLock::new(None),
            negative: AtomicBool::new(true),
            mount_count: AtomicUsize::new(0),
            children: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn is_negative(&self) -> bool {
        self.negative.load(Ordering::Acquire)
    }

    pub fn inode(&self) -> Option<Arc<dyn VfsNode>> {
        self.inode.read().clone()
    }

    /// Promote a negative dentry to positive after a successful create.
    pub fn set_inode(&self, inode: Arc<dyn VfsNode>) {
        *self.inode.write() = Some(inode);
        self.negative.store(false, Ordering::Release);
    }

    pub fn is_mountpoint(&self) -> bool {
        self.mount_count.load(Ordering::Acquire) > 0
    }

    pub(super) fn child(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children.read().get(name).cloned()
    }

    pub(super) fn insert_child(self: &Arc<Self>, name: String, child: Arc<Dentry>) -> Arc<Dentry> {
        let mut children = self.children.write();
        // Another walker may have raced us to the same miss; keep whichever
        // landed first so identity stays stable for ptr_eq comparisons.
        children.entry(name).or_insert(child).clone()
    }

    /// Drop a cached child, forcing the next lookup of that name to go back
    /// to the filesystem. Used after `unlink`/`remove` so a stale negative
    /// or positive entry doesn't linger.
    pub(super) fn forget_child(&self, name: &str) {
        self.children.write().remove(name);
    }

    /// Stable identity for this dentry, used as a key into a namespace's
    /// mount-cover table.
    pub fn identity(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }
}
