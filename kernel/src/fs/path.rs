//! Path parsing and resolution.
//!
//! `pathname_init` turns the external string form (which may embed flags as
//! a colon-suffix, e.g. `/a/b:create:trunc`) into a validated, structured
//! `ParsedPath`. `path_walk` resolves a `ParsedPath` against a namespace and
//! an optional starting point into a `(mount, dentry)` pair. `path_to_name`
//! is the inverse: it renders a resolved `Path` back into its absolute
//! string form.

use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use super::{dentry::Dentry, mount::Mount, namespace::Namespace};
use crate::error::{FsError, KernelError};

pub const MAX_NAME: usize = super::NAME_MAX;
pub const MAX_PATH: usize = super::PATH_MAX;

/// A `lookup` failure surfaces as whatever its filesystem returns; walking
/// only needs to know whether to treat the miss as `ENOENT`.
fn to_fs_error(e: KernelError) -> FsError {
    match e {
        KernelError::FsError(fs_err) => fs_err,
        _ => FsError::NotFound,
    }
}

/// A resolved location: a mount together with a dentry within it. This is
/// the unit every walk operates on and the unit a `File` keeps open.
#[derive(Clone)]
pub struct Path {
    pub mount: Arc<Mount>,
    pub dentry: Arc<Dentry>,
}

impl Path {
    pub fn is_same(&self, other: &Path) -> bool {
        Arc::ptr_eq(&self.mount, &other.mount) && Arc::ptr_eq(&self.dentry, &other.dentry)
    }
}

bitflags::bitflags! {
    /// Closed enumeration of recognized `pathname_t` colon-suffix modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PathFlags: u32 {
        const CREATE      = 1 << 0;
        const TRUNC       = 1 << 1;
        const EXCL        = 1 << 2;
        const APPEND      = 1 << 3;
        const DIRECTORY   = 1 << 4;
        const NOFOLLOW    = 1 << 5;
        /// `WALK_NEGATIVE_IS_OK`: resolving to a NEGATIVE dentry is success,
        /// not `ENOENT` (used by e.g. `open(..., O_CREAT)`).
        const NEGATIVE_OK = 1 << 6;
    }
}

/// The parsed, validated form of an external path string.
pub struct ParsedPath {
    pub absolute: bool,
    pub components: Vec<String>,
    pub flags: PathFlags,
}

fn is_valid_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-' | '~' | '@' | '+')
}

/// Parse an external path string, validating characters and length limits
/// and extracting any colon-suffixed flag modifiers.
pub fn pathname_init(raw: &str) -> Result<ParsedPath, FsError> {
    if raw.is_empty() {
        return Err(FsError::InvalidPath);
    }

    // Only the path portion counts against MAX_PATH; the flag suffix is
    // kernel-internal syntax, not part of the filesystem namespace.
    let mut parts = raw.splitn(2, ':');
    let path_part = parts.next().unwrap();
    let flags_part = parts.next();

    if path_part.len() > MAX_PATH {
        return Err(FsError::NameTooLong);
    }

    if !path_part.chars().all(is_valid_path_char) {
        return Err(FsError::InvalidPath);
    }

    let absolute = path_part.starts_with('/');
    let mut components = Vec::new();
    for comp in path_part.split('/').filter(|s| !s.is_empty()) {
        if comp.len() > MAX_NAME {
            return Err(FsError::NameTooLong);
        }
        components.push(comp.to_string());
    }

    let mut flags = PathFlags::empty();
    if let Some(flags_str) = flags_part {
        for token in flags_str.split(':') {
            flags |= match token {
                "create" => PathFlags::CREATE,
                "trunc" => PathFlags::TRUNC,
                "excl" => PathFlags::EXCL,
                "append" => PathFlags::APPEND,
                "directory" => PathFlags::DIRECTORY,
                "nofollow" => PathFlags::NOFOLLOW,
                "negative_ok" => PathFlags::NEGATIVE_OK,
                _ => return Err(FsError::InvalidPath),
            };
        }
    }

    Ok(ParsedPath {
        absolute,
        components,
        flags,
    })
}

/// Re-check for a mount stacked on `p`'s dentry, descending to the topmost
/// cover's root. A no-op if nothing is mounted there.
fn cross_mounts(ns: &Namespace, mut p: Path) -> Path {
    // Mount stacking is bounded by how many times something was actually
    // mounted, so no artificial depth cap is needed: each iteration strictly
    // descends to a different mount's root.
    while let Some(m) = ns.topmost_cover(&p.dentry) {
        p = Path {
            dentry: m.root.clone(),
            mount: m,
        };
    }
    p
}

/// Bound on mount-parent chain length consulted by `..`, guarding against a
/// construction bug turning the mount forest into a cycle.
const MAX_MOUNT_CLIMB: usize = 4096;

/// Resolve `..` from `p`: if `p.dentry` is its mount's root, climb through
/// mount -> mountpoint links until landing on a dentry that is not itself
/// another mount's root, then step to that dentry's parent. Otherwise just
/// step to the parent dentry.
fn walk_up(p: Path) -> Result<Path, FsError> {
    let mut mount = p.mount;
    let mut dentry = p.dentry;

    let mut climbs = 0;
    while Arc::ptr_eq(&dentry, &mount.root) {
        match (&mount.parent, &mount.mountpoint) {
            (Some(parent_mount), Some(mountpoint)) => {
                climbs += 1;
                if climbs > MAX_MOUNT_CLIMB {
                    return Err(FsError::LoopDetected);
                }
                mount = parent_mount.clone();
                dentry = mountpoint.clone();
            }
            // Namespace root: ".." at "/" stays at "/".
            _ => return Ok(Path { mount, dentry }),
        }
    }

    let parent = dentry.parent.clone().unwrap_or_else(|| dentry.clone());
    Ok(Path {
        mount,
        dentry: parent,
    })
}

/// Walk `parsed` starting from `start` (or the namespace root, if `parsed`
/// is absolute or no start was given).
pub fn path_walk(
    ns: &Namespace,
    start: Option<&Path>,
    parsed: &ParsedPath,
) -> Result<Path, FsError> {
    let mut cur = if parsed.absolute {
        ns.root_path()
    } else {
        start.cloned().ok_or(FsError::InvalidPath)?
    };
    cur = cross_mounts(ns, cur);

    for comp in &parsed.components {
        if comp == "." {
            continue;
        }
        if comp == ".." {
            cur = walk_up(cur)?;
            cur = cross_mounts(ns, cur);
            continue;
        }

        let inode = cur.dentry.inode().ok_or(FsError::NotADirectory)?;

        // "self" resolves to whichever process asks, so (unlike every other
        // name) it must never be cached under its parent: a second caller
        // would otherwise inherit the first caller's cached dentry forever.
        let child = if comp == "self" {
            let child_inode = inode.lookup(comp).map_err(to_fs_error)?;
            Dentry::new_positive(comp.clone(), cur.dentry.clone(), child_inode)
        } else {
            match cur.dentry.child(comp) {
                Some(d) => d,
                None => match inode.lookup(comp) {
                    Ok(child_inode) => {
                        let fresh =
                            Dentry::new_positive(comp.clone(), cur.dentry.clone(), child_inode);
                        cur.dentry.insert_child(comp.clone(), fresh)
                    }
                    Err(_) => {
                        let fresh = Dentry::new_negative(comp.clone(), cur.dentry.clone());
                        cur.dentry.insert_child(comp.clone(), fresh)
                    }
                },
            }
        };

        if child.is_negative() && !parsed.flags.contains(PathFlags::NEGATIVE_OK) {
            return Err(FsError::NotFound);
        }

        cur = Path {
            mount: cur.mount,
            dentry: child,
        };
        cur = cross_mounts(ns, cur);
    }

    Ok(cur)
}

/// Convenience wrapper: parse and walk `raw` in one call.
pub fn resolve(ns: &Namespace, start: Option<&Path>, raw: &str) -> Result<(Path, ParsedPath), FsError> {
    let parsed = pathname_init(raw)?;
    let resolved = path_walk(ns, start, &parsed)?;
    Ok((resolved, parsed))
}

/// Render a resolved path back into its absolute string form, crossing
/// mount boundaries the opposite direction from `walk_up`: whenever the
/// current dentry is a mount's root, substitute the mount's mountpoint in
/// its parent before continuing to climb.
pub fn path_to_name(p: &Path) -> String {
    let mut names: Vec<String> = Vec::new();
    let mut mount = p.mount.clone();
    let mut dentry = p.dentry.clone();

    loop {
        if Arc::ptr_eq(&dentry, &mount.root) {
            match (&mount.parent, &mount.mountpoint) {
                (Some(parent_mount), Some(mountpoint)) => {
                    mount = parent_mount.clone();
                    dentry = mountpoint.clone();
                    continue;
                }
                _ => break,
            }
        }
        names.push(dentry.name.clone());
        match dentry.parent.clone() {
            Some(parent) => dentry = parent,
            None => break,
        }
    }

    names.reverse();
    if names.is_empty() {
        String::from("/")
    } else {
        let mut s = String::from("/");
        s.push_str(&names.join("/"));
        s
    }
}
