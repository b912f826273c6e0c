//! The virtual filesystem layer: node arena, mount table, path
//! resolution, the open-file-description pool, and the path-level
//! operations the syscall layer is built on.

pub mod mount;
pub mod node;
pub mod ofd;
pub mod resolve;

use ferrox_abi::fs::{OpenFlags, S_IFREG, mode_is_directory, mode_is_regular};
use ferrox_abi::{Errno, KResult, PATH_MAX};
use ferrox_lib::path::PathContext;

pub use node::{NodeId, NodeKind};
pub use ofd::OfdId;

use node::{node_mode, node_open, release_node};

/// Resolve and open a path, returning a fresh open-file-description.
pub fn open_path(path: &[u8], cwd: &[u8], flags: OpenFlags, mode: u16) -> KResult<OfdId> {
    let create_mode = if flags.contains(OpenFlags::CREAT) {
        Some(S_IFREG | (mode & 0o7777))
    } else {
        None
    };
    let fail_if_exists = flags.contains(OpenFlags::CREAT | OpenFlags::EXCL);

    let resolved = resolve::resolve_path(path, cwd, true, create_mode, fail_if_exists)?;
    let vnode = resolved.node;

    let release_and = |e: Errno| {
        release_node(vnode);
        Err(e)
    };

    let mode_bits = match node_mode(vnode) {
        Ok(bits) => bits,
        Err(e) => return release_and(e),
    };
    if flags.contains(OpenFlags::DIRECTORY) && !mode_is_directory(mode_bits) {
        return release_and(Errno::ENOTDIR);
    }
    if mode_is_directory(mode_bits) && flags.writable() {
        return release_and(Errno::EISDIR);
    }

    if let Err(e) = node_open(vnode, flags.contains(OpenFlags::NOCTTY)) {
        return release_and(e);
    }
    if flags.contains(OpenFlags::TRUNC) && flags.writable() && mode_is_regular(mode_bits) {
        if let Err(e) = node::node_change_size(vnode, 0) {
            return release_and(e);
        }
    }

    // The resolution's reservation transfers to the description.
    match ofd::acquire(vnode, flags) {
        Ok(ofd) => Ok(ofd),
        Err(e) => release_and(e),
    }
}

pub fn make_directory(path: &[u8], cwd: &[u8], mode: u16) -> KResult<()> {
    let (parent, name, name_len) = resolve::resolve_parent(path, cwd)?;
    let result = node::node_create_directory(parent, &name[..name_len], mode & 0o7777);
    release_node(parent);
    result
}

pub fn unlink(path: &[u8], cwd: &[u8]) -> KResult<()> {
    let (parent, name, name_len) = resolve::resolve_parent(path, cwd)?;
    let result = node::node_release_name(parent, &name[..name_len]);
    release_node(parent);
    result
}

pub fn remove_directory(path: &[u8], cwd: &[u8]) -> KResult<()> {
    let (parent, name, name_len) = resolve::resolve_parent(path, cwd)?;
    let result = node::node_release_directory(parent, &name[..name_len]);
    release_node(parent);
    result
}

/// Hard link: `new_path` becomes another name for `existing`.
pub fn link(existing: &[u8], new_path: &[u8], cwd: &[u8]) -> KResult<()> {
    let resolved = resolve::resolve_path(existing, cwd, true, None, false)?;
    let target = resolved.node;
    let result = (|| {
        let (parent, name, name_len) = resolve::resolve_parent(new_path, cwd)?;
        let created = node::node_create_name(parent, &name[..name_len], target);
        release_node(parent);
        created
    })();
    release_node(target);
    result
}

pub fn symlink(target: &[u8], path: &[u8], cwd: &[u8]) -> KResult<()> {
    if target.is_empty() || target.len() > PATH_MAX {
        return Err(Errno::EINVAL);
    }
    let (parent, name, name_len) = resolve::resolve_parent(path, cwd)?;
    let result = node::node_create_symbolic_link(parent, &name[..name_len], target);
    release_node(parent);
    result
}

pub fn rename(old_path: &[u8], new_path: &[u8], cwd: &[u8]) -> KResult<()> {
    let (old_parent, old_name, old_len) = resolve::resolve_parent(old_path, cwd)?;
    let result = (|| {
        let (new_parent, new_name, new_len) = resolve::resolve_parent(new_path, cwd)?;
        let renamed = node::node_rename(
            old_parent,
            &old_name[..old_len],
            new_parent,
            &new_name[..new_len],
        );
        release_node(new_parent);
        renamed
    })();
    release_node(old_parent);
    result
}

/// Normalize `path` against `cwd` and confirm it names a directory;
/// used by chdir, which stores the canonical form.
pub fn canonicalize_directory(
    path: &[u8],
    cwd: &[u8],
    out: &mut [u8; PATH_MAX],
) -> KResult<usize> {
    let mut ctx = PathContext::new();
    ctx.parse_path(path, false, true, cwd)?;

    let resolved = resolve::resolve_path(ctx.path(), b"/", true, None, false)?;
    let mode = node_mode(resolved.node);
    release_node(resolved.node);
    if !mode_is_directory(mode?) {
        return Err(Errno::ENOTDIR);
    }

    let canon = ctx.path();
    out[..canon.len()].copy_from_slice(canon);
    Ok(canon.len())
}
