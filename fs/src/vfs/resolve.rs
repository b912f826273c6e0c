//! Path resolution: mount selection, per-segment walking, symbolic-link
//! merging, and the reservation discipline.
//!
//! Every node handed back by a successful step carries one fresh
//! reservation; each step releases the previous node exactly once, and
//! every error path releases whatever it still holds.

use ferrox_abi::fs::mode_is_symlink;
use ferrox_abi::{Errno, FILE_NAME_MAX, KResult, PATH_MAX};
use ferrox_lib::path::PathContext;

use super::mount;
use super::node::{NodeId, node_mode, node_read_symlink, node_walk, release_node, reserve_node};

/// Nested symbolic-link expansions allowed in one resolution.
pub const SYMLINK_MAX_DEPTH: u32 = 5;

pub struct Resolved {
    pub node: NodeId,
    pub created: bool,
}

/// Resolve an absolute, normalized path.
///
/// `create_mode` asks the final walk step to create a missing entry
/// with the given mode bits; `fail_if_exists` turns a non-created final
/// node into `EEXIST` (the O_CREAT|O_EXCL rule).
pub fn resolve_path(
    path: &[u8],
    cwd: &[u8],
    follow_last_symlink: bool,
    create_mode: Option<u16>,
    fail_if_exists: bool,
) -> KResult<Resolved> {
    let mut ctx = PathContext::new();
    ctx.parse_path(path, false, true, cwd)?;
    resolve_context(&mut ctx, follow_last_symlink, create_mode, fail_if_exists)
}

fn resolve_context(
    ctx: &mut PathContext,
    follow_last_symlink: bool,
    create_mode: Option<u16>,
    fail_if_exists: bool,
) -> KResult<Resolved> {
    let mut depth = 0u32;

    'restart: loop {
        let (mount_root, strip) = mount::resolve_mount(ctx.path())?;

        // Re-tokenize the part below the mount point.
        let mut rel = PathContext::new();
        let remainder = &ctx.path()[strip..];
        let remainder: &[u8] = if remainder.is_empty() { b"/" } else { remainder };
        rel.parse_path(remainder, true, true, b"/")?;

        reserve_node(mount_root);
        let mut current = mount_root;
        let mut created = false;

        let segment_count = rel.segment_count();
        for i in 0..segment_count {
            let is_last = i == segment_count - 1;
            let create_here = if is_last { create_mode } else { None };

            let (next, created_here) = match node_walk(current, rel.segment_bytes(i), create_here)
            {
                Ok(step) => step,
                Err(e) => {
                    release_node(current);
                    return Err(e);
                }
            };
            release_node(current);

            let mode = match node_mode(next) {
                Ok(mode) => mode,
                Err(e) => {
                    release_node(next);
                    return Err(e);
                }
            };
            if mode_is_symlink(mode) && (!is_last || follow_last_symlink) {
                depth += 1;
                if depth > SYMLINK_MAX_DEPTH {
                    release_node(next);
                    return Err(Errno::ELOOP);
                }
                match merge_symlink(ctx, &rel, strip, i, next) {
                    Ok(()) => {
                        release_node(next);
                        continue 'restart;
                    }
                    Err(e) => {
                        release_node(next);
                        return Err(e);
                    }
                }
            }

            current = next;
            created = created_here;
        }

        if fail_if_exists && !created {
            release_node(current);
            return Err(Errno::EEXIST);
        }
        return Ok(Resolved {
            node: current,
            created,
        });
    }
}

/// Rebuild `ctx` as (already-processed prefix) + (link target) +
/// (unprocessed suffix); an absolute target replaces the prefix.
fn merge_symlink(
    ctx: &mut PathContext,
    rel: &PathContext,
    strip: usize,
    link_index: usize,
    link_node: NodeId,
) -> KResult<()> {
    let mut target = [0u8; PATH_MAX];
    let target_len = node_read_symlink(link_node, &mut target)?;
    let target = &target[..target_len];
    if target.is_empty() {
        return Err(Errno::ENOENT);
    }

    let mut merged = [0u8; PATH_MAX];
    let mut len = 0usize;

    let mut push = |bytes: &[u8], len: &mut usize| -> KResult<()> {
        if *len + bytes.len() > PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        merged[*len..*len + bytes.len()].copy_from_slice(bytes);
        *len += bytes.len();
        Ok(())
    };

    if target[0] == b'/' {
        push(target, &mut len)?;
    } else {
        // Mount prefix plus the segments already walked.
        push(&ctx.path()[..strip], &mut len)?;
        for j in 0..link_index {
            push(b"/", &mut len)?;
            push(rel.segment_bytes(j), &mut len)?;
        }
        push(b"/", &mut len)?;
        push(target, &mut len)?;
    }
    for j in link_index + 1..rel.segment_count() {
        push(b"/", &mut len)?;
        push(rel.segment_bytes(j), &mut len)?;
    }

    let merged_path = &merged[..len];
    ctx.parse_path(merged_path, false, true, b"/")
}

/// Resolve the parent directory of `path` and hand back the final name
/// component. The parent comes back reserved.
pub fn resolve_parent(
    path: &[u8],
    cwd: &[u8],
) -> KResult<(NodeId, [u8; FILE_NAME_MAX], usize)> {
    let mut ctx = PathContext::new();
    ctx.parse_path(path, false, false, cwd)?;
    let name = ctx.last_segment().ok_or(Errno::ENOENT)?;
    let mut name_buf = [0u8; FILE_NAME_MAX];
    name_buf[..name.len()].copy_from_slice(name);
    let name_len = name.len();

    let mut parent_ctx = PathContext::new();
    parent_ctx.parse_path(ctx.path(), true, true, b"/")?;
    let resolved = resolve_context(&mut parent_ctx, true, None, false)?;
    Ok((resolved.node, name_buf, name_len))
}
