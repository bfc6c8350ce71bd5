//! Recursive copy and ownership propagation.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

use nix::unistd::{chown, Gid, Uid};
use tracing::debug;

/// Applies `owner` (uid, gid) to `path` when set.
pub fn apply_ownership(path: &Path, owner: Option<(u32, u32)>) -> io::Result<()> {
    let Some((uid, gid)) = owner else {
        return Ok(());
    };
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
    Ok(())
}

/// Copies `src` to `dst`, dispatching on the source type.
///
/// Returns the number of bytes copied.
pub fn copy_entry(src: &Path, dst: &Path, owner: Option<(u32, u32)>) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(src)?;
    if metadata.is_dir() {
        copy_dir(src, dst, owner)
    } else if metadata.file_type().is_symlink() {
        copy_link(src, dst)?;
        Ok(0)
    } else {
        copy_file(src, dst, owner)
    }
}

/// Copies a single file, replacing `dst` if it exists.
pub fn copy_file(src: &Path, dst: &Path, owner: Option<(u32, u32)>) -> io::Result<u64> {
    let copied = fs::copy(src, dst)?;
    apply_ownership(dst, owner)?;
    Ok(copied)
}

/// Copies a directory tree. Existing directories at the destination are merged.
///
/// Links inside the tree are recreated, not followed.
pub fn copy_dir(src: &Path, dst: &Path, owner: Option<(u32, u32)>) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    apply_ownership(dst, owner)?;

    let mut total = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        total += copy_entry(&entry.path(), &target, owner)?;
    }

    debug!("Copied {} bytes from {:?} to {:?}", total, src, dst);
    Ok(total)
}

fn copy_link(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)?;
    }
    symlink(target, dst)
}
