//! Small filesystem helpers shared by the disk-backed tools and locations.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use nix::unistd::Gid;
use rand::Rng;

use crate::error::StorageError;

const COMPARE_BLOCK_SIZE: usize = 8 * 1024;

/// Mode and group of a storage root; everything created below the root
/// inherits them.
#[derive(Clone, Copy, Debug)]
pub struct RootParams {
    pub permissions: u32,
    pub group: Option<u32>,
}

pub fn root_params(root: &Path) -> Result<RootParams, StorageError> {
    let meta = fs::metadata(root)?;
    Ok(RootParams {
        permissions: meta.permissions().mode() & 0o777,
        group: Some(meta.gid()),
    })
}

fn set_path_attrs(path: &Path, permissions: u32, group: Option<u32>) -> Result<(), StorageError> {
    fs::set_permissions(path, fs::Permissions::from_mode(permissions))?;
    if let Some(gid) = group {
        nix::unistd::chown(path, None, Some(Gid::from_raw(gid)))
            .map_err(|err| StorageError::Write(format!("chown {:?} failed: {}", path, err)))?;
    }
    Ok(())
}

/// Applies the root's mode and group to a path; `read_only` additionally
/// masks out all write bits.
pub fn adjust_permissions(
    path: &Path,
    params: RootParams,
    read_only: bool,
) -> Result<(), StorageError> {
    let mut permissions = params.permissions;
    if read_only {
        permissions &= 0o444;
    }
    set_path_attrs(path, permissions, params.group)
}

/// Creates the missing components of `path`, applying the root attributes
/// to each newly created directory.
pub fn create_folders(path: &Path, params: RootParams) -> Result<(), StorageError> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        create_folders(parent, params)?;
    }
    match fs::create_dir(path) {
        Ok(()) => set_path_attrs(path, params.permissions, params.group),
        // lost the race to a concurrent writer
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

pub fn get_size(path: &Path) -> Result<u64, StorageError> {
    Ok(fs::metadata(path)?.len())
}

/// Free bytes on the filesystem holding `path`.
pub fn free_disk_space(path: &Path) -> Result<u64, StorageError> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|err| StorageError::Write(format!("statvfs {:?} failed: {}", path, err)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// A read-only file may still be unlinked from a writable directory, but
/// `remove_file` on some filesystems refuses first; drop the protection bit
/// and retry once.
pub fn remove_file(path: &Path) -> Result<(), StorageError> {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o644));
            fs::remove_file(path)?;
        } else {
            return Err(err.into());
        }
    }
    Ok(())
}

pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range('a'..='z')).collect()
}

/// Byte-for-byte comparison of two readers.
pub fn match_readers<A: Read, B: Read>(mut first: A, mut second: B) -> Result<bool, StorageError> {
    let mut buf1 = vec![0u8; COMPARE_BLOCK_SIZE];
    let mut buf2 = vec![0u8; COMPARE_BLOCK_SIZE];
    loop {
        let count = read_full(&mut first, &mut buf1)?;
        let other = read_full(&mut second, &mut buf2)?;
        if count != other || buf1[..count] != buf2[..other] {
            return Ok(false);
        }
        if count == 0 {
            return Ok(true);
        }
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, StorageError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}
