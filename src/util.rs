use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use regex::Regex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::error::Result;

/// Walk a directory tree and collect every file whose name matches `name_filter`.
/// Paths are returned sorted so lookups are deterministic.
pub fn find_files(root: &Path, name_filter: &Regex) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !root.is_dir() {
        return Ok(found);
    }

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| {
            std::io::Error::other(format!("failed to read entry in {}: {e}", root.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name_filter.is_match(&name) {
            found.push(entry.into_path());
        }
    }

    found.sort();
    Ok(found)
}

/// Map a PSF blob or base binary into memory. Output files are only ever
/// created next to their final name and renamed into place, so nothing this
/// crate writes shrinks a file while it is mapped.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)?;
    // SAFETY: the mapping is read-only and its file is never truncated in place.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

/// Read a whole file; empty files cannot be memory-mapped on every platform.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let len = std::fs::metadata(path)?.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    Ok(mmap_file(path)?.to_vec())
}

/// SHA-256 of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(hash_bytes(data))
}

/// Write `data` to `dest` through a temporary file in the same directory and
/// move it into place. Returns `false` when `dest` already existed, in which
/// case nothing is written.
pub fn write_new_file(dest: &Path, data: &[u8]) -> Result<bool> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".msu-partial-")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    match tmp.persist_noclobber(dest) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error.into()),
    }
}

/// Create a scratch directory that is removed on drop unless `keep` is set.
pub fn scratch_dir(root: Option<&Path>, keep: bool) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("msu-").keep(keep);
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_of_empty_input() {
        assert_eq!(
            hash_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_write_new_file_does_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("out.bin");
        assert!(write_new_file(&dest, b"first").unwrap());
        assert!(!write_new_file(&dest, b"second").unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"first");
        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_find_files_recurses_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("b").join("x.dll"), b"").unwrap();
        std::fs::write(dir.path().join("a.dll"), b"").unwrap();
        std::fs::write(dir.path().join("c.txt"), b"").unwrap();
        let found = find_files(dir.path(), &Regex::new(r"\.dll$").unwrap()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("a.dll"));
    }

    #[test]
    fn test_scratch_dir_removed_unless_kept() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let scratch = scratch_dir(Some(root.path()), false).unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());

        let kept = {
            let scratch = scratch_dir(Some(root.path()), true).unwrap();
            scratch.path().to_path_buf()
        };
        assert!(kept.exists());
    }
}
