//! Carving per-file deltas out of an Express PSF blob.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::manifest::ExpressManifestEntry;
use crate::records::DeltaRecord;
use crate::util;

/// Where the delta of `entry` is written below `out_dir`:
/// `{out_dir}/{logical path} {diff type}.patch`.
pub fn record_path(out_dir: &Path, entry: &ExpressManifestEntry) -> PathBuf {
    let mut path = out_dir.to_path_buf();
    let segments: Vec<&str> = entry
        .file_name
        .split(['\\', '/'])
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect();
    if let Some((file, dirs)) = segments.split_last() {
        for dir in dirs {
            path.push(dir);
        }
        path.push(format!("{file} {}.patch", entry.diff_type));
    }
    path
}

/// Write the bytes of every entry whose file name matches `name_filter` to
/// its own patch file. Declared hashes are not checked here; the rebuilt
/// binary is what gets verified. Manifest order is preserved.
pub fn extract_matching(
    blob: &Path,
    entries: &[ExpressManifestEntry],
    name_filter: &Regex,
    out_dir: &Path,
) -> Result<Vec<DeltaRecord>> {
    let selected: Vec<&ExpressManifestEntry> = entries
        .iter()
        .filter(|entry| name_filter.is_match(&entry.real_file_name))
        .collect();
    if selected.is_empty() {
        info!("No PSF entries match \"{}\"", name_filter.as_str());
        return Ok(Vec::new());
    }

    let data = util::mmap_file(blob)?;
    let blob_size = data.len() as u64;

    let mut records = Vec::with_capacity(selected.len());
    for entry in selected {
        let end = entry
            .end()
            .filter(|end| *end <= blob_size)
            .ok_or(Error::BlobBounds {
                offset: entry.offset,
                length: entry.length,
                blob_size,
            })?;
        // end <= blob_size, which is a usize
        let bytes = &data[entry.offset as usize..end as usize];

        let path = record_path(out_dir, entry);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        debug!(
            "Carved {} bytes at {} -> {}",
            entry.length,
            entry.offset,
            path.display()
        );

        records.push(DeltaRecord {
            entry: entry.clone(),
            path,
        });
    }

    info!(
        "Extracted {} delta(s) from {}",
        records.len(),
        blob.display()
    );
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DeclaredHash;
    use crate::records::PatchDirection;

    fn entry(name: &str, offset: u64, length: u64) -> ExpressManifestEntry {
        ExpressManifestEntry {
            file_name: name.to_string(),
            real_file_name: crate::naming::basename(name).to_string(),
            direction: PatchDirection::Forward,
            diff_type: "PA30".into(),
            offset,
            length,
            hash: DeclaredHash {
                alg: "SHA256".into(),
                value: String::new(),
            },
            target_hash: None,
        }
    }

    fn blob(dir: &Path) -> PathBuf {
        let path = dir.join("blob.psf");
        std::fs::write(&path, (0..200u32).map(|b| b as u8).collect::<Vec<_>>()).unwrap();
        path
    }

    #[test]
    fn test_extracts_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let blob = blob(dir.path());
        let out = dir.path().join("out");
        let entries = vec![entry(r"amd64_os-kernel_1\f\ntoskrnl.exe", 100, 50)];

        let records =
            extract_matching(&blob, &entries, &Regex::new("(?i)ntos").unwrap(), &out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].path,
            out.join("amd64_os-kernel_1").join("f").join("ntoskrnl.exe PA30.patch")
        );
        let bytes = std::fs::read(&records[0].path).unwrap();
        assert_eq!(bytes, (100..150u32).map(|b| b as u8).collect::<Vec<_>>());
        assert_eq!(records[0].direction(), PatchDirection::Forward);
    }

    #[test]
    fn test_range_past_end_is_bounds_error() {
        let dir = tempfile::tempdir().unwrap();
        let blob = blob(dir.path());
        let entries = vec![entry(r"a\f\ntdll.dll", 180, 50)];
        let err = extract_matching(&blob, &entries, &Regex::new("ntdll").unwrap(), dir.path())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BlobBounds {
                offset: 180,
                length: 50,
                blob_size: 200
            }
        ));
    }

    #[test]
    fn test_overflowing_range_is_bounds_error() {
        let dir = tempfile::tempdir().unwrap();
        let blob = blob(dir.path());
        let entries = vec![entry(r"a\f\ntdll.dll", u64::MAX, 2)];
        assert!(matches!(
            extract_matching(&blob, &entries, &Regex::new("ntdll").unwrap(), dir.path()),
            Err(Error::BlobBounds { .. })
        ));
    }

    #[test]
    fn test_no_match_is_empty_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let blob = blob(dir.path());
        let entries = vec![
            entry(r"a\r\ntdll.dll", 10, 5),
            entry(r"a\f\kernel32.dll", 0, 5),
            entry(r"a\f\ntdll.dll", 20, 5),
        ];
        let none = extract_matching(&blob, &entries, &Regex::new("^win32k").unwrap(), dir.path())
            .unwrap();
        assert!(none.is_empty());

        let some =
            extract_matching(&blob, &entries, &Regex::new("ntdll").unwrap(), dir.path()).unwrap();
        let offsets: Vec<u64> = some.iter().map(|r| r.entry.offset).collect();
        assert_eq!(offsets, vec![10, 20]);
    }
}
