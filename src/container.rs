//! Access to cabinet-family containers (MSU, CAB, PSF-carrying cabinets).
//!
//! The pipeline never looks at archive-tool output directly; it only sees
//! the list of files an operation produced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};
use crate::naming::basename;

pub trait ContainerAccess: Send + Sync {
    /// Names of the files inside `container` matching any of `filters`.
    fn list(&self, container: &Path, filters: &[&str]) -> Result<Vec<PathBuf>>;

    /// Extract files matching any of `filters` into `out_dir` and return
    /// their paths on disk. With `flatten`, directory structure is dropped.
    fn extract(
        &self,
        container: &Path,
        out_dir: &Path,
        filters: &[&str],
        flatten: bool,
    ) -> Result<Vec<PathBuf>>;
}

/// ContainerAccess backed by the 7-Zip command line tool.
pub struct SevenZip {
    program: PathBuf,
}

impl SevenZip {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, container: &Path, args: &[String]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let command_line = format!("{} {}", self.program.display(), args.join(" "));
        debug!("> {command_line}");

        let output = cmd.output().map_err(|e| Error::Container {
            container: container.to_path_buf(),
            command: command_line.clone(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Container {
                container: container.to_path_buf(),
                command: command_line,
                reason: format!("exit status {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn listing(&self, container: &Path, filters: &[&str]) -> Result<Vec<ListedEntry>> {
        let mut args = vec![
            "l".to_string(),
            container.display().to_string(),
            "-r".to_string(),
            "-bd".to_string(),
            "-slt".to_string(),
        ];
        args.extend(filters.iter().map(|f| f.to_string()));
        let stdout = self.run(container, &args)?;
        Ok(parse_technical_listing(&stdout))
    }
}

impl ContainerAccess for SevenZip {
    fn list(&self, container: &Path, filters: &[&str]) -> Result<Vec<PathBuf>> {
        Ok(self
            .listing(container, filters)?
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| PathBuf::from(entry.path))
            .collect())
    }

    fn extract(
        &self,
        container: &Path,
        out_dir: &Path,
        filters: &[&str],
        flatten: bool,
    ) -> Result<Vec<PathBuf>> {
        let entries: Vec<ListedEntry> = self
            .listing(container, filters)?
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .collect();
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        std::fs::create_dir_all(out_dir)?;
        let mut args = vec![
            if flatten { "e" } else { "x" }.to_string(),
            container.display().to_string(),
            "-r".to_string(),
            "-bd".to_string(),
            "-mmt".to_string(),
            "-aoa".to_string(),
            format!("-o{}", out_dir.display()),
        ];
        args.extend(filters.iter().map(|f| f.to_string()));
        self.run(container, &args)?;

        Ok(entries
            .iter()
            .map(|entry| output_path(out_dir, &entry.path, flatten))
            .collect())
    }
}

fn output_path(out_dir: &Path, entry: &str, flatten: bool) -> PathBuf {
    if flatten {
        out_dir.join(basename(entry))
    } else {
        entry
            .split(['\\', '/'])
            .filter(|segment| !segment.is_empty())
            .fold(out_dir.to_path_buf(), |path, segment| path.join(segment))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedEntry {
    path: String,
    is_dir: bool,
}

/// Parse the `-slt` listing: after the `----------` separator, every entry
/// is a block of `Key = Value` lines terminated by a blank line.
fn parse_technical_listing(stdout: &str) -> Vec<ListedEntry> {
    let mut entries = Vec::new();
    let mut current: Option<ListedEntry> = None;

    let body = stdout
        .lines()
        .skip_while(|line| line.trim() != "----------")
        .skip(1);
    for line in body {
        let line = line.trim();
        if line.is_empty() {
            entries.extend(current.take());
            continue;
        }
        let Some((key, value)) = line.split_once(" = ").or_else(|| {
            line.strip_suffix(" =").map(|key| (key, ""))
        }) else {
            continue;
        };
        match key {
            "Path" => {
                entries.extend(current.take());
                current = Some(ListedEntry {
                    path: value.to_string(),
                    is_dir: false,
                });
            }
            "Folder" => {
                if let Some(entry) = current.as_mut() {
                    entry.is_dir |= value == "+";
                }
            }
            "Attributes" => {
                if let Some(entry) = current.as_mut() {
                    entry.is_dir |= value.starts_with('D');
                }
            }
            _ => {}
        }
    }
    entries.extend(current);
    entries
}

/// In-memory containers keyed by file name. Extraction writes real files so
/// nested containers can be opened by name afterwards. Every call is
/// recorded as `(container name, filters)`.
#[derive(Default)]
pub struct MemoryContainers {
    archives: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl MemoryContainers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container. Entry names may contain `\` or `/` separators.
    pub fn insert(&self, name: &str, entries: Vec<(String, Vec<u8>)>) {
        if let Ok(mut archives) = self.archives.lock() {
            archives.insert(name.to_ascii_lowercase(), entries);
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn matching(&self, container: &Path, filters: &[&str]) -> Result<Vec<(String, Vec<u8>)>> {
        let name = container
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((name.clone(), filters.iter().map(|f| f.to_string()).collect()));
        }

        let archives = self.archives.lock().map_err(|_| Error::Container {
            container: container.to_path_buf(),
            command: "memory".into(),
            reason: "container table poisoned".into(),
        })?;
        let entries = archives
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::Container {
                container: container.to_path_buf(),
                command: "memory".into(),
                reason: "not a known container".into(),
            })?;

        Ok(entries
            .iter()
            .filter(|(entry, _)| {
                let file = basename(entry).to_ascii_lowercase();
                filters.is_empty()
                    || filters
                        .iter()
                        .any(|f| glob_match::glob_match(&f.to_ascii_lowercase(), &file))
            })
            .cloned()
            .collect())
    }
}

impl ContainerAccess for MemoryContainers {
    fn list(&self, container: &Path, filters: &[&str]) -> Result<Vec<PathBuf>> {
        Ok(self
            .matching(container, filters)?
            .into_iter()
            .map(|(entry, _)| PathBuf::from(entry))
            .collect())
    }

    fn extract(
        &self,
        container: &Path,
        out_dir: &Path,
        filters: &[&str],
        flatten: bool,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (entry, data) in self.matching(container, filters)? {
            let dest = output_path(out_dir, &entry, flatten);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, data)?;
            written.push(dest);
        }
        Ok(written)
    }
}
