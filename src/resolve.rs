//! Locating the pre-patch binary a delta applies to.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::Config;
use crate::delta::{self, DeltaEngine};
use crate::error::Result;
use crate::naming::{Architecture, VersionedFileName};
use crate::records::{PatchDirection, ReconstructionRequest};
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// An existing file under one of the search directories.
    Found(PathBuf),
    /// Built just now by applying a reverse delta to the target-version file.
    Synthesized { path: PathBuf, sha256: String },
    NotFound,
}

pub struct BaseFileResolver<'a> {
    config: &'a Config,
    engine: &'a dyn DeltaEngine,
}

impl<'a> BaseFileResolver<'a> {
    pub fn new(config: &'a Config, engine: &'a dyn DeltaEngine) -> Self {
        Self { config, engine }
    }

    /// Base-files directory first, then the output directory.
    fn search_dirs(&self) -> Vec<&'a Path> {
        let mut dirs: Vec<&Path> = Vec::new();
        if let Some(base) = &self.config.base_files_dir {
            dirs.push(base);
        }
        if !dirs.contains(&self.config.output_dir.as_path()) {
            dirs.push(&self.config.output_dir);
        }
        dirs
    }

    /// Find a file stored under `name`, with or without a KB or date suffix.
    /// A WOW64 lookup settles for an `x86` name only when no `wow64` one exists.
    pub fn find(&self, name: &VersionedFileName) -> Result<Option<PathBuf>> {
        let pattern = name.lookup_pattern();
        let exact_arch = format!(" {}", name.arch());

        for dir in self.search_dirs() {
            debug!("Searching {} for {}", dir.display(), pattern.as_str());
            let mut found = util::find_files(dir, &pattern)?;
            if found.is_empty() {
                continue;
            }
            if name.arch() == Architecture::Wow64 {
                found.sort_by_key(|path| {
                    let file = path.file_name().unwrap_or_default().to_string_lossy();
                    !file.to_ascii_lowercase().contains(&exact_arch)
                });
            }
            return Ok(found.into_iter().next());
        }
        Ok(None)
    }

    /// Look up the base of `request`, falling back to reverse synthesis for
    /// reverse deltas.
    pub fn resolve(&self, request: &ReconstructionRequest) -> Result<Resolution> {
        if let Some(path) = self.find(&request.base_name())? {
            return Ok(Resolution::Found(path));
        }
        if request.direction == PatchDirection::Reverse {
            return self.synthesize_from_reverse(request);
        }
        Ok(Resolution::NotFound)
    }

    /// Apply the reverse delta of `request` to its target-version binary and
    /// store the result under the base version's name. This is the only way
    /// base files come into existence for an empty tree.
    pub fn synthesize_from_reverse(&self, request: &ReconstructionRequest) -> Result<Resolution> {
        let target = VersionedFileName::new(
            &request.base_name,
            &request.target_version,
            request.arch,
            &request.extension,
        );
        let Some(target_path) = self.find(&target)? else {
            debug!("No {target} to build a base from");
            return Ok(Resolution::NotFound);
        };

        let input = util::read_file(&target_path)?;
        let rebuilt = delta::reconstruct(
            self.engine,
            Some(&input),
            &request.patches,
            self.config.allow_legacy,
        )?;

        let base_dir = self
            .config
            .base_files_dir
            .as_deref()
            .unwrap_or(&self.config.output_dir);
        let path = base_dir.join(request.base_name().to_string());
        if self.config.dry_run {
            info!("Would build base {} from reverse delta", path.display());
        } else if util::write_new_file(&path, &rebuilt.data)? {
            info!("Built base {} from reverse delta", path.display());
        } else {
            debug!("{} appeared concurrently", path.display());
        }
        Ok(Resolution::Synthesized {
            path,
            sha256: rebuilt.sha256,
        })
    }
}
