use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use crate::manifest::{DeclaredHash, ExpressManifestEntry};
use crate::naming::{Architecture, VersionedFileName};

/// Direction of a delta, encoded by MSU packages as the `f`, `r` or `n`
/// directory a delta file sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PatchDirection {
    /// Base (RTM) to target.
    Forward,
    /// Target back to base.
    Reverse,
    /// From nothing to target.
    Null,
}

impl PatchDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchDirection::Forward => "f",
            PatchDirection::Reverse => "r",
            PatchDirection::Null => "n",
        }
    }
}

impl FromStr for PatchDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f" | "F" => Ok(PatchDirection::Forward),
            "r" | "R" => Ok(PatchDirection::Reverse),
            "n" | "N" => Ok(PatchDirection::Null),
            other => Err(format!("unknown patch direction \"{other}\"")),
        }
    }
}

impl fmt::Display for PatchDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delta bytes carved out of a PSF blob and written as a standalone file.
#[derive(Debug, Clone)]
pub struct DeltaRecord {
    pub entry: ExpressManifestEntry,
    pub path: PathBuf,
}

impl DeltaRecord {
    pub fn direction(&self) -> PatchDirection {
        self.entry.direction
    }
}

/// One target binary to rebuild.
#[derive(Debug, Clone)]
pub struct ReconstructionRequest {
    pub base_name: String,
    pub extension: String,
    pub target_version: String,
    pub base_version: String,
    pub arch: Architecture,
    pub kb: Option<String>,
    pub direction: PatchDirection,
    pub patches: Vec<PathBuf>,
    /// Declared hash of the finished target, checked before it is stored.
    pub expected_hash: Option<DeclaredHash>,
    /// The patch is the finished file itself (a RAW source).
    pub raw: bool,
}

impl ReconstructionRequest {
    pub fn target_name(&self) -> VersionedFileName {
        VersionedFileName::new(&self.base_name, &self.target_version, self.arch, &self.extension)
            .with_kb(self.kb.as_deref())
    }

    pub fn base_name(&self) -> VersionedFileName {
        VersionedFileName::new(&self.base_name, &self.base_version, self.arch, &self.extension)
    }
}

/// What happened to a single file of an update package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Built { name: String, sha256: String },
    BaseSynthesized { name: String, sha256: String },
    Skipped { name: String, reason: String },
    Failed { name: String, reason: String },
}

impl FileOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FileOutcome::Failed { .. })
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOutcome::Built { name, sha256 } => write!(f, "built    {name}  sha256={sha256}"),
            FileOutcome::BaseSynthesized { name, sha256 } => {
                write!(f, "base     {name}  sha256={sha256}")
            }
            FileOutcome::Skipped { name, reason } => write!(f, "skipped  {name}: {reason}"),
            FileOutcome::Failed { name, reason } => write!(f, "failed   {name}: {reason}"),
        }
    }
}

pub struct MsuSummary {
    pub msu: PathBuf,
    pub kb: Option<String>,
    pub outcomes: Vec<FileOutcome>,
}

impl MsuSummary {
    pub fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(FileOutcome::is_failure)
    }
}

/// Result of a batch run; an aborted MSU never stops its siblings.
#[derive(Default)]
pub struct BatchSummary {
    pub completed: Vec<MsuSummary>,
    pub aborted: Vec<(PathBuf, String)>,
    pub skipped: Vec<PathBuf>,
}

impl BatchSummary {
    pub fn has_failures(&self) -> bool {
        !self.aborted.is_empty() || self.completed.iter().any(MsuSummary::has_failures)
    }
}
