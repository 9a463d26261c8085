use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An expected payload was absent or present more than once.
    #[error("package layout does not match: {0}")]
    FormatVariantMismatch(String),

    #[error("KB sanity check failed: {expected} != {found}")]
    KbMismatch { expected: String, found: String },

    #[error("malformed manifest {}: {reason}", path.display())]
    ManifestFormat { path: PathBuf, reason: String },

    #[error("base file \"{name}\" not found")]
    MissingBaseFile { name: String },

    #[error("container operation on {} failed ({command}): {reason}", container.display())]
    Container {
        container: PathBuf,
        command: String,
        reason: String,
    },

    #[error("applying {} failed: {reason}", patch.display())]
    DeltaApply { patch: PathBuf, reason: String },

    #[error("{name} does not match its declared hash: expected {expected}, got {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("blob range {offset}+{length} exceeds blob size {blob_size}")]
    BlobBounds {
        offset: u64,
        length: u64,
        blob_size: u64,
    },

    #[error("architecture \"{0}\" is not recognized")]
    UnknownArchitecture(String),

    #[error("file name does not match any known component layout: {0}")]
    UnrecognizedComponentPath(String),

    #[error("{} is not a recognized update package: {reason}", path.display())]
    UnsupportedPackage { path: PathBuf, reason: String },

    #[error("XML error in {}: {source}", path.display())]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },

    #[error("invalid file name filter \"{pattern}\": {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::ManifestFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
