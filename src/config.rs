use std::path::PathBuf;

use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};

/// Core user-mode and kernel binaries pulled out of legacy and diff cabinets.
pub const DEFAULT_EXTRACT_GLOBS: &[&str] = &[
    "*ntos*.exe",
    "*ntdll*.dll",
    "*ntos*.sys",
    "*kernel32.dll",
    "*kernelbase.dll",
    "*ws2_32.dll",
    "*CRYPTBASE.DLL",
    "*dwrite.dll",
    "*dbghelp.dll",
    "*WINMM.dll",
    "*sechost.dll",
    "*bcryptprimitives.dll",
    "*msvcrt.dll",
    "*advapi32.dll",
    "*RPCRT4.dll",
    "*combase.dll",
    "*ucrtbase.dll",
    "*msvcp_win.dll",
    "*OLEAUT32.dll",
    "*clfs.sys",
];

/// File names worth rebuilding out of an Express PSF blob.
pub const DEFAULT_NAME_FILTER: &str = r".*((ntos)|(ntdll)|(kernel((32)|(base)))|(ws2_32)|(dbghelp)|(WINMM)|(bcryptprimitives)|(sechost)|(msvcrt)|(advapi32)|(RPCRT4)|(combase)|(ucrtbase)|(msvcp_win)|(OLEAUT32)|(CRYPTBASE)|(dwrite)|(clfs)).*\.((dll)|(exe)|(sys))$";

/// Update packages picked up when a directory is processed.
pub const DEFAULT_PACKAGE_FILTER: &str = r"\.((msu)|(cab))$";

pub const DEFAULT_OUTPUT_DIR: &str = "KernelFiles";

/// Compile a user supplied file-name filter. Matching is anchored at the
/// start of the name and ignores case.
pub fn compile_name_filter(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(&format!("^(?:{pattern})"))
        .case_insensitive(true)
        .build()
        .map_err(|source| Error::InvalidFilter {
            pattern: pattern.to_string(),
            source,
        })
}

/// Compile a package filter. Unlike file name filters it may match anywhere
/// in the name.
pub fn compile_package_filter(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| Error::InvalidFilter {
            pattern: pattern.to_string(),
            source,
        })
}

/// Settings for one run, passed to every stage of the pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    pub base_files_dir: Option<PathBuf>,
    pub name_filter: Regex,
    pub package_filter: Regex,
    pub extract_globs: Vec<String>,
    pub keep_temp_files: bool,
    pub force: bool,
    pub dry_run: bool,
    /// Accept PA19 deltas.
    pub allow_legacy: bool,
    pub jobs: usize,
    /// Parent of the per-package scratch directories; the OS temp dir when unset.
    pub temp_root: Option<PathBuf>,
}

impl Config {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            output_dir: output_dir.into(),
            base_files_dir: None,
            name_filter: compile_name_filter(DEFAULT_NAME_FILTER)?,
            package_filter: compile_package_filter(DEFAULT_PACKAGE_FILTER)?,
            extract_globs: DEFAULT_EXTRACT_GLOBS.iter().map(|g| g.to_string()).collect(),
            keep_temp_files: false,
            force: false,
            dry_run: false,
            allow_legacy: true,
            jobs: 4,
            temp_root: None,
        })
    }

    pub fn extract_globs(&self) -> Vec<&str> {
        self.extract_globs.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_filter() {
        let config = Config::new("out").unwrap();
        assert!(config.name_filter.is_match("ntoskrnl.exe"));
        assert!(config.name_filter.is_match("KernelBase.dll"));
        assert!(config.name_filter.is_match("clfs.sys"));
        assert!(!config.name_filter.is_match("notepad.exe"));
        assert!(!config.name_filter.is_match("ntdll.dll.mui"));
    }

    #[test]
    fn test_package_filter() {
        let config = Config::new("out").unwrap();
        assert!(config.package_filter.is_match("windows10.0-kb5021233-x64.msu"));
        assert!(config.package_filter.is_match("A.CAB"));
        assert!(!config.package_filter.is_match("notes.txt"));
    }

    #[test]
    fn test_filter_is_anchored_at_start() {
        let re = compile_name_filter("ntdll").unwrap();
        assert!(re.is_match("NTDLL.dll"));
        assert!(!re.is_match("wow-ntdll.dll"));
        assert!(compile_name_filter("(").is_err());
    }
}
