//! Canonical output naming and the name-derived metadata of update packages.
//!
//! Reconstructed binaries are stored as
//! `{base} - {version} {arch}[ - {KB}]{ext}`, e.g.
//! `ntoskrnl - 10.0.22000.194 x64 - KB5021233.exe`. The same scheme is the
//! lookup key for base files, so everything that builds or matches these
//! names lives here.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::records::PatchDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X64,
    X86,
    Wow64,
    Msil,
    Arm64,
}

impl Architecture {
    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::X86 => "x86",
            Architecture::Wow64 => "wow64",
            Architecture::Msil => "msil",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Guess the architecture from a component-store name such as
    /// `amd64_microsoft-windows-os-kernel_31bf3856ad364e35_...`.
    pub fn from_component_name(name: &str) -> Result<Self> {
        let prefix = name.split('_').next().unwrap_or_default();
        prefix.parse()
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "amd64" | "x64" => Ok(Architecture::X64),
            "x86" => Ok(Architecture::X86),
            "wow64" => Ok(Architecture::Wow64),
            "msil" => Ok(Architecture::Msil),
            "arm64" => Ok(Architecture::Arm64),
            _ => Err(Error::UnknownArchitecture(s.to_string())),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Historical aliases that ship under a different name than the one we store.
pub fn canonical_base_name(base_name: &str) -> &str {
    if base_name.eq_ignore_ascii_case("ntkrnlmp") {
        "ntoskrnl"
    } else {
        base_name
    }
}

fn dotted(extension: &str) -> String {
    if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedFileName {
    base_name: String,
    version: String,
    arch: Architecture,
    extension: String,
    kb: Option<String>,
}

impl VersionedFileName {
    pub fn new(base_name: &str, version: &str, arch: Architecture, extension: &str) -> Self {
        Self {
            base_name: canonical_base_name(base_name).to_string(),
            version: version.to_string(),
            arch,
            extension: dotted(extension),
            kb: None,
        }
    }

    pub fn with_kb(mut self, kb: Option<&str>) -> Self {
        self.kb = kb.map(str::to_string);
        self
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    /// Regex that matches this name on disk, with or without a KB or date
    /// suffix. `wow64` also accepts `x86` because sorting tools have been
    /// known to name WOW64 binaries that way; callers verify content anyway.
    pub fn lookup_pattern(&self) -> Regex {
        let arch = match self.arch {
            Architecture::Wow64 => "(?:wow64|x86)".to_string(),
            other => regex::escape(other.as_str()),
        };
        let pattern = format!(
            r"^{} - {} {}(?: - (?:KB\d+|\d+-\d+-\d+))?{}$",
            regex::escape(&self.base_name),
            regex::escape(&self.version),
            arch,
            regex::escape(&self.extension),
        );
        RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .expect("escaped versioned-name pattern is valid")
    }
}

impl fmt::Display for VersionedFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} {}", self.base_name, self.version, self.arch)?;
        if let Some(kb) = &self.kb {
            write!(f, " - {kb}")?;
        }
        f.write_str(&self.extension)
    }
}

/// Build a versioned file name from a raw architecture tag.
pub fn build_versioned_file_name(
    base_name: &str,
    version: &str,
    architecture: &str,
    extension: &str,
    kb: Option<&str>,
) -> Result<String> {
    let arch = architecture.parse()?;
    Ok(VersionedFileName::new(base_name, version, arch, extension)
        .with_kb(kb)
        .to_string())
}

/// Split `ntoskrnl.exe` into (`ntoskrnl`, `.exe`).
pub fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    }
}

/// Last segment of a Windows or POSIX style path.
pub fn basename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

fn case_insensitive(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("static pattern is valid")
}

static SERVER_CAB_KB: Lazy<Regex> =
    Lazy::new(|| case_insensitive(r"Windows\d+\.\d+-(KB\d+)-(?:x\d+|arm64)(?:_PSFX)?\.cab$"));
static SUB_CAB_KB: Lazy<Regex> =
    Lazy::new(|| case_insensitive(r"Cab_\d+_for_(KB\d+)(?:_PSFX)?\.cab$"));
static LCU_CAB_KB: Lazy<Regex> = Lazy::new(|| case_insensitive(r"_(KB\d+)\.xml\.cab$"));
static EMBEDDED_KB: Lazy<Regex> = Lazy::new(|| case_insensitive(r"[-_](KB\d+)[-_]"));
static ANY_KB: Lazy<Regex> = Lazy::new(|| case_insensitive(r"(?:^|[^A-Za-z0-9])(KB\d+)"));

fn capture_kb(re: &Regex, name: &str) -> Option<String> {
    re.captures(basename(name))
        .map(|caps| caps[1].to_ascii_uppercase())
}

/// KB of a `Windows10.0-KB5021233-x64.cab` style cabinet.
pub fn kb_from_server_cab(name: &str) -> Option<String> {
    capture_kb(&SERVER_CAB_KB, name)
}

/// KB of a `Cab_1_for_KB5021233_PSFX.cab` style sub-cabinet.
pub fn kb_from_sub_cab(name: &str) -> Option<String> {
    capture_kb(&SUB_CAB_KB, name)
}

/// KB of the `LCU..._KB5021233.xml.cab` metadata cabinet.
pub fn kb_from_lcu_metadata(name: &str) -> Option<String> {
    capture_kb(&LCU_CAB_KB, name)
}

/// KB delimited by `-` or `_` anywhere in a cabinet name.
pub fn kb_embedded(name: &str) -> Option<String> {
    capture_kb(&EMBEDDED_KB, name)
}

/// First KB-looking token of an arbitrary file name.
pub fn kb_anywhere(name: &str) -> Option<String> {
    capture_kb(&ANY_KB, name)
}

/// A file pulled from a diff-style or flat cabinet, identified by the
/// component directory it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFile {
    pub arch: Architecture,
    pub base_name: String,
    pub extension: String,
    pub target_version: String,
    pub base_version: String,
    pub direction: PatchDirection,
}

static DIFF_COMPONENT: Lazy<Regex> = Lazy::new(|| {
    case_insensitive(
        r"(?P<arch>amd64|wow64|msil|arm64|x86|x64)_microsoft-.*_(?P<ver>(?P<prefix>\d+\.\d+\.\d+\.)\d+)(?:_\w+)+[\\/](?P<dir>[rfn])[\\/](?P<base>\w+)(?P<ext>\.\w+)$",
    )
});

static FLAT_COMPONENT: Lazy<Regex> = Lazy::new(|| {
    case_insensitive(
        r"(?P<arch>amd64|wow64|msil|arm64|x86|x64)_(?:microsoft|windows)-.*_(?P<ver>(?P<prefix>\d+\.\d+\.\d+\.)\d+)(?:_\w+)+[\\/](?P<base>\w+)(?P<ext>\.\w+)$",
    )
});

impl ComponentFile {
    /// `amd64_microsoft-windows-os-kernel_..._10.0.20348.1547_none_...\r\ntoskrnl.exe`
    ///
    /// The base of a diff-style delta is always the RTM build of the same
    /// release, i.e. the target version with its revision set to `1`.
    pub fn parse_diff(path: &str) -> Result<Self> {
        let caps = DIFF_COMPONENT
            .captures(path)
            .ok_or_else(|| Error::UnrecognizedComponentPath(path.to_string()))?;
        let direction = caps["dir"]
            .parse()
            .map_err(|_| Error::UnrecognizedComponentPath(path.to_string()))?;
        Ok(Self {
            arch: caps["arch"].parse()?,
            base_name: caps["base"].to_string(),
            extension: caps["ext"].to_string(),
            target_version: caps["ver"].to_string(),
            base_version: format!("{}1", &caps["prefix"]),
            direction,
        })
    }

    /// Flat (legacy) cabinets ship the final binary with no direction segment.
    pub fn parse_flat(path: &str) -> Result<Self> {
        let caps = FLAT_COMPONENT
            .captures(path)
            .ok_or_else(|| Error::UnrecognizedComponentPath(path.to_string()))?;
        Ok(Self {
            arch: caps["arch"].parse()?,
            base_name: caps["base"].to_string(),
            extension: caps["ext"].to_string(),
            target_version: caps["ver"].to_string(),
            base_version: format!("{}1", &caps["prefix"]),
            direction: PatchDirection::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_alias_and_amd64() {
        let name =
            build_versioned_file_name("ntkrnlmp", "10.0.22000.194", "amd64", ".exe", None).unwrap();
        assert_eq!(name, "ntoskrnl - 10.0.22000.194 x64.exe");
    }

    #[test]
    fn test_kb_suffix() {
        let name = build_versioned_file_name(
            "ntoskrnl",
            "10.0.22000.194",
            "x64",
            ".exe",
            Some("KB5021233"),
        )
        .unwrap();
        assert_eq!(name, "ntoskrnl - 10.0.22000.194 x64 - KB5021233.exe");
    }

    #[test]
    fn test_extension_gets_dot() {
        let name = VersionedFileName::new("ntdll", "10.0.1.1", Architecture::X86, "dll");
        assert_eq!(name.to_string(), "ntdll - 10.0.1.1 x86.dll");
    }

    #[test]
    fn test_unknown_architecture() {
        assert!(matches!(
            build_versioned_file_name("a", "1.0.0.1", "mips", ".dll", None),
            Err(Error::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn test_lookup_pattern_accepts_kb_and_date() {
        let re = VersionedFileName::new("ntdll", "10.0.20348.1", Architecture::X64, ".dll")
            .lookup_pattern();
        assert!(re.is_match("ntdll - 10.0.20348.1 x64.dll"));
        assert!(re.is_match("NTDLL - 10.0.20348.1 X64 - KB5021233.dll"));
        assert!(re.is_match("ntdll - 10.0.20348.1 x64 - 2023-01-10.dll"));
        assert!(!re.is_match("ntdll - 10.0.20348.11 x64.dll"));
        assert!(!re.is_match("ntdll - 10.0.20348.1 x86.dll"));
    }

    #[test]
    fn test_wow64_lookup_accepts_x86() {
        let re = VersionedFileName::new("ntdll", "10.0.20348.1", Architecture::Wow64, ".dll")
            .lookup_pattern();
        assert!(re.is_match("ntdll - 10.0.20348.1 wow64.dll"));
        assert!(re.is_match("ntdll - 10.0.20348.1 x86.dll"));
    }

    #[test]
    fn test_kb_extraction() {
        assert_eq!(
            kb_from_server_cab("Windows10.0-KB5021233-x64.cab").as_deref(),
            Some("KB5021233")
        );
        assert_eq!(
            kb_from_sub_cab("Cab_1_for_kb5021235_PSFX.cab").as_deref(),
            Some("KB5021235")
        );
        assert_eq!(
            kb_from_lcu_metadata("LCU_Windows11_KB5022287.xml.cab").as_deref(),
            Some("KB5022287")
        );
        assert_eq!(
            kb_embedded("Windows10.0-KB4586781-x64_PSFX.cab").as_deref(),
            Some("KB4586781")
        );
        assert_eq!(
            kb_anywhere("Windows 10 21H2 KB5021233 - 2022-12.msu").as_deref(),
            Some("KB5021233")
        );
        assert_eq!(kb_from_server_cab("Cab_1_for_KB1_PSFX.cab"), None);
    }

    #[test]
    fn test_parse_diff_component() {
        let file = ComponentFile::parse_diff(
            r"tmp\amd64_microsoft-windows-os-kernel_31bf3856ad364e35_10.0.20348.1547_none_674de4333985bb23\r\ntoskrnl.exe",
        )
        .unwrap();
        assert_eq!(file.arch, Architecture::X64);
        assert_eq!(file.base_name, "ntoskrnl");
        assert_eq!(file.extension, ".exe");
        assert_eq!(file.target_version, "10.0.20348.1547");
        assert_eq!(file.base_version, "10.0.20348.1");
        assert_eq!(file.direction, PatchDirection::Reverse);
    }

    #[test]
    fn test_parse_flat_component() {
        let file = ComponentFile::parse_flat(
            "out/wow64_microsoft-windows-ntdll_31bf3856ad364e35_10.0.19041.2364_none_1234/ntdll.dll",
        )
        .unwrap();
        assert_eq!(file.arch, Architecture::Wow64);
        assert_eq!(file.target_version, "10.0.19041.2364");
        assert_eq!(file.direction, PatchDirection::Null);
        assert!(ComponentFile::parse_flat("random/ntdll.dll").is_err());
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("ntoskrnl.exe"), ("ntoskrnl", ".exe"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(basename(r"a\b/c.dll"), "c.dll");
    }
}
