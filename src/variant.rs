//! Working out how an MSU is packaged.
//!
//! Three layouts exist in the wild and nothing in the package declares which
//! one it uses, so they are probed in a fixed order:
//!
//! 1. Express: `*Metadata.cab` -> `LCU*.xml.cab` -> update manifest, whose
//!    payloads name an Express CAB (holding `express.psf.cix.xml`) and a PSF blob.
//! 2. Windows Server: `WindowsNN.N-KBxxxx-xARCH.cab` containing a second cab
//!    of the same family, containing `Cab_*_for_KB*_PSFX.cab` diff cabinets.
//! 3. Legacy: the outer cab of (2) holds `Cab_*.cab` sub-cabinets directly.
//!
//! A probe whose payload is not found exactly once hands over to the next
//! one. Everything else is fatal for the package.

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::Config;
use crate::container::ContainerAccess;
use crate::error::{Error, Result};
use crate::manifest::{ExpressManifest, UpdateManifest};
use crate::naming::{kb_embedded, kb_from_lcu_metadata, kb_from_server_cab, kb_from_sub_cab};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MsuVariant {
    Win11Express,
    WindowsServerDiff,
    Windows10Legacy,
}

impl fmt::Display for MsuVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MsuVariant::Win11Express => "Windows 11 Express",
            MsuVariant::WindowsServerDiff => "Windows Server diff",
            MsuVariant::Windows10Legacy => "Windows 10 legacy",
        })
    }
}

/// Outcome of one probing step.
#[derive(Debug)]
pub enum Probe<T> {
    Matched(T),
    /// The layout does not apply; the reason is only traced.
    NotApplicable(String),
}

/// What a package turned out to contain.
#[derive(Debug)]
pub enum ResolvedMsu {
    Express {
        kb: String,
        manifest: UpdateManifest,
        express: ExpressManifest,
        /// The PSF blob, extracted into the caller's work directory.
        blob: PathBuf,
    },
    /// Files pulled out of diff-style or flat cabinets, ready to process.
    Extracted {
        variant: MsuVariant,
        kb: Option<String>,
        files: Vec<PathBuf>,
    },
}

impl ResolvedMsu {
    pub fn variant(&self) -> MsuVariant {
        match self {
            ResolvedMsu::Express { .. } => MsuVariant::Win11Express,
            ResolvedMsu::Extracted { variant, .. } => *variant,
        }
    }

    pub fn kb(&self) -> Option<&str> {
        match self {
            ResolvedMsu::Express { kb, .. } => Some(kb),
            ResolvedMsu::Extracted { kb, .. } => kb.as_deref(),
        }
    }
}

static PSFX_CAB: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"_PSFX\.cab$")
        .case_insensitive(true)
        .build()
        .expect("static pattern is valid")
});

/// Diff-style packages name at least one of their cabinets `..._PSFX.cab`;
/// everything else ships final binaries.
pub fn classify_package(main_cab: &str, sub_cabs: &[&str]) -> MsuVariant {
    let is_diff = std::iter::once(main_cab)
        .chain(sub_cabs.iter().copied())
        .any(|name| PSFX_CAB.is_match(crate::naming::basename(name)));
    if is_diff {
        MsuVariant::WindowsServerDiff
    } else {
        MsuVariant::Windows10Legacy
    }
}

const METADATA_CAB: &str = "*Metadata.cab";
const LCU_METADATA_CAB: &str = "LCU*.xml.cab";
const XML: &str = "*.xml";
const EXPRESS_XML: &str = "express.psf.cix.xml";
const SERVER_CAB: &str = "Windows*.*-KB*-x*.cab";
const PSFX_SUB_CAB: &str = "Cab_*_for_KB*_PSFX.cab";
const SUB_CAB: &str = "Cab_*.cab";

enum State {
    ProbeExpress,
    ProbeServer,
    /// Holds the scratch directory the outer cabinet was extracted to.
    ProbeLegacy {
        main_cab: PathBuf,
        _scratch: Option<TempDir>,
    },
    Done(ResolvedMsu),
}

pub struct MsuResolver<'a> {
    containers: &'a dyn ContainerAccess,
    config: &'a Config,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The single element of `found`, if there is exactly one.
fn exactly_one(mut found: Vec<PathBuf>) -> Option<PathBuf> {
    if found.len() == 1 {
        found.pop()
    } else {
        None
    }
}

impl<'a> MsuResolver<'a> {
    pub fn new(containers: &'a dyn ContainerAccess, config: &'a Config) -> Self {
        Self { containers, config }
    }

    fn scratch(&self) -> Result<TempDir> {
        util::scratch_dir(self.config.temp_root.as_deref(), self.config.keep_temp_files)
    }

    /// Run the probes against `msu`. Whatever the result refers to on disk
    /// (the PSF blob or the extracted files) is placed below `work_dir`;
    /// intermediate cabinets live in scratch directories removed on return.
    pub fn resolve(&self, msu: &Path, work_dir: &Path) -> Result<ResolvedMsu> {
        let mut state = State::ProbeExpress;
        loop {
            state = match state {
                State::ProbeExpress => match self.probe_express(msu, work_dir)? {
                    Probe::Matched(resolved) => State::Done(resolved),
                    Probe::NotApplicable(reason) => {
                        info!("{}: not an Express package ({reason})", msu.display());
                        State::ProbeServer
                    }
                },
                State::ProbeServer => self.probe_server(msu, work_dir)?,
                State::ProbeLegacy { main_cab, _scratch } => {
                    State::Done(self.probe_legacy(&main_cab, work_dir)?)
                }
                State::Done(resolved) => {
                    info!(
                        "{}: {} package{}",
                        msu.display(),
                        resolved.variant(),
                        resolved
                            .kb()
                            .map(|kb| format!(" for {kb}"))
                            .unwrap_or_default()
                    );
                    return Ok(resolved);
                }
            };
        }
    }

    fn probe_express(&self, msu: &Path, work_dir: &Path) -> Result<Probe<ResolvedMsu>> {
        let scratch = self.scratch()?;
        let stage = scratch.path();

        let Some(metadata_cab) =
            exactly_one(self.containers.extract(msu, stage, &[METADATA_CAB], true)?)
        else {
            return Ok(Probe::NotApplicable("no single metadata cabinet".into()));
        };
        let Some(lcu_cab) = exactly_one(self.containers.extract(
            &metadata_cab,
            stage,
            &[LCU_METADATA_CAB],
            true,
        )?) else {
            return Ok(Probe::NotApplicable("no single LCU metadata cabinet".into()));
        };
        let kb = kb_from_lcu_metadata(&file_name(&lcu_cab)).ok_or_else(|| {
            Error::manifest(&lcu_cab, "no KB number in LCU metadata cabinet name")
        })?;

        let manifest_dir = stage.join("manifest");
        let Some(manifest_path) =
            exactly_one(self.containers.extract(&lcu_cab, &manifest_dir, &[XML], true)?)
        else {
            return Ok(Probe::NotApplicable("no single update manifest".into()));
        };
        let manifest = UpdateManifest::parse(&manifest_path)?;
        info!(
            "{kb}: updating {} to {} ({})",
            manifest.os_base_version, manifest.os_target_version, manifest.arch
        );

        let (cab_payload, psf_payload) = match manifest.express_payloads() {
            Ok(payloads) => payloads,
            Err(Error::FormatVariantMismatch(reason)) => return Ok(Probe::NotApplicable(reason)),
            Err(e) => return Err(e),
        };

        let Some(express_cab) = exactly_one(self.containers.extract(
            msu,
            stage,
            &[cab_payload.file_name()],
            true,
        )?) else {
            return Ok(Probe::NotApplicable(format!(
                "payload {} missing",
                cab_payload.file_name()
            )));
        };
        let Some(blob) = exactly_one(self.containers.extract(
            msu,
            work_dir,
            &[psf_payload.file_name()],
            true,
        )?) else {
            return Ok(Probe::NotApplicable(format!(
                "payload {} missing",
                psf_payload.file_name()
            )));
        };

        let express_dir = stage.join("express");
        let Some(express_xml) = exactly_one(self.containers.extract(
            &express_cab,
            &express_dir,
            &[EXPRESS_XML],
            true,
        )?) else {
            return Ok(Probe::NotApplicable(format!(
                "no {EXPRESS_XML} in {}",
                file_name(&express_cab)
            )));
        };
        let express = ExpressManifest::parse(&express_xml)?;

        Ok(Probe::Matched(ResolvedMsu::Express {
            kb,
            manifest,
            express,
            blob,
        }))
    }

    fn probe_server(&self, msu: &Path, work_dir: &Path) -> Result<State> {
        let outer_scratch = self.scratch()?;
        let mut outer = self
            .containers
            .extract(msu, outer_scratch.path(), &[SERVER_CAB], true)?;

        // A bare update cabinet is its own outer cab.
        let is_cab = msu
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("cab"));
        if outer.is_empty() && is_cab {
            debug!("{} is itself the main cabinet", msu.display());
            return Ok(State::ProbeLegacy {
                main_cab: msu.to_path_buf(),
                _scratch: None,
            });
        }
        let main_cab = match outer.len() {
            1 => outer.remove(0),
            n => {
                return Err(Error::UnsupportedPackage {
                    path: msu.to_path_buf(),
                    reason: format!("expected one {SERVER_CAB} cabinet, found {n}"),
                })
            }
        };

        let nested_scratch = self.scratch()?;
        let Some(nested) = exactly_one(self.containers.extract(
            &main_cab,
            nested_scratch.path(),
            &[SERVER_CAB],
            true,
        )?) else {
            info!(
                "{}: no nested server cabinet, trying legacy layout",
                file_name(&main_cab)
            );
            return Ok(State::ProbeLegacy {
                main_cab,
                _scratch: Some(outer_scratch),
            });
        };

        let kb = kb_from_server_cab(&file_name(&nested)).ok_or_else(|| {
            Error::UnsupportedPackage {
                path: nested.clone(),
                reason: "no KB number in cabinet name".into(),
            }
        })?;

        let psfx_dir = nested_scratch.path().join("psfx");
        let psfx_cabs = self
            .containers
            .extract(&nested, &psfx_dir, &[PSFX_SUB_CAB], true)?;
        let globs = self.config.extract_globs();

        let mut files = Vec::new();
        if psfx_cabs.is_empty() {
            // Older packages have one layer less.
            debug!("No PSFX cabinets in {}", file_name(&nested));
            files = self.containers.extract(&nested, work_dir, &globs, false)?;
        } else {
            for psfx in &psfx_cabs {
                let found = kb_from_sub_cab(&file_name(psfx)).unwrap_or_default();
                if !found.eq_ignore_ascii_case(&kb) {
                    return Err(Error::KbMismatch {
                        expected: kb,
                        found,
                    });
                }
            }
            for psfx in &psfx_cabs {
                files.extend(self.containers.extract(psfx, work_dir, &globs, false)?);
            }
        }

        Ok(State::Done(ResolvedMsu::Extracted {
            variant: MsuVariant::WindowsServerDiff,
            kb: Some(kb),
            files,
        }))
    }

    fn probe_legacy(&self, main_cab: &Path, work_dir: &Path) -> Result<ResolvedMsu> {
        let scratch = self.scratch()?;
        let main_name = file_name(main_cab);
        let mut kb = kb_embedded(&main_name);

        let sub_cabs = self
            .containers
            .extract(main_cab, scratch.path(), &[SUB_CAB], true)?;
        let sub_names: Vec<String> = sub_cabs.iter().map(|p| file_name(p)).collect();
        for name in &sub_names {
            let found = kb_from_sub_cab(name).ok_or_else(|| Error::UnsupportedPackage {
                path: main_cab.to_path_buf(),
                reason: format!("no KB number in sub-cabinet {name}"),
            })?;
            if let Some(expected) = &kb {
                if !expected.eq_ignore_ascii_case(&found) {
                    return Err(Error::KbMismatch {
                        expected: expected.clone(),
                        found,
                    });
                }
            }
            kb = Some(found);
        }

        let sub_refs: Vec<&str> = sub_names.iter().map(String::as_str).collect();
        let variant = classify_package(&main_name, &sub_refs);

        let globs = self.config.extract_globs();
        let mut files = Vec::new();
        for sub in &sub_cabs {
            files.extend(self.containers.extract(sub, work_dir, &globs, false)?);
        }
        if files.is_empty() {
            debug!("Nothing in sub-cabinets, extracting from {main_name}");
            files = self.containers.extract(main_cab, work_dir, &globs, false)?;
        }

        Ok(ResolvedMsu::Extracted {
            variant,
            kb,
            files,
        })
    }
}
