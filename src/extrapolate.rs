//! Turning update packages into versioned binaries in the output directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::container::ContainerAccess;
use crate::delta::{self, DeltaEngine};
use crate::error::{Error, Result};
use crate::manifest::{DeclaredHash, UpdateManifest};
use crate::naming::{kb_anywhere, split_extension, Architecture, ComponentFile, VersionedFileName};
use crate::psf;
use crate::records::{
    BatchSummary, DeltaRecord, FileOutcome, MsuSummary, PatchDirection, ReconstructionRequest,
};
use crate::resolve::{BaseFileResolver, Resolution};
use crate::util;
use crate::variant::{MsuResolver, MsuVariant, ResolvedMsu};

pub struct Extrapolator {
    config: Config,
    containers: Arc<dyn ContainerAccess>,
    engine: Arc<dyn DeltaEngine>,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Compare a rebuilt file with the hash its manifest declares for it.
fn verify(name: &str, declared: Option<&DeclaredHash>, actual: &str) -> Result<()> {
    let Some(declared) = declared else {
        return Ok(());
    };
    let Some(expected) = declared.sha256_hex() else {
        debug!("Cannot check {} hash \"{}\" of {name}", declared.alg, declared.value);
        return Ok(());
    };
    if expected != actual {
        return Err(Error::HashMismatch {
            name: name.to_string(),
            expected,
            actual: actual.to_string(),
        });
    }
    debug!("{name} matches its declared hash");
    Ok(())
}

impl Extrapolator {
    pub fn new(
        config: Config,
        containers: Arc<dyn ContainerAccess>,
        engine: Arc<dyn DeltaEngine>,
    ) -> Self {
        Self {
            config,
            containers,
            engine,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Rebuild one binary.
    ///
    /// Forward and null requests are skipped when the target already exists.
    /// A reverse request only ever produces the base file; the forward build
    /// from that base is left to a later run. A rebuilt file that does not
    /// match the hash declared for it is never stored.
    pub fn reconstruct(&self, request: &ReconstructionRequest) -> Result<FileOutcome> {
        let target = request.target_name().to_string();
        let target_path = self.config.output_dir.join(&target);

        if request.direction != PatchDirection::Reverse && target_path.exists() {
            debug!("Skipping {target}");
            return Ok(FileOutcome::Skipped {
                name: target,
                reason: "already exists".into(),
            });
        }

        let rebuilt = if request.raw && request.direction != PatchDirection::Reverse {
            delta::take_raw(&request.patches)?
        } else {
            let base = match request.direction {
                PatchDirection::Null => None,
                direction => {
                    let resolver = BaseFileResolver::new(&self.config, self.engine.as_ref());
                    match resolver.resolve(request)? {
                        Resolution::Found(path) if direction == PatchDirection::Reverse => {
                            return Ok(FileOutcome::Skipped {
                                name: display_name(&path),
                                reason: "base already present".into(),
                            });
                        }
                        Resolution::Found(path) => {
                            debug!("{} => {target}", path.display());
                            Some(util::read_file(&path)?)
                        }
                        Resolution::Synthesized { path, sha256 } => {
                            return Ok(FileOutcome::BaseSynthesized {
                                name: display_name(&path),
                                sha256,
                            });
                        }
                        Resolution::NotFound => {
                            return Err(Error::MissingBaseFile {
                                name: request.base_name().to_string(),
                            });
                        }
                    }
                }
            };
            delta::reconstruct(
                self.engine.as_ref(),
                base.as_deref(),
                &request.patches,
                self.config.allow_legacy,
            )?
        };
        verify(&target, request.expected_hash.as_ref(), &rebuilt.sha256)?;
        self.store(target, &target_path, &rebuilt.data, rebuilt.sha256)
    }

    fn store(&self, name: String, dest: &Path, data: &[u8], sha256: String) -> Result<FileOutcome> {
        if self.config.dry_run {
            info!("Would write {name}");
            return Ok(FileOutcome::Built { name, sha256 });
        }
        if util::write_new_file(dest, data)? {
            info!("Built {name}");
            Ok(FileOutcome::Built { name, sha256 })
        } else {
            Ok(FileOutcome::Skipped {
                name,
                reason: "already exists".into(),
            })
        }
    }

    fn record_outcome(&self, name: impl FnOnce() -> String, result: Result<FileOutcome>) -> FileOutcome {
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let name = name();
                warn!("Failed to extrapolate {name}: {e}");
                FileOutcome::Failed {
                    name,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn wanted(&self, path: &Path) -> bool {
        self.config.name_filter.is_match(&display_name(path))
    }

    fn express_requests(
        &self,
        manifest: &UpdateManifest,
        kb: &str,
        records: Vec<DeltaRecord>,
    ) -> Vec<(String, Result<ReconstructionRequest>)> {
        records
            .into_iter()
            .map(|record| {
                let name = record.entry.real_file_name.clone();
                let request =
                    Architecture::from_component_name(&record.entry.file_name).map(|arch| {
                        let (base_name, extension) = split_extension(&record.entry.real_file_name);
                        ReconstructionRequest {
                            base_name: base_name.to_string(),
                            extension: extension.to_string(),
                            target_version: manifest.os_target_version.clone(),
                            base_version: manifest.os_base_version.clone(),
                            arch,
                            kb: Some(kb.to_string()),
                            direction: record.direction(),
                            expected_hash: record.entry.target_hash.clone(),
                            raw: record.entry.diff_type.eq_ignore_ascii_case("RAW"),
                            patches: vec![record.path],
                        }
                    });
                (name, request)
            })
            .collect()
    }

    fn diff_requests(
        &self,
        kb: Option<&str>,
        files: &[PathBuf],
    ) -> Vec<(String, Result<ReconstructionRequest>)> {
        files
            .iter()
            .filter(|file| self.wanted(file))
            .map(|file| {
                let request = ComponentFile::parse_diff(&file.to_string_lossy()).map(|component| {
                    ReconstructionRequest {
                        base_name: component.base_name,
                        extension: component.extension,
                        target_version: component.target_version,
                        base_version: component.base_version,
                        arch: component.arch,
                        kb: kb.map(str::to_string),
                        direction: component.direction,
                        patches: vec![file.clone()],
                        expected_hash: None,
                        raw: false,
                    }
                });
                (display_name(file), request)
            })
            .collect()
    }

    /// Flat cabinets already hold the final binaries; they only get renamed.
    fn store_final(&self, kb: Option<&str>, file: &Path) -> Result<FileOutcome> {
        let component = ComponentFile::parse_flat(&file.to_string_lossy())?;
        let name = VersionedFileName::new(
            &component.base_name,
            &component.target_version,
            component.arch,
            &component.extension,
        )
        .with_kb(kb)
        .to_string();
        let dest = self.config.output_dir.join(&name);
        if dest.exists() {
            debug!("Skipping {name}");
            return Ok(FileOutcome::Skipped {
                name,
                reason: "already exists".into(),
            });
        }
        let data = util::read_file(file)?;
        let sha256 = util::hash_hex(&data);
        self.store(name, &dest, &data, sha256)
    }

    /// Process a single update package. Failures of individual files are
    /// recorded in the summary; failures of the package itself are returned.
    pub fn process_msu(&self, msu: &Path) -> Result<MsuSummary> {
        info!("Processing {}", msu.display());
        if !self.config.dry_run {
            std::fs::create_dir_all(&self.config.output_dir)?;
        }

        let work = util::scratch_dir(self.config.temp_root.as_deref(), self.config.keep_temp_files)?;
        if self.config.keep_temp_files {
            info!("Keeping work files in {}", work.path().display());
        }
        let resolved = MsuResolver::new(self.containers.as_ref(), &self.config)
            .resolve(msu, work.path())?;
        let kb = resolved.kb().map(str::to_string);

        let outcomes = match resolved {
            ResolvedMsu::Express {
                kb,
                manifest,
                express,
                blob,
            } => {
                debug!("Express patch {}", express.patch_name);
                let records = psf::extract_matching(
                    &blob,
                    &express.entries,
                    &self.config.name_filter,
                    &work.path().join("patches"),
                )?;
                self.express_requests(&manifest, &kb, records)
                    .into_iter()
                    .map(|(name, request)| {
                        self.record_outcome(|| name, request.and_then(|r| self.reconstruct(&r)))
                    })
                    .collect()
            }
            ResolvedMsu::Extracted {
                variant: MsuVariant::WindowsServerDiff,
                kb,
                files,
            } => self
                .diff_requests(kb.as_deref(), &files)
                .into_iter()
                .map(|(name, request)| {
                    self.record_outcome(|| name, request.and_then(|r| self.reconstruct(&r)))
                })
                .collect(),
            ResolvedMsu::Extracted { kb, files, .. } => files
                .iter()
                .filter(|file| self.wanted(file))
                .map(|file| {
                    self.record_outcome(|| display_name(file), self.store_final(kb.as_deref(), file))
                })
                .collect(),
        };

        Ok(MsuSummary {
            msu: msu.to_path_buf(),
            kb,
            outcomes,
        })
    }

    /// Whether the output directory already holds artifacts of `msu`'s KB.
    fn already_extracted(&self, msu: &Path, existing: &[String]) -> bool {
        let Some(kb) = kb_anywhere(&display_name(msu)) else {
            return false;
        };
        let suffix = format!(" - {}.", kb.to_ascii_lowercase());
        existing.iter().any(|name| name.contains(&suffix))
    }

    /// Process a package, or every package below a directory, with at most
    /// `jobs` packages in flight. One package failing never stops the others.
    pub fn process_batch(&self, input: &Path) -> Result<BatchSummary> {
        if !input.is_dir() {
            let mut summary = BatchSummary::default();
            match self.process_msu(input) {
                Ok(done) => summary.completed.push(done),
                Err(e) => {
                    error!("Failed to extrapolate {}: {e}", input.display());
                    summary.aborted.push((input.to_path_buf(), e.to_string()));
                }
            }
            return Ok(summary);
        }

        let packages = util::find_files(input, &self.config.package_filter)?;
        info!(
            "Found {} package(s) in {}",
            packages.len(),
            input.display()
        );

        let existing: Vec<String> = match std::fs::read_dir(&self.config.output_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_ascii_lowercase())
                .collect(),
            Err(_) => Vec::new(),
        };

        let mut summary = BatchSummary::default();
        let mut todo = Vec::new();
        for package in packages {
            if !self.config.force && self.already_extracted(&package, &existing) {
                info!("Skipping already extracted {}", package.display());
                summary.skipped.push(package);
            } else {
                todo.push(package);
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs.max(1))
            .build()
            .map_err(std::io::Error::other)?;
        let results: Vec<(PathBuf, Result<MsuSummary>)> = pool.install(|| {
            todo.into_par_iter()
                .map(|package| {
                    let result = self.process_msu(&package);
                    (package, result)
                })
                .collect()
        });

        for (package, result) in results {
            match result {
                Ok(done) => summary.completed.push(done),
                Err(e) => {
                    error!("Failed to extrapolate {}: {e}", package.display());
                    summary.aborted.push((package, e.to_string()));
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryContainers;
    use crate::delta::testing::{xor, XorEngine};

    struct Fixture {
        root: tempfile::TempDir,
        engine: Arc<XorEngine>,
        containers: Arc<MemoryContainers>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                engine: Arc::new(XorEngine::default()),
                containers: Arc::new(MemoryContainers::new()),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.root.path().join(name)
        }

        fn config(&self) -> Config {
            let mut config = Config::new(self.path("out")).unwrap();
            config.base_files_dir = Some(self.path("base"));
            config.temp_root = Some(self.path("tmp"));
            config
        }

        fn extrapolator(&self, config: Config) -> Extrapolator {
            Extrapolator::new(config, self.containers.clone(), self.engine.clone())
        }

        fn write(&self, rel: &str, data: &[u8]) -> PathBuf {
            let path = self.path(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, data).unwrap();
            path
        }
    }

    fn request(direction: PatchDirection, patch: PathBuf) -> ReconstructionRequest {
        ReconstructionRequest {
            base_name: "ntkrnlmp".into(),
            extension: ".exe".into(),
            target_version: "10.0.22000.194".into(),
            base_version: "10.0.22000.1".into(),
            arch: Architecture::X64,
            kb: Some("KB5005635".into()),
            direction,
            patches: vec![patch],
            expected_hash: None,
            raw: false,
        }
    }

    const BASE: &[u8] = b"ntoskrnl rtm image";
    const TARGET: &[u8] = b"ntoskrnl new image";

    #[test]
    fn test_forward_build_is_idempotent() {
        let fx = Fixture::new();
        fx.write("base/ntoskrnl - 10.0.22000.1 x64.exe", BASE);
        let patch = fx.write("f.patch", &xor(BASE, TARGET));
        let ex = fx.extrapolator(fx.config());
        let req = request(PatchDirection::Forward, patch);

        let first = ex.reconstruct(&req).unwrap();
        let name = "ntoskrnl - 10.0.22000.194 x64 - KB5005635.exe";
        assert_eq!(
            first,
            FileOutcome::Built {
                name: name.into(),
                sha256: util::hash_hex(TARGET)
            }
        );
        let out = fx.path("out").join(name);
        assert_eq!(std::fs::read(&out).unwrap(), TARGET);
        let modified = std::fs::metadata(&out).unwrap().modified().unwrap();

        let second = ex.reconstruct(&req).unwrap();
        assert!(matches!(second, FileOutcome::Skipped { .. }));
        assert_eq!(fx.engine.applied(), 1);
        assert_eq!(std::fs::metadata(&out).unwrap().modified().unwrap(), modified);
        assert_eq!(std::fs::read_dir(fx.path("out")).unwrap().count(), 1);
    }

    #[test]
    fn test_reverse_synthesizes_base_then_forward_rebuilds() {
        let fx = Fixture::new();
        fx.write("base/ntoskrnl - 10.0.22000.194 x64.exe", TARGET);
        let patch = fx.write("r.patch", &xor(TARGET, BASE));
        let ex = fx.extrapolator(fx.config());

        let outcome = ex
            .reconstruct(&request(PatchDirection::Reverse, patch.clone()))
            .unwrap();
        assert_eq!(
            outcome,
            FileOutcome::BaseSynthesized {
                name: "ntoskrnl - 10.0.22000.1 x64.exe".into(),
                sha256: util::hash_hex(BASE)
            }
        );
        // Nothing chained onto the synthesized base in the same pass.
        assert!(!fx.path("out").exists());

        let again = ex
            .reconstruct(&request(PatchDirection::Reverse, patch.clone()))
            .unwrap();
        assert!(matches!(again, FileOutcome::Skipped { .. }));

        // Second phase: the symmetric delta takes the base forward again.
        let forward = ex
            .reconstruct(&request(PatchDirection::Forward, patch))
            .unwrap();
        assert!(matches!(forward, FileOutcome::Built { .. }));
        assert_eq!(
            std::fs::read(fx.path("out").join("ntoskrnl - 10.0.22000.194 x64 - KB5005635.exe"))
                .unwrap(),
            TARGET
        );
        assert_eq!(fx.engine.applied(), 2);
    }

    #[test]
    fn test_null_request_needs_no_base() {
        let fx = Fixture::new();
        let patch = fx.write("n.patch", TARGET);
        let ex = fx.extrapolator(fx.config());
        let outcome = ex
            .reconstruct(&request(PatchDirection::Null, patch))
            .unwrap();
        assert!(matches!(outcome, FileOutcome::Built { .. }));
    }

    #[test]
    fn test_missing_forward_base() {
        let fx = Fixture::new();
        let patch = fx.write("f.patch", TARGET);
        let ex = fx.extrapolator(fx.config());
        let err = ex
            .reconstruct(&request(PatchDirection::Forward, patch))
            .unwrap_err();
        match err {
            Error::MissingBaseFile { name } => {
                assert_eq!(name, "ntoskrnl - 10.0.22000.1 x64.exe")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.engine.applied(), 0);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let fx = Fixture::new();
        fx.write("base/ntoskrnl - 10.0.22000.1 x64.exe", BASE);
        let patch = fx.write("f.patch", &xor(BASE, TARGET));
        let mut config = fx.config();
        config.dry_run = true;
        let ex = fx.extrapolator(config);

        let outcome = ex
            .reconstruct(&request(PatchDirection::Forward, patch))
            .unwrap();
        assert_eq!(
            outcome,
            FileOutcome::Built {
                name: "ntoskrnl - 10.0.22000.194 x64 - KB5005635.exe".into(),
                sha256: util::hash_hex(TARGET)
            }
        );
        assert!(!fx.path("out").exists());
    }

    fn declared(data: &[u8]) -> Option<DeclaredHash> {
        use base64::prelude::*;
        Some(DeclaredHash {
            alg: "SHA256".into(),
            value: BASE64_STANDARD.encode(util::hash_bytes(data)),
        })
    }

    #[test]
    fn test_wrong_base_fails_hash_check_and_writes_nothing() {
        let fx = Fixture::new();
        fx.write("base/ntoskrnl - 10.0.22000.1 x64.exe", b"some other kernel!");
        let patch = fx.write("f.patch", &xor(BASE, TARGET));
        let ex = fx.extrapolator(fx.config());
        let mut req = request(PatchDirection::Forward, patch);
        req.expected_hash = declared(TARGET);

        match ex.reconstruct(&req).unwrap_err() {
            Error::HashMismatch { expected, actual, .. } => {
                assert_eq!(expected, util::hash_hex(TARGET));
                assert_ne!(actual, expected);
            }
            other => panic!("unexpected {other:?}"),
        }
        let written = std::fs::read_dir(fx.path("out"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(written, 0);
    }

    #[test]
    fn test_matching_declared_hash_is_built() {
        let fx = Fixture::new();
        fx.write("base/ntoskrnl - 10.0.22000.1 x64.exe", BASE);
        let patch = fx.write("f.patch", &xor(BASE, TARGET));
        let ex = fx.extrapolator(fx.config());
        let mut req = request(PatchDirection::Forward, patch);
        req.expected_hash = declared(TARGET);

        assert!(matches!(
            ex.reconstruct(&req).unwrap(),
            FileOutcome::Built { .. }
        ));
    }

    #[test]
    fn test_raw_source_bypasses_the_delta_engine() {
        let fx = Fixture::new();
        let payload = fx.write("ntdll.dll RAW.patch", TARGET);
        let ex = fx.extrapolator(fx.config());
        let mut req = request(PatchDirection::Forward, payload);
        req.raw = true;
        req.expected_hash = declared(TARGET);

        let outcome = ex.reconstruct(&req).unwrap();
        assert!(matches!(outcome, FileOutcome::Built { .. }));
        assert_eq!(fx.engine.applied(), 0);
        assert_eq!(
            std::fs::read(fx.path("out").join("ntoskrnl - 10.0.22000.194 x64 - KB5005635.exe"))
                .unwrap(),
            TARGET
        );
    }

    const NTDLL_DIR: &str = "amd64_microsoft-windows-ntdll_31bf3856ad364e35_10.0.19041.2364_none_1234";

    fn legacy_package(fx: &Fixture, msu: &str, kb: &str) {
        let main = format!("Windows10.0-{kb}-x64.cab");
        let sub = format!("Cab_1_for_{kb}.cab");
        fx.containers
            .insert(msu, vec![(main.clone(), Vec::new())]);
        fx.containers.insert(&main, vec![(sub.clone(), Vec::new())]);
        fx.containers.insert(
            &sub,
            vec![
                (format!(r"{NTDLL_DIR}\ntdll.dll"), b"final ntdll".to_vec()),
                (format!(r"{NTDLL_DIR}\ntdll.dll.mui"), b"mui".to_vec()),
            ],
        );
    }

    #[test]
    fn test_legacy_package_files_are_renamed() {
        let fx = Fixture::new();
        legacy_package(&fx, "legacy.msu", "KB5021233");
        let ex = fx.extrapolator(fx.config());

        let summary = ex.process_msu(Path::new("legacy.msu")).unwrap();
        assert_eq!(summary.kb.as_deref(), Some("KB5021233"));
        assert_eq!(summary.outcomes.len(), 1);
        let name = "ntdll - 10.0.19041.2364 x64 - KB5021233.dll";
        assert_eq!(
            summary.outcomes[0],
            FileOutcome::Built {
                name: name.into(),
                sha256: util::hash_hex(b"final ntdll")
            }
        );
        assert_eq!(std::fs::read(fx.path("out").join(name)).unwrap(), b"final ntdll");

        let again = ex.process_msu(Path::new("legacy.msu")).unwrap();
        assert!(matches!(again.outcomes[0], FileOutcome::Skipped { .. }));
    }

    #[test]
    fn test_server_diff_failures_stay_per_file() {
        let fx = Fixture::new();
        let kernel = "amd64_microsoft-windows-os-kernel_31bf3856ad364e35_10.0.20348.1547_none_6";
        fx.containers.insert(
            "server.msu",
            vec![("Windows10.0-KB5022842-x64.cab".into(), Vec::new())],
        );
        fx.containers.insert(
            "Windows10.0-KB5022842-x64.cab",
            vec![
                ("Windows10.0-KB5022842-x64.cab".into(), Vec::new()),
                ("Cab_1_for_KB5022842_PSFX.cab".into(), Vec::new()),
            ],
        );
        fx.containers.insert(
            "Cab_1_for_KB5022842_PSFX.cab",
            vec![
                (format!(r"{kernel}\f\ntoskrnl.exe"), xor(BASE, TARGET)),
                (format!(r"{kernel}\n\ntdll.dll"), b"null built".to_vec()),
            ],
        );
        let ex = fx.extrapolator(fx.config());

        let summary = ex.process_msu(Path::new("server.msu")).unwrap();
        assert_eq!(summary.outcomes.len(), 2);
        assert_eq!(summary.count(FileOutcome::is_failure), 1);
        assert!(summary.has_failures());
        assert!(fx
            .path("out")
            .join("ntdll - 10.0.20348.1547 x64 - KB5022842.dll")
            .exists());
    }

    #[test]
    fn test_batch_isolates_packages_and_skips_done_kbs() {
        let fx = Fixture::new();
        let input = fx.path("packages");
        legacy_package(&fx, "windows10.0-kb5021233-x64.msu", "KB5021233");
        legacy_package(&fx, "windows10.0-kb5022282-x64.msu", "KB5022282");
        fx.write("packages/windows10.0-kb5021233-x64.msu", b"");
        fx.write("packages/windows10.0-kb5022282-x64.msu", b"");
        fx.write("packages/broken-kb5000000.msu", b"");
        fx.write("packages/notes.txt", b"");
        fx.containers
            .insert("broken-kb5000000.msu", vec![("readme.txt".into(), Vec::new())]);
        fx.write(
            "out/ntdll - 10.0.19041.2364 x64 - KB5022282.dll",
            b"from an earlier run",
        );

        let ex = fx.extrapolator(fx.config());
        let summary = ex.process_batch(&input).unwrap();
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(summary.completed[0].kb.as_deref(), Some("KB5021233"));
        assert_eq!(summary.aborted.len(), 1);
        assert!(summary.aborted[0].0.ends_with("broken-kb5000000.msu"));
        assert_eq!(summary.skipped.len(), 1);
        assert!(summary.has_failures());

        let mut config = fx.config();
        config.force = true;
        let forced = fx.extrapolator(config).process_batch(&input).unwrap();
        assert!(forced.skipped.is_empty());
        assert_eq!(forced.completed.len(), 2);
    }
}
