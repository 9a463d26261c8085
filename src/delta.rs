//! Applying chains of binary deltas.
//!
//! The delta format itself belongs to the operating system (MSDelta); this
//! module only decides what buffer goes in, in which order the patches are
//! applied and what comes out.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::util;

/// The OS-level delta facility.
pub trait DeltaEngine: Send + Sync {
    /// Apply the delta stored in `patch` to `input`. PA19 deltas are only
    /// accepted when `allow_legacy` is set.
    fn apply(&self, input: &[u8], patch: &Path, allow_legacy: bool) -> Result<Vec<u8>>;
}

const PA30: &[u8; 4] = b"PA30";
const PA19: &[u8; 4] = b"PA19";

/// Delta files shipped in update packages start with a CRC32 of the delta
/// followed by the `PA30`/`PA19` magic. MSDelta wants the magic first.
pub fn strip_checksum_prefix(patch: &[u8], allow_legacy: bool) -> &[u8] {
    match patch.get(4..8) {
        Some(magic) if magic == PA30 || (allow_legacy && magic == PA19) => &patch[4..],
        _ => patch,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstructed {
    pub data: Vec<u8>,
    pub sha256: String,
}

/// Apply `patches` in order, each one to the output of the previous one.
/// Without a base the chain starts from an empty buffer. Nothing is written;
/// the caller decides where (and whether) the result goes.
pub fn reconstruct(
    engine: &dyn DeltaEngine,
    base: Option<&[u8]>,
    patches: &[PathBuf],
    allow_legacy: bool,
) -> Result<Reconstructed> {
    if patches.is_empty() {
        return Err(Error::DeltaApply {
            patch: PathBuf::new(),
            reason: "no patches to apply".into(),
        });
    }

    let mut buffer = base.unwrap_or_default().to_vec();
    for patch in patches {
        trace!("Applying {} to {} bytes", patch.display(), buffer.len());
        buffer = engine.apply(&buffer, patch, allow_legacy)?;
    }

    let sha256 = util::hash_hex(&buffer);
    debug!(
        "Applied {} patch(es), {} bytes, sha256 {sha256}",
        patches.len(),
        buffer.len()
    );
    Ok(Reconstructed {
        data: buffer,
        sha256,
    })
}

/// A RAW source already is the finished file; nothing is applied to it.
pub fn take_raw(patches: &[PathBuf]) -> Result<Reconstructed> {
    let [payload] = patches else {
        return Err(Error::DeltaApply {
            patch: patches.first().cloned().unwrap_or_default(),
            reason: format!("expected one RAW payload, got {}", patches.len()),
        });
    };
    let data = util::read_file(payload)?;
    let sha256 = util::hash_hex(&data);
    debug!("Took {} RAW bytes from {}", data.len(), payload.display());
    Ok(Reconstructed { data, sha256 })
}

/// Engine used where MSDelta does not exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableEngine;

impl DeltaEngine for UnavailableEngine {
    fn apply(&self, _input: &[u8], patch: &Path, _allow_legacy: bool) -> Result<Vec<u8>> {
        Err(Error::DeltaApply {
            patch: patch.to_path_buf(),
            reason: "no delta engine available on this platform".into(),
        })
    }
}

#[cfg(windows)]
pub use msdelta::MsDeltaEngine;

#[cfg(windows)]
mod msdelta {
    use std::path::Path;

    use windows::Win32::Foundation::FALSE;
    use windows::Win32::System::ApplicationInstallationAndServicing::{
        ApplyDeltaB, DeltaFree, DELTA_INPUT, DELTA_INPUT_0, DELTA_OUTPUT,
    };

    use super::{strip_checksum_prefix, DeltaEngine};
    use crate::error::{Error, Result};
    use crate::util;

    const DELTA_APPLY_FLAG_ALLOW_PA19: i64 = 1;

    /// `ApplyDeltaB` from msdelta.dll.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct MsDeltaEngine;

    impl DeltaEngine for MsDeltaEngine {
        fn apply(&self, input: &[u8], patch: &Path, allow_legacy: bool) -> Result<Vec<u8>> {
            let raw = util::read_file(patch)?;
            let delta = strip_checksum_prefix(&raw, allow_legacy);

            let source = DELTA_INPUT {
                Anonymous: DELTA_INPUT_0 {
                    lpcStart: input.as_ptr() as *const _,
                },
                uSize: input.len(),
                Editable: FALSE,
            };
            let delta_input = DELTA_INPUT {
                Anonymous: DELTA_INPUT_0 {
                    lpcStart: delta.as_ptr() as *const _,
                },
                uSize: delta.len(),
                Editable: FALSE,
            };
            let mut output = DELTA_OUTPUT::default();
            let flags = if allow_legacy {
                DELTA_APPLY_FLAG_ALLOW_PA19
            } else {
                0
            };

            // SAFETY: both inputs borrow live slices for the duration of the call
            // and the output buffer is released with DeltaFree below.
            unsafe { ApplyDeltaB(flags, source, delta_input, &mut output) }.map_err(|e| {
                Error::DeltaApply {
                    patch: patch.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;

            // SAFETY: ApplyDeltaB succeeded, so lpStart points at uSize bytes.
            let data = unsafe {
                std::slice::from_raw_parts(output.lpStart as *const u8, output.uSize).to_vec()
            };
            // SAFETY: lpStart was allocated by ApplyDeltaB.
            unsafe { DeltaFree(output.lpStart) }.map_err(|e| Error::DeltaApply {
                patch: patch.to_path_buf(),
                reason: format!("DeltaFree: {e}"),
            })?;
            Ok(data)
        }
    }
}

/// The delta engine of the current platform.
#[cfg(windows)]
pub fn default_engine() -> std::sync::Arc<dyn DeltaEngine> {
    std::sync::Arc::new(MsDeltaEngine)
}

#[cfg(not(windows))]
pub fn default_engine() -> std::sync::Arc<dyn DeltaEngine> {
    std::sync::Arc::new(UnavailableEngine)
}

/// Symmetric test engine: the output is the patch XORed with the input,
/// so one patch file takes a buffer both forward and back.
#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::DeltaEngine;
    use crate::error::Result;

    #[derive(Default)]
    pub struct XorEngine {
        applied: AtomicUsize,
    }

    impl XorEngine {
        pub fn applied(&self) -> usize {
            self.applied.load(Ordering::SeqCst)
        }
    }

    pub fn xor(input: &[u8], patch: &[u8]) -> Vec<u8> {
        patch
            .iter()
            .enumerate()
            .map(|(i, p)| p ^ input.get(i).copied().unwrap_or(0))
            .collect()
    }

    impl DeltaEngine for XorEngine {
        fn apply(&self, input: &[u8], patch: &Path, _allow_legacy: bool) -> Result<Vec<u8>> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            let patch = std::fs::read(patch)?;
            Ok(xor(input, &patch))
        }
    }
}
