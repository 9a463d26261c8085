//! Rebuild patched Windows binaries from security update packages.
//!
//! An MSU carries deltas, not binaries. [`variant::MsuResolver`] works out
//! how a package is laid out, [`psf`] carves Express deltas out of their blob,
//! [`resolve::BaseFileResolver`] finds the binary a delta applies to and
//! [`extrapolate::Extrapolator`] ties it together.

pub mod config;
pub mod container;
pub mod delta;
pub mod error;
pub mod extrapolate;
pub mod manifest;
pub mod naming;
pub mod psf;
pub mod records;
pub mod resolve;
pub mod util;
pub mod variant;

pub use config::Config;
pub use error::{Error, Result};
pub use extrapolate::Extrapolator;
