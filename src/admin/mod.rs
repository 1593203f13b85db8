#![forbid(unsafe_code)]

//! Quota administration utilities.
//!
//! Read-only reports over a running [`crate::qgroup::QuotaEngine`]: a status
//! and group listing, and a verifier that recomputes every group's totals
//! from the committed extents.

mod error;
mod show;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Status and group listing.
pub use show::{show, ShowReport, ShowTotals};

/// Quota counter verification.
///
/// Checks the hierarchy and compares stored totals against a brute-force
/// recomputation.
pub use verify::{
    reference_totals, verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport,
    VerifySeverity,
};
