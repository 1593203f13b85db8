//! Hierarchical quota-group accounting for a copy-on-write block tree.
//!
//! The engine lives in [`qgroup`]; [`storage`] persists its rows and
//! [`admin`] reports on it. [`testkit`] simulates the host's extent tree.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod qgroup;
pub mod storage;
pub mod testkit;
pub mod types;
