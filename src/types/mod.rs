#![forbid(unsafe_code)]
//! Identifiers and the error taxonomy shared by every quota layer.

use std::collections::BTreeSet;
use std::fmt;

pub mod checksum;

/// Identifier of a subvolume/tree whose extent ownership is tracked.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RootId(pub u64);

/// Set of roots referencing one extent, as reported by the backref walker.
pub type RootSet = BTreeSet<RootId>;

/// Hierarchical qgroup identifier.
///
/// The level is carried as an explicit field instead of being packed into the
/// high bits of a single integer, so subids never collide with levels.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct QgroupId {
    /// Hierarchy level; level 0 groups track a single root.
    pub level: u16,
    /// Identifier within the level.
    pub subid: u64,
}

impl QgroupId {
    /// Builds an identifier from its level and subid.
    pub const fn new(level: u16, subid: u64) -> Self {
        Self { level, subid }
    }

    /// Returns the level-0 group that tracks `root`.
    pub const fn for_root(root: RootId) -> Self {
        Self {
            level: 0,
            subid: root.0,
        }
    }

    /// Returns the root tracked by this group when it is a level-0 group.
    pub fn root(self) -> Option<RootId> {
        (self.level == 0).then_some(RootId(self.subid))
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QgroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.level, self.subid)
    }
}

impl From<RootId> for QgroupId {
    fn from(value: RootId) -> Self {
        QgroupId::for_root(value)
    }
}

/// Which configured limit a reservation would exceed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LimitKind {
    /// `max_rfer`
    Referenced,
    /// `max_excl`
    Exclusive,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Referenced => f.write_str("referenced"),
            LimitKind::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Errors surfaced by the quota engine.
#[derive(thiserror::Error, Debug)]
pub enum QuotaError {
    /// Underlying persistence failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted record failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A referenced group or relation does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The group or relation already exists.
    #[error("{0} already exists")]
    AlreadyExists(&'static str),
    /// The group still has members.
    #[error("qgroup {0} still has members")]
    Busy(QgroupId),
    /// Relation would not strictly increase the level.
    #[error("member {member} must have a lower level than parent {parent}")]
    InvalidLevel {
        /// Proposed member.
        member: QgroupId,
        /// Proposed parent.
        parent: QgroupId,
    },
    /// Operation not allowed in the current quota state.
    #[error("invalid quota state: {0}")]
    InvalidState(&'static str),
    /// A rescan is already in progress.
    #[error("rescan already running")]
    AlreadyRunning,
    /// Reservation would push a group past one of its limits.
    #[error("qgroup {qgroup} would exceed its {kind} limit")]
    QuotaExceeded {
        /// First group found over its limit.
        qgroup: QgroupId,
        /// Which limit was hit.
        kind: LimitKind,
    },
    /// Scratch memory for an accounting pass could not be obtained.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// A wait or background pass was interrupted.
    #[error("interrupted")]
    Interrupted,
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(String),
}

impl QuotaError {
    /// Maps the error onto the POSIX errno a syscall layer would report.
    pub fn to_errno(&self) -> i32 {
        match self {
            QuotaError::Io(_) | QuotaError::Corruption(_) => 5,
            QuotaError::Invalid(_)
            | QuotaError::InvalidLevel { .. }
            | QuotaError::InvalidState(_)
            | QuotaError::Config(_) => 22,
            QuotaError::NotFound(_) => 2,
            QuotaError::AlreadyExists(_) => 17,
            QuotaError::Busy(_) => 16,
            QuotaError::AlreadyRunning => 115,
            QuotaError::QuotaExceeded { .. } => 122,
            QuotaError::ResourceExhausted(_) => 12,
            QuotaError::Interrupted => 4,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, QuotaError>;
