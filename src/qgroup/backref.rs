//! Boundary to the host's extent-ownership discovery and extent tree.

use crate::types::{Result, RootId, RootSet};

/// Point in time at which extent ownership is resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeSeq {
    /// The last committed state.
    Live,
    /// The state the running transaction is about to commit.
    InTransaction,
}

/// Resolves which roots reference an extent.
pub trait BackrefResolver: Send + Sync {
    /// Returns every root referencing the extent at `bytenr` as of `seq`.
    fn find_all_roots(&self, bytenr: u64, seq: TimeSeq) -> Result<RootSet>;

    /// Called under the commit lock once a transaction's quota rows are
    /// durable. Hosts that keep a separate committed view switch it here, so
    /// [`TimeSeq::Live`] never lags behind the accounted state.
    fn switch_commit_roots(&self, _generation: u64) {}
}

/// One extent item as the rescan sees it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExtentItem {
    /// Start address.
    pub bytenr: u64,
    /// Length in bytes.
    pub num_bytes: u64,
}

/// A batch of consecutive extent items, in ascending `bytenr` order.
#[derive(Clone, Debug, Default)]
pub struct ExtentLeaf {
    /// Items in the leaf.
    pub items: Vec<ExtentItem>,
}

impl ExtentLeaf {
    /// Address of the last item, if any.
    pub fn last_bytenr(&self) -> Option<u64> {
        self.items.last().map(|item| item.bytenr)
    }
}

/// Read access to the committed extent tree.
pub trait ExtentScanner: Send + Sync {
    /// Returns the first leaf holding an item at or after `from`.
    ///
    /// Returns `None` once no item at or after `from` exists.
    fn next_leaf(&self, from: u64) -> Result<Option<ExtentLeaf>>;

    /// Lists the subvolume roots that get a level-0 group on enable.
    fn subvolume_roots(&self) -> Result<Vec<RootId>>;
}
