//! Simulated extent world for tests and benchmarks.
//!
//! [`SimExtents`] plays the host: it owns a committed and an in-progress
//! view of extent ownership, answers root lookups for both, serves extent
//! leaves to the rescan, and publishes the in-progress view when the engine
//! switches commit roots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Once;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use crate::qgroup::{BackrefResolver, ExtentItem, ExtentLeaf, ExtentScanner, TimeSeq};
use crate::types::{QuotaError, Result, RootId, RootSet};

/// Installs a stderr `tracing` subscriber once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_qgroup=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct SimExtent {
    num_bytes: u64,
    roots: RootSet,
}

#[derive(Default)]
struct SimState {
    committed: BTreeMap<u64, SimExtent>,
    current: BTreeMap<u64, SimExtent>,
    subvolumes: BTreeSet<RootId>,
    fail_resolve: Option<u64>,
}

/// In-memory extent ownership with committed and in-transaction views.
pub struct SimExtents {
    state: Mutex<SimState>,
    leaf_items: usize,
}

impl Default for SimExtents {
    fn default() -> Self {
        Self::new()
    }
}

impl SimExtents {
    /// Creates an empty world serving four items per leaf.
    pub fn new() -> Self {
        Self::with_leaf_items(4)
    }

    /// Creates an empty world serving `items` extent items per leaf.
    pub fn with_leaf_items(items: usize) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            leaf_items: items.max(1),
        }
    }

    /// Registers a subvolume root.
    pub fn add_subvolume(&self, root: RootId) {
        self.state.lock().subvolumes.insert(root);
    }

    /// Adds a reference from `root` to the extent at `bytenr` in the
    /// in-progress view, creating the extent if needed.
    pub fn add_ref(&self, bytenr: u64, num_bytes: u64, root: RootId) {
        let mut state = self.state.lock();
        let extent = state.current.entry(bytenr).or_insert_with(|| SimExtent {
            num_bytes,
            roots: RootSet::new(),
        });
        extent.roots.insert(root);
    }

    /// Drops `root`'s reference; the extent disappears with its last one.
    pub fn drop_ref(&self, bytenr: u64, root: RootId) {
        let mut state = self.state.lock();
        let empty = match state.current.get_mut(&bytenr) {
            Some(extent) => {
                extent.roots.remove(&root);
                extent.roots.is_empty()
            }
            None => false,
        };
        if empty {
            state.current.remove(&bytenr);
        }
    }

    /// Makes the in-progress view the committed one.
    pub fn publish(&self) {
        let mut state = self.state.lock();
        state.committed = state.current.clone();
    }

    /// Makes root lookups for `bytenr` fail, or clears the fault.
    pub fn fail_resolve(&self, bytenr: Option<u64>) {
        self.state.lock().fail_resolve = bytenr;
    }

    /// Committed extents as `(bytenr, num_bytes, roots)`.
    pub fn committed_extents(&self) -> Vec<(u64, u64, RootSet)> {
        self.state
            .lock()
            .committed
            .iter()
            .map(|(&bytenr, extent)| (bytenr, extent.num_bytes, extent.roots.clone()))
            .collect()
    }

    /// Roots currently referencing `bytenr` in the in-progress view.
    pub fn current_roots(&self, bytenr: u64) -> RootSet {
        self.state
            .lock()
            .current
            .get(&bytenr)
            .map(|extent| extent.roots.clone())
            .unwrap_or_default()
    }
}

impl BackrefResolver for SimExtents {
    fn find_all_roots(&self, bytenr: u64, seq: TimeSeq) -> Result<RootSet> {
        let state = self.state.lock();
        if state.fail_resolve == Some(bytenr) {
            return Err(QuotaError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected backref failure",
            )));
        }
        let view = match seq {
            TimeSeq::Live => &state.committed,
            TimeSeq::InTransaction => &state.current,
        };
        Ok(view
            .get(&bytenr)
            .map(|extent| extent.roots.clone())
            .unwrap_or_default())
    }

    fn switch_commit_roots(&self, _generation: u64) {
        self.publish();
    }
}

impl ExtentScanner for SimExtents {
    fn next_leaf(&self, from: u64) -> Result<Option<ExtentLeaf>> {
        let state = self.state.lock();
        let items: Vec<ExtentItem> = state
            .committed
            .range(from..)
            .take(self.leaf_items)
            .map(|(&bytenr, extent)| ExtentItem {
                bytenr,
                num_bytes: extent.num_bytes,
            })
            .collect();
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExtentLeaf { items }))
    }

    fn subvolume_roots(&self) -> Result<Vec<RootId>> {
        Ok(self.state.lock().subvolumes.iter().copied().collect())
    }
}

/// Seeded generator of extent workloads.
pub struct Workload {
    rng: ChaCha8Rng,
    roots: Vec<RootId>,
    next_bytenr: u64,
}

impl Workload {
    /// Creates a generator over `roots` seeded with `seed`.
    pub fn new(seed: u64, roots: Vec<RootId>) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            roots,
            next_bytenr: 4096,
        }
    }

    /// Picks one of the roots.
    pub fn root(&mut self) -> RootId {
        let idx = self.rng.gen_range(0..self.roots.len());
        self.roots[idx]
    }

    /// Picks a random non-empty subset of the roots.
    pub fn root_set(&mut self) -> RootSet {
        let mut set: RootSet = self
            .roots
            .iter()
            .copied()
            .filter(|_| self.rng.gen_bool(0.4))
            .collect();
        if set.is_empty() {
            set.insert(self.root());
        }
        set
    }

    /// Returns a fresh extent address and a size in 4 KiB multiples.
    pub fn extent(&mut self) -> (u64, u64) {
        let bytenr = self.next_bytenr;
        let num_bytes = 4096 * self.rng.gen_range(1..=8u64);
        self.next_bytenr += 1 << 20;
        (bytenr, num_bytes)
    }

    /// Returns `true` with probability `p`.
    pub fn chance(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p)
    }
}
