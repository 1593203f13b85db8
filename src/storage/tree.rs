#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::items::{seal, unseal, ValCodec};
use super::keys::QuotaKey;
use crate::primitives::bytes::{buf::Cursor, ord};
use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::{QuotaError, Result};

/// Staged row changes applied atomically by [`QuotaTree::commit`].
///
/// Later operations on the same key replace earlier ones.
#[derive(Clone, Debug, Default)]
pub struct QuotaBatch {
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl QuotaBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a sealed row under `key`.
    pub fn put<V: ValCodec>(&mut self, key: QuotaKey, value: &V) {
        let encoded = key.to_bytes();
        let stored = seal(&encoded, value);
        self.ops.insert(encoded, Some(stored));
    }

    /// Stages removal of `key`.
    pub fn delete(&mut self, key: QuotaKey) {
        self.ops.insert(key.to_bytes(), None);
    }

    /// Stages removal of an already-encoded key.
    pub fn delete_raw(&mut self, key: Vec<u8>) {
        self.ops.insert(key, None);
    }

    /// Drops every staged operation.
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the staged value for `key`: `Some(None)` means a staged delete.
    pub fn staged(&self, key: &QuotaKey) -> Option<Option<&[u8]>> {
        self.ops
            .get(&key.to_bytes())
            .map(|value| value.as_deref())
    }

    /// Iterates staged operations in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.ops
            .iter()
            .map(|(key, value)| (key.as_slice(), value.as_deref()))
    }
}

/// The external tree that persists quota rows.
///
/// `commit` must apply a batch atomically: after a failure the tree still
/// holds exactly the rows of the previous generation.
pub trait QuotaTree: Send + Sync {
    /// Generation of the last committed transaction.
    fn generation(&self) -> u64;

    /// Reads the committed value stored under `key`.
    fn get(&self, key: &QuotaKey) -> Result<Option<Vec<u8>>>;

    /// Returns every committed row in key order.
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies `batch` and advances the tree to `generation`.
    fn commit(&self, generation: u64, batch: &QuotaBatch) -> Result<()>;
}

/// Reads and verifies one typed row.
pub fn read_row<V: ValCodec>(tree: &dyn QuotaTree, key: QuotaKey) -> Result<Option<V>> {
    match tree.get(&key)? {
        Some(stored) => unseal(&key.to_bytes(), &stored).map(Some),
        None => Ok(None),
    }
}

#[derive(Clone, Debug, Default)]
struct TreeState {
    generation: u64,
    rows: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl TreeState {
    fn check_generation(&self, generation: u64) -> Result<()> {
        if generation <= self.generation {
            return Err(QuotaError::InvalidState(
                "commit generation must advance the tree",
            ));
        }
        Ok(())
    }

    fn apply(&mut self, generation: u64, batch: &QuotaBatch) {
        for (key, value) in batch.iter() {
            match value {
                Some(value) => {
                    self.rows.insert(key.to_vec(), value.to_vec());
                }
                None => {
                    self.rows.remove(key);
                }
            }
        }
        self.generation = generation;
    }
}

/// In-memory quota tree with commit-failure injection for tests.
#[derive(Default)]
pub struct MemQuotaTree {
    state: Mutex<TreeState>,
    fail_commits: AtomicU32,
    commits: AtomicU64,
}

impl MemQuotaTree {
    /// Creates an empty tree at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commits fail with an I/O error and change nothing.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Returns a new tree holding a copy of the committed rows.
    ///
    /// Models the state that survives a crash at this instant.
    pub fn fork(&self) -> MemQuotaTree {
        let state = self.state.lock().clone();
        MemQuotaTree {
            state: Mutex::new(state),
            fail_commits: AtomicU32::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Writes a raw row outside any transaction.
    pub fn insert_raw(&self, key: Vec<u8>, value: Vec<u8>) {
        self.state.lock().rows.insert(key, value);
    }

    /// Number of committed rows.
    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Number of successful commits since creation.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl QuotaTree for MemQuotaTree {
    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn get(&self, key: &QuotaKey) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().rows.get(&key.to_bytes()).cloned())
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, generation: u64, batch: &QuotaBatch) -> Result<()> {
        let mut state = self.state.lock();
        state.check_generation(generation)?;
        let injected = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(QuotaError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected commit failure",
            )));
        }
        state.apply(generation, batch);
        self.commits.fetch_add(1, Ordering::Relaxed);
        debug!(generation, ops = batch.len(), "quota_tree.mem.committed");
        Ok(())
    }
}

const SNAPSHOT_MAGIC: &[u8; 4] = b"SQGT";
const SNAPSHOT_FORMAT: u16 = 1;

/// File-backed quota tree.
///
/// Every commit writes a complete snapshot to a sibling temp file, syncs it
/// and renames it over the live file.
pub struct FileQuotaTree {
    path: PathBuf,
    state: Mutex<TreeState>,
}

impl FileQuotaTree {
    /// Opens the snapshot at `path`, or starts empty when it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match File::open(&path) {
            Ok(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                decode_snapshot(&bytes)?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => TreeState::default(),
            Err(err) => return Err(err.into()),
        };
        debug!(
            path = %path.display(),
            generation = state.generation,
            rows = state.rows.len(),
            "quota_tree.file.opened"
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the live snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl QuotaTree for FileQuotaTree {
    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn get(&self, key: &QuotaKey) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().rows.get(&key.to_bytes()).cloned())
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, generation: u64, batch: &QuotaBatch) -> Result<()> {
        let mut state = self.state.lock();
        state.check_generation(generation)?;
        let mut next = state.clone();
        next.apply(generation, batch);
        let bytes = encode_snapshot(&next);
        let tmp = self.temp_path();
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *state = next;
        debug!(generation, ops = batch.len(), "quota_tree.file.committed");
        Ok(())
    }
}

fn encode_snapshot(state: &TreeState) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SNAPSHOT_MAGIC);
    ord::push_u16_be(&mut out, SNAPSHOT_FORMAT);
    ord::push_u64_be(&mut out, state.generation);
    ord::push_u64_be(&mut out, state.rows.len() as u64);
    for (key, value) in &state.rows {
        ord::push_u32_be(&mut out, key.len() as u32);
        out.extend_from_slice(key);
        ord::push_u32_be(&mut out, value.len() as u32);
        out.extend_from_slice(value);
    }
    let mut crc = Crc32Fast::default();
    crc.update(&out);
    ord::push_u32_be(&mut out, crc.finalize());
    out
}

fn decode_snapshot(bytes: &[u8]) -> Result<TreeState> {
    let split = bytes
        .len()
        .checked_sub(4)
        .ok_or(QuotaError::Corruption("quota snapshot truncated"))?;
    let (body, tail) = bytes.split_at(split);
    let mut crc = Crc32Fast::default();
    crc.update(body);
    if crc.finalize() != ord::get_u32_be(tail) {
        return Err(QuotaError::Corruption("quota snapshot checksum mismatch"));
    }
    let mut cur = Cursor::new(body);
    if cur.take(4)? != SNAPSHOT_MAGIC {
        return Err(QuotaError::Corruption("quota snapshot magic mismatch"));
    }
    if cur.u16()? != SNAPSHOT_FORMAT {
        return Err(QuotaError::Corruption("unsupported quota snapshot format"));
    }
    let generation = cur.u64()?;
    let count = cur.u64()?;
    let mut rows = BTreeMap::new();
    for _ in 0..count {
        let klen = cur.u32()? as usize;
        let key = cur.take(klen)?.to_vec();
        let vlen = cur.u32()? as usize;
        let value = cur.take(vlen)?.to_vec();
        rows.insert(key, value);
    }
    cur.finish()?;
    Ok(TreeState { generation, rows })
}
