#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::Serialize;
use smallvec::SmallVec;

use crate::storage::{InfoItem, LimitItem};
use crate::types::{QgroupId, QuotaError, Result};

/// Limit flag: `max_rfer` is in force.
pub const LIMIT_MAX_RFER: u64 = 1 << 0;
/// Limit flag: `max_excl` is in force.
pub const LIMIT_MAX_EXCL: u64 = 1 << 1;
/// Limit flag: `rsv_rfer` is in force.
pub const LIMIT_RSV_RFER: u64 = 1 << 2;
/// Limit flag: `rsv_excl` is in force.
pub const LIMIT_RSV_EXCL: u64 = 1 << 3;

/// Limit value that clears the matching field and its flag.
pub const CLEAR_LIMIT: u64 = u64::MAX;

/// Referenced and exclusive byte totals of one group.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QgroupCounters {
    /// Referenced bytes.
    pub rfer: u64,
    /// Referenced bytes, compressed.
    pub rfer_cmpr: u64,
    /// Exclusive bytes.
    pub excl: u64,
    /// Exclusive bytes, compressed.
    pub excl_cmpr: u64,
}

/// Configured limits of one group.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QgroupLimit {
    /// Which fields are in force (`LIMIT_*`).
    pub flags: u64,
    /// Referenced-bytes limit.
    pub max_rfer: u64,
    /// Exclusive-bytes limit.
    pub max_excl: u64,
    /// Referenced-bytes reserve.
    pub rsv_rfer: u64,
    /// Exclusive-bytes reserve.
    pub rsv_excl: u64,
}

impl QgroupLimit {
    /// Limit on referenced bytes.
    pub fn with_max_rfer(mut self, bytes: u64) -> Self {
        self.flags |= LIMIT_MAX_RFER;
        self.max_rfer = bytes;
        self
    }

    /// Limit on exclusive bytes.
    pub fn with_max_excl(mut self, bytes: u64) -> Self {
        self.flags |= LIMIT_MAX_EXCL;
        self.max_excl = bytes;
        self
    }

    /// Applies an update: every field flagged in `update` is set, or cleared
    /// when its value is [`CLEAR_LIMIT`].
    pub fn apply(&mut self, update: &QgroupLimit) {
        let fields: [(u64, u64, &mut u64); 4] = [
            (LIMIT_MAX_RFER, update.max_rfer, &mut self.max_rfer),
            (LIMIT_MAX_EXCL, update.max_excl, &mut self.max_excl),
            (LIMIT_RSV_RFER, update.rsv_rfer, &mut self.rsv_rfer),
            (LIMIT_RSV_EXCL, update.rsv_excl, &mut self.rsv_excl),
        ];
        let mut flags = self.flags;
        for (flag, value, slot) in fields {
            if update.flags & flag == 0 {
                continue;
            }
            if value == CLEAR_LIMIT {
                flags &= !flag;
                *slot = 0;
            } else {
                flags |= flag;
                *slot = value;
            }
        }
        self.flags = flags;
    }

    pub(crate) fn to_item(self) -> LimitItem {
        LimitItem {
            flags: self.flags,
            max_rfer: self.max_rfer,
            max_excl: self.max_excl,
            rsv_rfer: self.rsv_rfer,
            rsv_excl: self.rsv_excl,
        }
    }

    pub(crate) fn from_item(item: &LimitItem) -> Self {
        Self {
            flags: item.flags,
            max_rfer: item.max_rfer,
            max_excl: item.max_excl,
            rsv_rfer: item.rsv_rfer,
            rsv_excl: item.rsv_excl,
        }
    }
}

/// Slot index of a group inside the arena.
pub type Slot = usize;

/// One accounting group.
#[derive(Clone, Debug)]
pub struct Qgroup {
    /// Group identifier.
    pub id: QgroupId,
    /// Byte totals.
    pub counters: QgroupCounters,
    /// Configured limits.
    pub limit: QgroupLimit,
    /// Bytes reserved by in-flight writes.
    pub reserved: u64,
    pub(crate) parents: SmallVec<[Slot; 4]>,
    pub(crate) members: SmallVec<[Slot; 4]>,
    dirty: bool,
}

impl Qgroup {
    fn new(id: QgroupId) -> Self {
        Self {
            id,
            counters: QgroupCounters::default(),
            limit: QgroupLimit::default(),
            reserved: 0,
            parents: SmallVec::new(),
            members: SmallVec::new(),
            dirty: false,
        }
    }

    /// Whether the group still has members.
    pub fn has_members(&self) -> bool {
        !self.members.is_empty()
    }

    /// Whether the group belongs to at least one parent.
    pub fn has_parents(&self) -> bool {
        !self.parents.is_empty()
    }

    pub(crate) fn info_item(&self, generation: u64) -> InfoItem {
        InfoItem {
            generation,
            rfer: self.counters.rfer,
            rfer_cmpr: self.counters.rfer_cmpr,
            excl: self.counters.excl,
            excl_cmpr: self.counters.excl_cmpr,
        }
    }
}

/// In-memory DAG of groups.
///
/// Nodes live in an arena indexed by [`Slot`]; freed slots are reused. Edges
/// point from member to parent and back, and always go from a lower to a
/// strictly higher level, which keeps the graph acyclic.
#[derive(Default)]
pub struct QgroupGraph {
    slots: Vec<Option<Qgroup>>,
    free: Vec<Slot>,
    index: BTreeMap<QgroupId, Slot>,
    dirty: Vec<Slot>,
}

impl QgroupGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true when no group exists.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Looks up the slot of `id`.
    pub fn slot(&self, id: QgroupId) -> Option<Slot> {
        self.index.get(&id).copied()
    }

    /// Returns the group stored under `id`.
    pub fn get(&self, id: QgroupId) -> Option<&Qgroup> {
        self.slot(id).map(|slot| self.node(slot))
    }

    /// Returns the group in `slot`.
    ///
    /// Slots handed out by this graph stay valid until the group is removed.
    pub fn node(&self, slot: Slot) -> &Qgroup {
        match self.slots.get(slot) {
            Some(Some(group)) => group,
            _ => panic!("qgroup slot {slot} is vacant"),
        }
    }

    pub(crate) fn node_mut(&mut self, slot: Slot) -> &mut Qgroup {
        match self.slots.get_mut(slot) {
            Some(Some(group)) => group,
            _ => panic!("qgroup slot {slot} is vacant"),
        }
    }

    /// Iterates groups in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Qgroup> + '_ {
        self.index.values().map(move |&slot| self.node(slot))
    }

    /// Ids of the groups `id` belongs to.
    pub fn parents_of(&self, id: QgroupId) -> Vec<QgroupId> {
        self.slot(id)
            .map(|slot| {
                let mut ids: Vec<_> = self
                    .node(slot)
                    .parents
                    .iter()
                    .map(|&p| self.node(p).id)
                    .collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Ids of the groups that belong to `id`.
    pub fn members_of(&self, id: QgroupId) -> Vec<QgroupId> {
        self.slot(id)
            .map(|slot| {
                let mut ids: Vec<_> = self
                    .node(slot)
                    .members
                    .iter()
                    .map(|&m| self.node(m).id)
                    .collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Adds an empty group.
    pub fn create(&mut self, id: QgroupId) -> Result<Slot> {
        if self.index.contains_key(&id) {
            return Err(QuotaError::AlreadyExists("qgroup"));
        }
        Ok(self.insert_new(id))
    }

    /// Returns the slot of `id`, creating the group when absent.
    pub fn get_or_create(&mut self, id: QgroupId) -> Slot {
        match self.slot(id) {
            Some(slot) => slot,
            None => self.insert_new(id),
        }
    }

    fn insert_new(&mut self, id: QgroupId) -> Slot {
        let group = Qgroup::new(id);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(group);
                slot
            }
            None => {
                self.slots.push(Some(group));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        slot
    }

    /// Removes a group without members, detaching it from its parents.
    pub fn remove(&mut self, id: QgroupId) -> Result<Qgroup> {
        let slot = self.slot(id).ok_or(QuotaError::NotFound("qgroup"))?;
        if self.node(slot).has_members() {
            return Err(QuotaError::Busy(id));
        }
        let parents = std::mem::take(&mut self.node_mut(slot).parents);
        for parent in parents {
            self.node_mut(parent).members.retain(|m| *m != slot);
        }
        self.index.remove(&id);
        self.dirty.retain(|s| *s != slot);
        self.free.push(slot);
        match self.slots[slot].take() {
            Some(group) => Ok(group),
            None => Err(QuotaError::NotFound("qgroup")),
        }
    }

    /// Validates a prospective edge without changing anything.
    pub fn check_relation(&self, member: QgroupId, parent: QgroupId, adding: bool) -> Result<(Slot, Slot)> {
        if adding && member.level >= parent.level {
            return Err(QuotaError::InvalidLevel { member, parent });
        }
        let m = self.slot(member).ok_or(QuotaError::NotFound("member qgroup"))?;
        let p = self.slot(parent).ok_or(QuotaError::NotFound("parent qgroup"))?;
        let exists = self.node(m).parents.contains(&p);
        match (adding, exists) {
            (true, true) => Err(QuotaError::AlreadyExists("qgroup relation")),
            (false, false) => Err(QuotaError::NotFound("qgroup relation")),
            _ => Ok((m, p)),
        }
    }

    /// Adds the edge `member -> parent`.
    pub fn add_relation(&mut self, member: QgroupId, parent: QgroupId) -> Result<(Slot, Slot)> {
        let (m, p) = self.check_relation(member, parent, true)?;
        self.node_mut(m).parents.push(p);
        self.node_mut(p).members.push(m);
        Ok((m, p))
    }

    /// Removes the edge `member -> parent`.
    pub fn del_relation(&mut self, member: QgroupId, parent: QgroupId) -> Result<(Slot, Slot)> {
        let (m, p) = self.check_relation(member, parent, false)?;
        self.node_mut(m).parents.retain(|s| *s != p);
        self.node_mut(p).members.retain(|s| *s != m);
        Ok((m, p))
    }

    /// Queues `slot` for the next flush.
    pub fn mark_dirty(&mut self, slot: Slot) {
        let group = self.node_mut(slot);
        if !group.dirty {
            group.dirty = true;
            self.dirty.push(slot);
        }
    }

    /// Marks every group dirty.
    pub fn mark_all_dirty(&mut self) {
        let slots: Vec<Slot> = self.index.values().copied().collect();
        for slot in slots {
            self.mark_dirty(slot);
        }
    }

    /// Number of groups waiting to be flushed.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Drains the dirty list, clearing each group's dirty bit.
    pub fn take_dirty(&mut self) -> Vec<Slot> {
        let dirty = std::mem::take(&mut self.dirty);
        for &slot in &dirty {
            self.node_mut(slot).dirty = false;
        }
        dirty
    }

    /// Zeroes every group's byte totals, keeping limits and reservations.
    pub fn reset_counters(&mut self) {
        let slots: Vec<Slot> = self.index.values().copied().collect();
        for slot in slots {
            self.node_mut(slot).counters = QgroupCounters::default();
            self.mark_dirty(slot);
        }
    }
}
