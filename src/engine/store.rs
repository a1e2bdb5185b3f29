use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// One lockable record cell. `None` means the identity existed but has been deleted.
pub type SharedRecord = Arc<RwLock<Option<Record>>>;

#[derive(Clone)]
pub struct Slot {
    pub kind: EntityKind,
    pub cell: SharedRecord,
}

/// Identity → record cell, plus the parent → children link index.
pub struct RecordStore {
    slots: DashMap<Ulid, Slot>,
    children: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            children: DashMap::new(),
        }
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot(&self, id: &Ulid) -> Option<Slot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Fetch the cell for `id`, creating an empty one for a never-seen identity.
    /// An identity keeps its kind forever, even across delete and re-insert.
    pub fn slot_or_create(&self, id: Ulid, kind: EntityKind) -> Result<Slot, EngineError> {
        self.claim(id, kind).map(|(slot, _)| slot)
    }

    /// Like [`slot_or_create`](Self::slot_or_create), also reporting whether the slot is new.
    pub fn claim(&self, id: Ulid, kind: EntityKind) -> Result<(Slot, bool), EngineError> {
        match self.slots.entry(id) {
            Entry::Occupied(e) => {
                let slot = e.get();
                if slot.kind != kind {
                    return Err(EngineError::kind_mismatch(id, kind, slot.kind));
                }
                Ok((slot.clone(), false))
            }
            Entry::Vacant(e) => {
                let slot = Slot {
                    kind,
                    cell: Arc::new(RwLock::new(None)),
                };
                e.insert(slot.clone());
                Ok((slot, true))
            }
        }
    }

    /// Drop the slot for `id` if it is empty and nobody else holds its cell.
    /// Used to undo slots claimed by a transaction that stored nothing in them.
    pub fn discard_vacant(&self, id: &Ulid) -> bool {
        self.slots
            .remove_if(id, |_, slot| {
                Arc::strong_count(&slot.cell) == 1
                    && slot.cell.try_read().is_ok_and(|cell| cell.is_none())
            })
            .is_some()
    }

    /// Cells of one kind, cloned out so no shard lock is held across an await.
    pub fn cells_of_kind(&self, kind: EntityKind) -> Vec<(Ulid, SharedRecord)> {
        self.slots
            .iter()
            .filter(|e| e.value().kind == kind)
            .map(|e| (*e.key(), e.value().cell.clone()))
            .collect()
    }

    pub fn all_cells(&self) -> Vec<(Ulid, Slot)> {
        self.slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    // ── Children index ───────────────────────────────────────

    pub fn children(&self, parent_id: &Ulid) -> Vec<Ulid> {
        self.children
            .get(parent_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Register `record` as a child of every parent it references.
    pub fn link(&self, record: &Record) {
        for parent in record.parent_ids() {
            let mut kids = self.children.entry(parent).or_default();
            if !kids.contains(&record.id) {
                kids.push(record.id);
            }
        }
    }

    pub fn unlink(&self, record: &Record) {
        for parent in record.parent_ids() {
            if let Some(mut kids) = self.children.get_mut(&parent) {
                kids.retain(|c| c != &record.id);
            }
        }
        self.children.remove_if(&record.id, |_, kids| kids.is_empty());
    }

    // ── Replay ───────────────────────────────────────────────

    /// Apply a replayed change. The store is not shared yet, so `try_write` never contends.
    pub fn replay(&self, change: &Change) -> Result<(), EngineError> {
        match change {
            Change::Put(record) => {
                let slot = self.slot_or_create(record.id, record.kind())?;
                let mut guard = slot
                    .cell
                    .try_write()
                    .map_err(|_| EngineError::WalError("replay: contended record".into()))?;
                if let Some(old) = guard.as_ref() {
                    self.unlink(old);
                }
                self.link(record);
                *guard = Some(record.clone());
            }
            Change::Remove { id, kind } => {
                let slot = self.slot_or_create(*id, *kind)?;
                let mut guard = slot
                    .cell
                    .try_write()
                    .map_err(|_| EngineError::WalError("replay: contended record".into()))?;
                if let Some(old) = guard.take() {
                    self.unlink(&old);
                }
            }
            Change::Clock { .. } => {}
        }
        Ok(())
    }
}
