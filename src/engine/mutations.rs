use std::collections::{HashMap, HashSet};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{COMMITS_TOTAL, CONFLICTS_TOTAL};

use super::conflict::{check, validate_payload, Outcome};
use super::error::ConflictKind;
use super::store::{RecordStore, Slot};
use super::{Engine, EngineError};

/// A lock held for the duration of one transaction.
enum Held {
    /// Records the transaction mutates.
    Write(OwnedRwLockWriteGuard<Option<Record>>),
    /// Parents the transaction only references; held so they cannot be deleted under us.
    Read(OwnedRwLockReadGuard<Option<Record>>),
}

impl Held {
    fn current(&self) -> Option<&Record> {
        match self {
            Held::Write(g) => g.as_ref(),
            Held::Read(g) => g.as_ref(),
        }
    }

    fn cell_mut(&mut self) -> Option<&mut Option<Record>> {
        match self {
            Held::Write(g) => Some(&mut **g),
            Held::Read(_) => None,
        }
    }
}

/// Slots a transaction claimed for its inserts. Unless the transaction applied, whatever is
/// still empty when it ends is removed again, so a failed or cancelled insert leaves no identity.
/// Must be declared before the locks so it drops after them.
struct Claimed<'a> {
    store: &'a RecordStore,
    ids: Vec<Ulid>,
}

impl Drop for Claimed<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.store.discard_vacant(id);
        }
    }
}

impl Engine {
    pub async fn insert(&self, id: Ulid, payload: Payload) -> Result<Record, EngineError> {
        let mut stored = self.commit(vec![WriteIntent::insert(id, payload)]).await?;
        stored
            .pop()
            .ok_or_else(|| EngineError::Invalid(format!("insert of {id} stored nothing")))
    }

    pub async fn update(&self, id: Ulid, expected: Ms, payload: Payload) -> Result<Record, EngineError> {
        let mut stored = self
            .commit(vec![WriteIntent::update(id, expected, payload)])
            .await?;
        stored
            .pop()
            .ok_or_else(|| EngineError::Invalid(format!("update of {id} stored nothing")))
    }

    pub async fn delete(&self, id: Ulid, expected: Ms) -> Result<(), EngineError> {
        self.commit(vec![WriteIntent::delete(id, expected)]).await?;
        Ok(())
    }

    /// Commit `intents` as one all-or-nothing transaction.
    ///
    /// Deletes are applied children-first, inserts and updates parents-first. Every referenced
    /// parent is read-locked and re-validated inside the transaction, so a parent deleted by a
    /// concurrent commit makes the child write fail instead of orphaning it. Returns the stored
    /// records in application order. Nothing is retried.
    pub async fn commit(&self, intents: Vec<WriteIntent>) -> Result<Vec<Record>, EngineError> {
        let result = self.commit_locked(intents).await;
        match &result {
            Ok(_) => metrics::counter!(COMMITS_TOTAL, "outcome" => "ok").increment(1),
            Err(e) => {
                metrics::counter!(COMMITS_TOTAL, "outcome" => e.label()).increment(1);
                if let EngineError::OptimisticConflict { .. } = e {
                    metrics::counter!(CONFLICTS_TOTAL, "kind" => e.label()).increment(1);
                }
            }
        }
        result
    }

    async fn commit_locked(&self, intents: Vec<WriteIntent>) -> Result<Vec<Record>, EngineError> {
        if intents.is_empty() {
            return Ok(Vec::new());
        }
        if intents.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("transaction too large"));
        }
        let mut targets = HashSet::with_capacity(intents.len());
        for intent in &intents {
            if !targets.insert(intent.target) {
                return Err(EngineError::Invalid(format!(
                    "{} is written twice in one transaction",
                    intent.target
                )));
            }
            if let Some(payload) = intent.payload() {
                validate_payload(payload)?;
            }
        }

        let _shared = self.gate.read().await;

        let mut claimed = Claimed {
            store: &self.store,
            ids: Vec::new(),
        };
        let mut locks = self.acquire(&intents, &targets, &mut claimed).await?;

        // Conflict checks against the locked state, staging the post-commit view.
        let mut staged: Vec<(Ulid, Option<Record>)> = Vec::with_capacity(intents.len());
        for intent in intents {
            let current = locks.get(&intent.target).and_then(Held::current);
            let next = match intent.op {
                Operation::Insert { payload } => {
                    if current.is_some() {
                        return Err(EngineError::DuplicateIdentity(intent.target));
                    }
                    Some(Record {
                        id: intent.target,
                        last_modified: self.clock.next_after(None),
                        payload,
                    })
                }
                Operation::Update { expected, payload } => {
                    let prev = verify(intent.target, current, expected)?;
                    Some(Record {
                        id: intent.target,
                        last_modified: self.clock.next_after(Some(prev.last_modified)),
                        payload,
                    })
                }
                Operation::Delete { expected } => {
                    verify(intent.target, current, expected)?;
                    None
                }
            };
            staged.push((intent.target, next));
        }

        self.check_references(&staged, &locks)?;

        // Deletes children-first, then writes parents-first.
        let mut removals: Vec<(Ulid, EntityKind)> = Vec::new();
        let mut puts: Vec<Record> = Vec::new();
        for (id, next) in staged {
            match next {
                Some(record) => puts.push(record),
                None => {
                    let kind = locks
                        .get(&id)
                        .and_then(Held::current)
                        .map(Record::kind)
                        .ok_or_else(|| EngineError::Invalid(format!("{id} vanished while locked")))?;
                    removals.push((id, kind));
                }
            }
        }
        removals.sort_by_key(|(_, kind)| std::cmp::Reverse(kind.tier()));
        puts.sort_by_key(|r| r.kind().tier());

        let changes: Vec<Change> = removals
            .iter()
            .map(|(id, kind)| Change::Remove { id: *id, kind: *kind })
            .chain(puts.iter().cloned().map(Change::Put))
            .collect();
        self.wal_append(Commit { changes }).await?;

        for (id, _) in &removals {
            let cell = locks.get_mut(id).and_then(Held::cell_mut);
            if let Some(old) = cell.and_then(Option::take) {
                self.store.unlink(&old);
            }
        }
        for record in &puts {
            if let Some(cell) = locks.get_mut(&record.id).and_then(Held::cell_mut) {
                if let Some(old) = cell.as_ref() {
                    self.store.unlink(old);
                }
                self.store.link(record);
                *cell = Some(record.clone());
            }
        }
        claimed.ids.clear();

        debug!(
            removed = removals.len(),
            stored = puts.len(),
            "committed transaction"
        );
        Ok(puts)
    }

    /// Lock every target (write) and every referenced parent (read), parents' tier before
    /// children's and by id within a tier. One global order keeps transactions deadlock-free.
    async fn acquire(
        &self,
        intents: &[WriteIntent],
        targets: &HashSet<Ulid>,
        claimed: &mut Claimed<'_>,
    ) -> Result<HashMap<Ulid, Held>, EngineError> {
        let mut plan: HashMap<Ulid, (Slot, bool)> = HashMap::new();

        for intent in intents {
            let slot = match &intent.op {
                Operation::Insert { payload } => {
                    let (slot, created) = self.store.claim(intent.target, payload.kind())?;
                    if created {
                        claimed.ids.push(intent.target);
                    }
                    slot
                }
                Operation::Update { payload, .. } => {
                    let slot = self.store.slot(&intent.target).ok_or(
                        EngineError::OptimisticConflict {
                            id: intent.target,
                            kind: ConflictKind::TargetGone,
                        },
                    )?;
                    if slot.kind != payload.kind() {
                        return Err(EngineError::kind_mismatch(intent.target, payload.kind(), slot.kind));
                    }
                    slot
                }
                Operation::Delete { .. } => self.store.slot(&intent.target).ok_or(
                    EngineError::OptimisticConflict {
                        id: intent.target,
                        kind: ConflictKind::TargetGone,
                    },
                )?,
            };
            plan.insert(intent.target, (slot, true));

            if let Some(payload) = intent.payload() {
                for (parent, kind) in payload.parents() {
                    if targets.contains(&parent) || plan.contains_key(&parent) {
                        continue;
                    }
                    let slot = self.store.slot(&parent).ok_or(EngineError::MissingParent {
                        child: intent.target,
                        parent,
                    })?;
                    if slot.kind != kind {
                        return Err(EngineError::kind_mismatch(parent, kind, slot.kind));
                    }
                    plan.insert(parent, (slot, false));
                }
            }
        }

        let mut order: Vec<(Ulid, Slot, bool)> = plan
            .into_iter()
            .map(|(id, (slot, write))| (id, slot, write))
            .collect();
        order.sort_by_key(|(id, slot, _)| (slot.kind.tier(), *id));

        let mut locks = HashMap::with_capacity(order.len());
        for (id, slot, write) in order {
            let held = if write {
                Held::Write(slot.cell.write_owned().await)
            } else {
                Held::Read(slot.cell.read_owned().await)
            };
            locks.insert(id, held);
        }
        Ok(locks)
    }

    /// Referential integrity of the post-commit view: every parent a stored record references
    /// is live and of the right kind, and no deleted record keeps a live child.
    fn check_references(
        &self,
        staged: &[(Ulid, Option<Record>)],
        locks: &HashMap<Ulid, Held>,
    ) -> Result<(), EngineError> {
        let after = |id: &Ulid| -> Option<&Record> {
            match staged.iter().find(|(sid, _)| sid == id) {
                Some((_, next)) => next.as_ref(),
                None => locks.get(id).and_then(Held::current),
            }
        };

        for (id, next) in staged {
            match next {
                Some(record) => {
                    for (parent, kind) in record.payload.parents() {
                        match after(&parent) {
                            None => {
                                return Err(EngineError::MissingParent { child: *id, parent });
                            }
                            Some(p) if p.kind() != kind => {
                                return Err(EngineError::kind_mismatch(parent, kind, p.kind()));
                            }
                            Some(_) => {}
                        }
                    }
                }
                None => {
                    let remaining: Vec<Ulid> = self
                        .store
                        .children(id)
                        .into_iter()
                        .filter(|child| match staged.iter().find(|(sid, _)| sid == child) {
                            Some((_, None)) => false,
                            Some((_, Some(moved))) => moved.parent_ids().contains(id),
                            None => true,
                        })
                        .collect();
                    if !remaining.is_empty() {
                        return Err(EngineError::DependentRecordsExist {
                            id: *id,
                            children: remaining,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Run the conflict check and hand back the record it validated.
fn verify(id: Ulid, current: Option<&Record>, expected: Ms) -> Result<&Record, EngineError> {
    match (check(current, expected), current) {
        (Outcome::Proceed, Some(record)) => Ok(record),
        (Outcome::Conflict(kind), _) => Err(EngineError::OptimisticConflict { id, kind }),
        (Outcome::Proceed, None) => Err(EngineError::OptimisticConflict {
            id,
            kind: ConflictKind::TargetGone,
        }),
    }
}
