mod conflict;
mod error;
mod mutations;
mod queries;
mod stamp;
mod store;

pub use conflict::{check, Outcome};
pub use error::{ConflictKind, EngineError};
pub use queries::QueryExecutor;
pub use stamp::StampClock;
pub use store::{RecordStore, SharedRecord, Slot};

use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Wal, WalHandle};

/// The authoritative record store. All mutation goes through [`Engine::commit`], which is
/// also the only code that draws stamps from the clock.
pub struct Engine {
    pub(crate) store: RecordStore,
    wal: WalHandle,
    clock: StampClock,
    /// Commits hold it shared; compaction holds it exclusively so no commit lands between
    /// the snapshot and the WAL rewrite.
    gate: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> std::io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let store = RecordStore::new();
        let clock = StampClock::new();
        for commit in &commits {
            for change in &commit.changes {
                store
                    .replay(change)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                match change {
                    Change::Put(record) => clock.observe(record.last_modified),
                    Change::Clock { high_water } => clock.observe(*high_water),
                    Change::Remove { .. } => {}
                }
            }
        }
        info!(
            "replayed {} commit(s) from {}",
            commits.len(),
            wal_path.display()
        );

        Ok(Self {
            store,
            wal: WalHandle::spawn(wal),
            clock,
            gate: RwLock::new(()),
        })
    }

    /// Current version of a record, read under its own lock.
    pub async fn get(&self, id: &Ulid) -> Option<Record> {
        let slot = self.store.slot(id)?;
        let guard = slot.cell.read().await;
        guard.clone()
    }

    pub(crate) async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        self.wal
            .append(commit)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Rewrite the WAL with one `Put` per live record, parents before children.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;
        let mut cells = self.store.all_cells();
        cells.sort_by_key(|(id, slot)| (slot.kind.tier(), *id));

        let mut commits = Vec::with_capacity(cells.len() + 1);
        commits.push(Commit {
            changes: vec![Change::Clock {
                high_water: self.clock.current(),
            }],
        });
        for (_, slot) in cells {
            let guard = slot.cell.read().await;
            if let Some(record) = guard.as_ref() {
                commits.push(Commit {
                    changes: vec![Change::Put(record.clone())],
                });
            }
        }

        self.wal
            .compact(commits)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
