use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use ulid::Ulid;

use crate::deferred::{deferred, DeferredResult};
use crate::limits::*;
use crate::model::*;
use crate::observability::QUERY_DURATION_SECONDS;

use super::{Engine, EngineError};

impl Engine {
    /// Live records of one kind, sorted by id.
    pub async fn list_kind(&self, kind: EntityKind) -> Vec<Record> {
        let mut out = Vec::new();
        for (_, cell) in self.store.cells_of_kind(kind) {
            if let Some(record) = cell.read().await.as_ref() {
                out.push(record.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Live appointments of a reservation, ordered by start time.
    pub async fn appointments_of(&self, reservation_id: &Ulid) -> Result<Vec<Record>, EngineError> {
        match self.get(reservation_id).await {
            Some(r) if r.kind() == EntityKind::Reservation => {}
            Some(r) => {
                return Err(EngineError::kind_mismatch(
                    *reservation_id,
                    EntityKind::Reservation,
                    r.kind(),
                ));
            }
            None => return Err(EngineError::NotFound(*reservation_id)),
        }

        let mut out = Vec::new();
        for child in self.store.children(reservation_id) {
            if let Some(record) = self.get(&child).await
                && record.as_appointment().is_some()
            {
                out.push(record);
            }
        }
        out.sort_by_key(|r| r.as_appointment().map(|a| a.span.start));
        Ok(out)
    }

    /// Reservations matching `request`, sorted by id.
    ///
    /// Every record is read under its own lock, so a query racing with writers may see some
    /// records before and some after a concurrent commit. It never sees a half-applied record.
    pub async fn resolve(&self, request: &QueryRequest) -> Result<Vec<Record>, EngineError> {
        if let Some(range) = &request.range {
            if range.start >= range.end {
                return Err(EngineError::Invalid("query range is empty".into()));
            }
            super::conflict::validate_bounds(range)?;
            if range.duration_ms() > MAX_QUERY_WINDOW_MS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }
        if request.resource_ids.len() > MAX_IN_CLAUSE_IDS
            || request.event_types.len() > MAX_IN_CLAUSE_IDS
        {
            return Err(EngineError::LimitExceeded("too many filter values"));
        }

        let scoped = request.range.is_some() || !request.resource_ids.is_empty();
        let candidates: BTreeSet<Ulid> = if !request.resource_ids.is_empty() {
            let mut found = BTreeSet::new();
            for rid in &request.resource_ids {
                match self.get(rid).await {
                    Some(r) if r.kind() == EntityKind::Resource => {}
                    _ => return Err(EngineError::NotFound(*rid)),
                }
                for child in self.store.children(rid) {
                    self.collect_reservation(request, &child, &mut found).await;
                }
            }
            found
        } else if scoped {
            let mut found = BTreeSet::new();
            for (id, _) in self.store.cells_of_kind(EntityKind::Appointment) {
                self.collect_reservation(request, &id, &mut found).await;
            }
            found
        } else {
            self.store
                .cells_of_kind(EntityKind::Reservation)
                .into_iter()
                .map(|(id, _)| id)
                .collect()
        };

        let mut out = Vec::with_capacity(candidates.len());
        for id in candidates {
            // A reservation deleted since its appointment was read is simply skipped.
            if let Some(record) = self.get(&id).await
                && let Some(reservation) = record.as_reservation()
                && request.matches_reservation(reservation)
            {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn collect_reservation(
        &self,
        request: &QueryRequest,
        appointment_id: &Ulid,
        found: &mut BTreeSet<Ulid>,
    ) {
        if let Some(record) = self.get(appointment_id).await
            && let Some(app) = record.as_appointment()
            && request.matches_appointment(app)
        {
            found.insert(app.reservation_id);
        }
    }
}

/// Runs event queries on the tokio runtime and hands back deferred results.
///
/// Applies no permission checks; see [`crate::permission::PermissionFilter`].
#[derive(Clone)]
pub struct QueryExecutor {
    engine: Arc<Engine>,
    runtime: tokio::runtime::Handle,
}

impl QueryExecutor {
    pub fn new(engine: Arc<Engine>, runtime: tokio::runtime::Handle) -> Self {
        Self { engine, runtime }
    }

    /// Start resolving `request` and return immediately. The result settles on a runtime
    /// worker, either with the whole collection or with the error; never partially.
    pub fn submit(&self, request: QueryRequest) -> DeferredResult<Vec<Record>> {
        let (completer, result) = deferred();
        let engine = self.engine.clone();
        self.runtime.spawn(async move {
            let started = Instant::now();
            let outcome = engine.resolve(&request).await;
            metrics::histogram!(QUERY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
            match &outcome {
                Ok(records) => debug!(matched = records.len(), "query resolved"),
                Err(e) => debug!("query failed: {e}"),
            }
            completer.settle(outcome);
        });
        result
    }
}
