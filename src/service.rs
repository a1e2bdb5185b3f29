use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use crate::bridge::SyncBridge;
use crate::deferred::DeferredResult;
use crate::engine::{Engine, EngineError, QueryExecutor};
use crate::identity::IdAllocator;
use crate::model::*;
use crate::permission::{Authorizer, Caller, PermissionFilter};

/// One time slot of an event being created. Ids are allocated by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub span: Span,
    pub resources: Vec<Ulid>,
    pub comment: Option<String>,
}

/// Caller-facing entry points: authorization in front of the engine, and bridged reads.
pub struct SchedulerService {
    engine: Arc<Engine>,
    executor: QueryExecutor,
    filter: PermissionFilter,
    authorizer: Arc<dyn Authorizer>,
    ids: Arc<dyn IdAllocator>,
    bridge: SyncBridge,
}

impl SchedulerService {
    pub fn new(
        engine: Arc<Engine>,
        runtime: tokio::runtime::Handle,
        authorizer: Arc<dyn Authorizer>,
        ids: Arc<dyn IdAllocator>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            executor: QueryExecutor::new(engine.clone(), runtime),
            filter: PermissionFilter::new(authorizer.clone()),
            engine,
            authorizer,
            ids,
            bridge: SyncBridge::new(query_timeout),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn allocate(&self, kind: EntityKind, count: usize) -> Vec<Ulid> {
        self.ids.create_identifiers(kind, count)
    }

    // ── Writes ───────────────────────────────────────────────

    /// Authorize every intent, then commit them as one transaction.
    pub async fn write(
        &self,
        caller: &Caller,
        intents: Vec<WriteIntent>,
    ) -> Result<Vec<Record>, EngineError> {
        for intent in &intents {
            self.authorize(caller, intent, &intents).await?;
        }
        self.engine.commit(intents).await
    }

    /// Create a reservation owned by `caller` together with its appointments. The reservation
    /// is committed before its appointments, in the same transaction.
    pub async fn create_event(
        &self,
        caller: &Caller,
        mut reservation: Reservation,
        appointments: Vec<NewAppointment>,
    ) -> Result<Vec<Record>, EngineError> {
        reservation.owner = Some(caller.name().to_string());
        let reservation_id = self
            .ids
            .create_identifiers(EntityKind::Reservation, 1)
            .pop()
            .ok_or_else(|| EngineError::Invalid("identity allocator returned nothing".into()))?;
        let appointment_ids = self
            .ids
            .create_identifiers(EntityKind::Appointment, appointments.len());
        if appointment_ids.len() != appointments.len() {
            return Err(EngineError::Invalid("identity allocator returned too few ids".into()));
        }

        let mut intents = Vec::with_capacity(appointments.len() + 1);
        intents.push(WriteIntent::insert(reservation_id, Payload::Reservation(reservation)));
        for (id, app) in appointment_ids.into_iter().zip(appointments) {
            intents.push(WriteIntent::insert(
                id,
                Payload::Appointment(Appointment {
                    reservation_id,
                    span: app.span,
                    resources: app.resources,
                    comment: app.comment,
                }),
            ));
        }
        self.write(caller, intents).await
    }

    async fn authorize(
        &self,
        caller: &Caller,
        intent: &WriteIntent,
        batch: &[WriteIntent],
    ) -> Result<(), EngineError> {
        let denied = |action| EngineError::Unauthorized {
            caller: caller.name().to_string(),
            action,
            id: Some(intent.target),
        };

        match &intent.op {
            Operation::Insert { payload } => {
                let prospective = Record { id: intent.target, last_modified: 0, payload: payload.clone() };
                if !self.authorizer.can_create(payload.kind(), caller)
                    || !self.may_modify(caller, &prospective, batch).await
                {
                    return Err(denied("create"));
                }
            }
            Operation::Update { payload, .. } => {
                // A missing target is the engine's to report, as a conflict.
                if let Some(current) = self.engine.get(&intent.target).await
                    && !self.may_modify(caller, &current, batch).await
                {
                    return Err(denied("modify"));
                }
                let prospective = Record { id: intent.target, last_modified: 0, payload: payload.clone() };
                if !self.may_modify(caller, &prospective, batch).await {
                    return Err(denied("modify"));
                }
            }
            Operation::Delete { .. } => {
                if let Some(current) = self.engine.get(&intent.target).await
                    && !self.may_modify(caller, &current, batch).await
                {
                    return Err(denied("delete"));
                }
            }
        }
        Ok(())
    }

    /// Appointments are modifiable through their reservation: the version this batch writes
    /// if it writes one, the stored one otherwise.
    async fn may_modify(&self, caller: &Caller, record: &Record, batch: &[WriteIntent]) -> bool {
        let Payload::Appointment(app) = &record.payload else {
            return self.authorizer.can_modify(record, caller);
        };
        if let Some(payload) = batch
            .iter()
            .find(|i| i.target == app.reservation_id)
            .and_then(WriteIntent::payload)
        {
            let staged = Record { id: app.reservation_id, last_modified: 0, payload: payload.clone() };
            return self.authorizer.can_modify(&staged, caller);
        }
        match self.engine.get(&app.reservation_id).await {
            Some(reservation) => self.authorizer.can_modify(&reservation, caller),
            // The engine rejects the dangling reference.
            None => true,
        }
    }

    // ── Reads ────────────────────────────────────────────────

    pub async fn get(&self, caller: &Caller, id: &Ulid) -> Result<Record, EngineError> {
        let record = self.engine.get(id).await.ok_or(EngineError::NotFound(*id))?;
        if !self.may_read(caller, &record).await {
            return Err(EngineError::Unauthorized {
                caller: caller.name().to_string(),
                action: "read",
                id: Some(*id),
            });
        }
        Ok(record)
    }

    async fn may_read(&self, caller: &Caller, record: &Record) -> bool {
        match &record.payload {
            Payload::Appointment(app) => match self.engine.get(&app.reservation_id).await {
                Some(reservation) => self.authorizer.can_read(&reservation, caller),
                None => false,
            },
            _ => self.authorizer.can_read(record, caller),
        }
    }

    pub async fn list_resources(&self, caller: &Caller) -> Vec<Record> {
        self.engine
            .list_kind(EntityKind::Resource)
            .await
            .into_iter()
            .filter(|r| self.authorizer.can_read(r, caller))
            .collect()
    }

    pub async fn list_reservations(&self, caller: &Caller) -> Vec<Record> {
        self.engine
            .list_kind(EntityKind::Reservation)
            .await
            .into_iter()
            .filter(|r| self.authorizer.can_read(r, caller))
            .collect()
    }

    /// Appointments of a reservation the caller may read.
    pub async fn appointments_of(
        &self,
        caller: &Caller,
        reservation_id: &Ulid,
    ) -> Result<Vec<Record>, EngineError> {
        self.get(caller, reservation_id).await?;
        self.engine.appointments_of(reservation_id).await
    }

    /// Event query with the caller's read filter applied, without waiting for it.
    pub fn submit_events(&self, caller: &Caller, request: QueryRequest) -> DeferredResult<Vec<Record>> {
        self.filter.apply(&self.executor.submit(request), caller.clone())
    }

    /// [`Self::submit_events`] waited on with the bridge's timeout. Blocks the current
    /// thread; call it from `spawn_blocking` or a plain thread, never a runtime worker.
    pub fn list_events(&self, caller: &Caller, request: QueryRequest) -> Result<Vec<Record>, EngineError> {
        self.bridge.wait(&self.submit_events(caller, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UlidAllocator;
    use crate::permission::OwnerPolicy;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    struct Fixture {
        runtime: tokio::runtime::Runtime,
        service: SchedulerService,
        path: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn fixture(name: &str) -> Fixture {
        let dir = std::env::temp_dir().join("tempora_test_service");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}.wal"));
        let _ = std::fs::remove_file(&path);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let engine = {
            let _enter = runtime.enter();
            Arc::new(Engine::new(path.clone()).unwrap())
        };
        let service = SchedulerService::new(
            engine,
            runtime.handle().clone(),
            Arc::new(OwnerPolicy::new(["admin"])),
            Arc::new(UlidAllocator::new()),
            Duration::from_secs(40),
        );
        Fixture { runtime, service, path }
    }

    fn lecture(name: &str) -> Reservation {
        Reservation {
            name: name.into(),
            event_type: "lecture".into(),
            owner: None,
            annotations: BTreeMap::new(),
        }
    }

    fn slot(start: Ms, end: Ms, resources: Vec<Ulid>) -> NewAppointment {
        NewAppointment { span: Span::new(start, end), resources, comment: None }
    }

    fn add_room(f: &Fixture) -> Ulid {
        let id = f.service.allocate(EntityKind::Resource, 1)[0];
        let intent = WriteIntent::insert(
            id,
            Payload::Resource(Resource { name: "Room 1".into(), resource_type: "room".into() }),
        );
        f.runtime
            .block_on(f.service.write(&Caller::new("admin"), vec![intent]))
            .unwrap();
        id
    }

    #[test]
    fn create_event_owns_and_orders_records() {
        let f = fixture("create_event");
        let room = add_room(&f);
        let alice = Caller::new("alice");
        let stored = f
            .runtime
            .block_on(f.service.create_event(
                &alice,
                lecture("Algebra"),
                vec![slot(1000, 2000, vec![room]), slot(3000, 4000, vec![])],
            ))
            .unwrap();

        assert_eq!(stored.len(), 3);
        let reservation = stored[0].as_reservation().unwrap();
        assert_eq!(reservation.owner.as_deref(), Some("alice"));
        assert!(stored[1..]
            .iter()
            .all(|r| r.as_appointment().unwrap().reservation_id == stored[0].id));
    }

    #[test]
    fn list_events_from_a_plain_thread() {
        let f = fixture("list_events");
        let room = add_room(&f);
        let (alice, bob) = (Caller::new("alice"), Caller::new("bob"));
        f.runtime
            .block_on(f.service.create_event(&alice, lecture("Algebra"), vec![slot(1000, 2000, vec![room])]))
            .unwrap();
        f.runtime
            .block_on(f.service.create_event(&bob, lecture("Poetry"), vec![slot(1500, 2500, vec![room])]))
            .unwrap();

        let mine = f.service.list_events(&alice, QueryRequest::between(0, 10_000)).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].as_reservation().unwrap().name, "Algebra");

        let all = f
            .service
            .list_events(&Caller::new("admin"), QueryRequest::between(0, 10_000))
            .unwrap();
        assert_eq!(all.len(), 2);

        let nothing = f.service.list_events(&alice, QueryRequest::between(50_000, 60_000)).unwrap();
        assert!(nothing.is_empty());
    }

    #[test]
    fn unknown_filter_resource_fails_the_query() {
        let f = fixture("unknown_resource");
        let request = QueryRequest {
            resource_ids: vec![Ulid::new()],
            ..QueryRequest::default()
        };
        assert!(matches!(
            f.service.list_events(&Caller::new("alice"), request),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn non_admin_cannot_create_resources() {
        let f = fixture("resource_create");
        let intent = WriteIntent::insert(
            Ulid::new(),
            Payload::Resource(Resource { name: "Room 9".into(), resource_type: "room".into() }),
        );
        let err = f
            .runtime
            .block_on(f.service.write(&Caller::new("alice"), vec![intent]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { action: "create", .. }));
    }

    #[test]
    fn appointment_writes_go_through_the_reservation_owner() {
        let f = fixture("appointment_owner");
        let (alice, bob) = (Caller::new("alice"), Caller::new("bob"));
        let stored = f
            .runtime
            .block_on(f.service.create_event(&alice, lecture("Algebra"), vec![slot(1000, 2000, vec![])]))
            .unwrap();
        let reservation_id = stored[0].id;

        let intruder = WriteIntent::insert(
            Ulid::new(),
            Payload::Appointment(Appointment {
                reservation_id,
                span: Span::new(5000, 6000),
                resources: vec![],
                comment: None,
            }),
        );
        let err = f
            .runtime
            .block_on(f.service.write(&bob, vec![intruder.clone()]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let app = &stored[1];
        let delete = WriteIntent::delete(app.id, app.last_modified);
        assert!(matches!(
            f.runtime.block_on(f.service.write(&bob, vec![delete.clone()])),
            Err(EngineError::Unauthorized { action: "delete", .. })
        ));
        f.runtime.block_on(f.service.write(&alice, vec![delete])).unwrap();
        f.runtime.block_on(f.service.write(&alice, vec![intruder])).unwrap();
    }

    #[test]
    fn cannot_give_away_a_reservation_to_dodge_ownership() {
        let f = fixture("give_away");
        let alice = Caller::new("alice");
        let stored = f
            .runtime
            .block_on(f.service.create_event(&alice, lecture("Algebra"), vec![]))
            .unwrap();
        let mut renamed = lecture("Algebra");
        renamed.owner = Some("bob".into());
        let update = WriteIntent::update(stored[0].id, stored[0].last_modified, Payload::Reservation(renamed));
        assert!(matches!(
            f.runtime.block_on(f.service.write(&alice, vec![update])),
            Err(EngineError::Unauthorized { action: "modify", .. })
        ));
    }

    #[test]
    fn get_hides_private_reservations_and_their_appointments() {
        let f = fixture("get_private");
        let stored = f
            .runtime
            .block_on(f.service.create_event(&Caller::new("alice"), lecture("Algebra"), vec![slot(0, 10, vec![])]))
            .unwrap();
        let bob = Caller::new("bob");
        for record in &stored {
            assert!(matches!(
                f.runtime.block_on(f.service.get(&bob, &record.id)),
                Err(EngineError::Unauthorized { action: "read", .. })
            ));
        }
        assert!(matches!(
            f.runtime.block_on(f.service.get(&bob, &Ulid::new())),
            Err(EngineError::NotFound(_))
        ));
        let apps = f
            .runtime
            .block_on(f.service.appointments_of(&Caller::new("alice"), &stored[0].id))
            .unwrap();
        assert_eq!(apps.len(), 1);
    }

    #[test]
    fn list_events_deadline_exceeded() {
        let f = fixture("deadline");
        let service = SchedulerService::new(
            f.service.engine().clone(),
            f.runtime.handle().clone(),
            Arc::new(OwnerPolicy::default()),
            Arc::new(UlidAllocator::new()),
            Duration::from_millis(200),
        );
        // A held write lock on the filter resource stalls the query's first read.
        let room = add_room(&f);
        let slot = f.service.engine().store.slot(&room).unwrap();
        let stall = f.runtime.block_on(slot.cell.clone().write_owned());

        let request = QueryRequest {
            resource_ids: vec![room],
            ..QueryRequest::default()
        };
        assert_eq!(
            service.list_events(&Caller::new("alice"), request),
            Err(EngineError::DeadlineExceeded(Duration::from_millis(200)))
        );
        drop(stall);
    }
}
