use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    /// Partial overlap counts; touching endpoints do not.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Logical type of a record. Fixed for an identity once it has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Resource,
    Reservation,
    Appointment,
}

impl EntityKind {
    /// Lock tier: every parent kind sorts before every child kind.
    pub fn tier(self) -> u8 {
        match self {
            EntityKind::Resource | EntityKind::Reservation => 0,
            EntityKind::Appointment => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Resource => "resource",
            EntityKind::Reservation => "reservation",
            EntityKind::Appointment => "appointment",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that can be allocated by an appointment (a room, a person, a projector).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub resource_type: String,
}

/// The owning event. Appointments hang off it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub name: String,
    pub event_type: String,
    pub owner: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

/// One concrete time slot of a reservation, allocating zero or more resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub reservation_id: Ulid,
    pub span: Span,
    pub resources: Vec<Ulid>,
    /// Free text attached to this slot only.
    #[serde(default)]
    pub comment: Option<String>,
}

impl Appointment {
    /// The comment trimmed, or `None` when it is absent or blank.
    pub fn display_comment(&self) -> Option<&str> {
        self.comment.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Resource(Resource),
    Reservation(Reservation),
    Appointment(Appointment),
}

impl Payload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Payload::Resource(_) => EntityKind::Resource,
            Payload::Reservation(_) => EntityKind::Reservation,
            Payload::Appointment(_) => EntityKind::Appointment,
        }
    }

    /// Records this payload depends on, each tagged with the kind it must have.
    pub fn parents(&self) -> Vec<(Ulid, EntityKind)> {
        match self {
            Payload::Appointment(app) => {
                let mut parents = Vec::with_capacity(app.resources.len() + 1);
                parents.push((app.reservation_id, EntityKind::Reservation));
                // Dedup within resources only: an id that is also the reservation must still
                // be checked as a resource, and fail.
                for (i, rid) in app.resources.iter().enumerate() {
                    if !app.resources[..i].contains(rid) {
                        parents.push((*rid, EntityKind::Resource));
                    }
                }
                parents
            }
            Payload::Resource(_) | Payload::Reservation(_) => Vec::new(),
        }
    }
}

/// A versioned record as persisted. `last_modified` is only ever assigned by the writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: Ulid,
    pub last_modified: Ms,
    pub payload: Payload,
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    pub fn parent_ids(&self) -> Vec<Ulid> {
        self.payload.parents().into_iter().map(|(id, _)| id).collect()
    }

    pub fn as_reservation(&self) -> Option<&Reservation> {
        match &self.payload {
            Payload::Reservation(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_appointment(&self) -> Option<&Appointment> {
        match &self.payload {
            Payload::Appointment(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_resource(&self) -> Option<&Resource> {
        match &self.payload {
            Payload::Resource(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert { payload: Payload },
    Update { expected: Ms, payload: Payload },
    Delete { expected: Ms },
}

/// One unit of work for the writer. Consumed by value: committed or aborted, never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteIntent {
    pub target: Ulid,
    pub op: Operation,
}

impl WriteIntent {
    pub fn insert(target: Ulid, payload: Payload) -> Self {
        Self { target, op: Operation::Insert { payload } }
    }

    pub fn update(target: Ulid, expected: Ms, payload: Payload) -> Self {
        Self { target, op: Operation::Update { expected, payload } }
    }

    pub fn delete(target: Ulid, expected: Ms) -> Self {
        Self { target, op: Operation::Delete { expected } }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.op {
            Operation::Insert { payload } | Operation::Update { payload, .. } => Some(payload),
            Operation::Delete { .. } => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.op, Operation::Delete { .. })
    }
}

/// Filter set for event queries. Empty collections mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    pub range: Option<Span>,
    pub resource_ids: Vec<Ulid>,
    pub event_types: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<String>,
}

impl QueryRequest {
    pub fn between(start: Ms, end: Ms) -> Self {
        Self {
            range: Some(Span::new(start, end)),
            ..Self::default()
        }
    }

    pub fn matches_reservation(&self, reservation: &Reservation) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&reservation.event_type) {
            return false;
        }
        if let Some(owner) = &self.owner
            && reservation.owner.as_ref() != Some(owner) {
                return false;
            }
        self.annotations
            .iter()
            .all(|(k, v)| reservation.annotations.get(k) == Some(v))
    }

    pub fn matches_appointment(&self, appointment: &Appointment) -> bool {
        if let Some(range) = &self.range
            && !appointment.span.overlaps(range) {
                return false;
            }
        self.resource_ids.is_empty()
            || appointment.resources.iter().any(|r| self.resource_ids.contains(r))
    }
}

/// One durable change. `Put` covers both insert and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Put(Record),
    Remove { id: Ulid, kind: EntityKind },
    /// Highest stamp ever handed out, written by compaction so stamps of deleted records
    /// are not reissued after a restart.
    Clock { high_water: Ms },
}

/// A committed transaction as written to the WAL. Replayed all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub changes: Vec<Change>,
}
