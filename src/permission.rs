use std::collections::HashSet;
use std::sync::Arc;

use crate::deferred::DeferredResult;
use crate::model::*;

/// The principal a request runs as. Opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller(String);

impl Caller {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability checks. Implementations must be pure functions of their arguments.
///
/// Appointments are never asked about directly: callers resolve them to their reservation.
pub trait Authorizer: Send + Sync {
    fn can_read(&self, record: &Record, caller: &Caller) -> bool;
    fn can_modify(&self, record: &Record, caller: &Caller) -> bool;
    fn can_create(&self, kind: EntityKind, caller: &Caller) -> bool;
}

/// Admins may do anything. Everyone else reads resources and the reservations they own,
/// ownerless ones and ones annotated `public=true`; modifies only reservations they own;
/// creates reservations and appointments but not resources.
#[derive(Debug, Clone, Default)]
pub struct OwnerPolicy {
    admins: HashSet<String>,
}

impl OwnerPolicy {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    fn is_admin(&self, caller: &Caller) -> bool {
        self.admins.contains(caller.name())
    }
}

impl Authorizer for OwnerPolicy {
    fn can_read(&self, record: &Record, caller: &Caller) -> bool {
        if self.is_admin(caller) {
            return true;
        }
        match &record.payload {
            Payload::Reservation(r) => match &r.owner {
                None => true,
                Some(owner) => {
                    owner == caller.name()
                        || r.annotations.get("public").is_some_and(|v| v == "true")
                }
            },
            Payload::Resource(_) | Payload::Appointment(_) => true,
        }
    }

    fn can_modify(&self, record: &Record, caller: &Caller) -> bool {
        if self.is_admin(caller) {
            return true;
        }
        match &record.payload {
            Payload::Reservation(r) => r.owner.as_deref() == Some(caller.name()),
            Payload::Resource(_) => false,
            Payload::Appointment(_) => true,
        }
    }

    fn can_create(&self, kind: EntityKind, caller: &Caller) -> bool {
        kind != EntityKind::Resource || self.is_admin(caller)
    }
}

/// Post-processing stage over query results: keeps what the caller may read.
#[derive(Clone)]
pub struct PermissionFilter {
    authorizer: Arc<dyn Authorizer>,
}

impl PermissionFilter {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }

    /// Derive a filtered result. The input is never touched; a failed input fails the output
    /// with the same error.
    pub fn apply(
        &self,
        result: &DeferredResult<Vec<Record>>,
        caller: Caller,
    ) -> DeferredResult<Vec<Record>> {
        let authorizer = self.authorizer.clone();
        result.map(move |records| {
            records
                .iter()
                .filter(|r| authorizer.can_read(r, &caller))
                .cloned()
                .collect()
        })
    }
}
