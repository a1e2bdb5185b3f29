use parking_lot::Mutex;
use tracing::warn;
use ulid::{Generator, Ulid};

use crate::model::EntityKind;

/// Hands out fresh identities for records the server creates on a caller's behalf.
pub trait IdAllocator: Send + Sync {
    fn create_identifiers(&self, kind: EntityKind, count: usize) -> Vec<Ulid>;
}

/// Monotonic ULIDs: ids allocated later in the same millisecond still sort later.
pub struct UlidAllocator {
    generator: Mutex<Generator>,
}

impl UlidAllocator {
    pub fn new() -> Self {
        Self { generator: Mutex::new(Generator::new()) }
    }
}

impl Default for UlidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator for UlidAllocator {
    fn create_identifiers(&self, kind: EntityKind, count: usize) -> Vec<Ulid> {
        let mut generator = self.generator.lock();
        (0..count)
            .map(|_| {
                generator.generate().unwrap_or_else(|e| {
                    // random part exhausted within one millisecond
                    warn!("monotonic {kind} id overflow ({e}), falling back to a random ULID");
                    Ulid::new()
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allocates_distinct_ordered_ids() {
        let ids = UlidAllocator::new().create_identifiers(EntityKind::Appointment, 500);
        assert_eq!(ids.len(), 500);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 500);
    }

    #[test]
    fn zero_count_is_empty() {
        assert!(UlidAllocator::new().create_identifiers(EntityKind::Reservation, 0).is_empty());
    }
}
