use crate::limits::*;
use crate::model::*;

use super::error::ConflictKind;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Proceed,
    Conflict(ConflictKind),
}

/// Lost-update check. The only place stamps are compared: `Proceed` iff the persisted stamp
/// is exactly the one the writer read.
pub fn check(current: Option<&Record>, expected: Ms) -> Outcome {
    match current {
        None => Outcome::Conflict(ConflictKind::TargetGone),
        Some(record) if record.last_modified == expected => Outcome::Proceed,
        Some(record) => Outcome::Conflict(ConflictKind::StaleVersion {
            current: Box::new(record.clone()),
        }),
    }
}

/// Non-empty and inside the valid timestamp range. Checked before any width arithmetic.
pub(crate) fn validate_bounds(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Invalid(format!(
            "span [{}, {}) is empty",
            span.start, span.end
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    validate_bounds(span)?;
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_payload(payload: &Payload) -> Result<(), EngineError> {
    match payload {
        Payload::Resource(r) => {
            if r.name.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("resource name too long"));
            }
            if r.resource_type.len() > MAX_TYPE_LEN {
                return Err(EngineError::LimitExceeded("resource type too long"));
            }
        }
        Payload::Reservation(r) => {
            if r.name.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("reservation name too long"));
            }
            if r.event_type.len() > MAX_TYPE_LEN {
                return Err(EngineError::LimitExceeded("event type too long"));
            }
            if r.annotations.len() > MAX_ANNOTATIONS {
                return Err(EngineError::LimitExceeded("too many annotations"));
            }
            if r.annotations
                .iter()
                .any(|(k, v)| k.len() > MAX_ANNOTATION_LEN || v.len() > MAX_ANNOTATION_LEN)
            {
                return Err(EngineError::LimitExceeded("annotation too long"));
            }
        }
        Payload::Appointment(a) => {
            validate_span(&a.span)?;
            if a.resources.len() > MAX_RESOURCES_PER_APPOINTMENT {
                return Err(EngineError::LimitExceeded("too many resources on appointment"));
            }
            if a.resources.contains(&a.reservation_id) {
                return Err(EngineError::kind_mismatch(
                    a.reservation_id,
                    EntityKind::Resource,
                    EntityKind::Reservation,
                ));
            }
            if a.comment.as_ref().is_some_and(|c| c.len() > MAX_ANNOTATION_LEN) {
                return Err(EngineError::LimitExceeded("appointment comment too long"));
            }
        }
    }
    Ok(())
}
