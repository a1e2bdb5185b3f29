use std::time::Duration;

use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TYPE_LEN: usize = 64;
pub const MAX_ANNOTATIONS: usize = 32;
pub const MAX_ANNOTATION_LEN: usize = 1024;
pub const MAX_RESOURCES_PER_APPOINTMENT: usize = 64;

/// Intents accepted in one logical transaction.
pub const MAX_BATCH_SIZE: usize = 1000;

pub const MAX_IN_CLAUSE_IDS: usize = 1000;

/// 1970-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// ~10 years
pub const MAX_SPAN_DURATION_MS: Ms = 315_576_000_000;
/// ~2 years
pub const MAX_QUERY_WINDOW_MS: Ms = 63_115_200_000;

/// Ceiling for synchronous callers waiting on a query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(40);
