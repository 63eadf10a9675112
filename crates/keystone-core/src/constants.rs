//! Domain constants shared across crates

/// Minimum and maximum slot interval accepted by bulk slot generation.
pub const MIN_SLOT_INTERVAL_MINUTES: i32 = 15;
pub const MAX_SLOT_INTERVAL_MINUTES: i32 = 480;

/// Fallback tax when no rule exists for a state.
pub const DEFAULT_TAX_PERCENT: i64 = 5;

/// Parents younger than this may only be refunded in full (card transactions still OPEN).
pub const PARTIAL_REFUND_MIN_AGE_HOURS: i64 = 24;

/// Upper bound on occurrences expanded for open-ended recurrences, independent of horizon.
pub const MAX_RECURRENCE_OCCURRENCES: usize = 520;

/// Length of numeric OTP codes.
pub const OTP_LENGTH: usize = 6;

/// Days per month used when converting a plan duration into gateway consent days.
pub const CONSENT_DAYS_PER_MONTH: i32 = 30;

/// Cap for notification retry backoff.
pub const MAX_NOTIFICATION_BACKOFF_SECONDS: i64 = 300;

/// Actor recorded in `deleted_by` / `updated_by` for system-initiated mutations.
pub const SYSTEM_ACTOR: uuid::Uuid = uuid::Uuid::nil();

pub const DEFAULT_CURRENCY: &str = "USD";
