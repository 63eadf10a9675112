use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::AuditEnvelope;

/// A reservable window at an amenity. Unique per (amenity, slot_date, slot_start_time).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Amenity {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub name: String,
    pub location_id: Option<Uuid>,
    pub active: bool,
}

impl Amenity {
    pub fn id(&self) -> Uuid {
        self.audit.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AmenitySlot {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub amenity_id: Uuid,
    pub slot_date: NaiveDate,
    pub slot_start_time: NaiveTime,
    pub slot_end_time: NaiveTime,
    pub slot_duration_minutes: i32,
    pub is_available: bool,
    pub total_bookings: i32,
    pub max_concurrent_bookings: i32,
}

impl AmenitySlot {
    pub fn id(&self) -> Uuid {
        self.audit.id
    }

    pub fn has_capacity(&self) -> bool {
        self.is_available && self.total_bookings < self.max_concurrent_bookings
    }

    pub fn overlaps(&self, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> bool {
        self.slot_date == date && self.slot_start_time < end && start < self.slot_end_time
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AmenityBlackoutPeriod {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub amenity_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Without a time range the blackout covers whole days.
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub reason: String,
}

impl AmenityBlackoutPeriod {
    pub fn covers(&self, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> bool {
        if date < self.start_date || date > self.end_date {
            return false;
        }
        match (self.start_time, self.end_time) {
            (Some(bs), Some(be)) => bs < end && start < be,
            (Some(bs), None) => end > bs,
            (None, Some(be)) => start < be,
            (None, None) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "booking_status", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "repeat_frequency", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum RepeatFrequency {
    NotRequired,
    Weekly,
    Biweekly,
    Monthly,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "recurrence_end_type", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceEndType {
    Never,
    AfterOccurrences,
    OnDate,
}

/// Recurrence fields of a parent booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(default)]
pub struct RecurrenceRule {
    pub repeat_frequency: RepeatFrequency,
    pub repeat_interval: i32,
    /// ISO weekdays, 1 = Monday .. 7 = Sunday.
    pub repeat_on_days_of_week: Vec<i16>,
    pub repeat_on_day_of_month: Option<i16>,
    pub recurrence_end_type: RecurrenceEndType,
    pub recurrence_end_date: Option<NaiveDate>,
    pub recurrence_occurrences: Option<i32>,
}

impl Default for RecurrenceRule {
    fn default() -> Self {
        Self {
            repeat_frequency: RepeatFrequency::NotRequired,
            repeat_interval: 1,
            repeat_on_days_of_week: Vec::new(),
            repeat_on_day_of_month: None,
            recurrence_end_type: RecurrenceEndType::Never,
            recurrence_end_date: None,
            recurrence_occurrences: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AmenityBooking {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub amenity_id: Uuid,
    /// The renter holding the booking.
    pub resident_id: Uuid,
    pub slot_id: Option<Uuid>,
    pub selected_slot_ids: Vec<Uuid>,
    pub booking_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: BookingStatus,
    pub rejection_reason: Option<String>,
    pub rejection_remarks: Option<String>,
    pub cancellation_reason: Option<String>,
    pub requested_on: DateTime<Utc>,
    pub confirmed_on: Option<DateTime<Utc>>,
    pub confirmed_by: Option<Uuid>,
    pub rejected_on: Option<DateTime<Utc>>,
    pub rejected_by: Option<Uuid>,
    pub cancelled_on: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Uuid>,
    pub is_recurring: bool,
    pub parent_booking_id: Option<Uuid>,
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub recurrence: RecurrenceRule,
    pub occurrence_date: Option<NaiveDate>,
    pub recurrence_sequence: Option<i32>,
}

impl AmenityBooking {
    pub fn id(&self) -> Uuid {
        self.audit.id
    }

    /// Slots this booking occupies: the explicit selection, else the single slot.
    pub fn occupied_slot_ids(&self) -> Vec<Uuid> {
        if !self.selected_slot_ids.is_empty() {
            self.selected_slot_ids.clone()
        } else {
            self.slot_id.into_iter().collect()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "exception_type", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionType {
    Skip,
    Modify,
    Cancel,
}

/// Per-occurrence override. Unique per (parent_booking, occurrence_date).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RecurrenceException {
    #[serde(flatten)]
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub audit: AuditEnvelope,
    pub parent_booking_id: Uuid,
    pub occurrence_date: NaiveDate,
    pub exception_type: ExceptionType,
    pub new_start_time: Option<NaiveTime>,
    pub new_end_time: Option<NaiveTime>,
    pub new_booking_date: Option<NaiveDate>,
}

/// Request body for booking creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBooking {
    #[serde(alias = "amenity")]
    pub amenity_id: Uuid,
    /// The booking resident; older clients send it as `tenant`.
    #[serde(alias = "tenant")]
    pub resident_id: Uuid,
    pub booking_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default)]
    pub selected_slot_ids: Vec<Uuid>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(flatten)]
    pub recurrence: RecurrenceRule,
}

/// Request for bulk slot generation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SlotGenerationRequest {
    pub amenity_id: Uuid,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub operating_start_time: NaiveTime,
    pub operating_end_time: NaiveTime,
    #[validate(range(
        min = crate::constants::MIN_SLOT_INTERVAL_MINUTES,
        max = crate::constants::MAX_SLOT_INTERVAL_MINUTES,
        message = "interval_minutes is outside the allowed range"
    ))]
    pub interval_minutes: i32,
    #[validate(range(min = 1, message = "max_concurrent_bookings must be at least 1"))]
    pub max_concurrent_bookings: i32,
    #[serde(default)]
    pub delete_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotItemError {
    pub slot_date: NaiveDate,
    pub slot_start_time: NaiveTime,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotGenerationReport {
    pub created_count: usize,
    pub updated_count: usize,
    /// Slots written unavailable because a blackout covers them.
    pub updated_due_to_blackout: usize,
    pub error_count: usize,
    pub errors: Vec<SlotItemError>,
    pub summary: String,
}
