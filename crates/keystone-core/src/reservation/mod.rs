//! Amenity reservation rules
//!
//! Slot planning and blackout overlay, recurrence expansion with per-occurrence exceptions,
//! and the booking state machine. Persistence and locking live in the db and service layers.

pub mod booking;
pub mod recurrence;
pub mod slots;

pub use booking::CancelOutcome;
pub use recurrence::{expand, validate_rule, Occurrence};
pub use slots::{plan_slots, PlannedSlot};
