//! Amenity, slot and booking repositories

mod booking;
mod slot;

pub use booking::PgReservationRepository;
