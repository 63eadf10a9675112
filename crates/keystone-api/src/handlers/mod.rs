pub mod amenities;
pub mod auth;
pub mod bills;
pub mod policies;
pub mod refunds;
pub mod roles;
