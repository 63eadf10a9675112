//! Identity rules: lockout accounting and username derivation.

pub mod lockout;
pub mod username;

pub use lockout::{FailureOutcome, LockoutPolicy};
pub use username::{derive_username, normalize_email};
