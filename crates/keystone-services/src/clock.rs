use chrono::{DateTime, Utc};

/// Source of the current time. Services read time through this so that windows (lockout,
/// OTP expiry, refund age) can be exercised without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
