use chrono::{DateTime, Duration, Utc};

use crate::models::{Tenant, User};

/// Lockout limits in force for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub limit: i32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Counted; the account is still open.
    Counted { failed_attempt_count: i32 },
    /// This failure reached the limit and locked the account.
    Locked,
}

impl LockoutPolicy {
    pub fn new(limit: i32, window_seconds: i64) -> Self {
        Self {
            limit: limit.max(1),
            window: Duration::seconds(window_seconds),
        }
    }

    pub fn for_tenant(tenant: &Tenant) -> Self {
        Self::new(tenant.lockout_limit, tenant.lockout_window_seconds)
    }

    /// True while the user is locked and the window has not elapsed.
    pub fn is_locked(&self, user: &User, now: DateTime<Utc>) -> bool {
        match (user.locked, user.locked_at) {
            (true, Some(locked_at)) => now - locked_at < self.window,
            (true, None) => true,
            _ => false,
        }
    }

    /// Apply one failed attempt. An expired lock is cleared before counting.
    pub fn register_failure(&self, user: &mut User, now: DateTime<Utc>) -> FailureOutcome {
        if user.locked && !self.is_locked(user, now) {
            user.locked = false;
            user.locked_at = None;
            user.failed_attempt_count = 0;
        }

        user.failed_attempt_count += 1;
        if user.failed_attempt_count >= self.limit {
            user.locked = true;
            user.locked_at = Some(now);
            FailureOutcome::Locked
        } else {
            FailureOutcome::Counted {
                failed_attempt_count: user.failed_attempt_count,
            }
        }
    }

    pub fn register_success(&self, user: &mut User) {
        user.failed_attempt_count = 0;
        user.locked = false;
        user.locked_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::models::{AccessLevel, AuditEnvelope, UserStatus};
    use uuid::Uuid;

    fn user() -> User {
        let ctx = RequestContext::system(Uuid::new_v4());
        User {
            audit: AuditEnvelope::stamp_create(&ctx),
            email: Some("alice@example.com".to_string()),
            username: "alice@example.com".to_string(),
            password_hash: None,
            is_active: true,
            is_superuser: false,
            is_staff: false,
            access_level: AccessLevel::Unit,
            first_name: None,
            last_name: None,
            phone: None,
            country_code: None,
            date_of_birth: None,
            status: UserStatus::Approved,
            locked: false,
            failed_attempt_count: 0,
            locked_at: None,
            languages: vec![],
        }
    }

    #[test]
    fn locks_on_reaching_limit() {
        let policy = LockoutPolicy::new(3, 1800);
        let mut u = user();
        let now = Utc::now();

        assert_eq!(
            policy.register_failure(&mut u, now),
            FailureOutcome::Counted {
                failed_attempt_count: 1
            }
        );
        policy.register_failure(&mut u, now);
        assert_eq!(policy.register_failure(&mut u, now), FailureOutcome::Locked);
        assert!(policy.is_locked(&u, now));
    }

    #[test]
    fn lock_expires_after_window() {
        let policy = LockoutPolicy::new(1, 60);
        let mut u = user();
        let now = Utc::now();
        policy.register_failure(&mut u, now);

        assert!(policy.is_locked(&u, now + Duration::seconds(59)));
        assert!(!policy.is_locked(&u, now + Duration::seconds(60)));
    }

    #[test]
    fn failure_after_expired_lock_starts_fresh() {
        let policy = LockoutPolicy::new(3, 60);
        let mut u = user();
        let now = Utc::now();
        for _ in 0..3 {
            policy.register_failure(&mut u, now);
        }
        let later = now + Duration::seconds(120);
        assert_eq!(
            policy.register_failure(&mut u, later),
            FailureOutcome::Counted {
                failed_attempt_count: 1
            }
        );
    }

    #[test]
    fn success_resets_counters() {
        let policy = LockoutPolicy::new(3, 60);
        let mut u = user();
        policy.register_failure(&mut u, Utc::now());
        policy.register_success(&mut u);
        assert_eq!(u.failed_attempt_count, 0);
        assert!(!u.locked);
    }
}
