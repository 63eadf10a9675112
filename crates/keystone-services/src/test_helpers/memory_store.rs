//! In-memory store
//!
//! One [`MemoryStore`] implements every store trait over a single locked [`MemoryState`].
//! Writes follow the Postgres repositories: optimistic updates require
//! `stored.version == new.version - 1`, soft-deleted rows are invisible, and scoped reads
//! go through [`ScopeFilter::admits`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use keystone_core::access::{scope_filter, RolePermissionSet};
use keystone_core::identity::{FailureOutcome, LockoutPolicy};
use keystone_core::models::{
    AccessLog, Amenity, AmenityBlackoutPeriod, AmenityBooking, AmenitySlot, AppliedRule, Bill,
    BillAggregate, BillBreakDown, BillCancellationCodeComposition, BillPaymentPlan,
    BillRefundRequest, BillSummary, BookingStatus, Entity, EntityAttributeComposition,
    EntityAttributePermission, GatewayReconState, Lookup, Module, ModulePermission,
    Notification, NotificationStatus, Payment, PaymentPlan, PaymentStatus, Policy, PolicyStatus,
    PolicyVersion, RecipientKind, RecurrenceException, RegisteredDevice, Resident, SavedAccount, SavedCard,
    Staff, SubModuleComposition, SubModulePermission, TaxPerState, Tenant, TenantStatus,
    TransactionLog, TransactionType, User, UserPolicyAcceptance, UserRole, UserType,
    VerificationChannel, VerificationCode,
};
use keystone_core::reservation::{booking, CancelOutcome};
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::{
    AuthzStore, BillingStore, IdentityStore, LookupStore, NotificationStore, PaymentStore,
    PolicyStore, RefundStore, ReservationStore, TenantStore, VerificationStore,
};
use uuid::Uuid;

/// Every table the services touch.
#[derive(Default)]
pub struct MemoryState {
    pub tenants: HashMap<Uuid, Tenant>,
    pub users: HashMap<Uuid, User>,
    pub staff: HashMap<Uuid, Staff>,
    pub residents: HashMap<Uuid, Resident>,
    pub devices: HashMap<Uuid, RegisteredDevice>,
    pub access_logs: HashMap<Uuid, AccessLog>,
    pub codes: HashMap<Uuid, VerificationCode>,
    pub roles: HashMap<Uuid, UserRole>,
    pub modules: Vec<Module>,
    pub submodule_compositions: Vec<SubModuleComposition>,
    pub entities: Vec<Entity>,
    pub attribute_compositions: Vec<EntityAttributeComposition>,
    pub module_permissions: Vec<ModulePermission>,
    pub submodule_permissions: Vec<SubModulePermission>,
    pub attribute_permissions: Vec<EntityAttributePermission>,
    pub policies: HashMap<Uuid, Policy>,
    pub policy_versions: HashMap<Uuid, PolicyVersion>,
    pub acceptances: Vec<UserPolicyAcceptance>,
    pub lookups: Vec<Lookup>,
    pub cancellation_codes: Vec<BillCancellationCodeComposition>,
    pub amenities: HashMap<Uuid, Amenity>,
    pub slots: HashMap<Uuid, AmenitySlot>,
    pub blackouts: Vec<AmenityBlackoutPeriod>,
    pub bookings: HashMap<Uuid, AmenityBooking>,
    pub exceptions: HashMap<Uuid, RecurrenceException>,
    pub tax_rules: Vec<TaxPerState>,
    pub bills: HashMap<Uuid, Bill>,
    pub breakdowns: Vec<BillBreakDown>,
    pub applied_rules: Vec<AppliedRule>,
    pub summaries: Vec<BillSummary>,
    pub payment_plans: HashMap<Uuid, PaymentPlan>,
    pub bill_payment_plans: HashMap<Uuid, BillPaymentPlan>,
    pub payments: HashMap<Uuid, Payment>,
    pub transaction_logs: Vec<TransactionLog>,
    pub cards: HashMap<Uuid, SavedCard>,
    pub accounts: HashMap<Uuid, SavedAccount>,
    pub recon: HashMap<Uuid, GatewayReconState>,
    pub refund_requests: HashMap<Uuid, BillRefundRequest>,
    pub notifications: HashMap<Uuid, Notification>,
}

impl MemoryState {
    fn bill_visible(&self, ctx: &RequestContext, bill: &Bill) -> bool {
        bill.audit.tenant_id == ctx.tenant_id
            && !bill.audit.is_deleted()
            && scope_filter(ctx).admits(
                &bill.location_id.into_iter().collect::<Vec<_>>(),
                Some(bill.resident_id),
            )
    }

    fn booking_visible(&self, ctx: &RequestContext, booking: &AmenityBooking) -> bool {
        let location = self
            .amenities
            .get(&booking.amenity_id)
            .and_then(|a| a.location_id);
        booking.audit.tenant_id == ctx.tenant_id
            && !booking.audit.is_deleted()
            && scope_filter(ctx).admits(
                &location.into_iter().collect::<Vec<_>>(),
                Some(booking.resident_id),
            )
    }

    fn write_bill(&mut self, bill: &Bill) -> AppResult<Bill> {
        let stored = self
            .bills
            .get_mut(&bill.audit.id)
            .filter(|b| !b.audit.is_deleted())
            .ok_or_else(|| conflict("bill"))?;
        check_version(stored.audit.version, bill.audit.version, "bill")?;
        *stored = bill.clone();
        Ok(bill.clone())
    }

    fn write_payment(&mut self, payment: &Payment) -> AppResult<Payment> {
        let stored = self
            .payments
            .get_mut(&payment.audit.id)
            .ok_or_else(|| conflict("payment"))?;
        check_version(stored.audit.version, payment.audit.version, "payment")?;
        *stored = payment.clone();
        Ok(payment.clone())
    }

    fn check_bill_payment_plan(&self, plan: &BillPaymentPlan) -> AppResult<()> {
        let stored = self
            .bill_payment_plans
            .get(&plan.audit.id)
            .ok_or_else(|| conflict("bill payment plan"))?;
        check_version(stored.audit.version, plan.audit.version, "bill payment plan")
    }

    fn write_bill_payment_plan(&mut self, plan: &BillPaymentPlan) -> AppResult<()> {
        self.check_bill_payment_plan(plan)?;
        self.bill_payment_plans.insert(plan.audit.id, plan.clone());
        Ok(())
    }

    fn insert_payment_row(&mut self, payment: &Payment) -> AppResult<Payment> {
        if let Some(txn) = &payment.transaction_id {
            if self
                .payments
                .values()
                .any(|p| p.transaction_id.as_deref() == Some(txn.as_str()))
            {
                return Err(AppError::Conflict(format!(
                    "transaction {} already recorded",
                    txn
                )));
            }
        }
        self.payments.insert(payment.audit.id, payment.clone());
        Ok(payment.clone())
    }

    fn write_booking(&mut self, booking: &AmenityBooking) -> AppResult<AmenityBooking> {
        let stored = self
            .bookings
            .get_mut(&booking.audit.id)
            .ok_or_else(|| conflict("booking"))?;
        check_version(stored.audit.version, booking.audit.version, "booking")?;
        *stored = booking.clone();
        Ok(booking.clone())
    }

    /// Slots a booking occupies: the selection when present, else every overlapping slot.
    fn slots_for_booking(&self, booking: &AmenityBooking) -> Vec<Uuid> {
        let selected = booking.occupied_slot_ids();
        let mut ids: Vec<Uuid> = self
            .slots
            .values()
            .filter(|s| !s.audit.is_deleted() && s.audit.tenant_id == booking.audit.tenant_id)
            .filter(|s| {
                if selected.is_empty() {
                    s.amenity_id == booking.amenity_id
                        && s.overlaps(booking.booking_date, booking.start_time, booking.end_time)
                } else {
                    selected.contains(&s.id())
                }
            })
            .map(AmenitySlot::id)
            .collect();
        ids.sort();
        ids
    }

    fn adjust_slot_bookings(&mut self, slot_ids: &[Uuid], delta: i32, actor: Uuid) {
        for id in slot_ids {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.total_bookings =
                    (slot.total_bookings + delta).max(0).min(slot.max_concurrent_bookings);
                slot.audit.version += 1;
                slot.audit.updated_on = Utc::now();
                slot.audit.updated_by = Some(actor);
            }
        }
    }

    fn cancel_visible(
        &mut self,
        ctx: &RequestContext,
        booking_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(AmenityBooking, CancelOutcome)> {
        let mut current = self
            .bookings
            .get(&booking_id)
            .filter(|b| self.booking_visible(ctx, b))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))?;

        let outcome = booking::cancel(&mut current, reason, ctx, now)?;
        if !outcome.changed {
            return Ok((current, outcome));
        }
        current.audit.stamp_update(ctx);
        let cancelled = self.write_booking(&current)?;
        if outcome.was_confirmed {
            let slot_ids = self.slots_for_booking(&cancelled);
            self.adjust_slot_bookings(&slot_ids, -1, ctx.user_id);
        }
        Ok((cancelled, outcome))
    }

    /// Insert or revive the exception keyed by (parent, occurrence_date).
    fn upsert_exception(&mut self, exception: &RecurrenceException) -> RecurrenceException {
        match self.exceptions.values_mut().find(|e| {
            e.parent_booking_id == exception.parent_booking_id
                && e.occurrence_date == exception.occurrence_date
        }) {
            Some(existing) => {
                existing.exception_type = exception.exception_type;
                existing.new_start_time = exception.new_start_time;
                existing.new_end_time = exception.new_end_time;
                existing.new_booking_date = exception.new_booking_date;
                existing.audit.deleted_by = None;
                existing.audit.updated_by = exception.audit.updated_by;
                existing.audit.version += 1;
                existing.clone()
            }
            None => {
                self.exceptions
                    .insert(exception.audit.id, exception.clone());
                exception.clone()
            }
        }
    }
}

fn conflict(what: &str) -> AppError {
    AppError::Conflict(format!(
        "{} was modified concurrently or no longer exists",
        what
    ))
}

fn check_version(stored: i32, incoming: i32, what: &str) -> AppResult<()> {
    if stored != incoming - 1 {
        return Err(conflict(what));
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store mutex poisoned")
    }

    /// Read or seed tables directly.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn bill(&self, bill_id: Uuid) -> Option<Bill> {
        self.lock().bills.get(&bill_id).cloned()
    }

    pub fn booking(&self, booking_id: Uuid) -> Option<AmenityBooking> {
        self.lock().bookings.get(&booking_id).cloned()
    }

    pub fn payment(&self, payment_id: Uuid) -> Option<Payment> {
        self.lock().payments.get(&payment_id).cloned()
    }

    pub fn user(&self, user_id: Uuid) -> Option<User> {
        self.lock().users.get(&user_id).cloned()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.lock().notifications.values().cloned().collect();
        all.sort_by_key(|n| n.audit.created_on);
        all
    }

    pub fn transaction_logs(&self) -> Vec<TransactionLog> {
        self.lock().transaction_logs.clone()
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn get_tenant(&self, tenant_id: Uuid) -> AppResult<Option<Tenant>> {
        Ok(self.lock().tenants.get(&tenant_id).cloned())
    }

    async fn list_active_tenants(&self) -> AppResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self
            .lock()
            .tenants
            .values()
            .filter(|t| t.status == TenantStatus::Active)
            .cloned()
            .collect();
        tenants.sort_by_key(|t| t.created_on);
        Ok(tenants)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_user_by_login(&self, tenant_id: Uuid, login: &str) -> AppResult<Option<User>> {
        let folded = login.to_lowercase();
        let state = self.lock();
        let mut matches: Vec<&User> = state
            .users
            .values()
            .filter(|u| u.audit.tenant_id == tenant_id && !u.audit.is_deleted())
            .filter(|u| {
                u.email.as_deref().map(str::to_lowercase).as_deref() == Some(folded.as_str())
                    || u.username == login
                    || u.phone.as_deref() == Some(login)
            })
            .collect();
        matches.sort_by_key(|u| u.audit.created_on);
        Ok(matches.first().map(|u| (*u).clone()))
    }

    async fn get_user(&self, tenant_id: Uuid, user_id: Uuid) -> AppResult<Option<User>> {
        Ok(self
            .lock()
            .users
            .get(&user_id)
            .filter(|u| u.audit.tenant_id == tenant_id && !u.audit.is_deleted())
            .cloned())
    }

    async fn email_taken(&self, tenant_id: Uuid, email: &str) -> AppResult<bool> {
        let folded = email.to_lowercase();
        Ok(self.lock().users.values().any(|u| {
            u.audit.tenant_id == tenant_id
                && !u.audit.is_deleted()
                && u.email.as_deref().map(str::to_lowercase).as_deref() == Some(folded.as_str())
        }))
    }

    async fn insert_user(&self, user: &User) -> AppResult<User> {
        let mut state = self.lock();
        if state.users.values().any(|u| {
            u.audit.tenant_id == user.audit.tenant_id
                && !u.audit.is_deleted()
                && u.username == user.username
        }) {
            return Err(AppError::Conflict(format!(
                "username {} already exists",
                user.username
            )));
        }
        state.users.insert(user.audit.id, user.clone());
        Ok(user.clone())
    }

    async fn insert_staff(&self, staff: &Staff) -> AppResult<Staff> {
        self.lock().staff.insert(staff.audit.id, staff.clone());
        Ok(staff.clone())
    }

    async fn insert_resident(&self, resident: &Resident) -> AppResult<Resident> {
        self.lock()
            .residents
            .insert(resident.audit.id, resident.clone());
        Ok(resident.clone())
    }

    async fn get_staff_by_user(&self, tenant_id: Uuid, user_id: Uuid) -> AppResult<Option<Staff>> {
        Ok(self
            .lock()
            .staff
            .values()
            .find(|s| {
                s.audit.tenant_id == tenant_id && s.user_id == user_id && !s.audit.is_deleted()
            })
            .cloned())
    }

    async fn get_resident_by_user(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Resident>> {
        Ok(self
            .lock()
            .residents
            .values()
            .find(|r| {
                r.audit.tenant_id == tenant_id && r.user_id == user_id && !r.audit.is_deleted()
            })
            .cloned())
    }

    async fn profile_email(
        &self,
        tenant_id: Uuid,
        kind: RecipientKind,
        profile_id: Uuid,
    ) -> AppResult<Option<String>> {
        let state = self.lock();
        let user_id = match kind {
            RecipientKind::Staff => state
                .staff
                .get(&profile_id)
                .filter(|s| s.audit.tenant_id == tenant_id && !s.audit.is_deleted())
                .map(|s| s.user_id),
            RecipientKind::Resident => state
                .residents
                .get(&profile_id)
                .filter(|r| r.audit.tenant_id == tenant_id && !r.audit.is_deleted())
                .map(|r| r.user_id),
            RecipientKind::Raw => None,
        };
        Ok(user_id
            .and_then(|id| state.users.get(&id))
            .and_then(|u| u.email.clone()))
    }

    async fn record_login_failure(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        policy: &LockoutPolicy,
        log: &AccessLog,
        now: DateTime<Utc>,
    ) -> AppResult<FailureOutcome> {
        let mut state = self.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .filter(|u| u.audit.tenant_id == tenant_id && !u.audit.is_deleted())
            .ok_or(AppError::UserNotFound)?;
        let outcome = policy.register_failure(user, now);
        user.audit.version += 1;
        user.audit.updated_on = now;
        state.access_logs.insert(log.audit.id, log.clone());
        Ok(outcome)
    }

    async fn record_login_success(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        log: &AccessLog,
    ) -> AppResult<()> {
        let mut state = self.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .filter(|u| u.audit.tenant_id == tenant_id && !u.audit.is_deleted())
            .ok_or_else(|| conflict("user"))?;
        user.failed_attempt_count = 0;
        user.locked = false;
        user.locked_at = None;
        user.audit.version += 1;
        state.access_logs.insert(log.audit.id, log.clone());
        Ok(())
    }

    async fn upsert_device(&self, device: &RegisteredDevice) -> AppResult<RegisteredDevice> {
        let mut state = self.lock();
        if let Some(existing) = state.devices.values_mut().find(|d| {
            d.user_id == device.user_id && d.device_fingerprint == device.device_fingerprint
        }) {
            existing.make = device.make.clone();
            existing.model = device.model.clone();
            existing.mac_address = device.mac_address.clone();
            existing.last_seen_on = device.last_seen_on;
            existing.audit.updated_on = device.audit.updated_on;
            existing.audit.updated_by = device.audit.updated_by;
            existing.audit.version += 1;
            return Ok(existing.clone());
        }
        state.devices.insert(device.audit.id, device.clone());
        Ok(device.clone())
    }

    async fn find_access_log_by_jti(
        &self,
        tenant_id: Uuid,
        jti: &str,
    ) -> AppResult<Option<AccessLog>> {
        Ok(self
            .lock()
            .access_logs
            .values()
            .find(|l| {
                l.audit.tenant_id == tenant_id
                    && l.refresh_jti.as_deref() == Some(jti)
                    && !l.audit.is_deleted()
            })
            .cloned())
    }

    async fn rotate_refresh(
        &self,
        tenant_id: Uuid,
        log_id: Uuid,
        old_jti: &str,
        new_jti: &str,
        new_exp: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        match state.access_logs.get_mut(&log_id).filter(|l| {
            l.audit.tenant_id == tenant_id
                && l.refresh_jti.as_deref() == Some(old_jti)
                && l.logged_out_at.is_none()
                && !l.audit.is_deleted()
        }) {
            Some(log) => {
                log.refresh_jti = Some(new_jti.to_string());
                log.refresh_exp = Some(new_exp);
                log.audit.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_logged_out(
        &self,
        tenant_id: Uuid,
        log_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        match state
            .access_logs
            .get_mut(&log_id)
            .filter(|l| l.audit.tenant_id == tenant_id && l.logged_out_at.is_none())
        {
            Some(log) => {
                log.logged_out_at = Some(at);
                log.audit.updated_on = at;
                log.audit.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_password(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        password_hash: &str,
        actor: Uuid,
    ) -> AppResult<()> {
        let mut state = self.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .filter(|u| u.audit.tenant_id == tenant_id && !u.audit.is_deleted())
            .ok_or_else(|| conflict("user"))?;
        user.password_hash = Some(password_hash.to_string());
        user.failed_attempt_count = 0;
        user.locked = false;
        user.locked_at = None;
        user.audit.updated_by = Some(actor);
        user.audit.version += 1;
        Ok(())
    }

    async fn count_active_staff_with_role(&self, tenant_id: Uuid, role_id: Uuid) -> AppResult<i64> {
        Ok(self
            .lock()
            .staff
            .values()
            .filter(|s| {
                s.audit.tenant_id == tenant_id
                    && s.active
                    && !s.audit.is_deleted()
                    && s.role_ids.contains(&role_id)
            })
            .count() as i64)
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn get_code(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        user_type: UserType,
        channel: VerificationChannel,
    ) -> AppResult<Option<VerificationCode>> {
        Ok(self
            .lock()
            .codes
            .values()
            .find(|c| {
                c.audit.tenant_id == tenant_id
                    && c.user_id == user_id
                    && c.user_type == user_type
                    && c.channel == channel
                    && !c.audit.is_deleted()
            })
            .cloned())
    }

    async fn upsert_code(&self, code: &VerificationCode) -> AppResult<VerificationCode> {
        let mut state = self.lock();
        if let Some(existing) = state.codes.values_mut().find(|c| {
            c.audit.tenant_id == code.audit.tenant_id
                && c.user_id == code.user_id
                && c.user_type == code.user_type
                && c.channel == code.channel
        }) {
            existing.otp_type = code.otp_type;
            existing.code = code.code.clone();
            existing.expires_on = code.expires_on;
            existing.last_sent_on = code.last_sent_on;
            existing.consumed_on = None;
            existing.audit.deleted_by = None;
            existing.audit.updated_on = code.audit.updated_on;
            existing.audit.updated_by = code.audit.updated_by;
            existing.audit.version += 1;
            return Ok(existing.clone());
        }
        state.codes.insert(code.audit.id, code.clone());
        Ok(code.clone())
    }

    async fn find_live_codes(
        &self,
        tenant_id: Uuid,
        user_ids: &[Uuid],
        user_type: UserType,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<VerificationCode>> {
        let mut live: Vec<VerificationCode> = self
            .lock()
            .codes
            .values()
            .filter(|c| {
                c.audit.tenant_id == tenant_id
                    && user_ids.contains(&c.user_id)
                    && c.user_type == user_type
                    && c.consumed_on.is_none()
                    && c.expires_on > now
                    && !c.audit.is_deleted()
            })
            .cloned()
            .collect();
        live.sort_by(|a, b| b.last_sent_on.cmp(&a.last_sent_on));
        Ok(live)
    }

    async fn consume_code(
        &self,
        tenant_id: Uuid,
        code_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        match state
            .codes
            .get_mut(&code_id)
            .filter(|c| c.audit.tenant_id == tenant_id && c.consumed_on.is_none())
        {
            Some(code) => {
                code.consumed_on = Some(now);
                code.audit.updated_on = now;
                code.audit.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn retire_code(&self, tenant_id: Uuid, code_id: Uuid, actor: Uuid) -> AppResult<bool> {
        let mut state = self.lock();
        match state
            .codes
            .get_mut(&code_id)
            .filter(|c| c.audit.tenant_id == tenant_id && !c.audit.is_deleted())
        {
            Some(code) => {
                code.audit.deleted_by = Some(actor);
                code.audit.updated_by = Some(actor);
                code.audit.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl AuthzStore for MemoryStore {
    async fn list_roles(&self, tenant_id: Uuid) -> AppResult<Vec<UserRole>> {
        let mut roles: Vec<UserRole> = self
            .lock()
            .roles
            .values()
            .filter(|r| r.audit.tenant_id == tenant_id && !r.audit.is_deleted())
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn get_role(&self, tenant_id: Uuid, role_id: Uuid) -> AppResult<Option<UserRole>> {
        Ok(self
            .lock()
            .roles
            .get(&role_id)
            .filter(|r| r.audit.tenant_id == tenant_id && !r.audit.is_deleted())
            .cloned())
    }

    async fn list_modules(&self, tenant_id: Uuid) -> AppResult<Vec<Module>> {
        let mut modules: Vec<Module> = self
            .lock()
            .modules
            .iter()
            .filter(|m| m.audit.tenant_id == tenant_id && !m.audit.is_deleted())
            .cloned()
            .collect();
        modules.sort_by(|a, b| (&a.product, &a.code).cmp(&(&b.product, &b.code)));
        Ok(modules)
    }

    async fn find_module(&self, tenant_id: Uuid, code: &str) -> AppResult<Option<Module>> {
        Ok(self
            .lock()
            .modules
            .iter()
            .find(|m| m.audit.tenant_id == tenant_id && m.code == code && !m.audit.is_deleted())
            .cloned())
    }

    async fn list_submodule_compositions(
        &self,
        tenant_id: Uuid,
    ) -> AppResult<Vec<SubModuleComposition>> {
        Ok(self
            .lock()
            .submodule_compositions
            .iter()
            .filter(|c| c.audit.tenant_id == tenant_id && !c.audit.is_deleted())
            .cloned()
            .collect())
    }

    async fn find_submodule_composition(
        &self,
        tenant_id: Uuid,
        module_id: Uuid,
        submodule_id: Uuid,
    ) -> AppResult<Option<SubModuleComposition>> {
        Ok(self
            .lock()
            .submodule_compositions
            .iter()
            .find(|c| {
                c.audit.tenant_id == tenant_id
                    && c.module_id == module_id
                    && c.submodule_id == submodule_id
                    && !c.audit.is_deleted()
            })
            .cloned())
    }

    async fn list_attribute_compositions(
        &self,
        tenant_id: Uuid,
    ) -> AppResult<Vec<EntityAttributeComposition>> {
        Ok(self
            .lock()
            .attribute_compositions
            .iter()
            .filter(|c| c.audit.tenant_id == tenant_id && !c.audit.is_deleted())
            .cloned()
            .collect())
    }

    async fn find_attribute_composition(
        &self,
        tenant_id: Uuid,
        entity: &str,
        attribute: &str,
    ) -> AppResult<Option<EntityAttributeComposition>> {
        let state = self.lock();
        let Some(entity) = state
            .entities
            .iter()
            .find(|e| e.audit.tenant_id == tenant_id && e.name == entity && !e.audit.is_deleted())
        else {
            return Ok(None);
        };
        Ok(state
            .attribute_compositions
            .iter()
            .find(|c| {
                c.audit.tenant_id == tenant_id
                    && c.entity_id == entity.audit.id
                    && c.attribute == attribute
                    && !c.audit.is_deleted()
            })
            .cloned())
    }

    async fn module_permissions(
        &self,
        tenant_id: Uuid,
        module_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<ModulePermission>> {
        Ok(self
            .lock()
            .module_permissions
            .iter()
            .filter(|p| {
                p.audit.tenant_id == tenant_id
                    && p.module_id == module_id
                    && role_ids.contains(&p.role_id)
                    && !p.audit.is_deleted()
            })
            .cloned()
            .collect())
    }

    async fn submodule_permissions(
        &self,
        tenant_id: Uuid,
        composition_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<SubModulePermission>> {
        Ok(self
            .lock()
            .submodule_permissions
            .iter()
            .filter(|p| {
                p.audit.tenant_id == tenant_id
                    && p.composition_id == composition_id
                    && role_ids.contains(&p.role_id)
                    && !p.audit.is_deleted()
            })
            .cloned()
            .collect())
    }

    async fn attribute_permissions(
        &self,
        tenant_id: Uuid,
        composition_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<EntityAttributePermission>> {
        Ok(self
            .lock()
            .attribute_permissions
            .iter()
            .filter(|p| {
                p.audit.tenant_id == tenant_id
                    && p.composition_id == composition_id
                    && role_ids.contains(&p.role_id)
                    && !p.audit.is_deleted()
            })
            .cloned()
            .collect())
    }

    async fn role_permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> AppResult<RolePermissionSet> {
        let state = self.lock();
        let live = |t: Uuid, r: Uuid, deleted: bool| t == tenant_id && r == role_id && !deleted;
        Ok(RolePermissionSet {
            modules: state
                .module_permissions
                .iter()
                .filter(|p| live(p.audit.tenant_id, p.role_id, p.audit.is_deleted()))
                .cloned()
                .collect(),
            submodules: state
                .submodule_permissions
                .iter()
                .filter(|p| live(p.audit.tenant_id, p.role_id, p.audit.is_deleted()))
                .cloned()
                .collect(),
            attributes: state
                .attribute_permissions
                .iter()
                .filter(|p| live(p.audit.tenant_id, p.role_id, p.audit.is_deleted()))
                .cloned()
                .collect(),
        })
    }

    async fn create_role(
        &self,
        role: &UserRole,
        grants: &RolePermissionSet,
    ) -> AppResult<UserRole> {
        let mut state = self.lock();
        let mut created = role.clone();
        created.seeded = true;
        state.roles.insert(created.audit.id, created.clone());
        upsert_module_grants(&mut state, &grants.modules);
        upsert_submodule_grants(&mut state, &grants.submodules);
        for grant in &grants.attributes {
            let exists = state
                .attribute_permissions
                .iter()
                .any(|p| p.composition_id == grant.composition_id && p.role_id == grant.role_id);
            if !exists {
                state.attribute_permissions.push(grant.clone());
            }
        }
        Ok(created)
    }

    async fn replace_role_permissions(
        &self,
        _tenant_id: Uuid,
        _role_id: Uuid,
        modules: &[ModulePermission],
        submodules: &[SubModulePermission],
    ) -> AppResult<()> {
        let mut state = self.lock();
        upsert_module_grants(&mut state, modules);
        upsert_submodule_grants(&mut state, submodules);
        Ok(())
    }

    async fn set_role_active(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        active: bool,
        actor: Uuid,
    ) -> AppResult<Option<UserRole>> {
        let mut state = self.lock();
        Ok(state
            .roles
            .get_mut(&role_id)
            .filter(|r| r.audit.tenant_id == tenant_id && !r.audit.is_deleted())
            .map(|role| {
                role.active = active;
                role.audit.updated_by = Some(actor);
                role.audit.version += 1;
                role.clone()
            }))
    }
}

fn upsert_module_grants(state: &mut MemoryState, grants: &[ModulePermission]) {
    for grant in grants {
        match state
            .module_permissions
            .iter_mut()
            .find(|p| p.module_id == grant.module_id && p.role_id == grant.role_id)
        {
            Some(existing) => {
                existing.flags = grant.flags;
                existing.active = grant.active;
                existing.audit.version += 1;
            }
            None => state.module_permissions.push(grant.clone()),
        }
    }
}

fn upsert_submodule_grants(state: &mut MemoryState, grants: &[SubModulePermission]) {
    for grant in grants {
        match state
            .submodule_permissions
            .iter_mut()
            .find(|p| p.composition_id == grant.composition_id && p.role_id == grant.role_id)
        {
            Some(existing) => {
                existing.flags = grant.flags;
                existing.active = grant.active;
                existing.audit.version += 1;
            }
            None => state.submodule_permissions.push(grant.clone()),
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn create_policy(&self, policy: &Policy, version: &PolicyVersion) -> AppResult<Policy> {
        let mut state = self.lock();
        let mut created = policy.clone();
        created.current_version_id = Some(version.audit.id);
        state
            .policy_versions
            .insert(version.audit.id, version.clone());
        state.policies.insert(created.audit.id, created.clone());
        Ok(created)
    }

    async fn get_policy(&self, tenant_id: Uuid, policy_id: Uuid) -> AppResult<Option<Policy>> {
        Ok(self
            .lock()
            .policies
            .get(&policy_id)
            .filter(|p| p.audit.tenant_id == tenant_id && !p.audit.is_deleted())
            .cloned())
    }

    async fn list_policies(
        &self,
        tenant_id: Uuid,
        status: Option<PolicyStatus>,
    ) -> AppResult<Vec<Policy>> {
        let mut policies: Vec<Policy> = self
            .lock()
            .policies
            .values()
            .filter(|p| p.audit.tenant_id == tenant_id && !p.audit.is_deleted())
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        policies.sort_by(|a, b| b.audit.created_on.cmp(&a.audit.created_on));
        Ok(policies)
    }

    async fn latest_version(
        &self,
        tenant_id: Uuid,
        policy_id: Uuid,
    ) -> AppResult<Option<PolicyVersion>> {
        Ok(self
            .lock()
            .policy_versions
            .values()
            .filter(|v| {
                v.audit.tenant_id == tenant_id && v.policy_id == policy_id && !v.audit.is_deleted()
            })
            .max_by_key(|v| v.version_number)
            .cloned())
    }

    async fn save_policy(
        &self,
        policy: &Policy,
        new_version: Option<&PolicyVersion>,
    ) -> AppResult<Policy> {
        let mut state = self.lock();
        if let Some(version) = new_version {
            state
                .policy_versions
                .insert(version.audit.id, version.clone());
        }
        let stored = state
            .policies
            .get_mut(&policy.audit.id)
            .filter(|p| !p.audit.is_deleted())
            .ok_or_else(|| conflict("policy"))?;
        check_version(stored.audit.version, policy.audit.version, "policy")?;
        *stored = policy.clone();
        if let Some(version) = new_version {
            stored.current_version_id = Some(version.audit.id);
        }
        Ok(stored.clone())
    }

    async fn set_version_pdf(
        &self,
        tenant_id: Uuid,
        version_id: Uuid,
        pdf_ref: &str,
    ) -> AppResult<()> {
        if let Some(version) = self
            .lock()
            .policy_versions
            .get_mut(&version_id)
            .filter(|v| v.audit.tenant_id == tenant_id)
        {
            version.pdf_ref = Some(pdf_ref.to_string());
        }
        Ok(())
    }

    async fn insert_acceptance(&self, acceptance: &UserPolicyAcceptance) -> AppResult<bool> {
        let mut state = self.lock();
        if state.acceptances.iter().any(|a| {
            a.user_id == acceptance.user_id && a.policy_version_id == acceptance.policy_version_id
        }) {
            return Ok(false);
        }
        state.acceptances.push(acceptance.clone());
        Ok(true)
    }

    async fn accepted_versions(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        policy_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i32)>> {
        let state = self.lock();
        let mut best: HashMap<Uuid, i32> = HashMap::new();
        for acceptance in state
            .acceptances
            .iter()
            .filter(|a| a.audit.tenant_id == tenant_id && a.user_id == user_id)
        {
            if let Some(version) = state
                .policy_versions
                .get(&acceptance.policy_version_id)
                .filter(|v| policy_ids.contains(&v.policy_id))
            {
                let entry = best.entry(version.policy_id).or_insert(version.version_number);
                *entry = (*entry).max(version.version_number);
            }
        }
        Ok(best.into_iter().collect())
    }

    async fn latest_versions(
        &self,
        tenant_id: Uuid,
        policy_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i32)>> {
        let state = self.lock();
        let mut latest: HashMap<Uuid, i32> = HashMap::new();
        for version in state.policy_versions.values().filter(|v| {
            v.audit.tenant_id == tenant_id
                && policy_ids.contains(&v.policy_id)
                && !v.audit.is_deleted()
        }) {
            let entry = latest.entry(version.policy_id).or_insert(version.version_number);
            *entry = (*entry).max(version.version_number);
        }
        Ok(latest.into_iter().collect())
    }
}

#[async_trait]
impl LookupStore for MemoryStore {
    async fn list_lookups(&self, tenant_id: Uuid) -> AppResult<Vec<Lookup>> {
        let mut lookups: Vec<Lookup> = self
            .lock()
            .lookups
            .iter()
            .filter(|l| l.audit.tenant_id == tenant_id && !l.audit.is_deleted())
            .cloned()
            .collect();
        lookups.sort_by(|a, b| (&a.name, a.sort_order).cmp(&(&b.name, b.sort_order)));
        Ok(lookups)
    }

    async fn cancellation_code(
        &self,
        tenant_id: Uuid,
        reason: &str,
    ) -> AppResult<Option<BillCancellationCodeComposition>> {
        Ok(self
            .lock()
            .cancellation_codes
            .iter()
            .find(|c| {
                c.audit.tenant_id == tenant_id
                    && c.cancellation_reason == reason
                    && !c.audit.is_deleted()
            })
            .cloned())
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn get_amenity(&self, tenant_id: Uuid, amenity_id: Uuid) -> AppResult<Option<Amenity>> {
        Ok(self
            .lock()
            .amenities
            .get(&amenity_id)
            .filter(|a| a.audit.tenant_id == tenant_id && !a.audit.is_deleted())
            .cloned())
    }

    async fn delete_slots(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        actor: Uuid,
    ) -> AppResult<u64> {
        let mut state = self.lock();
        let mut deleted = 0;
        for slot in state.slots.values_mut().filter(|s| {
            s.audit.tenant_id == tenant_id
                && s.amenity_id == amenity_id
                && s.slot_date >= from
                && s.slot_date <= to
                && s.total_bookings == 0
                && !s.audit.is_deleted()
        }) {
            slot.audit.deleted_by = Some(actor);
            slot.audit.version += 1;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn upsert_slot(&self, slot: &AmenitySlot) -> AppResult<bool> {
        let mut state = self.lock();
        if let Some(existing) = state.slots.values_mut().find(|s| {
            s.amenity_id == slot.amenity_id
                && s.slot_date == slot.slot_date
                && s.slot_start_time == slot.slot_start_time
                && !s.audit.is_deleted()
        }) {
            existing.slot_end_time = slot.slot_end_time;
            existing.slot_duration_minutes = slot.slot_duration_minutes;
            existing.is_available = slot.is_available;
            existing.max_concurrent_bookings = slot.max_concurrent_bookings;
            existing.audit.updated_by = slot.audit.updated_by;
            existing.audit.version += 1;
            return Ok(false);
        }
        state.slots.insert(slot.audit.id, slot.clone());
        Ok(true)
    }

    async fn list_slots(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<AmenitySlot>> {
        let mut slots: Vec<AmenitySlot> = self
            .lock()
            .slots
            .values()
            .filter(|s| {
                s.audit.tenant_id == tenant_id
                    && s.amenity_id == amenity_id
                    && s.slot_date >= from
                    && s.slot_date <= to
                    && !s.audit.is_deleted()
            })
            .cloned()
            .collect();
        slots.sort_by_key(|s| (s.slot_date, s.slot_start_time));
        Ok(slots)
    }

    async fn mark_slots_unavailable(
        &self,
        tenant_id: Uuid,
        slot_ids: &[Uuid],
        actor: Uuid,
    ) -> AppResult<u64> {
        let mut state = self.lock();
        let mut changed = 0;
        for id in slot_ids {
            if let Some(slot) = state.slots.get_mut(id).filter(|s| {
                s.audit.tenant_id == tenant_id && s.is_available && !s.audit.is_deleted()
            }) {
                slot.is_available = false;
                slot.audit.updated_by = Some(actor);
                slot.audit.version += 1;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn list_blackouts(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<AmenityBlackoutPeriod>> {
        let mut blackouts: Vec<AmenityBlackoutPeriod> = self
            .lock()
            .blackouts
            .iter()
            .filter(|b| {
                b.audit.tenant_id == tenant_id
                    && b.amenity_id == amenity_id
                    && b.start_date <= to
                    && b.end_date >= from
                    && !b.audit.is_deleted()
            })
            .cloned()
            .collect();
        blackouts.sort_by_key(|b| b.start_date);
        Ok(blackouts)
    }

    async fn insert_booking(&self, booking: &AmenityBooking) -> AppResult<AmenityBooking> {
        self.lock()
            .bookings
            .insert(booking.audit.id, booking.clone());
        Ok(booking.clone())
    }

    async fn get_booking(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
    ) -> AppResult<Option<AmenityBooking>> {
        let state = self.lock();
        Ok(state
            .bookings
            .get(&booking_id)
            .filter(|b| state.booking_visible(ctx, b))
            .cloned())
    }

    async fn update_booking(&self, booking: &AmenityBooking) -> AppResult<AmenityBooking> {
        self.lock().write_booking(booking)
    }

    async fn confirm_booking(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<AmenityBooking> {
        let mut state = self.lock();
        let mut pending = state
            .bookings
            .get(&booking_id)
            .filter(|b| b.audit.tenant_id == tenant_id && !b.audit.is_deleted())
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))?;

        booking::confirm(&mut pending, actor, now)?;

        let slot_ids = state.slots_for_booking(&pending);
        for id in &slot_ids {
            let Some(slot) = state.slots.get(id) else {
                continue;
            };
            let confirmed = state
                .bookings
                .values()
                .filter(|b| {
                    b.audit.tenant_id == tenant_id
                        && b.amenity_id == slot.amenity_id
                        && b.booking_date == slot.slot_date
                        && b.start_time < slot.slot_end_time
                        && slot.slot_start_time < b.end_time
                        && b.status == BookingStatus::Confirmed
                        && b.audit.id != booking_id
                        && !b.audit.is_deleted()
                })
                .count() as i64;
            booking::ensure_capacity(slot, confirmed)?;
        }
        if !slot_ids.is_empty() {
            state.adjust_slot_bookings(&slot_ids, 1, actor);
        }

        pending.audit.version += 1;
        pending.audit.updated_on = now;
        pending.audit.updated_by = Some(actor);
        state.write_booking(&pending)
    }

    async fn cancel_booking(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(AmenityBooking, CancelOutcome)> {
        self.lock().cancel_visible(ctx, booking_id, reason, now)
    }

    async fn cancel_occurrence(
        &self,
        ctx: &RequestContext,
        exception: &RecurrenceException,
        child_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(RecurrenceException, AmenityBooking, CancelOutcome)> {
        let mut state = self.lock();
        // The booking write is the only step that can fail, so it goes first.
        let (cancelled, outcome) = state.cancel_visible(ctx, child_id, reason, now)?;
        let saved = state.upsert_exception(exception);
        Ok((saved, cancelled, outcome))
    }

    async fn list_exceptions(
        &self,
        tenant_id: Uuid,
        parent_id: Uuid,
    ) -> AppResult<Vec<RecurrenceException>> {
        let mut exceptions: Vec<RecurrenceException> = self
            .lock()
            .exceptions
            .values()
            .filter(|e| {
                e.audit.tenant_id == tenant_id
                    && e.parent_booking_id == parent_id
                    && !e.audit.is_deleted()
            })
            .cloned()
            .collect();
        exceptions.sort_by_key(|e| e.occurrence_date);
        Ok(exceptions)
    }

    async fn apply_exception(
        &self,
        exception: &RecurrenceException,
        child: Option<&AmenityBooking>,
    ) -> AppResult<RecurrenceException> {
        let mut state = self.lock();
        let saved = state.upsert_exception(exception);
        if let Some(child) = child {
            state.write_booking(child)?;
        }
        Ok(saved)
    }

    async fn list_children(
        &self,
        tenant_id: Uuid,
        parent_id: Uuid,
    ) -> AppResult<Vec<AmenityBooking>> {
        let mut children: Vec<AmenityBooking> = self
            .lock()
            .bookings
            .values()
            .filter(|b| {
                b.audit.tenant_id == tenant_id
                    && b.parent_booking_id == Some(parent_id)
                    && !b.audit.is_deleted()
            })
            .cloned()
            .collect();
        children.sort_by_key(|b| b.occurrence_date);
        Ok(children)
    }

    async fn insert_children(&self, children: &[AmenityBooking]) -> AppResult<usize> {
        let mut state = self.lock();
        let mut inserted = 0;
        for child in children {
            let exists = state.bookings.values().any(|b| {
                b.parent_booking_id.is_some()
                    && b.parent_booking_id == child.parent_booking_id
                    && b.occurrence_date == child.occurrence_date
                    && !b.audit.is_deleted()
            });
            if !exists {
                state.bookings.insert(child.audit.id, child.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn tax_rules(&self, tenant_id: Uuid, state_code: &str) -> AppResult<Vec<TaxPerState>> {
        let mut rules: Vec<TaxPerState> = self
            .lock()
            .tax_rules
            .iter()
            .filter(|r| {
                r.audit.tenant_id == tenant_id && r.state == state_code && !r.audit.is_deleted()
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| match (a.start_date, b.start_date) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Ok(rules)
    }

    async fn save_bill(&self, aggregate: &BillAggregate, replace: bool) -> AppResult<Bill> {
        let mut state = self.lock();
        let bill_id = aggregate.bill.audit.id;
        let saved = if replace {
            state.applied_rules.retain(|r| r.bill_id != bill_id);
            state.breakdowns.retain(|b| b.bill_id != bill_id);
            state.write_bill(&aggregate.bill)?
        } else {
            state.bills.insert(bill_id, aggregate.bill.clone());
            aggregate.bill.clone()
        };
        state.breakdowns.extend(aggregate.breakdowns.iter().cloned());
        state.applied_rules.extend(aggregate.applied.iter().cloned());
        state.summaries.retain(|s| s.bill_id != bill_id);
        state.summaries.extend(aggregate.summaries.iter().cloned());
        Ok(saved)
    }

    async fn get_bill(&self, ctx: &RequestContext, bill_id: Uuid) -> AppResult<Option<Bill>> {
        let state = self.lock();
        Ok(state
            .bills
            .get(&bill_id)
            .filter(|b| state.bill_visible(ctx, b))
            .cloned())
    }

    async fn get_bill_aggregate(
        &self,
        tenant_id: Uuid,
        bill_id: Uuid,
    ) -> AppResult<Option<BillAggregate>> {
        let state = self.lock();
        let Some(bill) = state
            .bills
            .get(&bill_id)
            .filter(|b| b.audit.tenant_id == tenant_id && !b.audit.is_deleted())
            .cloned()
        else {
            return Ok(None);
        };
        let mut breakdowns: Vec<BillBreakDown> = state
            .breakdowns
            .iter()
            .filter(|b| b.bill_id == bill_id)
            .cloned()
            .collect();
        breakdowns.sort_by_key(|b| b.position);
        let applied: Vec<AppliedRule> = state
            .applied_rules
            .iter()
            .filter(|r| r.bill_id == bill_id)
            .cloned()
            .collect();
        let mut summaries: Vec<BillSummary> = state
            .summaries
            .iter()
            .filter(|s| s.bill_id == bill_id)
            .cloned()
            .collect();
        summaries.sort_by_key(|s| s.position);
        Ok(Some(BillAggregate {
            bill,
            breakdowns,
            applied,
            summaries,
        }))
    }

    async fn update_bill(&self, bill: &Bill) -> AppResult<Bill> {
        self.lock().write_bill(bill)
    }

    async fn get_payment_plan(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> AppResult<Option<PaymentPlan>> {
        Ok(self
            .lock()
            .payment_plans
            .get(&plan_id)
            .filter(|p| p.audit.tenant_id == tenant_id && !p.audit.is_deleted())
            .cloned())
    }

    async fn get_bill_payment_plan(
        &self,
        tenant_id: Uuid,
        bill_id: Uuid,
    ) -> AppResult<Option<BillPaymentPlan>> {
        Ok(self
            .lock()
            .bill_payment_plans
            .values()
            .filter(|p| {
                p.audit.tenant_id == tenant_id && p.bill_id == bill_id && !p.audit.is_deleted()
            })
            .max_by_key(|p| p.audit.created_on)
            .cloned())
    }

    async fn attach_payment_plan(
        &self,
        plan: &BillPaymentPlan,
        bill: &Bill,
        summaries: &[BillSummary],
    ) -> AppResult<BillPaymentPlan> {
        let mut state = self.lock();
        state.write_bill(bill)?;
        state.summaries.retain(|s| s.bill_id != bill.audit.id);
        state.summaries.extend(summaries.iter().cloned());
        state.bill_payment_plans.insert(plan.audit.id, plan.clone());
        Ok(plan.clone())
    }

    async fn update_bill_payment_plan(&self, plan: &BillPaymentPlan) -> AppResult<()> {
        self.lock().write_bill_payment_plan(plan)
    }

    async fn active_bill_payment_plans(&self) -> AppResult<Vec<BillPaymentPlan>> {
        let mut plans: Vec<BillPaymentPlan> = self
            .lock()
            .bill_payment_plans
            .values()
            .filter(|p| p.active && p.installments_paid < p.duration && !p.audit.is_deleted())
            .cloned()
            .collect();
        plans.sort_by_key(|p| (p.audit.tenant_id, p.start_date));
        Ok(plans)
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn insert_payment(&self, payment: &Payment) -> AppResult<Payment> {
        self.lock().insert_payment_row(payment)
    }

    async fn update_payment(&self, payment: &Payment) -> AppResult<Payment> {
        self.lock().write_payment(payment)
    }

    async fn get_payment(&self, tenant_id: Uuid, payment_id: Uuid) -> AppResult<Option<Payment>> {
        Ok(self
            .lock()
            .payments
            .get(&payment_id)
            .filter(|p| p.audit.tenant_id == tenant_id && !p.audit.is_deleted())
            .cloned())
    }

    async fn payments_for_bill(&self, tenant_id: Uuid, bill_id: Uuid) -> AppResult<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .lock()
            .payments
            .values()
            .filter(|p| {
                p.audit.tenant_id == tenant_id && p.bill_id == bill_id && !p.audit.is_deleted()
            })
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.audit.created_on);
        Ok(payments)
    }

    async fn pending_gateway_payments(
        &self,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<Payment>> {
        let mut pending: Vec<Payment> = self
            .lock()
            .payments
            .values()
            .filter(|p| {
                matches!(p.status, PaymentStatus::Pending | PaymentStatus::InProcess)
                    && (p.method.uses_gateway()
                        || p.method == keystone_core::models::PaymentMethod::BackToSource)
                    && p.audit.created_on < older_than
                    && !p.audit.is_deleted()
            })
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.audit.created_on);
        Ok(pending)
    }

    async fn settle_payment(&self, payment: &Payment, bill: &Bill) -> AppResult<()> {
        let mut state = self.lock();
        let stored = state
            .payments
            .get(&payment.audit.id)
            .ok_or_else(|| conflict("payment"))?;
        check_version(stored.audit.version, payment.audit.version, "payment")?;
        state.write_bill(bill)?;
        state.write_payment(payment)?;
        Ok(())
    }

    async fn settle_installment(
        &self,
        payment: &Payment,
        bill: &Bill,
        plan: &BillPaymentPlan,
    ) -> AppResult<()> {
        let mut state = self.lock();
        let stored = state
            .payments
            .get(&payment.audit.id)
            .ok_or_else(|| conflict("payment"))?;
        check_version(stored.audit.version, payment.audit.version, "payment")?;
        state.check_bill_payment_plan(plan)?;
        state.write_bill(bill)?;
        state.write_payment(payment)?;
        state.write_bill_payment_plan(plan)
    }

    async fn log_transaction(&self, log: &TransactionLog) -> AppResult<()> {
        self.lock().transaction_logs.push(log.clone());
        Ok(())
    }

    async fn get_saved_card(&self, tenant_id: Uuid, card_id: Uuid) -> AppResult<Option<SavedCard>> {
        Ok(self
            .lock()
            .cards
            .get(&card_id)
            .filter(|c| c.audit.tenant_id == tenant_id && !c.audit.is_deleted())
            .cloned())
    }

    async fn get_saved_account(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
    ) -> AppResult<Option<SavedAccount>> {
        Ok(self
            .lock()
            .accounts
            .get(&account_id)
            .filter(|a| a.audit.tenant_id == tenant_id && !a.audit.is_deleted())
            .cloned())
    }

    async fn save_card(&self, card: &SavedCard) -> AppResult<SavedCard> {
        let mut state = self.lock();
        if card.primary_method {
            clear_primary(&mut state, card.audit.tenant_id, card.resident_id, card.audit.id);
        }
        state.cards.insert(card.audit.id, card.clone());
        Ok(card.clone())
    }

    async fn save_account(&self, account: &SavedAccount) -> AppResult<SavedAccount> {
        let mut state = self.lock();
        if account.primary_method {
            clear_primary(
                &mut state,
                account.audit.tenant_id,
                account.resident_id,
                account.audit.id,
            );
        }
        state.accounts.insert(account.audit.id, account.clone());
        Ok(account.clone())
    }

    async fn recon_state(&self, tenant_id: Uuid) -> AppResult<Option<GatewayReconState>> {
        Ok(self.lock().recon.get(&tenant_id).cloned())
    }

    async fn save_recon_state(&self, recon: &GatewayReconState) -> AppResult<()> {
        self.lock().recon.insert(recon.tenant_id, recon.clone());
        Ok(())
    }
}

fn clear_primary(state: &mut MemoryState, tenant_id: Uuid, resident_id: Uuid, keep: Uuid) {
    for card in state.cards.values_mut().filter(|c| {
        c.audit.tenant_id == tenant_id && c.resident_id == resident_id && c.audit.id != keep
    }) {
        card.primary_method = false;
    }
    for account in state.accounts.values_mut().filter(|a| {
        a.audit.tenant_id == tenant_id && a.resident_id == resident_id && a.audit.id != keep
    }) {
        account.primary_method = false;
    }
}

#[async_trait]
impl RefundStore for MemoryStore {
    async fn create_refund_request(
        &self,
        request: &BillRefundRequest,
        children: &[Payment],
        bill: &Bill,
    ) -> AppResult<BillRefundRequest> {
        let mut state = self.lock();
        state.write_bill(bill)?;
        state
            .refund_requests
            .insert(request.audit.id, request.clone());
        for child in children {
            state.insert_payment_row(child)?;
        }
        Ok(request.clone())
    }

    async fn get_refund_request(
        &self,
        ctx: &RequestContext,
        request_id: Uuid,
    ) -> AppResult<Option<BillRefundRequest>> {
        let state = self.lock();
        Ok(state
            .refund_requests
            .get(&request_id)
            .filter(|r| r.audit.tenant_id == ctx.tenant_id && !r.audit.is_deleted())
            .filter(|r| {
                state
                    .bills
                    .get(&r.bill_id)
                    .is_some_and(|b| state.bill_visible(ctx, b))
            })
            .cloned())
    }

    async fn refund_children(&self, tenant_id: Uuid, request_id: Uuid) -> AppResult<Vec<Payment>> {
        let mut children: Vec<Payment> = self
            .lock()
            .payments
            .values()
            .filter(|p| {
                p.audit.tenant_id == tenant_id
                    && p.refund_request_id == Some(request_id)
                    && p.transaction_type == TransactionType::Refund
                    && !p.audit.is_deleted()
            })
            .cloned()
            .collect();
        children.sort_by_key(|p| (p.audit.created_on, p.audit.id));
        Ok(children)
    }

    async fn record_refund_progress(
        &self,
        child: &Payment,
        parent: Option<&Payment>,
        offset: Option<&Payment>,
    ) -> AppResult<()> {
        let mut state = self.lock();
        for payment in std::iter::once(child).chain(parent) {
            let stored = state
                .payments
                .get(&payment.audit.id)
                .ok_or_else(|| conflict("payment"))?;
            check_version(stored.audit.version, payment.audit.version, "payment")?;
        }
        state.write_payment(child)?;
        if let Some(parent) = parent {
            state.write_payment(parent)?;
        }
        if let Some(offset) = offset {
            state.insert_payment_row(offset)?;
        }
        Ok(())
    }

    async fn finish_refund_request(
        &self,
        request: &BillRefundRequest,
        bill: &Bill,
    ) -> AppResult<()> {
        let mut state = self.lock();
        let stored = state
            .refund_requests
            .get(&request.audit.id)
            .ok_or_else(|| conflict("refund request"))?;
        check_version(stored.audit.version, request.audit.version, "refund request")?;
        state.write_bill(bill)?;
        state
            .refund_requests
            .insert(request.audit.id, request.clone());
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn enqueue(&self, notification: &Notification) -> AppResult<()> {
        self.lock()
            .notifications
            .insert(notification.audit.id, notification.clone());
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        let mut state = self.lock();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .notifications
            .values()
            .filter(|n| {
                n.status == NotificationStatus::Queued
                    && n.next_attempt_at <= now
                    && !n.audit.is_deleted()
            })
            .map(|n| (n.next_attempt_at, n.audit.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(n) = state.notifications.get_mut(&id) {
                n.next_attempt_at = lease_until;
                n.audit.updated_on = now;
                claimed.push(n.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, notification_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.lock();
        let n = state
            .notifications
            .get_mut(&notification_id)
            .ok_or_else(|| conflict("notification"))?;
        n.status = NotificationStatus::Sent;
        n.sent_on = Some(at);
        n.attempts += 1;
        n.last_error = None;
        Ok(())
    }

    async fn mark_retry(
        &self,
        notification_id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<()> {
        let mut state = self.lock();
        let n = state
            .notifications
            .get_mut(&notification_id)
            .ok_or_else(|| conflict("notification"))?;
        n.attempts = attempts;
        n.next_attempt_at = next_attempt_at;
        n.last_error = Some(error.to_string());
        Ok(())
    }

    async fn mark_failed(&self, notification_id: Uuid, attempts: i32, error: &str) -> AppResult<()> {
        let mut state = self.lock();
        let n = state
            .notifications
            .get_mut(&notification_id)
            .ok_or_else(|| conflict("notification"))?;
        n.status = NotificationStatus::Failed;
        n.attempts = attempts;
        n.last_error = Some(error.to_string());
        Ok(())
    }
}
