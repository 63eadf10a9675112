//! Store traits
//!
//! Services talk to persistence only through these traits. Each one is implemented by a
//! Postgres repository in [`crate::db`]; `keystone-services` ships in-memory versions for
//! tests. Multi-row aggregate writes are single trait methods so that an implementation can
//! run them inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use keystone_core::access::RolePermissionSet;
use keystone_core::identity::{FailureOutcome, LockoutPolicy};
use keystone_core::models::{
    AccessLog, Amenity, AmenityBlackoutPeriod, AmenityBooking, AmenitySlot, Bill, BillAggregate,
    BillCancellationCodeComposition, BillPaymentPlan, BillRefundRequest, BillSummary,
    EntityAttributeComposition, EntityAttributePermission, GatewayReconState, Lookup, Module,
    ModulePermission, Notification, Payment, PaymentPlan, Policy, PolicyStatus, PolicyVersion,
    RecipientKind, RecurrenceException, RegisteredDevice, Resident, SavedAccount, SavedCard, Staff,
    SubModuleComposition, SubModulePermission, TaxPerState, Tenant, TransactionLog, User,
    UserPolicyAcceptance, UserRole, UserType, VerificationChannel, VerificationCode,
};
use keystone_core::reservation::CancelOutcome;
use keystone_core::{AppResult, RequestContext};
use uuid::Uuid;

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: Uuid) -> AppResult<Option<Tenant>>;

    async fn list_active_tenants(&self) -> AppResult<Vec<Tenant>>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Match on case-folded email or on username.
    async fn find_user_by_login(&self, tenant_id: Uuid, login: &str) -> AppResult<Option<User>>;

    async fn get_user(&self, tenant_id: Uuid, user_id: Uuid) -> AppResult<Option<User>>;

    async fn email_taken(&self, tenant_id: Uuid, email: &str) -> AppResult<bool>;

    async fn insert_user(&self, user: &User) -> AppResult<User>;

    async fn insert_staff(&self, staff: &Staff) -> AppResult<Staff>;

    async fn insert_resident(&self, resident: &Resident) -> AppResult<Resident>;

    async fn get_staff_by_user(&self, tenant_id: Uuid, user_id: Uuid) -> AppResult<Option<Staff>>;

    async fn get_resident_by_user(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Resident>>;

    /// Email address of the user behind a staff or resident profile.
    async fn profile_email(
        &self,
        tenant_id: Uuid,
        kind: RecipientKind,
        profile_id: Uuid,
    ) -> AppResult<Option<String>>;

    /// Applies a failed attempt under a row lock on the user and writes the access log.
    async fn record_login_failure(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        policy: &LockoutPolicy,
        log: &AccessLog,
        now: DateTime<Utc>,
    ) -> AppResult<FailureOutcome>;

    /// Clears the failure counters and lock, and writes the access log.
    async fn record_login_success(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        log: &AccessLog,
    ) -> AppResult<()>;

    /// Insert or touch the device keyed by (user, device_fingerprint).
    async fn upsert_device(&self, device: &RegisteredDevice) -> AppResult<RegisteredDevice>;

    async fn find_access_log_by_jti(
        &self,
        tenant_id: Uuid,
        jti: &str,
    ) -> AppResult<Option<AccessLog>>;

    /// Swap the refresh jti when `old_jti` is still current and the session is not logged out.
    async fn rotate_refresh(
        &self,
        tenant_id: Uuid,
        log_id: Uuid,
        old_jti: &str,
        new_jti: &str,
        new_exp: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn mark_logged_out(
        &self,
        tenant_id: Uuid,
        log_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Store a new password hash and reset the lockout counters.
    async fn update_password(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        password_hash: &str,
        actor: Uuid,
    ) -> AppResult<()>;

    async fn count_active_staff_with_role(&self, tenant_id: Uuid, role_id: Uuid) -> AppResult<i64>;
}

#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// The code row for (user, user_type, channel), consumed or not.
    async fn get_code(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        user_type: UserType,
        channel: VerificationChannel,
    ) -> AppResult<Option<VerificationCode>>;

    /// Insert, or overwrite the existing row for the same (user, user_type, channel).
    async fn upsert_code(&self, code: &VerificationCode) -> AppResult<VerificationCode>;

    async fn find_live_codes(
        &self,
        tenant_id: Uuid,
        user_ids: &[Uuid],
        user_type: UserType,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<VerificationCode>>;

    /// False when the code was already consumed.
    async fn consume_code(&self, tenant_id: Uuid, code_id: Uuid, now: DateTime<Utc>)
        -> AppResult<bool>;

    /// Soft-delete a code once the token it backed has been spent.
    async fn retire_code(&self, tenant_id: Uuid, code_id: Uuid, actor: Uuid) -> AppResult<bool>;
}

#[async_trait]
pub trait AuthzStore: Send + Sync {
    async fn list_roles(&self, tenant_id: Uuid) -> AppResult<Vec<UserRole>>;

    async fn get_role(&self, tenant_id: Uuid, role_id: Uuid) -> AppResult<Option<UserRole>>;

    async fn list_modules(&self, tenant_id: Uuid) -> AppResult<Vec<Module>>;

    async fn find_module(&self, tenant_id: Uuid, code: &str) -> AppResult<Option<Module>>;

    async fn list_submodule_compositions(
        &self,
        tenant_id: Uuid,
    ) -> AppResult<Vec<SubModuleComposition>>;

    async fn find_submodule_composition(
        &self,
        tenant_id: Uuid,
        module_id: Uuid,
        submodule_id: Uuid,
    ) -> AppResult<Option<SubModuleComposition>>;

    async fn list_attribute_compositions(
        &self,
        tenant_id: Uuid,
    ) -> AppResult<Vec<EntityAttributeComposition>>;

    async fn find_attribute_composition(
        &self,
        tenant_id: Uuid,
        entity: &str,
        attribute: &str,
    ) -> AppResult<Option<EntityAttributeComposition>>;

    async fn module_permissions(
        &self,
        tenant_id: Uuid,
        module_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<ModulePermission>>;

    async fn submodule_permissions(
        &self,
        tenant_id: Uuid,
        composition_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<SubModulePermission>>;

    async fn attribute_permissions(
        &self,
        tenant_id: Uuid,
        composition_id: Uuid,
        role_ids: &[Uuid],
    ) -> AppResult<Vec<EntityAttributePermission>>;

    async fn role_permissions(&self, tenant_id: Uuid, role_id: Uuid)
        -> AppResult<RolePermissionSet>;

    /// Insert the role with its grants and mark it seeded.
    async fn create_role(&self, role: &UserRole, grants: &RolePermissionSet)
        -> AppResult<UserRole>;

    /// Upsert module and submodule grants of one role, keyed by (module|composition, role).
    async fn replace_role_permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        modules: &[ModulePermission],
        submodules: &[SubModulePermission],
    ) -> AppResult<()>;

    async fn set_role_active(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        active: bool,
        actor: Uuid,
    ) -> AppResult<Option<UserRole>>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Insert a policy pointing at its first version.
    async fn create_policy(&self, policy: &Policy, version: &PolicyVersion) -> AppResult<Policy>;

    async fn get_policy(&self, tenant_id: Uuid, policy_id: Uuid) -> AppResult<Option<Policy>>;

    async fn list_policies(
        &self,
        tenant_id: Uuid,
        status: Option<PolicyStatus>,
    ) -> AppResult<Vec<Policy>>;

    async fn latest_version(
        &self,
        tenant_id: Uuid,
        policy_id: Uuid,
    ) -> AppResult<Option<PolicyVersion>>;

    /// Update the policy, inserting `new_version` first when present.
    async fn save_policy(
        &self,
        policy: &Policy,
        new_version: Option<&PolicyVersion>,
    ) -> AppResult<Policy>;

    async fn set_version_pdf(&self, tenant_id: Uuid, version_id: Uuid, pdf_ref: &str)
        -> AppResult<()>;

    /// False when the user had already accepted this version.
    async fn insert_acceptance(&self, acceptance: &UserPolicyAcceptance) -> AppResult<bool>;

    /// (policy_id, highest accepted version_number) per policy the user accepted.
    async fn accepted_versions(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        policy_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i32)>>;

    /// (policy_id, latest version_number) per policy.
    async fn latest_versions(
        &self,
        tenant_id: Uuid,
        policy_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i32)>>;
}

#[async_trait]
pub trait LookupStore: Send + Sync {
    async fn list_lookups(&self, tenant_id: Uuid) -> AppResult<Vec<Lookup>>;

    async fn cancellation_code(
        &self,
        tenant_id: Uuid,
        reason: &str,
    ) -> AppResult<Option<BillCancellationCodeComposition>>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn get_amenity(&self, tenant_id: Uuid, amenity_id: Uuid) -> AppResult<Option<Amenity>>;

    /// Soft-delete the amenity's slots in [from, to].
    async fn delete_slots(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        actor: Uuid,
    ) -> AppResult<u64>;

    /// Insert or refresh the slot keyed by (amenity, slot_date, slot_start_time).
    /// Returns true when a new row was created.
    async fn upsert_slot(&self, slot: &AmenitySlot) -> AppResult<bool>;

    async fn list_slots(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<AmenitySlot>>;

    async fn mark_slots_unavailable(
        &self,
        tenant_id: Uuid,
        slot_ids: &[Uuid],
        actor: Uuid,
    ) -> AppResult<u64>;

    async fn list_blackouts(
        &self,
        tenant_id: Uuid,
        amenity_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<AmenityBlackoutPeriod>>;

    async fn insert_booking(&self, booking: &AmenityBooking) -> AppResult<AmenityBooking>;

    /// Booking visible to the caller.
    async fn get_booking(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
    ) -> AppResult<Option<AmenityBooking>>;

    /// Write a booking whose envelope was already stamped; fails with a conflict when the
    /// stored version moved in between.
    async fn update_booking(&self, booking: &AmenityBooking) -> AppResult<AmenityBooking>;

    /// Confirm a PENDING booking. Locks the occupied slots, re-counts CONFIRMED bookings in
    /// the window and increments `total_bookings`.
    async fn confirm_booking(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<AmenityBooking>;

    /// Cancel a booking, releasing slot capacity when it was confirmed.
    async fn cancel_booking(
        &self,
        ctx: &RequestContext,
        booking_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(AmenityBooking, CancelOutcome)>;

    /// Record a CANCEL exception and cancel the materialized child in one transaction,
    /// releasing the child's slot capacity when it was confirmed.
    async fn cancel_occurrence(
        &self,
        ctx: &RequestContext,
        exception: &RecurrenceException,
        child_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<(RecurrenceException, AmenityBooking, CancelOutcome)>;

    async fn list_exceptions(
        &self,
        tenant_id: Uuid,
        parent_id: Uuid,
    ) -> AppResult<Vec<RecurrenceException>>;

    /// Upsert the exception keyed by (parent, occurrence_date) and rewrite the already
    /// materialized child, if any.
    async fn apply_exception(
        &self,
        exception: &RecurrenceException,
        child: Option<&AmenityBooking>,
    ) -> AppResult<RecurrenceException>;

    async fn list_children(&self, tenant_id: Uuid, parent_id: Uuid)
        -> AppResult<Vec<AmenityBooking>>;

    /// Insert occurrence rows, skipping (parent, occurrence_date) pairs that exist.
    async fn insert_children(&self, children: &[AmenityBooking]) -> AppResult<usize>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn tax_rules(&self, tenant_id: Uuid, state: &str) -> AppResult<Vec<TaxPerState>>;

    /// Write the bill with its breakdowns, rule snapshots and summaries. With `replace`, the
    /// existing children are removed first.
    async fn save_bill(&self, aggregate: &BillAggregate, replace: bool) -> AppResult<Bill>;

    /// Bill visible to the caller.
    async fn get_bill(&self, ctx: &RequestContext, bill_id: Uuid) -> AppResult<Option<Bill>>;

    async fn get_bill_aggregate(
        &self,
        tenant_id: Uuid,
        bill_id: Uuid,
    ) -> AppResult<Option<BillAggregate>>;

    /// Optimistic update of the bill row alone.
    async fn update_bill(&self, bill: &Bill) -> AppResult<Bill>;

    async fn get_payment_plan(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> AppResult<Option<PaymentPlan>>;

    async fn get_bill_payment_plan(
        &self,
        tenant_id: Uuid,
        bill_id: Uuid,
    ) -> AppResult<Option<BillPaymentPlan>>;

    /// Persist the plan, write the bill (now ON_PP) and replace its summary rows.
    async fn attach_payment_plan(
        &self,
        plan: &BillPaymentPlan,
        bill: &Bill,
        summaries: &[BillSummary],
    ) -> AppResult<BillPaymentPlan>;

    async fn update_bill_payment_plan(&self, plan: &BillPaymentPlan) -> AppResult<()>;

    /// Active plans with installments left, across tenants.
    async fn active_bill_payment_plans(&self) -> AppResult<Vec<BillPaymentPlan>>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Unique on transaction_id; a replayed gateway id yields a conflict.
    async fn insert_payment(&self, payment: &Payment) -> AppResult<Payment>;

    async fn update_payment(&self, payment: &Payment) -> AppResult<Payment>;

    async fn get_payment(&self, tenant_id: Uuid, payment_id: Uuid) -> AppResult<Option<Payment>>;

    async fn payments_for_bill(&self, tenant_id: Uuid, bill_id: Uuid) -> AppResult<Vec<Payment>>;

    /// PENDING / IN_PROCESS gateway payments created before `older_than`, across tenants.
    async fn pending_gateway_payments(&self, older_than: DateTime<Utc>)
        -> AppResult<Vec<Payment>>;

    /// Write a payment outcome and the bill it moved together.
    async fn settle_payment(&self, payment: &Payment, bill: &Bill) -> AppResult<()>;

    /// Write an installment outcome with its bill and the bill's payment plan.
    async fn settle_installment(
        &self,
        payment: &Payment,
        bill: &Bill,
        plan: &BillPaymentPlan,
    ) -> AppResult<()>;

    async fn log_transaction(&self, log: &TransactionLog) -> AppResult<()>;

    async fn get_saved_card(&self, tenant_id: Uuid, card_id: Uuid) -> AppResult<Option<SavedCard>>;

    async fn get_saved_account(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
    ) -> AppResult<Option<SavedAccount>>;

    /// Insert a card; a primary card clears the flag on every other instrument of the resident.
    async fn save_card(&self, card: &SavedCard) -> AppResult<SavedCard>;

    async fn save_account(&self, account: &SavedAccount) -> AppResult<SavedAccount>;

    async fn recon_state(&self, tenant_id: Uuid) -> AppResult<Option<GatewayReconState>>;

    async fn save_recon_state(&self, state: &GatewayReconState) -> AppResult<()>;
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Insert the request with its child refund payments and write the bill.
    async fn create_refund_request(
        &self,
        request: &BillRefundRequest,
        children: &[Payment],
        bill: &Bill,
    ) -> AppResult<BillRefundRequest>;

    /// Request visible to the caller.
    async fn get_refund_request(
        &self,
        ctx: &RequestContext,
        request_id: Uuid,
    ) -> AppResult<Option<BillRefundRequest>>;

    async fn refund_children(&self, tenant_id: Uuid, request_id: Uuid) -> AppResult<Vec<Payment>>;

    /// Write one processed child refund together with the parent it drew from and, for
    /// refunds returned outside the gateway, the offsetting credit line.
    async fn record_refund_progress(
        &self,
        child: &Payment,
        parent: Option<&Payment>,
        offset: Option<&Payment>,
    ) -> AppResult<()>;

    async fn finish_refund_request(&self, request: &BillRefundRequest, bill: &Bill)
        -> AppResult<()>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn enqueue(&self, notification: &Notification) -> AppResult<()>;

    /// Lease up to `limit` queued rows that are due. Leased rows are not handed out again
    /// until `lease_until`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Notification>>;

    async fn mark_sent(&self, notification_id: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    async fn mark_retry(
        &self,
        notification_id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<()>;

    async fn mark_failed(&self, notification_id: Uuid, attempts: i32, error: &str)
        -> AppResult<()>;
}
