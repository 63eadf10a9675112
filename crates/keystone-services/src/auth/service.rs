use std::sync::Arc;

use keystone_core::identity::{derive_username, normalize_email, FailureOutcome, LockoutPolicy};
use keystone_core::models::{
    AccessLevel, AccessLog, AuditEnvelope, DeviceDetail, LocationDetail, LoginStatus, NewUser,
    RegisteredDevice, Resident, Staff, Tenant, User, UserStatus, UserType, VerificationChannel,
};
use keystone_core::{AppError, AppResult, RequestContext};
use keystone_db::{IdentityStore, TenantStore, VerificationStore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::password::{hash_password, validate_password, verify_password};
use super::tokens::{TokenClaims, TokenService, TokenType};
use crate::audit::{AuditEventType, AuditLogEntry};
use crate::clock::Clock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub device_detail: Option<DeviceDetail>,
    #[serde(default)]
    pub location_detail: Option<LocationDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access: String,
    pub refresh: String,
    /// Seconds until the access token expires.
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "profile_type", rename_all = "snake_case")]
pub enum UserProfile {
    Staff(Staff),
    Resident(Resident),
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub user: User,
    pub profile: Option<UserProfile>,
    pub user_tokens: TokenBundle,
}

#[derive(Clone)]
pub struct AuthService {
    tenants: Arc<dyn TenantStore>,
    identity: Arc<dyn IdentityStore>,
    verification: Arc<dyn VerificationStore>,
    tokens: TokenService,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        identity: Arc<dyn IdentityStore>,
        verification: Arc<dyn VerificationStore>,
        tokens: TokenService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tenants,
            identity,
            verification,
            tokens,
            clock,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    async fn tenant(&self, tenant_id: Uuid) -> AppResult<Tenant> {
        self.tenants
            .get_tenant(tenant_id)
            .await?
            .filter(Tenant::is_active)
            .ok_or_else(|| AppError::NotFound(format!("tenant {}", tenant_id)))
    }

    /// Register a user. The username falls back to the email, then country code + phone.
    #[tracing::instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id))]
    pub async fn create_user(&self, ctx: &RequestContext, input: &NewUser) -> AppResult<User> {
        let email = input.email.as_deref().map(normalize_email);
        if let Some(email) = email.as_deref() {
            if self.identity.email_taken(ctx.tenant_id, email).await? {
                return Err(AppError::Duplicate(format!("email {}", email)));
            }
        }
        let username = match input.username.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => derive_username(
                email.as_deref(),
                input.country_code.as_deref(),
                input.phone.as_deref(),
            )
            .ok_or_else(|| AppError::MissingRequiredParam("email or phone".to_string()))?,
        };
        let password_hash = match input.password.as_deref() {
            Some(password) => {
                validate_password(password)?;
                Some(hash_password(password)?)
            }
            None => None,
        };

        let user = User {
            audit: AuditEnvelope::stamp_create_at(ctx, self.clock.now()),
            email,
            username,
            password_hash,
            is_active: true,
            is_superuser: false,
            is_staff: input.is_staff,
            access_level: input.access_level.unwrap_or(AccessLevel::Unit),
            first_name: input.first_name.clone(),
            last_name: input.last_name.clone(),
            phone: input.phone.clone(),
            country_code: input.country_code.clone(),
            date_of_birth: input.date_of_birth,
            status: UserStatus::Pending,
            locked: false,
            failed_attempt_count: 0,
            locked_at: None,
            languages: input.languages.clone(),
        };
        self.identity.insert_user(&user).await
    }

    /// Username/password sign-in with lockout accounting.
    #[tracing::instrument(skip(self, request), fields(tenant_id = %tenant_id))]
    pub async fn login(&self, tenant_id: Uuid, request: &LoginRequest) -> AppResult<LoginResponse> {
        let tenant = self.tenant(tenant_id).await?;
        let policy = LockoutPolicy::for_tenant(&tenant);
        let now = self.clock.now();
        let location = request.location_detail.clone().unwrap_or_default();

        let login = request.username.trim();
        let user = self
            .identity
            .find_user_by_login(tenant_id, &normalize_email(login))
            .await?
            .ok_or(AppError::UserNotFound)?;

        if policy.is_locked(&user, now) {
            AuditLogEntry::new(AuditEventType::UserLocked, tenant_id)
                .with_user_id(user.id())
                .with_client_ip(location.ip.clone())
                .failed()
                .log();
            return Err(AppError::UserLocked);
        }

        let ctx = RequestContext::system(tenant_id).with_user(user.id());
        let password_ok = match user.password_hash.as_deref() {
            Some(hash) if user.is_active => verify_password(&request.password, hash)?,
            _ => false,
        };

        if !password_ok {
            let log = access_log(&ctx, user.id(), LoginStatus::Failure, &location, now);
            let outcome = self
                .identity
                .record_login_failure(tenant_id, user.id(), &policy, &log, now)
                .await?;
            return match outcome {
                FailureOutcome::Locked => {
                    AuditLogEntry::new(AuditEventType::UserLocked, tenant_id)
                        .with_user_id(user.id())
                        .with_client_ip(location.ip.clone())
                        .with_details(serde_json::json!({ "limit": policy.limit }))
                        .failed()
                        .log();
                    Err(AppError::UserLocked)
                }
                FailureOutcome::Counted {
                    failed_attempt_count,
                } => {
                    AuditLogEntry::new(AuditEventType::LoginFailure, tenant_id)
                        .with_user_id(user.id())
                        .with_client_ip(location.ip.clone())
                        .with_details(serde_json::json!({
                            "failed_attempt_count": failed_attempt_count
                        }))
                        .failed()
                        .log();
                    Err(AppError::InvalidCredentials)
                }
            };
        }

        let device_id = match request
            .device_detail
            .as_ref()
            .and_then(|d| d.device_fingerprint.as_deref().map(|fp| (d, fp)))
        {
            Some((detail, fingerprint)) => {
                let device = RegisteredDevice {
                    audit: AuditEnvelope::stamp_create_at(&ctx, now),
                    user_id: user.id(),
                    make: detail.make.clone(),
                    model: detail.model.clone(),
                    mac_address: detail.mac_address.clone(),
                    device_fingerprint: fingerprint.to_string(),
                    last_seen_on: now,
                };
                Some(self.identity.upsert_device(&device).await?.audit.id)
            }
            None => None,
        };

        let user_type = user.user_type();
        let access = self.tokens.issue(
            tenant_id,
            user.id(),
            user_type,
            TokenType::Access,
            None,
            now,
        )?;
        let refresh = self.tokens.issue(
            tenant_id,
            user.id(),
            user_type,
            TokenType::Refresh,
            None,
            now,
        )?;

        let mut log = access_log(&ctx, user.id(), LoginStatus::Success, &location, now);
        log.refresh_jti = Some(refresh.jti.clone());
        log.refresh_exp = Some(refresh.expires_at);
        log.device_id = device_id;
        self.identity
            .record_login_success(tenant_id, user.id(), &log)
            .await?;

        AuditLogEntry::new(AuditEventType::LoginSuccess, tenant_id)
            .with_user_id(user.id())
            .with_client_ip(location.ip.clone())
            .log();

        let profile = self.profile(tenant_id, &user).await?;
        let mut user = user;
        user.failed_attempt_count = 0;
        user.locked = false;
        user.locked_at = None;

        Ok(LoginResponse {
            user,
            profile,
            user_tokens: TokenBundle {
                access: access.token,
                refresh: refresh.token,
                expires_in: (access.expires_at - now).num_seconds(),
            },
        })
    }

    async fn profile(&self, tenant_id: Uuid, user: &User) -> AppResult<Option<UserProfile>> {
        Ok(match user.user_type() {
            UserType::Staff => self
                .identity
                .get_staff_by_user(tenant_id, user.id())
                .await?
                .map(UserProfile::Staff),
            _ => self
                .identity
                .get_resident_by_user(tenant_id, user.id())
                .await?
                .map(UserProfile::Resident),
        })
    }

    /// Exchange a live refresh token for a new bundle, rotating its jti.
    #[tracing::instrument(skip(self, refresh_token, location))]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        location: Option<&LocationDetail>,
    ) -> AppResult<TokenBundle> {
        let claims = self.tokens.decode(refresh_token, TokenType::Refresh)?;
        let now = self.clock.now();
        let log = self
            .identity
            .find_access_log_by_jti(claims.tenant, &claims.jti)
            .await?
            .filter(|l| l.logged_out_at.is_none() && l.user_id == claims.sub)
            .ok_or_else(|| AppError::Unauthorized("Refresh token revoked".to_string()))?;

        let refresh = self.tokens.issue(
            claims.tenant,
            claims.sub,
            claims.user_type,
            TokenType::Refresh,
            None,
            now,
        )?;
        let rotated = self
            .identity
            .rotate_refresh(
                claims.tenant,
                log.audit.id,
                &claims.jti,
                &refresh.jti,
                refresh.expires_at,
            )
            .await?;
        if !rotated {
            return Err(AppError::Unauthorized(
                "Refresh token already used".to_string(),
            ));
        }
        let access = self.tokens.issue(
            claims.tenant,
            claims.sub,
            claims.user_type,
            TokenType::Access,
            None,
            now,
        )?;

        AuditLogEntry::new(AuditEventType::TokenRefreshed, claims.tenant)
            .with_user_id(claims.sub)
            .with_client_ip(location.and_then(|l| l.ip.clone()))
            .log();

        Ok(TokenBundle {
            access: access.token,
            refresh: refresh.token,
            expires_in: (access.expires_at - now).num_seconds(),
        })
    }

    /// Revoke the session behind a refresh token.
    pub async fn logout(&self, refresh_token: &str) -> AppResult<()> {
        let claims = self.tokens.decode(refresh_token, TokenType::Refresh)?;
        let log = self
            .identity
            .find_access_log_by_jti(claims.tenant, &claims.jti)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Unknown session".to_string()))?;
        self.identity
            .mark_logged_out(claims.tenant, log.audit.id, self.clock.now())
            .await?;

        AuditLogEntry::new(AuditEventType::Logout, claims.tenant)
            .with_user_id(claims.sub)
            .log();
        Ok(())
    }

    /// Set a new password with a `reset_password` token. The token's jti names the OTP that
    /// was verified to obtain it; the code is retired so the token cannot be replayed.
    #[tracing::instrument(skip(self, reset_token, new_password))]
    pub async fn reset_password(&self, reset_token: &str, new_password: &str) -> AppResult<()> {
        let claims = self.tokens.decode(reset_token, TokenType::ResetPassword)?;
        validate_password(new_password)?;

        let code_id: Uuid = claims
            .jti
            .parse()
            .map_err(|_| AppError::Unauthorized("Invalid token".to_string()))?;
        let mut verified = None;
        for channel in [VerificationChannel::Email, VerificationChannel::Sms] {
            if let Some(code) = self
                .verification
                .get_code(claims.tenant, claims.sub, claims.user_type, channel)
                .await?
            {
                if code.audit.id == code_id && code.consumed_on.is_some() {
                    verified = Some(code);
                    break;
                }
            }
        }
        let code = verified.ok_or(AppError::InvalidOtp)?;

        let hash = hash_password(new_password)?;
        self.identity
            .update_password(claims.tenant, claims.sub, &hash, claims.sub)
            .await?;
        self.verification
            .retire_code(claims.tenant, code.audit.id, claims.sub)
            .await?;

        AuditLogEntry::new(AuditEventType::PasswordChanged, claims.tenant)
            .with_user_id(claims.sub)
            .log();
        Ok(())
    }

    /// Resolve a verified access token into the per-request context.
    pub async fn request_context(&self, claims: &TokenClaims) -> AppResult<RequestContext> {
        let user = self
            .identity
            .get_user(claims.tenant, claims.sub)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| AppError::Unauthorized("Unknown or inactive user".to_string()))?;

        let mut ctx = RequestContext {
            tenant_id: claims.tenant,
            user_id: user.id(),
            user_type: user.user_type(),
            access_level: user.access_level,
            staff_id: None,
            resident_id: None,
            scope_ids: Vec::new(),
            is_superuser: user.is_superuser,
            request_id: None,
        };
        match self.profile(claims.tenant, &user).await? {
            Some(UserProfile::Staff(staff)) => {
                ctx.staff_id = Some(staff.audit.id);
                ctx.scope_ids = staff.scope_ids;
            }
            Some(UserProfile::Resident(resident)) => {
                ctx.resident_id = Some(resident.audit.id);
                ctx.scope_ids = resident.scope_ids;
            }
            None => {}
        }
        Ok(ctx)
    }
}

fn access_log(
    ctx: &RequestContext,
    user_id: Uuid,
    status: LoginStatus,
    location: &LocationDetail,
    now: chrono::DateTime<chrono::Utc>,
) -> AccessLog {
    AccessLog {
        audit: AuditEnvelope::stamp_create_at(ctx, now),
        user_id,
        login_status: status,
        refresh_jti: None,
        refresh_exp: None,
        device_id: None,
        ip: location.ip.clone(),
        location: location.location.clone(),
        logged_out_at: None,
    }
}
