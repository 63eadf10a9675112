use chrono::Duration;
use keystone_core::models::{OtpType, UserType, VerificationChannel};
use keystone_core::AppError;
use keystone_services::auth::LoginRequest;
use keystone_services::test_helpers::*;
use keystone_services::{OtpAction, OtpRequest, OtpResponse};
use uuid::Uuid;

struct Seeded {
    services: TestServices,
    tenant_id: Uuid,
    user_id: Uuid,
}

fn seed(lockout_limit: i32) -> Seeded {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(lockout_limit);
    let user = create_test_user(tenant.id, "alice@harborview.test", true);
    let staff = create_test_staff(tenant.id, user.audit.id, Vec::new());
    let (tenant_id, user_id) = (tenant.id, user.audit.id);
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(user.audit.id, user);
        s.staff.insert(staff.audit.id, staff);
    });
    Seeded {
        services,
        tenant_id,
        user_id,
    }
}

fn login_request(password: &str) -> LoginRequest {
    LoginRequest {
        username: "Alice@HarborView.test".to_string(),
        password: password.to_string(),
        device_detail: None,
        location_detail: None,
    }
}

fn otp_request(action: OtpAction, code: Option<String>) -> OtpRequest {
    OtpRequest {
        action,
        otp_type: OtpType::ForgotPassword,
        user_ids: Vec::new(),
        email: Some("alice@harborview.test".to_string()),
        user_type: None,
        channel: VerificationChannel::Email,
        code,
    }
}

#[tokio::test]
async fn test_login_success_returns_tokens_and_profile() {
    let seeded = seed(3);
    let response = seeded
        .services
        .auth
        .login(seeded.tenant_id, &login_request(TEST_PASSWORD))
        .await
        .unwrap();

    assert_eq!(response.user.audit.id, seeded.user_id);
    assert!(response.profile.is_some());
    assert!(!response.user_tokens.access.is_empty());
    assert!(!response.user_tokens.refresh.is_empty());
    assert!(response.user_tokens.expires_in > 0);
}

#[tokio::test]
async fn test_lockout_after_repeated_failures() {
    let seeded = seed(3);
    let auth = &seeded.services.auth;

    let first = auth.login(seeded.tenant_id, &login_request("wrong")).await;
    assert!(matches!(first, Err(AppError::InvalidCredentials)));
    let second = auth.login(seeded.tenant_id, &login_request("wrong")).await;
    assert!(matches!(second, Err(AppError::InvalidCredentials)));
    let third = auth.login(seeded.tenant_id, &login_request("wrong")).await;
    assert!(matches!(third, Err(AppError::UserLocked)));

    // Correct password is refused while the lock holds.
    let fourth = auth.login(seeded.tenant_id, &login_request(TEST_PASSWORD)).await;
    assert!(matches!(fourth, Err(AppError::UserLocked)));
    let fifth = auth.login(seeded.tenant_id, &login_request("wrong")).await;
    assert!(matches!(fifth, Err(AppError::UserLocked)));

    let user = seeded.services.store.user(seeded.user_id).unwrap();
    assert!(user.locked);
    assert_eq!(user.failed_attempt_count, 3);
}

#[tokio::test]
async fn test_lock_expires_after_window_and_count_resets() {
    let seeded = seed(3);
    let auth = &seeded.services.auth;
    for _ in 0..3 {
        let _ = auth.login(seeded.tenant_id, &login_request("wrong")).await;
    }

    seeded.services.clock.advance(Duration::minutes(16));
    auth.login(seeded.tenant_id, &login_request(TEST_PASSWORD))
        .await
        .unwrap();

    let user = seeded.services.store.user(seeded.user_id).unwrap();
    assert!(!user.locked);
    assert_eq!(user.failed_attempt_count, 0);
}

#[tokio::test]
async fn test_unknown_user_is_reported() {
    let seeded = seed(3);
    let request = LoginRequest {
        username: "nobody@harborview.test".to_string(),
        ..login_request(TEST_PASSWORD)
    };
    let result = seeded.services.auth.login(seeded.tenant_id, &request).await;
    assert!(matches!(result, Err(AppError::UserNotFound)));
}

#[tokio::test]
async fn test_refresh_rotates_and_old_token_is_rejected() {
    let seeded = seed(3);
    let auth = &seeded.services.auth;
    let login = auth
        .login(seeded.tenant_id, &login_request(TEST_PASSWORD))
        .await
        .unwrap();

    seeded.services.clock.advance(Duration::seconds(5));
    let rotated = auth.refresh(&login.user_tokens.refresh, None).await.unwrap();
    assert_ne!(rotated.refresh, login.user_tokens.refresh);

    let replay = auth.refresh(&login.user_tokens.refresh, None).await;
    assert!(matches!(replay, Err(AppError::Unauthorized(_))));
}

#[tokio::test]
async fn test_logout_revokes_refresh_token() {
    let seeded = seed(3);
    let auth = &seeded.services.auth;
    let login = auth
        .login(seeded.tenant_id, &login_request(TEST_PASSWORD))
        .await
        .unwrap();

    auth.logout(&login.user_tokens.refresh).await.unwrap();
    let result = auth.refresh(&login.user_tokens.refresh, None).await;
    assert!(matches!(result, Err(AppError::Unauthorized(_))));
}

#[tokio::test]
async fn test_otp_send_then_immediate_resend_is_rate_limited() {
    let seeded = seed(3);
    let otp = &seeded.services.otp;

    let sent = otp
        .handle(seeded.tenant_id, &otp_request(OtpAction::Send, None))
        .await
        .unwrap();
    assert!(matches!(sent, OtpResponse::Sent { .. }));

    seeded.services.clock.advance(Duration::seconds(10));
    let resent = otp
        .handle(seeded.tenant_id, &otp_request(OtpAction::Resend, None))
        .await;
    match resent {
        Err(AppError::OtpResendTooSoon {
            retry_after_seconds,
        }) => assert!(retry_after_seconds > 0),
        other => panic!("expected otp_resend_too_soon, got {:?}", other),
    }
}

#[tokio::test]
async fn test_otp_resend_allowed_after_interval() {
    let seeded = seed(3);
    let otp = &seeded.services.otp;
    otp.handle(seeded.tenant_id, &otp_request(OtpAction::Send, None))
        .await
        .unwrap();

    seeded.services.clock.advance(Duration::minutes(5));
    let resent = otp
        .handle(seeded.tenant_id, &otp_request(OtpAction::Resend, None))
        .await
        .unwrap();
    assert!(matches!(resent, OtpResponse::Sent { .. }));
}

#[tokio::test]
async fn test_verified_otp_resets_password_once() {
    let seeded = seed(3);
    let services = &seeded.services;
    services
        .otp
        .handle(seeded.tenant_id, &otp_request(OtpAction::Send, None))
        .await
        .unwrap();

    let code = services.store.with_state(|s| {
        s.codes
            .values()
            .find(|c| c.user_id == seeded.user_id && c.user_type == UserType::Staff)
            .map(|c| c.code.clone())
            .unwrap()
    });

    let wrong_code = if code == "000000" { "111111" } else { "000000" };
    let wrong = services
        .otp
        .handle(
            seeded.tenant_id,
            &otp_request(OtpAction::Verify, Some(wrong_code.to_string())),
        )
        .await;
    assert!(matches!(wrong, Err(AppError::InvalidOtp)));

    let verified = services
        .otp
        .handle(seeded.tenant_id, &otp_request(OtpAction::Verify, Some(code.clone())))
        .await
        .unwrap();
    let OtpResponse::Verified { token, .. } = verified else {
        panic!("expected a verified response");
    };

    services
        .auth
        .reset_password(&token, "Brand-New-Secret-7")
        .await
        .unwrap();
    let replay = services.auth.reset_password(&token, "Another-Secret-8").await;
    assert!(replay.is_err());

    let old = services
        .auth
        .login(seeded.tenant_id, &login_request(TEST_PASSWORD))
        .await;
    assert!(matches!(old, Err(AppError::InvalidCredentials)));
    services
        .auth
        .login(seeded.tenant_id, &login_request("Brand-New-Secret-7"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_verify_rejects_reused_code() {
    let seeded = seed(3);
    let services = &seeded.services;
    services
        .otp
        .handle(seeded.tenant_id, &otp_request(OtpAction::Send, None))
        .await
        .unwrap();
    let code = services
        .store
        .with_state(|s| s.codes.values().next().map(|c| c.code.clone()).unwrap());

    services
        .otp
        .handle(seeded.tenant_id, &otp_request(OtpAction::Verify, Some(code.clone())))
        .await
        .unwrap();
    let again = services
        .otp
        .handle(seeded.tenant_id, &otp_request(OtpAction::Verify, Some(code)))
        .await;
    assert!(matches!(again, Err(AppError::InvalidOtp)));
}
