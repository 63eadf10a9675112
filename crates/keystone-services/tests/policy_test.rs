use keystone_core::models::{PolicyChanges, PolicyStatus};
use keystone_core::{AppError, RequestContext};
use keystone_services::test_helpers::*;
use keystone_services::NewPolicy;

fn seed() -> (TestServices, RequestContext, RequestContext) {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(5);
    let staff_user = create_test_user(tenant.id, "legal@harborview.test", true);
    let resident_user = create_test_user(tenant.id, "gina@harborview.test", false);
    let resident = create_test_resident(tenant.id, resident_user.audit.id);
    let admin = staff_context(tenant.id, staff_user.audit.id);
    let reader = resident_context(tenant.id, resident_user.audit.id, resident.audit.id);
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(staff_user.audit.id, staff_user);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
    });
    (services, admin, reader)
}

fn pool_rules() -> NewPolicy {
    NewPolicy {
        name: "Pool rules".to_string(),
        policy_type: "amenity".to_string(),
        status: PolicyStatus::Active,
        publishing_date: Some(date("2025-01-01")),
        content_html: "<p>No glass on the deck.</p>".to_string(),
    }
}

#[tokio::test]
async fn test_acceptance_tracks_latest_version() {
    let (services, admin, reader) = seed();
    let policy = services.policies.create(&admin, &pool_rules()).await.unwrap();
    let policy_id = policy.audit.id;

    let before = services
        .policies
        .latest_accepted(&reader, &[policy_id])
        .await
        .unwrap();
    assert!(!before[0].accepted);
    assert_eq!(before[0].latest_version, Some(1));

    assert!(services.policies.accept(&reader, policy_id).await.unwrap());
    assert!(!services.policies.accept(&reader, policy_id).await.unwrap());
    let accepted = services
        .policies
        .latest_accepted(&reader, &[policy_id])
        .await
        .unwrap();
    assert!(accepted[0].accepted);
    assert_eq!(accepted[0].accepted_version, Some(1));

    services
        .policies
        .update(
            &admin,
            policy_id,
            &PolicyChanges {
                content_html: Some("<p>No glass. No diving.</p>".to_string()),
                ..PolicyChanges::default()
            },
        )
        .await
        .unwrap();
    let stale = services
        .policies
        .latest_accepted(&reader, &[policy_id])
        .await
        .unwrap();
    assert!(!stale[0].accepted);
    assert_eq!(stale[0].accepted_version, Some(1));
    assert_eq!(stale[0].latest_version, Some(2));
}

#[tokio::test]
async fn test_unchanged_content_keeps_version() {
    let (services, admin, _) = seed();
    let policy = services.policies.create(&admin, &pool_rules()).await.unwrap();
    let updated = services
        .policies
        .update(
            &admin,
            policy.audit.id,
            &PolicyChanges {
                name: Some("Pool & spa rules".to_string()),
                content_html: Some(pool_rules().content_html),
                ..PolicyChanges::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "Pool & spa rules");
    assert_eq!(updated.current_version_id, policy.current_version_id);
}

#[tokio::test]
async fn test_policy_requires_name() {
    let (services, admin, _) = seed();
    let input = NewPolicy {
        name: "  ".to_string(),
        ..pool_rules()
    };
    let result = services.policies.create(&admin, &input).await;
    assert!(matches!(result, Err(AppError::MissingRequiredParam(_))));
}
