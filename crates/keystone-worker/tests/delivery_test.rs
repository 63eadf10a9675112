use std::sync::Arc;

use chrono::Duration;
use keystone_core::models::{
    NotificationChannel, NotificationStatus, NotificationTemplate, OutboundNotification, Recipient,
};
use keystone_core::RequestContext;
use keystone_services::test_helpers::*;
use keystone_services::{Clock, NotificationTransport};
use keystone_worker::{DeliveryConfig, NotificationDispatcher};
use serde_json::json;
use uuid::Uuid;

struct Harness {
    services: TestServices,
    transport: RecordingTransport,
    dispatcher: NotificationDispatcher,
    ctx: RequestContext,
    resident_id: Uuid,
}

fn harness(max_retries: i32) -> Harness {
    let services = TestServices::new(instant("2025-01-01T09:00:00Z"));
    let tenant = create_test_tenant(5);
    let resident_user = create_test_user(tenant.id, "hana@harborview.test", false);
    let resident = create_test_resident(tenant.id, resident_user.audit.id);
    let ctx = RequestContext::system(tenant.id);
    let resident_id = resident.audit.id;
    services.store.with_state(|s| {
        s.tenants.insert(tenant.id, tenant);
        s.users.insert(resident_user.audit.id, resident_user);
        s.residents.insert(resident.audit.id, resident);
    });

    let transport = RecordingTransport::new(NotificationChannel::Email);
    let store = Arc::new(services.store.clone());
    let clock: Arc<dyn Clock> = Arc::new(services.clock.clone());
    let transports: Vec<Arc<dyn NotificationTransport>> = vec![Arc::new(transport.clone())];
    let dispatcher = NotificationDispatcher::new(
        store.clone(),
        store,
        transports,
        clock,
        DeliveryConfig {
            max_retries,
            ..DeliveryConfig::default()
        },
    );
    Harness {
        services,
        transport,
        dispatcher,
        ctx,
        resident_id,
    }
}

async fn enqueue(h: &Harness, channel: NotificationChannel, recipient: Recipient) -> Uuid {
    h.services
        .notifier
        .enqueue(
            &h.ctx,
            OutboundNotification {
                channel,
                recipient,
                template: NotificationTemplate::PaymentReceipt,
                context: json!({
                    "amount": "100.00",
                    "currency": "USD",
                    "display_id": "BL-20250101-1a2b3c4d",
                    "balance_due": "0.00",
                }),
            },
        )
        .await
        .unwrap()
        .audit
        .id
}

fn status_of(h: &Harness, id: Uuid) -> (NotificationStatus, i32) {
    h.services.store.with_state(|s| {
        let n = &s.notifications[&id];
        (n.status, n.attempts)
    })
}

#[tokio::test]
async fn test_resident_notification_is_sent_to_their_email() {
    let h = harness(3);
    let id = enqueue(
        &h,
        NotificationChannel::Email,
        Recipient::ResidentRef {
            resident_id: h.resident_id,
        },
    )
    .await;

    let report = h.dispatcher.deliver_due().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.sent, 1);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].address, "hana@harborview.test");
    assert_eq!(sent[0].subject, "Payment received");
    assert!(sent[0].body.contains("BL-20250101-1a2b3c4d"));
    assert_eq!(status_of(&h, id).0, NotificationStatus::Sent);

    // Nothing left to claim.
    let again = h.dispatcher.deliver_due().await.unwrap();
    assert_eq!(again.claimed, 0);
}

#[tokio::test]
async fn test_transport_failure_backs_off_then_succeeds() {
    let h = harness(3);
    let id = enqueue(
        &h,
        NotificationChannel::Email,
        Recipient::RawAddress {
            address: "front-desk@harborview.test".to_string(),
        },
    )
    .await;
    h.transport.fail_next(1);

    let report = h.dispatcher.deliver_due().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(status_of(&h, id), (NotificationStatus::Queued, 1));

    // First retry is due two seconds later.
    h.services.clock.advance(Duration::seconds(1));
    assert_eq!(h.dispatcher.deliver_due().await.unwrap().claimed, 0);
    h.services.clock.advance(Duration::seconds(1));
    let report = h.dispatcher.deliver_due().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(status_of(&h, id).0, NotificationStatus::Sent);
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let h = harness(2);
    let id = enqueue(
        &h,
        NotificationChannel::Email,
        Recipient::RawAddress {
            address: "front-desk@harborview.test".to_string(),
        },
    )
    .await;
    h.transport.fail_next(5);

    h.dispatcher.deliver_due().await.unwrap();
    h.services.clock.advance(Duration::minutes(5));
    let report = h.dispatcher.deliver_due().await.unwrap();
    assert_eq!(report.failed, 1);

    let (status, attempts) = status_of(&h, id);
    assert_eq!(status, NotificationStatus::Failed);
    assert_eq!(attempts, 2);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_channel_without_transport_fails_immediately() {
    let h = harness(3);
    let id = enqueue(
        &h,
        NotificationChannel::Sms,
        Recipient::RawAddress {
            address: "+15550100".to_string(),
        },
    )
    .await;

    let report = h.dispatcher.deliver_due().await.unwrap();
    assert_eq!(report.failed, 1);
    let (status, attempts) = status_of(&h, id);
    assert_eq!(status, NotificationStatus::Failed);
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_unknown_resident_fails_without_retry() {
    let h = harness(3);
    let id = enqueue(
        &h,
        NotificationChannel::Email,
        Recipient::ResidentRef {
            resident_id: Uuid::new_v4(),
        },
    )
    .await;

    let report = h.dispatcher.deliver_due().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(status_of(&h, id).0, NotificationStatus::Failed);
}
