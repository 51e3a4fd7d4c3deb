/// Outgoing message lifecycle against an in-memory portal
mod common;

use common::{family_session, record, Call, FakePortalApi};
use portal_realtime::messenger_types::{Attachment, DeliveryStatus, Message, MessageId};
use portal_realtime::{ConversationStore, DeliveryTracker, RealtimeError, SendOutcome, SessionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn setup() -> (Arc<FakePortalApi>, ConversationStore, DeliveryTracker) {
    let api = Arc::new(FakePortalApi::new());
    let store = ConversationStore::new();
    let session = SessionHandle::new();
    session.login(family_session());
    let tracker = DeliveryTracker::new(api.clone(), store.clone(), session);
    (api, store, tracker)
}

#[tokio::test]
async fn test_send_replaces_provisional_with_confirmed() {
    let (api, store, tracker) = setup();
    store.set_local_user(Some("fam-1".into())).await;

    let outcome = tracker.send("c1", "Good morning doctor", Vec::new()).await.unwrap();
    let SendOutcome::Sent { provisional_id, message_id } = outcome else {
        panic!("expected Sent, got {:?}", outcome);
    };

    let messages = store.messages("c1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::Confirmed(message_id));
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
    assert_eq!(messages[0].client_ref.as_deref(), Some(provisional_id.as_str()));
    assert_eq!(api.sent()[0].client_ref, provisional_id);
    assert!(!tracker.is_sending("c1").await);
}

#[tokio::test]
async fn test_offline_send_fails_then_retry_confirms_once() {
    let (api, store, tracker) = setup();
    store.set_local_user(Some("fam-1".into())).await;
    api.set_offline(true);

    let outcome = tracker.send("c1", "Hello", Vec::new()).await.unwrap();
    let provisional_id = match outcome {
        SendOutcome::Failed { provisional_id, .. } => provisional_id,
        other => panic!("expected Failed, got {:?}", other),
    };

    let messages = store.messages("c1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hello");
    assert!(messages[0].is_failed());
    assert_eq!(tracker.in_flight_count().await, 0);

    api.set_offline(false);
    let outcome = tracker.retry(&provisional_id).await.unwrap();
    let message_id = match outcome {
        SendOutcome::Sent { message_id, .. } => message_id,
        other => panic!("expected Sent, got {:?}", other),
    };

    let messages = store.messages("c1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::Confirmed(message_id.clone()));
    assert_eq!(messages[0].content, "Hello");

    // The push echo of the same message must not add a second entry
    let mut echo = record(&message_id, "c1", "fam-1", "Hello", 0);
    echo.client_ref = Some(provisional_id);
    assert!(!store.apply_incoming(Message::from(echo)).await);
    assert_eq!(store.messages("c1").await.len(), 1);
}

#[tokio::test]
async fn test_empty_message_is_rejected_without_side_effects() {
    let (api, store, tracker) = setup();

    let err = tracker.send("c1", "   ", Vec::new()).await.unwrap_err();
    assert!(matches!(err, RealtimeError::Validation(_)));
    assert!(store.messages("c1").await.is_empty());
    assert!(api.sent().is_empty());
}

#[tokio::test]
async fn test_attachment_only_message_is_sent() {
    let (api, store, tracker) = setup();
    let attachment = Attachment {
        file_name: "lab-results.pdf".into(),
        url: "https://blobs.example/lab-results.pdf".into(),
        content_type: "application/pdf".into(),
        size_bytes: 48_213,
    };

    let outcome = tracker.send("c1", "", vec![attachment.clone()]).await.unwrap();
    assert!(matches!(outcome, SendOutcome::Sent { .. }));
    assert_eq!(api.sent()[0].attachments, vec![attachment]);
    assert_eq!(
        store.conversation("c1").await.unwrap().last_message.unwrap().text,
        "[1 attachment(s)]"
    );
}

#[tokio::test]
async fn test_send_without_session_is_an_error() {
    let api = Arc::new(FakePortalApi::new());
    let store = ConversationStore::new();
    let tracker = DeliveryTracker::new(api, store.clone(), SessionHandle::new());

    let err = tracker.send("c1", "hi", Vec::new()).await.unwrap_err();
    assert!(matches!(err, RealtimeError::NoSession));
    assert!(store.messages("c1").await.is_empty());
}

#[tokio::test]
async fn test_retry_requires_failed_message() {
    let (_api, _store, tracker) = setup();

    let err = tracker.retry("local-missing").await.unwrap_err();
    assert!(matches!(err, RealtimeError::NotFound(_)));

    let outcome = tracker.send("c1", "hi", Vec::new()).await.unwrap();
    // Confirmed messages are no longer provisional at all
    let err = tracker.retry(outcome.provisional_id()).await.unwrap_err();
    assert!(matches!(err, RealtimeError::NotFound(_)));
}

#[tokio::test]
async fn test_remove_failed_message() {
    let (api, store, tracker) = setup();
    api.set_offline(true);

    let outcome = tracker.send("c1", "never mind", Vec::new()).await.unwrap();
    let provisional_id = outcome.provisional_id().to_string();

    tracker.remove(&provisional_id).await.unwrap();
    assert!(store.messages("c1").await.is_empty());
    assert!(store.conversation("c1").await.unwrap().last_message.is_none());

    let err = tracker.remove(&provisional_id).await.unwrap_err();
    assert!(matches!(err, RealtimeError::NotFound(_)));
    let err = tracker.retry(&provisional_id).await.unwrap_err();
    assert!(matches!(err, RealtimeError::NotFound(_)));
}

#[tokio::test]
async fn test_read_receipt_marks_own_message() {
    let (_api, store, tracker) = setup();
    store.set_local_user(Some("fam-1".into())).await;

    let outcome = tracker.send("c1", "Are the results in?", Vec::new()).await.unwrap();
    let SendOutcome::Sent { message_id, .. } = outcome else {
        panic!("send failed");
    };

    let read_at = common::at(30);
    // Our own read marker from another tab is ignored
    assert!(!tracker.apply_read_receipt("c1", &message_id, "fam-1", read_at).await);
    assert!(tracker.apply_read_receipt("c1", &message_id, "dr-1", read_at).await);

    let messages = store.messages("c1").await;
    assert_eq!(messages[0].read_at, Some(read_at));
}

#[tokio::test(start_paused = true)]
async fn test_removed_pending_message_still_shows_confirmation() {
    let (api, store, tracker) = setup();
    store.set_local_user(Some("fam-1".into())).await;

    api.hold(Call::SendMessage);
    let sending = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.send("c1", "Hello", Vec::new()).await }
    });
    sleep(Duration::from_millis(10)).await;

    let pending = store.messages("c1").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, DeliveryStatus::Pending);
    tracker.remove(pending[0].id.as_str()).await.unwrap();
    assert!(store.messages("c1").await.is_empty());

    api.release(Call::SendMessage);
    let message_id = match sending.await.unwrap().unwrap() {
        SendOutcome::Sent { message_id, .. } => message_id,
        other => panic!("expected Sent, got {:?}", other),
    };

    let messages = store.messages("c1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::Confirmed(message_id));
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
    assert!(!tracker.is_sending("c1").await);
}
