//! Store integration tests.
//!
//! These hit a live PostgreSQL and are `#[ignore]`d for CI. Point `STORE_URL`
//! at a scratch database and run with `cargo test -p mailpipe-store -- --ignored`.

use mailpipe_core::analysis::{
    AnalysisResult, EntitySet, Phase1Result, Priority, SignalFlags, WorkflowCategory,
};
use mailpipe_core::config::StoreConfig;
use mailpipe_core::email::{Mailbox, NormalizedEmail, RecipientLists};
use mailpipe_core::status::EmailStatus;
use mailpipe_store::{Store, StoreError, StatusUpdate};

fn config() -> StoreConfig {
    StoreConfig {
        url: std::env::var("STORE_URL")
            .unwrap_or_else(|_| "postgres://localhost:5432/mailpipe_test".to_string()),
        max_connections: 5,
    }
}

fn record(message_id: &str) -> NormalizedEmail {
    NormalizedEmail {
        internet_message_id: message_id.to_string(),
        subject: "Urgent: PO 12345678 approval needed".to_string(),
        sender: Mailbox { address: "buyer@acme.com".to_string(), display: "Buyer".to_string() },
        recipients: RecipientLists {
            to: vec![Mailbox { address: "sales@us.com".to_string(), display: String::new() }],
            cc: vec![],
            bcc: vec![],
        },
        body_text: "Please approve, amount $50,000 by Friday.".to_string(),
        body_preview: None,
        received_at: chrono::Utc::now(),
        conversation_id: None,
        importance: None,
    }
}

fn phase1() -> AnalysisResult {
    AnalysisResult::Phase1(Phase1Result {
        workflow_category: WorkflowCategory::OrderProcessing,
        priority: Priority::High,
        entities: EntitySet::default(),
        signals: SignalFlags::default(),
        confidence: 0.8,
        rules_version: "test".to_string(),
    })
}

#[tokio::test]
#[ignore]
async fn ingest_is_idempotent_on_message_id() {
    let store = Store::connect(&config()).await.unwrap();
    let rec = record(&format!("<idem-{}@test>", uuid::Uuid::new_v4()));

    let first = store.upsert_email(&rec).await.unwrap();
    let second = store.upsert_email(&rec).await.unwrap();

    assert!(first.is_new());
    assert!(!second.is_new());
    assert_eq!(first.id(), second.id());
}

#[tokio::test]
#[ignore]
async fn status_transition_is_optimistic() {
    let store = Store::connect(&config()).await.unwrap();
    let rec = record(&format!("<occ-{}@test>", uuid::Uuid::new_v4()));
    let id = store.upsert_email(&rec).await.unwrap().id();

    store
        .update_status(id, EmailStatus::Pending, EmailStatus::Phase1Complete, StatusUpdate::default())
        .await
        .unwrap();

    // Replaying the same transition must conflict: the row is no longer pending.
    let err = store
        .update_status(id, EmailStatus::Pending, EmailStatus::Phase1Complete, StatusUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    // Skipping a phase is rejected before touching the row.
    let err = store
        .update_status(id, EmailStatus::Phase1Complete, EmailStatus::Phase3Complete, StatusUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
#[ignore]
async fn phase_result_replay_respects_confidence_tolerance() {
    let store = Store::connect(&config()).await.unwrap();
    let rec = record(&format!("<tol-{}@test>", uuid::Uuid::new_v4()));
    let id = store.upsert_email(&rec).await.unwrap().id();

    assert!(store
        .append_phase_result(id, &phase1(), 0.8, 100, "rules", 5)
        .await
        .unwrap());

    // A much lower-confidence replay is ignored.
    let mut weaker = phase1();
    if let AnalysisResult::Phase1(r) = &mut weaker {
        r.confidence = 0.3;
    }
    assert!(!store
        .append_phase_result(id, &weaker, 0.3, 100, "rules", 5)
        .await
        .unwrap());

    // Within tolerance it replaces.
    assert!(store
        .append_phase_result(id, &phase1(), 0.78, 100, "rules", 5)
        .await
        .unwrap());

    let email = store.get_email(id).await.unwrap();
    assert_eq!(email.phase_completed, 1);
}

#[tokio::test]
#[ignore]
async fn chain_counter_matches_membership() {
    let store = Store::connect(&config()).await.unwrap();
    let key = format!("conv:test-{}", uuid::Uuid::new_v4());
    let chain = store.find_or_create_chain(&key).await.unwrap();

    let a = store
        .upsert_email(&record(&format!("<ch-a-{}@test>", uuid::Uuid::new_v4())))
        .await
        .unwrap()
        .id();
    let b = store
        .upsert_email(&record(&format!("<ch-b-{}@test>", uuid::Uuid::new_v4())))
        .await
        .unwrap()
        .id();

    assert!(store.attach_email_to_chain(a, chain.id).await.unwrap());
    assert!(store.attach_email_to_chain(b, chain.id).await.unwrap());
    // Replay does not double-count.
    assert!(!store.attach_email_to_chain(a, chain.id).await.unwrap());

    let fresh = store.get_chain(chain.id).await.unwrap();
    let members = store.chain_member_views(chain.id).await.unwrap();
    assert_eq!(fresh.email_count as usize, members.len());
    assert_eq!(fresh.email_count, 2);
}
