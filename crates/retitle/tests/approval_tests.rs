//! Reviewer approval and denial of pending plans.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use retitle::approval::DEFAULT_DENY_REASON;
use retitle::db::document_repo;
use retitle::outcome::{APPROVAL_CLAIM_KEY, PENDING_KEY};
use retitle::{ApprovalError, DocumentStatus, JobId, JobSource, JobStatus};
use serde_json::json;

fn pending_harness(settings: SettingsBuilder) -> (TestHarness, JobId) {
    let harness = TestHarness::with_settings(settings.threshold(0.7).build());
    harness.add_document(DocumentBuilder::new(9).title("doc9").build());
    harness.evaluator.push(Ok(replace("Tax Notice 2023", Some(0.4))));
    let job_id = harness.enqueue(9, JobSource::Manual);
    harness.drain();
    assert_eq!(harness.job(job_id).status, JobStatus::AwaitingApproval);
    (harness, job_id)
}

#[test]
fn test_approve_applies_pending_title() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());

    let status = harness
        .engine
        .approval()
        .approve_pending(job_id, &harness.settings())
        .unwrap();
    assert_eq!(status, JobStatus::Completed);

    let job = harness.job(job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());

    let record = harness.record(9).unwrap();
    assert_eq!(record.status, DocumentStatus::Completed);
    assert_eq!(record.ai_title.as_deref(), Some("Tax Notice 2023"));
    assert_eq!(record.original_title.as_deref(), Some("doc9"));
    assert_eq!(record.extra.get("applied_by"), Some(&json!("reviewer")));
    assert!(!record.extra.contains_key(PENDING_KEY));
    assert!(!record.extra.contains_key("stale_on_approval"));

    assert_eq!(harness.documents.title_updates(9), 1);
    assert_eq!(
        harness.documents.get(9).unwrap().custom_fields.get("original_title").map(String::as_str),
        Some("doc9")
    );
}

#[test]
fn test_approve_twice_reports_not_found() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());
    let approval = harness.engine.approval();

    approval.approve_pending(job_id, &harness.settings()).unwrap();
    let err = approval
        .approve_pending(job_id, &harness.settings())
        .unwrap_err();
    assert!(matches!(err, ApprovalError::NotFound(id) if id == job_id));
    assert_eq!(harness.documents.title_updates(9), 1);
}

#[test]
fn test_approve_and_deny_require_awaiting_job() {
    let harness = TestHarness::new();
    harness.add_document(DocumentBuilder::new(1).build());
    let job_id = harness.enqueue(1, JobSource::Manual);

    let approval = harness.engine.approval();
    assert!(matches!(
        approval.approve_pending(job_id, &harness.settings()),
        Err(ApprovalError::NotFound(_))
    ));
    assert!(matches!(
        approval.deny_pending(job_id, None),
        Err(ApprovalError::NotFound(_))
    ));
    assert!(matches!(
        approval.deny_pending(JobId(999), None),
        Err(ApprovalError::NotFound(_))
    ));
    assert_eq!(harness.job(job_id).status, JobStatus::Queued);
}

#[test]
fn test_deny_uses_default_reason() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());

    harness.engine.approval().deny_pending(job_id, Some("  ")).unwrap();

    assert_eq!(harness.job(job_id).reason.as_deref(), Some(DEFAULT_DENY_REASON));
    assert_eq!(
        harness.record(9).unwrap().lock_reason.as_deref(),
        Some(DEFAULT_DENY_REASON)
    );
}

#[test]
fn test_stale_approval_is_applied_and_flagged_by_default() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());
    harness.documents.retitle(9, "Edited By Hand");

    harness
        .engine
        .approval()
        .approve_pending(job_id, &harness.settings())
        .unwrap();

    let record = harness.record(9).unwrap();
    assert_eq!(record.status, DocumentStatus::Completed);
    assert_eq!(record.extra.get("stale_on_approval"), Some(&json!(true)));
    assert_eq!(
        harness.documents.get(9).unwrap().title.as_deref(),
        Some("Tax Notice 2023")
    );
}

#[test]
fn test_stale_approval_can_be_refused() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new().reject_stale_approvals());
    harness.documents.retitle(9, "Edited By Hand");

    let err = harness
        .engine
        .approval()
        .approve_pending(job_id, &harness.settings())
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Stale { document_id: 9, .. }));

    assert_eq!(harness.job(job_id).status, JobStatus::AwaitingApproval);
    assert_eq!(harness.documents.title_updates(9), 0);
    assert!(!harness.record(9).unwrap().extra.contains_key(APPROVAL_CLAIM_KEY));
}

#[test]
fn test_corrupted_pending_payload_fails_job_and_keeps_record() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());

    let mut record = harness.record(9).unwrap();
    record
        .extra
        .insert(PENDING_KEY.to_string(), json!({"job_id": "nope"}));
    harness
        .db
        .with_conn(|conn| document_repo::upsert(conn, &record))
        .unwrap();

    let err = harness
        .engine
        .approval()
        .approve_pending(job_id, &harness.settings())
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Corrupted { .. }));

    let job = harness.job(job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.as_deref().unwrap().contains("corrupted pending plan"));
    assert_eq!(harness.record(9).unwrap(), record);
    assert_eq!(harness.documents.title_updates(9), 0);
}

#[test]
fn test_list_pending_decodes_plans() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());

    let (items, total) = harness.engine.approval().list_pending(10, 0).unwrap();
    assert_eq!(total, 1);
    let pending = items[0].pending.as_ref().unwrap();
    assert_eq!(pending.job_id, job_id);
    assert_eq!(pending.plan.proposed_title(), Some("Tax Notice 2023"));
    assert_eq!(items[0].record.document_id, 9);
}

fn set_claim(harness: &TestHarness, document_id: i64, expires_at: &str) {
    let mut record = harness.record(document_id).unwrap();
    record.extra.insert(
        APPROVAL_CLAIM_KEY.to_string(),
        json!({"token": "other-reviewer", "expires_at": expires_at}),
    );
    harness
        .db
        .with_conn(|conn| document_repo::upsert(conn, &record))
        .unwrap();
}

#[test]
fn test_deny_during_approval_is_refused() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());
    let approval = harness.engine.approval();

    let deny_refused = Arc::new(Mutex::new(None));
    {
        let approval = approval.clone();
        let deny_refused = Arc::clone(&deny_refused);
        harness.documents.on_next_fetch(move || {
            let result = approval.deny_pending(job_id, Some("changed my mind"));
            *deny_refused.lock().unwrap() =
                Some(matches!(result, Err(ApprovalError::NotFound(id)) if id == job_id));
        });
    }

    let status = approval.approve_pending(job_id, &harness.settings()).unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(*deny_refused.lock().unwrap(), Some(true));

    assert_eq!(harness.job(job_id).status, JobStatus::Completed);
    let record = harness.record(9).unwrap();
    assert_eq!(record.status, DocumentStatus::Completed);
    assert!(!record.extra.contains_key(APPROVAL_CLAIM_KEY));
    assert_eq!(harness.documents.title_updates(9), 1);
}

#[test]
fn test_concurrent_approval_writes_document_once() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());
    let approval = harness.engine.approval();
    let settings = harness.settings();

    let second_in_progress = Arc::new(Mutex::new(None));
    {
        let approval = approval.clone();
        let settings = settings.clone();
        let second_in_progress = Arc::clone(&second_in_progress);
        harness.documents.on_next_fetch(move || {
            let result = approval.approve_pending(job_id, &settings);
            *second_in_progress.lock().unwrap() =
                Some(matches!(result, Err(ApprovalError::InProgress { job_id: id, .. }) if id == job_id));
        });
    }

    approval.approve_pending(job_id, &settings).unwrap();
    assert_eq!(*second_in_progress.lock().unwrap(), Some(true));

    let field_writes = harness
        .documents
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::SetCustomField { document_id: 9, .. }))
        .count();
    assert_eq!(field_writes, 1);
    assert_eq!(harness.documents.title_updates(9), 1);
}

#[test]
fn test_failed_approval_releases_claim() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());
    let approval = harness.engine.approval();
    harness.documents.fail_next_fetch(timeout());

    let err = approval
        .approve_pending(job_id, &harness.settings())
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Upstream(_)));
    assert_eq!(harness.job(job_id).status, JobStatus::AwaitingApproval);
    assert!(!harness.record(9).unwrap().extra.contains_key(APPROVAL_CLAIM_KEY));

    assert_eq!(
        approval.deny_pending(job_id, None).unwrap(),
        JobStatus::Rejected
    );
    assert!(harness.documents.calls().is_empty());
}

#[test]
fn test_live_claim_blocks_deny_and_approve() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());
    set_claim(&harness, 9, "9999-12-31T00:00:00.000Z");
    let approval = harness.engine.approval();

    assert!(matches!(
        approval.deny_pending(job_id, None),
        Err(ApprovalError::NotFound(_))
    ));
    assert!(matches!(
        approval.approve_pending(job_id, &harness.settings()),
        Err(ApprovalError::InProgress { .. })
    ));
    assert_eq!(harness.job(job_id).status, JobStatus::AwaitingApproval);
    assert!(harness.documents.calls().is_empty());
}

#[test]
fn test_expired_claim_is_taken_over() {
    let (harness, job_id) = pending_harness(SettingsBuilder::new());
    set_claim(&harness, 9, "2000-01-01T00:00:00.000Z");

    let status = harness
        .engine
        .approval()
        .approve_pending(job_id, &harness.settings())
        .unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert!(!harness.record(9).unwrap().extra.contains_key(APPROVAL_CLAIM_KEY));
}
