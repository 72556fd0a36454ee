//! Approval state machine: submit, approve, reject, and conflicts.

use std::time::Duration;

use armitage::workbench::{DraftStatus, TransitionVerb, WorkbenchError};

use super::{developer, draft, manager, service};

#[tokio::test]
async fn owner_submits_then_manager_approves() {
    let svc = service(Duration::from_secs(30)).await;
    let owner = developer();
    let boss = manager();
    let d = draft(&svc, &owner).await;

    let pending = svc
        .transition(d.draft_id, &owner, TransitionVerb::Submit)
        .await
        .expect("submit");
    assert_eq!(pending.status, DraftStatus::Pending);

    let approved = svc
        .transition(d.draft_id, &boss, TransitionVerb::Approve)
        .await
        .expect("approve");
    assert_eq!(approved.status, DraftStatus::Approved);
}

#[tokio::test]
async fn rejected_draft_is_editable_and_resubmittable() {
    let svc = service(Duration::from_secs(30)).await;
    let owner = developer();
    let boss = manager();
    let d = draft(&svc, &owner).await;

    svc.transition(d.draft_id, &owner, TransitionVerb::Submit)
        .await
        .expect("submit");
    let rejected = svc
        .transition(d.draft_id, &boss, TransitionVerb::Reject)
        .await
        .expect("reject");
    assert_eq!(rejected.status, DraftStatus::Rejected);

    // Owner edits under a lock and re-submits.
    svc.get_with_lock(d.draft_id, &owner).await.expect("lock");
    svc.update(
        d.draft_id,
        &owner,
        armitage::workbench::DraftPatch {
            title: Some("revised".to_owned()),
            ..Default::default()
        },
    )
    .await
    .expect("edit rejected draft");

    let pending = svc
        .transition(d.draft_id, &owner, TransitionVerb::Submit)
        .await
        .expect("resubmit");
    assert_eq!(pending.status, DraftStatus::Pending);
}

#[tokio::test]
async fn submit_requires_ownership() {
    let svc = service(Duration::from_secs(30)).await;
    let owner = developer();
    let stranger = developer();
    let d = draft(&svc, &owner).await;

    let err = svc
        .transition(d.draft_id, &stranger, TransitionVerb::Submit)
        .await
        .expect_err("not the owner");
    assert!(matches!(err, WorkbenchError::Forbidden(_)));
}

#[tokio::test]
async fn approval_requires_manager_role() {
    let svc = service(Duration::from_secs(30)).await;
    let owner = developer();
    let d = draft(&svc, &owner).await;

    svc.transition(d.draft_id, &owner, TransitionVerb::Submit)
        .await
        .expect("submit");
    let err = svc
        .transition(d.draft_id, &owner, TransitionVerb::Approve)
        .await
        .expect_err("developers cannot approve");
    assert!(matches!(err, WorkbenchError::Forbidden(_)));
}

#[tokio::test]
async fn approve_outside_pending_conflicts() {
    let svc = service(Duration::from_secs(30)).await;
    let owner = developer();
    let boss = manager();
    let d = draft(&svc, &owner).await;

    let err = svc
        .transition(d.draft_id, &boss, TransitionVerb::Approve)
        .await
        .expect_err("draft is not pending");
    assert!(matches!(err, WorkbenchError::Conflict(_)));

    let err = svc
        .transition(d.draft_id, &boss, TransitionVerb::Reject)
        .await
        .expect_err("draft is not pending");
    assert!(matches!(err, WorkbenchError::Conflict(_)));
}

#[tokio::test]
async fn pending_draft_rejects_content_edits() {
    let svc = service(Duration::from_secs(30)).await;
    let owner = developer();
    let d = draft(&svc, &owner).await;

    svc.get_with_lock(d.draft_id, &owner).await.expect("lock");
    svc.transition(d.draft_id, &owner, TransitionVerb::Submit)
        .await
        .expect("submit");

    let err = svc
        .update(
            d.draft_id,
            &owner,
            armitage::workbench::DraftPatch {
                title: Some("sneaky edit".to_owned()),
                ..Default::default()
            },
        )
        .await
        .expect_err("pending drafts are read-only");
    assert!(matches!(err, WorkbenchError::Conflict(_)));
}

#[tokio::test]
async fn double_submit_conflicts() {
    let svc = service(Duration::from_secs(30)).await;
    let owner = developer();
    let d = draft(&svc, &owner).await;

    svc.transition(d.draft_id, &owner, TransitionVerb::Submit)
        .await
        .expect("first submit");
    let err = svc
        .transition(d.draft_id, &owner, TransitionVerb::Submit)
        .await
        .expect_err("already pending");
    assert!(matches!(err, WorkbenchError::Conflict(_)));
}
