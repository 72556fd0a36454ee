//! Lock acquisition, conflict, safe-view, heartbeat, and expiry behavior.

use std::time::Duration;

use armitage::workbench::{AccessMode, WorkbenchError};
use chrono::Utc;
use uuid::Uuid;

use super::{developer, draft, manager, service};

#[tokio::test]
async fn acquire_grants_edit_on_unlocked_draft() {
    let svc = service(Duration::from_secs(30)).await;
    let alice = developer();
    let d = draft(&svc, &alice).await;

    let (returned, grant) = svc.get_with_lock(d.draft_id, &alice).await.expect("acquire");
    assert_eq!(grant.mode, AccessMode::Edit);
    assert_eq!(grant.holder, Some(alice.user_id));
    assert_eq!(returned.locked_by, Some(alice.user_id));
}

#[tokio::test]
async fn second_developer_conflicts_while_lock_is_live() {
    let svc = service(Duration::from_secs(30)).await;
    let alice = developer();
    let bob = developer();
    let d = draft(&svc, &alice).await;

    svc.get_with_lock(d.draft_id, &alice).await.expect("alice locks");
    let err = svc
        .get_with_lock(d.draft_id, &bob)
        .await
        .expect_err("bob conflicts");
    match err {
        WorkbenchError::LockConflict { holder, expires_in_secs } => {
            assert_eq!(holder, Some(alice.user_id));
            assert!(expires_in_secs.unwrap_or(0) <= 30);
        }
        other => panic!("expected LockConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn holder_reacquires_and_refreshes() {
    let svc = service(Duration::from_secs(30)).await;
    let alice = developer();
    let d = draft(&svc, &alice).await;

    let (_, first) = svc.get_with_lock(d.draft_id, &alice).await.expect("first");
    let (_, second) = svc.get_with_lock(d.draft_id, &alice).await.expect("again");
    assert_eq!(second.mode, AccessMode::Edit);
    assert!(second.expires_at >= first.expires_at);
}

#[tokio::test]
async fn manager_gets_safe_view_without_touching_the_lock() {
    let svc = service(Duration::from_secs(30)).await;
    let alice = developer();
    let boss = manager();
    let d = draft(&svc, &alice).await;

    let (_, alice_grant) = svc.get_with_lock(d.draft_id, &alice).await.expect("alice");

    let (viewed, grant) = svc.get_with_lock(d.draft_id, &boss).await.expect("safe view");
    assert_eq!(grant.mode, AccessMode::SafeView);
    assert_eq!(grant.holder, Some(alice.user_id));

    // Non-interference: holder and expiry are untouched.
    assert_eq!(viewed.locked_by, Some(alice.user_id));
    assert_eq!(viewed.lock_expires_at, alice_grant.expires_at.map(trunc_micros));

    // Safe view grants no write access.
    let err = svc
        .update(d.draft_id, &boss, Default::default())
        .await
        .expect_err("manager safe view cannot edit");
    assert!(matches!(err, WorkbenchError::LockConflict { .. }));
}

fn trunc_micros(ts: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    armitage::db::parse_ts(&armitage::db::fmt_ts(ts)).expect("roundtrip")
}

#[tokio::test]
async fn expired_lock_is_reacquirable() {
    let svc = service(Duration::from_millis(50)).await;
    let alice = developer();
    let bob = developer();
    let d = draft(&svc, &alice).await;

    svc.get_with_lock(d.draft_id, &alice).await.expect("alice locks");
    tokio::time::sleep(Duration::from_millis(80)).await;

    let (_, grant) = svc
        .get_with_lock(d.draft_id, &bob)
        .await
        .expect("lock expired, bob acquires");
    assert_eq!(grant.mode, AccessMode::Edit);
    assert_eq!(grant.holder, Some(bob.user_id));
}

#[tokio::test]
async fn heartbeat_refreshes_only_for_the_live_holder() {
    let svc = service(Duration::from_millis(100)).await;
    let alice = developer();
    let bob = developer();
    let d = draft(&svc, &alice).await;

    svc.get_with_lock(d.draft_id, &alice).await.expect("alice locks");
    svc.locks().heartbeat(d.draft_id, &alice).await.expect("holder refreshes");

    let err = svc
        .locks()
        .heartbeat(d.draft_id, &bob)
        .await
        .expect_err("non-holder cannot refresh");
    assert!(matches!(err, WorkbenchError::LockConflict { .. }));

    tokio::time::sleep(Duration::from_millis(130)).await;
    let err = svc
        .locks()
        .heartbeat(d.draft_id, &alice)
        .await
        .expect_err("expired lock cannot be refreshed");
    assert!(matches!(err, WorkbenchError::LockConflict { .. }));
}

#[tokio::test]
async fn update_requires_a_live_lock() {
    let svc = service(Duration::from_millis(50)).await;
    let alice = developer();
    let d = draft(&svc, &alice).await;

    svc.get_with_lock(d.draft_id, &alice).await.expect("lock");
    tokio::time::sleep(Duration::from_millis(80)).await;

    let err = svc
        .update(d.draft_id, &alice, Default::default())
        .await
        .expect_err("lock expired before the write");
    assert!(matches!(err, WorkbenchError::LockConflict { .. }));
}

#[tokio::test]
async fn missing_draft_is_not_found() {
    let svc = service(Duration::from_secs(30)).await;
    let alice = developer();
    let err = svc
        .get_with_lock(Uuid::new_v4(), &alice)
        .await
        .expect_err("no such draft");
    assert!(matches!(err, WorkbenchError::NotFound));
}

#[tokio::test]
async fn lock_exclusivity_under_contention() {
    let (_dir, svc) = super::service_on_disk(Duration::from_secs(30)).await;
    let alice = developer();
    let d = draft(&svc, &alice).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let svc = std::sync::Arc::clone(&svc);
        let contender = developer();
        let draft_id = d.draft_id;
        handles.push(tokio::spawn(async move {
            svc.get_with_lock(draft_id, &contender).await.is_ok()
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.expect("join") {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "exactly one contender may hold the edit lock");
}
