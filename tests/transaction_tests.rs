/// Transaction lifecycle tests
///
/// acquire -> begin -> work -> commit | rollback -> release, and the failure
/// point of each step.
/// Run with: cargo test --test transaction_tests

mod common;

use common::{Script, memory, scripted};
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tracing::Level;
use txcoord::{DbError, Session, TransactionConfig};

#[tokio::test]
async fn test_success_commits_and_releases_once() {
    let (coordinator, log) = scripted(Script::default());

    let value = coordinator
        .run_in_transaction(Some("checkout"), |_tx| {
            Box::pin(async move { Ok::<_, DbError>(42) })
        })
        .await;

    assert_eq!(assert_ok!(value), 42);
    assert_eq!(
        coordinator.provider().calls(),
        vec!["create", "connect", "begin", "commit", "release"]
    );
    assert_eq!(log.count_containing(Level::INFO, "Starting transaction"), 1);
    assert_eq!(log.count_containing(Level::INFO, "committed"), 1);
    assert!(log.contexts().iter().all(|context| context == "checkout"));
}

#[tokio::test]
async fn test_work_error_rolls_back_and_is_returned_unchanged() {
    let (coordinator, log) = scripted(Script::default());

    let result: Result<(), DbError> = coordinator
        .run_in_transaction(None, |_tx| {
            Box::pin(async move { Err(DbError::ExecutionError("constraint violated".into())) })
        })
        .await;

    assert_eq!(
        result.unwrap_err(),
        DbError::ExecutionError("constraint violated".into())
    );
    assert_eq!(
        coordinator.provider().calls(),
        vec!["create", "connect", "begin", "rollback", "release"]
    );
    assert_eq!(log.count_containing(Level::ERROR, "rolled back"), 1);
}

#[tokio::test]
async fn test_rollback_failure_does_not_mask_work_error() {
    let (coordinator, log) = scripted(Script {
        fail_rollback: true,
        ..Script::default()
    });

    let result: Result<(), DbError> = coordinator
        .run_in_transaction(None, |_tx| {
            Box::pin(async move { Err(DbError::ExecutionError("constraint violated".into())) })
        })
        .await;

    assert_eq!(
        result.unwrap_err(),
        DbError::ExecutionError("constraint violated".into())
    );
    assert_eq!(coordinator.provider().count("release"), 1);
    assert_eq!(log.count_containing(Level::ERROR, "Rollback failed"), 1);
}

#[tokio::test]
async fn test_commit_failure_is_returned_after_rollback() {
    let (coordinator, _log) = scripted(Script {
        fail_commit: true,
        ..Script::default()
    });

    let result = coordinator
        .run_in_transaction(None, |_tx| Box::pin(async move { Ok::<_, DbError>("done") }))
        .await;

    assert_eq!(
        result.unwrap_err(),
        DbError::TransactionError("commit refused".into())
    );
    assert_eq!(
        coordinator.provider().calls(),
        vec!["create", "connect", "begin", "commit", "rollback", "release"]
    );
}

#[tokio::test]
async fn test_begin_failure_skips_work_and_releases() {
    let (coordinator, _log) = scripted(Script {
        fail_begin: true,
        ..Script::default()
    });
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    let result = coordinator
        .run_in_transaction(None, move |_tx| {
            flag.store(true, Ordering::SeqCst);
            Box::pin(async move { Ok::<_, DbError>(()) })
        })
        .await;

    assert!(matches!(result, Err(DbError::TransactionError(_))));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(
        coordinator.provider().calls(),
        vec!["create", "connect", "begin", "release"]
    );
}

#[tokio::test]
async fn test_connect_failure_releases_without_begin() {
    let (coordinator, _log) = scripted(Script {
        fail_connect: true,
        ..Script::default()
    });

    let result = coordinator
        .run_in_transaction(None, |_tx| Box::pin(async move { Ok::<_, DbError>(()) }))
        .await;

    assert!(matches!(result, Err(DbError::ConnectionError(_))));
    assert_eq!(
        coordinator.provider().calls(),
        vec!["create", "connect", "release"]
    );
}

#[tokio::test]
async fn test_release_failure_keeps_committed_result() {
    let (coordinator, log) = scripted(Script {
        fail_release: true,
        ..Script::default()
    });

    let result = coordinator
        .run_in_transaction(None, |_tx| Box::pin(async move { Ok::<_, DbError>(7) }))
        .await;

    assert_eq!(assert_ok!(result), 7);
    assert_eq!(log.count_containing(Level::ERROR, "Failed to release session"), 1);
}

#[tokio::test]
async fn test_work_sees_its_session() {
    let (coordinator, _log) = scripted(Script::default());

    let seen = coordinator
        .run_in_transaction(Some("inspect"), |tx| {
            Box::pin(async move {
                assert!(tx.is_active());
                assert_eq!(tx.depth(), 1);
                assert_eq!(tx.context(), Some("inspect"));
                tx.query("SELECT 1").await?;
                Ok::<_, DbError>(tx.data().clone())
            })
        })
        .await
        .unwrap();

    assert_eq!(seen, vec!["SELECT 1".to_string()]);
}

#[tokio::test]
async fn test_atomicity_on_memory_provider() {
    let (coordinator, _log) = memory();

    let result: Result<(), DbError> = coordinator
        .run_in_transaction(Some("transfer"), |tx| {
            Box::pin(async move {
                tx.data().put("accounts", "alice", json!(50)).await?;
                tx.data().put("accounts", "bob", json!(150)).await?;
                Err(DbError::ExecutionError("insufficient funds".into()))
            })
        })
        .await;
    assert_err!(result);

    let storage = coordinator.provider().storage();
    assert!(storage.scan("accounts").unwrap().is_empty());
    assert_eq!(coordinator.provider().stats().active_connections, 0);

    coordinator
        .run_in_transaction(Some("transfer"), |tx| {
            Box::pin(async move {
                tx.data().put("accounts", "alice", json!(50)).await?;
                tx.data().put("accounts", "bob", json!(150)).await?;
                Ok::<_, DbError>(())
            })
        })
        .await
        .unwrap();

    assert_eq!(storage.scan("accounts").unwrap().len(), 2);
    let stats = coordinator.provider().stats();
    assert_eq!(stats.total_acquired, 2);
    assert_eq!(stats.total_released, 2);
}

#[tokio::test]
async fn test_timeout_rolls_back_and_releases() {
    let (coordinator, _log) = memory();
    let coordinator = coordinator.with_config(TransactionConfig::new().timeout(Duration::from_millis(20)));

    let result = coordinator
        .run_in_transaction(None, |tx| {
            Box::pin(async move {
                tx.data().put("jobs", "j1", json!("started")).await?;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, DbError>(())
            })
        })
        .await;

    assert!(matches!(result, Err(DbError::Timeout(_))));
    assert!(coordinator.provider().storage().scan("jobs").unwrap().is_empty());
    assert_eq!(coordinator.provider().stats().active_connections, 0);
}

#[tokio::test]
async fn test_panic_in_future_rolls_back_and_resumes() {
    let (coordinator, log) = scripted(Script::default());

    let outcome = AssertUnwindSafe(coordinator.run_in_transaction(None, |_tx| {
        Box::pin(async move {
            let explode = true;
            if explode {
                panic!("unit of work exploded");
            }
            Ok::<_, DbError>(())
        })
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(
        coordinator.provider().calls(),
        vec!["create", "connect", "begin", "rollback", "release"]
    );
    assert_eq!(log.count_containing(Level::ERROR, "panicked"), 1);
}

#[tokio::test]
async fn test_panic_before_future_is_built() {
    let (coordinator, _log) = scripted(Script::default());

    let outcome = AssertUnwindSafe(
        coordinator.run_in_transaction::<(), DbError, _>(None, |_tx| panic!("closure exploded")),
    )
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(coordinator.provider().count("rollback"), 1);
    assert_eq!(coordinator.provider().count("release"), 1);
}

#[tokio::test]
async fn test_anyhow_error_type() {
    let (coordinator, _log) = scripted(Script::default());

    let result: anyhow::Result<()> = coordinator
        .run_in_transaction(None, |_tx| {
            Box::pin(async move { Err(anyhow::anyhow!("appointment not found")) })
        })
        .await;

    assert_eq!(result.unwrap_err().to_string(), "appointment not found");
    assert_eq!(coordinator.provider().count("rollback"), 1);
}

#[tokio::test]
async fn test_session_handle_is_left_to_the_caller() {
    let (coordinator, _log) = scripted(Script::default());

    let mut session = coordinator.create_session_handle().await.unwrap();
    assert!(!session.is_transaction_active());
    assert_eq!(coordinator.provider().calls(), vec!["create", "connect"]);

    session.begin_transaction().await.unwrap();
    session.commit_transaction().await.unwrap();
    session.release().await.unwrap();
    assert_eq!(coordinator.provider().count("release"), 1);
}

#[tokio::test]
async fn test_session_handle_connect_failure() {
    let (coordinator, _log) = scripted(Script {
        fail_connect: true,
        ..Script::default()
    });

    let result = coordinator.create_session_handle().await;
    assert!(matches!(result, Err(DbError::ConnectionError(_))));
    assert_eq!(coordinator.provider().count("release"), 1);
}
