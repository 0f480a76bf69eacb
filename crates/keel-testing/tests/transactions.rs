//! Transaction coordinator behavior: nesting, disconnect, fuse, modes.

use std::time::Duration;

use keel_conn::{ConnectOptions, Connection};
use keel_pool::{PoolConfig, PoolError};
use keel_testing::{TestConnector, init_tracing};
use keel_txn::{Coordinator, Mode, TransactionError};

const T: Duration = Duration::from_secs(5);

async fn coordinator_of(connector: &TestConnector, size: usize) -> Coordinator<TestConnector> {
    Coordinator::start(
        connector.clone(),
        ConnectOptions::default(),
        PoolConfig::new().size(size),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn outermost_transaction_reports_depth_and_queue_time() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    let value = db
        .transaction(T, |tx| {
            Box::pin(async move {
                assert_eq!(tx.depth(), 0);
                assert_eq!(tx.mode(), Mode::Raw);
                assert!(tx.queue_time().is_some());
                tx.connection().unwrap().id()
            })
        })
        .await
        .unwrap();

    assert_eq!(value, 1);
}

#[tokio::test]
async fn nested_transactions_share_one_checkout() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 2).await;

    let (outer_id, inner_id) = db
        .transaction(T, |tx| {
            Box::pin(async move {
                let outer_id = tx.connection().unwrap().id();

                let inner_id = tx
                    .transaction(|tx| {
                        Box::pin(async move {
                            assert_eq!(tx.depth(), 1);
                            assert!(tx.queue_time().is_none());
                            tx.connection().unwrap().id()
                        })
                    })
                    .await
                    .unwrap();

                // Back in the outer scope.
                assert_eq!(tx.depth(), 0);
                assert!(tx.queue_time().is_some());
                (outer_id, inner_id)
            })
        })
        .await
        .unwrap();

    assert_eq!(outer_id, inner_id);
    assert_eq!(connector.opened(), 2);
    assert_eq!(db.pool().metrics().checkouts_successful, 1);
}

#[tokio::test]
async fn disconnect_poisons_the_rest_of_the_stack() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    db.transaction(T, |tx| {
        Box::pin(async move {
            let before = tx.connection().unwrap().handle();
            tx.disconnect(T).await;

            assert!(!before.is_alive());
            assert!(matches!(
                tx.connection(),
                Err(TransactionError::NoConnection)
            ));

            // The nested body must not run at all.
            let nested: Result<(), _> = tx
                .transaction(|_tx| {
                    Box::pin(async move { unreachable!("nested body ran after disconnect") })
                })
                .await;
            assert!(matches!(nested, Err(TransactionError::NoConnection)));
        })
    })
    .await
    .unwrap();

    // A fresh outermost transaction recovers with a new session.
    let next_id = db
        .transaction(T, |tx| Box::pin(async move { tx.connection().unwrap().id() }))
        .await
        .unwrap();
    assert_eq!(next_id, 2);
}

#[tokio::test]
async fn fuse_disconnects_on_error_and_returns_it_unchanged() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    db.transaction(T, |tx| {
        Box::pin(async move {
            let result: Result<(), &str> = tx
                .fuse(T, |_tx| Box::pin(async move { Err("boom") }))
                .await;
            assert_eq!(result.unwrap_err(), "boom");
            assert!(matches!(
                tx.connection(),
                Err(TransactionError::NoConnection)
            ));
        })
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn fuse_passes_success_through_without_side_effects() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    db.transaction(T, |tx| {
        Box::pin(async move {
            let result: Result<u8, &str> = tx
                .fuse(T, |tx| {
                    Box::pin(async move {
                        tx.connection().map_err(|_| "gone")?;
                        Ok(9)
                    })
                })
                .await;
            assert_eq!(result.unwrap(), 9);
            assert!(tx.connection().is_ok());
        })
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn set_mode_twice_is_reported_not_performed() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    db.transaction(T, |tx| {
        Box::pin(async move {
            tx.set_mode(Mode::Sandbox, T).await.unwrap();
            assert!(tx.connection().unwrap().in_sandbox());

            let again = tx.set_mode(Mode::Sandbox, T).await;
            assert!(matches!(
                again,
                Err(TransactionError::AlreadyInMode(Mode::Sandbox))
            ));
            // No side effects: still sandboxed, still connected.
            assert!(tx.connection().unwrap().in_sandbox());
        })
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn killed_session_is_replaced_on_the_next_transaction() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    let (first_id, first_handle) = db
        .transaction(T, |tx| {
            Box::pin(async move {
                let conn = tx.connection().unwrap();
                let handle = conn.handle();
                conn.kill();
                (handle.id(), handle)
            })
        })
        .await
        .unwrap();

    let second_id = db
        .transaction(T, |tx| Box::pin(async move { tx.connection().unwrap().id() }))
        .await
        .unwrap();

    assert_ne!(first_id, second_id);
    assert!(!first_handle.is_alive());
    assert_eq!(db.pool().metrics().implicit_breaks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_in_raw_mode_closes_the_session() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;
    let first = connector.last_session().unwrap();

    let crashed = {
        let db = db.clone();
        tokio::spawn(async move {
            db.transaction::<(), _>(T, |_tx| {
                Box::pin(async move {
                    panic!("caller died mid-transaction");
                })
            })
            .await
        })
    };
    assert!(crashed.await.is_err());

    // Raw mode: the session state was unknown, so it was condemned.
    assert!(!first.is_alive());
    let next_id = db
        .transaction(T, |tx| Box::pin(async move { tx.connection().unwrap().id() }))
        .await
        .unwrap();
    assert_ne!(next_id, first.id());
}

#[tokio::test(start_paused = true)]
async fn second_caller_queue_time_reflects_first_holding() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    let holder = {
        let db = db.clone();
        tokio::spawn(async move {
            db.transaction(T, |_tx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                })
            })
            .await
            .unwrap();
        })
    };

    // Give the holder time to win the only worker.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queue_time = db
        .transaction(Duration::from_secs(30), |tx| {
            Box::pin(async move { tx.queue_time().unwrap() })
        })
        .await
        .unwrap();

    assert!(queue_time >= Duration::from_millis(250));
    holder.await.unwrap();
}

#[tokio::test]
async fn run_checks_out_and_returns() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    let (id, queue_time) = db
        .run(T, |conn, queue_time| {
            Box::pin(async move { (conn.id(), queue_time) })
        })
        .await
        .unwrap();

    assert_eq!(id, 1);
    assert!(queue_time.is_some());
    assert_eq!(db.pool().status().idle, 1);
}

#[tokio::test]
async fn run_inside_a_transaction_reuses_the_connection() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    db.transaction(T, |tx| {
        Box::pin(async move {
            let outer_id = tx.connection().unwrap().id();

            let (inner_id, queue_time) = tx
                .run(|conn, queue_time| Box::pin(async move { (conn.id(), queue_time) }))
                .await
                .unwrap();

            assert_eq!(inner_id, outer_id);
            assert!(queue_time.is_none());
            // Depth-transparent: no nesting bookkeeping happened.
            assert_eq!(tx.depth(), 0);
        })
    })
    .await
    .unwrap();

    assert_eq!(connector.opened(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_inside_run_keeps_the_session() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;
    let first = connector.last_session().unwrap();

    let crashed = {
        let db = db.clone();
        tokio::spawn(async move {
            db.run::<(), _>(T, |_conn, _queue_time| {
                Box::pin(async move {
                    panic!("caller died mid-run");
                })
            })
            .await
        })
    };
    assert!(crashed.await.is_err());

    // No transaction was open: the session is known good and is reused.
    assert!(first.is_alive());
    let id = db
        .run(T, |conn, _| Box::pin(async move { conn.id() }))
        .await
        .unwrap();
    assert_eq!(id, first.id());
}

#[tokio::test]
async fn stopped_coordinator_reports_pool_closed() {
    init_tracing();
    let connector = TestConnector::new();
    let db = coordinator_of(&connector, 1).await;

    db.stop().await;

    let result: Result<(), _> = db.transaction(T, |_tx| Box::pin(async move {})).await;
    assert!(matches!(
        result,
        Err(TransactionError::Pool(PoolError::Closed))
    ));
}
