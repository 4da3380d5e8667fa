use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::StatusCode;
use tokio::sync::oneshot;
use trellis::{Arguments, Connection, Error, Outcome, Request, Router};

/// Flags its drop, so a test can see a handler future was cancelled.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn lost_connection_cancels_the_pending_handler() {
    let dropped = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));

    let flag = Arc::clone(&dropped);
    let router = Arc::new(Router::new().route("/slow", move |_req: Request, _args: Arguments| {
        let flag = Arc::clone(&flag);
        let started = started_tx.lock().unwrap().take();
        async move {
            let _guard = DropFlag(flag);
            if let Some(tx) = started {
                let _ = tx.send(());
            }
            std::future::pending::<()>().await;
            Ok::<_, Error>("unreachable")
        }
    }));

    let connection = Connection::new();
    let req = Request::builder().uri("/slow").connection(&connection).build();
    let pending = tokio::spawn(Arc::clone(&router).dispatch(req));

    started_rx.await.unwrap();
    connection.lose();

    let outcome = pending.await.unwrap();
    assert!(outcome.is_disconnected());
    assert!(!outcome.is_failure());
    assert!(dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unrelated_cancellation_is_still_a_failure() {
    let router = Arc::new(Router::new().route("/cancelled", |_req: Request, _args: Arguments| async {
        Err::<&str, _>(Error::Cancelled)
    }));

    let connection = Connection::new();
    let req = Request::builder().uri("/cancelled").connection(&connection).build();
    let outcome = router.dispatch(req).await;

    assert!(outcome.is_failure());
    assert_eq!(outcome.response().unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!connection.is_lost());
}

#[tokio::test]
async fn handlers_finish_while_the_connection_lives() {
    let router = Arc::new(Router::new().route("/quick", |req: Request, _args: Arguments| async move {
        tokio::task::yield_now().await;
        Ok::<_, Error>(format!("lost: {}", req.is_connection_lost()))
    }));

    let connection = Connection::new();
    let req = Request::builder().uri("/quick").connection(&connection).build();
    match router.dispatch(req).await {
        Outcome::Completed(response) => assert_eq!(response.body(), "lost: false"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn requests_without_a_connection_never_disconnect() {
    let router = Arc::new(Router::new().route("/", |_req: Request, _args: Arguments| async {
        Ok::<_, Error>("ok")
    }));

    let outcome = router.dispatch(Request::builder().uri("/").build()).await;
    assert!(matches!(outcome, Outcome::Completed(_)));
}
