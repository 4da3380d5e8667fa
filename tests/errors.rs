use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http::StatusCode;
use trellis::{Arguments, Error, NotFound, Outcome, Render, Request, Response, Router};

#[derive(Debug, thiserror::Error)]
#[error("quota exceeded")]
struct QuotaExceeded;

#[derive(Debug, thiserror::Error)]
#[error("storage unavailable")]
struct StorageDown;

async fn over_quota(_req: Request, _args: Arguments) -> Result<&'static str, Error> {
    Err(Error::custom(QuotaExceeded))
}

async fn storage_down(_req: Request, _args: Arguments) -> Result<&'static str, Error> {
    Err(Error::custom(StorageDown))
}

async fn dispatch(router: &Arc<Router>, uri: &str) -> Outcome {
    Arc::clone(router).dispatch(Request::builder().uri(uri).build()).await
}

fn body(outcome: &Outcome) -> &Bytes {
    outcome.response().expect("no response").body()
}

#[tokio::test]
async fn specific_handler_wins_and_generic_is_untouched() {
    let generic_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&generic_calls);

    let router = Arc::new(
        Router::new()
            .route("/quota", over_quota)
            .handle_all_errors(move |_req: Request, _err: Error| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>("generic") }
            })
            .handle_errors::<QuotaExceeded>(|_req: Request, _err: Error| async {
                Ok::<_, Error>(Response::builder().status(StatusCode::TOO_MANY_REQUESTS).text("slow down"))
            }),
    );

    let outcome = dispatch(&router, "/quota").await;
    assert!(!outcome.is_failure());
    assert_eq!(outcome.response().unwrap().status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body(&outcome), "slow down");
    assert_eq!(generic_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn generic_handler_catches_the_rest() {
    let router = Arc::new(
        Router::new()
            .route("/storage", storage_down)
            .handle_errors::<QuotaExceeded>(|_req: Request, _err: Error| async { Ok::<_, Error>("quota") })
            .handle_all_errors(|_req: Request, err: Error| async move {
                Ok::<_, Error>(Response::builder().status(StatusCode::SERVICE_UNAVAILABLE).text(err.to_string()))
            }),
    );

    let outcome = dispatch(&router, "/storage").await;
    assert_eq!(outcome.response().unwrap().status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body(&outcome), "storage unavailable");
}

#[tokio::test]
async fn failing_error_handler_passes_its_error_on() {
    let router = Arc::new(
        Router::new()
            .route("/quota", over_quota)
            .handle_errors::<QuotaExceeded>(|_req: Request, _err: Error| async {
                Err::<&str, _>(Error::custom(StorageDown))
            })
            .handle_errors::<QuotaExceeded>(|_req: Request, _err: Error| async { Ok::<_, Error>("stale") })
            .handle_errors::<StorageDown>(|_req: Request, _err: Error| async { Ok::<_, Error>("recovered") }),
    );

    assert_eq!(body(&dispatch(&router, "/quota").await), "recovered");
}

#[tokio::test]
async fn routing_misses_can_be_handled() {
    let router = Arc::new(Router::new().handle_errors::<NotFound>(|req: Request, _err: Error| async move {
        Ok::<_, Error>(Response::builder().status(StatusCode::NOT_FOUND).text(format!("no {}", req.path())))
    }));

    let outcome = dispatch(&router, "/missing").await;
    assert_eq!(outcome.response().unwrap().status(), StatusCode::NOT_FOUND);
    assert_eq!(body(&outcome), "no /missing");
}

#[tokio::test]
async fn unhandled_errors_are_processing_failures() {
    let router = Arc::new(Router::new().route("/storage", storage_down));

    let outcome = dispatch(&router, "/storage").await;
    assert!(outcome.is_failure());
    assert_eq!(outcome.response().unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body(&outcome), "Internal Server Error");
    match outcome {
        Outcome::Failed { error, .. } => assert!(error.is::<StorageDown>()),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn tracebacks_expose_the_error_when_enabled() {
    let router = Arc::new(Router::new().route("/storage", storage_down).display_tracebacks(true));

    let outcome = dispatch(&router, "/storage").await;
    assert_eq!(body(&outcome), "storage unavailable");
}

#[tokio::test]
async fn client_errors_are_not_failures() {
    let router = Arc::new(Router::new());

    let outcome = dispatch(&router, "/nothing").await;
    assert!(!outcome.is_failure());
    assert_eq!(outcome.response().unwrap().status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn early_exit_from_a_plain_handler_is_a_response() {
    let router = Arc::new(Router::new().route("/gone", |_req: Request, _args: Arguments| async {
        Err::<&str, _>(Error::early_exit(Response::status(StatusCode::GONE)))
    }));

    let outcome = dispatch(&router, "/gone").await;
    assert!(!outcome.is_failure());
    assert_eq!(outcome.response().unwrap().status(), StatusCode::GONE);
}

#[tokio::test]
async fn second_metadata_application_fails() {
    async fn twice(req: Request, _args: Arguments) -> Result<Response, Error> {
        Response::status(StatusCode::ACCEPTED).apply_to(&req)?;
        Ok(Response::status(StatusCode::CREATED))
    }
    let router = Arc::new(Router::new().route("/twice", twice));

    let outcome = dispatch(&router, "/twice").await;
    match outcome {
        Outcome::Failed { error: Error::MetadataApplied, .. } => {}
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("template failed")]
struct TemplateError;

struct Broken;

impl Render for Broken {
    fn render(&self, _req: &Request) -> Result<Bytes, Error> {
        Err(Error::custom(TemplateError))
    }
}

#[tokio::test]
async fn error_handlers_replace_metadata_of_a_failed_response() {
    let router = Arc::new(
        Router::new()
            .route("/page", |_req: Request, _args: Arguments| async {
                Ok::<_, Error>(
                    Response::builder()
                        .header("content-type", "application/json")
                        .header("x-page", "1")
                        .render(Broken),
                )
            })
            .handle_errors::<TemplateError>(|_req: Request, _err: Error| async {
                Ok::<_, Error>(Response::builder().status(StatusCode::SERVICE_UNAVAILABLE).text("try later"))
            }),
    );

    let outcome = dispatch(&router, "/page").await;
    assert!(!outcome.is_failure());
    let response = outcome.response().unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body(), "try later");
    assert_eq!(response.headers()["content-type"], "text/plain; charset=utf-8");
    assert!(response.headers().get("x-page").is_none());
}

#[tokio::test]
async fn unhandled_failures_drop_headers_of_the_failed_response() {
    let router = Arc::new(Router::new().route("/page", |_req: Request, _args: Arguments| async {
        Ok::<_, Error>(Response::builder().header("x-page", "1").render(Broken))
    }));

    let outcome = dispatch(&router, "/page").await;
    assert!(outcome.is_failure());
    let response = outcome.response().unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get("x-page").is_none());
}
