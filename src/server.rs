//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or **Ctrl-C** the server:
//! 1. stops `listener.accept()` so no new connections are made;
//! 2. lets every in-flight connection task run to completion;
//! 3. returns from [`Server::serve`], which lets `main` exit cleanly.
//!
//! # Lost connections
//!
//! Every request is dispatched on its own task and gets its own
//! [`Connection`] handle. When the client hangs up (or resets an HTTP/2
//! stream), hyper drops the service future waiting on that task; a guard in
//! it marks the handle lost, and the dispatch task cancels the handler and
//! ends with [`Outcome::Disconnected`]. A hang-up is logged at `debug`,
//! never as a failure.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::request::{Connection, Request};
use crate::router::{Outcome, Router};

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
    secure: bool,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    ///
    /// ```rust,no_run
    /// use trellis::Server;
    /// let server = Server::bind("0.0.0.0:8080");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { addr, secure: false }
    }

    /// Report every request as arriving over a secure transport, for
    /// deployments where a proxy terminates TLS.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Starts accepting connections and dispatching them through `router`.
    ///
    /// Returns only after a full graceful shutdown.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        let router = Arc::new(router);
        let secure = self.secure;

        info!(addr = %self.addr, secure, "trellis listening");

        let mut tasks = tokio::task::JoinSet::new();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        // Accept errors (e.g. EMFILE) are per-connection; keep serving.
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    // TokioIo adapts tokio's AsyncRead/AsyncWrite to hyper's IO traits.
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let router = Arc::clone(&router);
                            async move { handle(router, req, remote_addr, secure).await }
                        });

                        // The auto builder speaks HTTP/1.1 or HTTP/2, whichever
                        // the client opens with.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            if client_went_away(&*e) {
                                debug!(peer = %remote_addr, "client closed the connection: {e}");
                            } else {
                                error!(peer = %remote_addr, "connection error: {e}");
                            }
                        }
                    });
                }

                // Reap finished connection tasks so the set does not grow
                // for the life of the server.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Drain: wait for every in-flight connection to finish.
        while tasks.join_next().await.is_some() {}

        info!("trellis stopped");
        Ok(())
    }
}

/// Marks its connection lost if dropped while armed: hyper dropped the
/// service future because the client went away.
struct LoseOnDrop {
    connection: Connection,
    armed: bool,
}

impl Drop for LoseOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.connection.lose();
        }
    }
}

/// Buffers one hyper request, dispatches it and converts the outcome.
async fn handle(
    router: Arc<Router>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
    secure: bool,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let mut guard = LoseOnDrop { connection: Connection::new(), armed: true };

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            guard.armed = false;
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            let mut response = http::Response::new(Full::new(Bytes::new()));
            *response.status_mut() = http::StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let req = Request::from_http(http::Request::from_parts(parts, body), remote_addr, secure, &guard.connection);
    // Dispatch outlives this future: if hyper drops us, the task is left to
    // notice the lost connection and cancel the handler itself.
    let dispatched = tokio::spawn(router.dispatch(req)).await;
    guard.armed = false;

    let response = match dispatched {
        Ok(Outcome::Completed(response) | Outcome::Failed { response, .. }) => response,
        Ok(Outcome::Disconnected) => {
            debug!(peer = %remote_addr, "client disconnected before a response was ready");
            http::Response::new(Bytes::new())
        }
        Err(e) => {
            error!(peer = %remote_addr, "dispatch task failed: {e}");
            let mut response = http::Response::new(Bytes::new());
            *response.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    };
    Ok(response.map(Full::new))
}

/// `true` for errors that only mean the client hung up mid-exchange.
fn client_went_away(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(e) = e.downcast_ref::<hyper::Error>() {
            if e.is_incomplete_message() || e.is_canceled() || e.is_closed() {
                return true;
            }
        }
        if let Some(e) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Resolves on the first shutdown signal the process receives: SIGTERM or
/// SIGINT on Unix, Ctrl-C elsewhere.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
