//! Handler traits and type erasure.
//!
//! # How async handlers are stored
//!
//! A router holds handlers of many concrete types in one rule list, so each
//! one is erased behind `dyn ErasedHandler`:
//!
//! ```text
//! async fn show(req: Request, args: Arguments) -> Result<String, Error>   ← user writes this
//!        ↓ router.on(Method::GET, "/<int:id>", show)
//! show.into_boxed_handler()                         ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(show))                         ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(req, args)  at request time          ← one vtable dispatch
//!        ↓
//! Box::pin(async { show(req, args).await.map(IntoResponse::into_response) })
//! ```
//!
//! Error handlers go through the same dance with [`ErrorHandler`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::arguments::Arguments;
use crate::error::Error;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// A heap-allocated, type-erased future.
///
/// `Pin<Box<…>>` because the runtime polls it in place; `Send` so tokio may
/// move it between worker threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request, args: Arguments) -> BoxFuture<'static, Result<Response, Error>>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// Satisfied by any async function or closure shaped like
///
/// ```text
/// async fn name(req: Request, args: Arguments) -> Result<impl IntoResponse, impl Into<Error>>
/// ```
///
/// and by dependency-injected handlers built with
/// [`Requirer::require`](crate::Requirer::require). The trait is sealed.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

pub(crate) mod private {
    pub trait Sealed {}
    pub trait SealedErrorHandler {}
}

impl<F, Fut, R, E> private::Sealed for F
where
    F: Fn(Request, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoResponse + Send + 'static,
    E: Into<Error> + Send + 'static,
{
}

impl<F, Fut, R, E> Handler for F
where
    F: Fn(Request, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoResponse + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Bridges a concrete handler `F` to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R, E> ErasedHandler for FnHandler<F>
where
    F: Fn(Request, Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoResponse + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    fn call(&self, req: Request, args: Arguments) -> BoxFuture<'static, Result<Response, Error>> {
        let fut = (self.0)(req, args);
        Box::pin(async move { fut.await.map(IntoResponse::into_response).map_err(Into::into) })
    }
}

// ── Error handlers ────────────────────────────────────────────────────────────

#[doc(hidden)]
pub trait ErasedErrorHandler {
    fn call(&self, req: Request, err: Error) -> BoxFuture<'static, Result<Response, Error>>;
}

#[doc(hidden)]
pub type BoxedErrorHandler = Arc<dyn ErasedErrorHandler + Send + Sync + 'static>;

/// Implemented for every valid error handler:
///
/// ```text
/// async fn name(req: Request, err: Error) -> Result<impl IntoResponse, impl Into<Error>>
/// ```
///
/// Returning `Err` passes the new error on to the next matching handler.
pub trait ErrorHandler: private::SealedErrorHandler + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_error_handler(self) -> BoxedErrorHandler;
}

impl<F, Fut, R, E> private::SealedErrorHandler for F
where
    F: Fn(Request, Error) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoResponse + Send + 'static,
    E: Into<Error> + Send + 'static,
{
}

impl<F, Fut, R, E> ErrorHandler for F
where
    F: Fn(Request, Error) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoResponse + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    fn into_boxed_error_handler(self) -> BoxedErrorHandler {
        Arc::new(FnErrorHandler(self))
    }
}

struct FnErrorHandler<F>(F);

impl<F, Fut, R, E> ErasedErrorHandler for FnErrorHandler<F>
where
    F: Fn(Request, Error) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoResponse + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    fn call(&self, req: Request, err: Error) -> BoxFuture<'static, Result<Response, Error>> {
        let fut = (self.0)(req, err);
        Box::pin(async move { fut.await.map(IntoResponse::into_response).map_err(Into::into) })
    }
}
