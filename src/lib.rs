//! # trellis
//!
//! Routing and dependency injection for async HTTP services on hyper.
//!
//! A [`Router`] maps typed URL patterns to handlers. A [`Requirer`] wraps a
//! handler with prepare hooks and per-argument injectors, so the handler
//! receives ready-made values instead of digging them out of the request.
//! Everything a request needs is resolved in one future: match, hooks,
//! injectors, handler, response metadata, error handlers. When the client
//! goes away mid-request, that future is dropped.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::Method;
//! use trellis::{Arguments, Error, Request, Response, Route, Router, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Router::new()
//!         .add(Route::at("/users/<int:id>").method(Method::GET).name("user"), get_user)
//!         .on(Method::POST, "/users/", create_user);
//!
//!     Server::bind("0.0.0.0:8080").serve(app).await.unwrap();
//! }
//!
//! async fn get_user(_req: Request, args: Arguments) -> Result<Response, Error> {
//!     let id = args.get::<i64>("id")?;
//!     Ok(Response::json(format!(r#"{{"id":{id}}}"#)))
//! }
//!
//! async fn create_user(req: Request, _args: Arguments) -> Result<Response, Error> {
//!     let location = req.url_for("user").param("id", 99).build()?;
//!     Ok(Response::builder()
//!         .status(http::StatusCode::CREATED)
//!         .header("location", location)
//!         .no_body())
//! }
//! ```

mod arguments;
mod components;
mod error;
mod handler;
mod lifecycle;
mod request;
mod requirer;
mod response;
mod router;
mod server;

pub mod inject;
pub mod route;

pub use arguments::{Arguments, Value};
pub use components::{Capability, Components};
pub use error::{Error, MethodNotAllowed, NotFound, UrlDecodeError, UrlPart};
pub use handler::{BoxFuture, ErrorHandler, Handler};
pub use lifecycle::{Hook, Lifecycle};
pub use request::{Connection, Request, RequestBuilder, UrlFor};
pub use requirer::{Injected, Injector, Required, Requirement, Requirer};
pub use response::{Body, HeaderValues, IntoResponse, Render, Response, ResponseBuilder};
pub use route::Route;
pub use router::{Outcome, Router};
pub use server::Server;
