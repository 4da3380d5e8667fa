//! The application router and the per-request dispatch pipeline.
//!
//! Rules are kept in registration order and matched by specificity (see
//! [`route`](crate::route)). Dispatching one request goes:
//!
//! 1. percent-decode the URL, answering `400` if it is not UTF-8;
//! 2. resolve the remaining path against the rules;
//! 3. redirect, or run the matched handler while watching the connection;
//! 4. apply the response metadata and render the body, handing the rest of
//!    the path to a nested router if the handler returned one;
//! 5. on failure, walk the error handlers.

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use http::header::HOST;
use http::{Method, StatusCode};
use percent_encoding::{percent_decode, percent_decode_str};
use tracing::{debug, error, warn};

use crate::error::{Error, MethodNotAllowed, NotFound, UrlDecodeError, UrlPart};
use crate::handler::{BoxFuture, BoxedErrorHandler, ErrorHandler, Handler};
use crate::request::Request;
use crate::response::{Body, Response};
use crate::route::{self, Resolution, Route, Rule, Target};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// What became of one dispatched request.
#[derive(Debug)]
pub enum Outcome {
    /// A response was produced, including handled errors and client errors.
    Completed(http::Response<Bytes>),
    /// Processing failed and no error handler recovered. The response is the
    /// default `5xx` answer.
    Failed { response: http::Response<Bytes>, error: Error },
    /// The client went away before the handler settled; the handler was
    /// dropped and there is nobody to answer.
    Disconnected,
}

impl Outcome {
    pub fn response(&self) -> Option<&http::Response<Bytes>> {
        match self {
            Self::Completed(response) | Self::Failed { response, .. } => Some(response),
            Self::Disconnected => None,
        }
    }

    pub fn into_response(self) -> Option<http::Response<Bytes>> {
        match self {
            Self::Completed(response) | Self::Failed { response, .. } => Some(response),
            Self::Disconnected => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// The application router.
///
/// Build it once at startup and pass it to [`Server::serve`](crate::Server::serve).
/// Every registration method returns `self` so calls chain.
#[derive(Default)]
pub struct Router {
    rules: Vec<Rule>,
    prefix: String,
    specific: Vec<(fn(&Error) -> bool, BoxedErrorHandler)>,
    generic: Vec<BoxedErrorHandler>,
    display_tracebacks: bool,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method + pattern pair.
    ///
    /// ```rust
    /// # use trellis::{Arguments, Error, Request, Router};
    /// # use http::Method;
    /// # async fn get_user(_: Request, _: Arguments) -> Result<&'static str, Error> { Ok("") }
    /// # async fn create_user(_: Request, _: Arguments) -> Result<&'static str, Error> { Ok("") }
    /// Router::new()
    ///     .on(Method::GET,  "/users/<int:id>", get_user)
    ///     .on(Method::POST, "/users/",         create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid route pattern.
    pub fn on(self, method: Method, pattern: &str, handler: impl Handler) -> Self {
        self.add(Route::at(pattern).method(method), handler)
    }

    /// Register a handler for every method.
    pub fn route(self, pattern: &str, handler: impl Handler) -> Self {
        self.add(Route::at(pattern), handler)
    }

    /// Register a handler with full [`Route`] options.
    pub fn add(mut self, route: Route, handler: impl Handler) -> Self {
        self.push(route, Target::Handler(handler.into_boxed_handler()));
        self
    }

    /// Register a redirect route built with [`Route::redirect_to`].
    ///
    /// # Panics
    ///
    /// Panics if the route has no target or either pattern is invalid.
    pub fn redirect(mut self, route: Route) -> Self {
        let target = route
            .redirect_to
            .clone()
            .unwrap_or_else(|| panic!("redirect route `{}` has no target", route.pattern));
        let target = route::Pattern::parse(&target)
            .unwrap_or_else(|e| panic!("invalid redirect target `{target}`: {e}"));
        self.push(route, Target::Redirect(target));
        self
    }

    fn push(&mut self, route: Route, target: Target) {
        let index = self.rules.len();
        let pattern = route.pattern.clone();
        let rule = Rule::compile(index, &self.prefix, route, target)
            .unwrap_or_else(|e| panic!("invalid route `{}{pattern}`: {e}", self.prefix));
        self.rules.push(rule);
    }

    /// Registers everything `build` adds with `prefix` in front of its pattern.
    ///
    /// ```rust
    /// # use trellis::{Arguments, Error, Request, Router};
    /// # async fn list(_: Request, _: Arguments) -> Result<&'static str, Error> { Ok("") }
    /// Router::new().subroute("/api/v1", |r| r.route("/users/", list));
    /// ```
    pub fn subroute(mut self, prefix: &str, build: impl FnOnce(Self) -> Self) -> Self {
        let outer = std::mem::take(&mut self.prefix);
        self.prefix = format!("{outer}{}", prefix.trim_end_matches('/'));
        let mut router = build(self);
        router.prefix = outer;
        router
    }

    /// Handle errors whose chain contains an `E`. Type-specific handlers are
    /// consulted in registration order, before any generic handler.
    pub fn handle_errors<E: StdError + 'static>(mut self, handler: impl ErrorHandler) -> Self {
        let matches: fn(&Error) -> bool = Error::is::<E>;
        self.specific.push((matches, handler.into_boxed_error_handler()));
        self
    }

    /// Handle any error not claimed by a type-specific handler.
    pub fn handle_all_errors(mut self, handler: impl ErrorHandler) -> Self {
        self.generic.push(handler.into_boxed_error_handler());
        self
    }

    /// Include the error chain in the body of unhandled `5xx` responses.
    pub fn display_tracebacks(mut self, enabled: bool) -> Self {
        self.display_tracebacks = enabled;
        self
    }

    pub(crate) fn build_url(
        &self,
        endpoint: &str,
        values: &[(String, String)],
        method: Option<&Method>,
        script_name: &[String],
    ) -> Result<String, Error> {
        let path = route::build_path(&self.rules, endpoint, values, method).ok_or_else(|| {
            let reason = if self.rules.iter().any(|r| r.endpoint == endpoint) {
                "no rule for this endpoint accepts the given values"
            } else {
                "no such endpoint"
            };
            Error::BuildUrl { endpoint: endpoint.to_owned(), reason: reason.into() }
        })?;
        Ok(format!("{}{path}", script_prefix(script_name)))
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Routes `req` through this router and produces its outcome.
    pub fn dispatch(self: Arc<Self>, req: Request) -> BoxFuture<'static, Outcome> {
        Box::pin(async move { self.run(&req).await })
    }

    async fn run(self: Arc<Self>, req: &Request) -> Outcome {
        let segments = match decode(req) {
            Ok(segments) => segments,
            Err(e) => {
                warn!(error = %e, uri = %req.uri(), "rejecting undecodable URL");
                req.set_status(StatusCode::BAD_REQUEST);
                return Outcome::Completed(req.finish(Some(TEXT_PLAIN), Bytes::from_static(b"Non-UTF-8 encoding in URL.")));
            }
        };
        // From here on `url_for` builds against this router, relative to the
        // segments the outer routers consumed.
        req.bind_router(Arc::clone(&self));

        let (rule, handler, captures) = match route::resolve(&self.rules, req.method(), &segments) {
            Resolution::Matched { rule, handler, captures } => (rule, Arc::clone(handler), captures),
            Resolution::Redirect(path) => return self.redirect_to(req, &path),
            Resolution::NotFound => {
                let err = NotFound { path: req.path().to_owned() };
                return self.recover(req, err.into()).await;
            }
            Resolution::MethodNotAllowed(allowed) => {
                let err = MethodNotAllowed { method: req.method().clone(), path: req.path().to_owned(), allowed };
                return self.recover(req, err.into()).await;
            }
        };
        debug!(method = %req.method(), path = req.path(), rule = %rule.source, "matched");

        // Branch routes consume only their fixed prefix; a nested router
        // picks up from the rest.
        req.consume_segments(captures.consumed);
        if let Some(branch) = captures.branch {
            req.set_branch_segments(branch);
        }

        let call = handler.call(req.clone(), captures.args);
        let result = tokio::select! {
            // `biased` polls the handler first: a result that is already
            // there is delivered even if the client has just gone.
            biased;
            result = call => result,
            () = req.connection_lost() => {
                debug!(path = req.path(), "connection lost, handler cancelled");
                return Outcome::Disconnected;
            }
        };

        let rendered = match result {
            Ok(response) => self.render(req, response).await,
            Err(e) => Err(e),
        };
        match rendered {
            Ok(outcome) => outcome,
            Err(e) => self.recover(req, e).await,
        }
    }

    /// Applies `response` to `req` and renders its body.
    async fn render(&self, req: &Request, response: Response) -> Result<Outcome, Error> {
        let body = response.apply_to(req)?;
        let response = match body {
            Body::Empty => req.finish(None, Bytes::new()),
            Body::Bytes(bytes) => req.finish(None, bytes),
            Body::Text(text) => req.finish(Some(TEXT_PLAIN), text.into()),
            Body::Render(renderable) => {
                let bytes = renderable.render(req)?;
                req.finish(Some(renderable.content_type()), bytes)
            }
            Body::Resource(router) => return Ok(router.dispatch(req.clone()).await),
        };
        Ok(Outcome::Completed(response))
    }

    /// Offers `err` to the type-specific handlers, then the generic ones.
    /// A handler that fails hands its own error to the rest of the chain.
    async fn recover(&self, req: &Request, mut err: Error) -> Outcome {
        let chain = self
            .specific
            .iter()
            .map(|(matches, handler)| (Some(*matches), handler))
            .chain(self.generic.iter().map(|handler| (None, handler)));

        for (matches, handler) in chain {
            // An error handler may itself exit early; that is an answer,
            // not another error to route.
            err = match err {
                Error::EarlyExit(response) => {
                    req.reset_head();
                    match self.render(req, *response).await {
                        Ok(outcome) => return outcome,
                        Err(e) => e,
                    }
                }
                other => other,
            };
            if matches.is_some_and(|matches| !matches(&err)) {
                continue;
            }
            // Whatever the failed response wrote to the head is void now.
            req.reset_head();
            err = match handler.call(req.clone(), err).await {
                Ok(response) => match self.render(req, response).await {
                    Ok(outcome) => return outcome,
                    Err(e) => e,
                },
                Err(e) => e,
            };
        }

        if let Error::EarlyExit(response) = err {
            req.reset_head();
            return match self.render(req, *response).await {
                Ok(outcome) => outcome,
                Err(e) => self.unhandled(req, e),
            };
        }
        self.unhandled(req, err)
    }

    /// The default answer for an error nobody handled.
    fn unhandled(&self, req: &Request, err: Error) -> Outcome {
        let status = err.status();
        req.reset_head();
        req.set_status(status);

        if let Error::MethodNotAllowed(e) = &err {
            let allow = e.allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
            if let Err(e) = req.set_raw_headers("allow", allow) {
                warn!(error = %e, "could not set allow header");
            }
        }

        if !status.is_server_error() {
            debug!(status = status.as_u16(), error = %err, "client error");
            let body = status.canonical_reason().unwrap_or_default();
            return Outcome::Completed(req.finish(Some(TEXT_PLAIN), Bytes::from_static(body.as_bytes())));
        }

        error!(method = %req.method(), path = req.path(), error = %err, "request processing failed");
        let body = if self.display_tracebacks {
            error_chain(&err)
        } else {
            status.canonical_reason().unwrap_or_default().to_owned()
        };
        let response = req.finish(Some(TEXT_PLAIN), body.into());
        Outcome::Failed { response, error: err }
    }

    fn redirect_to(&self, req: &Request, path: &str) -> Outcome {
        let mut location = format!("{}{path}", script_prefix(&req.script_name()));
        if let Some(query) = req.uri().query() {
            location = format!("{location}?{query}");
        }
        if let Some(host) = req.host() {
            let scheme = if req.is_secure() { "https" } else { "http" };
            location = format!("{scheme}://{host}{location}");
        }
        debug!(from = req.path(), to = %location, "redirecting");

        req.set_status(StatusCode::PERMANENT_REDIRECT);
        if let Err(e) = req.set_raw_headers("location", location) {
            return self.unhandled(req, e);
        }
        Outcome::Completed(req.finish(None, Bytes::new()))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("rules", &self.rules.iter().map(|r| r.source.as_str()).collect::<Vec<_>>())
            .field("error_handlers", &(self.specific.len() + self.generic.len()))
            .finish()
    }
}

/// Percent-decodes the host, the consumed path and the remaining path.
/// Returns the decoded remaining segments, or every part that failed.
fn decode(req: &Request) -> Result<Vec<String>, UrlDecodeError> {
    let mut errors = Vec::new();

    // Raw bytes: a Host header that is not even visible ASCII must still be
    // reported, not read as absent.
    if let Some(Err(e)) = req
        .headers()
        .get(HOST)
        .map(|host| percent_decode(host.as_bytes()).decode_utf8())
    {
        errors.push((UrlPart::ServerName, e));
    }

    let mut segments = Vec::new();
    for raw in req.postpath() {
        match percent_decode_str(&raw).decode_utf8() {
            Ok(s) => segments.push(s.into_owned()),
            Err(e) => {
                // One entry per part is enough to reject the request.
                errors.push((UrlPart::PathInfo, e));
                break;
            }
        }
    }

    if let Some(e) = req
        .prepath()
        .iter()
        .find_map(|raw| percent_decode_str(raw).decode_utf8().err())
    {
        errors.push((UrlPart::ScriptName, e));
    }

    if !errors.is_empty() {
        return Err(UrlDecodeError { errors });
    }
    // The root path routes as a single empty segment, like `/`.
    if segments.is_empty() {
        segments.push(String::new());
    }
    Ok(segments)
}

fn script_prefix(script_name: &[String]) -> String {
    script_name
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| format!("/{s}"))
        .collect()
}

fn error_chain(err: &Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str("\ncaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
