//! Response metadata, bodies and the [`IntoResponse`] conversion trait.
//!
//! A [`Response`] is metadata *about* a response: an optional status, some
//! headers, and a [`Body`] the dispatcher knows how to turn into bytes. It is
//! applied to the live [`Request`] exactly once, status first, then headers,
//! and the body is handed back for rendering.
//!
//! Handlers that only produce a body (a `&str`, some bytes, a nested router)
//! carry no metadata; whatever status they set on the request with
//! [`Request::set_status`] survives.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;

use crate::error::Error;
use crate::request::{Request, header_entry};
use crate::router::Router;

// ── HeaderValues ──────────────────────────────────────────────────────────────

/// One or more raw values for a single header name.
///
/// A lone string or byte string is a one-element list; vectors and arrays
/// keep every element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderValues(Vec<Bytes>);

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for HeaderValues {
    fn from(v: &str) -> Self { Self(vec![Bytes::copy_from_slice(v.as_bytes())]) }
}

impl From<String> for HeaderValues {
    fn from(v: String) -> Self { Self(vec![Bytes::from(v)]) }
}

impl From<&[u8]> for HeaderValues {
    fn from(v: &[u8]) -> Self { Self(vec![Bytes::copy_from_slice(v)]) }
}

impl From<Vec<u8>> for HeaderValues {
    fn from(v: Vec<u8>) -> Self { Self(vec![Bytes::from(v)]) }
}

impl From<Bytes> for HeaderValues {
    fn from(v: Bytes) -> Self { Self(vec![v]) }
}

impl From<Vec<&str>> for HeaderValues {
    fn from(v: Vec<&str>) -> Self {
        Self(v.into_iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect())
    }
}

impl From<Vec<String>> for HeaderValues {
    fn from(v: Vec<String>) -> Self {
        Self(v.into_iter().map(Bytes::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for HeaderValues {
    fn from(v: [&str; N]) -> Self {
        Self(v.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect())
    }
}

// ── Render ────────────────────────────────────────────────────────────────────

/// A body that produces its bytes at render time: templates, documents.
///
/// The templating engine lives outside trellis; implement this on whatever
/// it hands you.
pub trait Render: Send + Sync + 'static {
    fn content_type(&self) -> &'static str {
        "text/html; charset=utf-8"
    }

    fn render(&self, req: &Request) -> Result<Bytes, Error>;
}

// ── Body ──────────────────────────────────────────────────────────────────────

pub enum Body {
    Empty,
    Bytes(Bytes),
    /// Sent as `text/plain; charset=utf-8` unless a content type was set.
    Text(String),
    Render(Box<dyn Render>),
    /// A nested router that handles the request's remaining path segments.
    Resource(Arc<Router>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Self::Render(r) => f.debug_tuple("Render").field(&r.content_type()).finish(),
            Self::Resource(_) => f.write_str("Resource"),
        }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// Response metadata plus a body.
///
/// ```rust
/// use trellis::Response;
/// use http::StatusCode;
///
/// Response::text("hello");
/// Response::status(StatusCode::NO_CONTENT);
/// Response::builder()
///     .status(StatusCode::CREATED)
///     .header("location", "/users/42")
///     .header("set-cookie", ["a=1", "b=2"])
///     .json(br#"{"id":42}"#.to_vec());
/// ```
#[derive(Debug)]
pub struct Response {
    pub(crate) status: Option<StatusCode>,
    pub(crate) headers: Vec<(String, HeaderValues)>,
    pub(crate) body: Body,
}

impl Response {
    /// A body with no metadata attached.
    pub fn new(body: Body) -> Self {
        Self { status: None, headers: Vec::new(), body }
    }

    /// `application/json`.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::builder().json(body)
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Body::Text(body.into()))
    }

    /// Response with no body.
    pub fn status(code: StatusCode) -> Self {
        Self::builder().status(code).no_body()
    }

    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { status: None, headers: Vec::new() }
    }

    /// The status this response sets, `200 OK` if it sets none.
    pub fn code(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn headers(&self) -> &[(String, HeaderValues)] {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    fn has_metadata(&self) -> bool {
        self.status.is_some() || !self.headers.is_empty()
    }

    /// Sets status and headers on `req`, in that order, and returns the body.
    ///
    /// Metadata may reach a request once; a second metadata-bearing response
    /// is rejected with [`Error::MetadataApplied`]. Headers are validated
    /// before anything is written, so a bad header leaves the request
    /// untouched.
    pub fn apply_to(self, req: &Request) -> Result<Body, Error> {
        if self.has_metadata() {
            let headers = self
                .headers
                .into_iter()
                .map(|(name, values)| header_entry(&name, values))
                .collect::<Result<Vec<_>, _>>()?;
            req.commit_metadata(self.status, headers)?;
        }
        Ok(self.body)
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`]. Terminated by a body method.
pub struct ResponseBuilder {
    status: Option<StatusCode>,
    headers: Vec<(String, HeaderValues)>,
}

impl ResponseBuilder {
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = Some(code);
        self
    }

    /// Adds `values` for `name`. Applying replaces any values the request
    /// already holds for that name.
    pub fn header(mut self, name: &str, values: impl Into<HeaderValues>) -> Self {
        self.headers.push((name.to_owned(), values.into()));
        self
    }

    pub fn json(self, body: impl Into<Bytes>) -> Response {
        self.header("content-type", "application/json").bytes(body)
    }

    pub fn text(self, body: impl Into<String>) -> Response {
        self.body(Body::Text(body.into()))
    }

    pub fn bytes(self, body: impl Into<Bytes>) -> Response {
        self.body(Body::Bytes(body.into()))
    }

    pub fn render(self, renderable: impl Render) -> Response {
        self.body(Body::Render(Box::new(renderable)))
    }

    pub fn no_body(self) -> Response {
        self.body(Body::Empty)
    }

    pub fn body(self, body: Body) -> Response {
        Response { status: self.status, headers: self.headers, body }
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into a [`Response`].
///
/// Implement on your own types to return them directly from handlers.
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

impl IntoResponse for Body {
    fn into_response(self) -> Response { Response::new(self) }
}

impl IntoResponse for () {
    fn into_response(self) -> Response { Response::new(Body::Empty) }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for String {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for &'static [u8] {
    fn into_response(self) -> Response { Response::new(Body::Bytes(Bytes::from_static(self))) }
}

impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Response { Response::new(Body::Bytes(self.into())) }
}

impl IntoResponse for Bytes {
    fn into_response(self) -> Response { Response::new(Body::Bytes(self)) }
}

/// Return a status directly from a handler: `Ok(StatusCode::NO_CONTENT)`.
impl IntoResponse for StatusCode {
    fn into_response(self) -> Response { Response::status(self) }
}

/// A router returned from a branch route handles the remaining path.
impl IntoResponse for Router {
    fn into_response(self) -> Response { Response::new(Body::Resource(Arc::new(self))) }
}

impl IntoResponse for Arc<Router> {
    fn into_response(self) -> Response { Response::new(Body::Resource(self)) }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn single_values_are_singleton_lists() {
        assert_eq!(HeaderValues::from("a").len(), 1);
        assert_eq!(HeaderValues::from(b"raw".to_vec()).len(), 1);
        assert_eq!(HeaderValues::from(vec!["a", "b"]).len(), 2);
        assert_eq!(HeaderValues::from(["a", "b", "c"]).len(), 3);
    }

    #[test]
    fn apply_sets_status_then_headers_and_returns_body() {
        let req = Request::builder().uri("/").build();
        let body = Response::builder()
            .status(StatusCode::CREATED)
            .header("x-one", "1")
            .header("x-many", vec!["a", "b"])
            .text("made")
            .apply_to(&req)
            .unwrap();

        assert!(matches!(body, Body::Text(ref t) if t == "made"));
        assert_eq!(req.status(), StatusCode::CREATED);
        let headers = req.response_headers();
        assert_eq!(headers.get("x-one"), Some(&HeaderValue::from_static("1")));
        let many: Vec<_> = headers.get_all("x-many").iter().collect();
        assert_eq!(many, ["a", "b"]);
    }

    #[test]
    fn metadata_applies_once_per_request() {
        let req = Request::builder().uri("/").build();
        Response::status(StatusCode::ACCEPTED).apply_to(&req).unwrap();

        let second = Response::status(StatusCode::OK).apply_to(&req);
        assert!(matches!(second, Err(Error::MetadataApplied)));
        assert_eq!(req.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn bad_header_leaves_the_request_untouched() {
        let req = Request::builder().uri("/").build();
        let bad = Response::builder()
            .status(StatusCode::CREATED)
            .header("x-fine", "1")
            .header("x-broken", "line\nbreak")
            .text("never")
            .apply_to(&req);

        assert!(matches!(bad, Err(Error::InvalidHeader(_))));
        assert_eq!(req.status(), StatusCode::OK);
        assert!(req.response_headers().is_empty());

        Response::status(StatusCode::ACCEPTED).apply_to(&req).unwrap();
        assert_eq!(req.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn bare_bodies_leave_request_status_alone() {
        let req = Request::builder().uri("/").build();
        req.set_status(StatusCode::NOT_IMPLEMENTED);

        "".into_response().apply_to(&req).unwrap();
        "again".into_response().apply_to(&req).unwrap();
        assert_eq!(req.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
