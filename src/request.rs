//! Incoming HTTP request type.
//!
//! A [`Request`] is a cheap, cloneable handle: prepare hooks, injectors, the
//! handler and error handlers all receive a clone of the same request and
//! see each other's writes to its component store and response head.
//! Nothing in it outlives the request.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::header::{HOST, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::sync::watch;

use crate::components::Components;
use crate::error::Error;
use crate::response::HeaderValues;
use crate::router::Router;

// ── Connection ────────────────────────────────────────────────────────────────

/// The transport side of a request: tells in-flight requests the client has
/// gone away.
///
/// The server keeps one per in-flight request and marks it lost when the
/// client goes away. Tests create one to simulate a client disconnecting
/// mid-request.
#[derive(Debug)]
pub struct Connection {
    lost: watch::Sender<bool>,
}

impl Connection {
    pub fn new() -> Self {
        Self { lost: watch::channel(false).0 }
    }

    /// Marks the connection lost. Pending handlers on it are cancelled.
    pub fn lose(&self) {
        self.lost.send_replace(true);
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.lost.subscribe()
    }
}

impl Default for Connection {
    fn default() -> Self { Self::new() }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// An incoming HTTP request plus the per-request state trellis tracks.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

struct Inner {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    client: Option<SocketAddr>,
    secure: bool,
    lost: watch::Receiver<bool>,
    routing: Mutex<Routing>,
    components: Mutex<Components>,
    head: Mutex<ResponseHead>,
}

/// Path bookkeeping: segments consumed by routers so far vs. still to route.
#[derive(Clone, Default)]
struct Routing {
    prepath: Vec<String>,
    postpath: Vec<String>,
    branch_segments: Vec<String>,
    /// `prepath` as it stood when the current router took over.
    script_name: Vec<String>,
    router: Option<Arc<Router>>,
}

#[derive(Default)]
struct ResponseHead {
    status: Option<StatusCode>,
    headers: HeaderMap,
    metadata_applied: bool,
}

impl ResponseHead {
    fn replace(&mut self, name: HeaderName, values: Vec<HeaderValue>) {
        self.headers.remove(&name);
        for value in values {
            self.headers.append(name.clone(), value);
        }
    }
}

/// Validates one header name and its values.
pub(crate) fn header_entry(name: &str, values: HeaderValues) -> Result<(HeaderName, Vec<HeaderValue>), Error> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::InvalidHeader(format!("bad header name `{name}`")))?;
    let values = values
        .iter()
        .map(|v| {
            HeaderValue::from_maybe_shared(v.clone())
                .map_err(|_| Error::InvalidHeader(format!("bad value for `{name}`")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((name, values))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Wraps a request received from hyper.
    pub(crate) fn from_http(
        req: http::Request<Bytes>,
        client: SocketAddr,
        secure: bool,
        connection: &Connection,
    ) -> Self {
        let (parts, body) = req.into_parts();
        Self::assemble(
            parts.method,
            parts.uri,
            parts.version,
            parts.headers,
            body,
            Some(client),
            secure,
            connection.subscribe(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
        client: Option<SocketAddr>,
        secure: bool,
        lost: watch::Receiver<bool>,
    ) -> Self {
        let postpath = split_path(uri.path());
        Self {
            inner: Arc::new(Inner {
                method,
                uri,
                version,
                headers,
                body,
                client,
                secure,
                lost,
                routing: Mutex::new(Routing { postpath, ..Routing::default() }),
                components: Mutex::new(Components::new()),
                head: Mutex::new(ResponseHead::default()),
            }),
        }
    }

    pub fn method(&self) -> &Method { &self.inner.method }
    pub fn uri(&self) -> &Uri { &self.inner.uri }
    pub fn path(&self) -> &str { self.inner.uri.path() }
    pub fn version(&self) -> Version { self.inner.version }
    pub fn headers(&self) -> &HeaderMap { &self.inner.headers }
    pub fn body(&self) -> &Bytes { &self.inner.body }

    /// Address and port of the connecting client, when known.
    pub fn client(&self) -> Option<SocketAddr> { self.inner.client }

    /// `true` when the transport reports a secure connection.
    pub fn is_secure(&self) -> bool { self.inner.secure }

    /// Case-insensitive header lookup. Values that are not visible ASCII
    /// read as absent; use [`Request::headers`] for raw bytes.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.inner.headers.get(HOST).and_then(|v| v.to_str().ok())
    }

    // ── Path bookkeeping ──────────────────────────────────────────────────────

    /// Raw path segments already consumed by the routers above this one.
    pub fn prepath(&self) -> Vec<String> {
        lock(&self.inner.routing).prepath.clone()
    }

    /// Raw path segments not yet consumed.
    pub fn postpath(&self) -> Vec<String> {
        lock(&self.inner.routing).postpath.clone()
    }

    /// Segments below the matched prefix of a branch route; empty otherwise.
    pub fn branch_segments(&self) -> Vec<String> {
        lock(&self.inner.routing).branch_segments.clone()
    }

    /// Hands the request to `router`; everything consumed so far becomes
    /// its script name.
    pub(crate) fn bind_router(&self, router: Arc<Router>) {
        let mut routing = lock(&self.inner.routing);
        routing.script_name = routing.prepath.clone();
        routing.branch_segments.clear();
        routing.router = Some(router);
    }

    pub(crate) fn script_name(&self) -> Vec<String> {
        lock(&self.inner.routing).script_name.clone()
    }

    pub(crate) fn bound_router(&self) -> Option<Arc<Router>> {
        lock(&self.inner.routing).router.clone()
    }

    /// Moves the first `count` remaining segments to the consumed list.
    pub(crate) fn consume_segments(&self, count: usize) {
        let mut routing = lock(&self.inner.routing);
        let count = count.min(routing.postpath.len());
        let consumed: Vec<String> = routing.postpath.drain(..count).collect();
        routing.prepath.extend(consumed);
    }

    pub(crate) fn set_branch_segments(&self, segments: Vec<String>) {
        lock(&self.inner.routing).branch_segments = segments;
    }

    // ── Components ────────────────────────────────────────────────────────────

    /// Provides `value` for capability `T` for the rest of this request.
    pub fn set_component<T: Send + Sync + 'static>(&self, value: T) {
        lock(&self.inner.components).set(value);
    }

    /// Fetches the instance a prepare hook provided for capability `T`.
    pub fn component<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, Error> {
        lock(&self.inner.components)
            .get::<T>()
            .ok_or(Error::MissingComponent(std::any::type_name::<T>()))
    }

    pub fn with_components<R>(&self, f: impl FnOnce(&mut Components) -> R) -> R {
        f(&mut lock(&self.inner.components))
    }

    // ── Response head ─────────────────────────────────────────────────────────

    pub fn set_status(&self, code: StatusCode) {
        lock(&self.inner.head).status = Some(code);
    }

    /// The status that will be sent; `200 OK` until something sets one.
    pub fn status(&self) -> StatusCode {
        lock(&self.inner.head).status.unwrap_or(StatusCode::OK)
    }

    /// Replaces every response value of header `name` with `values`.
    pub fn set_raw_headers(&self, name: &str, values: impl Into<HeaderValues>) -> Result<(), Error> {
        let (name, values) = header_entry(name, values.into())?;
        lock(&self.inner.head).replace(name, values);
        Ok(())
    }

    pub fn response_headers(&self) -> HeaderMap {
        lock(&self.inner.head).headers.clone()
    }

    /// Applies a response's status and already-validated headers in one
    /// step. Fails without touching the head if metadata was applied before.
    pub(crate) fn commit_metadata(
        &self,
        status: Option<StatusCode>,
        headers: Vec<(HeaderName, Vec<HeaderValue>)>,
    ) -> Result<(), Error> {
        let mut head = lock(&self.inner.head);
        if head.metadata_applied {
            return Err(Error::MetadataApplied);
        }
        head.metadata_applied = true;
        if let Some(code) = status {
            head.status = Some(code);
        }
        for (name, values) in headers {
            head.replace(name, values);
        }
        Ok(())
    }

    /// Forgets the status, headers and metadata guard of a response that
    /// failed, so an error handler answers on a clean slate.
    pub(crate) fn reset_head(&self) {
        *lock(&self.inner.head) = ResponseHead::default();
    }

    /// Assembles the outgoing response from the head and a rendered body.
    pub(crate) fn finish(&self, content_type: Option<&'static str>, body: Bytes) -> http::Response<Bytes> {
        let head = lock(&self.inner.head);
        let mut response = http::Response::new(body);
        *response.status_mut() = head.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = head.headers.clone();
        if let Some(ct) = content_type {
            response
                .headers_mut()
                .entry(http::header::CONTENT_TYPE)
                .or_insert(HeaderValue::from_static(ct));
        }
        response
    }

    // ── Connection ────────────────────────────────────────────────────────────

    /// Resolves once the client connection is lost; never, if it is not.
    pub async fn connection_lost(&self) {
        let mut lost = self.inner.lost.clone();
        if lost.wait_for(|lost| *lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        *self.inner.lost.borrow()
    }

    // ── URL building ──────────────────────────────────────────────────────────

    /// Builds a URL for `endpoint` on the router dispatching this request.
    ///
    /// ```rust,no_run
    /// # fn f(req: trellis::Request) -> Result<(), trellis::Error> {
    /// let relative = req.url_for("user").param("id", 42).build()?;
    /// let absolute = req.url_for("user").param("id", 42).external().build()?;
    /// # Ok(()) }
    /// ```
    pub fn url_for(&self, endpoint: &str) -> UrlFor<'_> {
        UrlFor {
            req: self,
            endpoint: endpoint.to_owned(),
            values: Vec::new(),
            method: None,
            external: false,
        }
    }
}

/// Splits a raw path into segments: `/` → `[""]`, `/a/b/` → `["a", "b", ""]`.
pub(crate) fn split_path(path: &str) -> Vec<String> {
    path.strip_prefix('/').unwrap_or(path).split('/').map(str::to_owned).collect()
}

// ── UrlFor ────────────────────────────────────────────────────────────────────

/// Builder returned by [`Request::url_for`].
pub struct UrlFor<'r> {
    req: &'r Request,
    endpoint: String,
    values: Vec<(String, String)>,
    method: Option<Method>,
    external: bool,
}

impl UrlFor<'_> {
    /// Fills placeholder `name`. Values no placeholder uses become query
    /// parameters.
    pub fn param(mut self, name: &str, value: impl ToString) -> Self {
        self.values.push((name.to_owned(), value.to_string()));
        self
    }

    /// Only consider rules that accept `method`.
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Produce `scheme://host/path` instead of a path. Needs a `Host` header.
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    pub fn build(self) -> Result<String, Error> {
        let router = self.req.bound_router().ok_or_else(|| Error::BuildUrl {
            endpoint: self.endpoint.clone(),
            reason: "request is not being dispatched by a router".into(),
        })?;
        let script_name = self.req.script_name();
        let path = router.build_url(&self.endpoint, &self.values, self.method.as_ref(), &script_name)?;

        if !self.external {
            return Ok(path);
        }
        let host = self.req.host().ok_or_else(|| Error::BuildUrl {
            endpoint: self.endpoint.clone(),
            reason: "cannot build an external URL without a Host header".into(),
        })?;
        let scheme = if self.req.is_secure() { "https" } else { "http" };
        Ok(format!("{scheme}://{host}{path}"))
    }
}

// ── RequestBuilder ────────────────────────────────────────────────────────────

/// Builds a [`Request`] in memory, for tests and for embedding trellis
/// behind another server.
///
/// ```rust
/// use trellis::Request;
///
/// let req = Request::builder()
///     .method(http::Method::POST)
///     .uri("/users?draft=1")
///     .header("host", "localhost:8080")
///     .body("{}")
///     .build();
/// assert_eq!(req.path(), "/users");
/// ```
pub struct RequestBuilder {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    client: Option<SocketAddr>,
    secure: bool,
    lost: Option<watch::Receiver<bool>>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::from_static("/"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client: None,
            secure: false,
            lost: None,
        }
    }
}

impl RequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// # Panics
    ///
    /// Panics if `uri` is not a valid request target.
    pub fn uri(mut self, uri: &str) -> Self {
        self.uri = Uri::from_str(uri).unwrap_or_else(|e| panic!("invalid uri `{uri}`: {e}"));
        self
    }

    /// # Panics
    ///
    /// Panics if `name` or `value` is not a valid header name or value.
    pub fn header(self, name: &str, value: &str) -> Self {
        self.raw_header(name, value.as_bytes())
    }

    /// Like [`header`](Self::header), for values that are not text.
    ///
    /// # Panics
    ///
    /// Panics if `name` or `value` is not a valid header name or value.
    pub fn raw_header(mut self, name: &str, value: &[u8]) -> Self {
        let header = HeaderName::from_bytes(name.as_bytes())
            .unwrap_or_else(|e| panic!("invalid header name `{name}`: {e}"));
        let value = HeaderValue::from_bytes(value)
            .unwrap_or_else(|e| panic!("invalid value for header `{name}`: {e}"));
        self.headers.append(header, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn client(mut self, addr: SocketAddr) -> Self {
        self.client = Some(addr);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Ties the request to `connection`, so [`Connection::lose`] cancels it.
    pub fn connection(mut self, connection: &Connection) -> Self {
        self.lost = Some(connection.subscribe());
        self
    }

    pub fn build(self) -> Request {
        // With no connection attached the sender is dropped right away and
        // `connection_lost` never resolves.
        let lost = self.lost.unwrap_or_else(|| Connection::new().subscribe());
        Request::assemble(
            self.method,
            self.uri,
            self.version,
            self.headers,
            self.body,
            self.client,
            self.secure,
            lost,
        )
    }
}
