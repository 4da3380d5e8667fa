//! Built-in requirements for [`Required::inject`](crate::Required::inject).

use std::any::Any;
use std::marker::PhantomData;
use std::net::IpAddr;

use url::Url;

use crate::arguments::{Arguments, Value};
use crate::components::Components;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::lifecycle::Lifecycle;
use crate::request::Request;
use crate::requirer::{Injector, Requirement};

// ── RequestUrl ────────────────────────────────────────────────────────────────

/// Injects the absolute [`Url`] the client requested.
///
/// The host and port come from the `Host` header, or from the client's
/// address when the header is absent. The scheme is `https` on a secure
/// transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestUrl;

impl Requirement for RequestUrl {
    fn register_injector(self: Box<Self>, _: &mut Components, _: &str, _: &mut Lifecycle) -> Box<dyn Injector> {
        self
    }
}

impl Injector for RequestUrl {
    fn inject<'a>(&'a self, req: &'a Request, _: &'a Arguments) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move { url_from_request(req).map(|url| Box::new(url) as Value) })
    }
}

/// The absolute URL of `req`. See [`RequestUrl`].
pub fn url_from_request(req: &Request) -> Result<Url, Error> {
    let (host, port) = match req.host() {
        Some(sent) => split_host(sent)?,
        None => {
            let client = req
                .client()
                .ok_or_else(|| Error::MalformedHost("no Host header and no client address".into()))?;
            let host = match client.ip() {
                IpAddr::V4(ip) => ip.to_string(),
                IpAddr::V6(ip) => format!("[{ip}]"),
            };
            (host, Some(client.port()))
        }
    };

    let scheme = if req.is_secure() { "https" } else { "http" };
    let mut url = Url::parse(&format!("{scheme}://{host}/"))
        .map_err(|e| Error::MalformedHost(format!("{host}: {e}")))?;
    url.set_port(port)
        .map_err(|()| Error::MalformedHost(host.clone()))?;
    url.set_path(req.path());
    url.set_query(req.uri().query());
    Ok(url)
}

/// `example.com:8080` → (`example.com`, 8080). IPv6 hosts keep their brackets.
fn split_host(sent: &str) -> Result<(String, Option<u16>), Error> {
    let malformed = || Error::MalformedHost(sent.to_owned());

    let (host, port) = if sent.starts_with('[') {
        let end = sent.find(']').ok_or_else(malformed)?;
        let (host, rest) = sent.split_at(end + 1);
        match rest {
            "" => (host, None),
            _ => (host, Some(rest.strip_prefix(':').ok_or_else(malformed)?)),
        }
    } else {
        match sent.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (sent, None),
        }
    };

    let port = port
        .map(|p| p.parse::<u16>().map_err(|_| malformed()))
        .transpose()?;
    if host.is_empty() {
        return Err(malformed());
    }
    Ok((host.to_owned(), port))
}

// ── RequestComponent ──────────────────────────────────────────────────────────

/// Injects the request's component of type `T` as an `Arc<T>`, failing with
/// [`Error::MissingComponent`] when no hook provided one.
pub struct RequestComponent<T> {
    _component: PhantomData<fn() -> T>,
}

impl<T> RequestComponent<T> {
    pub fn new() -> Self {
        Self { _component: PhantomData }
    }
}

impl<T> Default for RequestComponent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Requirement for RequestComponent<T> {
    fn register_injector(self: Box<Self>, _: &mut Components, _: &str, _: &mut Lifecycle) -> Box<dyn Injector> {
        self
    }
}

impl<T: Send + Sync + 'static> Injector for RequestComponent<T> {
    fn inject<'a>(&'a self, req: &'a Request, _: &'a Arguments) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move { Ok(Box::new(req.component::<T>()?) as Value) })
    }
}

// ── from_fn ───────────────────────────────────────────────────────────────────

/// A requirement computed synchronously from the request and the route's
/// arguments.
///
/// ```rust
/// use trellis::{Arguments, Error, Request, inject};
///
/// let doubled = inject::from_fn(|_req: &Request, args: &Arguments| {
///     Ok::<_, Error>(args.get::<i64>("n")? * 2)
/// });
/// ```
pub fn from_fn<F, T>(f: F) -> FromFn<F, T>
where
    F: Fn(&Request, &Arguments) -> Result<T, Error> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    FromFn { f, _value: PhantomData }
}

pub struct FromFn<F, T> {
    f: F,
    _value: PhantomData<fn() -> T>,
}

impl<F, T> Requirement for FromFn<F, T>
where
    F: Fn(&Request, &Arguments) -> Result<T, Error> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    fn register_injector(self: Box<Self>, _: &mut Components, _: &str, _: &mut Lifecycle) -> Box<dyn Injector> {
        self
    }
}

impl<F, T> Injector for FromFn<F, T>
where
    F: Fn(&Request, &Arguments) -> Result<T, Error> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    fn inject<'a>(&'a self, req: &'a Request, args: &'a Arguments) -> BoxFuture<'a, Result<Value, Error>> {
        let value = (self.f)(req, args).map(|v| Box::new(v) as Value);
        Box::pin(std::future::ready(value))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    #[test]
    fn url_reflects_host_header_and_security() {
        let req = Request::builder()
            .uri("/foo/bar?x=1")
            .header("host", "example.com:8443")
            .secure(true)
            .build();
        assert_eq!(url_from_request(&req).unwrap().as_str(), "https://example.com:8443/foo/bar?x=1");

        let req = Request::builder().uri("/").header("host", "example.com").build();
        assert_eq!(url_from_request(&req).unwrap().as_str(), "http://example.com/");
    }

    #[test]
    fn url_falls_back_to_client_address() {
        let client: SocketAddr = "10.0.0.7:9000".parse().unwrap();
        let req = Request::builder().uri("/x").client(client).build();
        assert_eq!(url_from_request(&req).unwrap().as_str(), "http://10.0.0.7:9000/x");

        let client: SocketAddr = "[::1]:9000".parse().unwrap();
        let req = Request::builder().uri("/x").client(client).build();
        assert_eq!(url_from_request(&req).unwrap().as_str(), "http://[::1]:9000/x");
    }

    #[test]
    fn bracketed_ipv6_host_header() {
        let req = Request::builder().uri("/").header("host", "[::1]:8080").build();
        let url = url_from_request(&req).unwrap();
        assert_eq!(url.port(), Some(8080));
        assert_eq!(url.host_str(), Some("[::1]"));
    }

    #[test]
    fn bad_port_is_malformed_host() {
        let req = Request::builder().uri("/").header("host", "example.com:http").build();
        assert!(matches!(url_from_request(&req), Err(Error::MalformedHost(_))));

        let req = Request::builder().uri("/").header("host", "a:1:2").build();
        assert!(matches!(url_from_request(&req), Err(Error::MalformedHost(_))));
    }

    #[tokio::test]
    async fn component_injector_reads_request_components() {
        #[derive(Debug, PartialEq)]
        struct Tenant(&'static str);

        let injector = RequestComponent::<Tenant>::new();
        let req = Request::builder().uri("/").build();
        let missing = injector.inject(&req, &Arguments::new()).await;
        assert!(matches!(missing, Err(Error::MissingComponent(_))));

        req.set_component(Tenant("acme"));
        let value = injector.inject(&req, &Arguments::new()).await.unwrap();
        let tenant = value.downcast::<std::sync::Arc<Tenant>>().unwrap();
        assert_eq!(**tenant, Tenant("acme"));
    }
}
