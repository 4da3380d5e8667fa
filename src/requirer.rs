//! Dependency injection for named handler arguments.
//!
//! A [`Requirer`] collects prerequisites (prepare hooks shared by every route
//! it wraps). [`Requirer::require`] wraps a handler and declares, argument by
//! argument, how each value is obtained:
//!
//! ```rust
//! use trellis::{Arguments, Error, Request, Requirer, Router, inject};
//!
//! struct Session(String);
//!
//! async fn load_session(req: Request) -> Result<(), Error> {
//!     req.set_component(Session("guest".into()));
//!     Ok(())
//! }
//!
//! async fn whoami(_req: Request, args: Arguments) -> Result<String, Error> {
//!     let session = args.get::<std::sync::Arc<Session>>("session")?;
//!     Ok(session.0.clone())
//! }
//!
//! let requirer = Requirer::new().prerequisite(vec![], vec![], load_session);
//! let app = Router::new().route(
//!     "/whoami",
//!     requirer.require(whoami).inject("session", inject::RequestComponent::<Session>::new()),
//! );
//! ```
//!
//! Registration happens when the wrapped handler is added to a router: each
//! [`Requirement`] registers its [`Injector`] (and any hooks of its own),
//! the requirer's prerequisites are appended, and every injector is
//! finalized. Per request, hooks run in order, then injectors run in
//! declaration order, and their values replace route values of the same name.

use std::sync::Arc;

use tracing::debug;

use crate::arguments::{Arguments, Value};
use crate::components::{Capability, Components};
use crate::error::Error;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler, private};
use crate::lifecycle::{Hook, Lifecycle, PrepareHook};
use crate::request::Request;
use crate::response::Response;

/// Produces one argument value per request.
pub trait Injector: Send + Sync + 'static {
    fn inject<'a>(&'a self, req: &'a Request, args: &'a Arguments) -> BoxFuture<'a, Result<Value, Error>>;

    /// Called once, after every injector of the route has been registered.
    fn finalize(&mut self) {}
}

/// A declared dependency. Turned into an [`Injector`] once, when the route
/// is registered.
pub trait Requirement: Send + Sync + 'static {
    fn register_injector(
        self: Box<Self>,
        components: &mut Components,
        name: &str,
        lifecycle: &mut Lifecycle,
    ) -> Box<dyn Injector>;
}

/// Shared prerequisites for the routes it wraps.
#[derive(Clone, Default)]
pub struct Requirer {
    prerequisites: Vec<PrepareHook>,
}

impl Requirer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hook run before every handler wrapped by this requirer.
    /// Hooks run in the order added; `requires` is not used for ordering.
    pub fn prerequisite(
        mut self,
        provides: Vec<Capability>,
        requires: Vec<Capability>,
        hook: impl Hook,
    ) -> Self {
        self.prerequisites.push(PrepareHook { hook: Arc::new(hook), requires, provides });
        self
    }

    pub fn require(&self, handler: impl Handler) -> Required {
        Required {
            handler: handler.into_boxed_handler(),
            prerequisites: self.prerequisites.clone(),
            requirements: Vec::new(),
        }
    }
}

/// A handler with declared dependencies, not yet registered.
pub struct Required {
    handler: BoxedHandler,
    prerequisites: Vec<PrepareHook>,
    requirements: Vec<(String, Box<dyn Requirement>)>,
}

impl Required {
    /// Declares that argument `name` comes from `requirement`.
    pub fn inject(mut self, name: &str, requirement: impl Requirement) -> Self {
        self.requirements.push((name.to_owned(), Box::new(requirement)));
        self
    }

    /// Registers every requirement now. Routers do this on `add`; call it
    /// yourself to inspect the result first.
    pub fn build(self) -> Injected {
        let mut components = Components::new();
        let mut lifecycle = Lifecycle::new();

        let mut injectors: Vec<(String, Box<dyn Injector>)> = self
            .requirements
            .into_iter()
            .map(|(name, requirement)| {
                let injector = requirement.register_injector(&mut components, &name, &mut lifecycle);
                (name, injector)
            })
            .collect();

        for prerequisite in self.prerequisites {
            lifecycle.push(prerequisite);
        }
        for (_, injector) in &mut injectors {
            injector.finalize();
        }

        let lifecycle = Arc::new(lifecycle);
        components.set_shared(Arc::clone(&lifecycle));

        Injected {
            inner: Arc::new(InjectedInner { handler: self.handler, lifecycle, injectors, components }),
        }
    }
}

/// A handler whose dependencies are registered.
#[derive(Clone)]
pub struct Injected {
    inner: Arc<InjectedInner>,
}

struct InjectedInner {
    handler: BoxedHandler,
    lifecycle: Arc<Lifecycle>,
    injectors: Vec<(String, Box<dyn Injector>)>,
    components: Components,
}

impl Injected {
    /// Components populated while registering; includes the route's
    /// [`Lifecycle`].
    pub fn injection_components(&self) -> &Components {
        &self.inner.components
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.inner.injectors.iter().map(|(name, _)| name.as_str())
    }
}

impl InjectedInner {
    async fn run(&self, req: Request, route_args: Arguments) -> Result<Response, Error> {
        let injected = match self.prepare(&req, &route_args).await {
            Ok(injected) => injected,
            Err(Error::EarlyExit(response)) => {
                debug!(path = req.path(), "early exit before handler");
                return Ok(*response);
            }
            Err(e) => return Err(e),
        };

        let mut args = route_args;
        args.extend(injected);
        self.handler.call(req, args).await
    }

    async fn prepare(&self, req: &Request, route_args: &Arguments) -> Result<Arguments, Error> {
        self.lifecycle.run_prepare_hooks(req).await?;

        let mut injected = Arguments::new();
        for (name, injector) in &self.injectors {
            let value = injector.inject(req, route_args).await?;
            injected.insert_value(name.as_str(), value);
        }
        Ok(injected)
    }
}

impl ErasedHandler for Injected {
    fn call(&self, req: Request, args: Arguments) -> BoxFuture<'static, Result<Response, Error>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.run(req, args).await })
    }
}

impl private::Sealed for Required {}
impl private::Sealed for Injected {}

impl Handler for Required {
    fn into_boxed_handler(self) -> BoxedHandler {
        self.build().into_boxed_handler()
    }
}

impl Handler for Injected {
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::StatusCode;

    use super::*;
    use crate::response::Body;

    struct Counter(Arc<AtomicUsize>);

    struct CountingInjector {
        finalized: Arc<AtomicUsize>,
    }

    impl Injector for CountingInjector {
        fn inject<'a>(&'a self, _req: &'a Request, args: &'a Arguments) -> BoxFuture<'a, Result<Value, Error>> {
            Box::pin(async move {
                let bar = *args.get::<i64>("bar")?;
                Ok(Box::new(bar + 1) as Value)
            })
        }

        fn finalize(&mut self) {
            self.finalized.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Requirement for Counter {
        fn register_injector(
            self: Box<Self>,
            _components: &mut Components,
            _name: &str,
            _lifecycle: &mut Lifecycle,
        ) -> Box<dyn Injector> {
            Box::new(CountingInjector { finalized: self.0 })
        }
    }

    async fn echo_bar(_req: Request, args: Arguments) -> Result<String, Error> {
        Ok(args.get::<i64>("bar")?.to_string())
    }

    fn text(response: &Response) -> &str {
        match response.body() {
            Body::Text(t) => t,
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_values_override_route_values() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let injected = Requirer::new()
            .require(echo_bar)
            .inject("bar", Counter(Arc::clone(&finalized)))
            .build();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        let mut args = Arguments::new();
        args.insert("bar", 1_i64);
        let response = injected.call(Request::builder().uri("/foo/1").build(), args).await.unwrap();
        assert_eq!(text(&response), "2");

        injected.call(Request::builder().uri("/foo/1").build(), {
            let mut a = Arguments::new();
            a.insert("bar", 5_i64);
            a
        }).await.unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prerequisites_run_before_injectors_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hook = |name: &'static str| {
            let log = Arc::clone(&log);
            move |_req: Request| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(name);
                    Ok::<_, Error>(())
                }
            }
        };
        let requirer = Requirer::new()
            .prerequisite(vec![], vec![], hook("one"))
            .prerequisite(vec![], vec![], hook("two"));

        let injected = requirer.require(echo_bar).build();
        assert_eq!(injected.lifecycle().len(), 2);
        assert!(injected.injection_components().get::<Lifecycle>().is_some());

        let mut args = Arguments::new();
        args.insert("bar", 1_i64);
        injected.call(Request::builder().uri("/").build(), args).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["one", "two"]);
    }

    #[tokio::test]
    async fn early_exit_skips_the_handler() {
        let called = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&called);
        let handler = move |_req: Request, _args: Arguments| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>("handled")
            }
        };

        let injected = Requirer::new()
            .prerequisite(vec![], vec![], |_req: Request| async {
                Err::<(), _>(Error::early_exit(Response::builder().status(StatusCode::FORBIDDEN).text("no")))
            })
            .require(handler)
            .build();

        let response = injected.call(Request::builder().uri("/").build(), Arguments::new()).await.unwrap();
        assert_eq!(response.code(), StatusCode::FORBIDDEN);
        assert_eq!(text(&response), "no");
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn injector_failures_propagate() {
        let injected = Requirer::new().require(echo_bar).inject("bar", Counter(Arc::default())).build();
        let result = injected.call(Request::builder().uri("/").build(), Arguments::new()).await;
        assert!(matches!(result, Err(Error::MissingArgument(name)) if name == "bar"));
    }
}
