//! Prepare hooks run before a dependency-injected handler.

use std::future::Future;
use std::sync::Arc;

use tracing::trace;

use crate::components::Capability;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::request::Request;

/// A step run once per request before injection.
///
/// Implemented for any `Fn(Request) -> impl Future<Output = Result<(), Error>>`.
/// Hooks usually put components on the request with
/// [`Request::set_component`]; returning [`Error::EarlyExit`] skips every
/// later hook and the handler.
pub trait Hook: Send + Sync + 'static {
    fn run(&self, req: Request) -> BoxFuture<'static, Result<(), Error>>;
}

impl<F, Fut> Hook for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn run(&self, req: Request) -> BoxFuture<'static, Result<(), Error>> {
        Box::pin((self)(req))
    }
}

#[derive(Clone)]
pub(crate) struct PrepareHook {
    pub(crate) hook: Arc<dyn Hook>,
    pub(crate) requires: Vec<Capability>,
    pub(crate) provides: Vec<Capability>,
}

/// The ordered prepare hooks of one route.
///
/// `requires` and `provides` are recorded for readers and introspection
/// only: hooks run in the order they were added.
#[derive(Clone, Default)]
pub struct Lifecycle {
    hooks: Vec<PrepareHook>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_prepare_hook(
        &mut self,
        hook: impl Hook,
        requires: Vec<Capability>,
        provides: Vec<Capability>,
    ) {
        self.push(PrepareHook { hook: Arc::new(hook), requires, provides });
    }

    pub(crate) fn push(&mut self, hook: PrepareHook) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Capabilities the hooks declare they provide, in hook order.
    pub fn provides(&self) -> impl Iterator<Item = Capability> + '_ {
        self.hooks.iter().flat_map(|h| h.provides.iter().copied())
    }

    pub fn requires(&self) -> impl Iterator<Item = Capability> + '_ {
        self.hooks.iter().flat_map(|h| h.requires.iter().copied())
    }

    /// Runs every hook in order, each to completion before the next.
    pub async fn run_prepare_hooks(&self, req: &Request) -> Result<(), Error> {
        for (i, prepare) in self.hooks.iter().enumerate() {
            trace!(hook = i, provides = ?prepare.provides, "running prepare hook");
            prepare.hook.run(req.clone()).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").field("hooks", &self.hooks.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::response::Response;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Hook {
        let log = Arc::clone(log);
        move |_req: Request| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                Ok::<_, Error>(())
            }
        }
    }

    #[tokio::test]
    async fn hooks_run_once_each_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        for name in ["a", "b", "c"] {
            lifecycle.add_prepare_hook(recorder(&log, name), vec![], vec![]);
        }

        lifecycle.run_prepare_hooks(&Request::builder().uri("/").build()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn early_exit_stops_later_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        lifecycle.add_prepare_hook(recorder(&log, "first"), vec![], vec![]);
        lifecycle.add_prepare_hook(
            |_req: Request| async { Err::<(), _>(Error::early_exit(Response::text("stop"))) },
            vec![],
            vec![],
        );
        lifecycle.add_prepare_hook(recorder(&log, "never"), vec![], vec![]);

        let result = lifecycle.run_prepare_hooks(&Request::builder().uri("/").build()).await;
        assert!(matches!(result, Err(Error::EarlyExit(_))));
        assert_eq!(*log.lock().unwrap(), ["first"]);
    }

    #[test]
    fn declared_capabilities_are_recorded() {
        struct Session;
        let mut lifecycle = Lifecycle::new();
        lifecycle.add_prepare_hook(
            |_req: Request| async { Ok::<_, Error>(()) },
            vec![],
            vec![Capability::of::<Session>()],
        );
        assert_eq!(lifecycle.provides().collect::<Vec<_>>(), [Capability::of::<Session>()]);
        assert_eq!(lifecycle.requires().count(), 0);
    }
}
