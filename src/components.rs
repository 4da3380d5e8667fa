//! Per-request component storage keyed by capability.
//!
//! A capability is a Rust type. Prepare hooks put an instance of the type
//! into the request's [`Components`]; injectors and handlers fetch it back
//! by the same type. Lookups of a capability nobody provided return `None`
//! rather than a default, so a missing hook is visible at the call site.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identity of a component type, used for lookups and for the informational
/// `requires` / `provides` lists of prepare hooks.
#[derive(Clone, Copy, Eq)]
pub struct Capability {
    id: TypeId,
    name: &'static str,
}

impl Capability {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self { id: TypeId::of::<T>(), name: type_name::<T>() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::hash::Hash for Capability {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

type Instance = Arc<dyn Any + Send + Sync>;

/// A capability → instance map.
///
/// Used twice: once per request (filled by prepare hooks) and once per
/// dependency-injected route at registration time.
#[derive(Clone, Default)]
pub struct Components {
    instances: HashMap<TypeId, (Capability, Instance)>,
}

impl Components {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provides `value` for capability `T`, replacing any earlier instance.
    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        self.set_shared(Arc::new(value));
    }

    pub fn set_shared<T: Any + Send + Sync>(&mut self, value: Arc<T>) {
        let instance: Instance = value;
        self.instances.insert(TypeId::of::<T>(), (Capability::of::<T>(), instance));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let (_, instance) = self.instances.get(&TypeId::of::<T>())?;
        Arc::clone(instance).downcast::<T>().ok()
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        let (_, instance) = self.instances.remove(&TypeId::of::<T>())?;
        instance.downcast::<T>().ok()
    }

    pub fn provides(&self, capability: Capability) -> bool {
        self.instances.contains_key(&capability.id)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.instances.values().map(|(cap, _)| *cap)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl fmt::Debug for Components {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.capabilities()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Session(u32);

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[test]
    fn lookup_is_by_type() {
        let mut components = Components::new();
        components.set(Session(7));

        assert_eq!(*components.get::<Session>().unwrap(), Session(7));
        assert!(components.get::<Tenant>().is_none());
        assert!(components.provides(Capability::of::<Session>()));
        assert!(!components.provides(Capability::of::<Tenant>()));
    }

    #[test]
    fn set_replaces_previous_instance() {
        let mut components = Components::new();
        components.set(Tenant("a"));
        components.set(Tenant("b"));

        assert_eq!(components.len(), 1);
        assert_eq!(*components.remove::<Tenant>().unwrap(), Tenant("b"));
        assert!(components.is_empty());
    }

    #[test]
    fn capability_names_the_type() {
        assert!(Capability::of::<Session>().name().ends_with("Session"));
        assert_eq!(Capability::of::<Session>(), Capability::of::<Session>());
        assert_ne!(Capability::of::<Session>(), Capability::of::<Tenant>());
    }
}
