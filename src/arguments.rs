//! Named handler arguments.
//!
//! Route placeholders and injectors both feed the same map. Placeholder
//! values arrive already converted (`<int:id>` is an `i64`), injected values
//! are whatever the injector produced, and an injected value replaces a
//! placeholder value of the same name.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;

use crate::error::Error;

/// A type-erased argument value.
pub type Value = Box<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Arguments {
    values: HashMap<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.values.insert(name.into(), Box::new(value));
    }

    pub fn insert_value(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Borrows argument `name` as a `T`.
    pub fn get<T: Any>(&self, name: &str) -> Result<&T, Error> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| Error::MissingArgument(name.to_owned()))?;
        value.downcast_ref::<T>().ok_or_else(|| Error::ArgumentType {
            name: name.to_owned(),
            expected: type_name::<T>(),
        })
    }

    /// Moves argument `name` out as a `T`. On a type mismatch the value stays.
    pub fn take<T: Any>(&mut self, name: &str) -> Result<T, Error> {
        let value = self
            .values
            .remove(name)
            .ok_or_else(|| Error::MissingArgument(name.to_owned()))?;
        match value.downcast::<T>() {
            Ok(v) => Ok(*v),
            Err(value) => {
                self.values.insert(name.to_owned(), value);
                Err(Error::ArgumentType { name: name.to_owned(), expected: type_name::<T>() })
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Moves every value of `other` into `self`, overriding equal names.
    pub fn extend(&mut self, other: Arguments) {
        self.values.extend(other.values);
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Arguments").field("names", &names).finish()
    }
}
