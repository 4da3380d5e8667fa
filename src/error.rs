//! Unified error type.
//!
//! Everything that can stop a request on its way to a response is an
//! [`Error`]: routing misses, malformed URLs, missing components, handler
//! failures. The one variant that is *not* a failure is
//! [`Error::EarlyExit`], which a prepare hook or injector returns to replace
//! the handler's result outright.
//!
//! Error handlers registered on the [`Router`](crate::Router) select errors
//! by type. [`Error::find`] walks the wrapped error and its `source()` chain,
//! so a handler registered for `MyError` also claims an `Error::Handler`
//! wrapping `MyError`.

use std::error::Error as StdError;
use std::fmt;
use std::str::Utf8Error;

use http::{Method, StatusCode};

use crate::response::Response;

/// The error type returned by trellis's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Short-circuit the request: skip the remaining hooks, injectors and
    /// the handler, and answer with the carried response instead.
    #[error("request exited early")]
    EarlyExit(Box<Response>),

    #[error(transparent)]
    NotFound(#[from] NotFound),

    #[error(transparent)]
    MethodNotAllowed(#[from] MethodNotAllowed),

    #[error(transparent)]
    UrlDecode(#[from] UrlDecodeError),

    #[error("malformed host header `{0}`")]
    MalformedHost(String),

    #[error("no `{0}` component was provided for this request")]
    MissingComponent(&'static str),

    #[error("handler argument `{0}` is missing")]
    MissingArgument(String),

    #[error("handler argument `{name}` is not a `{expected}`")]
    ArgumentType { name: String, expected: &'static str },

    #[error("cannot build URL for `{endpoint}`: {reason}")]
    BuildUrl { endpoint: String, reason: String },

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("response metadata was already applied to this request")]
    MetadataApplied,

    /// A pending result was cancelled by something other than the client
    /// going away. Connection-loss cancellation never surfaces as an error.
    #[error("pending result was cancelled")]
    Cancelled,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// An application error raised by a hook, injector or handler.
    #[error("{0}")]
    Handler(Box<dyn StdError + Send + Sync + 'static>),
}

impl Error {
    /// Wraps an application error so it can travel through the pipeline.
    pub fn custom(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Handler(Box::new(err))
    }

    /// Builds the early-exit signal carrying `response`.
    pub fn early_exit(response: impl crate::IntoResponse) -> Self {
        Self::EarlyExit(Box::new(response.into_response()))
    }

    /// Returns the first error of type `E` in this error's chain.
    pub fn find<E: StdError + 'static>(&self) -> Option<&E> {
        let mut current = Some(self.inner());
        while let Some(err) = current {
            if let Some(found) = err.downcast_ref::<E>() {
                return Some(found);
            }
            current = err.source();
        }
        None
    }

    /// `true` when an error of type `E` appears in this error's chain.
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.find::<E>().is_some()
    }

    /// The status sent when no error handler claims this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::UrlDecode(_) | Self::MalformedHost(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn inner(&self) -> &(dyn StdError + 'static) {
        match self {
            Self::NotFound(e) => e,
            Self::MethodNotAllowed(e) => e,
            Self::UrlDecode(e) => e,
            Self::Io(e) => e,
            Self::Handler(e) => &**e,
            other => other,
        }
    }
}

/// No rule matched the request path.
#[derive(Debug, thiserror::Error)]
#[error("no route matches `{path}`")]
pub struct NotFound {
    pub path: String,
}

/// A rule matched the path but not the request method.
#[derive(Debug, thiserror::Error)]
#[error("method {method} is not allowed for `{path}`")]
pub struct MethodNotAllowed {
    pub method: Method,
    pub path: String,
    /// Every method some matching rule accepts, in registration order.
    pub allowed: Vec<Method>,
}

/// A part of the request URL that must decode to UTF-8 before routing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum UrlPart {
    ServerName,
    PathInfo,
    ScriptName,
}

impl UrlPart {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerName => "SERVER_NAME",
            Self::PathInfo => "PATH_INFO",
            Self::ScriptName => "SCRIPT_NAME",
        }
    }
}

impl fmt::Display for UrlPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One or more URL parts were not valid UTF-8 after percent-decoding.
///
/// Every failing part is listed, not only the first.
#[derive(Debug)]
pub struct UrlDecodeError {
    pub errors: Vec<(UrlPart, Utf8Error)>,
}

impl fmt::Display for UrlDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("non-UTF-8 encoding in URL")?;
        for (i, (part, err)) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            write!(f, "{sep}{part} ({err})")?;
        }
        Ok(())
    }
}

impl StdError for UrlDecodeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.errors
            .first()
            .map(|(_, e)| e as &(dyn StdError + 'static))
    }
}
