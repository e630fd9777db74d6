//! Error taxonomy shared by every primitive.
//!
//! Errors fall into three groups:
//! - **Policy denials** ([`GuardError`] variants other than `Inner`): normal
//!   signals an embedder routes to fallback logic.
//! - **Programming errors** ([`ConfigError`]): invalid or missing
//!   configuration, raised eagerly and unrecoverable.
//! - **User errors** (`GuardError::Inner`): the wrapped call's own error,
//!   observed and classified by the primitives but never swallowed.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Predicate over a wrapped operation's error, used by circuit breaker and
/// retry classification. Lists of error types become predicates here; a
/// predicate can inspect the concrete type through downcasting or match on
/// the rendered message.
pub type ErrorPredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Error returned by guarded calls and permission requests.
///
/// The type parameter is the wrapped operation's error type. Permission
/// methods that never run user code use the [`Infallible`] default, and
/// [`GuardError::widen`] lifts such a denial into any decorator error type.
#[derive(Debug, Error)]
pub enum GuardError<E = Infallible>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The circuit breaker does not permit the call.
    #[error("circuit breaker '{name}' does not permit the call")]
    CallNotPermitted { name: String },

    /// The bulkhead is saturated and the wait (if any) timed out.
    #[error("bulkhead '{name}' is full")]
    BulkheadFull { name: String },

    /// The rate limiter could not grant a permit within its timeout.
    #[error("rate limiter '{name}' did not permit the request")]
    RequestNotPermitted { name: String },

    /// The time limiter elapsed before the wrapped future completed.
    #[error("operation did not complete within {timeout:?}")]
    Timeout { timeout: Duration },

    /// The retry budget is exhausted. Carries the last user error when the
    /// exhaustion came from the error path.
    #[error("retry budget exhausted after {attempts} attempts")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Option<E>,
    },

    /// The wrapped operation failed; re-raised unchanged after recording.
    #[error("guarded operation failed")]
    Inner {
        #[source]
        source: E,
    },
}

impl GuardError<Infallible> {
    /// Lifts a denial into a decorator's error type.
    pub fn widen<E>(self) -> GuardError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self {
            GuardError::CallNotPermitted { name } => GuardError::CallNotPermitted { name },
            GuardError::BulkheadFull { name } => GuardError::BulkheadFull { name },
            GuardError::RequestNotPermitted { name } => GuardError::RequestNotPermitted { name },
            GuardError::Timeout { timeout } => GuardError::Timeout { timeout },
            GuardError::MaxRetriesExceeded { attempts, source } => match source {
                None => GuardError::MaxRetriesExceeded { attempts, source: None },
                Some(never) => match never {},
            },
            GuardError::Inner { source } => match source {},
        }
    }
}

impl<E> GuardError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// True when the error is a policy denial rather than a failure of the
    /// wrapped operation.
    pub fn is_denial(&self) -> bool {
        !matches!(self, GuardError::Inner { .. })
    }

    /// Returns the wrapped operation's error, if this is one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Inner { source } => Some(source),
            GuardError::MaxRetriesExceeded { source, .. } => source,
            _ => None,
        }
    }
}

/// Configuration errors raised at build or lookup time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config value or combination of values is invalid.
    #[error("invalid configuration: {message}")]
    Invalid { message: String },

    /// A named shared configuration was referenced but never registered.
    #[error("configuration '{name}' not found")]
    NotFound { name: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid { message: message.into() }
    }

    pub(crate) fn not_found(name: impl Into<String>) -> Self {
        ConfigError::NotFound { name: name.into() }
    }
}
