// error.rs
use std::{error::Error, fmt};

/// Failure categories reported by managed-thread operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// The requested effect is already in place; nothing was done.
    #[error("state already effective")]
    AlreadyEffective,
    /// The thread was never started.
    #[error("thread not initialized")]
    NotInitialized,
    #[error("invalid argument")]
    InvalidArgument,
    /// Exiting is in progress; the request was denied.
    #[error("thread is shutting down")]
    ShuttingDown,
    /// The thread has already exited.
    #[error("resource unavailable")]
    ResourceUnavailable,
    #[error("operation timed out")]
    TimedOut,
    /// A blocking wait on the caller's own thread was refused.
    #[error("deadlock averted")]
    DeadlockAverted,
    /// A sleep or blocking request was cut short by the state machinery.
    #[error("operation interrupted")]
    InterruptedOperation,
    /// The operation was invoked from the wrong thread.
    #[error("operation not permitted from this thread")]
    ThreadRestriction,
    #[error("not registered")]
    NotRegistered,
    /// A thread body or tick handler reported failure.
    #[error("operation failed")]
    Failed,
}

/// Typed failure with an optional, context-chained message.
///
/// Context is prepended while the error travels upward, so the rendered
/// message reads outermost-first: `"outer: inner: kind"`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ThreadError {
    kind: ErrorKind,
    message: Option<String>,
}

pub type ThreadResult<T> = Result<T, ThreadError>;

impl ThreadError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn already_effective(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::AlreadyEffective, message)
    }

    pub fn not_initialized() -> Self {
        Self::with_message(ErrorKind::NotInitialized, "thread has not been started")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InvalidArgument, message)
    }

    pub fn shutting_down(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::ShuttingDown, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::ResourceUnavailable, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::TimedOut, message)
    }

    pub fn deadlock_averted(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::DeadlockAverted, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InterruptedOperation, message)
    }

    pub fn restricted(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::ThreadRestriction, message)
    }

    pub fn not_registered(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::NotRegistered, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::Failed, message)
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[inline]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Prepends `context` to the message chain.
    pub fn prepend(mut self, context: impl AsRef<str>) -> Self {
        let context = context.as_ref();
        self.message = Some(match self.message.take() {
            Some(inner) => format!("{context}: {inner}"),
            None => context.to_string(),
        });
        self
    }
}

impl From<ErrorKind> for ThreadError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{msg}: {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl Error for ThreadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.kind)
    }
}

/// Context chaining for [`ThreadResult`].
pub trait ResultExt<T> {
    fn prepend(self, context: impl AsRef<str>) -> ThreadResult<T>;

    fn prepend_with<C: AsRef<str>>(self, f: impl FnOnce() -> C) -> ThreadResult<T>;
}

impl<T> ResultExt<T> for ThreadResult<T> {
    #[inline]
    fn prepend(self, context: impl AsRef<str>) -> ThreadResult<T> {
        self.map_err(|e| e.prepend(context))
    }

    #[inline]
    fn prepend_with<C: AsRef<str>>(self, f: impl FnOnce() -> C) -> ThreadResult<T> {
        self.map_err(|e| e.prepend(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_chains_outermost_first() {
        let err = ThreadError::timed_out("waiting for state")
            .prepend("request_state")
            .prepend("ticker");
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(
            err.to_string(),
            "ticker: request_state: waiting for state: operation timed out"
        );
    }

    #[test]
    fn bare_kind_renders_kind_only() {
        let err = ThreadError::from(ErrorKind::ShuttingDown);
        assert_eq!(err.message(), None);
        assert_eq!(err.to_string(), "thread is shutting down");

        let err = err.prepend("exit");
        assert_eq!(err.message(), Some("exit"));
    }

    #[test]
    fn result_ext_maps_only_errors() {
        let ok: ThreadResult<u8> = Ok(3);
        assert_eq!(ok.prepend("unused"), Ok(3));

        let err: ThreadResult<u8> = Err(ThreadError::not_initialized());
        let err = err.prepend_with(|| format!("thread {}", "w1")).unwrap_err();
        assert!(err.is(ErrorKind::NotInitialized));
        assert!(err.to_string().starts_with("thread w1: "));
    }

    #[test]
    fn converts_into_anyhow() {
        let err: anyhow::Error = ThreadError::failed("tick handler").into();
        assert!(err.to_string().contains("tick handler"));
        assert!(err.downcast_ref::<ThreadError>().is_some());
    }
}
