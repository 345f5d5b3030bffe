//! Error types for channel and selector operations.
//!
//! A receive that ends on a closed, drained channel is not an error; it is
//! reported as `None` by [`Channel::recv`](crate::Channel::recv). The types
//! here cover the failures that carry information: sending on a closed
//! channel (the rejected value comes back), non-blocking operations that
//! could not make progress, and a selector send offer meeting a closed
//! channel.

use std::fmt;

use thiserror::Error;

/// The channel was closed; the rejected value is returned to the caller.
#[derive(Error, Clone, Copy, PartialEq, Eq)]
#[error("send on a closed channel")]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

/// A non-blocking send could not complete.
#[derive(Error, Clone, Copy, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No receiver was ready and the buffer (if any) was full.
    #[error("sending would block")]
    Full(T),
    /// The channel is closed.
    #[error("send on a closed channel")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(value) | TrySendError::Closed(value) => value,
        }
    }

    /// Whether the failure is the transient full/no-receiver case.
    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }

    /// Whether the failure is the permanent closed case.
    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// A non-blocking receive could not complete.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No value was ready and no sender was parked.
    #[error("receiving would block")]
    Empty,
    /// The channel is closed and its buffer is drained.
    #[error("receive on a closed, drained channel")]
    Closed,
}

/// A selector offer could not be completed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// A send offer addressed a closed channel.
    #[error("send offer on a closed channel")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_into_inner() {
        let err = SendError(7);
        assert_eq!(err.into_inner(), 7);
    }

    #[test]
    fn test_try_send_error_predicates() {
        assert!(TrySendError::Full(1).is_full());
        assert!(!TrySendError::Full(1).is_closed());
        assert!(TrySendError::Closed(1).is_closed());
        assert_eq!(TrySendError::Closed(2).into_inner(), 2);
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(SendError(0).to_string(), "send on a closed channel");
        assert_eq!(TryRecvError::Empty.to_string(), "receiving would block");
        assert_eq!(
            SelectError::Closed.to_string(),
            "send offer on a closed channel"
        );
    }
}
