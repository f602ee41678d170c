//! Storage backend contract consumed by the delivery target.
//!
//! The storage engine itself lives outside this crate; anything that
//! implements [`StorageBackend`] can sit behind a [`Storage`](super::Storage)
//! target. Methods return boxed futures to keep the traits object safe.

use std::{fmt::Display, future::Future, io, path::PathBuf, pin::Pin};

use crate::{Buffer, HeaderSet};

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Boxed future type for backend operations, enabling object safety.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Errors reported by a storage backend.
#[derive(Debug)]
pub enum BackendError {
    /// The account does not exist.
    UserDoesntExist,
    /// The mailbox the message should go to does not exist.
    NoSuchMailbox,
    /// An I/O error occurred.
    Io(io::Error),
    /// Any other engine failure.
    Other(String),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::UserDoesntExist => write!(f, "User doesn't exist"),
            BackendError::NoSuchMailbox => write!(f, "No such mailbox"),
            BackendError::Io(e) => write!(f, "I/O error: {e}"),
            BackendError::Other(msg) => write!(f, "Storage error: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        BackendError::Io(e)
    }
}

/// Options handed to a backend when it is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions {
    /// Largest accepted message in bytes, `None` for no limit.
    pub max_msg_bytes: Option<u32>,
    /// Directory holding message bodies outside of the engine.
    pub external_store: Option<PathBuf>,
}

/// A storage account as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUser {
    pub username: String,
    /// Whether the account was created by this call.
    pub created: bool,
}

/// A storage engine able to hold mail for many accounts.
pub trait StorageBackend: Send + Sync {
    /// Opens a delivery transaction.
    fn start_delivery(&self) -> BackendFuture<'_, Box<dyn BackendDelivery>>;

    /// Returns the account, creating it when it does not exist.
    fn get_or_create_user<'a>(&'a self, username: &'a str) -> BackendFuture<'a, BackendUser>;

    /// Checks a plain-text password.
    fn check_plain<'a>(&'a self, username: &'a str, password: &'a str) -> BackendFuture<'a, bool>;

    /// Returns the driver name of this backend.
    fn name(&self) -> &str;
}

/// A backend delivery transaction.
///
/// Recipients are added first, then the body is deposited once for all of
/// them, then the transaction is either committed or aborted.
pub trait BackendDelivery: Send {
    /// Adds a recipient account with a header prepended only to its copy.
    fn add_rcpt<'a>(&'a mut self, username: &'a str, header: &'a HeaderSet)
        -> BackendFuture<'a, ()>;

    /// Routes the message of all recipients to the mailbox carrying the
    /// special-use `attribute`, created as `default_name` when missing.
    fn special_mailbox<'a>(
        &'a mut self,
        attribute: &'a str,
        default_name: &'a str,
    ) -> BackendFuture<'a, ()>;

    /// Deposits the shared header and body.
    fn body_parsed<'a>(
        &'a mut self,
        header: &'a HeaderSet,
        length: usize,
        body: &'a dyn Buffer,
    ) -> BackendFuture<'a, ()>;

    fn abort(&mut self) -> BackendFuture<'_, ()>;

    fn commit(&mut self) -> BackendFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        assert_eq!(
            BackendError::UserDoesntExist.to_string(),
            "User doesn't exist"
        );
        assert_eq!(BackendError::NoSuchMailbox.to_string(), "No such mailbox");
        assert_eq!(
            BackendError::Other("disk full".to_string()).to_string(),
            "Storage error: disk full"
        );
    }

    #[test]
    fn test_backend_error_from_io() {
        let error: BackendError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(error, BackendError::Io(_)));
    }
}
