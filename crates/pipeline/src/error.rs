//! Structured error type shared by modifiers and delivery targets.
//!
//! Every failure carries an [`ErrorKind`] so that callers (an SMTP
//! session, a queue runner) decide how to present it by matching on the
//! kind rather than on the message text. Recipient failures additionally
//! carry the [`SmtpReply`] that should be returned to the client.

use std::{
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing module configuration, fatal at startup.
    Configuration,
    /// Signing key could not be read, parsed, generated or written.
    Key,
    /// Invalid combination of signing parameters for one message.
    SigningOption,
    /// I/O failure while streaming header or body data.
    Stream,
    /// Recipient rejected, carries an SMTP reply.
    Recipient,
    /// Opaque failure reported by the storage backend.
    Backend,
    /// Operation invoked on a transaction in the wrong state.
    Precondition,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Key => "key error",
            ErrorKind::SigningOption => "signing option error",
            ErrorKind::Stream => "stream error",
            ErrorKind::Recipient => "recipient error",
            ErrorKind::Backend => "backend error",
            ErrorKind::Precondition => "precondition violation",
        };
        write!(f, "{name}")
    }
}

/// SMTP reply returned to the submitting client for a rejected recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    /// Basic reply code (e.g. `550`).
    pub code: u16,
    /// Enhanced status code (RFC 3463), e.g. `(5, 1, 1)`.
    pub enhanced: (u8, u8, u8),
    /// Human readable text.
    pub message: String,
}

impl SmtpReply {
    pub fn new(code: u16, enhanced: (u8, u8, u8), message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            message: message.into(),
        }
    }

    /// `501 5.1.3`, the recipient address is syntactically invalid.
    pub fn invalid_recipient(detail: &str) -> Self {
        Self::new(
            501,
            (5, 1, 3),
            format!("Invalid recipient address: {detail}"),
        )
    }

    /// `550 5.1.1`, the recipient account does not exist.
    pub fn unknown_user() -> Self {
        Self::new(550, (5, 1, 1), "User doesn't exist")
    }
}

impl Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, subject, detail) = self.enhanced;
        write!(
            f,
            "{} {class}.{subject}.{detail} {}",
            self.code, self.message
        )
    }
}

/// Error produced by a modifier, a delivery target or their configuration.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    reply: Option<SmtpReply>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            reply: None,
            source: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key, message)
    }

    pub fn signing_option(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SigningOption, message)
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Stream, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    /// Builds a recipient rejection from the reply sent to the client.
    pub fn recipient(reply: SmtpReply) -> Self {
        Self {
            kind: ErrorKind::Recipient,
            message: reply.message.clone(),
            reply: Some(reply),
            source: None,
        }
    }

    /// Wraps a backend failure, keeping it reachable through [`StdError::source`].
    pub fn backend(source: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            kind: ErrorKind::Backend,
            message: source.to_string(),
            reply: None,
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply for recipient rejections.
    pub fn smtp_reply(&self) -> Option<&SmtpReply> {
        self.reply.as_ref()
    }

    /// Returns the wrapped source error downcast to `T`, if any.
    pub fn source_as<T: StdError + 'static>(&self) -> Option<&T> {
        self.source.as_deref().and_then(|e| e.downcast_ref::<T>())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reply {
            Some(reply) => write!(f, "{}: {reply}", self.kind),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self {
            kind: ErrorKind::Stream,
            message: e.to_string(),
            reply: None,
            source: Some(Box::new(e)),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::configuration("domain is not specified").to_string(),
            "configuration error: domain is not specified"
        );
        assert_eq!(
            Error::precondition("transaction already committed").to_string(),
            "precondition violation: transaction already committed"
        );
    }

    #[test]
    fn test_recipient_error_carries_reply() {
        let error = Error::recipient(SmtpReply::unknown_user());
        assert_eq!(error.kind(), ErrorKind::Recipient);
        let reply = error.smtp_reply().unwrap();
        assert_eq!(reply.code, 550);
        assert_eq!(reply.enhanced, (5, 1, 1));
        assert_eq!(reply.to_string(), "550 5.1.1 User doesn't exist");
    }

    #[test]
    fn test_invalid_recipient_reply() {
        let reply = SmtpReply::invalid_recipient("missing domain");
        assert_eq!(reply.code, 501);
        assert_eq!(reply.enhanced, (5, 1, 3));
        assert_eq!(
            reply.to_string(),
            "501 5.1.3 Invalid recipient address: missing domain"
        );
    }

    #[test]
    fn test_io_error_is_stream_kind() {
        let error: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert_eq!(error.kind(), ErrorKind::Stream);
        assert!(error.source().is_some());
        assert!(error.source_as::<io::Error>().is_some());
    }
}
