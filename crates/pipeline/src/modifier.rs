//! In-pipeline message modifications.
//!
//! Modifiers run after the SMTP `DATA` phase and before delivery. A
//! [`Modifier`] is configured once at startup and shared read-only by all
//! messages. For each message it hands out a [`ModifierState`], which owns
//! everything that is scoped to that message. Concrete implementations
//! live in the [`dkim`](crate::dkim) module.

use tracing::debug;

use crate::{Buffer, HeaderSet, MsgMetadata, Result};

/// A configured modifier module.
pub trait Modifier: Send + Sync {
    /// Returns the module name (e.g. `sign_dkim`).
    fn name(&self) -> &str;

    /// Returns the name of this configured instance.
    fn instance_name(&self) -> &str;

    /// Creates the per-message state used to process one message.
    fn state_for_msg<'a>(&'a self, meta: &MsgMetadata) -> Result<Box<dyn ModifierState + 'a>>;
}

/// Per-message modifier state.
///
/// Envelope rewrites are applied as the addresses arrive, the body rewrite
/// once the whole message is received. [`close`](Self::close) is always
/// called last, even when a rewrite failed.
pub trait ModifierState: Send {
    /// Rewrites the envelope sender.
    fn rewrite_sender(&mut self, mail_from: &str) -> Result<String>;

    /// Rewrites one envelope recipient.
    fn rewrite_rcpt(&mut self, rcpt_to: &str) -> Result<String>;

    /// Inspects the body and mutates the header in place.
    fn rewrite_body(&mut self, header: &mut HeaderSet, body: &dyn Buffer) -> Result<()>;

    /// Releases the per-message state.
    fn close(&mut self) -> Result<()>;
}

/// Applies a list of modifiers to a message in order.
///
/// Processing stops at the first failing modifier, whose error is
/// returned. Modifiers that already ran keep their header changes.
pub fn apply_modifiers<M: AsRef<dyn Modifier>>(
    modifiers: &[M],
    meta: &MsgMetadata,
    header: &mut HeaderSet,
    body: &dyn Buffer,
) -> Result<()> {
    for modifier in modifiers {
        let modifier = modifier.as_ref();
        debug!(
            modifier = modifier.name(),
            instance = modifier.instance_name(),
            msg_id = %meta.id,
            "Applying modifier"
        );
        let mut state = modifier.state_for_msg(meta)?;
        let result = state.rewrite_body(header, body);
        let closed = state.close();
        result?;
        closed?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{Error, MemoryBuffer};

    struct StampModifier {
        name: &'static str,
        fail: bool,
        closed: AtomicUsize,
    }

    impl StampModifier {
        fn new(name: &'static str, fail: bool) -> Self {
            Self {
                name,
                fail,
                closed: AtomicUsize::new(0),
            }
        }
    }

    struct StampState<'a> {
        modifier: &'a StampModifier,
    }

    impl Modifier for StampModifier {
        fn name(&self) -> &str {
            "stamp"
        }

        fn instance_name(&self) -> &str {
            self.name
        }

        fn state_for_msg<'a>(
            &'a self,
            _meta: &MsgMetadata,
        ) -> Result<Box<dyn ModifierState + 'a>> {
            Ok(Box::new(StampState { modifier: self }))
        }
    }

    impl ModifierState for StampState<'_> {
        fn rewrite_sender(&mut self, mail_from: &str) -> Result<String> {
            Ok(mail_from.to_string())
        }

        fn rewrite_rcpt(&mut self, rcpt_to: &str) -> Result<String> {
            Ok(rcpt_to.to_string())
        }

        fn rewrite_body(&mut self, header: &mut HeaderSet, _body: &dyn Buffer) -> Result<()> {
            if self.modifier.fail {
                return Err(Error::stream("stamp failed"));
            }
            header.add("X-Stamp", self.modifier.name);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.modifier.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_apply_modifiers_in_order() {
        let modifiers: Vec<Box<dyn Modifier>> = vec![
            Box::new(StampModifier::new("first", false)),
            Box::new(StampModifier::new("second", false)),
        ];
        let meta = MsgMetadata::new("sender@example.com");
        let (mut header, _) = HeaderSet::parse(b"Subject: Test\r\n\r\n");

        apply_modifiers(&modifiers, &meta, &mut header, &MemoryBuffer::new("Body")).unwrap();

        let stamps = header
            .fields_by_key("X-Stamp")
            .map(|field| field.value())
            .collect::<Vec<_>>();
        assert_eq!(stamps, vec!["second", "first"]);
    }

    #[test]
    fn test_apply_modifiers_stops_on_failure() {
        let failing = Arc::new(StampModifier::new("failing", true));
        let after = Arc::new(StampModifier::new("after", false));
        let modifiers = vec![
            failing.clone() as Arc<dyn Modifier>,
            after.clone() as Arc<dyn Modifier>,
        ];
        let meta = MsgMetadata::new("sender@example.com");
        let mut header = HeaderSet::new();

        let result = apply_modifiers(&modifiers, &meta, &mut header, &MemoryBuffer::default());

        assert!(result.is_err());
        assert!(header.is_empty());
        assert_eq!(failing.closed.load(Ordering::SeqCst), 1);
        assert_eq!(after.closed.load(Ordering::SeqCst), 0);
    }
}
