//! Delivery targets, the final stage a message goes through.
//!
//! A [`DeliveryTarget`] is configured once and shared by all messages.
//! For each message it opens a [`Delivery`], which accepts recipients,
//! then the body, and is finally committed or aborted. Concrete
//! implementations live in the [`delivery`](crate::delivery) module.

use std::{future::Future, pin::Pin};

use tracing::{debug, warn};

use crate::{Buffer, HeaderSet, MsgMetadata, Result};

/// Boxed future type for delivery operations, enabling object safety.
pub type TargetFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A configured delivery target module.
pub trait DeliveryTarget: Send + Sync {
    /// Returns the module name (e.g. `sql`).
    fn name(&self) -> &str;

    /// Returns the name of this configured instance.
    fn instance_name(&self) -> &str;

    /// Opens the delivery of one message sent by envelope sender `mail_from`.
    fn start<'a>(
        &'a self,
        meta: &'a MsgMetadata,
        mail_from: &'a str,
    ) -> TargetFuture<'a, Box<dyn Delivery + 'a>>;
}

/// Delivery of one message.
///
/// Every call after a successful [`commit`](Self::commit) or any
/// [`abort`](Self::abort) fails with a precondition error.
pub trait Delivery: Send {
    /// Adds an envelope recipient.
    fn add_rcpt<'a>(&'a mut self, rcpt_to: &'a str) -> TargetFuture<'a, ()>;

    /// Deposits the message once for all added recipients.
    fn body<'a>(&'a mut self, header: &'a HeaderSet, body: &'a dyn Buffer)
        -> TargetFuture<'a, ()>;

    /// Discards the delivery.
    fn abort(&mut self) -> TargetFuture<'_, ()>;

    /// Makes the delivery permanent.
    fn commit(&mut self) -> TargetFuture<'_, ()>;
}

/// Runs a complete delivery, aborting it when any step fails.
pub async fn deliver(
    target: &dyn DeliveryTarget,
    meta: &MsgMetadata,
    mail_from: &str,
    rcpts: &[&str],
    header: &HeaderSet,
    body: &dyn Buffer,
) -> Result<()> {
    debug!(
        target = target.instance_name(),
        msg_id = %meta.id,
        rcpts = rcpts.len(),
        "Delivering message"
    );
    let mut delivery = target.start(meta, mail_from).await?;

    let mut result = Ok(());
    for rcpt in rcpts {
        result = delivery.add_rcpt(rcpt).await;
        if result.is_err() {
            break;
        }
    }
    if result.is_ok() {
        result = delivery.body(header, body).await;
    }
    if result.is_ok() {
        result = delivery.commit().await;
    }
    if let Err(e) = result {
        if let Err(abort_error) = delivery.abort().await {
            warn!(
                msg_id = %meta.id,
                error = %abort_error,
                "Failed to abort delivery"
            );
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{Error, MemoryBuffer};

    /// Records every call and fails the step named in `fail_on`.
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: &'static str,
    }

    impl Recorder {
        fn step(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(name.to_string());
            if name == self.fail_on {
                return Err(Error::precondition(format!("{name} failed")));
            }
            Ok(())
        }
    }

    impl DeliveryTarget for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn instance_name(&self) -> &str {
            "recorder"
        }

        fn start<'a>(
            &'a self,
            _meta: &'a MsgMetadata,
            mail_from: &'a str,
        ) -> TargetFuture<'a, Box<dyn Delivery + 'a>> {
            Box::pin(async move {
                self.step(&format!("start {mail_from}"))?;
                Ok(Box::new(RecorderDelivery(self)) as Box<dyn Delivery + 'a>)
            })
        }
    }

    struct RecorderDelivery<'a>(&'a Recorder);

    impl Delivery for RecorderDelivery<'_> {
        fn add_rcpt<'a>(&'a mut self, rcpt_to: &'a str) -> TargetFuture<'a, ()> {
            Box::pin(async move { self.0.step(&format!("rcpt {rcpt_to}")) })
        }

        fn body<'a>(
            &'a mut self,
            _header: &'a HeaderSet,
            _body: &'a dyn Buffer,
        ) -> TargetFuture<'a, ()> {
            Box::pin(async move { self.0.step("body") })
        }

        fn abort(&mut self) -> TargetFuture<'_, ()> {
            Box::pin(async move { self.0.step("abort") })
        }

        fn commit(&mut self) -> TargetFuture<'_, ()> {
            Box::pin(async move { self.0.step("commit") })
        }
    }

    async fn run(fail_on: &'static str) -> (Result<()>, Vec<String>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let target = Recorder {
            calls: calls.clone(),
            fail_on,
        };
        let meta = MsgMetadata::new("alice@example.org");
        let (header, _) = HeaderSet::parse(b"Subject: Hi\r\n\r\n");
        let result = deliver(
            &target,
            &meta,
            "bounces@example.org",
            &["bob@example.org", "carol@example.org"],
            &header,
            &MemoryBuffer::new("x"),
        )
        .await;
        let calls = calls.lock().unwrap().clone();
        (result, calls)
    }

    #[tokio::test]
    async fn test_deliver_commits() {
        let (result, calls) = run("").await;
        assert!(result.is_ok());
        assert_eq!(
            calls,
            vec![
                "start bounces@example.org",
                "rcpt bob@example.org",
                "rcpt carol@example.org",
                "body",
                "commit",
            ]
        );
    }

    #[tokio::test]
    async fn test_deliver_aborts_on_rcpt_failure() {
        let (result, calls) = run("rcpt bob@example.org").await;
        assert!(result.is_err());
        assert_eq!(
            calls,
            vec!["start bounces@example.org", "rcpt bob@example.org", "abort"]
        );
    }

    #[tokio::test]
    async fn test_deliver_aborts_on_commit_failure() {
        let (result, calls) = run("commit").await;
        assert_eq!(result.unwrap_err().message(), "commit failed");
        assert_eq!(calls[calls.len() - 2..], ["commit", "abort"]);
    }
}
