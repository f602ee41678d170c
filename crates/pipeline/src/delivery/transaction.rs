//! Multi-recipient delivery transaction.
//!
//! Recipients are resolved to storage accounts as they are added and the
//! body is deposited once for all of them. Each recipient copy gets its
//! own `Delivered-To` field through the per-recipient header, so the
//! stored body never has to be duplicated.

use std::{collections::HashSet, fmt::Display};

use tracing::{debug, error};

use crate::{
    Buffer, Delivery, Error, HeaderSet, MsgMetadata, Result, SmtpReply, TargetFuture,
};

use super::{
    account::resolve,
    backend::{BackendDelivery, BackendError, StorageBackend},
};

/// Special-use attribute of the mailbox quarantined messages go to.
pub const JUNK_ATTRIBUTE: &str = "\\Junk";

/// Read-only settings shared by all transactions of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Use the full address as the account name.
    pub per_domain: bool,
    /// Mailbox created for quarantined messages when none carries `\Junk`.
    pub junk_mailbox: String,
    /// Log every successful step.
    pub debug: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            per_domain: false,
            junk_mailbox: "Junk".to_string(),
            debug: false,
        }
    }
}

/// Lifecycle of a [`DeliveryTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    BodyDeposited,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_finalized(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Created => "created",
            TransactionState::BodyDeposited => "body deposited",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

/// Removes CR, LF and other control characters except tab, so that a
/// value cannot start a new header field.
pub fn sanitize_for_header(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c == '\t' || !c.is_control())
        .collect()
}

/// Delivery of one message to a storage backend.
pub struct DeliveryTransaction<'a> {
    policy: &'a DeliveryPolicy,
    meta: MsgMetadata,
    mail_from: String,
    delivery: Box<dyn BackendDelivery>,
    added: HashSet<String>,
    state: TransactionState,
}

impl<'a> DeliveryTransaction<'a> {
    /// Opens a backend delivery for the message described by `meta`.
    ///
    /// `mail_from` is the envelope sender recorded in `Return-Path`.
    pub async fn start(
        policy: &'a DeliveryPolicy,
        backend: &dyn StorageBackend,
        meta: &MsgMetadata,
        mail_from: &str,
    ) -> Result<Self> {
        let delivery = backend.start_delivery().await.map_err(Error::backend)?;
        Ok(Self {
            policy,
            meta: meta.clone(),
            mail_from: mail_from.to_string(),
            delivery,
            added: HashSet::new(),
            state: TransactionState::Created,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the accounts added so far.
    pub fn accounts(&self) -> Vec<&str> {
        let mut accounts = self.added.iter().map(String::as_str).collect::<Vec<_>>();
        accounts.sort_unstable();
        accounts
    }

    fn ensure(&self, allowed: &[TransactionState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(Error::precondition(format!(
            "{operation} called on a {} transaction",
            self.state
        )))
    }

    async fn add_rcpt_inner(&mut self, rcpt_to: &str) -> Result<()> {
        self.ensure(&[TransactionState::Created], "add_rcpt")?;

        let account = resolve(rcpt_to, self.policy.per_domain).map_err(|e| {
            error!(
                msg_id = %self.meta.id,
                rcpt = %rcpt_to,
                error = %e,
                "Failed to resolve recipient account"
            );
            e
        })?;
        if self.added.contains(account.as_str()) {
            return Ok(());
        }

        let mut rcpt_header = HeaderSet::new();
        rcpt_header.add("Delivered-To", &sanitize_for_header(rcpt_to));

        self.delivery
            .add_rcpt(account.as_str(), &rcpt_header)
            .await
            .map_err(|e| {
                error!(
                    msg_id = %self.meta.id,
                    account = %account,
                    error = %e,
                    "Backend rejected recipient"
                );
                match e {
                    BackendError::UserDoesntExist | BackendError::NoSuchMailbox => {
                        Error::recipient(SmtpReply::unknown_user())
                    }
                    other => Error::backend(other),
                }
            })?;

        if self.policy.debug {
            debug!(msg_id = %self.meta.id, account = %account, "Added recipient");
        }
        self.added.insert(account.into_string());
        Ok(())
    }

    async fn body_inner(&mut self, header: &HeaderSet, body: &dyn Buffer) -> Result<()> {
        self.ensure(&[TransactionState::Created], "body")?;

        if self.meta.quarantine {
            self.delivery
                .special_mailbox(JUNK_ATTRIBUTE, &self.policy.junk_mailbox)
                .await
                .map_err(Error::backend)?;
        }

        let mut header = header.copy();
        header.add(
            "Return-Path",
            &format!("<{}>", sanitize_for_header(&self.mail_from)),
        );

        self.delivery
            .body_parsed(&header, body.len(), body)
            .await
            .map_err(|e| {
                error!(msg_id = %self.meta.id, error = %e, "Failed to deposit message body");
                Error::backend(e)
            })?;
        self.state = TransactionState::BodyDeposited;

        if self.policy.debug {
            debug!(
                msg_id = %self.meta.id,
                length = body.len(),
                rcpts = self.added.len(),
                quarantine = self.meta.quarantine,
                "Deposited message body"
            );
        }
        Ok(())
    }

    async fn commit_inner(&mut self) -> Result<()> {
        self.ensure(
            &[TransactionState::Created, TransactionState::BodyDeposited],
            "commit",
        )?;
        self.delivery.commit().await.map_err(Error::backend)?;
        self.state = TransactionState::Committed;
        if self.policy.debug {
            debug!(msg_id = %self.meta.id, rcpts = self.added.len(), "Committed delivery");
        }
        Ok(())
    }

    async fn abort_inner(&mut self) -> Result<()> {
        self.ensure(
            &[TransactionState::Created, TransactionState::BodyDeposited],
            "abort",
        )?;
        self.state = TransactionState::Aborted;
        self.delivery.abort().await.map_err(Error::backend)?;
        if self.policy.debug {
            debug!(msg_id = %self.meta.id, "Aborted delivery");
        }
        Ok(())
    }
}

impl Delivery for DeliveryTransaction<'_> {
    fn add_rcpt<'a>(&'a mut self, rcpt_to: &'a str) -> TargetFuture<'a, ()> {
        Box::pin(self.add_rcpt_inner(rcpt_to))
    }

    fn body<'a>(&'a mut self, header: &'a HeaderSet, body: &'a dyn Buffer) -> TargetFuture<'a, ()> {
        Box::pin(self.body_inner(header, body))
    }

    fn abort(&mut self) -> TargetFuture<'_, ()> {
        Box::pin(self.abort_inner())
    }

    fn commit(&mut self) -> TargetFuture<'_, ()> {
        Box::pin(self.commit_inner())
    }
}
