//! In-memory storage backend.
//!
//! Keeps accounts, mailboxes and messages in memory. Bodies deposited by
//! a delivery are stored once and shared by every recipient copy. When an
//! external store directory is configured, bodies are written there as
//! files instead. Useful for testing and development.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{self, Read},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use tracing::debug;
use uuid::Uuid;

use crate::{read_all, Buffer, FileBuffer, HeaderSet, MemoryBuffer};

use super::backend::{
    BackendDelivery, BackendError, BackendFuture, BackendOptions, BackendResult, BackendUser,
    StorageBackend,
};

/// Mailbox every account is created with.
pub const INBOX: &str = "INBOX";

/// A message copy as stored for one account.
#[derive(Clone)]
pub struct StoredMessage {
    /// Recipient specific fields followed by the shared header.
    pub header: HeaderSet,
    /// Body shared by all copies of one delivery.
    pub body: Arc<dyn Buffer>,
}

impl StoredMessage {
    /// Returns the full message as it would be served to a client.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut raw = self.header.to_bytes();
        self.body.open()?.read_to_end(&mut raw)?;
        Ok(raw)
    }
}

#[derive(Default)]
struct MemoryMailbox {
    attribute: Option<String>,
    messages: Vec<StoredMessage>,
}

struct MemoryUser {
    password: Option<String>,
    mailboxes: BTreeMap<String, MemoryMailbox>,
}

impl MemoryUser {
    fn new(password: Option<String>) -> Self {
        let mut mailboxes = BTreeMap::new();
        mailboxes.insert(INBOX.to_string(), MemoryMailbox::default());
        Self {
            password,
            mailboxes,
        }
    }

    /// Returns the name of the mailbox carrying `attribute`, creating
    /// `default_name` with that attribute when there is none.
    fn special_mailbox(&mut self, attribute: &str, default_name: &str) -> String {
        if let Some((name, _)) = self
            .mailboxes
            .iter()
            .find(|(_, mailbox)| mailbox.attribute.as_deref() == Some(attribute))
        {
            return name.clone();
        }
        let mailbox = self.mailboxes.entry(default_name.to_string()).or_default();
        mailbox.attribute = Some(attribute.to_string());
        default_name.to_string()
    }
}

#[derive(Default)]
struct MemoryState {
    users: RwLock<HashMap<String, MemoryUser>>,
    deposits: AtomicUsize,
    commits: AtomicUsize,
    options: BackendOptions,
}

/// In-memory storage backend, cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

fn poisoned<T>(_: PoisonError<T>) -> BackendError {
    BackendError::Other("memory backend lock poisoned".to_string())
}

impl MemoryBackend {
    pub fn new(options: BackendOptions) -> Self {
        Self {
            state: Arc::new(MemoryState {
                options,
                ..MemoryState::default()
            }),
        }
    }

    pub fn options(&self) -> &BackendOptions {
        &self.state.options
    }

    /// Creates an account with a password, replacing an existing one.
    pub fn create_user(&self, username: &str, password: &str) -> BackendResult<()> {
        let mut users = self.state.users.write().map_err(poisoned)?;
        users.insert(
            username.to_string(),
            MemoryUser::new(Some(password.to_string())),
        );
        Ok(())
    }

    /// Creates a mailbox for an existing account.
    pub fn create_mailbox(&self, username: &str, mailbox: &str) -> BackendResult<()> {
        let mut users = self.state.users.write().map_err(poisoned)?;
        let user = users
            .get_mut(username)
            .ok_or(BackendError::UserDoesntExist)?;
        user.mailboxes.entry(mailbox.to_string()).or_default();
        Ok(())
    }

    /// Deletes a mailbox of an existing account.
    pub fn delete_mailbox(&self, username: &str, mailbox: &str) -> BackendResult<()> {
        let mut users = self.state.users.write().map_err(poisoned)?;
        let user = users
            .get_mut(username)
            .ok_or(BackendError::UserDoesntExist)?;
        user.mailboxes
            .remove(mailbox)
            .map(|_| ())
            .ok_or(BackendError::NoSuchMailbox)
    }

    /// Returns the mailbox names of an account.
    pub fn mailbox_names(&self, username: &str) -> Vec<String> {
        let Ok(users) = self.state.users.read() else {
            return Vec::new();
        };
        users
            .get(username)
            .map(|user| user.mailboxes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the special-use attribute of a mailbox.
    pub fn mailbox_attribute(&self, username: &str, mailbox: &str) -> Option<String> {
        let users = self.state.users.read().ok()?;
        users.get(username)?.mailboxes.get(mailbox)?.attribute.clone()
    }

    /// Returns the messages stored in a mailbox.
    pub fn messages(&self, username: &str, mailbox: &str) -> Vec<StoredMessage> {
        let Ok(users) = self.state.users.read() else {
            return Vec::new();
        };
        users
            .get(username)
            .and_then(|user| user.mailboxes.get(mailbox))
            .map(|mailbox| mailbox.messages.clone())
            .unwrap_or_default()
    }

    /// Returns the number of bodies deposited so far.
    pub fn deposit_count(&self) -> usize {
        self.state.deposits.load(Ordering::SeqCst)
    }

    /// Returns the number of committed deliveries.
    pub fn commit_count(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }
}

impl StorageBackend for MemoryBackend {
    fn start_delivery(&self) -> BackendFuture<'_, Box<dyn BackendDelivery>> {
        Box::pin(async move {
            Ok(Box::new(MemoryDelivery {
                state: self.state.clone(),
                rcpts: Vec::new(),
                special: None,
                body: None,
                blob: None,
            }) as Box<dyn BackendDelivery>)
        })
    }

    fn get_or_create_user<'a>(&'a self, username: &'a str) -> BackendFuture<'a, BackendUser> {
        Box::pin(async move {
            let mut users = self.state.users.write().map_err(poisoned)?;
            let created = !users.contains_key(username);
            if created {
                users.insert(username.to_string(), MemoryUser::new(None));
                debug!(username = %username, "Created account");
            }
            Ok(BackendUser {
                username: username.to_string(),
                created,
            })
        })
    }

    fn check_plain<'a>(&'a self, username: &'a str, password: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let users = self.state.users.read().map_err(poisoned)?;
            Ok(users
                .get(username)
                .and_then(|user| user.password.as_deref())
                .is_some_and(|stored| stored == password))
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryDelivery {
    state: Arc<MemoryState>,
    rcpts: Vec<(String, HeaderSet)>,
    special: Option<(String, String)>,
    body: Option<(HeaderSet, Arc<dyn Buffer>)>,
    blob: Option<PathBuf>,
}

impl MemoryDelivery {
    fn store_body(&mut self, data: Vec<u8>) -> BackendResult<Arc<dyn Buffer>> {
        match &self.state.options.external_store {
            Some(dir) => {
                let path = dir.join(Uuid::new_v4().to_string());
                let file = FileBuffer::create(&path, &data)?;
                self.blob = Some(path);
                Ok(Arc::new(file))
            }
            None => Ok(Arc::new(MemoryBuffer::new(data))),
        }
    }

    fn discard(&mut self) -> BackendResult<()> {
        self.rcpts.clear();
        self.special = None;
        self.body = None;
        if let Some(path) = self.blob.take() {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}

impl BackendDelivery for MemoryDelivery {
    fn add_rcpt<'a>(
        &'a mut self,
        username: &'a str,
        header: &'a HeaderSet,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            {
                let users = self.state.users.read().map_err(poisoned)?;
                let user = users.get(username).ok_or(BackendError::UserDoesntExist)?;
                if !user.mailboxes.contains_key(INBOX) {
                    return Err(BackendError::NoSuchMailbox);
                }
            }
            self.rcpts.push((username.to_string(), header.copy()));
            Ok(())
        })
    }

    fn special_mailbox<'a>(
        &'a mut self,
        attribute: &'a str,
        default_name: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.special = Some((attribute.to_string(), default_name.to_string()));
            Ok(())
        })
    }

    fn body_parsed<'a>(
        &'a mut self,
        header: &'a HeaderSet,
        length: usize,
        body: &'a dyn Buffer,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if let Some(max) = self.state.options.max_msg_bytes {
                if length > max as usize {
                    return Err(BackendError::Other(format!(
                        "message size {length} exceeds the limit of {max} bytes"
                    )));
                }
            }
            let data = read_all(body)?;
            let stored = self.store_body(data)?;
            self.body = Some((header.copy(), stored));
            self.state.deposits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn abort(&mut self) -> BackendFuture<'_, ()> {
        Box::pin(async move { self.discard() })
    }

    fn commit(&mut self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            // the body stays deposited until every target resolves, so a
            // failed commit can be retried or aborted
            if let Some((header, body)) = &self.body {
                let mut users = self.state.users.write().map_err(poisoned)?;
                let mut targets = Vec::with_capacity(self.rcpts.len());
                for (username, _) in &self.rcpts {
                    let user = users
                        .get_mut(username)
                        .ok_or(BackendError::UserDoesntExist)?;
                    let mailbox = match &self.special {
                        Some((attribute, default_name)) => {
                            user.special_mailbox(attribute, default_name)
                        }
                        None if user.mailboxes.contains_key(INBOX) => INBOX.to_string(),
                        None => return Err(BackendError::NoSuchMailbox),
                    };
                    targets.push(mailbox);
                }

                for ((username, rcpt_header), mailbox) in self.rcpts.iter().zip(targets) {
                    let mut copy = header.copy();
                    for field in rcpt_header.fields().iter().rev() {
                        copy.add_field(field.clone());
                    }
                    if let Some(mailbox) = users
                        .get_mut(username)
                        .and_then(|user| user.mailboxes.get_mut(&mailbox))
                    {
                        mailbox.messages.push(StoredMessage {
                            header: copy,
                            body: body.clone(),
                        });
                    }
                }
            }
            self.rcpts.clear();
            self.body = None;
            self.blob = None;
            self.state.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
