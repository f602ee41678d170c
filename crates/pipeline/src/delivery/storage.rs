//! The `sql` storage delivery target.
//!
//! Wraps a [`StorageBackend`] and exposes it as a [`DeliveryTarget`]. The
//! backend is picked by driver name from [`STORAGE_DRIVERS`], or handed
//! over directly with [`Storage::with_backend`] for engines living outside
//! this crate.

use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{Delivery, DeliveryTarget, Error, MsgMetadata, Result, SmtpReply, TargetFuture};

use super::{
    account::{check_domain_auth, resolve},
    backend::{BackendOptions, BackendUser, StorageBackend},
    memory::MemoryBackend,
    transaction::{DeliveryPolicy, DeliveryTransaction},
};

/// IMAP extensions supported on top of the storage.
pub const IMAP_EXTENSIONS: &[&str] = &["APPENDLIMIT", "MOVE", "CHILDREN", "SPECIAL-USE"];

/// Default append limit, 32 MiB.
pub const DEFAULT_APPEND_LIMIT: u32 = 32 * 1024 * 1024;

/// Opens a backend from a DSN.
pub type BackendFactory = fn(dsn: &str, options: BackendOptions) -> Result<Arc<dyn StorageBackend>>;

/// Storage drivers known by name.
pub const STORAGE_DRIVERS: &[(&str, BackendFactory)] = &[("memory", open_memory)];

fn open_memory(_dsn: &str, options: BackendOptions) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(MemoryBackend::new(options)))
}

/// Maximum message size accepted by the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSize")]
pub struct AppendLimit(Option<u32>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(i64),
    Text(String),
}

impl AppendLimit {
    pub const UNLIMITED: AppendLimit = AppendLimit(None);

    pub fn bytes(limit: u32) -> Self {
        Self(Some(limit))
    }

    /// Returns the limit in bytes, `None` when unlimited.
    pub fn get(&self) -> Option<u32> {
        self.0
    }

    /// Parses a byte count with an optional `K`, `M` or `G` suffix (binary
    /// multiples), or `unlimited`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mailstage_pipeline::delivery::AppendLimit;
    ///
    /// assert_eq!(AppendLimit::parse("32M").unwrap().get(), Some(32 * 1024 * 1024));
    /// assert_eq!(AppendLimit::parse("unlimited").unwrap().get(), None);
    /// assert!(AppendLimit::parse("5G").is_err());
    /// ```
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("unlimited") || value == "-1" {
            return Ok(Self::UNLIMITED);
        }
        let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_uppercase()) {
            Some('K') => (&value[..value.len() - 1], 1u64 << 10),
            Some('M') => (&value[..value.len() - 1], 1u64 << 20),
            Some('G') => (&value[..value.len() - 1], 1u64 << 30),
            _ => (value, 1u64),
        };
        let count: u64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid size: {value}"))?;
        Self::from_u64(count.checked_mul(multiplier), value)
    }

    fn from_u64(bytes: Option<u64>, shown: &str) -> std::result::Result<Self, String> {
        match bytes {
            Some(bytes) if bytes <= u32::MAX as u64 => Ok(Self(Some(bytes as u32))),
            _ => Err(format!(
                "append limit {shown} exceeds the maximum of {} bytes",
                u32::MAX
            )),
        }
    }
}

impl Default for AppendLimit {
    fn default() -> Self {
        Self(Some(DEFAULT_APPEND_LIMIT))
    }
}

impl Display for AppendLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(bytes) => write!(f, "{bytes}"),
            None => write!(f, "unlimited"),
        }
    }
}

impl TryFrom<RawSize> for AppendLimit {
    type Error = String;

    fn try_from(raw: RawSize) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawSize::Bytes(-1) => Ok(Self::UNLIMITED),
            RawSize::Bytes(bytes) if bytes < 0 => Err(format!("invalid size: {bytes}")),
            RawSize::Bytes(bytes) => Self::from_u64(Some(bytes as u64), &bytes.to_string()),
            RawSize::Text(text) => Self::parse(&text),
        }
    }
}

/// DSN given either as one string or as a list of words.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawDsn")]
pub struct Dsn(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDsn {
    One(String),
    Words(Vec<String>),
}

impl From<RawDsn> for Dsn {
    fn from(raw: RawDsn) -> Self {
        match raw {
            RawDsn::One(dsn) => Dsn(dsn),
            RawDsn::Words(words) => Dsn(words.join(" ")),
        }
    }
}

impl Dsn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Options of a `sql` module instance.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub driver: String,

    #[serde(default)]
    pub dsn: Dsn,

    #[serde(default)]
    pub appendlimit: AppendLimit,

    #[serde(default)]
    pub debug: bool,

    /// Store mail of `user@a` and `user@b` in different accounts.
    #[serde(default)]
    pub storage_perdomain: bool,

    /// Require `user@domain` logins.
    #[serde(default)]
    pub auth_perdomain: bool,

    /// Domains accepted in logins.
    #[serde(default)]
    pub auth_domains: Vec<String>,

    #[serde(default = "default_junk_mailbox")]
    pub junk_mailbox: String,

    /// Overrides the global hostname.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Message body directory, relative paths are below the state directory.
    #[serde(default)]
    pub fsstore: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: String::new(),
            dsn: Dsn::default(),
            appendlimit: AppendLimit::default(),
            debug: false,
            storage_perdomain: false,
            auth_perdomain: false,
            auth_domains: Vec::new(),
            junk_mailbox: default_junk_mailbox(),
            hostname: None,
            fsstore: None,
        }
    }
}

fn default_junk_mailbox() -> String {
    "Junk".to_string()
}

/// Process-wide settings a module instance is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Globals {
    pub state_dir: PathBuf,
    pub hostname: Option<String>,
}

/// Storage delivery target.
pub struct Storage {
    instance_name: String,
    policy: DeliveryPolicy,
    auth_perdomain: bool,
    auth_domains: Vec<String>,
    hostname: String,
    append_limit: AppendLimit,
    fsstore: PathBuf,
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    /// Creates the target, opening the backend named by the driver.
    ///
    /// `inline_args` may carry the driver followed by the DSN words.
    pub fn new(
        instance_name: &str,
        inline_args: &[String],
        mut config: StorageConfig,
        globals: &Globals,
    ) -> Result<Self> {
        match inline_args {
            [] => {}
            [_] => {
                return Err(Error::configuration(format!(
                    "sql {instance_name}: specify at least driver and DSN"
                )))
            }
            [driver, dsn @ ..] => {
                config.driver = driver.clone();
                config.dsn = Dsn(dsn.join(" "));
            }
        }
        if config.driver.is_empty() {
            return Err(Error::configuration(format!(
                "sql {instance_name}: driver is required"
            )));
        }
        if config.dsn.as_str().is_empty() {
            return Err(Error::configuration(format!(
                "sql {instance_name}: dsn is required"
            )));
        }

        let Some((_, factory)) = STORAGE_DRIVERS
            .iter()
            .find(|(name, _)| *name == config.driver)
        else {
            return Err(Error::configuration(format!(
                "sql {instance_name}: unsupported driver {}",
                config.driver
            )));
        };

        let fsstore = prepare_fsstore(instance_name, config.fsstore.as_deref(), globals)?;
        let backend = factory(
            config.dsn.as_str(),
            BackendOptions {
                max_msg_bytes: config.appendlimit.get(),
                external_store: Some(fsstore.clone()),
            },
        )?;
        Self::build(instance_name, config, globals, fsstore, backend)
    }

    /// Creates the target around an already opened backend.
    pub fn with_backend(
        instance_name: &str,
        config: StorageConfig,
        globals: &Globals,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let fsstore = prepare_fsstore(instance_name, config.fsstore.as_deref(), globals)?;
        Self::build(instance_name, config, globals, fsstore, backend)
    }

    fn build(
        instance_name: &str,
        config: StorageConfig,
        globals: &Globals,
        fsstore: PathBuf,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        if config.auth_perdomain && config.auth_domains.is_empty() {
            return Err(Error::configuration(format!(
                "sql {instance_name}: auth_domains must be set if auth_perdomain is used"
            )));
        }
        let Some(hostname) = config.hostname.or_else(|| globals.hostname.clone()) else {
            return Err(Error::configuration(format!(
                "sql {instance_name}: hostname is not specified"
            )));
        };

        info!(
            instance = %instance_name,
            driver = backend.name(),
            hostname = %hostname,
            appendlimit = %config.appendlimit,
            fsstore = %fsstore.display(),
            storage_perdomain = config.storage_perdomain,
            "Storage target initialized"
        );
        Ok(Self {
            instance_name: instance_name.to_string(),
            policy: DeliveryPolicy {
                per_domain: config.storage_perdomain,
                junk_mailbox: config.junk_mailbox,
                debug: config.debug,
            },
            auth_perdomain: config.auth_perdomain,
            auth_domains: config.auth_domains,
            hostname,
            append_limit: config.appendlimit,
            fsstore,
            backend,
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn append_limit(&self) -> AppendLimit {
        self.append_limit
    }

    pub fn fsstore(&self) -> &Path {
        &self.fsstore
    }

    pub fn imap_extensions(&self) -> &'static [&'static str] {
        IMAP_EXTENSIONS
    }

    /// Checks login credentials against the domain policy and the backend.
    pub async fn check_plain(&self, username: &str, password: &str) -> Result<bool> {
        let Some(account) = check_domain_auth(username, self.auth_perdomain, &self.auth_domains)
        else {
            debug!(username = %username, "Login rejected by domain policy");
            return Ok(false);
        };
        self.backend
            .check_plain(account.as_str(), password)
            .await
            .map_err(Error::backend)
    }

    /// Returns the storage account for a login, creating it when missing.
    pub async fn get_or_create_user(&self, username: &str) -> Result<BackendUser> {
        if self.policy.per_domain && !username.contains('@') {
            return Err(Error::recipient(SmtpReply::invalid_recipient(
                "username@domain required",
            )));
        }
        let account = resolve(username, self.policy.per_domain)?;
        self.backend
            .get_or_create_user(account.as_str())
            .await
            .map_err(Error::backend)
    }
}

/// Resolves the body store directory and makes sure it exists.
fn prepare_fsstore(
    instance_name: &str,
    configured: Option<&Path>,
    globals: &Globals,
) -> Result<PathBuf> {
    let path = match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => globals.state_dir.join(path),
        None if instance_name.is_empty() => {
            return Err(Error::configuration(
                "sql: need explicit fsstore location for inline definition",
            ))
        }
        None => globals
            .state_dir
            .join(format!("sql-{instance_name}-fsstore")),
    };
    fs::create_dir_all(&path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to create fsstore directory");
        Error::configuration(format!(
            "sql {instance_name}: failed to create {}: {e}",
            path.display()
        ))
    })?;
    Ok(path)
}

impl DeliveryTarget for Storage {
    fn name(&self) -> &str {
        "sql"
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn start<'a>(
        &'a self,
        meta: &'a MsgMetadata,
        mail_from: &'a str,
    ) -> TargetFuture<'a, Box<dyn Delivery + 'a>> {
        Box::pin(async move {
            let transaction =
                DeliveryTransaction::start(&self.policy, self.backend.as_ref(), meta, mail_from)
                    .await?;
            Ok(Box::new(transaction) as Box<dyn Delivery + 'a>)
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        delivery::INBOX, deliver, ErrorKind, HeaderSet, MemoryBuffer,
    };

    fn globals(dir: &TempDir) -> Globals {
        Globals {
            state_dir: dir.path().to_path_buf(),
            hostname: Some("mx.example.org".to_string()),
        }
    }

    fn memory_config() -> StorageConfig {
        StorageConfig {
            driver: "memory".to_string(),
            dsn: Dsn("mail".to_string()),
            ..StorageConfig::default()
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn test_append_limit_parse() {
        assert_eq!(AppendLimit::parse("1024").unwrap().get(), Some(1024));
        assert_eq!(AppendLimit::parse("16k").unwrap().get(), Some(16 * 1024));
        assert_eq!(AppendLimit::parse("1G").unwrap().get(), Some(1 << 30));
        assert_eq!(AppendLimit::parse("-1").unwrap(), AppendLimit::UNLIMITED);
        assert_eq!(
            AppendLimit::parse("4294967295").unwrap().get(),
            Some(u32::MAX)
        );
        assert!(AppendLimit::parse("4294967296").is_err());
        assert!(AppendLimit::parse("4G").is_err());
        assert!(AppendLimit::parse("lots").is_err());
        assert_eq!(AppendLimit::default().get(), Some(32 * 1024 * 1024));
    }

    #[test]
    fn test_append_limit_from_toml() {
        let config: StorageConfig = toml::from_str("appendlimit = 4294967295").unwrap();
        assert_eq!(config.appendlimit.get(), Some(u32::MAX));

        let config: StorageConfig = toml::from_str("appendlimit = -1").unwrap();
        assert_eq!(config.appendlimit, AppendLimit::UNLIMITED);

        let config: StorageConfig = toml::from_str("appendlimit = \"unlimited\"").unwrap();
        assert_eq!(config.appendlimit.get(), None);

        assert!(toml::from_str::<StorageConfig>("appendlimit = 4294967296").is_err());
        assert!(toml::from_str::<StorageConfig>("appendlimit = -5").is_err());
    }

    #[test]
    fn test_config_defaults_and_dsn_forms() {
        let config: StorageConfig = toml::from_str("driver = \"memory\"").unwrap();
        assert_eq!(config.junk_mailbox, "Junk");
        assert!(!config.storage_perdomain);
        assert!(config.hostname.is_none());

        let config: StorageConfig = toml::from_str("dsn = [\"host=db\", \"user=mail\"]").unwrap();
        assert_eq!(config.dsn.as_str(), "host=db user=mail");
        let config: StorageConfig = toml::from_str("dsn = \"mail.db\"").unwrap();
        assert_eq!(config.dsn.as_str(), "mail.db");
    }

    #[test]
    fn test_inline_args() {
        let dir = TempDir::new().unwrap();

        let error = Storage::new("local", &args(&["memory"]), StorageConfig::default(), &globals(&dir))
            .err()
            .unwrap();
        assert!(error.message().contains("specify at least driver and DSN"));

        let storage = Storage::new(
            "local",
            &args(&["memory", "host=db", "user=mail"]),
            StorageConfig::default(),
            &globals(&dir),
        )
        .unwrap();
        assert_eq!(storage.backend().name(), "memory");
    }

    #[test]
    fn test_validation_errors() {
        let dir = TempDir::new().unwrap();
        let check = |config: StorageConfig, globals: &Globals, text: &str| {
            let error = Storage::new("local", &[], config, globals).err().unwrap();
            assert_eq!(error.kind(), ErrorKind::Configuration);
            assert!(error.message().contains(text), "{}", error.message());
        };

        check(StorageConfig::default(), &globals(&dir), "driver is required");
        check(
            StorageConfig {
                dsn: Dsn::default(),
                ..memory_config()
            },
            &globals(&dir),
            "dsn is required",
        );
        check(
            StorageConfig {
                driver: "postgres".to_string(),
                ..memory_config()
            },
            &globals(&dir),
            "unsupported driver",
        );
        check(
            StorageConfig {
                auth_perdomain: true,
                ..memory_config()
            },
            &globals(&dir),
            "auth_domains",
        );
        check(
            memory_config(),
            &Globals {
                hostname: None,
                ..globals(&dir)
            },
            "hostname",
        );
    }

    #[test]
    fn test_fsstore_location() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new("local", &[], memory_config(), &globals(&dir)).unwrap();
        assert_eq!(storage.fsstore(), dir.path().join("sql-local-fsstore"));
        assert!(storage.fsstore().is_dir());

        let config = StorageConfig {
            fsstore: Some(PathBuf::from("bodies")),
            ..memory_config()
        };
        let storage = Storage::new("local", &[], config, &globals(&dir)).unwrap();
        assert_eq!(storage.fsstore(), dir.path().join("bodies"));

        let error = Storage::new("", &[], memory_config(), &globals(&dir))
            .err()
            .unwrap();
        assert!(error.message().contains("explicit fsstore"));
    }

    #[test]
    fn test_hostname_override() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            hostname: Some("imap.example.org".to_string()),
            ..memory_config()
        };
        let storage = Storage::new("local", &[], config, &globals(&dir)).unwrap();
        assert_eq!(storage.hostname(), "imap.example.org");
        assert_eq!(
            storage.imap_extensions(),
            &["APPENDLIMIT", "MOVE", "CHILDREN", "SPECIAL-USE"]
        );
    }

    #[tokio::test]
    async fn test_check_plain_domain_policy() {
        let dir = TempDir::new().unwrap();
        let backend = MemoryBackend::default();
        backend.create_user("bob@example.org", "secret").unwrap();
        let config = StorageConfig {
            auth_perdomain: true,
            auth_domains: vec!["example.org".to_string()],
            ..memory_config()
        };
        let storage =
            Storage::with_backend("local", config, &globals(&dir), Arc::new(backend)).unwrap();

        assert!(storage.check_plain("Bob@example.org", "secret").await.unwrap());
        assert!(!storage.check_plain("bob@example.org", "wrong").await.unwrap());
        assert!(!storage.check_plain("bob", "secret").await.unwrap());
        assert!(!storage.check_plain("bob@other.org", "secret").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_or_create_user() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new("local", &[], memory_config(), &globals(&dir)).unwrap();
        let user = storage.get_or_create_user("Alice@example.org").await.unwrap();
        assert_eq!(user.username, "alice");
        assert!(user.created);

        let config = StorageConfig {
            storage_perdomain: true,
            ..memory_config()
        };
        let storage = Storage::new("perdomain", &[], config, &globals(&dir)).unwrap();
        let error = storage.get_or_create_user("alice").await.unwrap_err();
        assert!(error.message().contains("username@domain required"));
        let user = storage.get_or_create_user("alice@example.org").await.unwrap();
        assert_eq!(user.username, "alice@example.org");
    }

    #[tokio::test]
    async fn test_deliver_through_target() {
        let dir = TempDir::new().unwrap();
        let backend = MemoryBackend::default();
        backend.create_user("bob", "b").unwrap();
        let storage = Storage::with_backend(
            "local",
            memory_config(),
            &globals(&dir),
            Arc::new(backend.clone()),
        )
        .unwrap();

        let meta = MsgMetadata::new("alice@example.org");
        let (header, _) = HeaderSet::parse(b"Subject: Hi\r\n\r\n");
        let body = MemoryBuffer::new("x");
        deliver(&storage, &meta, "bounces@lists.example.org", &["bob@example.org"], &header, &body)
            .await
            .unwrap();
        let stored = backend.messages("bob", INBOX);
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].header.get("Return-Path").as_deref(),
            Some("<bounces@lists.example.org>")
        );

        let error = deliver(&storage, &meta, "", &["carol@example.org"], &header, &body)
            .await
            .unwrap_err();
        assert_eq!(error.smtp_reply().unwrap().code, 550);
        assert_eq!(backend.commit_count(), 1);
    }
}
