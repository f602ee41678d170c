//! The `sign_dkim` modifier.
//!
//! Signs every message passing through it with the configured domain key
//! and prepends the resulting `DKIM-Signature` field. Headers listed in
//! `oversign_fields` are referenced once more than they occur so that a
//! header added after signing invalidates the signature.

use std::{collections::HashSet, io, time::Duration};

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::{
    Buffer, Error, HeaderSet, Modifier, ModifierState, MsgMetadata, Result,
};

use super::{
    canon::Canonicalization,
    hash::HashAlgorithm,
    key::{key_path, load_or_generate, KeyAlgorithm, KeyMaterial},
    signer::{SignOptions, Signer, SIGNATURE_FIELD},
};

/// Header fields oversigned unless configured otherwise.
pub const OVERSIGN_DEFAULT: &[&str] = &[
    "Subject",
    "Sender",
    "To",
    "Cc",
    "From",
    "Date",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Reply-To",
    "In-Reply-To",
    "Message-Id",
    "References",
    "Autocrypt",
    "Openpgp",
];

/// Header fields signed (once per occurrence) unless configured otherwise.
pub const SIGN_DEFAULT: &[&str] = &[
    "List-Id",
    "List-Help",
    "List-Unsubscribe",
    "List-Post",
    "List-Owner",
    "List-Archive",
    "Resent-To",
    "Resent-Sender",
    "Resent-Message-Id",
    "Resent-Date",
    "Resent-From",
    "Resent-Cc",
];

/// Options of a `sign_dkim` module instance.
#[derive(Debug, Clone, Deserialize)]
pub struct DkimConfig {
    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub selector: String,

    /// Key file location, `{domain}` and `{selector}` are substituted.
    #[serde(default = "default_key_path")]
    pub key_path: String,

    #[serde(default = "default_oversign_fields")]
    pub oversign_fields: Vec<String>,

    #[serde(default = "default_sign_fields")]
    pub sign_fields: Vec<String>,

    #[serde(default)]
    pub header_canon: Canonicalization,

    #[serde(default)]
    pub body_canon: Canonicalization,

    /// Signature validity, zero disables `x=`.
    #[serde(default = "default_sig_expiry", with = "humantime_serde")]
    pub sig_expiry: Duration,

    #[serde(default)]
    pub hash: HashAlgorithm,

    /// Algorithm used when the key file does not exist yet.
    #[serde(default)]
    pub newkey_algo: KeyAlgorithm,

    #[serde(default)]
    pub debug: bool,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            selector: String::new(),
            key_path: default_key_path(),
            oversign_fields: default_oversign_fields(),
            sign_fields: default_sign_fields(),
            header_canon: Canonicalization::default(),
            body_canon: Canonicalization::default(),
            sig_expiry: default_sig_expiry(),
            hash: HashAlgorithm::default(),
            newkey_algo: KeyAlgorithm::default(),
            debug: false,
        }
    }
}

fn default_key_path() -> String {
    "dkim_keys/{domain}_{selector}.key".to_string()
}

fn default_oversign_fields() -> Vec<String> {
    OVERSIGN_DEFAULT.iter().map(|name| name.to_string()).collect()
}

fn default_sign_fields() -> Vec<String> {
    SIGN_DEFAULT.iter().map(|name| name.to_string()).collect()
}

fn default_sig_expiry() -> Duration {
    Duration::from_secs(5 * 24 * 60 * 60)
}

/// Computes the `h=` list for a message.
///
/// Every name of `oversign` appears once per occurrence in `header` plus
/// one more time, every name of `sign` once per occurrence. Names are
/// compared case-insensitively and only their first listing counts.
pub fn fields_to_sign(header: &HeaderSet, oversign: &[String], sign: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();

    for name in oversign {
        if !seen.insert(name.to_ascii_lowercase()) {
            continue;
        }
        for _ in 0..header.count(name) + 1 {
            keys.push(name.clone());
        }
    }

    for name in sign {
        if !seen.insert(name.to_ascii_lowercase()) {
            continue;
        }
        for _ in 0..header.count(name) {
            keys.push(name.clone());
        }
    }

    keys
}

/// DKIM signing modifier.
#[derive(Debug)]
pub struct DkimModifier {
    instance_name: String,
    config: DkimConfig,
    key: KeyMaterial,
}

impl DkimModifier {
    /// Creates the modifier, loading or generating its key.
    ///
    /// `inline_args` may carry the domain and the selector, which then take
    /// precedence over the options.
    pub fn new(instance_name: &str, inline_args: &[String], mut config: DkimConfig) -> Result<Self> {
        match inline_args {
            [] => {}
            [domain, selector] => {
                config.domain = domain.clone();
                config.selector = selector.clone();
            }
            _ => {
                return Err(Error::configuration(format!(
                    "sign_dkim {instance_name}: expected domain and selector as arguments, got {} arguments",
                    inline_args.len()
                )))
            }
        }
        if config.domain.is_empty() {
            return Err(Error::configuration(format!(
                "sign_dkim {instance_name}: domain is not specified"
            )));
        }
        if config.selector.is_empty() {
            return Err(Error::configuration(format!(
                "sign_dkim {instance_name}: selector is not specified"
            )));
        }

        let path = key_path(&config.key_path, &config.domain, &config.selector);
        let key = load_or_generate(&config.domain, &config.selector, &path, config.newkey_algo)?;
        Self::from_key(instance_name, config, key)
    }

    /// Creates the modifier around an already loaded key.
    pub fn from_key(instance_name: &str, config: DkimConfig, key: KeyMaterial) -> Result<Self> {
        if i64::try_from(config.sig_expiry.as_secs()).is_err() {
            return Err(Error::configuration(format!(
                "sign_dkim {instance_name}: sig_expiry of {}s is out of range",
                config.sig_expiry.as_secs()
            )));
        }
        if !key.supports(config.hash) {
            return Err(Error::key(format!(
                "{} key cannot sign with {}",
                key.key_type(),
                config.hash
            )));
        }
        info!(
            instance = %instance_name,
            domain = %config.domain,
            selector = %config.selector,
            key_type = key.key_type(),
            header_canon = %config.header_canon,
            body_canon = %config.body_canon,
            "DKIM signer initialized"
        );
        Ok(Self {
            instance_name: instance_name.to_string(),
            config,
            key,
        })
    }

    pub fn config(&self) -> &DkimConfig {
        &self.config
    }

    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    /// Derives the `i=` identifier from the envelope sender.
    pub fn identifier(&self, original_from: &str) -> String {
        if original_from.contains('@') {
            original_from.to_string()
        } else {
            format!("{original_from}@{}", self.config.domain)
        }
    }

    /// Computes the `h=` list for a message with the configured lists.
    pub fn fields_to_sign(&self, header: &HeaderSet) -> Vec<String> {
        fields_to_sign(header, &self.config.oversign_fields, &self.config.sign_fields)
    }

    fn sign_options(&self, identifier: String, header: &HeaderSet) -> Result<SignOptions> {
        let now = Utc::now().timestamp();
        let expiration = if self.config.sig_expiry.is_zero() {
            None
        } else {
            let expiration = i64::try_from(self.config.sig_expiry.as_secs())
                .ok()
                .and_then(|secs| now.checked_add(secs))
                .ok_or_else(|| Error::signing_option("signature expiration overflows"))?;
            Some(expiration)
        };
        Ok(SignOptions {
            domain: self.config.domain.clone(),
            selector: self.config.selector.clone(),
            identifier: Some(identifier),
            hash: self.config.hash,
            header_canonicalization: self.config.header_canon,
            body_canonicalization: self.config.body_canon,
            header_keys: self.fields_to_sign(header),
            timestamp: now,
            expiration,
        })
    }
}

impl Modifier for DkimModifier {
    fn name(&self) -> &str {
        "sign_dkim"
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn state_for_msg<'a>(&'a self, meta: &MsgMetadata) -> Result<Box<dyn ModifierState + 'a>> {
        Ok(Box::new(DkimState {
            modifier: self,
            msg_id: meta.id.clone(),
            original_from: meta.original_from.clone(),
        }))
    }
}

/// Signing state of one message.
struct DkimState<'a> {
    modifier: &'a DkimModifier,
    msg_id: String,
    original_from: String,
}

impl DkimState<'_> {
    fn sign(&self, header: &HeaderSet, body: &dyn Buffer, identifier: &str) -> Result<String> {
        let options = self.modifier.sign_options(identifier.to_string(), header)?;
        let mut signer = Signer::new(options, &self.modifier.key)?;
        signer.write_header(header);
        let mut reader = body.open()?;
        io::copy(&mut reader, &mut signer)?;
        signer.finish()
    }
}

impl ModifierState for DkimState<'_> {
    fn rewrite_sender(&mut self, mail_from: &str) -> Result<String> {
        Ok(mail_from.to_string())
    }

    fn rewrite_rcpt(&mut self, rcpt_to: &str) -> Result<String> {
        Ok(rcpt_to.to_string())
    }

    fn rewrite_body(&mut self, header: &mut HeaderSet, body: &dyn Buffer) -> Result<()> {
        let identifier = self.modifier.identifier(&self.original_from);
        let signature = self.sign(header, body, &identifier).map_err(|e| {
            error!(
                msg_id = %self.msg_id,
                identifier = %identifier,
                error = %e,
                "Failed to sign message"
            );
            e
        })?;
        header.add(SIGNATURE_FIELD, &signature);
        if self.modifier.config.debug {
            debug!(
                msg_id = %self.msg_id,
                identifier = %identifier,
                domain = %self.modifier.config.domain,
                "Signed message"
            );
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
