//! Mapping of mail addresses to storage accounts.

use std::fmt::{self, Display};

use crate::{Error, Result, SmtpReply};

/// A resolved storage account name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountIdentity(String);

impl AccountIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for AccountIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolves `address` to the account that stores its mail.
///
/// With `per_domain` the whole address is the account name and a domain
/// part is required, otherwise only the local part is kept. Both are
/// case-folded. Failures are recipient errors carrying a `501 5.1.3`
/// reply.
///
/// # Examples
///
/// ```rust
/// use mailstage_pipeline::delivery::resolve;
///
/// assert_eq!(resolve("Bob@Example.org", true).unwrap().as_str(), "bob@example.org");
/// assert_eq!(resolve("Bob@Example.org", false).unwrap().as_str(), "bob");
/// assert!(resolve("bob", true).is_err());
/// ```
pub fn resolve(address: &str, per_domain: bool) -> Result<AccountIdentity> {
    let invalid = |detail: &str| Error::recipient(SmtpReply::invalid_recipient(detail));

    if per_domain {
        let Some((local, domain)) = address.split_once('@') else {
            return Err(invalid("domain-qualified account required"));
        };
        if local.is_empty() || domain.is_empty() {
            return Err(invalid("empty local part or domain"));
        }
        return Ok(AccountIdentity(address.to_lowercase()));
    }

    if address.is_empty() {
        return Err(invalid("empty address"));
    }
    let local = match address.split_once('@') {
        Some((local, domain)) => {
            if local.is_empty() || domain.is_empty() {
                return Err(invalid("empty local part or domain"));
            }
            local
        }
        None => address,
    };
    Ok(AccountIdentity(local.to_lowercase()))
}

/// Checks a login name against the domain authentication policy and
/// returns the account to authenticate against.
///
/// With `per_domain` the name must be `local@domain` with exactly one `@`
/// and the account keeps the domain. Otherwise the account is the local
/// part. When `allowed_domains` is non-empty, a present domain has to be
/// one of them, compared case-insensitively.
pub fn check_domain_auth(
    username: &str,
    per_domain: bool,
    allowed_domains: &[String],
) -> Option<AccountIdentity> {
    let (local, domain) = match username.split_once('@') {
        Some((local, domain)) => (local, domain),
        None => (username, ""),
    };
    if local.is_empty() || domain.contains('@') {
        return None;
    }
    if per_domain && domain.is_empty() {
        return None;
    }
    if !domain.is_empty()
        && !allowed_domains.is_empty()
        && !allowed_domains
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(domain))
    {
        return None;
    }

    let account = if per_domain { username } else { local };
    Some(AccountIdentity(account.to_lowercase()))
}
