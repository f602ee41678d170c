//! Signing key loading and generation.
//!
//! Keys live in PKCS#8 PEM files at a path derived from a template. A
//! missing key is generated on first start, written with owner-only
//! permissions, and accompanied by a `.dns` file holding the TXT record
//! value to publish under `<selector>._domainkey.<domain>`.

use std::{
    ffi::OsString,
    fmt::{self, Debug, Display},
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signer as _, SigningKey};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    traits::PublicKeyParts,
    RsaPrivateKey,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{Error, Result};

use super::hash::HashAlgorithm;

/// Algorithm used when a new key has to be generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa4096,
    #[default]
    Rsa2048,
    Ed25519,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa4096 => "rsa4096",
            KeyAlgorithm::Rsa2048 => "rsa2048",
            KeyAlgorithm::Ed25519 => "ed25519",
        }
    }
}

impl Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsa4096" => Ok(KeyAlgorithm::Rsa4096),
            "rsa2048" => Ok(KeyAlgorithm::Rsa2048),
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            _ => Err(Error::key(format!("unsupported key algorithm: {s}"))),
        }
    }
}

/// A private signing key.
pub enum KeyMaterial {
    Rsa(RsaPrivateKey),
    Ed25519(SigningKey),
}

impl KeyMaterial {
    /// Generates a fresh key.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        let mut rng = rand::thread_rng();
        match algorithm {
            KeyAlgorithm::Rsa4096 => RsaPrivateKey::new(&mut rng, 4096)
                .map(KeyMaterial::Rsa)
                .map_err(|e| Error::key(format!("failed to generate RSA key: {e}"))),
            KeyAlgorithm::Rsa2048 => RsaPrivateKey::new(&mut rng, 2048)
                .map(KeyMaterial::Rsa)
                .map_err(|e| Error::key(format!("failed to generate RSA key: {e}"))),
            KeyAlgorithm::Ed25519 => Ok(KeyMaterial::Ed25519(SigningKey::generate(&mut rng))),
        }
    }

    /// Parses a PEM encoded key, PKCS#8 (RSA or Ed25519) or PKCS#1 (RSA).
    pub fn from_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(KeyMaterial::Rsa(key));
        }
        if let Ok(key) = SigningKey::from_pkcs8_pem(pem) {
            return Ok(KeyMaterial::Ed25519(key));
        }
        RsaPrivateKey::from_pkcs1_pem(pem)
            .map(KeyMaterial::Rsa)
            .map_err(|e| Error::key(format!("unrecognized private key: {e}")))
    }

    /// Encodes the key as PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<String> {
        let pem = match self {
            KeyMaterial::Rsa(key) => key.to_pkcs8_pem(LineEnding::LF),
            KeyMaterial::Ed25519(key) => key.to_pkcs8_pem(LineEnding::LF),
        }
        .map_err(|e| Error::key(format!("failed to encode private key: {e}")))?;
        Ok(pem.as_str().to_owned())
    }

    /// Returns the key type as used in the `a=` and `k=` tags.
    pub fn key_type(&self) -> &'static str {
        match self {
            KeyMaterial::Rsa(_) => "rsa",
            KeyMaterial::Ed25519(_) => "ed25519",
        }
    }

    /// Returns the base64 public key for the `p=` tag of the DNS record.
    pub fn public_key_base64(&self) -> Result<String> {
        match self {
            KeyMaterial::Rsa(key) => {
                let der = key
                    .to_public_key()
                    .to_public_key_der()
                    .map_err(|e| Error::key(format!("failed to encode public key: {e}")))?;
                Ok(STANDARD.encode(der.as_bytes()))
            }
            KeyMaterial::Ed25519(key) => Ok(STANDARD.encode(key.verifying_key().to_bytes())),
        }
    }

    /// Returns the TXT record value to publish for this key.
    pub fn dns_record(&self) -> Result<String> {
        Ok(format!(
            "v=DKIM1; k={}; p={}",
            self.key_type(),
            self.public_key_base64()?
        ))
    }

    /// Checks that `hash` can be combined with this key type.
    pub fn supports(&self, hash: HashAlgorithm) -> bool {
        match self {
            KeyMaterial::Rsa(_) => true,
            KeyMaterial::Ed25519(_) => hash == HashAlgorithm::Sha256,
        }
    }

    /// Signs an already computed digest.
    pub(crate) fn sign(&self, hash: HashAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
        match self {
            KeyMaterial::Rsa(key) => key
                .sign(hash.pkcs1v15(), digest)
                .map_err(|e| Error::signing_option(format!("RSA signing failed: {e}"))),
            KeyMaterial::Ed25519(key) => Ok(key.sign(digest).to_bytes().to_vec()),
        }
    }
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Rsa(key) => write!(f, "KeyMaterial::Rsa({} bits)", key.size() * 8),
            KeyMaterial::Ed25519(_) => write!(f, "KeyMaterial::Ed25519"),
        }
    }
}

/// Expands the `{domain}` and `{selector}` tokens of a key path template.
///
/// # Examples
///
/// ```rust
/// let path = mailstage_pipeline::dkim::key_path("dkim_keys/{domain}_{selector}.key", "example.org", "default");
/// assert_eq!(path, std::path::PathBuf::from("dkim_keys/example.org_default.key"));
/// ```
pub fn key_path(template: &str, domain: &str, selector: &str) -> PathBuf {
    PathBuf::from(
        template
            .replace("{domain}", domain)
            .replace("{selector}", selector),
    )
}

/// Returns the path of the DNS record file written next to a key.
pub fn dns_record_path(key_path: &Path) -> PathBuf {
    let mut path = OsString::from(key_path.as_os_str());
    path.push(".dns");
    PathBuf::from(path)
}

/// Loads the key stored at `path`, generating and persisting one with
/// `algorithm` if the file does not exist.
pub fn load_or_generate(
    domain: &str,
    selector: &str,
    path: &Path,
    algorithm: KeyAlgorithm,
) -> Result<KeyMaterial> {
    match fs::read_to_string(path) {
        Ok(pem) => {
            let key = KeyMaterial::from_pem(&pem)
                .map_err(|e| Error::key(format!("{}: {}", path.display(), e.message())))?;
            info!(
                domain = %domain,
                selector = %selector,
                path = %path.display(),
                key_type = key.key_type(),
                "Loaded DKIM key"
            );
            Ok(key)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let key = KeyMaterial::generate(algorithm)?;
            write_key(path, &key)?;
            warn!(
                domain = %domain,
                selector = %selector,
                path = %path.display(),
                algorithm = %algorithm,
                "Generated new DKIM key, publish the record from the .dns file"
            );
            Ok(key)
        }
        Err(e) => Err(Error::key(format!(
            "failed to read key {}: {e}",
            path.display()
        ))),
    }
}

fn write_key(path: &Path, key: &KeyMaterial) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            Error::key(format!(
                "failed to create key directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let pem = key.to_pem()?;
    let write_err = |e: io::Error| Error::key(format!("failed to write key {}: {e}", path.display()));
    let mut file = open_key_file_for_write(path).map_err(write_err)?;
    file.write_all(pem.as_bytes()).map_err(write_err)?;
    file.flush().map_err(write_err)?;

    let dns_path = dns_record_path(path);
    fs::write(&dns_path, format!("{}\n", key.dns_record()?)).map_err(|e| {
        Error::key(format!(
            "failed to write DNS record {}: {e}",
            dns_path.display()
        ))
    })?;
    Ok(())
}

/// Opens the key file for writing, on Unix with mode 0o600.
fn open_key_file_for_write(path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::{fs::OpenOptions, os::unix::fs::OpenOptionsExt};
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .mode(0o600)
            .open(path)
    }
    #[cfg(not(unix))]
    {
        File::create(path)
    }
}
