//! Streaming DKIM signer (RFC 6376 section 5).
//!
//! The header is handed over as a [`HeaderSet`], the body is streamed
//! through [`io::Write`] and canonicalized on the fly, so bodies are never
//! held in memory twice. [`Signer::finish`] produces the complete value of
//! the `DKIM-Signature` field.

use std::{
    collections::HashMap,
    io::{self, Write},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{Error, HeaderField, HeaderSet, Result};

use super::{
    canon::{BodyCanonicalizer, Canonicalization},
    hash::HashAlgorithm,
    key::KeyMaterial,
};

/// Name of the signature header field.
pub const SIGNATURE_FIELD: &str = "DKIM-Signature";

/// Preferred maximum line length of the folded signature field.
const FOLD_WIDTH: usize = 76;

/// Parameters of one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOptions {
    /// Signing domain (`d=`).
    pub domain: String,
    /// Selector (`s=`).
    pub selector: String,
    /// Agent or user identifier (`i=`).
    pub identifier: Option<String>,
    pub hash: HashAlgorithm,
    pub header_canonicalization: Canonicalization,
    pub body_canonicalization: Canonicalization,
    /// Header field names to sign (`h=`), repeated names included.
    pub header_keys: Vec<String>,
    /// Signing time in seconds since the epoch (`t=`).
    pub timestamp: i64,
    /// Expiration time in seconds since the epoch (`x=`).
    pub expiration: Option<i64>,
}

impl SignOptions {
    /// Checks the options against each other and against the key.
    pub fn validate(&self, key: &KeyMaterial) -> Result<()> {
        check_tag_text("domain", &self.domain)?;
        check_tag_text("selector", &self.selector)?;

        if let Some(identifier) = &self.identifier {
            let Some((_, domain)) = identifier.rsplit_once('@') else {
                return Err(Error::signing_option(format!(
                    "identifier {identifier} lacks a domain part"
                )));
            };
            if !is_same_or_subdomain(domain, &self.domain) {
                return Err(Error::signing_option(format!(
                    "identifier domain {domain} is not {} or one of its subdomains",
                    self.domain
                )));
            }
        }

        if self.header_keys.is_empty() {
            return Err(Error::signing_option("no header fields to sign"));
        }
        if let Some(name) = self
            .header_keys
            .iter()
            .find(|name| name.is_empty() || name.contains([':', ';', ' ', '\t']))
        {
            return Err(Error::signing_option(format!(
                "invalid header field name: {name:?}"
            )));
        }

        if let Some(expiration) = self.expiration {
            if expiration <= self.timestamp {
                return Err(Error::signing_option(
                    "expiration must be later than the signing time",
                ));
            }
        }

        if !key.supports(self.hash) {
            return Err(Error::signing_option(format!(
                "{} keys cannot be used with {}",
                key.key_type(),
                self.hash
            )));
        }
        Ok(())
    }
}

fn check_tag_text(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::signing_option(format!("{what} is empty")));
    }
    if value.contains(';') || value.chars().any(|c| c.is_ascii_whitespace()) {
        return Err(Error::signing_option(format!("invalid {what}: {value:?}")));
    }
    Ok(())
}

fn is_same_or_subdomain(domain: &str, parent: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    let parent = parent.to_ascii_lowercase();
    domain == parent || domain.ends_with(&format!(".{parent}"))
}

/// Streaming signer for one message.
pub struct Signer<'k> {
    options: SignOptions,
    key: &'k KeyMaterial,
    header: Option<HeaderSet>,
    body: BodyCanonicalizer,
}

impl<'k> Signer<'k> {
    /// Validates `options` and prepares a signer.
    pub fn new(options: SignOptions, key: &'k KeyMaterial) -> Result<Self> {
        options.validate(key)?;
        let body = BodyCanonicalizer::new(options.body_canonicalization, options.hash.hasher());
        Ok(Self {
            options,
            key,
            header: None,
            body,
        })
    }

    /// Hands over the message header, body bytes are written afterwards.
    pub fn write_header(&mut self, header: &HeaderSet) {
        self.header = Some(header.copy());
    }

    /// Completes the signature and returns the `DKIM-Signature` value.
    pub fn finish(self) -> Result<String> {
        let header = self
            .header
            .ok_or_else(|| Error::stream("message header was not written to the signer"))?;
        let body_hash = STANDARD.encode(self.body.finish());

        let unsigned = format_signature(&self.options, self.key.key_type(), &body_hash);

        let canon = self.options.header_canonicalization;
        let mut hasher = self.options.hash.hasher();
        for field in select_fields(&header, &self.options.header_keys) {
            hasher.update(&canon.canonicalize_header(field));
        }
        let own = canon.canonicalize_header(&HeaderField::new(SIGNATURE_FIELD, &unsigned));
        hasher.update(own.strip_suffix(b"\r\n").unwrap_or(&own));

        let signature = self.key.sign(self.options.hash, &hasher.finalize())?;
        Ok(unsigned + &STANDARD.encode(signature))
    }
}

impl Write for Signer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Picks the field instance signed by each name of `keys`.
///
/// Repeated names consume instances from the bottom of the header up,
/// names without a remaining instance select nothing.
pub fn select_fields<'h>(header: &'h HeaderSet, keys: &[String]) -> Vec<&'h HeaderField> {
    let mut used: HashMap<String, usize> = HashMap::new();
    let mut selected = Vec::with_capacity(keys.len());
    for key in keys {
        let consumed = used.entry(key.to_ascii_lowercase()).or_insert(0);
        let instances = header
            .fields()
            .iter()
            .filter(|field| field.name().eq_ignore_ascii_case(key))
            .collect::<Vec<_>>();
        if *consumed < instances.len() {
            selected.push(instances[instances.len() - 1 - *consumed]);
        }
        *consumed += 1;
    }
    selected
}

/// Formats the signature value with an empty `b=` tag, folded.
fn format_signature(options: &SignOptions, key_type: &str, body_hash: &str) -> String {
    let mut tags = vec![
        "v=1".to_string(),
        format!("a={key_type}-{}", options.hash),
        format!(
            "c={}/{}",
            options.header_canonicalization, options.body_canonicalization
        ),
        format!("d={}", options.domain),
        format!("s={}", options.selector),
        format!("t={}", options.timestamp),
    ];
    if let Some(expiration) = options.expiration {
        tags.push(format!("x={expiration}"));
    }
    if let Some(identifier) = &options.identifier {
        tags.push(format!("i={}", dkim_quoted_printable(identifier)));
    }

    let mut folder = Folder::new(SIGNATURE_FIELD.len() + 2);
    for tag in &tags {
        folder.push_tag(&format!("{tag};"));
    }
    let names = options.header_keys.join(":");
    folder.push_list(&format!("h={names};"));
    folder.push_tag(&format!("bh={body_hash};"));
    folder.push_tag("b=");
    folder.out
}

struct Folder {
    out: String,
    line_len: usize,
}

impl Folder {
    fn new(line_len: usize) -> Self {
        Self {
            out: String::new(),
            line_len,
        }
    }

    /// Appends a whole tag, breaking the line before it when it would
    /// overflow.
    fn push_tag(&mut self, tag: &str) {
        if !self.out.is_empty() {
            if self.line_len + 1 + tag.len() > FOLD_WIDTH {
                self.out.push_str("\r\n ");
                self.line_len = 1;
            } else {
                self.out.push(' ');
                self.line_len += 1;
            }
        }
        self.out.push_str(tag);
        self.line_len += tag.len();
    }

    /// Appends a colon separated tag, allowed to break after any colon.
    fn push_list(&mut self, tag: &str) {
        let mut pieces = tag.split_inclusive(':');
        let Some(first) = pieces.next() else {
            return;
        };
        self.push_tag(first);
        for piece in pieces {
            if self.line_len + piece.len() > FOLD_WIDTH {
                self.out.push_str("\r\n ");
                self.line_len = 1;
            }
            self.out.push_str(piece);
            self.line_len += piece.len();
        }
    }
}

/// Encodes a value as dkim-quoted-printable (RFC 6376 section 2.11).
pub fn dkim_quoted_printable(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            0x21..=0x3A | 0x3C | 0x3E..=0x7E => out.push(byte as char),
            _ => out.push_str(&format!("={byte:02X}")),
        }
    }
    out
}

/// Splits a tag-list value into `(tag, value)` pairs with all folding
/// whitespace removed.
pub fn parse_tags(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|pair| {
            let (tag, value) = pair.split_once('=')?;
            let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
            Some((strip(tag), strip(value)))
        })
        .collect()
}
