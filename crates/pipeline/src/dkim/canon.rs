//! DKIM canonicalization algorithms (RFC 6376, section 3.4).

use std::{fmt::Display, str::FromStr};

use serde::Deserialize;

use crate::HeaderField;

use super::hash::Hasher;

/// Canonicalization mode, chosen independently for header and body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Canonicalization {
    /// Byte-exact, tolerates no modification in transit.
    Simple,
    /// Whitespace and header-name case normalizing.
    #[default]
    Relaxed,
}

impl Canonicalization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        }
    }

    /// Canonicalizes one header field, CRLF terminated.
    pub fn canonicalize_header(&self, field: &HeaderField) -> Vec<u8> {
        let mut out = Vec::with_capacity(field.name().len() + field.raw_value().len() + 3);
        match self {
            Canonicalization::Simple => {
                out.extend_from_slice(field.name().as_bytes());
                out.push(b':');
                out.extend_from_slice(field.raw_value());
            }
            Canonicalization::Relaxed => {
                let name = field.name().trim_end_matches([' ', '\t']);
                out.extend_from_slice(name.to_ascii_lowercase().as_bytes());
                out.push(b':');
                relaxed_header_value(field.raw_value(), &mut out);
            }
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl Display for Canonicalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Canonicalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Canonicalization::Simple),
            "relaxed" => Ok(Canonicalization::Relaxed),
            _ => Err(format!("unknown canonicalization: {s}")),
        }
    }
}

/// Unfolds, collapses whitespace runs into one space and trims both ends.
fn relaxed_header_value(raw: &[u8], out: &mut Vec<u8>) {
    let mut pending_space = false;
    let mut started = false;
    for &byte in raw {
        match byte {
            b'\r' | b'\n' => {}
            b' ' | b'\t' => pending_space = true,
            _ => {
                if pending_space && started {
                    out.push(b' ');
                }
                pending_space = false;
                started = true;
                out.push(byte);
            }
        }
    }
}

/// Streaming body canonicalizer feeding a body hasher.
///
/// Empty lines are held back until a non-empty line follows, so trailing
/// empty lines are never hashed. Bare LF line endings are treated as CRLF.
pub struct BodyCanonicalizer {
    canon: Canonicalization,
    hasher: Hasher,
    line: Vec<u8>,
    empty_lines: usize,
    written: bool,
}

impl BodyCanonicalizer {
    pub fn new(canon: Canonicalization, hasher: Hasher) -> Self {
        Self {
            canon,
            hasher,
            line: Vec::new(),
            empty_lines: 0,
            written: false,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == b'\n' {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                self.end_line();
            } else {
                self.line.push(byte);
            }
        }
    }

    /// Flushes the pending line and returns the body hash.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.line.is_empty() {
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            self.end_line();
        }
        if !self.written && self.canon == Canonicalization::Simple {
            self.hasher.update(b"\r\n");
        }
        self.hasher.finalize()
    }

    fn end_line(&mut self) {
        let line = std::mem::take(&mut self.line);
        let line = match self.canon {
            Canonicalization::Simple => line,
            Canonicalization::Relaxed => relaxed_body_line(&line),
        };

        if line.is_empty() {
            self.empty_lines += 1;
            return;
        }

        for _ in 0..self.empty_lines {
            self.hasher.update(b"\r\n");
        }
        self.empty_lines = 0;
        self.hasher.update(&line);
        self.hasher.update(b"\r\n");
        self.written = true;
    }
}

/// Collapses whitespace runs to one space and drops trailing whitespace.
fn relaxed_body_line(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut pending_space = false;
    for &byte in line {
        if byte == b' ' || byte == b'\t' {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(b' ');
            pending_space = false;
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::{dkim::HashAlgorithm, HeaderSet};

    fn body_hash(canon: Canonicalization, chunks: &[&[u8]]) -> Vec<u8> {
        let mut canonicalizer = BodyCanonicalizer::new(canon, HashAlgorithm::Sha256.hasher());
        for chunk in chunks {
            canonicalizer.update(chunk);
        }
        canonicalizer.finish()
    }

    fn sha256(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    #[test]
    fn test_header_simple() {
        let field = HeaderField::from_raw("SubJect".to_string(), " A  b\r\n\tc ".to_string());
        assert_eq!(
            Canonicalization::Simple.canonicalize_header(&field),
            b"SubJect: A  b\r\n\tc \r\n".to_vec()
        );
    }

    #[test]
    fn test_header_relaxed() {
        let field = HeaderField::from_raw("SubJect ".to_string(), " A  b\r\n\tc ".to_string());
        assert_eq!(
            Canonicalization::Relaxed.canonicalize_header(&field),
            b"subject:A b c\r\n".to_vec()
        );
    }

    #[test]
    fn test_header_relaxed_empty_value() {
        let field = HeaderField::from_raw("X-Empty".to_string(), "   ".to_string());
        assert_eq!(
            Canonicalization::Relaxed.canonicalize_header(&field),
            b"x-empty:\r\n".to_vec()
        );
    }

    #[test]
    fn test_rfc6376_example_header() {
        // RFC 6376 section 3.4.5
        let (header, _) = HeaderSet::parse(b"A: X\r\nB : Y\t\r\n\tZ  \r\n\r\n");
        let canonical = |canon: Canonicalization| {
            header
                .fields()
                .iter()
                .flat_map(|field| canon.canonicalize_header(field))
                .collect::<Vec<_>>()
        };
        assert_eq!(canonical(Canonicalization::Relaxed), b"a:X\r\nb:Y Z\r\n".to_vec());
        assert_eq!(
            canonical(Canonicalization::Simple),
            b"A: X\r\nB : Y\t\r\n\tZ  \r\n".to_vec()
        );
    }

    #[test]
    fn test_header_eight_bit_simple() {
        let (header, _) = HeaderSet::parse(b"Subject: caf\xe9\r\n\r\n");
        assert_eq!(
            Canonicalization::Simple.canonicalize_header(&header.fields()[0]),
            b"Subject: caf\xe9\r\n".to_vec()
        );
    }

    #[test]
    fn test_rfc6376_example_body() {
        // RFC 6376 section 3.4.5
        let body: &[u8] = b" C \r\nD \t E\r\n\r\n\r\n";
        assert_eq!(
            body_hash(Canonicalization::Relaxed, &[body]),
            sha256(b" C\r\nD E\r\n")
        );
        assert_eq!(
            body_hash(Canonicalization::Simple, &[body]),
            sha256(b" C \r\nD \t E\r\n")
        );
    }

    #[test]
    fn test_empty_body_hashes() {
        assert_eq!(
            STANDARD.encode(body_hash(Canonicalization::Simple, &[])),
            "frcCV1k9oG9oKj3dpUqdJg1PxRT2RSN/XKdLCPjaYaY="
        );
        assert_eq!(
            STANDARD.encode(body_hash(Canonicalization::Relaxed, &[])),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn test_only_empty_lines() {
        assert_eq!(
            body_hash(Canonicalization::Simple, &[b"\r\n\r\n\r\n"]),
            sha256(b"\r\n")
        );
        assert_eq!(
            body_hash(Canonicalization::Relaxed, &[b"  \r\n\t\r\n"]),
            sha256(b"")
        );
    }

    #[test]
    fn test_missing_final_crlf_added() {
        assert_eq!(
            body_hash(Canonicalization::Simple, &[b"Hello"]),
            sha256(b"Hello\r\n")
        );
        assert_eq!(
            body_hash(Canonicalization::Relaxed, &[b"Hello  "]),
            sha256(b"Hello\r\n")
        );
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let whole = body_hash(Canonicalization::Relaxed, &[b"a  b\r\n\r\nc\r\n\r\n"]);
        let split = body_hash(
            Canonicalization::Relaxed,
            &[b"a ", b" b\r", b"\n\r", b"\nc\r\n", b"\r\n"],
        );
        assert_eq!(whole, split);
    }

    #[test]
    fn test_bare_lf_treated_as_crlf() {
        assert_eq!(
            body_hash(Canonicalization::Simple, &[b"line one\nline two\n"]),
            sha256(b"line one\r\nline two\r\n")
        );
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "simple".parse::<Canonicalization>(),
            Ok(Canonicalization::Simple)
        );
        assert_eq!(
            "relaxed".parse::<Canonicalization>(),
            Ok(Canonicalization::Relaxed)
        );
        assert!("nofws".parse::<Canonicalization>().is_err());
        assert_eq!(Canonicalization::default(), Canonicalization::Relaxed);
    }
}
