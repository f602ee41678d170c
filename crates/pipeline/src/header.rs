//! Ordered RFC 5322 header section.
//!
//! [`HeaderSet`] keeps fields in message order (index `0` is the topmost
//! field), allows repeated names and compares names case-insensitively.
//! Raw field values are kept as bytes, folding and 8-bit content
//! included, with line breaks normalized to CRLF, so that the `simple`
//! DKIM header canonicalization sees exactly what goes on the wire.

use std::{
    borrow::Cow,
    io::{self, Write},
};

/// A single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    name: String,
    /// Everything after the colon, up to (not including) the final CRLF.
    raw_value: Vec<u8>,
}

impl HeaderField {
    /// Builds a field from a name and an unfolded value, the value is
    /// written after a single space following the colon.
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            raw_value: format!(" {value}").into_bytes(),
        }
    }

    pub(crate) fn from_raw(name: String, raw_value: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            raw_value: raw_value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the raw value exactly as stored (leading whitespace and
    /// folding line breaks included).
    pub fn raw_value(&self) -> &[u8] {
        &self.raw_value
    }

    /// Returns the value with surrounding whitespace trimmed, invalid
    /// UTF-8 replaced.
    pub fn value(&self) -> Cow<'_, str> {
        match String::from_utf8_lossy(&self.raw_value) {
            Cow::Borrowed(value) => Cow::Borrowed(value.trim()),
            Cow::Owned(value) => Cow::Owned(value.trim().to_string()),
        }
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered, possibly-repeating collection of header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    fields: Vec<HeaderField>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the header section of a raw message.
    ///
    /// Returns the parsed header and the offset of the first body byte.
    /// Parsing stops at the first empty line (which is consumed) or at the
    /// first line that is neither a field nor a continuation line, which is
    /// then treated as the start of the body.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let raw = b"Subject: Hello\r\n world\r\nTo: bob@example.com\r\n\r\nBody";
    /// let (header, offset) = mailstage_pipeline::HeaderSet::parse(raw);
    /// assert_eq!(header.len(), 2);
    /// assert_eq!(header.get("subject").as_deref(), Some("Hello\r\n world"));
    /// assert_eq!(&raw[offset..], b"Body");
    /// ```
    pub fn parse(raw: &[u8]) -> (Self, usize) {
        let mut fields: Vec<HeaderField> = Vec::new();
        let mut pos = 0;

        while pos < raw.len() {
            let (line, consumed) = match raw[pos..].iter().position(|&b| b == b'\n') {
                Some(index) => (&raw[pos..pos + index], index + 1),
                None => (&raw[pos..], raw.len() - pos),
            };
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if line.is_empty() {
                pos += consumed;
                break;
            }

            if line[0] == b' ' || line[0] == b'\t' {
                match fields.last_mut() {
                    Some(field) => {
                        field.raw_value.extend_from_slice(b"\r\n");
                        field.raw_value.extend_from_slice(line);
                        pos += consumed;
                        continue;
                    }
                    None => break,
                }
            }

            let Some(colon) = line.iter().position(|&b| b == b':') else {
                break;
            };
            let Some(name) = field_name(&line[..colon]) else {
                break;
            };
            fields.push(HeaderField::from_raw(name, &line[colon + 1..]));
            pos += consumed;
        }

        (Self { fields }, pos)
    }

    /// Returns the value of the topmost field matching `name`.
    pub fn get(&self, name: &str) -> Option<Cow<'_, str>> {
        self.fields
            .iter()
            .find(|field| field.is(name))
            .map(HeaderField::value)
    }

    /// Iterates over all fields matching `name`, top to bottom.
    pub fn fields_by_key<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a HeaderField> + 'n
    where
        'a: 'n,
    {
        self.fields.iter().filter(move |field| field.is(name))
    }

    /// Returns the number of fields matching `name`.
    pub fn count(&self, name: &str) -> usize {
        self.fields_by_key(name).count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.is(name))
    }

    /// Adds a field at the top of the header, the placement used for trace
    /// fields (`Return-Path`, `Delivered-To`) and signatures.
    pub fn add(&mut self, name: &str, value: &str) {
        self.add_field(HeaderField::new(name, value));
    }

    /// Adds an already built field at the top of the header, raw value
    /// untouched.
    pub fn add_field(&mut self, field: HeaderField) {
        self.fields.insert(0, field);
    }

    /// Returns an independent copy of this header.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serializes the header section, terminated by the empty separator line.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for field in &self.fields {
            writer.write_all(field.name.as_bytes())?;
            writer.write_all(b":")?;
            writer.write_all(&field.raw_value)?;
            writer.write_all(b"\r\n")?;
        }
        writer.write_all(b"\r\n")
    }

    /// Returns the serialized header section as bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let capacity = self
            .fields
            .iter()
            .map(|field| field.name.len() + 1 + field.raw_value.len() + 2)
            .sum::<usize>()
            + 2;
        let mut buffer = Vec::with_capacity(capacity);
        // writing into a Vec cannot fail
        let _ = self.write_to(&mut buffer);
        buffer
    }
}

/// Returns the field name when `raw` is printable ASCII, trailing
/// whitespace (obsolete `Name :` syntax) allowed.
fn field_name(raw: &[u8]) -> Option<String> {
    let trimmed = raw
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map(|end| &raw[..=end])?;
    if !trimmed.iter().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    String::from_utf8(raw.to_vec()).ok()
}
