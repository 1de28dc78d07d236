//! The RFC 5322 message body and `Message-Id` handling.
//!
//! A [`Message`] is an opaque byte sequence: headers, a blank line, a body.
//! This crate never parses or constructs MIME; it only needs to find the
//! header block (to read or insert a `Message-Id`) and the line separator
//! the caller already used.

use std::fmt;

use crate::Error;

/// A raw RFC 5322 message: headers, a blank line, and a body.
///
/// Constructed from whatever bytes the application already assembled.
/// `line_separator` is inferred once, from the first newline in the
/// message, and used consistently afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message(Vec<u8>);

/// The line separator a message uses, inferred from its first newline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineSeparator {
    /// `\n`
    Lf,
    /// `\r\n`
    CrLf,
}

impl LineSeparator {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            LineSeparator::Lf => b"\n",
            LineSeparator::CrLf => b"\r\n",
        }
    }
}

impl fmt::Display for LineSeparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineSeparator::Lf => f.write_str("LF"),
            LineSeparator::CrLf => f.write_str("CRLF"),
        }
    }
}

impl Message {
    /// Wraps already-formatted message bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Message(bytes)
    }

    /// Wraps a textual message, UTF-8 encoding it.
    pub fn from_text(text: impl Into<String>) -> Self {
        Message(text.into().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The line separator this message uses, inferred from its first
    /// newline: if it is preceded by a carriage return, CRLF; otherwise LF.
    /// An empty or single-line message defaults to LF.
    pub fn line_separator(&self) -> LineSeparator {
        match self.0.iter().position(|&b| b == b'\n') {
            Some(0) | None => LineSeparator::Lf,
            Some(nl) if self.0[nl - 1] == b'\r' => LineSeparator::CrLf,
            Some(_) => LineSeparator::Lf,
        }
    }

    /// The header block: everything before the first blank line (a doubled
    /// line separator). If there is no blank line, the whole message is
    /// treated as headers.
    pub fn header_block(&self) -> &[u8] {
        let sep = self.line_separator().as_bytes();
        let double = [sep, sep].concat();
        match find_subslice(&self.0, &double) {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Reads the `Message-Id` header from the header block, if any.
    ///
    /// Returns an error if the header is present but not bracketed in
    /// `<...>`, per the submission invariant.
    pub fn message_id(&self) -> Result<Option<String>, Error> {
        let sep = self.line_separator().as_bytes();
        for line in split_lines(self.header_block(), sep) {
            let Some(rest) = strip_header_name(line, b"Message-Id") else {
                continue;
            };
            let value = std::str::from_utf8(rest)
                .map_err(|_| Error::MalformedMessageId)?
                .trim();
            if !value.starts_with('<') || !value.ends_with('>') || value.len() < 2 {
                return Err(Error::MalformedMessageId);
            }
            return Ok(Some(value[1..value.len() - 1].to_string()));
        }
        Ok(None)
    }

    /// Prepends a `Message-Id: <id>` header line, using this message's own
    /// line separator.
    pub fn prepend_message_id(&mut self, id: &str) {
        let sep = self.line_separator().as_bytes();
        let mut prefixed = Vec::with_capacity(id.len() + sep.len() * 2 + self.0.len() + 16);
        prefixed.extend_from_slice(b"Message-Id: <");
        prefixed.extend_from_slice(id.as_bytes());
        prefixed.extend_from_slice(b">");
        prefixed.extend_from_slice(sep);
        prefixed.extend_from_slice(&self.0);
        self.0 = prefixed;
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::from_bytes(bytes)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::from_text(text)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_lines<'a>(block: &'a [u8], sep: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
    SplitOn { rest: Some(block), sep }
}

struct SplitOn<'a> {
    rest: Option<&'a [u8]>,
    sep: &'a [u8],
}

impl<'a> Iterator for SplitOn<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest?;
        match find_subslice(rest, self.sep) {
            Some(idx) => {
                let line = &rest[..idx];
                self.rest = Some(&rest[idx + self.sep.len()..]);
                Some(line)
            }
            None => {
                self.rest = None;
                Some(rest)
            }
        }
    }
}

/// If `line` is a header with name `name` (case-insensitive), returns the
/// value bytes after the colon, with leading whitespace untouched (the
/// caller trims).
fn strip_header_name<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= name.len() || line[name.len()] != b':' {
        return None;
    }
    let (candidate, rest) = line.split_at(name.len());
    if candidate.eq_ignore_ascii_case(name) {
        Some(&rest[1..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_lf_by_default() {
        let msg = Message::from_bytes(b"Subject: hi\n\nbody\n".to_vec());
        assert_eq!(msg.line_separator(), LineSeparator::Lf);
    }

    #[test]
    fn infers_crlf_when_first_newline_is_preceded_by_cr() {
        let msg = Message::from_bytes(b"Subject: hi\r\n\r\nbody\r\n".to_vec());
        assert_eq!(msg.line_separator(), LineSeparator::CrLf);
    }

    #[test]
    fn header_block_stops_at_blank_line() {
        let msg = Message::from_bytes(b"A: 1\nB: 2\n\nbody\n\nmore\n".to_vec());
        assert_eq!(msg.header_block(), b"A: 1\nB: 2");
    }

    #[test]
    fn message_id_extracted_and_brackets_stripped() {
        let msg = Message::from_bytes(b"Message-Id: <abc@example.com>\n\nbody\n".to_vec());
        assert_eq!(msg.message_id().unwrap(), Some("abc@example.com".into()));
    }

    #[test]
    fn message_id_missing_is_none() {
        let msg = Message::from_bytes(b"Subject: hi\n\nbody\n".to_vec());
        assert_eq!(msg.message_id().unwrap(), None);
    }

    #[test]
    fn message_id_without_brackets_is_malformed() {
        let msg = Message::from_bytes(b"Message-Id: abc@example.com\n\nbody\n".to_vec());
        assert!(msg.message_id().is_err());
    }

    #[test]
    fn prepend_message_id_uses_inferred_separator() {
        let mut msg = Message::from_bytes(b"Subject: hi\r\n\r\nbody\r\n".to_vec());
        msg.prepend_message_id("new@example.com");
        assert!(msg
            .as_bytes()
            .starts_with(b"Message-Id: <new@example.com>\r\n"));
    }
}
