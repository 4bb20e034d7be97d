//! ESL wire framing: frame boundaries, header lines, write normalization
//!
//! A frame is a block of `Key: Value` lines closed by an empty line, followed
//! by exactly `Content-Length` body bytes when that header is present and
//! non-zero. Nothing terminates the body itself.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;

use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    constants::{HEADER_TERMINATOR, LINE_TERMINATOR, MAX_MESSAGE_SIZE},
    error::{EslError, EslResult},
    headers::{ContentType, Header},
};

/// One protocol unit as read off the socket.
///
/// Header lines are stored trimmed and `\n`-terminated, so a frame read from a
/// peer that uses `\r\n` compares equal to one that uses `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Vec<u8>,
    header_len: usize,
}

impl Frame {
    /// Wrap bytes that already hold a complete frame.
    ///
    /// The header block ends at the first blank line; everything after it is
    /// the body. Bytes without a blank line are treated as headers only.
    pub fn from_bytes(raw: impl Into<Vec<u8>>) -> Self {
        let raw = raw.into();
        let header_len = find_subsequence(&raw, HEADER_TERMINATOR.as_bytes())
            .map(|pos| pos + HEADER_TERMINATOR.len())
            .unwrap_or(raw.len());
        Self { raw, header_len }
    }

    /// Full frame bytes: header block, blank line, body.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Consume the frame, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    /// Header block including the terminating blank line.
    pub fn header_block(&self) -> &str {
        std::str::from_utf8(&self.raw[..self.header_len]).unwrap_or_default()
    }

    /// Body bytes (empty when no `Content-Length` was declared).
    pub fn body(&self) -> &[u8] {
        &self.raw[self.header_len..]
    }

    /// Header lines in wire order. Duplicate keys are kept; lines without a
    /// colon (such as an echoed command verb) are skipped.
    pub fn headers(&self) -> Vec<(&str, &str)> {
        self.header_block()
            .lines()
            .filter_map(split_header_line)
            .collect()
    }

    /// First value for `name` (ASCII case-insensitive), not percent-decoded.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.header_block()
            .lines()
            .filter_map(split_header_line)
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Parsed `Content-Type`, if present and known.
    pub fn content_type(&self) -> Option<ContentType> {
        self.header(Header::ContentType)?
            .parse()
            .ok()
    }

    /// `true` if `needle` occurs anywhere in the frame bytes.
    pub fn contains(&self, needle: &str) -> bool {
        find_subsequence(&self.raw, needle.as_bytes()).is_some()
    }

    /// `true` for a frame with no header lines at all.
    pub fn is_empty(&self) -> bool {
        self.headers()
            .is_empty()
            && self
                .body()
                .is_empty()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Split `Key: Value` at the first colon, trimming both sides.
pub(crate) fn split_header_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// Percent-decode a header value, falling back to the raw text on bad sequences.
pub(crate) fn decode_header_value(raw_value: &str) -> String {
    percent_decode_str(raw_value)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw_value.to_string())
}

/// Parse a header block into a map with percent-decoded values.
///
/// Later duplicates overwrite earlier ones. A non-blank line without a colon
/// is a decode error.
pub(crate) fn parse_headers(block: &str) -> EslResult<HashMap<String, String>> {
    let mut headers = HashMap::new();

    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match split_header_line(line) {
            Some((key, value)) => {
                headers.insert(key.to_string(), decode_header_value(value));
            }
            None => {
                return Err(EslError::decode(format!("invalid header line: {}", line)));
            }
        }
    }

    Ok(headers)
}

fn parse_content_length(value: &str) -> EslResult<usize> {
    let length: usize = value
        .trim()
        .parse()
        .map_err(|_| EslError::frame(format!("invalid Content-Length: {}", value)))?;

    if length > MAX_MESSAGE_SIZE {
        return Err(EslError::frame(format!(
            "Content-Length {} exceeds limit {}",
            length, MAX_MESSAGE_SIZE
        )));
    }
    Ok(length)
}

/// Read exactly one frame.
///
/// The first `Content-Length` header decides the body size. EOF before the
/// blank line, or before the full body, is an error.
pub async fn read_frame<R>(reader: &mut R) -> EslResult<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let mut line = Vec::new();
    let mut content_length: Option<usize> = None;

    loop {
        line.clear();
        // at most the remaining header budget plus a line ending
        let budget = (MAX_MESSAGE_SIZE + 2 - raw.len()) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| EslError::frame_io("read header failed", e))?;
        if n == 0 {
            return Err(EslError::frame_io(
                "read header failed",
                io::Error::from(io::ErrorKind::UnexpectedEof),
            ));
        }
        if n as u64 == budget && line.last() != Some(&b'\n') {
            return Err(EslError::frame("header line exceeds size limit"));
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        raw.extend_from_slice(text.as_bytes());
        raw.extend_from_slice(LINE_TERMINATOR.as_bytes());

        if text.is_empty() {
            break;
        }

        if raw.len() > MAX_MESSAGE_SIZE {
            return Err(EslError::frame("header block exceeds size limit"));
        }

        if content_length.is_none() {
            if let Some((key, value)) = split_header_line(text) {
                if key.eq_ignore_ascii_case(Header::ContentLength.as_str()) {
                    content_length = Some(parse_content_length(value)?);
                }
            }
        }
    }

    let header_len = raw.len();
    if let Some(length) = content_length.filter(|n| *n > 0) {
        raw.resize(header_len + length, 0);
        reader
            .read_exact(&mut raw[header_len..])
            .await
            .map_err(|e| EslError::frame_io("read body failed", e))?;
    }

    Ok(Frame { raw, header_len })
}

/// Ensure `payload` ends with a blank line.
pub fn terminate(payload: &[u8]) -> Cow<'_, [u8]> {
    if payload.ends_with(HEADER_TERMINATOR.as_bytes()) {
        Cow::Borrowed(payload)
    } else if payload.ends_with(LINE_TERMINATOR.as_bytes()) {
        let mut owned = payload.to_vec();
        owned.extend_from_slice(LINE_TERMINATOR.as_bytes());
        Cow::Owned(owned)
    } else {
        let mut owned = payload.to_vec();
        owned.extend_from_slice(HEADER_TERMINATOR.as_bytes());
        Cow::Owned(owned)
    }
}

/// Write one frame, appending the terminator if missing.
///
/// `write_all` retries partial writes until every byte is sent.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> EslResult<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = terminate(payload);
    writer
        .write_all(&payload)
        .await
        .map_err(|e| EslError::frame_io("write failed", e))?;
    writer
        .flush()
        .await
        .map_err(|e| EslError::frame_io("flush failed", e))?;
    Ok(())
}
