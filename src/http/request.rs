use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::http::method::Method;

/// Protocol versions the parser accepts. Anything else aborts the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Http10 => f.write_str("HTTP/1.0"),
            Version::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}

/// Fatal parse failures. The connection is closed without a response.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("unsupported HTTP version: {0:?}")]
    UnsupportedVersion(String),
}

/// An HTTP request assembled incrementally from socket reads.
///
/// Bytes arrive in arbitrary chunks; [`HttpRequest::feed`] accumulates them
/// and reports completion. Feeding the same request in any partition yields
/// identical fields and the same completion point relative to byte count.
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub version: Version,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub is_multipart: bool,
    pub boundary: String,

    raw: Vec<u8>,
    headers_complete: bool,
    complete: bool,
    body_start: usize,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            method: Method::Unknown,
            url: String::new(),
            version: Version::Http11,
            headers: HashMap::new(),
            body: Vec::new(),
            is_multipart: false,
            boundary: String::new(),
            raw: Vec::new(),
            headers_complete: false,
            complete: false,
            body_start: 0,
        }
    }

    /// Append a chunk of bytes and advance the state machine.
    ///
    /// Returns `Ok(true)` once the request is complete. Bytes already
    /// classified as headers are never rescanned.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<bool, ParseError> {
        self.raw.extend_from_slice(bytes);

        if !self.headers_complete {
            let header_end = match find_bytes(&self.raw, b"\r\n\r\n", 0) {
                Some(pos) => pos,
                None => return Ok(false),
            };

            self.parse_header_section(header_end)?;
            self.headers_complete = true;
            self.body_start = header_end + 4;
        }

        if !self.complete {
            self.check_body_complete();
        }

        Ok(self.complete)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Case-insensitive header lookup; keys are stored lowercased.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(&key.to_ascii_lowercase())
    }

    fn parse_header_section(&mut self, header_end: usize) -> Result<(), ParseError> {
        let text = std::str::from_utf8(&self.raw[..header_end])
            .map_err(|_| ParseError::MalformedRequestLine("non-UTF-8 header section".into()))?
            .to_owned();

        let (request_line, header_block) = match text.split_once("\r\n") {
            Some(parts) => parts,
            None => (text.as_str(), ""),
        };

        self.parse_request_line(request_line)?;

        for line in header_block.split("\r\n") {
            if line.is_empty() {
                continue;
            }

            // Lines without a colon are skipped silently.
            if let Some((key, value)) = line.split_once(':') {
                let value = value
                    .trim_start_matches(' ')
                    .trim_end_matches(|c| c == ' ' || c == '\t' || c == '\r' || c == '\n');
                self.headers.insert(key.to_ascii_lowercase(), value.to_string());
            }
        }

        if let Some(content_type) = self.get_header("content-type") {
            if content_type.contains("multipart/form-data") {
                if let Some(pos) = content_type.find("boundary=") {
                    self.boundary = content_type[pos + "boundary=".len()..].to_string();
                    self.is_multipart = true;
                }
            }
        }

        Ok(())
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut tokens = line.split_whitespace();

        let method = tokens
            .next()
            .ok_or_else(|| ParseError::MalformedRequestLine(line.to_string()))?;
        let url = tokens
            .next()
            .ok_or_else(|| ParseError::MalformedRequestLine(line.to_string()))?;
        let version = tokens
            .next()
            .ok_or_else(|| ParseError::MalformedRequestLine(line.to_string()))?;

        self.method = Method::from_token(method);
        self.url = url.to_string();
        self.version = match version {
            "HTTP/1.1" => Version::Http11,
            "HTTP/1.0" => Version::Http10,
            other => return Err(ParseError::UnsupportedVersion(other.to_string())),
        };

        Ok(())
    }

    fn check_body_complete(&mut self) {
        match self.method {
            Method::Post => {
                if let Some(expected) = self.content_length() {
                    if self.raw.len() - self.body_start >= expected {
                        // Exact slice; bytes beyond Content-Length are discarded.
                        self.body =
                            self.raw[self.body_start..self.body_start + expected].to_vec();
                        self.complete = true;
                    }
                } else if self.is_multipart {
                    let terminator = format!("--{}--\r\n", self.boundary);
                    if find_bytes(&self.raw, terminator.as_bytes(), 0).is_some() {
                        self.body = self.raw[self.body_start..].to_vec();
                        self.complete = true;
                    }
                } else {
                    self.complete = true;
                }
            }
            // GET, DELETE and unrecognized methods carry no body.
            _ => self.complete = true,
        }
    }

    fn content_length(&self) -> Option<usize> {
        self.get_header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() || start > haystack.len() {
        return None;
    }

    haystack[start..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + start)
}
