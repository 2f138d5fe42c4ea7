use std::collections::HashMap;

use chrono::Utc;

/// An HTTP response under construction. Serialized once with [`build`].
///
/// `Connection: keep-alive` is advertised for client compatibility but the
/// server closes every connection after one response.
///
/// [`build`]: HttpResponse::build
pub struct HttpResponse {
    pub status_code: u16,
    version: &'static str,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new() -> Self {
        let mut headers = HashMap::new();

        headers.insert(
            "Date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        headers.insert("Server".to_string(), "webserv/1.0".to_string());
        headers.insert("Connection".to_string(), "keep-alive".to_string());

        Self {
            status_code: 200,
            version: "HTTP/1.1",
            headers,
            body: Vec::new(),
        }
    }

    pub fn with_status(status_code: u16) -> Self {
        let mut response = Self::new();
        response.status_code = status_code;
        response
    }

    pub fn set_status(&mut self, status_code: u16) {
        self.status_code = status_code;
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header("Content-Type", content_type);
    }

    /// Replaces the body and keeps `Content-Length` in sync with it.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        self.headers
            .insert("Content-Length".to_string(), self.body.len().to_string());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize to wire format: status line, headers, blank line, body.
    /// Header iteration order follows the map and is not observable.
    pub fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256 + self.body.len());

        bytes.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.version,
                self.status_code,
                reason_phrase(self.status_code)
            )
            .as_bytes(),
        );

        for (name, value) in &self.headers {
            bytes.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }

        bytes.extend_from_slice(b"\r\n");

        if !self.body.is_empty() {
            bytes.extend_from_slice(&self.body);
        }

        bytes
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

/// IANA reason phrase for a status code, `"Unknown Status"` otherwise.
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown Status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_wire(bytes: &[u8]) -> (String, HashMap<String, String>, Vec<u8>) {
        let split = bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header/body separator");

        let head = std::str::from_utf8(&bytes[..split]).unwrap();
        let body = bytes[split + 4..].to_vec();

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_string();

        let mut headers = HashMap::new();
        for line in lines {
            let (name, value) = line.split_once(": ").unwrap();
            headers.insert(name.to_string(), value.to_string());
        }

        (status_line, headers, body)
    }

    #[test]
    fn round_trips_status_headers_and_body() {
        let mut response = HttpResponse::with_status(201);
        response.set_content_type("text/plain");
        response.set_body("hello");

        let (status_line, headers, body) = parse_wire(&response.build());

        assert_eq!(status_line, "HTTP/1.1 201 Created");
        assert_eq!(headers.get("Content-Type").unwrap(), "text/plain");
        assert_eq!(headers.get("Content-Length").unwrap(), "5");
        assert_eq!(body, b"hello");
    }

    #[test]
    fn default_headers_are_present() {
        let (_, headers, _) = parse_wire(&HttpResponse::new().build());

        assert_eq!(headers.get("Server").unwrap(), "webserv/1.0");
        assert_eq!(headers.get("Connection").unwrap(), "keep-alive");
        assert!(headers.contains_key("Date"));
    }

    #[test]
    fn empty_body_is_omitted_from_the_wire() {
        let bytes = HttpResponse::with_status(301).build();
        assert!(bytes.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn set_body_updates_content_length() {
        let mut response = HttpResponse::new();
        response.set_body("hi");
        assert_eq!(response.get_header("Content-Length"), Some("2"));

        response.set_body("longer body");
        assert_eq!(response.get_header("Content-Length"), Some("11"));
    }

    #[test]
    fn reason_phrases_cover_the_standard_codes() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(204), "No Content");
        assert_eq!(reason_phrase(301), "Moved Permanently");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(413), "Payload Too Large");
        assert_eq!(reason_phrase(504), "Gateway Timeout");
        assert_eq!(reason_phrase(418), "Unknown Status");
        assert_eq!(reason_phrase(999), "Unknown Status");
    }
}
