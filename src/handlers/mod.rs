//! Method handlers: static file service with optional directory listing,
//! uploads and deletions under per-route upload directories, and the CGI
//! hand-off. A `RequestHandler` is a stateless dispatcher borrowing the
//! shared configuration, constructed per request.

pub mod cgi;
pub mod pages;

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use chrono::{DateTime, Local, Utc};
use log::{error, info};
use thiserror::Error;

use crate::config::{Config, Route};
use crate::handlers::cgi::CgiHandler;
use crate::http::request::find_bytes;
use crate::http::response::reason_phrase;
use crate::http::{HttpRequest, HttpResponse, Method};

#[derive(Debug, Error)]
enum HandlerError {
    #[error("attempt to access restricted files")]
    PathTraversal,

    #[error("invalid percent-encoding in URL")]
    UrlDecode,

    #[error("invalid Content-Length header")]
    BadContentLength,

    #[error("multipart decoding failed: {0}")]
    Multipart(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct RequestHandler<'a> {
    config: &'a Config,
}

impl<'a> RequestHandler<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Dispatch a completed request to its method handler. Unrecognized
    /// methods get a bare 405.
    pub fn handle(&self, request: &HttpRequest, port: u16) -> HttpResponse {
        match request.method {
            Method::Get => self.handle_get(request, port),
            Method::Post => self.handle_post(request, port),
            Method::Delete => self.handle_delete(request, port),
            Method::Unknown => HttpResponse::with_status(405),
        }
    }

    fn handle_get(&self, request: &HttpRequest, port: u16) -> HttpResponse {
        match self.get_inner(request, port) {
            Ok(response) => response,
            Err(e) => {
                error!("GET {} failed: {e}", request.url);
                self.error_page(500)
            }
        }
    }

    fn get_inner(&self, request: &HttpRequest, port: u16) -> Result<HttpResponse, HandlerError> {
        let decoded_url = url_decode(&request.url)?;

        let route = match self.config.find_route(port, &decoded_url) {
            Some(route) => route,
            None => {
                error!("no route found for URL {} on port {port}", request.url);
                return Ok(HttpResponse::with_status(403));
            }
        };

        if route.should_redirect() {
            info!("redirecting {} to {}", request.url, route.redirect_url);
            let mut response = HttpResponse::with_status(301);
            response.set_header("Location", &route.redirect_url);
            return Ok(response);
        }

        // The full decoded URL is appended to the route root; the matched
        // prefix is not stripped.
        let mut fs_path = format!("{}{}", route.filesystem_root, decoded_url);

        if fs_path.contains("..") {
            return Err(HandlerError::PathTraversal);
        }

        if let Some(response) = self.try_cgi(route, &fs_path, request) {
            return Ok(response);
        }

        if Path::new(&fs_path).is_dir() {
            let mut response = HttpResponse::new();
            match self.resolve_directory(route, &fs_path, &request.url, &mut response)? {
                Some(index_path) => fs_path = index_path,
                None => return Ok(response),
            }
        }

        if !Path::new(&fs_path).exists() {
            error!("file does not exist: {fs_path}");
            return Ok(self.error_page(404));
        }

        let mut response = HttpResponse::new();
        response.set_content_type(mime_type(&fs_path));
        response.set_body(fs::read(&fs_path)?);
        response.set_status(200);
        Ok(response)
    }

    /// Runs the CGI executor when the route has a handler for the script's
    /// extension; `None` means the path is not a CGI target.
    fn try_cgi(&self, route: &Route, fs_path: &str, request: &HttpRequest) -> Option<HttpResponse> {
        let script_path = match fs_path.find('?') {
            Some(pos) => &fs_path[..pos],
            None => fs_path,
        };

        let extension = &script_path[script_path.rfind('.')?..];
        let interpreter = route.cgi_handlers.get(extension)?;

        Some(
            match CgiHandler::new(script_path, interpreter).handle(request) {
                Ok(response) => response,
                Err(e) => {
                    error!("CGI execution failed: {e} (script: {script_path})");
                    self.error_page(500)
                }
            },
        )
    }

    /// Resolve a directory target to an index file, or fill in the response
    /// (listing, 403 or 500) and return `None`.
    fn resolve_directory(
        &self,
        route: &Route,
        directory_path: &str,
        raw_url: &str,
        response: &mut HttpResponse,
    ) -> Result<Option<String>, HandlerError> {
        if !route.directory_listing {
            if let Some(index_path) = self.existing_index(route, directory_path) {
                return Ok(Some(index_path));
            }

            error!("no index file found and directory listing is disabled for {directory_path}");
            self.serve_error_page(response, 403);
            return Ok(None);
        }

        if !Path::new(directory_path).exists() {
            info!("creating directory {directory_path}");
            if let Err(e) = fs::create_dir_all(directory_path) {
                error!("failed to create directory {directory_path}: {e}");
                self.serve_error_page(response, 500);
                return Ok(None);
            }
        }

        if let Some(index_path) = self.existing_index(route, directory_path) {
            return Ok(Some(index_path));
        }

        match self.directory_listing(directory_path, raw_url) {
            Ok(html) => {
                response.set_content_type("text/html");
                response.set_body(html);
                response.set_status(200);
            }
            Err(e) => {
                error!("failed to create directory listing for {directory_path}: {e}");
                self.serve_error_page(response, 500);
            }
        }

        Ok(None)
    }

    fn existing_index(&self, route: &Route, directory_path: &str) -> Option<String> {
        if !route.index_file.is_empty() {
            let index_path = format!("{directory_path}/{}", route.index_file);
            if Path::new(&index_path).exists() {
                return Some(index_path);
            }
        }

        let fallback = format!("{directory_path}/index.html");
        if Path::new(&fallback).exists() {
            return Some(fallback);
        }

        None
    }

    fn directory_listing(&self, directory_path: &str, url: &str) -> Result<String, HandlerError> {
        let mut html = pages::listing_header(url);

        for entry in fs::read_dir(directory_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };

            let is_dir = meta.is_dir();
            let display_name = if is_dir { format!("{name}/") } else { name.clone() };
            let size = if is_dir {
                "-".to_string()
            } else {
                format!("{} bytes", meta.len())
            };
            let mtime = meta
                .modified()
                .ok()
                .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();

            html.push_str(&pages::listing_row(url, &name, &display_name, &size, &mtime));
        }

        html.push_str(pages::LISTING_FOOTER);
        Ok(html)
    }

    fn handle_post(&self, request: &HttpRequest, port: u16) -> HttpResponse {
        match self.post_inner(request, port) {
            Ok(response) => response,
            Err(e) => {
                error!("POST {} failed: {e}", request.url);
                HttpResponse::with_status(500)
            }
        }
    }

    fn post_inner(&self, request: &HttpRequest, port: u16) -> Result<HttpResponse, HandlerError> {
        if let Some(declared) = request.get_header("content-length") {
            let declared: usize = declared
                .trim()
                .parse()
                .map_err(|_| HandlerError::BadContentLength)?;

            if declared > self.config.max_post_request_size {
                error!("Content-Length ({declared}) exceeds the allowed POST limit");
                return Ok(template_response(413, pages::PAGE_413_PAYLOAD_TOO_LARGE));
            }
        }

        let route = match self.config.find_route(port, &request.url) {
            Some(route) if route.is_method_allowed(Method::Post) => route,
            _ => {
                error!("POST method is not allowed for URL {}", request.url);
                return Ok(template_response(405, pages::PAGE_405_METHOD_NOT_ALLOWED));
            }
        };

        let upload_dir = upload_directory(route);
        let timestamp = Utc::now().timestamp();

        let (filename, payload) = if request
            .get_header("content-length")
            .map_or(true, |v| v == "0")
        {
            (format!("empty_post_{timestamp}.txt"), Vec::new())
        } else if request
            .get_header("content-type")
            .is_some_and(|ct| ct.contains("multipart/form-data"))
            && !request.boundary.is_empty()
        {
            let payload = extract_first_part(&request.body, &request.boundary)?;
            let filename = filename_from_body(&request.body)
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("unnamed_{timestamp}.txt"));
            (filename, payload)
        } else {
            (format!("post_{timestamp}.txt"), request.body.clone())
        };

        let filepath = format!("{upload_dir}/{filename}");

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .custom_flags(libc::O_NONBLOCK)
            .open(&filepath)?;

        if !payload.is_empty() {
            file.write_all(&payload)?;
        }

        info!("stored upload at {filepath}");
        Ok(template_response(201, pages::PAGE_201_CREATED))
    }

    fn handle_delete(&self, request: &HttpRequest, port: u16) -> HttpResponse {
        match self.delete_inner(request, port) {
            Ok(response) => response,
            Err(e) => {
                error!("DELETE {} failed: {e}", request.url);
                template_response(500, pages::PAGE_500_INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn delete_inner(&self, request: &HttpRequest, port: u16) -> Result<HttpResponse, HandlerError> {
        let route = match self.config.find_route(port, &request.url) {
            Some(route) => route,
            None => {
                error!("no route found for DELETE request {}", request.url);
                return Ok(HttpResponse::with_status(403));
            }
        };

        if !route.is_method_allowed(Method::Delete) {
            error!("DELETE method not allowed for URL {}", request.url);
            return Ok(template_response(405, pages::PAGE_405_METHOD_NOT_ALLOWED));
        }

        let upload_dir = upload_directory(route);

        let encoded_filename = request.url.rsplit('/').next().unwrap_or("");
        let filename = url_decode(encoded_filename)?;

        if filename.is_empty() {
            error!("empty filename in DELETE request {}", request.url);
            return Ok(template_response(400, pages::PAGE_400_BAD_REQUEST));
        }

        let filepath = format!("{upload_dir}/{filename}");

        if !Path::new(&filepath).exists() {
            error!("file not found for DELETE request: {filepath}");
            return Ok(template_response(404, pages::PAGE_404_NOT_FOUND));
        }

        if let Err(e) = fs::remove_file(&filepath) {
            error!("failed to remove {filepath}: {e}");
            return Ok(template_response(500, pages::PAGE_500_INTERNAL_SERVER_ERROR));
        }

        info!("deleted file {filepath}");
        Ok(template_response(204, pages::PAGE_204_NO_CONTENT))
    }

    /// Map a status code to a response with the configured error page,
    /// loaded fresh per request, or the last-resort one-line body.
    pub fn serve_error_page(&self, response: &mut HttpResponse, status_code: u16) {
        let error_page_path = format!(
            "{}/{}",
            self.config.root_directory, self.config.default_error_page_path
        );

        response.set_content_type("text/html");
        match fs::read(&error_page_path) {
            Ok(body) => response.set_body(body),
            Err(_) => {
                response.set_body(pages::basic_error_page(status_code, reason_phrase(status_code)))
            }
        }

        response.set_status(status_code);
    }

    pub fn error_page(&self, status_code: u16) -> HttpResponse {
        let mut response = HttpResponse::new();
        self.serve_error_page(&mut response, status_code);
        response
    }
}

fn template_response(status_code: u16, body: &str) -> HttpResponse {
    let mut response = HttpResponse::with_status(status_code);
    response.set_content_type("text/html");
    response.set_body(body);
    response
}

/// Percent-decode `%HH`, map `+` to space, pass other bytes through.
fn url_decode(encoded: &str) -> Result<String, HandlerError> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let value = parse_hex_prefix(&bytes[i + 1..i + 3]).ok_or(HandlerError::UrlDecode)?;
            decoded.push(value);
            i += 3;
        } else if bytes[i] == b'+' {
            decoded.push(b' ');
            i += 1;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }

    Ok(String::from_utf8_lossy(&decoded).into_owned())
}

/// Leading hex digits of a two-byte window, `None` when there are none.
fn parse_hex_prefix(window: &[u8]) -> Option<u8> {
    let mut value: u32 = 0;
    let mut any = false;

    for &byte in window {
        match (byte as char).to_digit(16) {
            Some(digit) => {
                value = value * 16 + digit;
                any = true;
            }
            None => break,
        }
    }

    if any {
        Some(value as u8)
    } else {
        None
    }
}

fn upload_directory(route: &Route) -> String {
    let joined = format!("{}/{}", route.filesystem_root, route.upload_directory);
    match joined.strip_prefix("./") {
        Some(stripped) => stripped.to_string(),
        None => joined,
    }
}

fn mime_type(file_path: &str) -> &'static str {
    let extension = match file_path.rfind('.') {
        Some(pos) => &file_path[pos + 1..],
        None => return "application/octet-stream",
    };

    match extension {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "txt",
        _ => "application/octet-stream",
    }
}

/// First-part payload of a multipart body: content between the part's blank
/// line and the next boundary, with the trailing CRLF stripped.
fn extract_first_part(body: &[u8], boundary: &str) -> Result<Vec<u8>, HandlerError> {
    let full_boundary = format!("--{boundary}");
    let marker = full_boundary.as_bytes();

    let first = find_bytes(body, marker, 0)
        .ok_or(HandlerError::Multipart("missing opening boundary"))?;
    let headers_end = find_bytes(body, b"\r\n\r\n", first)
        .ok_or(HandlerError::Multipart("missing part header terminator"))?;

    let content_start = headers_end + 4;
    let mut content_end = find_bytes(body, marker, content_start)
        .ok_or(HandlerError::Multipart("missing closing boundary"))?;

    if content_end >= 2 && &body[content_end - 2..content_end] == b"\r\n" {
        content_end -= 2;
    }

    Ok(body[content_start..content_end].to_vec())
}

fn filename_from_body(body: &[u8]) -> Option<String> {
    let marker = b"filename=\"";
    let start = find_bytes(body, marker, 0)? + marker.len();
    let end = find_bytes(body, b"\"", start)?;
    Some(String::from_utf8_lossy(&body[start..end]).into_owned())
}
