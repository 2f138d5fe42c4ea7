//! Built-in HTML bodies for handler outcomes and the directory listing
//! fragments. Served when a route outcome has a fixed page, independent of
//! the configured default error page.

pub const PAGE_201_CREATED: &str = "<!DOCTYPE html><html><head><title>201 - File Uploaded</title></head><body><h1>File Uploaded Successfully</h1><p>Your file is now available in the server upload directory.</p><p><a href=\"/\">Return to Homepage</a></p></body></html>";

pub const PAGE_204_NO_CONTENT: &str = "<!DOCTYPE html><html><head><title>204 - No Content</title></head><body><h1>204 - No Content</h1><p>The operation was successful, but there is no content to display.</p><p><a href=\"/\">Return to Homepage</a></p></body></html>";

pub const PAGE_400_BAD_REQUEST: &str = "<!DOCTYPE html><html><head><title>400 - Bad Request</title></head><body><h1>400 - Bad Request</h1><p>Your request was invalid or missing necessary parameters.</p><p><a href=\"/\">Return to Homepage</a></p></body></html>";

pub const PAGE_404_NOT_FOUND: &str = "<!DOCTYPE html><html><head><title>404 - Not Found</title></head><body><h1>404 - Not Found</h1><p>The requested resource could not be found on this server.</p><p><a href=\"/\">Return to Homepage</a></p></body></html>";

pub const PAGE_405_METHOD_NOT_ALLOWED: &str = "<!DOCTYPE html><html><head><title>405 - Method Not Allowed</title></head><body><h1>405 - Method Not Allowed</h1><p>This method is not allowed on this route.</p><p><a href=\"/\">Return to Homepage</a></p></body></html>";

pub const PAGE_413_PAYLOAD_TOO_LARGE: &str = "<!DOCTYPE html><html><head><title>413 - Payload Too Large</title></head><body><h1>413 - Payload Too Large</h1><p>File too large. Maximum size is 10MB.</p><p><a href=\"/\">Return to Homepage</a></p></body></html>";

pub const PAGE_500_INTERNAL_SERVER_ERROR: &str = "<!DOCTYPE html><html><head><title>500 - Internal Server Error</title></head><body><h1>500 - Internal Server Error</h1><p>An unexpected error occurred on the server. Please try again later.</p><p><a href=\"/\">Return to Homepage</a></p></body></html>";

pub fn listing_header(url: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>Index of {url}</title></head><body><h1>Index of {url}</h1><table><tr><th>Name</th><th>Size</th><th>Last Modified</th></tr>"
    )
}

pub fn listing_row(url: &str, name: &str, display_name: &str, size: &str, mtime: &str) -> String {
    format!("<tr><td><a href=\"{url}/{name}\">{display_name}</a></td><td>{size}</td><td>{mtime}</td></tr>")
}

pub const LISTING_FOOTER: &str =
    "</table><a href=\"/\">Return to Homepage</a></body></html>";

/// Last-resort error body assembled from the code and reason phrase.
pub fn basic_error_page(status_code: u16, reason: &str) -> String {
    format!("<html><body><h1>Error {status_code}</h1><p>{reason}</p></body></html>")
}
