use std::os::unix::io::RawFd;

use crate::http::HttpRequest;

/// Per-client state: the accepted fd and the request being assembled on it.
/// Lives exactly as long as the TCP connection; the fd is closed once,
/// either on error detection or after the response is sent.
pub struct Connection {
    pub fd: RawFd,
    pub request: HttpRequest,
}

impl Connection {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            request: HttpRequest::new(),
        }
    }
}
