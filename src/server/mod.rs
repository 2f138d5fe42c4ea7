//! The event loop: listening sockets, the readiness wait, connection
//! accounting and request dispatch. Single-threaded; every accepted fd is
//! owned here and closed exactly once.

pub mod connection;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::models::MAX_REQUEST_READ_SIZE;
use crate::config::Config;
use crate::handlers::RequestHandler;
use crate::http::HttpResponse;
use crate::network::Poller;
use crate::server::connection::Connection;

/// Run flag flipped by SIGINT/SIGQUIT; the loop exits after the current
/// iteration.
static RUNNING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(signal: libc::c_int) {
    // Only async-signal-safe work here.
    let _ = signal;
    RUNNING.store(false, Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to create epoll instance: {0}")]
    Epoll(io::Error),

    #[error("no valid ports to bind and listen to")]
    NoPortsBound,

    #[error("failed to register shutdown signal handlers")]
    SignalHandler,

    #[error("poll wait failed: {0}")]
    Poll(io::Error),
}

pub struct Server<'a> {
    poller: Poller,
    listener_fds: Vec<RawFd>,
    connections: HashMap<RawFd, Connection>,
    config: &'a Config,
}

impl<'a> Server<'a> {
    pub fn new(config: &'a Config) -> Result<Self, ServerError> {
        Ok(Self {
            poller: Poller::new().map_err(ServerError::Epoll)?,
            listener_fds: Vec::new(),
            connections: HashMap::new(),
            config,
        })
    }

    /// Bind one listening socket per configured port. Per-port failures are
    /// logged and skipped; binding nothing at all is fatal.
    pub fn bind(&mut self) -> Result<(), ServerError> {
        for &port in &self.config.listening_ports {
            let fd = match bind_listener(port) {
                Ok(fd) => fd,
                Err(e) => {
                    error!("failed to bind port {port}: {e}");
                    continue;
                }
            };

            if let Err(e) = self.poller.add(fd, libc::EPOLLIN as u32) {
                error!("failed to register listening socket for port {port}: {e}");
                unsafe {
                    libc::close(fd);
                }
                continue;
            }

            info!("listening on 0.0.0.0:{port}");
            self.listener_fds.push(fd);
        }

        if self.listener_fds.is_empty() {
            return Err(ServerError::NoPortsBound);
        }

        register_signal_handlers()
    }

    /// Block in the readiness wait and service whatever wakes up, until the
    /// run flag is cleared.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 1024];

        info!("server successfully initialized");
        for line in self.config.summary().lines() {
            info!("{line}");
        }

        RUNNING.store(true, Ordering::SeqCst);

        while RUNNING.load(Ordering::SeqCst) {
            let ready = match self.poller.wait(&mut events, -1) {
                Ok(n) => n,
                // A signal interrupts the wait; re-check the run flag.
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(ServerError::Poll(e)),
            };

            for event in events.iter().take(ready) {
                let fd = event.u64 as RawFd;
                let flags = event.events;
                self.handle_event(fd, flags);
            }
        }

        info!("shutdown requested, leaving event loop");
        Ok(())
    }

    fn handle_event(&mut self, fd: RawFd, flags: u32) {
        if flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            debug!("closing fd {fd} (error/hangup)");
            self.close_connection(fd);
            return;
        }

        if self.listener_fds.contains(&fd) {
            if flags & libc::EPOLLIN as u32 != 0 {
                self.accept_connection(fd);
            }
            return;
        }

        if flags & libc::EPOLLIN as u32 != 0 {
            self.read_from_client(fd);
        }
    }

    fn accept_connection(&mut self, listener_fd: RawFd) {
        let client_fd =
            unsafe { libc::accept(listener_fd, std::ptr::null_mut(), std::ptr::null_mut()) };

        if client_fd < 0 {
            warn!(
                "failed to accept client connection on socket {listener_fd}: {}",
                io::Error::last_os_error()
            );
            return;
        }

        if let Err(e) = set_nonblocking(client_fd) {
            error!("failed to set client socket {client_fd} non-blocking: {e}");
            unsafe {
                libc::close(client_fd);
            }
            return;
        }

        if let Err(e) = self.poller.add(client_fd, libc::EPOLLIN as u32) {
            error!("failed to register client socket {client_fd}: {e}");
            unsafe {
                libc::close(client_fd);
            }
            return;
        }

        self.connections.insert(client_fd, Connection::new(client_fd));
        debug!("new client connection accepted on socket {listener_fd} (fd {client_fd})");
    }

    fn read_from_client(&mut self, fd: RawFd) {
        let read_size = self.config.request_read_size.min(MAX_REQUEST_READ_SIZE);
        let mut buffer = [0u8; MAX_REQUEST_READ_SIZE];

        let bytes_read =
            unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, read_size) };

        if bytes_read <= 0 {
            debug!("client fd {fd} closed or failed before completing a request");
            self.close_connection(fd);
            return;
        }

        let outcome = match self.connections.get_mut(&fd) {
            Some(connection) => connection.request.feed(&buffer[..bytes_read as usize]),
            None => return,
        };

        match outcome {
            Err(e) => {
                // Fatal client-format error: abort without a response.
                warn!("invalid HTTP request on fd {fd}: {e}");
                self.close_connection(fd);
            }
            Ok(true) => self.dispatch(fd),
            Ok(false) => {}
        }
    }

    /// Hand a completed request to its method handler, send the response and
    /// tear the connection down.
    fn dispatch(&mut self, fd: RawFd) {
        let Connection { fd, request } = match self.connections.remove(&fd) {
            Some(connection) => connection,
            None => return,
        };

        // The route table is per-port; recover the local port of the
        // accepted socket rather than tracking the listener it came from.
        let port = match listening_port_for(fd) {
            Some(port) => port,
            None => {
                error!("failed to retrieve socket information for fd {fd}");
                0
            }
        };
        info!("{} {} (port {port})", request.method, request.url);

        let response = RequestHandler::new(self.config).handle(&request, port);
        self.send_response(fd, &response);

        let _ = self.poller.delete(fd);
        unsafe {
            libc::close(fd);
        }
    }

    fn send_response(&self, fd: RawFd, response: &HttpResponse) {
        let bytes = response.build();
        let mut written = 0;

        while written < bytes.len() {
            let sent = unsafe {
                libc::send(
                    fd,
                    bytes[written..].as_ptr() as *const libc::c_void,
                    bytes.len() - written,
                    0,
                )
            };

            if sent <= 0 {
                error!(
                    "failed to send complete HTTP response on fd {fd}: {}",
                    io::Error::last_os_error()
                );
                return;
            }

            written += sent as usize;
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        let _ = self.poller.delete(fd);
        unsafe {
            libc::close(fd);
        }
        self.connections.remove(&fd);
    }
}

impl Drop for Server<'_> {
    fn drop(&mut self) {
        for &fd in &self.listener_fds {
            unsafe {
                libc::close(fd);
            }
        }
        for &fd in self.connections.keys() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn register_signal_handlers() -> Result<(), ServerError> {
    unsafe {
        if libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t)
            == libc::SIG_ERR
        {
            return Err(ServerError::SignalHandler);
        }
        if libc::signal(libc::SIGQUIT, handle_shutdown_signal as libc::sighandler_t)
            == libc::SIG_ERR
        {
            return Err(ServerError::SignalHandler);
        }
        // A peer closing mid-send must surface as an error, not kill us.
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(ServerError::SignalHandler);
        }
    }

    Ok(())
}

/// IPv4 stream socket with `SO_REUSEADDR`, bound to `INADDR_ANY:port`,
/// listening with backlog 5, non-blocking.
fn bind_listener(port: u16) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let enable: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let mut address: libc::sockaddr_in = std::mem::zeroed();
        address.sin_family = libc::AF_INET as libc::sa_family_t;
        address.sin_addr.s_addr = libc::INADDR_ANY;
        address.sin_port = port.to_be();

        if libc::bind(
            fd,
            &address as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, 5) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if let Err(err) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Local port of an accepted socket, which is the port it was accepted on.
fn listening_port_for(fd: RawFd) -> Option<u16> {
    unsafe {
        let mut address: libc::sockaddr_in = std::mem::zeroed();
        let mut length = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        if libc::getsockname(
            fd,
            &mut address as *mut _ as *mut libc::sockaddr,
            &mut length,
        ) < 0
        {
            return None;
        }

        Some(u16::from_be(address.sin_port))
    }
}
