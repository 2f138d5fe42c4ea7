use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use thiserror::Error;

use crate::http::Method;

pub const MAX_REQUEST_BODY_SIZE: usize = 1_048_576; // 1 MiB
pub const MAX_POST_REQUEST_SIZE: usize = 10_485_760; // 10 MiB
pub const DEFAULT_REQUEST_READ_SIZE: usize = 4096;
pub const MAX_REQUEST_READ_SIZE: usize = 65_536;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One configured location: a URL prefix bound to a listening port with its
/// own filesystem, method, listing, upload and CGI policy.
#[derive(Debug, Clone)]
pub struct Route {
    pub url_path: String,
    pub filesystem_root: String,
    pub redirect_url: String,
    pub index_file: String,
    pub upload_directory: String,
    pub directory_listing: bool,
    pub server_listening_port: u16,
    pub allowed_methods: HashSet<Method>,
    /// File extension (including the dot) to interpreter executable.
    pub cgi_handlers: HashMap<String, String>,
}

impl Route {
    pub fn new(url_path: &str) -> Self {
        let mut allowed_methods = HashSet::new();
        allowed_methods.insert(Method::Get);

        Self {
            url_path: url_path.to_string(),
            filesystem_root: "./".to_string(),
            redirect_url: String::new(),
            index_file: "index.html".to_string(),
            upload_directory: "./upload".to_string(),
            directory_listing: false,
            server_listening_port: 0,
            allowed_methods,
            cgi_handlers: HashMap::new(),
        }
    }

    pub fn is_method_allowed(&self, method: Method) -> bool {
        self.allowed_methods.contains(&method)
    }

    pub fn should_redirect(&self) -> bool {
        !self.redirect_url.is_empty()
    }

    /// Prefix-matching rule for one route against a query-stripped path.
    /// A prefix not ending in `/` must be followed by `/` in the path, so
    /// `/user` does not capture `/users`.
    pub fn matches(&self, requested_path: &str) -> bool {
        let clean_path = strip_query(requested_path);

        if clean_path == self.url_path {
            return true;
        }

        if self.url_path.ends_with('/') {
            return clean_path.starts_with(&self.url_path);
        }

        clean_path.starts_with(&self.url_path)
            && clean_path.as_bytes().get(self.url_path.len()) == Some(&b'/')
    }
}

/// Whole-server configuration, immutable after load.
#[derive(Debug, Clone)]
pub struct Config {
    pub listening_ports: Vec<u16>,
    pub server_names: BTreeMap<String, String>,
    pub root_directory: String,
    pub default_error_page_path: String,
    pub max_request_body_size: usize,
    pub max_post_request_size: usize,
    pub request_read_size: usize,
    pub routes: Vec<Route>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            listening_ports: Vec::new(),
            server_names: BTreeMap::new(),
            root_directory: String::new(),
            default_error_page_path: String::new(),
            max_request_body_size: MAX_REQUEST_BODY_SIZE,
            max_post_request_size: MAX_POST_REQUEST_SIZE,
            request_read_size: DEFAULT_REQUEST_READ_SIZE,
            routes: Vec::new(),
        }
    }

    /// Longest matching URL prefix among the routes of `port`; ties resolve
    /// to configuration order.
    pub fn find_route(&self, port: u16, url: &str) -> Option<&Route> {
        let clean_path = strip_query(url);

        let mut best: Option<&Route> = None;
        let mut best_len = 0;

        for route in &self.routes {
            if route.server_listening_port != port || !route.matches(clean_path) {
                continue;
            }

            if route.url_path.len() > best_len {
                best_len = route.url_path.len();
                best = Some(route);
            }
        }

        best
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listening_ports.is_empty() {
            return Err(ConfigError::Invalid("no listening ports configured".into()));
        }

        if self.root_directory.is_empty() {
            return Err(ConfigError::Invalid("root directory is empty".into()));
        }

        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("no routes configured".into()));
        }

        let mut seen_ports = HashSet::new();
        for port in &self.listening_ports {
            if *port == 0 {
                return Err(ConfigError::Invalid("port cannot be zero".into()));
            }
            if !seen_ports.insert(*port) {
                return Err(ConfigError::Invalid(format!("duplicate port {port}")));
            }
        }

        let mut seen_routes = HashSet::new();
        for route in &self.routes {
            if route.url_path.is_empty() || !route.url_path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "route path {:?} must begin with '/'",
                    route.url_path
                )));
            }

            if route.allowed_methods.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "route {:?} allows no methods",
                    route.url_path
                )));
            }

            if !seen_routes.insert((route.server_listening_port, route.url_path.clone())) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate route {:?} on port {}",
                    route.url_path, route.server_listening_port
                )));
            }
        }

        Ok(())
    }

    /// Human-readable configuration report, logged once at startup.
    pub fn summary(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "=== Server Configuration ===");
        let _ = writeln!(out, "Listening port(s): {:?}", self.listening_ports);
        for (name, root) in &self.server_names {
            let _ = writeln!(out, "Server name: {name} -> {root}");
        }
        let _ = writeln!(out, "Root directory: {}", self.root_directory);
        let _ = writeln!(out, "Max request body size: {} bytes", self.max_request_body_size);
        let _ = writeln!(out, "Max post request size: {} bytes", self.max_post_request_size);
        let _ = writeln!(out, "Request read size: {} bytes", self.request_read_size);
        let _ = writeln!(out, "Default error page: {}", self.default_error_page_path);

        for route in &self.routes {
            let _ = writeln!(out, "Location: {} (port {})", route.url_path, route.server_listening_port);
            let _ = writeln!(out, "  Root: {}", route.filesystem_root);
            let _ = writeln!(
                out,
                "  Directory listing: {}",
                if route.directory_listing { "enabled" } else { "disabled" }
            );

            let mut methods: Vec<&str> = route
                .allowed_methods
                .iter()
                .map(Method::as_str)
                .collect();
            methods.sort_unstable();
            let _ = writeln!(out, "  Allowed methods: {}", methods.join(" "));

            if !route.index_file.is_empty() {
                let _ = writeln!(out, "  Index file: {}", route.index_file);
            }
            if !route.upload_directory.is_empty() {
                let _ = writeln!(out, "  Upload directory: {}", route.upload_directory);
            }
            if route.should_redirect() {
                let _ = writeln!(out, "  Redirect to: {}", route.redirect_url);
            }
            for (extension, interpreter) in &route.cgi_handlers {
                let _ = writeln!(out, "  CGI: {extension} via {interpreter}");
            }
        }

        out
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_query(url: &str) -> &str {
    match url.find('?') {
        Some(pos) => &url[..pos],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_on(port: u16, path: &str) -> Route {
        let mut route = Route::new(path);
        route.server_listening_port = port;
        route
    }

    fn config_with(routes: Vec<Route>) -> Config {
        let mut config = Config::new();
        config.listening_ports = vec![8080, 9090];
        config.root_directory = "./www".to_string();
        config.routes = routes;
        config
    }

    #[test]
    fn exact_path_matches() {
        assert!(route_on(8080, "/files").matches("/files"));
    }

    #[test]
    fn trailing_slash_prefix_matches_everything_below() {
        let route = route_on(8080, "/files/");
        assert!(route.matches("/files/a.txt"));
        assert!(route.matches("/files/sub/dir"));
        assert!(!route.matches("/file"));
    }

    #[test]
    fn bare_prefix_requires_a_path_separator() {
        let route = route_on(8080, "/user");
        assert!(route.matches("/user"));
        assert!(route.matches("/user/profile"));
        assert!(!route.matches("/users"));
    }

    #[test]
    fn query_string_is_ignored_when_matching() {
        assert!(route_on(8080, "/files").matches("/files?name=x"));
    }

    #[test]
    fn resolution_picks_the_longest_prefix() {
        let config = config_with(vec![
            route_on(8080, "/"),
            route_on(8080, "/users"),
            route_on(8080, "/users/profile"),
        ]);

        let found = config.find_route(8080, "/users/profile/settings").unwrap();
        assert_eq!(found.url_path, "/users/profile");
    }

    #[test]
    fn resolution_is_scoped_to_the_port() {
        let config = config_with(vec![route_on(8080, "/a"), route_on(9090, "/a/b")]);

        assert_eq!(config.find_route(8080, "/a/b").unwrap().url_path, "/a");
        assert_eq!(config.find_route(9090, "/a/b").unwrap().url_path, "/a/b");
        assert!(config.find_route(7070, "/a/b").is_none());
    }

    #[test]
    fn resolution_tie_breaks_on_configuration_order() {
        let mut first = route_on(8080, "/a");
        first.index_file = "first.html".to_string();
        let mut second = route_on(8080, "/a");
        second.index_file = "second.html".to_string();

        let config = config_with(vec![first, second]);
        assert_eq!(config.find_route(8080, "/a").unwrap().index_file, "first.html");
    }

    #[test]
    fn query_string_is_stripped_before_resolution() {
        let config = config_with(vec![route_on(8080, "/cgi")]);
        assert!(config.find_route(8080, "/cgi/run.py?x=1").is_some());
    }

    #[test]
    fn validation_rejects_duplicate_ports() {
        let mut config = config_with(vec![route_on(8080, "/")]);
        config.listening_ports = vec![8080, 8080];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validation_rejects_route_without_leading_slash() {
        let config = config_with(vec![route_on(8080, "files")]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validation_rejects_duplicate_route_per_port() {
        let config = config_with(vec![route_on(8080, "/a"), route_on(8080, "/a")]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validation_accepts_a_minimal_config() {
        let config = config_with(vec![route_on(8080, "/")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn routes_allow_get_by_default() {
        let route = Route::new("/");
        assert!(route.is_method_allowed(Method::Get));
        assert!(!route.is_method_allowed(Method::Post));
    }
}
