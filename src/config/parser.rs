//! Configuration file loading.
//!
//! The format is a small indentation-based key/value document: global
//! scalars, a `server_names:` block, and a `routes:` list introduced with
//! dashes. Unknown keys are ignored; [`Config::validate`] runs after parsing
//! and rejects structurally broken configurations.

use std::fs;
use std::path::Path;

use crate::config::models::{Config, ConfigError, Route};
use crate::http::Method;

#[derive(PartialEq)]
enum ParseMode {
    General,
    ServerNames,
    Routes,
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = parse(&content);
    config.validate()?;
    Ok(config)
}

pub fn parse(content: &str) -> Config {
    let mut config = Config::new();
    let mut mode = ParseMode::General;
    let mut current_route: Option<Route> = None;
    let mut in_cgi_block = false;

    for raw_line in content.lines() {
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let indent = raw_line.chars().take_while(|c| c.is_whitespace()).count();
        let (key, value) = split_kv(trimmed);

        if indent == 0 {
            match key {
                "server_names" => {
                    mode = ParseMode::ServerNames;
                    continue;
                }
                "routes" => {
                    mode = ParseMode::Routes;
                    continue;
                }
                _ => mode = ParseMode::General,
            }

            apply_global_field(&mut config, key, value);
            continue;
        }

        match mode {
            ParseMode::ServerNames => {
                config.server_names.insert(key.to_string(), value.to_string());
            }
            ParseMode::Routes => {
                if trimmed.starts_with("- ") {
                    if let Some(route) = current_route.take() {
                        config.routes.push(route);
                    }

                    let mut route = Route::new("/");
                    route.filesystem_root = config.root_directory.clone();
                    in_cgi_block = false;

                    let (k, v) = split_kv(&trimmed[2..]);
                    apply_route_field(&mut route, k, v);
                    current_route = Some(route);
                } else if let Some(ref mut route) = current_route {
                    if key == "cgi" && value.is_empty() {
                        in_cgi_block = true;
                    } else if in_cgi_block && key.starts_with('.') {
                        route.cgi_handlers.insert(key.to_string(), value.to_string());
                    } else {
                        in_cgi_block = false;
                        apply_route_field(route, key, value);
                    }
                }
            }
            ParseMode::General => {}
        }
    }

    if let Some(route) = current_route {
        config.routes.push(route);
    }

    // Routes without an explicit port belong to the first configured one.
    if let Some(&first_port) = config.listening_ports.first() {
        for route in &mut config.routes {
            if route.server_listening_port == 0 {
                route.server_listening_port = first_port;
            }
        }
    }

    config
}

fn apply_global_field(config: &mut Config, key: &str, value: &str) {
    match key {
        "root" => config.root_directory = value.to_string(),
        "error_page" => config.default_error_page_path = value.to_string(),
        "ports" => {
            config.listening_ports = parse_list(value)
                .iter()
                .filter_map(|p| p.parse().ok())
                .collect();
        }
        "max_request_body_size" => {
            config.max_request_body_size =
                value.parse().unwrap_or(config.max_request_body_size);
        }
        "max_post_request_size" => {
            config.max_post_request_size =
                value.parse().unwrap_or(config.max_post_request_size);
        }
        "request_read_size" => {
            config.request_read_size = value.parse().unwrap_or(config.request_read_size);
        }
        _ => {}
    }
}

fn apply_route_field(route: &mut Route, key: &str, value: &str) {
    match key {
        "path" => route.url_path = value.to_string(),
        "root" => route.filesystem_root = value.to_string(),
        "port" => route.server_listening_port = value.parse().unwrap_or(0),
        "index" => route.index_file = value.to_string(),
        "autoindex" => route.directory_listing = value == "true",
        "redirect" => route.redirect_url = value.to_string(),
        "upload_dir" => route.upload_directory = value.to_string(),
        "methods" => {
            route.allowed_methods = parse_list(value)
                .iter()
                .map(|m| Method::from_token(m))
                .filter(|m| *m != Method::Unknown)
                .collect();
        }
        _ => {}
    }
}

fn split_kv(line: &str) -> (&str, &str) {
    match line.split_once(':') {
        Some((k, v)) => (k.trim(), v.trim().trim_matches('"').trim_matches('\'')),
        None => (line.trim(), ""),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .trim_matches(|c| c == '[' || c == ']' || c == ' ')
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# demo configuration
root: ./www
error_page: error.html
max_post_request_size: 10485760
ports: [8080, 9090]

server_names:
  localhost: ./www

routes:
  - path: /
    methods: [GET, POST, DELETE]
    autoindex: true
    upload_dir: uploads
  - path: /cgi-bin
    port: 9090
    cgi:
      .py: /usr/bin/python3
      .sh: /bin/sh
    index: run.py
";

    #[test]
    fn parses_global_fields() {
        let config = parse(SAMPLE);

        assert_eq!(config.root_directory, "./www");
        assert_eq!(config.default_error_page_path, "error.html");
        assert_eq!(config.listening_ports, vec![8080, 9090]);
        assert_eq!(config.max_post_request_size, 10_485_760);
        assert_eq!(config.server_names.get("localhost").unwrap(), "./www");
    }

    #[test]
    fn parses_routes_with_fields_and_cgi_block() {
        let config = parse(SAMPLE);
        assert_eq!(config.routes.len(), 2);

        let first = &config.routes[0];
        assert_eq!(first.url_path, "/");
        assert!(first.directory_listing);
        assert_eq!(first.upload_directory, "uploads");
        assert!(first.is_method_allowed(Method::Get));
        assert!(first.is_method_allowed(Method::Post));
        assert!(first.is_method_allowed(Method::Delete));

        let second = &config.routes[1];
        assert_eq!(second.url_path, "/cgi-bin");
        assert_eq!(second.server_listening_port, 9090);
        assert_eq!(second.cgi_handlers.get(".py").unwrap(), "/usr/bin/python3");
        assert_eq!(second.cgi_handlers.get(".sh").unwrap(), "/bin/sh");
        // The field after the cgi block still lands on the route.
        assert_eq!(second.index_file, "run.py");
    }

    #[test]
    fn route_without_port_gets_the_first_listening_port() {
        let config = parse(SAMPLE);
        assert_eq!(config.routes[0].server_listening_port, 8080);
    }

    #[test]
    fn route_root_defaults_to_the_global_root() {
        let config = parse(SAMPLE);
        assert_eq!(config.routes[0].filesystem_root, "./www");
    }

    #[test]
    fn parsed_sample_passes_validation() {
        assert!(parse(SAMPLE).validate().is_ok());
    }

    #[test]
    fn unspecified_sizes_keep_their_defaults() {
        let config = parse("root: ./www\nports: [8080]\nroutes:\n  - path: /\n");
        assert_eq!(config.max_request_body_size, 1_048_576);
        assert_eq!(config.request_read_size, 4096);
    }
}
