//! CGI execution: environment marshalling, child process I/O and response
//! splicing. The interpreter is spawned with a cleared environment, its
//! working directory set to the script's directory, and both ends piped.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::process::{Command, Stdio};

use log::{debug, error};
use thiserror::Error;

use crate::http::request::find_bytes;
use crate::http::{HttpRequest, HttpResponse, Method};

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to resolve real path for script")]
    ResolveScriptPath,

    #[error("{0} is missing or not executable")]
    NotExecutable(&'static str),

    #[error("CGI process I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed chunked request body")]
    MalformedChunkedBody,

    #[error("CGI script exited with status {0}")]
    NonZeroExit(i32),
}

pub struct CgiHandler {
    script_path: String,
    interpreter: String,
    script_directory: String,
}

impl CgiHandler {
    pub fn new(script_path: &str, interpreter: &str) -> Self {
        let script_directory = match script_path.rfind('/') {
            Some(pos) => script_path[..pos].to_string(),
            None => String::new(),
        };

        Self {
            script_path: script_path.to_string(),
            interpreter: interpreter.to_string(),
            script_directory,
        }
    }

    /// Run the script for `request` and splice its output into a response.
    pub fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, CgiError> {
        let absolute_script = fs::canonicalize(&self.script_path)
            .map_err(|_| CgiError::ResolveScriptPath)?
            .to_string_lossy()
            .into_owned();

        let environment = build_environment(request, &absolute_script);

        let body = if request.method == Method::Post {
            if request.get_header("transfer-encoding") == Some("chunked") {
                decode_chunked(&request.body)?
            } else {
                request.body.clone()
            }
        } else {
            Vec::new()
        };

        let output = self.execute(&absolute_script, &body, &environment)?;
        Ok(splice_output(&output))
    }

    fn execute(
        &self,
        absolute_script: &str,
        body: &[u8],
        environment: &HashMap<String, String>,
    ) -> Result<Vec<u8>, CgiError> {
        if !is_executable(absolute_script) {
            return Err(CgiError::NotExecutable("CGI script"));
        }
        if !is_executable(&self.interpreter) {
            return Err(CgiError::NotExecutable("CGI interpreter"));
        }

        debug!("running CGI: {} {}", self.interpreter, absolute_script);

        let mut child = Command::new(&self.interpreter)
            .arg(absolute_script)
            .env_clear()
            .envs(environment)
            .current_dir(&self.script_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        // The handle must be dropped before draining stdout so the child
        // sees EOF on its stdin.
        if let Some(mut stdin) = child.stdin.take() {
            if !body.is_empty() {
                stdin.write_all(body)?;
            }
        }

        let mut output = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            let mut buffer = [0u8; 4096];
            loop {
                match stdout.read(&mut buffer)? {
                    0 => break,
                    n => output.extend_from_slice(&buffer[..n]),
                }
            }
        }

        let status = child.wait()?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            error!(
                "CGI script exited with status {code}, script: {}, interpreter: {}",
                self.script_path, self.interpreter
            );
            return Err(CgiError::NonZeroExit(code));
        }

        Ok(output)
    }
}

/// The exact variable set handed to the child; nothing is inherited.
fn build_environment(request: &HttpRequest, absolute_script: &str) -> HashMap<String, String> {
    let url = request.url.as_str();
    let (path_info, query_string) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    };

    let mut environment = HashMap::new();

    environment.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
    environment.insert("SERVER_PROTOCOL".into(), request.version.to_string());
    environment.insert("REDIRECT_STATUS".into(), "200".into());
    environment.insert(
        "REQUEST_METHOD".into(),
        if request.method == Method::Post { "POST" } else { "GET" }.into(),
    );
    environment.insert("PATH_INFO".into(), path_info.into());
    environment.insert("PATH_TRANSLATED".into(), absolute_script.into());
    environment.insert("SCRIPT_NAME".into(), absolute_script.into());
    environment.insert("SCRIPT_FILENAME".into(), absolute_script.into());
    environment.insert("QUERY_STRING".into(), query_string.into());
    environment.insert("REQUEST_URI".into(), url.into());

    if request.method == Method::Post {
        environment.insert(
            "CONTENT_LENGTH".into(),
            request.get_header("content-length").unwrap_or("").into(),
        );
        environment.insert(
            "CONTENT_TYPE".into(),
            request.get_header("content-type").unwrap_or("").into(),
        );
    }

    for (name, value) in &request.headers {
        let name = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        environment.insert(name, value.clone());
    }

    environment
}

/// Decode a `Transfer-Encoding: chunked` body: hex size line, that many
/// payload bytes, a CRLF trailer, until the zero-size chunk.
pub fn decode_chunked(body: &[u8]) -> Result<Vec<u8>, CgiError> {
    let mut result = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = find_bytes(body, b"\n", pos).ok_or(CgiError::MalformedChunkedBody)?;
        let line = std::str::from_utf8(&body[pos..line_end])
            .map_err(|_| CgiError::MalformedChunkedBody)?
            .trim_end_matches('\r');

        let chunk_size = usize::from_str_radix(line.trim(), 16)
            .map_err(|_| CgiError::MalformedChunkedBody)?;

        if chunk_size == 0 {
            break;
        }

        let data_start = line_end + 1;
        let data_end = data_start + chunk_size;
        if data_end > body.len() {
            return Err(CgiError::MalformedChunkedBody);
        }

        result.extend_from_slice(&body[data_start..data_end]);
        pos = data_end + 2;
    }

    Ok(result)
}

/// Split CGI output at the first `\r\n\r\n` into header lines and body; with
/// no separator the whole output is the body. The status is always 200.
fn splice_output(output: &[u8]) -> HttpResponse {
    let mut response = HttpResponse::new();

    match find_bytes(output, b"\r\n\r\n", 0) {
        Some(separator) => {
            if let Ok(head) = std::str::from_utf8(&output[..separator]) {
                for line in head.split('\n') {
                    let line = line.trim_end_matches('\r');
                    if line.is_empty() {
                        continue;
                    }
                    if let Some((name, value)) = line.split_once(": ") {
                        response.set_header(name, value.trim_end_matches('\r'));
                    }
                }
            }
            response.set_body(output[separator + 4..].to_vec());
        }
        None => {
            response.set_content_type("text/html");
            response.set_body(output.to_vec());
        }
    }

    response.set_status(200);
    response
}

fn is_executable(path: &str) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request_from(bytes: &[u8]) -> HttpRequest {
        let mut request = HttpRequest::new();
        assert!(request.feed(bytes).unwrap());
        request
    }

    fn encode_chunked(data: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut encoded = Vec::new();
        for chunk in data.chunks(chunk_size.max(1)) {
            encoded.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            encoded.extend_from_slice(chunk);
            encoded.extend_from_slice(b"\r\n");
        }
        encoded.extend_from_slice(b"0\r\n\r\n");
        encoded
    }

    #[test]
    fn chunked_round_trip() {
        for data in [&b""[..], b"a", b"hello world", b"0123456789abcdef0123456789"] {
            for chunk_size in [1, 3, 8, 64] {
                let decoded = decode_chunked(&encode_chunked(data, chunk_size)).unwrap();
                assert_eq!(decoded, data, "chunk size {chunk_size}");
            }
        }
    }

    #[test]
    fn chunked_decoder_rejects_garbage() {
        assert!(decode_chunked(b"not-hex\r\ndata").is_err());
        assert!(decode_chunked(b"ff\r\nshort\r\n0\r\n\r\n").is_err());
        assert!(decode_chunked(b"5").is_err());
    }

    #[test]
    fn environment_carries_the_cgi_contract() {
        let request =
            request_from(b"GET /cgi/run.py?a=1&b=2 HTTP/1.1\r\nHost: local\r\nX-Token: t\r\n\r\n");
        let env = build_environment(&request, "/srv/www/cgi/run.py");

        assert_eq!(env.get("GATEWAY_INTERFACE").unwrap(), "CGI/1.1");
        assert_eq!(env.get("SERVER_PROTOCOL").unwrap(), "HTTP/1.1");
        assert_eq!(env.get("REDIRECT_STATUS").unwrap(), "200");
        assert_eq!(env.get("REQUEST_METHOD").unwrap(), "GET");
        assert_eq!(env.get("PATH_INFO").unwrap(), "/cgi/run.py");
        assert_eq!(env.get("QUERY_STRING").unwrap(), "a=1&b=2");
        assert_eq!(env.get("REQUEST_URI").unwrap(), "/cgi/run.py?a=1&b=2");
        assert_eq!(env.get("SCRIPT_FILENAME").unwrap(), "/srv/www/cgi/run.py");
        assert_eq!(env.get("SCRIPT_NAME").unwrap(), "/srv/www/cgi/run.py");
        assert_eq!(env.get("PATH_TRANSLATED").unwrap(), "/srv/www/cgi/run.py");
        assert_eq!(env.get("HTTP_HOST").unwrap(), "local");
        assert_eq!(env.get("HTTP_X_TOKEN").unwrap(), "t");
        assert!(!env.contains_key("CONTENT_LENGTH"));
    }

    #[test]
    fn post_environment_includes_content_headers() {
        let request = request_from(
            b"POST /cgi/run.py HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi",
        );
        let env = build_environment(&request, "/srv/run.py");

        assert_eq!(env.get("REQUEST_METHOD").unwrap(), "POST");
        assert_eq!(env.get("CONTENT_LENGTH").unwrap(), "2");
        assert_eq!(env.get("CONTENT_TYPE").unwrap(), "text/plain");
    }

    #[test]
    fn output_with_headers_is_spliced() {
        let response = splice_output(b"Content-Type: text/plain\r\nX-Extra: 1\r\n\r\nOK");

        assert_eq!(response.status_code, 200);
        assert_eq!(response.get_header("Content-Type"), Some("text/plain"));
        assert_eq!(response.get_header("X-Extra"), Some("1"));
        assert_eq!(response.body(), b"OK");
    }

    #[test]
    fn output_without_separator_becomes_the_whole_body() {
        let response = splice_output(b"<p>plain output</p>");

        assert_eq!(response.status_code, 200);
        assert_eq!(response.get_header("Content-Type"), Some("text/html"));
        assert_eq!(response.body(), b"<p>plain output</p>");
    }

    fn scratch_script(tag: &str, contents: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("webserv-cgi-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let script = dir.join("test.sh");
        fs::write(&script, contents).unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();

        (dir, script)
    }

    #[test]
    fn runs_a_real_script_and_splices_its_output() {
        let (dir, script) = scratch_script(
            "ok",
            "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\nOK'\n",
        );

        let handler = CgiHandler::new(script.to_str().unwrap(), "/bin/sh");
        let request = request_from(b"GET /cgi/test.sh?x=1 HTTP/1.1\r\nHost: x\r\n\r\n");
        let response = handler.handle(&request).unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.get_header("Content-Type"), Some("text/plain"));
        assert_eq!(response.body(), b"OK");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn post_body_reaches_the_script_stdin() {
        let (dir, script) = scratch_script(
            "stdin",
            "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\n'\ncat\n",
        );

        let handler = CgiHandler::new(script.to_str().unwrap(), "/bin/sh");
        let request = request_from(
            b"POST /cgi/test.sh HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
        );
        let response = handler.handle(&request).unwrap();

        assert_eq!(response.body(), b"hello");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let (dir, script) = scratch_script("fail", "#!/bin/sh\nexit 3\n");

        let handler = CgiHandler::new(script.to_str().unwrap(), "/bin/sh");
        let request = request_from(b"GET /cgi/test.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        let result = handler.handle(&request);

        assert!(matches!(result, Err(CgiError::NonZeroExit(3))));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_script_fails_to_resolve() {
        let handler = CgiHandler::new("/no/such/script.py", "/bin/sh");
        let request = request_from(b"GET /x.py HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(matches!(handler.handle(&request), Err(CgiError::ResolveScriptPath)));
    }
}
