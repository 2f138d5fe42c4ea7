use std::fmt;

/// Request methods the server dispatches on. Anything else parses as
/// `Unknown` and is rejected with a 405 at dispatch time, not at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
    Unknown,
}

impl Method {
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "DELETE" => Method::Delete,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tokens_map_to_variants() {
        assert_eq!(Method::from_token("GET"), Method::Get);
        assert_eq!(Method::from_token("POST"), Method::Post);
        assert_eq!(Method::from_token("DELETE"), Method::Delete);
    }

    #[test]
    fn unknown_tokens_are_not_an_error() {
        assert_eq!(Method::from_token("PATCH"), Method::Unknown);
        assert_eq!(Method::from_token("get"), Method::Unknown);
        assert_eq!(Method::from_token(""), Method::Unknown);
    }
}
