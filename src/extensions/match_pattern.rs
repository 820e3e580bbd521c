// Match Patterns - `<scheme>://<host><path>` URL filters
//
// Used by content script `matches`/`exclude_matches` and host permissions.
// Each pattern compiles to one anchored regex over the URL (fragment
// stripped). The same regex source is valid as a JavaScript RegExp, which is
// how injected scripts guard themselves against non-matching pages.

use regex::Regex;
use std::fmt;
use thiserror::Error;
use url::Url;

const ALL_URLS: &str = "<all_urls>";
const VALID_SCHEMES: &[&str] = &["http", "https", "ws", "wss", "ftp", "file", "data", "urn"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchPatternError {
    #[error("match pattern '{0}' has no '://' separator")]
    MissingSchemeSeparator(String),
    #[error("match pattern '{pattern}' uses unsupported scheme '{scheme}'")]
    UnsupportedScheme { pattern: String, scheme: String },
    #[error("match pattern '{pattern}' has invalid host '{host}'")]
    InvalidHost { pattern: String, host: String },
    #[error("match pattern '{0}' has no path")]
    MissingPath(String),
}

/// A parsed URL match pattern
#[derive(Debug, Clone)]
pub struct MatchPattern {
    pattern: String,
    regex: Regex,
}

impl MatchPattern {
    pub fn parse(pattern: &str) -> Result<Self, MatchPatternError> {
        let source = Self::compile(pattern)?;
        // Every piece is either escaped or built from fixed fragments above
        let regex = Regex::new(&source).map_err(|_| MatchPatternError::InvalidHost {
            pattern: pattern.to_string(),
            host: pattern.to_string(),
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    fn compile(pattern: &str) -> Result<String, MatchPatternError> {
        if pattern == ALL_URLS {
            return Ok(format!("^(?:{}):", VALID_SCHEMES.join("|")));
        }

        let (scheme, rest) = pattern
            .split_once("://")
            .ok_or_else(|| MatchPatternError::MissingSchemeSeparator(pattern.to_string()))?;

        let scheme_source = match scheme {
            "*" => "(?:https?|wss?)".to_string(),
            s if VALID_SCHEMES.contains(&s) => regex::escape(s),
            s => {
                return Err(MatchPatternError::UnsupportedScheme {
                    pattern: pattern.to_string(),
                    scheme: s.to_string(),
                })
            }
        };

        let path_start = rest
            .find('/')
            .ok_or_else(|| MatchPatternError::MissingPath(pattern.to_string()))?;
        let (host, path) = rest.split_at(path_start);

        let invalid_host = || MatchPatternError::InvalidHost {
            pattern: pattern.to_string(),
            host: host.to_string(),
        };

        let host_source = if host == "*" {
            "[^/]*".to_string()
        } else if host.is_empty() {
            if scheme != "file" {
                return Err(invalid_host());
            }
            String::new()
        } else {
            let (bare, suffix) = match host.strip_prefix("*.") {
                Some(bare) => (bare, true),
                None => (host, false),
            };
            if bare.is_empty() || bare.contains('*') {
                return Err(invalid_host());
            }
            let escaped = regex::escape(&bare.to_lowercase());
            let port = if bare.contains(':') { "" } else { "(?::\\d+)?" };
            if suffix {
                format!("(?:[^/]*\\.)?{escaped}{port}")
            } else {
                format!("{escaped}{port}")
            }
        };

        let path_source = path
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        Ok(format!("^{scheme_source}://{host_source}{path_source}$"))
    }

    pub fn matches(&self, url: &Url) -> bool {
        let mut url = url.clone();
        url.set_fragment(None);
        self.regex.is_match(url.as_str())
    }

    /// Same as `matches`, for callers holding a string
    pub fn matches_str(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(url) => self.matches(&url),
            Err(_) => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches_all_urls(&self) -> bool {
        self.pattern == ALL_URLS
    }

    /// Regex source usable as `new RegExp(source)` in page JavaScript
    pub fn js_regex_source(&self) -> &str {
        self.regex.as_str()
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl PartialEq for MatchPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for MatchPattern {}
