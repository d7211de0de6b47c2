use regex::Regex;
use url::Url;

use crate::error::InterceptError;

#[derive(Debug, Clone)]
pub enum UrlPattern {
    Glob(String),
    Regex(Regex),
}

/// Match criteria of a route handler.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    pattern: UrlPattern,
    method: Option<String>,
    times: Option<u32>,
}

impl RouteMatcher {
    pub fn url(pattern: &str) -> Self {
        Self {
            pattern: UrlPattern::Glob(pattern.to_string()),
            method: None,
            times: None,
        }
    }

    pub fn regex(pattern: &str) -> Result<Self, InterceptError> {
        let regex =
            Regex::new(pattern).map_err(|err| InterceptError::InvalidMatcher(err.to_string()))?;
        Ok(Self {
            pattern: UrlPattern::Regex(regex),
            method: None,
            times: None,
        })
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_ascii_uppercase());
        self
    }

    /// Retire the handler after it has taken part in `times` requests.
    pub fn times(mut self, times: u32) -> Self {
        self.times = Some(times);
        self
    }

    pub fn times_limit(&self) -> Option<u32> {
        self.times
    }

    pub fn pattern(&self) -> &UrlPattern {
        &self.pattern
    }

    pub fn matches(&self, url: &str, method: Option<&str>) -> bool {
        if let Some(expected) = &self.method {
            match method {
                Some(method) if method.eq_ignore_ascii_case(expected) => {}
                _ => return false,
            }
        }

        match &self.pattern {
            UrlPattern::Regex(regex) => regex.is_match(url),
            UrlPattern::Glob(pattern) => {
                if wildcard_match(pattern, url) {
                    return true;
                }
                let Some(parsed) = parse_url(url) else {
                    return false;
                };
                if wildcard_match(pattern, parsed.path()) {
                    return true;
                }
                match parsed.query() {
                    Some(query) if pattern.contains('?') => {
                        wildcard_match(pattern, &format!("{}?{}", parsed.path(), query))
                    }
                    _ => false,
                }
            }
        }
    }
}

fn parse_url(url: &str) -> Option<Url> {
    match Url::parse(url) {
        Ok(parsed) => Some(parsed),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("http://localhost/")
            .and_then(|base| base.join(url))
            .ok(),
        Err(_) => None,
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let mut pat_iter = pattern.split('*');
    let mut pos = 0;

    if let Some(prefix) = pat_iter.next() {
        if !value.starts_with(prefix) {
            return false;
        }
        pos += prefix.len();
    }

    let rest: Vec<&str> = pat_iter.collect();
    let Some((last, middle)) = rest.split_last() else {
        return true;
    };

    for part in middle {
        if part.is_empty() {
            continue;
        }
        match value[pos..].find(part) {
            Some(index) => pos += index + part.len(),
            None => return false,
        }
    }

    value[pos..].ends_with(last)
}
