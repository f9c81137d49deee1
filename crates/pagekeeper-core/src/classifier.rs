//! Decides which requests take part in caching.
//!
//! Anything rejected here is left to the host's default network handling:
//! the store is neither read nor written for it.

use reqwest::Url;

use crate::config::{AgentConfig, ExclusionRule};
use crate::http::{Method, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Cache,
    NotGet,
    /// Not http(s), e.g. a browser-extension URL
    UnsupportedScheme,
    ForeignOrigin,
    Excluded,
}

impl Verdict {
    pub fn is_cacheable(self) -> bool {
        self == Verdict::Cache
    }
}

#[derive(Debug, Clone)]
pub struct RequestClassifier {
    scope: Url,
    allowed_hosts: Vec<String>,
    exclusions: Vec<ExclusionRule>,
}

impl RequestClassifier {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            scope: config.scope.clone(),
            allowed_hosts: config.allowed_hosts.clone(),
            exclusions: config.exclusions.clone(),
        }
    }

    pub fn should_handle(&self, request: &Request) -> bool {
        self.classify(request).is_cacheable()
    }

    pub fn classify(&self, request: &Request) -> Verdict {
        if request.method != Method::Get {
            return Verdict::NotGet;
        }

        let url = &request.url;
        if !matches!(url.scheme(), "http" | "https") {
            return Verdict::UnsupportedScheme;
        }
        if !self.is_same_origin(url) && !self.is_allowed_host(url) {
            return Verdict::ForeignOrigin;
        }
        if self.exclusions.iter().any(|rule| rule.is_match(url.as_str())) {
            return Verdict::Excluded;
        }
        Verdict::Cache
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin()
    }

    fn is_allowed_host(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| self.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RequestClassifier {
        let config = AgentConfig::new("1", Url::parse("https://tools.example.com/").unwrap())
            .with_allowed_hosts(&["cdn.jsdelivr.net"]);
        RequestClassifier::new(&config)
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[test]
    fn test_same_origin_get_is_cached() {
        assert_eq!(classifier().classify(&get("https://tools.example.com/json.html")), Verdict::Cache);
        assert!(classifier().should_handle(&get("https://tools.example.com/")));
    }

    #[test]
    fn test_non_get_never_cached() {
        let url = Url::parse("https://tools.example.com/").unwrap();
        for method in [Method::Post, Method::Head, Method::Put, Method::Delete] {
            let request = Request::new(method, url.clone());
            assert_eq!(classifier().classify(&request), Verdict::NotGet);
        }
    }

    #[test]
    fn test_foreign_origin_excluded_unless_allowed() {
        assert_eq!(
            classifier().classify(&get("https://analytics.example.org/collect")),
            Verdict::ForeignOrigin
        );
        assert_eq!(
            classifier().classify(&get("https://cdn.jsdelivr.net/npm/lib.js")),
            Verdict::Cache
        );
        // Same host on another scheme is another origin
        assert_eq!(
            classifier().classify(&get("http://tools.example.com/")),
            Verdict::ForeignOrigin
        );
    }

    #[test]
    fn test_extension_scheme_excluded() {
        assert_eq!(
            classifier().classify(&get("chrome-extension://abcdef/inject.js")),
            Verdict::UnsupportedScheme
        );
    }

    #[test]
    fn test_source_map_and_reserved_segment_excluded() {
        assert_eq!(
            classifier().classify(&get("https://tools.example.com/js/app.js.map")),
            Verdict::Excluded
        );
        assert_eq!(
            classifier().classify(&get("https://tools.example.com/__/auth/iframe")),
            Verdict::Excluded
        );
    }

    #[test]
    fn test_custom_rules() {
        let config = AgentConfig::new("1", Url::parse("https://tools.example.com/").unwrap())
            .with_exclusion(ExclusionRule::contains("/api/"))
            .with_exclusion(ExclusionRule::matches(r"\?nocache=").unwrap());
        let classifier = RequestClassifier::new(&config);
        assert!(!classifier.should_handle(&get("https://tools.example.com/api/time")));
        assert!(!classifier.should_handle(&get("https://tools.example.com/a.js?nocache=1")));
        assert!(classifier.should_handle(&get("https://tools.example.com/a.js?v=1")));
    }
}
