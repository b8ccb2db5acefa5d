//! Lexical scanner for absolute and scheme-relative URLs in text
//!
//! Finds `[http:|https:]//host` shapes in arbitrary HTML/CSS/JS/JSON, with
//! the slashes optionally backslash-escaped (`https:\/\/host`) so URLs inside
//! script string literals are found too. No parsing: false positives and
//! negatives are accepted.

use once_cell::sync::Lazy;
use regex::Regex;

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<scheme>https?:)?(?P<slashes>\\?/\\?/)(?P<host>[a-z][a-z0-9-]*(?:\.[a-z0-9-]+)+)(?P<port>:[0-9]{1,5})?",
    )
    .expect("valid URL regex")
});

/// Scheme written in front of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScheme {
    Http,
    Https,
}

/// One URL-shaped span of the scanned text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlCandidate<'t> {
    /// Byte offset where the match starts (scheme or slashes)
    pub start: usize,
    /// Byte offset right after the hostname
    pub host_end: usize,
    /// Byte offset right after the optional `:port`
    pub end: usize,
    pub scheme: Option<UrlScheme>,
    pub hostname: &'t str,
    /// Everything from the scheme up to the next quote or whitespace
    pub raw: &'t str,
}

impl UrlCandidate<'_> {
    /// The candidate as a plain URL, unescaping `\/`. Scheme-relative
    /// candidates take `inherited_scheme`. Skip checks try this form after
    /// the written one in `raw`.
    pub fn to_url(&self, inherited_scheme: &str) -> String {
        let url = self.raw.replace("\\/", "/");
        match self.scheme {
            Some(_) => url,
            None => format!("{}:{}", inherited_scheme, url),
        }
    }
}

/// Lazy iterator over URL candidates. Cloning it, or building a new one with
/// [`UrlCandidates::starting_at`], restarts the scan from that position.
#[derive(Debug, Clone)]
pub struct UrlCandidates<'t> {
    text: &'t str,
    pos: usize,
}

impl<'t> UrlCandidates<'t> {
    pub fn starting_at(text: &'t str, pos: usize) -> Self {
        Self { text, pos }
    }
}

impl<'t> Iterator for UrlCandidates<'t> {
    type Item = UrlCandidate<'t>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos > self.text.len() {
            return None;
        }
        let caps = URL_RE.captures_at(self.text, self.pos)?;
        let whole = caps.get(0)?;
        let host = caps.name("host")?;

        self.pos = whole.end();

        let scheme = caps.name("scheme").map(|m| match m.as_str() {
            "https:" => UrlScheme::Https,
            _ => UrlScheme::Http,
        });
        let raw_end = trailing_end(self.text, whole.end());

        Some(UrlCandidate {
            start: whole.start(),
            host_end: host.end(),
            end: whole.end(),
            scheme,
            hostname: host.as_str(),
            raw: &self.text[whole.start()..raw_end],
        })
    }
}

/// Scan `text` from the beginning
pub fn scan(text: &str) -> UrlCandidates<'_> {
    UrlCandidates::starting_at(text, 0)
}

fn trailing_end(text: &str, from: usize) -> usize {
    let rest = &text[from..];
    let stop = rest
        .find(|c: char| matches!(c, '"' | '\'' | '`' | '<' | '>') || c.is_whitespace())
        .unwrap_or(rest.len());
    // A backslash right before the quote escapes the quote, not the URL
    let trimmed = rest[..stop].trim_end_matches('\\');
    from + trimmed.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_absolute_url() {
        let text = r#"<a href="http://example.com/a?b=1">x</a>"#;
        let found: Vec<_> = scan(text).collect();

        assert_eq!(found.len(), 1);
        let c = &found[0];
        assert_eq!(c.scheme, Some(UrlScheme::Http));
        assert_eq!(c.hostname, "example.com");
        assert_eq!(c.raw, "http://example.com/a?b=1");
        assert_eq!(&text[c.start..c.host_end], "http://example.com");
    }

    #[test]
    fn test_scan_scheme_relative_and_escaped() {
        let text = r#"var a = "\/\/cdn.example.com\/lib.js"; b = '//static.example.org/x';"#;
        let found: Vec<_> = scan(text).collect();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].scheme, None);
        assert_eq!(found[0].hostname, "cdn.example.com");
        assert_eq!(found[0].to_url("https"), "https://cdn.example.com/lib.js");
        assert_eq!(found[1].hostname, "static.example.org");
        assert_eq!(found[1].to_url("http"), "http://static.example.org/x");
    }

    #[test]
    fn test_scan_escaped_https_in_json_string() {
        let text = r#"{"u":"https:\/\/api.example.com\/v1\"}"#;
        let c = scan(text).next().unwrap();
        assert_eq!(c.scheme, Some(UrlScheme::Https));
        assert_eq!(c.to_url("http"), "https://api.example.com/v1");
    }

    #[test]
    fn test_scan_port() {
        let text = "http://example.com:3000/x";
        let c = scan(text).next().unwrap();
        assert_eq!(&text[c.host_end..c.end], ":3000");
        assert_eq!(&text[c.end..], "/x");
    }

    #[test]
    fn test_scan_ignores_non_urls() {
        assert_eq!(scan("plain text, 1 // 2, a/b.c and // comment.").count(), 0);
        assert_eq!(scan("").count(), 0);
        assert_eq!(scan("http://localhost/").count(), 0);
    }

    #[test]
    fn test_scan_is_restartable() {
        let text = "http://a.com http://b.com http://c.com";
        let mut candidates = scan(text);
        candidates.next();
        let resumed = candidates.clone();

        let rest: Vec<_> = candidates.map(|c| c.hostname).collect();
        assert_eq!(rest, vec!["b.com", "c.com"]);
        let again: Vec<_> = resumed.map(|c| c.hostname).collect();
        assert_eq!(again, vec!["b.com", "c.com"]);

        let tail: Vec<_> = UrlCandidates::starting_at(text, 26).map(|c| c.hostname).collect();
        assert_eq!(tail, vec!["c.com"]);
    }
}
