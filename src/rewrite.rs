//! Response rewriting
//!
//! Applied to buffered responses in a fixed order: cookie domains, redirect
//! location, then (textual content only) URLs, configured replacements and
//! HTML injection.

use crate::assets::AssetKind;
use crate::config::{Listener, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::scanner::{self, UrlScheme};
use crate::sites::SiteMatch;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, SET_COOKIE};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};
use url::Url;

static BODY_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<body(?:\s[^>]*)?>").expect("valid body tag regex"));

/// Body classification, resolved once per response from its content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
    Script,
    Json,
    Opaque,
}

impl ContentKind {
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("html") {
            ContentKind::Html
        } else if content_type.contains("css") {
            ContentKind::Css
        } else if content_type.contains("javascript") || content_type.contains("ecmascript") {
            ContentKind::Script
        } else if content_type.contains("json") {
            ContentKind::Json
        } else {
            ContentKind::Opaque
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(Self::from_content_type)
            .unwrap_or(ContentKind::Opaque)
    }

    pub fn is_textual(self) -> bool {
        self != ContentKind::Opaque
    }
}

/// Output of [`Rewriter::transform`]
#[derive(Debug)]
pub struct Rewritten {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Rewrites one upstream response for the browser
pub struct Rewriter<'a> {
    config: &'a ProxyConfig,
    sites: &'a SiteMatch<'a>,
    remote_hostname: &'a str,
    listener: Listener,
}

impl<'a> Rewriter<'a> {
    pub fn new(
        config: &'a ProxyConfig,
        sites: &'a SiteMatch<'a>,
        remote_hostname: &'a str,
        listener: Listener,
    ) -> Self {
        Self {
            config,
            sites,
            remote_hostname,
            listener,
        }
    }

    /// Run the whole pipeline. Inputs are left untouched so the caller can
    /// fall back to them when a stage fails.
    pub async fn transform(&self, headers: &HeaderMap, body: &Bytes) -> Result<Rewritten> {
        let mut headers = headers.clone();
        self.rewrite_cookies(&mut headers)?;

        if self.rewrite_location(&mut headers)? {
            return Ok(Rewritten {
                headers,
                body: body.clone(),
            });
        }

        let kind = ContentKind::from_headers(&headers);
        if !kind.is_textual() {
            return Ok(Rewritten {
                headers,
                body: body.clone(),
            });
        }

        let text = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(e) => {
                debug!("Body of {} is not text, passing through: {}", self.remote_hostname, e);
                return Ok(Rewritten {
                    headers,
                    body: body.clone(),
                });
            }
        };

        let mut text = self.rewrite_urls(text);
        text = self.replace_content(text);
        if kind == ContentKind::Html {
            text = self.inject(text).await;
        }

        headers.remove(CONTENT_LENGTH);
        Ok(Rewritten {
            headers,
            body: Bytes::from(text),
        })
    }

    /// Keep upstream cookies attached to the proxied hostname
    pub fn rewrite_cookies(&self, headers: &mut HeaderMap) -> Result<()> {
        if !headers.contains_key(SET_COOKIE) {
            return Ok(());
        }

        let proxied = format!("{}.{}", self.remote_hostname, self.config.hostname);
        let cookies = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| {
                let cookie = value
                    .to_str()
                    .map_err(|e| ProxyError::Rewrite(format!("Set-Cookie: {}", e)))?;
                HeaderValue::from_str(&cookie.replace(self.remote_hostname, &proxied))
                    .map_err(|e| ProxyError::Rewrite(format!("Set-Cookie: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        headers.remove(SET_COOKIE);
        for cookie in cookies {
            headers.append(SET_COOKIE, cookie);
        }
        Ok(())
    }

    /// Point redirects back at the proxy. Returns true when the response is
    /// a redirect, in which case the body is left alone.
    pub fn rewrite_location(&self, headers: &mut HeaderMap) -> Result<bool> {
        let Some(value) = headers.get(LOCATION) else {
            return Ok(false);
        };
        let location = value
            .to_str()
            .map_err(|e| ProxyError::Rewrite(format!("Location: {}", e)))?
            .to_string();

        if self.sites.is_skipped(&location) {
            debug!("Redirect to skipped URL left alone: {}", location);
            return Ok(true);
        }

        if let Some(new_location) = self.proxied_location(&location) {
            info!("Redirect: {} -> {}", location, new_location);
            let value = HeaderValue::from_str(&new_location)
                .map_err(|e| ProxyError::Rewrite(format!("Location: {}", e)))?;
            headers.insert(LOCATION, value);
        }
        Ok(true)
    }

    /// `https://example.com/x` -> `https://example.com.localhost:8443/x`.
    /// Relative, non-HTTP and already proxied locations yield `None`.
    pub fn proxied_location(&self, location: &str) -> Option<String> {
        let url = Url::parse(location).ok()?;
        let port = match url.scheme() {
            "https" => self.config.secure_port,
            "http" => self.config.plain_port,
            _ => return None,
        };
        let host = url.host_str()?;
        if self.config.is_proxied_host(host) {
            return None;
        }

        let mut new_location = format!(
            "{}://{}{}",
            url.scheme(),
            self.config.proxied_host(host, port),
            url.path()
        );
        if let Some(query) = url.query() {
            new_location.push('?');
            new_location.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            new_location.push('#');
            new_location.push_str(fragment);
        }
        Some(new_location)
    }

    /// Append the proxy suffix and a port to every absolute or
    /// scheme-relative URL that is not skip-listed
    pub fn rewrite_urls(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + text.len() / 8);
        let mut last = 0;

        for candidate in scanner::scan(text) {
            if self.config.is_proxied_host(candidate.hostname) {
                continue;
            }
            if self.sites.is_skipped(candidate.raw)
                || self.sites.is_skipped(&candidate.to_url(self.listener.scheme()))
            {
                debug!("Skipped URL: {}", candidate.raw);
                continue;
            }

            out.push_str(&text[last..candidate.host_end]);
            out.push('.');
            out.push_str(&self.config.hostname);
            out.push(':');
            out.push_str(&self.port_for(candidate.scheme).to_string());
            last = candidate.end;
        }

        out.push_str(&text[last..]);
        out
    }

    /// Scheme-relative URLs inherit the listener that served the page
    fn port_for(&self, scheme: Option<UrlScheme>) -> u16 {
        match scheme {
            Some(UrlScheme::Https) => self.config.secure_port,
            Some(UrlScheme::Http) => self.config.plain_port,
            None => self.config.port(self.listener),
        }
    }

    pub fn replace_content(&self, text: String) -> String {
        self.sites
            .replacements()
            .fold(text, |text, replacement| replacement.apply(&text))
    }

    /// Insert the configured injects right after the opening `<body>` tag.
    /// Pages without one are returned unchanged.
    pub async fn inject(&self, text: String) -> String {
        if self.sites.injects().next().is_none() {
            return text;
        }

        let Some(tag) = BODY_TAG_RE.find(&text) else {
            warn!("Unable to find <body> tag in page from {}", self.remote_hostname);
            return text;
        };
        let insert_at = tag.end();

        let fragment = self.injection_fragment().await;
        if fragment.is_empty() {
            return text;
        }

        let mut out = String::with_capacity(text.len() + fragment.len());
        out.push_str(&text[..insert_at]);
        out.push_str(&fragment);
        out.push_str(&text[insert_at..]);
        out
    }

    async fn injection_fragment(&self) -> String {
        let mut parts = Vec::new();

        for asset in self.sites.injects() {
            match asset.kind() {
                AssetKind::Script => {
                    parts.push(format!(r#"<script src="{}"></script>"#, asset.static_url()));
                }
                AssetKind::Stylesheet => {
                    parts.push(format!(
                        r#"<link rel="stylesheet" href="{}" />"#,
                        asset.static_url()
                    ));
                }
                AssetKind::Html => match tokio::fs::read_to_string(&asset.absolute_path).await {
                    Ok(html) => parts.push(html),
                    Err(e) => {
                        debug!("Skipping inject {}: {}", asset.absolute_path.display(), e);
                    }
                },
                AssetKind::Other => {}
            }
        }

        parts.join("\n")
    }
}
