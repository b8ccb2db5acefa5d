//! Site rules and host matching
//!
//! A site rule scopes skip/replace/inject/credential behavior to the
//! upstream hostnames its `urls` patterns match. Rules apply by membership:
//! every matching rule contributes, in declaration order. Only the outbound
//! credential is first-match.

use crate::assets::InjectAsset;
use crate::auth::Credential;
use crate::config::SiteFile;
use crate::error::{ProxyError, Result};
use regex::{Regex, RegexBuilder};
use std::path::Path;

/// Ordered content substitution
#[derive(Debug, Clone)]
pub struct Replacement {
    pub search: Regex,
    pub replace: String,
}

impl Replacement {
    /// Replace every occurrence in `text`
    pub fn apply(&self, text: &str) -> String {
        self.search.replace_all(text, self.replace.as_str()).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct SiteRule {
    /// Matched case-insensitively against the bare remote hostname
    pub url_patterns: Vec<Regex>,
    /// Matched against URLs as written in the page, or `host/path?query`
    /// for whole requests
    pub skip_patterns: Vec<Regex>,
    pub replacements: Vec<Replacement>,
    pub injects: Vec<InjectAsset>,
    pub outbound_credential: Option<Credential>,
}

impl SiteRule {
    /// Compile the `index`-th site of a config file
    pub fn compile(index: usize, site: &SiteFile, config_dir: &Path) -> Result<Self> {
        // Hostnames are case-insensitive, paths are not
        let url_patterns = compile_all(index, "urls", &site.urls, true)?;
        let skip_patterns = compile_all(index, "skip", &site.skip, false)?;

        let replacements = site
            .replace
            .iter()
            .map(|entry| {
                let search = compile(index, "replace", &entry.search, false)?;
                let replace = expand_template(&entry.replace, &search);
                Ok(Replacement { search, replace })
            })
            .collect::<Result<Vec<_>>>()?;

        let injects = site
            .inject
            .iter()
            .map(|path| InjectAsset::new(config_dir.join(path)))
            .collect();

        Ok(Self {
            url_patterns,
            skip_patterns,
            replacements,
            injects,
            outbound_credential: site.auth.as_deref().map(Credential::new),
        })
    }

    pub fn matches_host(&self, hostname: &str) -> bool {
        self.url_patterns.iter().any(|p| p.is_match(hostname))
    }

    pub fn skips(&self, url: &str) -> bool {
        self.skip_patterns.iter().any(|p| p.is_match(url))
    }
}

fn compile(site: usize, field: &'static str, pattern: &str, case_insensitive: bool) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|source| ProxyError::Pattern {
            site,
            field,
            pattern: pattern.to_string(),
            source,
        })
}

fn compile_all(
    site: usize,
    field: &'static str,
    patterns: &[String],
    case_insensitive: bool,
) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| compile(site, field, p, case_insensitive))
        .collect()
}

/// Translate a `$1` / `$&` / `$<name>` replacement into regex crate syntax.
/// Group references are braced so `$1a` stays group 1 followed by `a`.
/// References to groups `search` does not have, and any other `$`, are
/// literal.
fn expand_template(replace: &str, search: &Regex) -> String {
    let groups = search.captures_len();
    let chars: Vec<char> = replace.chars().collect();
    let mut out = String::with_capacity(replace.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let digit = |at: usize| chars.get(at).and_then(|c| c.to_digit(10)).map(|d| d as usize);
        match (digit(i + 1), digit(i + 2), chars.get(i + 1).copied()) {
            // Two digits win when they name an existing group
            (Some(a), Some(b), _) if (1..groups).contains(&(a * 10 + b)) => {
                out.push_str(&format!("${{{}}}", a * 10 + b));
                i += 3;
            }
            (Some(a), _, _) if (1..groups).contains(&a) => {
                out.push_str(&format!("${{{}}}", a));
                i += 2;
            }
            (_, _, Some('&')) => {
                out.push_str("${0}");
                i += 2;
            }
            (_, _, Some('$')) => {
                out.push_str("$$");
                i += 2;
            }
            (_, _, Some('<')) => match chars[i + 2..].iter().position(|&c| c == '>') {
                Some(len) if len > 0 => {
                    let name: String = chars[i + 2..i + 2 + len].iter().collect();
                    out.push_str(&format!("${{{}}}", name));
                    i += len + 3;
                }
                _ => {
                    out.push_str("$$");
                    i += 1;
                }
            },
            _ => {
                out.push_str("$$");
                i += 1;
            }
        }
    }
    out
}

/// The site rules matching one remote hostname, in declaration order
#[derive(Debug, Clone, Default)]
pub struct SiteMatch<'a> {
    sites: Vec<&'a SiteRule>,
}

impl<'a> SiteMatch<'a> {
    pub fn new(sites: &'a [SiteRule], hostname: &str) -> Self {
        Self {
            sites: sites.iter().filter(|s| s.matches_host(hostname)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// True iff some matching site has a skip pattern matching `url`
    pub fn is_skipped(&self, url: &str) -> bool {
        self.sites.iter().any(|s| s.skips(url))
    }

    pub fn replacements(&self) -> impl Iterator<Item = &'a Replacement> + '_ {
        self.sites.iter().copied().flat_map(|s| s.replacements.iter())
    }

    pub fn injects(&self) -> impl Iterator<Item = &'a InjectAsset> + '_ {
        self.sites.iter().copied().flat_map(|s| s.injects.iter())
    }

    /// First matching site that declares a credential
    pub fn credential(&self) -> Option<&'a Credential> {
        self.sites.iter().copied().find_map(|s| s.outbound_credential.as_ref())
    }
}

impl crate::config::ProxyConfig {
    pub fn match_sites(&self, hostname: &str) -> SiteMatch<'_> {
        SiteMatch::new(&self.sites, hostname)
    }

    pub fn is_skipped(&self, hostname: &str, url: &str) -> bool {
        self.match_sites(hostname).is_skipped(url)
    }

    pub fn replacements_for(&self, hostname: &str) -> Vec<&Replacement> {
        self.match_sites(hostname).replacements().collect()
    }

    pub fn injects_for(&self, hostname: &str) -> Vec<&InjectAsset> {
        self.match_sites(hostname).injects().collect()
    }

    pub fn credential_for(&self, hostname: &str) -> Option<&Credential> {
        self.match_sites(hostname).credential()
    }
}
