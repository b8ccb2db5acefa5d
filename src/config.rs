//! Proxy configuration
//! Loaded once at startup from a JSON file (or the built-in default) and
//! shared read-only by every request afterwards.

use crate::auth::Credential;
use crate::certificate::TlsMaterial;
use crate::error::{ProxyError, Result};
use crate::sites::SiteRule;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SECURE_PORT: u16 = 8443;
const DEFAULT_HOSTNAME: &str = "localhost";

/// Which listener accepted a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    Plain,
    Secure,
}

impl Listener {
    pub fn scheme(self) -> &'static str {
        match self {
            Listener::Plain => "http",
            Listener::Secure => "https",
        }
    }
}

/// On-disk configuration format
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_secure_port")]
    pub secure_port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Private key path, relative to the config file
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Certificate path, relative to the config file
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub sites: Vec<SiteFile>,
    /// Inbound "user:pass" credential
    #[serde(default)]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteFile {
    pub urls: Vec<String>,
    #[serde(default)]
    pub skip: Vec<String>,
    #[serde(default)]
    pub replace: Vec<ReplaceFile>,
    #[serde(default)]
    pub inject: Vec<PathBuf>,
    /// Outbound "user:pass" credential
    #[serde(default)]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplaceFile {
    pub search: String,
    pub replace: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_secure_port() -> u16 {
    DEFAULT_SECURE_PORT
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

/// Immutable process-wide configuration
#[derive(Debug)]
pub struct ProxyConfig {
    pub plain_port: u16,
    pub secure_port: u16,
    /// Public domain suffix appended to every upstream hostname
    pub hostname: String,
    pub auth: Option<Credential>,
    /// `None` means a self-signed certificate is generated at startup
    pub tls: Option<TlsMaterial>,
    pub sites: Vec<SiteRule>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            plain_port: DEFAULT_PORT,
            secure_port: DEFAULT_SECURE_PORT,
            hostname: DEFAULT_HOSTNAME.to_string(),
            auth: None,
            tls: None,
            sites: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a JSON file. Relative paths inside the file
    /// are resolved against the file's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = absolute(path.as_ref())?;
        let raw = std::fs::read_to_string(&path).map_err(|e| ProxyError::io(&path, e))?;
        let file: ConfigFile = serde_json::from_str(&raw)?;
        let config_dir = path.parent().unwrap_or_else(|| Path::new("/"));

        info!("Loading config from {}", path.display());
        Self::from_file(file, config_dir)
    }

    /// Build the configuration from an already parsed file
    pub fn from_file(file: ConfigFile, config_dir: &Path) -> Result<Self> {
        if file.hostname.is_empty() {
            return Err(ProxyError::Config("hostname must not be empty".to_string()));
        }
        if file.port == file.secure_port {
            return Err(ProxyError::Config(format!(
                "port and securePort must differ (both are {})",
                file.port
            )));
        }

        let tls = match (&file.key, &file.cert) {
            (Some(key), Some(cert)) => Some(TlsMaterial::load(
                &config_dir.join(cert),
                &config_dir.join(key),
            )?),
            (None, None) => None,
            _ => {
                return Err(ProxyError::Config(
                    "key and cert must be configured together".to_string(),
                ))
            }
        };

        let sites = file
            .sites
            .iter()
            .enumerate()
            .map(|(index, site)| SiteRule::compile(index, site, config_dir))
            .collect::<Result<Vec<_>>>()?;

        let auth = file.auth.as_deref().map(Credential::new);

        Ok(Self {
            plain_port: file.port,
            secure_port: file.secure_port,
            hostname: file.hostname.to_ascii_lowercase(),
            auth,
            tls,
            sites,
        })
    }

    /// Port of the given listener
    pub fn port(&self, listener: Listener) -> u16 {
        match listener {
            Listener::Plain => self.plain_port,
            Listener::Secure => self.secure_port,
        }
    }

    /// Listener bound to `port`, if any
    pub fn listener_for_port(&self, port: u16) -> Option<Listener> {
        if port == self.plain_port {
            Some(Listener::Plain)
        } else if port == self.secure_port {
            Some(Listener::Secure)
        } else {
            None
        }
    }

    /// `example.com` -> `example.com.localhost:8080`
    pub fn proxied_host(&self, upstream_host: &str, port: u16) -> String {
        format!("{}.{}:{}", upstream_host, self.hostname, port)
    }

    /// Strip the proxy suffix from a bare hostname (no port).
    /// Returns `None` when the host is not under the proxy's domain.
    pub fn upstream_host<'a>(&self, host: &'a str) -> Option<&'a str> {
        let remote = host.strip_suffix(self.hostname.as_str())?.strip_suffix('.')?;
        if remote.is_empty() {
            None
        } else {
            Some(remote)
        }
    }

    /// True when `host` is already one of the proxy's synthetic hostnames
    pub fn is_proxied_host(&self, host: &str) -> bool {
        host == self.hostname || self.upstream_host(host).is_some()
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| ProxyError::io(path, e))?;
    Ok(cwd.join(path))
}
