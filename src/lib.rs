//! SiteProxy - A URL-rewriting HTTP/HTTPS reverse proxy
//!
//! Every upstream host is served under a virtual host of the proxy
//! (`example.com` becomes `example.com.<hostname>:<port>`), providing:
//! - URL rewriting inside HTML, CSS, JavaScript and JSON bodies
//! - Redirect and cookie domain rewriting
//! - Per-site regex replacements and script/stylesheet/HTML injection
//! - Optional Basic authentication in front of the proxy
//! - HTTPS with a configured or self-signed certificate

pub mod assets;
pub mod auth;
pub mod certificate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod proxy;
pub mod rewrite;
pub mod scanner;
pub mod sites;
pub mod transport;

pub use assets::{AssetRegistry, InjectAsset};
pub use auth::{AccessGate, Credential};
pub use certificate::TlsMaterial;
pub use config::{Listener, ProxyConfig};
pub use dispatch::Dispatcher;
pub use error::{ProxyError, Result};
pub use proxy::ProxyServer;
pub use sites::{SiteMatch, SiteRule};
pub use transport::{HttpTransport, OutboundRequest, Transport, UpstreamResponse};
