//! Proxy server implementation
//! Runs the plain and TLS listeners and routes every request through the
//! access gate, the static asset endpoint and the dispatcher.

use crate::assets::AssetRegistry;
use crate::auth::{AccessGate, REALM};
use crate::certificate::TlsMaterial;
use crate::config::{Listener, ProxyConfig};
use crate::dispatch::{full_body, text_response, Dispatcher, ProxyBody};
use crate::error::{ProxyError, Result};
use crate::transport::Transport;
use anyhow::anyhow;
use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Proxy server
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    gate: AccessGate,
    assets: AssetRegistry,
    dispatcher: Dispatcher,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        Self {
            gate: AccessGate::new(config.auth.clone()),
            assets: AssetRegistry::new(&config),
            dispatcher: Dispatcher::new(config.clone(), transport),
            config,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Start both listeners. TLS setup errors surface before anything binds.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let material = match &self.config.tls {
            Some(material) => material.clone(),
            None => TlsMaterial::self_signed(&self.config.hostname)?,
        };
        let acceptor = material.acceptor()?;

        let host = self.config.hostname.as_str();
        let plain = bind(host, self.config.plain_port).await?;
        let secure = bind(host, self.config.secure_port).await?;

        info!(
            "Injecting into {} site(s), {} static asset(s)",
            self.config.sites.len(),
            self.assets.len()
        );

        tokio::try_join!(
            self.clone().serve_plain(plain),
            self.clone().serve_secure(secure, acceptor),
        )?;

        Ok(())
    }

    /// Accept plaintext connections on `listener`
    pub async fn serve_plain(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener
                .accept()
                .await
                .map_err(|e| ProxyError::io(format!("plain listener on port {}", self.config.plain_port), e))?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server
                    .serve_connection(TokioIo::new(stream), remote_addr, Listener::Plain)
                    .await
                {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Accept TLS connections on `listener`
    pub async fn serve_secure(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener
                .accept()
                .await
                .map_err(|e| ProxyError::io(format!("secure listener on port {}", self.config.secure_port), e))?;
            let server = self.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("TLS handshake error from {}: {}", remote_addr, e);
                        return;
                    }
                };
                if let Err(e) = server
                    .serve_connection(TokioIo::new(tls_stream), remote_addr, Listener::Secure)
                    .await
                {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single connection
    async fn serve_connection<S>(
        self: Arc<Self>,
        io: TokioIo<S>,
        remote_addr: SocketAddr,
        listener: Listener,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req: Request<Incoming>| {
                    let server = self.clone();
                    async move {
                        debug!("{} {} from {}", req.method(), req.uri(), remote_addr);
                        Ok::<_, Infallible>(server.handle(req, listener).await)
                    }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle one request; failures become error responses
    pub async fn handle<B>(&self, req: Request<B>, listener: Listener) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        match self.route(req, listener).await {
            Ok(response) => response,
            Err(ProxyError::Unauthorized) => challenge_response(),
            Err(e @ (ProxyError::Host(_) | ProxyError::Body(_))) => {
                warn!("Bad request: {}", e);
                text_response(StatusCode::BAD_REQUEST, "Bad Request")
            }
            Err(e @ ProxyError::Upstream(_)) => {
                error!("{}", e);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
            Err(e) => {
                error!("Request error: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    async fn route<B>(&self, req: Request<B>, listener: Listener) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        self.gate.check(req.headers())?;

        if let Some(response) = self.serve_static(req.uri().path()).await {
            return Ok(response);
        }

        self.dispatcher.dispatch(req, listener).await
    }

    /// Serve an injected asset; `None` falls through to proxying
    async fn serve_static(&self, path: &str) -> Option<Response<ProxyBody>> {
        let file = self.assets.resolve_path(path)?;

        let contents = match tokio::fs::read(&file).await {
            Ok(contents) => contents,
            Err(e) => {
                debug!("Static asset {} unavailable: {}", file.display(), e);
                return None;
            }
        };

        let mime = mime_guess::from_path(&file).first_or_octet_stream();
        let mut response = Response::new(full_body(Bytes::from(contents)));
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        Some(response)
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| ProxyError::io(format!("{}:{}", host, port), e))?;
    info!("Listening at {}:{}", host, port);
    Ok(listener)
}

/// Create authentication challenge response
fn challenge_response() -> Response<ProxyBody> {
    let mut response = text_response(StatusCode::UNAUTHORIZED, "Access denied.");
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", REALM)) {
        response.headers_mut().insert(WWW_AUTHENTICATE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::config::ConfigFile;
    use crate::transport::{OutboundRequest, UpstreamResponse};
    use async_trait::async_trait;
    use http_body_util::{BodyExt, Full};
    use hyper::header::{AUTHORIZATION, HOST};
    use hyper::HeaderMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _request: OutboundRequest) -> Result<UpstreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            Ok(UpstreamResponse::from_bytes(StatusCode::NOT_FOUND, headers, "upstream"))
        }
    }

    /// Sends every request to a local port nobody listens on
    struct UnreachableTransport {
        inner: crate::transport::HttpTransport,
        port: u16,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for UnreachableTransport {
        async fn send(&self, mut request: OutboundRequest) -> Result<UpstreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            request.url = url::Url::parse(&format!("http://127.0.0.1:{}/", self.port)).unwrap();
            self.inner.send(request).await
        }
    }

    fn server(value: serde_json::Value, dir: &std::path::Path) -> (ProxyServer, Arc<CountingTransport>) {
        let file: ConfigFile = serde_json::from_value(value).unwrap();
        let config = ProxyConfig::from_file(file, dir).unwrap();
        let transport = Arc::new(CountingTransport::default());
        (ProxyServer::new(config, transport.clone()), transport)
    }

    fn get(path: &str) -> hyper::http::request::Builder {
        Request::builder().uri(path).header(HOST, "example.com.localhost:8080")
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_gate_challenges_before_anything_else() {
        let dir = tempdir().unwrap();
        let (server, transport) = server(json!({ "auth": "u:p" }), dir.path());

        let req = get("/").body(Full::new(Bytes::new())).unwrap();
        let response = server.handle(req, Listener::Plain).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "Basic realm=\"401\"");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gate_admits_valid_credential() {
        let dir = tempdir().unwrap();
        let (server, transport) = server(json!({ "auth": "u:p" }), dir.path());

        let req = get("/")
            .header(AUTHORIZATION, Credential::new("u:p").basic_header())
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = server.handle(req, Listener::Plain).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_static_asset_served_by_hash() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("inject.js"), "window.injected = true;").unwrap();
        std::fs::write(dir.path().join("inject.js.map"), "{\"version\":3}").unwrap();
        let (server, transport) = server(
            json!({ "sites": [{ "urls": ["example"], "inject": ["inject.js"] }] }),
            dir.path(),
        );
        let url = server.config().sites[0].injects[0].static_url();

        let req = get(&url).body(Full::new(Bytes::new())).unwrap();
        let response = server.handle(req, Listener::Plain).await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.contains("javascript"));
        assert_eq!(body_text(response).await, "window.injected = true;");

        let req = get(&format!("{}.map", url)).body(Full::new(Bytes::new())).unwrap();
        let response = server.handle(req, Listener::Plain).await;
        assert_eq!(body_text(response).await, "{\"version\":3}");

        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_or_missing_asset_falls_through() {
        let dir = tempdir().unwrap();
        let (server, transport) = server(
            json!({ "sites": [{ "urls": ["example"], "inject": ["missing.js"] }] }),
            dir.path(),
        );
        let url = server.config().sites[0].injects[0].static_url();

        let req = get(&url).body(Full::new(Bytes::new())).unwrap();
        assert_eq!(server.handle(req, Listener::Plain).await.status(), StatusCode::NOT_FOUND);

        let req = get("/__static/unknown/x.js").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(server.handle(req, Listener::Plain).await.status(), StatusCode::NOT_FOUND);

        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_foreign_host_is_bad_request() {
        let dir = tempdir().unwrap();
        let (server, _) = server(json!({}), dir.path());

        let req = Request::builder()
            .uri("/")
            .header(HOST, "localhost:8080")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(server.handle(req, Listener::Plain).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_bad_gateway_and_not_retried() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = Arc::new(UnreachableTransport {
            inner: crate::transport::HttpTransport::new().unwrap(),
            port,
            calls: AtomicUsize::new(0),
        });
        let file: ConfigFile = serde_json::from_value(json!({})).unwrap();
        let config = ProxyConfig::from_file(file, std::path::Path::new("/")).unwrap();
        let server = ProxyServer::new(config, transport.clone());

        let req = get("/").body(Full::new(Bytes::new())).unwrap();
        let response = server.handle(req, Listener::Plain).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
