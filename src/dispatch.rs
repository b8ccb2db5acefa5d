//! Per-request dispatch
//! Resolves the virtual host, decides between skip, stream and
//! buffer-and-transform, and forwards the request upstream.

use crate::config::{Listener, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::rewrite::Rewriter;
use crate::sites::SiteMatch;
use crate::transport::{OutboundRequest, Transport, UpstreamResponse};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH,
    CONTENT_TYPE, HOST, LOCATION, ORIGIN, REFERER,
};
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Body type of every response the proxy produces
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

/// Extensions of binary/static resources that are never rewritten
const STREAM_EXTENSIONS: &[&str] = &[
    // Images
    "png", "jpg", "jpeg", "gif", "webp", "avif", "ico", "bmp", "tif", "tiff",
    // Fonts
    "woff", "woff2", "ttf", "otf", "eot",
    // Media and archives
    "mp3", "mp4", "m4a", "ogg", "wav", "webm", "pdf", "zip", "gz",
];

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// How the upstream response body is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Forward unbuffered and untransformed
    Stream,
    /// Buffer, then run the rewrite pipeline
    BufferAndTransform,
}

impl Disposition {
    pub fn for_path(path: &str) -> Self {
        let file = path.rsplit('/').next().unwrap_or_default();
        match file.rsplit_once('.') {
            Some((_, ext)) if STREAM_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {
                Disposition::Stream
            }
            _ => Disposition::BufferAndTransform,
        }
    }
}

/// Everything derived from one inbound request
#[derive(Debug)]
pub struct RequestContext<'c> {
    pub listener: Listener,
    pub remote_hostname: String,
    pub path_and_query: String,
    /// `remote_hostname/path?query`, the form skip patterns are written against
    pub remote_url: String,
    /// `remote_url` with the inbound listener's scheme in front
    pub origin_url: String,
    pub sites: SiteMatch<'c>,
    pub disposition: Disposition,
}

impl<'c> RequestContext<'c> {
    pub fn new(
        config: &'c ProxyConfig,
        listener: Listener,
        headers: &HeaderMap,
        uri: &Uri,
    ) -> Result<Self> {
        let host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| uri.authority().map(|a| a.as_str()))
            .ok_or_else(|| ProxyError::Host("missing Host header".to_string()))?;

        let bare = strip_port(host).to_ascii_lowercase();
        let remote_hostname = config
            .upstream_host(&bare)
            .ok_or_else(|| ProxyError::Host(host.to_string()))?
            .to_string();

        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let remote_url = format!("{}{}", remote_hostname, path_and_query);
        let origin_url = format!("{}://{}", listener.scheme(), remote_url);

        Ok(Self {
            listener,
            sites: config.match_sites(&remote_hostname),
            disposition: Disposition::for_path(uri.path()),
            remote_hostname,
            path_and_query,
            remote_url,
            origin_url,
        })
    }
}

impl RequestContext<'_> {
    /// Whole-request skip check. The scheme-qualified form is tried too.
    pub fn is_skipped(&self) -> bool {
        self.sites.is_skipped(&self.remote_url) || self.sites.is_skipped(&self.origin_url)
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Forwards requests upstream and rewrites what comes back
pub struct Dispatcher {
    config: Arc<ProxyConfig>,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(config: Arc<ProxyConfig>, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub async fn dispatch<B>(&self, req: Request<B>, listener: Listener) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let ctx = RequestContext::new(&self.config, listener, &parts.headers, &parts.uri)?;

        debug!("{} {} -> {}", parts.method, parts.uri, ctx.origin_url);

        if ctx.is_skipped() {
            info!("Not proxying skipped URL: {}", ctx.origin_url);
            return Ok(redirect_response(&ctx.origin_url));
        }

        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?
            .to_bytes();

        let outbound = self.outbound_request(&ctx, parts.method, &parts.headers, body)?;
        let upstream = self.transport.send(outbound).await?;

        match ctx.disposition {
            Disposition::Stream => stream_response(upstream),
            Disposition::BufferAndTransform => self.buffered_response(&ctx, upstream).await,
        }
    }

    /// Build the request sent to the real origin
    pub fn outbound_request(
        &self,
        ctx: &RequestContext<'_>,
        method: Method,
        inbound: &HeaderMap,
        body: Bytes,
    ) -> Result<OutboundRequest> {
        let url = Url::parse(&ctx.origin_url)
            .map_err(|e| ProxyError::Host(format!("{}: {}", ctx.origin_url, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in inbound.iter() {
            if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH || name == ACCEPT_ENCODING {
                continue;
            }
            // With the gate enabled the inbound credential belongs to the proxy
            if name == AUTHORIZATION && self.config.auth.is_some() {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(origin) = self.unproxy_header(&headers, ORIGIN, false) {
            headers.insert(ORIGIN, origin);
        }
        if let Some(referer) = self.unproxy_header(&headers, REFERER, true) {
            headers.insert(REFERER, referer);
        }

        // Single known encoding, decoded by the transport
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        if let Some(credential) = ctx.sites.credential() {
            headers.insert(AUTHORIZATION, credential.basic_header());
        }

        Ok(OutboundRequest {
            method,
            url,
            headers,
            body,
        })
    }

    fn unproxy_header(&self, headers: &HeaderMap, name: HeaderName, with_path: bool) -> Option<HeaderValue> {
        let value = headers.get(&name)?.to_str().ok()?;
        let upstream = self.upstream_url(value, with_path)?;
        HeaderValue::from_str(&upstream).ok()
    }

    /// Map a proxied URL (`http://example.com.localhost:8443/a`) back to the
    /// upstream one (`https://example.com/a`)
    pub fn upstream_url(&self, proxied: &str, with_path: bool) -> Option<String> {
        let url = Url::parse(proxied).ok()?;
        let host = self.config.upstream_host(url.host_str()?)?;
        let scheme = match url.port().and_then(|p| self.config.listener_for_port(p)) {
            Some(listener) => listener.scheme(),
            None => url.scheme(),
        };

        let mut upstream = format!("{}://{}", scheme, host);
        if with_path {
            upstream.push_str(url.path());
            if let Some(query) = url.query() {
                upstream.push('?');
                upstream.push_str(query);
            }
        }
        Some(upstream)
    }

    async fn buffered_response(
        &self,
        ctx: &RequestContext<'_>,
        upstream: UpstreamResponse,
    ) -> Result<Response<ProxyBody>> {
        let (status, headers, body) = upstream.into_buffered().await?;

        let rewriter = Rewriter::new(&self.config, &ctx.sites, &ctx.remote_hostname, ctx.listener);
        let (headers, body) = match rewriter.transform(&headers, &body).await {
            Ok(rewritten) => (rewritten.headers, rewritten.body),
            Err(e) => {
                warn!("Passing {} through unmodified: {}", ctx.origin_url, e);
                (headers, body)
            }
        };

        let mut response = Response::new(full_body(body));
        *response.status_mut() = status;
        copy_response_headers(&headers, response.headers_mut());
        response.headers_mut().remove(CONTENT_LENGTH);
        Ok(response)
    }
}

fn stream_response(upstream: UpstreamResponse) -> Result<Response<ProxyBody>> {
    let body = StreamBody::new(upstream.body.map_ok(Frame::data)).boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = upstream.status;
    copy_response_headers(&upstream.headers, response.headers_mut());
    Ok(response)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if !is_hop_by_hop(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Create redirect response
pub fn redirect_response(location: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}
