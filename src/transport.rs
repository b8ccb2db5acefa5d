//! Upstream transport
//!
//! The dispatcher only decides *what* to send; a [`Transport`] performs the
//! socket I/O and content-encoding negotiation with the real origin.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use hyper::{HeaderMap, Method, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request to send to the real origin
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Upstream response with a not yet consumed body
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl UpstreamResponse {
    /// Response with an in-memory body
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers,
            body: futures_util::stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// Read the whole body into memory
    pub async fn into_buffered(self) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok((self.status, self.headers, buf.freeze()))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse>;
}

/// Transport backed by a shared reqwest client
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            // Redirects are rewritten and handed to the browser
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse> {
        debug!("{} {}", request.method, request.url);

        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        Ok(UpstreamResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.bytes_stream().map_err(ProxyError::from).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_into_buffered_concatenates_chunks() {
        let chunks = vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let response = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: futures_util::stream::iter(chunks).boxed(),
        };

        let (status, _, body) = response.into_buffered().await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_into_buffered_surfaces_stream_errors() {
        let chunks = vec![
            Ok(Bytes::from("partial")),
            Err(ProxyError::Body("connection reset".to_string())),
        ];
        let response = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: futures_util::stream::iter(chunks).boxed(),
        };

        assert!(response.into_buffered().await.is_err());
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new().is_ok());
    }
}
