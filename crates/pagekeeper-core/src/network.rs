//! Network fetch primitive.
//!
//! `HttpNetwork` is the reqwest-backed implementation. Non-2xx statuses come
//! back as ordinary responses; deciding whether they are worth storing is the
//! strategy engine's job.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::FetchError;
use crate::http::{Method, Request, Response};

#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// HTTP client for the fetch primitive.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    /// Create a client. No timeout unless one is given: a hung fetch only
    /// blocks the request flow awaiting it.
    pub fn new(timeout: Option<Duration>) -> Result<Self, FetchError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Create a client using the configured fetch timeout, if any
    pub fn from_config(config: &AgentConfig) -> Result<Self, FetchError> {
        Self::new(config.fetch_timeout())
    }

    fn method(method: &Method) -> Result<reqwest::Method, FetchError> {
        Ok(match method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Options => reqwest::Method::OPTIONS,
            Method::Other(name) => reqwest::Method::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::UnsupportedMethod(name.clone()))?,
        })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let mut builder = self
            .client
            .request(Self::method(&request.method)?, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect::<Vec<_>>();
        let body = response.bytes().await?.to_vec();

        debug!(
            url = %url,
            status,
            bytes = body.len(),
            content_type = headers
                .iter()
                .find(|(k, _)| k == header::CONTENT_TYPE.as_str())
                .map(|(_, v)| v.as_str())
                .unwrap_or("-"),
            "Fetched"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
        })
    }
}
