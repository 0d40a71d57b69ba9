//! HTTP collaborator.
//!
//! [`HttpClient`] is the seam the resource cache calls through. The
//! production [`ReqwestHttpClient`] disables reqwest's redirect handling
//! and follows `Location` headers itself so the full redirect chain, the
//! final URL and the final status are recorded.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use reqwest::{redirect, Method};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::HarvestError;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub max_redirects: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub status: u16,
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub final_url: String,
    #[serde(default)]
    pub redirects: Vec<Redirect>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// `body` holds base64 because the payload was not UTF-8.
    #[serde(default)]
    pub is_base64: bool,
}

impl HttpResponse {
    /// Wrap raw bytes, base64-encoding them when they are not UTF-8.
    pub fn set_body(&mut self, bytes: Vec<u8>) {
        match String::from_utf8(bytes) {
            Ok(text) => {
                self.body = text;
                self.is_base64 = false;
            }
            Err(err) => {
                self.body = base64::engine::general_purpose::STANDARD.encode(err.into_bytes());
                self.is_base64 = true;
            }
        }
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform the request. Transport failures surface as
    /// [`HarvestError::TransientFetch`]; every HTTP status is a response.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(concat!("harvester/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name '{}'", name))?,
            HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header '{}'", name))?,
        );
    }
    Ok(map)
}

fn transient(uri: &str, err: impl std::fmt::Display) -> anyhow::Error {
    HarvestError::TransientFetch {
        uri: uri.to_string(),
        reason: err.to_string(),
    }
    .into()
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let headers = header_map(&request.headers)?;
        let mut method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method '{}'", request.method))?;
        let mut url = reqwest::Url::parse(&request.url)
            .with_context(|| format!("invalid URL '{}'", request.url))?;
        let mut body = request.body.clone();
        let mut redirects = Vec::new();

        loop {
            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone())
                .timeout(request.timeout);
            if let Some(ref payload) = body {
                builder = builder.body(payload.clone());
            }
            let response = builder
                .send()
                .await
                .map_err(|e| transient(url.as_str(), e))?;
            let status = response.status();

            if status.is_redirection() && redirects.len() < request.max_redirects {
                if let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    let next = url
                        .join(location)
                        .with_context(|| format!("invalid redirect location '{}'", location))?;
                    debug!(from = %url, to = %next, status = status.as_u16(), "following redirect");
                    redirects.push(Redirect {
                        status: status.as_u16(),
                        location: next.to_string(),
                    });
                    if status.as_u16() == 303 {
                        method = Method::GET;
                        body = None;
                    }
                    url = next;
                    continue;
                }
            }

            let mut result = HttpResponse {
                status: status.as_u16(),
                final_url: url.to_string(),
                redirects,
                content_type: response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                headers: response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
                    .collect(),
                ..Default::default()
            };
            let bytes = response
                .bytes()
                .await
                .map_err(|e| transient(url.as_str(), e))?;
            result.set_body(bytes.to_vec());
            return Ok(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_utf8_bodies_are_base64() {
        let mut response = HttpResponse::default();
        response.set_body(vec![0xff, 0xfe, 0x00]);
        assert!(response.is_base64);
        assert_eq!(response.body, "//4A");

        response.set_body(b"plain".to_vec());
        assert!(!response.is_base64);
        assert_eq!(response.body, "plain");
    }

    #[test]
    fn rejects_invalid_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&headers).is_err());
    }
}
