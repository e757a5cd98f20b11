use async_trait::async_trait;
use cachetime_core::{Error, PlainHttp, PlainResponse, Result};
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;

pub mod analysis;
pub mod buster;
pub mod crawler;
pub mod experiment;
pub mod h2time;
pub mod headers;
pub mod store;
pub mod wcd;

/// Hard cap on bytes read from any non-timed response body.
const MAX_BODY_BYTES: usize = 5_000_000;

/// Ordinary HTTP client for warm-up, priming and identicality fetches.
///
/// Redirect handling is per call, so two underlying clients are kept: one
/// that never follows and one with a bounded policy.
#[derive(Debug, Clone)]
pub struct PlainClient {
    direct: reqwest::Client,
    redirecting: reqwest::Client,
}

impl PlainClient {
    pub fn new() -> Result<Self> {
        let build = |policy: reqwest::redirect::Policy| {
            reqwest::Client::builder()
                .redirect(policy)
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| Error::Network(e.to_string()))
        };
        Ok(PlainClient {
            direct: build(reqwest::redirect::Policy::none())?,
            redirecting: build(reqwest::redirect::Policy::limited(10))?,
        })
    }

    fn apply_headers(
        mut rb: reqwest::RequestBuilder,
        headers: &BTreeMap<String, String>,
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                rb = rb.header(name, value);
            }
        }
        rb
    }

    fn classify(e: reqwest::Error) -> Error {
        if e.is_builder() {
            Error::Crawl(e.to_string())
        } else if e.is_timeout() {
            Error::Network(format!("read timeout: {e}"))
        } else {
            Error::Network(e.to_string())
        }
    }
}

#[async_trait]
impl PlainHttp for PlainClient {
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        cookies: &BTreeMap<String, String>,
        timeout: Duration,
        allow_redirects: bool,
    ) -> Result<PlainResponse> {
        let client = if allow_redirects {
            &self.redirecting
        } else {
            &self.direct
        };

        let mut rb = client.get(url).timeout(timeout);
        rb = Self::apply_headers(rb, headers);
        if !cookies.is_empty() {
            let cookie = cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&cookie) {
                rb = rb.header(reqwest::header::COOKIE, value);
            }
        }

        let resp = rb.send().await.map_err(Self::classify)?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();

        let mut out_headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in resp.headers().iter() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            out_headers
                .entry(name.as_str().to_string())
                .and_modify(|v| {
                    v.push_str(", ");
                    v.push_str(&value);
                })
                .or_insert(value);
        }

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Network(format!("body read: {e}")))?;
            if bytes.len().saturating_add(chunk.len()) > MAX_BODY_BYTES {
                let can_take = MAX_BODY_BYTES.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(PlainResponse {
            url: final_url,
            status,
            headers: out_headers,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
