use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, RANGE,
};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Resume offset; sent as an open-ended `Range: bytes=<n>-`.
    pub range_start: Option<u64>,
    pub bearer_token: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            range_start: None,
            bearer_token: None,
        }
    }
}

pub struct NetResponse {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    /// Total size from a `Content-Range: bytes a-b/total` header.
    pub range_total: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl NetResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl std::fmt::Debug for NetResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetResponse")
            .field("status_code", &self.status_code)
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .field("range_total", &self.range_total)
            .finish()
    }
}

/// The seam between the download engine and the network.
pub trait NetClient: Send + Sync {
    fn get(&self, req: &DownloadRequest) -> CoreResult<NetResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    /// `read_timeout` bounds each read of the response, so a stalled body
    /// surfaces as a `Network` error instead of blocking the worker.
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &DownloadRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::Validation(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::Validation(err.to_string()))?;
            headers.insert(name, value);
        }
        if let Some(token) = &req.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|err| CoreError::Validation(err.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(start) = req.range_start {
            let value = format!("bytes={}-", start);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value).map_err(|err| CoreError::Network(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

impl NetClient for ReqwestNetClient {
    fn get(&self, req: &DownloadRequest) -> CoreResult<NetResponse> {
        let resp = self
            .client
            .get(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let headers = resp.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let range_total = headers
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total);
        Ok(NetResponse {
            status_code: resp.status().as_u16(),
            content_length,
            content_type,
            range_total,
            body: Box::new(resp),
        })
    }
}

/// `bytes 100-199/1000` -> `Some(1000)`; `*` totals are unknown.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}
