use std::fs::{self, OpenOptions};
use std::io;

use camino::Utf8Path;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderValue, RANGE, USER_AGENT};

use crate::config::NetworkConfig;
use crate::error::HarvestError;

/// Result of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchReceipt {
    pub bytes_written: u64,
    /// Full object size reported by the server, when it reported one.
    pub total_size: Option<u64>,
}

/// Byte transport used by the Fetch stage.
pub trait Transport: Send + Sync {
    /// Writes `url` to `local_path`, continuing after `resume_from` bytes when the server allows it.
    fn fetch(
        &self,
        url: &str,
        local_path: &Utf8Path,
        resume_from: u64,
    ) -> Result<FetchReceipt, HarvestError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(network: &NetworkConfig) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&network.user_agent)
                .map_err(|err| HarvestError::ConfigInvalid(format!("network.user_agent: {err}")))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(network.timeout())
            .timeout(network.download_timeout())
            .build()
            .map_err(|err| HarvestError::TransportHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        url: &str,
        local_path: &Utf8Path,
        resume_from: u64,
    ) -> Result<FetchReceipt, HarvestError> {
        let mut request = self.client.get(url);
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }
        let mut response = request
            .send()
            .map_err(|err| HarvestError::TransportHttp(err.to_string()))?;

        let status = response.status();
        let content_range_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(content_range_total);
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let (append, total_size) = match status {
            StatusCode::PARTIAL_CONTENT => (
                true,
                content_range_total.or(content_length.map(|len| len + resume_from)),
            ),
            StatusCode::OK => (false, content_length),
            StatusCode::RANGE_NOT_SATISFIABLE if resume_from > 0 => {
                // The local file already holds every byte the server has.
                return Ok(FetchReceipt {
                    bytes_written: 0,
                    total_size: content_range_total.or(Some(resume_from)),
                });
            }
            _ => {
                let message = response
                    .text()
                    .unwrap_or_else(|_| "download request failed".to_string());
                return Err(HarvestError::TransportStatus {
                    status: status.as_u16(),
                    message,
                });
            }
        };

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(format!("create {parent}: {err}")))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(local_path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("open {local_path}: {err}")))?;
        let bytes_written = io::copy(&mut response, &mut file)
            .map_err(|err| HarvestError::TransportHttp(format!("body of {url}: {err}")))?;
        file.sync_all()
            .map_err(|err| HarvestError::Filesystem(format!("sync {local_path}: {err}")))?;

        Ok(FetchReceipt {
            bytes_written,
            total_size,
        })
    }
}

/// Joins a catalog source path onto the base URL unless it is already absolute.
pub fn resolve_url(base_url: &str, source_path: &str) -> String {
    let source_path = source_path.trim();
    if source_path.starts_with("http://") || source_path.starts_with("https://") {
        return source_path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if let Some(path) = source_path.strip_prefix('/') {
        format!("{base}/{path}")
    } else {
        format!("{base}/{source_path}")
    }
}

/// Total length from `bytes 0-99/1234` or `bytes */1234`.
fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
