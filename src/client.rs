use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::BaseDirs;
use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::error::CutoutError;

const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub bytes: u64,
    pub expected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadInfo {
    pub bytes: u64,
}

pub trait CutoutClient: Send + Sync {
    /// Uploads one request list and streams the returned archive to `destination`.
    fn submit(
        &self,
        unit: usize,
        document: &str,
        destination: &Path,
        progress: &mut dyn FnMut(Transfer),
    ) -> Result<DownloadInfo, CutoutError>;
}

impl<T: CutoutClient + ?Sized> CutoutClient for Arc<T> {
    fn submit(
        &self,
        unit: usize,
        document: &str,
        destination: &Path,
        progress: &mut dyn FnMut(Transfer),
    ) -> Result<DownloadInfo, CutoutError> {
        (**self).submit(unit, document, destination, progress)
    }
}

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"***")
            .finish()
    }
}

impl Credentials {
    /// `CUTOUT_USER`/`CUTOUT_SECRET`, then `credentials.json` in the user config dir.
    pub fn discover() -> Result<Option<Self>, CutoutError> {
        let user = std::env::var("CUTOUT_USER").ok();
        let secret = std::env::var("CUTOUT_SECRET").ok();
        if let (Some(user), Some(secret)) = (user, secret) {
            if !user.trim().is_empty() {
                return Ok(Some(Self {
                    user: user.trim().to_string(),
                    secret,
                }));
            }
        }

        let Some(path) = Self::default_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|_| CutoutError::ConfigRead(path.clone()))?;
        let credentials = serde_json::from_str(&content)
            .map_err(|err| CutoutError::ConfigParse(format!("{}: {err}", path.display())))?;
        Ok(Some(credentials))
    }

    pub fn default_path() -> Option<PathBuf> {
        BaseDirs::new().map(|dirs| {
            dirs.config_dir()
                .join("cutout-batch")
                .join("credentials.json")
        })
    }
}

#[derive(Clone)]
pub struct CutoutHttpClient {
    client: Client,
    url: String,
    credentials: Option<Credentials>,
    expected_bytes: u64,
}

impl CutoutHttpClient {
    pub fn new(
        url: impl Into<String>,
        credentials: Option<Credentials>,
        expected_bytes: u64,
        timeout: Option<Duration>,
    ) -> Result<Self, CutoutError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("cutout-batch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CutoutError::ServiceHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|err| CutoutError::ServiceHttp(err.to_string()))?;

        if credentials.is_none() {
            tracing::warn!("no cutout service credentials found; submitting anonymously");
        }

        Ok(Self {
            client,
            url: url.into(),
            credentials,
            expected_bytes,
        })
    }

    fn write_response_to_file(
        &self,
        mut response: reqwest::blocking::Response,
        destination: &Path,
        progress: &mut dyn FnMut(Transfer),
    ) -> Result<DownloadInfo, CutoutError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .map(|body| truncate(body.trim(), 200))
                .unwrap_or_else(|_| "cutout request failed".to_string());
            return Err(CutoutError::ServiceStatus { status, message });
        }
        let expected = response.content_length().unwrap_or(self.expected_bytes);

        let mut file =
            File::create(destination).map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        let mut buffer = vec![0u8; BLOCK_SIZE];
        let mut written = 0u64;
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| CutoutError::ServiceHttp(format!("response stream: {err}")))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
            written += read as u64;
            progress(Transfer {
                bytes: written,
                expected,
            });
        }
        file.sync_all()
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        Ok(DownloadInfo { bytes: written })
    }
}

impl CutoutClient for CutoutHttpClient {
    fn submit(
        &self,
        unit: usize,
        document: &str,
        destination: &Path,
        progress: &mut dyn FnMut(Transfer),
    ) -> Result<DownloadInfo, CutoutError> {
        let part = Part::text(document.to_string()).file_name(format!("submit-{unit}.txt"));
        let form = Form::new().part("list", part);
        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.user, Some(&credentials.secret));
        }
        let response = request
            .send()
            .map_err(|err| CutoutError::ServiceHttp(err.to_string()))?;
        self.write_response_to_file(response, destination, progress)
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &value[..end]),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_long_bodies() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let credentials = Credentials {
            user: "astro".to_string(),
            secret: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("astro"));
        assert!(!rendered.contains("hunter2"));
    }
}
