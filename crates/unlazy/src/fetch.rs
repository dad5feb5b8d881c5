use std::io::Cursor;

use anyhow::{Error, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use image::ImageReader;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use reqwest::redirect::Policy;
use url::Url;

/// Response metadata of a header-only probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

impl HeadInfo {
    /// Whether the host refused or diverted the probe; such hosts are never
    /// probed again.
    pub fn is_blocked(&self) -> bool {
        (300..400).contains(&self.status) || matches!(self.status, 401 | 403 | 405 | 429)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network access used by the size oracle.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Header-only probe of `url`. Redirects are reported, not followed.
    async fn head(&self, url: &str) -> Result<HeadInfo, Error>;

    /// Loads `url` and reads the intrinsic `(width, height)` of the image.
    async fn dimensions(&self, url: &str) -> Result<(u32, u32), Error>;
}

/// [`Fetcher`] backed by `reqwest` and header decoding via `image`.
///
/// Supported URL schemes:
/// - `http`, `https`: probed with `HEAD`, loaded with `GET`
/// - `data`: decoded in place (loads only)
/// - `file`: read from the local filesystem (loads only)
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    probe_client: Client,
    load_client: Client,
}

impl HttpFetcher {
    /// # Errors
    ///
    /// Returns `Err` if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            probe_client: Client::builder().redirect(Policy::none()).build()?,
            load_client: Client::builder().build()?,
        })
    }

    async fn load_bytes(&self, url: &Url) -> Result<Bytes, Error> {
        Ok(match url.scheme() {
            "http" | "https" => {
                let response = self
                    .load_client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|err| anyhow!("Failed to fetch URL {url}: {err}"))?;
                if !response.status().is_success() {
                    return Err(anyhow!(
                        "Failed to fetch URL: {} (Status: {})",
                        url,
                        response.status()
                    ));
                }
                response.bytes().await?
            }
            "data" => decode_data_url(url.as_str())?,
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| anyhow!("Invalid file path for file url: {url}"))?;
                tokio::fs::read(path).await.map(Bytes::from)?
            }
            _ => return Err(anyhow!("Unsupported url scheme {}", url.scheme())),
        })
    }
}

fn decode_data_url(url: &str) -> Result<Bytes, Error> {
    let (meta, payload) = url
        .split_once(',')
        .ok_or_else(|| anyhow!("Malformed data url"))?;
    if meta.to_ascii_lowercase().ends_with(";base64") {
        Ok(Bytes::from(STANDARD.decode(payload.trim())?))
    } else {
        Ok(Bytes::copy_from_slice(payload.as_bytes()))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn head(&self, url: &str) -> Result<HeadInfo, Error> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("Unsupported url scheme {}", parsed.scheme()));
        }
        let response = self
            .probe_client
            .head(parsed)
            .send()
            .await
            .map_err(|err| anyhow!("Failed to probe URL {url}: {err}"))?;
        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase());
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        Ok(HeadInfo {
            status: response.status().as_u16(),
            content_type,
            content_length,
        })
    }

    async fn dimensions(&self, url: &str) -> Result<(u32, u32), Error> {
        let parsed = Url::parse(url)?;
        let bytes = self.load_bytes(&parsed).await?;
        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        Ok(reader.into_dimensions()?)
    }
}
