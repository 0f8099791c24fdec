//! Fetching image references for providers that need inline bytes.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::Client;
use std::{fmt, time::Duration};

use crate::error::{Error, Result};
use crate::provider::ImageInput;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia>;
}

/// Fetches media over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Other(anyhow::anyhow!("GET {url} returned HTTP {status}")));
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedMedia { bytes, mime_type })
    }
}

pub fn is_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Best-effort MIME type from a file extension.
pub fn guess_mime_type(reference: &str) -> &'static str {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/png",
    }
}

/// Turn an image reference into the form the target provider accepts.
///
/// Providers that fetch URLs themselves get references untouched. For the others, URLs are downloaded and
/// inlined as base64; a failed download degrades to passing the reference through with a warning. References that
/// are not URLs are assumed to already be base64 payloads (or `data:` URLs).
pub async fn prepare_image(reference: &str, provider_fetches_urls: bool, fetcher: &dyn MediaFetcher) -> ImageInput {
    if let Some(rest) = reference.strip_prefix("data:")
        && let Some((mime_type, data)) = rest.split_once(";base64,")
    {
        return ImageInput::Base64 {
            data: data.to_string(),
            mime_type: mime_type.to_string(),
        };
    }

    if !is_url(reference) {
        return ImageInput::Base64 {
            data: reference.to_string(),
            mime_type: guess_mime_type(reference).to_string(),
        };
    }

    if provider_fetches_urls {
        return ImageInput::Url(reference.to_string());
    }

    match fetcher.fetch(reference).await {
        Ok(media) => ImageInput::Base64 {
            data: STANDARD.encode(&media.bytes),
            mime_type: media.mime_type.unwrap_or_else(|| guess_mime_type(reference).to_string()),
        },
        Err(e) => {
            tracing::warn!(url = %reference, error = %e, "Image fetch failed, passing the reference through");
            ImageInput::Url(reference.to_string())
        }
    }
}
