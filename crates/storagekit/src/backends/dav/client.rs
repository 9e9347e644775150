//! reqwest-backed WebDAV transport.
//!
//! Redirects are not followed and responses are not decompressed. The
//! request timeout comes from `StorageConfig::dav_timeout_secs`; connecting
//! has its own 10 second limit.

use async_trait::async_trait;
use futures_util::StreamExt;
use percent_encoding::percent_decode_str;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Certificate, Client, Method, RequestBuilder, Response};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use super::props::{PROPFIND_BODY, format_http_date, parse_multistatus};
use super::{DavConfig, DavMethod, DavResponse, DavTransport, Depth, TransportError};
use crate::error::{Result, StorageError};
use crate::logging::LogConfig;
use crate::stream::{ReadStream, read_stream_from};

type TransportResult<T> = std::result::Result<T, TransportError>;

/// WebDAV client speaking HTTP through reqwest.
pub struct ReqwestDavClient {
    client: Client,
    base: Url,
    /// Decoded URL path of the storage root, used to relativize hrefs.
    base_path: String,
    user: String,
    password: String,
    log: LogConfig,
}

impl std::fmt::Debug for ReqwestDavClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestDavClient")
            .field("base", &self.log.redact_url(self.base.as_str()))
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

fn dav_method(name: &str) -> TransportResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::Malformed(format!("invalid method {}: {}", name, e)))
}

fn connection_error(e: reqwest::Error) -> TransportError {
    // Drop the URL so credentials never reach an error message.
    TransportError::Connection(e.without_url().to_string())
}

fn check_status(response: &Response) -> TransportResult<u16> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        Ok(status)
    } else {
        Err(TransportError::Status(status))
    }
}

impl ReqwestDavClient {
    /// Build a client for a normalized [`DavConfig`].
    pub fn new(config: &DavConfig, timeout: Duration) -> Result<Self> {
        // Another component may have installed a provider already.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut builder = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("storagekit/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .no_brotli()
            .no_deflate();

        if let Some(bundle) = &config.ca_bundle {
            let pem = std::fs::read(bundle).map_err(|e| {
                StorageError::Invalid(format!(
                    "cannot read CA bundle {}: {}",
                    bundle.display(),
                    e
                ))
            })?;
            let certificate = Certificate::from_pem(&pem)
                .map_err(|e| StorageError::Invalid(format!("invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| StorageError::Invalid(format!("failed to build HTTP client: {}", e)))?;

        let log = LogConfig::default();
        let base_uri = config.base_uri();
        let base = Url::parse(&base_uri).map_err(|e| {
            StorageError::Invalid(format!(
                "invalid webdav url {}: {}",
                log.redact_url(&base_uri),
                e
            ))
        })?;
        let base_path = percent_decode_str(base.path())
            .decode_utf8_lossy()
            .into_owned();

        Ok(Self {
            client,
            base,
            base_path,
            user: config.user.clone(),
            password: config.password.clone(),
            log,
        })
    }

    /// URL of a storage-relative path. Segments are percent-encoded; the
    /// root and paths with a trailing `/` keep a trailing slash.
    fn url_for(&self, path: &str) -> TransportResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::Malformed("base url cannot carry a path".into()))?;
            segments.pop_if_empty();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
            if path.trim_matches('/').is_empty() || path.ends_with('/') {
                segments.push("");
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!(method = %method, url = %self.log.redact_url(url.as_str()), "webdav request");
        self.client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn read_body(response: Response) -> TransportResult<Vec<u8>> {
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(connection_error)?;
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl DavTransport for ReqwestDavClient {
    async fn propfind(&self, path: &str, depth: Depth) -> TransportResult<Vec<DavResponse>> {
        let url = self.url_for(path)?;
        let response = self
            .request(dav_method("PROPFIND")?, url)
            .header("Depth", depth.as_str())
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(connection_error)?;
        check_status(&response)?;
        let body = Self::read_body(response).await?;
        let xml = String::from_utf8(body)
            .map_err(|e| TransportError::Malformed(format!("multistatus is not UTF-8: {}", e)))?;
        parse_multistatus(&xml, &self.base_path)
    }

    async fn get(&self, path: &str) -> TransportResult<ReadStream> {
        let url = self.url_for(path)?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(connection_error)?;
        check_status(&response)?;
        let body = Self::read_body(response).await?;
        Ok(read_stream_from(body))
    }

    async fn put(&self, path: &str, body: ReadStream, size: u64) -> TransportResult<u16> {
        let url = self.url_for(path)?;
        let response = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, size)
            .body(Body::wrap_stream(ReaderStream::new(body)))
            .send()
            .await
            .map_err(connection_error)?;
        check_status(&response)
    }

    async fn send(
        &self,
        method: DavMethod,
        path: &str,
        destination: Option<&str>,
    ) -> TransportResult<u16> {
        let url = self.url_for(path)?;
        let mut request = self.request(dav_method(method.as_str())?, url);
        if let Some(destination) = destination {
            let destination = self.url_for(destination)?;
            request = request
                .header("Destination", destination.as_str())
                .header("Overwrite", "T");
        }
        let response = request.send().await.map_err(connection_error)?;
        check_status(&response)
    }

    async fn set_mtime(&self, path: &str, mtime: i64) -> TransportResult<u16> {
        let url = self.url_for(path)?;
        let date = format_http_date(mtime)
            .ok_or_else(|| TransportError::Malformed(format!("mtime out of range: {}", mtime)))?;
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<d:propertyupdate xmlns:d="DAV:">
  <d:set><d:prop><d:lastmodified>{}</d:lastmodified></d:prop></d:set>
</d:propertyupdate>"#,
            date
        );
        let response = self
            .request(dav_method("PROPPATCH")?, url)
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(connection_error)?;
        check_status(&response)
    }
}
