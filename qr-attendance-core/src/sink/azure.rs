//! Azure Blob Storage append blobs over the REST API
//!
//! Only the three calls the sink needs are implemented: list a container,
//! create an append blob, append a block. Requests are authorized either
//! with Shared Key signing or a SAS token.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use sha2::Sha256;

use crate::config::RemoteConfig;
use crate::error::{DeliveryError, Error, Result};

use super::credentials::{Auth, Credentials, StorageAccount};
use super::BlobService;

const API_VERSION: &str = "2021-08-06";
const APPEND_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

type HmacSha256 = Hmac<Sha256>;

/// Blocking client for one container of an Azure storage account
pub struct AzureBlobService {
    account: StorageAccount,
    container: String,
    http_client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    default_timeout: Duration,
}

impl AzureBlobService {
    /// Build a client from credentials and remote settings.
    ///
    /// Does not touch the network; see [`super::AppendBlobSink::connect`].
    pub fn new(credentials: &Credentials, config: &RemoteConfig, timeout: Duration) -> Result<Self> {
        let account = credentials.resolve(config.endpoint.as_deref())?;
        if config.container.is_empty() {
            return Err(Error::Config("remote.container must not be empty".to_string()));
        }

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Connection(format!("failed to create runtime: {}", e)))?;

        tracing::debug!(
            endpoint = %account.blob_endpoint,
            container = %config.container,
            "Configured blob service"
        );

        Ok(Self {
            account,
            container: config.container.clone(),
            http_client,
            runtime,
            default_timeout: timeout,
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn endpoint(&self) -> &str {
        &self.account.blob_endpoint
    }

    /// URL path of the container or of a blob inside it
    fn resource_path(&self, blob_name: Option<&str>) -> String {
        match blob_name {
            Some(blob) => format!("/{}/{}", self.container, encode_blob_path(blob)),
            None => format!("/{}", self.container),
        }
    }

    fn build_request(&self, request: &BlobRequest<'_>) -> Result<reqwest::RequestBuilder> {
        let path = self.resource_path(request.blob_name);

        let mut query: Vec<String> = request
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        if let Auth::Sas(token) = &self.account.auth {
            if !token.is_empty() {
                query.push(token.clone());
            }
        }
        let url = if query.is_empty() {
            format!("{}{}", self.account.blob_endpoint, path)
        } else {
            format!("{}{}?{}", self.account.blob_endpoint, path, query.join("&"))
        };

        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let mut ms_headers = vec![
            ("x-ms-client-request-id", uuid::Uuid::new_v4().to_string()),
            ("x-ms-date", date),
            ("x-ms-version", API_VERSION.to_string()),
        ];
        ms_headers.extend(request.ms_headers.iter().map(|(k, v)| (*k, v.to_string())));

        let mut headers = HeaderMap::new();
        for (name, value) in &ms_headers {
            headers.insert(HeaderName::from_static(*name), header_value(value)?);
        }
        if let Some(content_type) = request.content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        if let Some(if_none_match) = request.if_none_match {
            headers.insert(
                reqwest::header::IF_NONE_MATCH,
                HeaderValue::from_static(if_none_match),
            );
        }

        if let Auth::SharedKey { key } = &self.account.auth {
            let to_sign = string_to_sign(&SignatureInput {
                method: request.method.as_str(),
                content_length: request.body.len(),
                content_type: request.content_type.unwrap_or(""),
                if_none_match: request.if_none_match.unwrap_or(""),
                ms_headers: &ms_headers,
                account: &self.account.name,
                path: &path,
                query: request.query,
            });
            let signature = sign(key, &to_sign)?;
            headers.insert(
                AUTHORIZATION,
                header_value(&format!("SharedKey {}:{}", self.account.name, signature))?,
            );
        }

        Ok(self
            .http_client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.to_vec()))
    }

    async fn send(
        &self,
        request: BlobRequest<'_>,
        timeout: Duration,
    ) -> std::result::Result<reqwest::Response, DeliveryError> {
        let builder = self
            .build_request(&request)
            .map_err(|e| DeliveryError::Connection(e.to_string()))?
            .timeout(timeout);

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(timeout)
            } else {
                DeliveryError::Connection(format!("HTTP request failed: {}", e))
            }
        })
    }

    async fn list_blobs_async(&self) -> std::result::Result<Vec<String>, DeliveryError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![("comp", "list"), ("restype", "container")];
            if let Some(marker) = marker.as_deref() {
                query.insert(0, ("marker", marker));
            }
            let request = BlobRequest {
                method: Method::GET,
                blob_name: None,
                query: &query,
                ..BlobRequest::default()
            };
            let response = self.send(request, self.default_timeout).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(rejected(response).await);
            }

            let body = response
                .text()
                .await
                .map_err(|e| DeliveryError::Connection(format!("failed to read listing: {}", e)))?;
            let page = parse_blob_list(&body);
            names.extend(page.names);

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(names)
    }

    async fn create_append_blob_async(
        &self,
        blob_name: &str,
    ) -> std::result::Result<(), DeliveryError> {
        let request = BlobRequest {
            method: Method::PUT,
            blob_name: Some(blob_name),
            ms_headers: &[("x-ms-blob-type", "AppendBlob")],
            if_none_match: Some("*"),
            ..BlobRequest::default()
        };
        let response = self.send(request, self.default_timeout).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // Created concurrently or listed after our snapshot
            StatusCode::CONFLICT => Ok(()),
            _ => Err(rejected(response).await),
        }
    }

    async fn append_block_async(
        &self,
        blob_name: &str,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<(), DeliveryError> {
        let request = BlobRequest {
            method: Method::PUT,
            blob_name: Some(blob_name),
            query: &[("comp", "appendblock")],
            content_type: Some(APPEND_CONTENT_TYPE),
            body: data,
            ..BlobRequest::default()
        };
        let response = self.send(request, timeout).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejected(response).await)
        }
    }
}

impl BlobService for AzureBlobService {
    fn list_blobs(&self) -> std::result::Result<Vec<String>, DeliveryError> {
        self.runtime.block_on(self.list_blobs_async())
    }

    fn create_append_blob(&self, blob_name: &str) -> std::result::Result<(), DeliveryError> {
        self.runtime.block_on(self.create_append_blob_async(blob_name))
    }

    fn append_block(
        &self,
        blob_name: &str,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<(), DeliveryError> {
        self.runtime
            .block_on(self.append_block_async(blob_name, data, timeout))
    }
}

/// One REST call, before headers and auth are added
struct BlobRequest<'a> {
    method: Method,
    blob_name: Option<&'a str>,
    /// Query parameters, without the SAS token
    query: &'a [(&'a str, &'a str)],
    /// Extra `x-ms-*` headers
    ms_headers: &'a [(&'static str, &'a str)],
    content_type: Option<&'static str>,
    if_none_match: Option<&'static str>,
    body: &'a [u8],
}

impl Default for BlobRequest<'_> {
    fn default() -> Self {
        Self {
            method: Method::GET,
            blob_name: None,
            query: &[],
            ms_headers: &[],
            content_type: None,
            if_none_match: None,
            body: &[],
        }
    }
}

/// Fields that go into a Shared Key signature
struct SignatureInput<'a> {
    method: &'a str,
    content_length: usize,
    content_type: &'a str,
    if_none_match: &'a str,
    ms_headers: &'a [(&'a str, String)],
    account: &'a str,
    path: &'a str,
    query: &'a [(&'a str, &'a str)],
}

/// Shared Key string-to-sign for the Blob service.
///
/// Unused standard headers are empty lines; a zero content length is
/// written as an empty string.
fn string_to_sign(input: &SignatureInput<'_>) -> String {
    let content_length = if input.content_length == 0 {
        String::new()
    } else {
        input.content_length.to_string()
    };

    let mut out = String::new();
    for line in [
        input.method,
        "", // Content-Encoding
        "", // Content-Language
        content_length.as_str(),
        "", // Content-MD5
        input.content_type,
        "", // Date (x-ms-date is used instead)
        "", // If-Modified-Since
        "", // If-Match
        input.if_none_match,
        "", // If-Unmodified-Since
        "", // Range
    ] {
        out.push_str(line);
        out.push('\n');
    }

    let mut ms_headers: Vec<(String, &str)> = input
        .ms_headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .collect();
    ms_headers.sort();
    for (name, value) in ms_headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }

    out.push('/');
    out.push_str(input.account);
    out.push_str(input.path);

    let mut query: Vec<(String, &str)> = input
        .query
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), *v))
        .collect();
    query.sort();
    for (name, value) in query {
        out.push('\n');
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
    }

    out
}

fn sign(key: &[u8], string_to_sign: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Config(format!("invalid account key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Config(format!("invalid header value: {}", e)))
}

/// Percent-encode each `/`-separated segment of a blob name
fn encode_blob_path(blob_name: &str) -> String {
    blob_name
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn rejected(response: reqwest::Response) -> DeliveryError {
    let status = response.status();
    let code = response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let message = match code {
        Some(code) => code,
        None => response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string()),
    };
    DeliveryError::Rejected {
        status: status.as_u16(),
        message,
    }
}

/// One page of a container listing
#[derive(Debug, Default, PartialEq, Eq)]
struct BlobListPage {
    names: Vec<String>,
    next_marker: Option<String>,
}

/// Pull blob names and the continuation marker out of a List Blobs
/// response. Only `<Name>` and `<NextMarker>` elements are read.
fn parse_blob_list(xml: &str) -> BlobListPage {
    let names = element_texts(xml, "Name")
        .into_iter()
        .map(unescape_xml)
        .collect();
    let next_marker = element_texts(xml, "NextMarker")
        .into_iter()
        .next()
        .map(unescape_xml)
        .filter(|marker| !marker.is_empty());
    BlobListPage { names, next_marker }
}

fn element_texts<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                found.push(&after[..end]);
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    found
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
