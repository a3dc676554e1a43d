//! Storage account credentials
//!
//! Two credential shapes are accepted: a full connection string, or an
//! account name plus a SAS token. Both resolve to a [`StorageAccount`] with
//! a blob endpoint and an authorization scheme.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{Error, Result};

const DEFAULT_PROTOCOL: &str = "https";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

// Publicly documented Azurite emulator account
const DEV_ACCOUNT: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

/// Credentials as supplied by the environment or config file
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Full Azure storage connection string
    ConnectionString(String),
    /// Account name with a shared access signature
    Sas { account: String, token: String },
}

// Keep secrets out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ConnectionString(_) => f.write_str("ConnectionString(<redacted>)"),
            Credentials::Sas { account, .. } => f
                .debug_struct("Sas")
                .field("account", account)
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// How requests are authorized
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Shared Key signing with the decoded account key
    SharedKey { key: Vec<u8> },
    /// SAS query string, without the leading `?`
    Sas(String),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::SharedKey { .. } => f.write_str("SharedKey(<redacted>)"),
            Auth::Sas(_) => f.write_str("Sas(<redacted>)"),
        }
    }
}

/// Resolved storage account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAccount {
    /// Account name (may be empty for SAS with an explicit endpoint)
    pub name: String,
    /// Blob service endpoint without trailing slash
    pub blob_endpoint: String,
    pub auth: Auth,
}

impl Credentials {
    /// Resolve into an account. `endpoint` overrides whatever endpoint the
    /// credentials imply.
    pub fn resolve(&self, endpoint: Option<&str>) -> Result<StorageAccount> {
        let mut account = match self {
            Credentials::ConnectionString(conn) => parse_connection_string(conn)?,
            Credentials::Sas { account, token } => {
                if account.trim().is_empty() {
                    return Err(Error::Config("account name is empty".to_string()));
                }
                StorageAccount {
                    name: account.clone(),
                    blob_endpoint: default_endpoint(
                        DEFAULT_PROTOCOL,
                        account,
                        DEFAULT_ENDPOINT_SUFFIX,
                    ),
                    auth: Auth::Sas(token.trim_start_matches('?').to_string()),
                }
            }
        };

        if let Some(endpoint) = endpoint {
            account.blob_endpoint = endpoint.trim_end_matches('/').to_string();
        }
        Ok(account)
    }

    /// Human-readable credential kind for status output
    pub fn describe(&self) -> &'static str {
        match self {
            Credentials::ConnectionString(_) => "connection string",
            Credentials::Sas { .. } => "account name + SAS token",
        }
    }
}

fn default_endpoint(protocol: &str, account: &str, suffix: &str) -> String {
    format!("{}://{}.blob.{}", protocol, account, suffix)
}

/// Parse an Azure storage connection string
/// (`Key=Value;Key=Value;...`, values may contain `=`).
pub fn parse_connection_string(conn: &str) -> Result<StorageAccount> {
    let mut protocol = DEFAULT_PROTOCOL;
    let mut suffix = DEFAULT_ENDPOINT_SUFFIX;
    let mut name = None;
    let mut key = None;
    let mut sas = None;
    let mut blob_endpoint = None;

    for part in conn.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = part
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("malformed connection string segment: {}", redact(part))))?;
        match k {
            "DefaultEndpointsProtocol" => protocol = v,
            "AccountName" => name = Some(v),
            "AccountKey" => key = Some(v),
            "SharedAccessSignature" => sas = Some(v),
            "BlobEndpoint" => blob_endpoint = Some(v),
            "EndpointSuffix" => suffix = v,
            "UseDevelopmentStorage" if v.eq_ignore_ascii_case("true") => {
                name = Some(DEV_ACCOUNT);
                key = Some(DEV_ACCOUNT_KEY);
                blob_endpoint.get_or_insert(DEV_BLOB_ENDPOINT);
            }
            _ => tracing::debug!(key = %k, "Ignoring connection string key"),
        }
    }

    let name = name.unwrap_or_default().to_string();
    let blob_endpoint = match blob_endpoint {
        Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
        None if !name.is_empty() => default_endpoint(protocol, &name, suffix),
        None => {
            return Err(Error::Config(
                "connection string needs AccountName or BlobEndpoint".to_string(),
            ))
        }
    };

    let auth = match (key, sas) {
        (Some(key), _) => {
            if name.is_empty() {
                return Err(Error::Config(
                    "connection string with AccountKey needs AccountName".to_string(),
                ));
            }
            let key = STANDARD
                .decode(key)
                .map_err(|e| Error::Config(format!("AccountKey is not valid base64: {}", e)))?;
            Auth::SharedKey { key }
        }
        (None, Some(sas)) => Auth::Sas(sas.trim_start_matches('?').to_string()),
        (None, None) => {
            return Err(Error::Config(
                "connection string needs AccountKey or SharedAccessSignature".to_string(),
            ))
        }
    };

    Ok(StorageAccount {
        name,
        blob_endpoint,
        auth,
    })
}

fn redact(segment: &str) -> &str {
    segment.split('=').next().unwrap_or("")
}
