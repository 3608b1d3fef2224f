//! Signed JSON transport for managed-cluster create calls.
//!
//! The provider CLI cannot attach arbitrary request headers, so create
//! requests whose endpoint carries one are sent here: SigV4-signed JSON over
//! HTTPS, with the extra header covered by the signature.

use std::collections::BTreeMap;
use std::time::Duration;

use aws_lc_rs::digest::{digest, SHA256};
use aws_lc_rs::hmac;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use super::{ApiEndpoint, ProviderError, ProviderErrorKind, ProviderResult};

const SERVICE: &str = "eks";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Static credentials used to sign one request
#[derive(Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Credentials {
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token for temporary credentials
    #[serde(default)]
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// One REST call: method, unencoded path segments and JSON body
#[derive(Clone, Debug)]
pub struct EksRequest {
    /// Operation name used in errors and logs
    pub operation: &'static str,
    method: Method,
    segments: Vec<String>,
    body: Option<serde_json::Value>,
}

impl EksRequest {
    /// `POST /segments...` with a JSON body
    pub fn post(operation: &'static str, segments: &[&str], body: serde_json::Value) -> Self {
        Self {
            operation,
            method: Method::POST,
            segments: segments.iter().map(|s| s.to_string()).collect(),
            body: Some(body),
        }
    }

    fn path(&self) -> String {
        let encoded: Vec<String> = self
            .segments
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!("/{}", encoded.join("/"))
    }
}

/// Headers produced by [`sign`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// `Authorization` header value
    pub authorization: String,
    /// `X-Amz-Date` header value
    pub amz_date: String,
}

/// Everything the signer reads about one request
pub struct SigningInput<'a> {
    /// HTTP method
    pub method: &'a str,
    /// Host header value, with the port when it is not the default
    pub host: &'a str,
    /// Already-encoded request path
    pub path: &'a str,
    /// Already-encoded, sorted query string
    pub query: &'a str,
    /// Extra headers to sign as (name, value)
    pub headers: &'a [(String, String)],
    /// Request body
    pub payload: &'a [u8],
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest(&SHA256, data).as_ref())
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key), data.as_bytes())
        .as_ref()
        .to_vec()
}

/// Non-S3 services encode every path segment a second time.
fn canonical_uri(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .map(|s| urlencoding::encode(s).into_owned())
        .collect();
    let uri = segments.join("/");
    if uri.is_empty() {
        "/".to_string()
    } else {
        uri
    }
}

/// Canonical request for `input` with `x-amz-date` set to `amz_date`.
/// Returns the request and the `;`-joined signed header names.
pub fn canonical_request(
    input: &SigningInput<'_>,
    amz_date: &str,
    session_token: Option<&str>,
) -> (String, String) {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    headers.insert("host".into(), input.host.to_string());
    headers.insert("x-amz-date".into(), amz_date.to_string());
    if let Some(token) = session_token {
        headers.insert("x-amz-security-token".into(), token.to_string());
    }
    for (name, value) in input.headers {
        headers.insert(name.to_ascii_lowercase(), value.trim().to_string());
    }

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method,
        canonical_uri(input.path),
        input.query,
        canonical_headers,
        signed_headers,
        sha256_hex(input.payload),
    );
    (request, signed_headers)
}

/// SigV4 signature for `input`
pub fn sign(
    input: &SigningInput<'_>,
    credentials: &Credentials,
    region: &str,
    service: &str,
    now: DateTime<Utc>,
) -> Signature {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{region}/{service}/aws4_request");

    let (request, signed_headers) =
        canonical_request(input, &amz_date, credentials.session_token.as_deref());
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(request.as_bytes())
    );

    let secret = format!("AWS4{}", credentials.secret_access_key);
    let key = hmac_sha256(secret.as_bytes(), &date);
    let key = hmac_sha256(&key, region);
    let key = hmac_sha256(&key, service);
    let key = hmac_sha256(&key, "aws4_request");
    let signature = hex::encode(hmac_sha256(&key, &string_to_sign));

    Signature {
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
        amz_date,
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "Message")]
    message: Option<String>,
    #[serde(default, rename = "__type")]
    code: Option<String>,
}

/// Signed REST client for one endpoint
pub struct EksHttp {
    client: reqwest::Client,
    base: url::Url,
    region: String,
    signing_name: String,
    header: Option<(String, String)>,
    credentials: Credentials,
}

impl EksHttp {
    /// Client for `endpoint` in `region`
    pub fn new(
        endpoint: &ApiEndpoint,
        region: &str,
        credentials: Credentials,
    ) -> ProviderResult<Self> {
        let raw = endpoint
            .resolver_url
            .clone()
            .unwrap_or_else(|| format!("https://eks.{region}.amazonaws.com"));
        let base = url::Url::parse(&raw).map_err(|e| {
            ProviderError::new(
                SERVICE,
                "ResolveEndpoint",
                ProviderErrorKind::Other,
                format!("invalid resolver URL {raw:?}: {e}"),
            )
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            region: region.to_string(),
            signing_name: endpoint
                .signing_name
                .clone()
                .unwrap_or_else(|| SERVICE.to_string()),
            header: endpoint.request_header.clone(),
            credentials,
        })
    }

    /// Sign and send `req`, returning the decoded JSON response
    pub async fn send(&self, req: &EksRequest, deadline: Duration) -> ProviderResult<serde_json::Value> {
        let op = req.operation;
        let host = match (self.base.host_str(), self.base.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ProviderError::new(
                    SERVICE,
                    op,
                    ProviderErrorKind::Other,
                    format!("resolver URL {} has no host", self.base),
                ))
            }
        };
        let path = format!("{}{}", self.base.path().trim_end_matches('/'), req.path());

        let payload = match &req.body {
            Some(body) => serde_json::to_vec(body).map_err(|e| {
                ProviderError::new(SERVICE, op, ProviderErrorKind::Other, e.to_string())
            })?,
            None => Vec::new(),
        };
        let mut headers = Vec::new();
        if req.body.is_some() {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        if let Some((key, value)) = &self.header {
            headers.push((key.clone(), value.clone()));
        }

        let signature = sign(
            &SigningInput {
                method: req.method.as_str(),
                host: &host,
                path: &path,
                query: "",
                headers: &headers,
                payload: &payload,
            },
            &self.credentials,
            &self.region,
            &self.signing_name,
            Utc::now(),
        );

        let mut url = self.base.clone();
        url.set_path(&path);
        url.set_query(None);

        let mut builder = self
            .client
            .request(req.method.clone(), url)
            .timeout(deadline)
            .header("x-amz-date", &signature.amz_date)
            .header("authorization", &signature.authorization);
        if let Some(token) = &self.credentials.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !payload.is_empty() {
            builder = builder.body(payload);
        }

        debug!(operation = op, host = %host, "signed provider call");
        let resp = builder.send().await.map_err(|e| transport_error(op, e))?;
        let status = resp.status();
        let error_type = resp
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(':').next().unwrap_or(v).to_string());
        let bytes = resp.bytes().await.map_err(|e| transport_error(op, e))?;

        if !status.is_success() {
            let body: Option<ErrorBody> = serde_json::from_slice(&bytes).ok();
            let message = body
                .as_ref()
                .and_then(|b| b.message.clone())
                .unwrap_or_else(|| status.to_string());
            let code = error_type.or_else(|| body.and_then(|b| b.code));
            return Err(match code {
                Some(code) => ProviderError::from_code(SERVICE, op, code, message),
                None => {
                    let kind = match status.as_u16() {
                        404 => ProviderErrorKind::NotFound,
                        429 | 500..=599 => ProviderErrorKind::Transient,
                        _ => ProviderErrorKind::Other,
                    };
                    ProviderError::new(SERVICE, op, kind, message)
                }
            });
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            ProviderError::new(
                SERVICE,
                op,
                ProviderErrorKind::Other,
                format!("invalid JSON response: {e}"),
            )
        })
    }
}

fn transport_error(operation: &str, e: reqwest::Error) -> ProviderError {
    let kind = if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else if e.is_connect() {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::Other
    };
    ProviderError::new(SERVICE, operation, kind, e.to_string())
}

/// One-shot HTTP server that records the raw request it receives.
#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one request with `status`, extra response `headers` (each
    /// ending in CRLF) and `body`; the handle yields the raw request text
    pub async fn serve_once(
        status: u16,
        headers: &'static str,
        body: &'static str,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                let n = sock.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
            let content_length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse::<usize>().unwrap())
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let reply = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\n{headers}content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (url, handle)
    }
}
