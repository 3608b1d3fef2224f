//! OIDC issuer handling: URL normalisation, provider ARN, and the SHA-1
//! thumbprint of the issuer's serving certificate.

use sha1::{Digest, Sha1};
use url::Url;

use crate::{Error, Result};

/// A parsed issuer URL. Always https on port 443.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerUrl {
    host: String,
    path: String,
}

impl IssuerUrl {
    /// Parse an issuer URL as reported by the provider
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| Error::cluster(format!("invalid OIDC issuer URL {raw:?}: {e}")))?;
        if url.scheme() != "https" {
            return Err(Error::cluster(format!("OIDC issuer {raw:?} is not https")));
        }
        if let Some(port) = url.port() {
            if port != 443 {
                return Err(Error::cluster(format!("OIDC issuer {raw:?} uses port {port}")));
            }
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::cluster(format!("OIDC issuer {raw:?} has no host")))?
            .to_string();
        let path = url.path().trim_end_matches('/').to_string();
        Ok(Self { host, path })
    }

    /// Host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `host/path`, the form used in IAM trust policies
    pub fn host_path(&self) -> String {
        format!("{}{}", self.host, self.path)
    }

    /// `https://host:443/path`
    pub fn normalized(&self) -> String {
        format!("https://{}:443{}", self.host, self.path)
    }

    /// IAM OIDC provider ARN for this issuer
    pub fn provider_arn(&self, partition: &str, account_id: &str) -> String {
        format!("arn:{partition}:iam::{account_id}:oidc-provider/{}", self.host_path())
    }
}

/// Hex SHA-1 of a DER certificate
pub fn thumbprint(der: &[u8]) -> String {
    hex::encode(Sha1::digest(der))
}

/// Connect to the issuer and fingerprint the leaf certificate it serves.
///
/// Verification is disabled: only the certificate bytes matter here.
pub async fn fetch_thumbprint(issuer: &IssuerUrl) -> Result<String> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .tls_info(true)
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let resp = client.get(issuer.normalized()).send().await?;
    let der = resp
        .extensions()
        .get::<reqwest::tls::TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .ok_or_else(|| Error::cluster(format!("no certificate served by {}", issuer.host())))?;
    Ok(thumbprint(der))
}
